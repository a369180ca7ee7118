//! Interfaces of the systems the scheduler drives or polls.
//!
//! Every call is awaited to completion before the scheduler moves on. A
//! returned error is non-fatal to the run: the scheduler logs it, emits an
//! event, and retries by re-entering the slot on its next pass.

use crate::types::Order;
use async_trait::async_trait;
use cellwright_core::{ActuatorKind, CellError, CellResult, Pose};
use serde::{Deserialize, Serialize};

/// Source of the order queue. The list is append-only and may grow mid-run.
#[async_trait]
pub trait OrderSource: Send + Sync {
    /// Every order announced so far.
    async fn get_order_list(&self) -> CellResult<Vec<Order>>;
}

/// A placement that turns the part over before it reaches the destination.
#[derive(Debug, Clone, PartialEq)]
pub struct FlipRequest {
    /// Product type.
    pub part_type: String,
    /// Where the part rests.
    pub source_pose: Pose,
    /// Target pose, already flipped.
    pub destination_pose: Pose,
    /// Vehicle or station receiving the part.
    pub destination_id: String,
    /// Empty bin used to set the part down and regrasp it.
    pub staging_bin: Option<u8>,
}

/// One pick-and-place mechanism.
#[async_trait]
pub trait Actuator: Send + Sync {
    /// Which mechanism this is.
    fn kind(&self) -> ActuatorKind;

    /// Pick the part at `source` and place it at `destination` on the vehicle
    /// or station `destination_id`.
    async fn move_part(
        &self,
        part_type: &str,
        source: &Pose,
        destination: &Pose,
        destination_id: &str,
    ) -> CellResult<()>;

    /// Place a part upside down relative to how it rests.
    async fn flip_part(&self, request: &FlipRequest) -> CellResult<()>;

    /// Move a part into an empty bin so another actuator can take over.
    /// Returns the staged part's world pose.
    async fn stage_part(&self, part_type: &str, source: &Pose, bin: u8) -> CellResult<Pose> {
        let _ = (part_type, source);
        Err(CellError::Actuator(format!(
            "{} actuator cannot stage parts (bin {bin})",
            self.kind()
        )))
    }

    /// Take a part off the end of the conveyor and set it down in `bin`.
    /// Returns the part's world pose in the bin.
    async fn pick_from_conveyor(&self, part_type: &str, pose: &Pose, bin: u8) -> CellResult<Pose> {
        let _ = pose;
        Err(CellError::Actuator(format!(
            "{} actuator cannot reach the conveyor ({part_type} for bin {bin})",
            self.kind()
        )))
    }

    /// Pick the part at `pose` and keep it in the gripper.
    async fn pick_part(&self, part_type: &str, pose: &Pose) -> CellResult<()>;

    /// Move to a named joint preset.
    async fn go_to_preset(&self, preset: &str) -> CellResult<()>;

    /// Turn the gripper on.
    async fn activate_gripper(&self) -> CellResult<()>;

    /// Turn the gripper off, releasing whatever it holds.
    async fn deactivate_gripper(&self) -> CellResult<()>;
}

/// Readiness of a delivery vehicle.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum VehicleStatus {
    /// Parked at its kitting station and free to be loaded.
    Ready,
    /// Travelling or otherwise unavailable.
    Busy,
}

/// Ships kitting vehicles and submits assemblies.
#[async_trait]
pub trait ShipmentSubmitter: Send + Sync {
    /// Current readiness of a vehicle.
    async fn get_status(&self, vehicle_id: &str) -> CellResult<VehicleStatus>;

    /// Send a loaded vehicle to its station.
    async fn ship(&self, vehicle_id: &str, shipment_type: &str, station_id: &str)
        -> CellResult<()>;

    /// Report an assembly as finished.
    async fn submit_assembly(&self, station_id: &str, shipment_type: &str) -> CellResult<()>;
}

/// State reported by the competition lifecycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CompetitionState {
    /// Orders may still arrive.
    Running,
    /// The competition is over.
    Done,
}

/// Start and end of the competition.
#[async_trait]
pub trait CompetitionLifecycle: Send + Sync {
    /// Current competition state.
    async fn get_state(&self) -> CellResult<CompetitionState>;

    /// Tear down the run.
    async fn end(&self) -> CellResult<()>;
}
