//! Core types and error definitions for the cellwright kitting cell.
//!
//! This crate provides the foundational types shared across all cellwright
//! crates: error handling, pose math, the records produced by sensor fusion,
//! and the structured event stream emitted by the scheduler.
//!
//! # Main types
//!
//! - [`CellError`]: Unified error enum for all cellwright subsystems.
//! - [`CellResult`]: Convenience alias for `Result<T, CellError>`.
//! - [`Pose`]: Position plus unit-quaternion orientation.
//! - [`DetectedInstance`]: One part seen by one vision channel.
//! - [`InventoryEntry`]: A located part instance available to the scheduler.
//! - [`FaultRecord`]: A defective part reported on a delivery vehicle.
//! - [`CellEvent`]: Structured operator-facing event.

/// Structured events emitted while the cell runs.
pub mod event;
/// Position and orientation math.
pub mod pose;

pub use event::{CellEvent, CellEventKind, SlotTag};
pub use pose::Pose;

use serde::{Deserialize, Serialize};

// --- Error types ---

/// Top-level error type for cellwright.
///
/// Each variant corresponds to a subsystem or collaborator that can fail.
#[derive(Debug, thiserror::Error)]
pub enum CellError {
    /// The part inventory could not satisfy a request.
    #[error("Inventory error: {0}")]
    Inventory(String),

    /// A pick-and-place actuator call failed.
    #[error("Actuator error: {0}")]
    Actuator(String),

    /// Shipping a vehicle or submitting an assembly failed.
    #[error("Submission error: {0}")]
    Submission(String),

    /// The order source could not be read.
    #[error("Order source error: {0}")]
    OrderSource(String),

    /// The competition lifecycle collaborator failed.
    #[error("Lifecycle error: {0}")]
    Lifecycle(String),

    /// An error in configuration parsing or validation.
    #[error("Config error: {0}")]
    Config(String),

    /// A JSON serialization or deserialization error.
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    /// A standard I/O error.
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

/// A convenience `Result` alias using [`CellError`].
pub type CellResult<T> = Result<T, CellError>;

// --- Actuators ---

/// The two pick-and-place mechanisms of the cell.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ActuatorKind {
    /// Kitting arm riding the rail next to the conveyor.
    NearRange,
    /// Gantry that must be relocated to a bin cluster or station first.
    FarRange,
}

impl std::fmt::Display for ActuatorKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ActuatorKind::NearRange => write!(f, "near_range"),
            ActuatorKind::FarRange => write!(f, "far_range"),
        }
    }
}

// --- Sensor fusion records ---

/// Where a detected part physically sits.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Location {
    /// A storage bin, numbered from 1.
    Bin(u8),
    /// An assembly station such as `as1`.
    Station(String),
    /// Seen by a channel that is not part of the configured layout.
    Unknown,
}

impl Location {
    /// Bin number, if this location is a bin.
    pub fn bin(&self) -> Option<u8> {
        match self {
            Location::Bin(n) => Some(*n),
            _ => None,
        }
    }
}

impl std::fmt::Display for Location {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Location::Bin(n) => write!(f, "bin{n}"),
            Location::Station(id) => write!(f, "{id}"),
            Location::Unknown => write!(f, "unknown"),
        }
    }
}

/// One part reported by one vision channel.
///
/// Immutable once produced; the next batch from the same channel supersedes it.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DetectedInstance {
    /// Product type such as `assembly_pump_red`.
    pub part_type: String,
    /// Pose in the reporting sensor's frame.
    pub sensor_pose: Pose,
    /// Pose in the cell's world frame.
    pub world_pose: Pose,
    /// Vision channel that reported the part.
    pub channel_id: String,
}

impl DetectedInstance {
    /// Build a detection from its parts.
    pub fn new(
        part_type: impl Into<String>,
        sensor_pose: Pose,
        world_pose: Pose,
        channel_id: impl Into<String>,
    ) -> Self {
        Self {
            part_type: part_type.into(),
            sensor_pose,
            world_pose,
            channel_id: channel_id.into(),
        }
    }
}

/// Whether the scheduler has already committed to an inventory entry.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum EntryStatus {
    /// Available for selection.
    #[default]
    Free,
    /// Already used by a placement.
    Processed,
}

/// A located part instance in the fused inventory.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct InventoryEntry {
    /// Product type.
    pub part_type: String,
    /// Pose in the cell's world frame.
    pub world_pose: Pose,
    /// Vision channel that reported the part.
    pub channel_id: String,
    /// Derived from the channel's position in the layout.
    pub location: Location,
    /// Free until a placement uses it.
    pub status: EntryStatus,
}

impl InventoryEntry {
    /// Not yet used by a placement.
    pub fn is_free(&self) -> bool {
        self.status == EntryStatus::Free
    }
}

/// A defective part reported by a vehicle's inspection sensor.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FaultRecord {
    /// Type of the defective part, empty when the sensor did not say.
    pub part_type: String,
    /// Where the defective unit lies on the tray.
    pub world_pose: Pose,
    /// Vehicle whose inspection sensor reported it.
    pub vehicle_id: String,
}
