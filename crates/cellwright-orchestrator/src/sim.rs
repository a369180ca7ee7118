//! In-memory kitting cell.
//!
//! Stands in for the vision channels, the inspection sensors, both
//! actuators, the order source and the shipment submitter, so the scheduler
//! can run end to end without hardware. Every state change is published to
//! the sensing pipeline immediately; [`SimCell::spawn_publisher`] adds the
//! periodic callbacks real sensors produce while nothing moves.

use crate::collaborators::{
    Actuator, CompetitionLifecycle, CompetitionState, FlipRequest, OrderSource,
    ShipmentSubmitter, VehicleStatus,
};
use crate::engine::{Collaborators, SensorSuite};
use crate::types::Order;
use async_trait::async_trait;
use cellwright_core::{ActuatorKind, CellError, CellResult, DetectedInstance, Location, Pose};
use cellwright_sensing::{
    ChannelKind, ChannelLayout, ConveyorMonitor, FaultMonitor, SensorAggregator,
};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinHandle;
use tokio::time::{sleep_until, Instant};
use tracing::{debug, info};

const POSE_TOLERANCE: f64 = 1e-6;

/// A part in view of a vision channel.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct SimPart {
    /// Product type.
    pub part_type: String,
    /// Channel that sees the part.
    pub channel_id: String,
    /// Pose reported by that channel.
    pub sensor_pose: Pose,
    /// Pose in the world frame.
    pub world_pose: Pose,
}

/// A part set down on a vehicle tray or installed at a station.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct PlacedPart {
    /// Product type.
    pub part_type: String,
    /// Pose on the tray or at the station.
    pub pose: Pose,
    /// Turned over on the way.
    pub flipped: bool,
    /// Reported by the vehicle's inspection sensor.
    pub defective: bool,
}

/// A call received by the cell.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "call", rename_all = "snake_case")]
pub enum SimCall {
    /// Part carried onto a tray or station.
    Move {
        /// Actuator that made the call.
        actuator: ActuatorKind,
        /// Product type.
        part_type: String,
        /// Vehicle or station receiving the part.
        destination_id: String,
    },
    /// Part turned over onto a tray.
    Flip {
        /// Actuator that made the call.
        actuator: ActuatorKind,
        /// Product type.
        part_type: String,
        /// Vehicle or station receiving the part.
        destination_id: String,
        /// Bin used to regrasp the part.
        staging_bin: Option<u8>,
    },
    /// Part set down in a bin for the other actuator.
    Stage {
        /// Actuator that made the call.
        actuator: ActuatorKind,
        /// Product type.
        part_type: String,
        /// Bin the part was set down in.
        bin: u8,
    },
    /// Part taken off the conveyor into a bin.
    Conveyor {
        /// Actuator that made the call.
        actuator: ActuatorKind,
        /// Product type.
        part_type: String,
        /// Bin the part was set down in.
        bin: u8,
    },
    /// Placed part lifted back off a tray.
    Pick {
        /// Actuator that made the call.
        actuator: ActuatorKind,
        /// Product type.
        part_type: String,
    },
    /// Move to a named preset.
    Preset {
        /// Actuator that made the call.
        actuator: ActuatorKind,
        /// Preset reached.
        preset: String,
    },
    /// Gripper switched.
    Gripper {
        /// Actuator that made the call.
        actuator: ActuatorKind,
        /// On or off.
        active: bool,
    },
    /// Kitting vehicle shipped.
    Ship {
        /// Shipped vehicle.
        vehicle_id: String,
        /// Shipment identifier.
        shipment_type: String,
        /// Destination station.
        station_id: String,
        /// Parts that left with it.
        parts: Vec<PlacedPart>,
    },
    /// Assembly submitted.
    Submit {
        /// Destination station.
        station_id: String,
        /// Shipment identifier.
        shipment_type: String,
        /// Parts that left with it.
        parts: Vec<PlacedPart>,
    },
}

impl SimCall {
    /// Move or flip onto a destination.
    pub fn is_placement(&self) -> bool {
        matches!(self, SimCall::Move { .. } | SimCall::Flip { .. })
    }

    /// Kitting ship or assembly submission.
    pub fn is_shipment(&self) -> bool {
        matches!(self, SimCall::Ship { .. } | SimCall::Submit { .. })
    }
}

#[derive(Default)]
struct World {
    visible: Vec<SimPart>,
    /// Vehicle or station id → parts placed there.
    placed: HashMap<String, Vec<PlacedPart>>,
    held: HashMap<ActuatorKind, PlacedPart>,
    announced: Vec<(Duration, Order)>,
    calls: Vec<(Duration, SimCall)>,
    defects: HashMap<String, u32>,
    actuator_failures: HashMap<ActuatorKind, u32>,
    preset_failures: HashMap<(ActuatorKind, String), u32>,
    submit_failures: u32,
    order_source_failures: u32,
    lifecycle_failures: u32,
    /// Parts on the belt that have not been picked.
    conveyor: Vec<DetectedInstance>,
    busy_polls: HashMap<String, u32>,
    vision_live: bool,
    done: bool,
    ended: bool,
    next_x: f64,
}

/// A simulated cell wired into a [`SensorSuite`].
pub struct SimCell {
    world: Mutex<World>,
    layout: ChannelLayout,
    aggregator: Arc<SensorAggregator>,
    faults: Arc<FaultMonitor>,
    conveyor: Arc<ConveyorMonitor>,
    started: Instant,
}

impl SimCell {
    /// Empty cell publishing into `sensors`.
    pub fn new(sensors: &SensorSuite) -> Arc<Self> {
        Arc::new(Self {
            world: Mutex::new(World {
                vision_live: true,
                ..World::default()
            }),
            layout: sensors.inventory.layout().clone(),
            aggregator: sensors.aggregator.clone(),
            faults: sensors.faults.clone(),
            conveyor: sensors.conveyor.clone(),
            started: Instant::now(),
        })
    }

    /// Collaborators backed by this cell.
    pub fn collaborators(self: &Arc<Self>) -> Collaborators {
        Collaborators {
            orders: self.clone(),
            near: Arc::new(SimActuator::new(ActuatorKind::NearRange, self.clone())),
            far: Arc::new(SimActuator::new(ActuatorKind::FarRange, self.clone())),
            submitter: self.clone(),
            lifecycle: self.clone(),
        }
    }

    fn elapsed(&self) -> Duration {
        self.started.elapsed()
    }

    // --- Scenario setup ---

    /// Put a part in a bin or at a station and publish it.
    pub fn add_part(&self, part_type: &str, location: &Location) -> CellResult<Pose> {
        let world_pose = {
            let mut world = self.world.lock();
            let part = self.part_at(&mut world, part_type, location)?;
            let pose = part.world_pose;
            world.visible.push(part);
            pose
        };
        self.publish();
        Ok(world_pose)
    }

    /// Send a part down the conveyor. It trips the breakbeam and waits at
    /// the pickup zone.
    pub fn add_conveyor_part(&self, part_type: &str) -> Pose {
        let part = {
            let mut world = self.world.lock();
            world.next_x += 0.05;
            let pose = Pose::from_translation([world.next_x, 3.0, 0.9]);
            let part = DetectedInstance::new(part_type, pose, pose, "conveyor");
            world.conveyor.push(part.clone());
            part
        };
        let pose = part.world_pose;
        self.conveyor.ingest_breakbeam(true, Some(part));
        self.conveyor.ingest_breakbeam(false, None);
        self.conveyor.ingest_proximity(true);
        pose
    }

    /// Make `order` visible to the order source `after` the cell started.
    pub fn announce(&self, order: Order, after: Duration) {
        self.world.lock().announced.push((after, order));
    }

    /// The next `count` placements of `part_type` come out defective.
    pub fn inject_defects(&self, part_type: &str, count: u32) {
        *self
            .world
            .lock()
            .defects
            .entry(part_type.to_string())
            .or_default() += count;
    }

    /// The next `count` part-handling calls of `kind` fail.
    pub fn inject_actuator_failures(&self, kind: ActuatorKind, count: u32) {
        *self.world.lock().actuator_failures.entry(kind).or_default() += count;
    }

    /// The next `count` moves of `kind` to `preset` fail.
    pub fn inject_preset_failures(&self, kind: ActuatorKind, preset: &str, count: u32) {
        *self
            .world
            .lock()
            .preset_failures
            .entry((kind, preset.to_string()))
            .or_default() += count;
    }

    /// The next `count` order list reads fail.
    pub fn inject_order_source_failures(&self, count: u32) {
        self.world.lock().order_source_failures += count;
    }

    /// The next `count` competition state reads fail.
    pub fn inject_lifecycle_failures(&self, count: u32) {
        self.world.lock().lifecycle_failures += count;
    }

    /// The next `count` ship or submit calls fail.
    pub fn inject_submit_failures(&self, count: u32) {
        self.world.lock().submit_failures += count;
    }

    /// Report `vehicle_id` busy for the next `polls` status queries.
    pub fn set_vehicle_busy(&self, vehicle_id: &str, polls: u32) {
        self.world
            .lock()
            .busy_polls
            .insert(vehicle_id.to_string(), polls);
    }

    /// Turn the vision channels off or back on. While off nothing reaches the
    /// aggregator.
    pub fn set_vision(&self, live: bool) {
        self.world.lock().vision_live = live;
        info!(live, "Simulated vision");
        if live {
            self.publish();
        }
    }

    /// Report the competition as done from now on.
    pub fn finish_competition(&self) {
        self.world.lock().done = true;
    }

    // --- Inspection ---

    /// Every successful call with its time since the start.
    pub fn calls(&self) -> Vec<(Duration, SimCall)> {
        self.world.lock().calls.clone()
    }

    /// Successful moves and flips.
    pub fn placements(&self) -> Vec<(Duration, SimCall)> {
        self.calls()
            .into_iter()
            .filter(|(_, c)| c.is_placement())
            .collect()
    }

    /// Successful ships and submissions.
    pub fn shipments(&self) -> Vec<(Duration, SimCall)> {
        self.calls()
            .into_iter()
            .filter(|(_, c)| c.is_shipment())
            .collect()
    }

    /// Parts currently on a vehicle tray or at a station.
    pub fn placed(&self, destination_id: &str) -> Vec<PlacedPart> {
        self.world
            .lock()
            .placed
            .get(destination_id)
            .cloned()
            .unwrap_or_default()
    }

    /// Parts in view of a vision channel.
    pub fn visible(&self) -> Vec<SimPart> {
        self.world.lock().visible.clone()
    }

    /// Whether the lifecycle's end was requested.
    pub fn ended(&self) -> bool {
        self.world.lock().ended
    }

    // --- Sensor publishing ---

    /// Push the current view to every vision channel and inspection sensor.
    pub fn publish(&self) {
        let (channels, inspections) = {
            let world = self.world.lock();
            let channels: Vec<(String, Vec<(String, Pose)>)> = if world.vision_live {
                self.layout
                    .channels
                    .iter()
                    .map(|c| {
                        let models = world
                            .visible
                            .iter()
                            .filter(|p| p.channel_id == c.id)
                            .map(|p| (p.part_type.clone(), p.sensor_pose))
                            .collect();
                        (c.id.clone(), models)
                    })
                    .collect()
            } else {
                Vec::new()
            };
            let inspections: Vec<(String, Vec<DetectedInstance>)> = self
                .faults
                .vehicles()
                .iter()
                .map(|vehicle| {
                    let defects = world
                        .placed
                        .get(vehicle)
                        .into_iter()
                        .flatten()
                        .filter(|p| p.defective)
                        .map(|p| {
                            DetectedInstance::new(
                                p.part_type.clone(),
                                p.pose,
                                p.pose,
                                format!("quality_control_{vehicle}"),
                            )
                        })
                        .collect();
                    (vehicle.clone(), defects)
                })
                .collect();
            (channels, inspections)
        };

        for (channel, models) in channels {
            self.aggregator.ingest_raw(&channel, models);
        }
        for (vehicle, defects) in inspections {
            self.faults.ingest(&vehicle, defects);
        }
    }

    /// Publish every `period`, like sensor callbacks that keep firing while
    /// the cell is still.
    pub fn spawn_publisher(self: &Arc<Self>, period: Duration) -> JoinHandle<()> {
        let cell = self.clone();
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(period);
            loop {
                ticker.tick().await;
                cell.publish();
            }
        })
    }

    /// Turn vision off between `from` and `until`, measured from the start.
    pub fn spawn_blackout(self: &Arc<Self>, from: Duration, until: Duration) -> JoinHandle<()> {
        let cell = self.clone();
        tokio::spawn(async move {
            sleep_until(cell.started + from).await;
            cell.set_vision(false);
            sleep_until(cell.started + until).await;
            cell.set_vision(true);
        })
    }

    /// Apply a scenario: parts, conveyor arrivals, timed orders, defects and
    /// blackout windows.
    pub fn apply(self: &Arc<Self>, scenario: &SimScenario) -> CellResult<Vec<JoinHandle<()>>> {
        for part in &scenario.parts {
            let location = match (part.bin, &part.station) {
                (Some(bin), None) => Location::Bin(bin),
                (None, Some(station)) => Location::Station(station.clone()),
                _ => {
                    return Err(CellError::Config(format!(
                        "part {} needs exactly one of bin or station",
                        part.part_type
                    )))
                }
            };
            for _ in 0..part.count {
                self.add_part(&part.part_type, &location)?;
            }
        }
        for arrival in &scenario.conveyor {
            for _ in 0..arrival.count {
                self.add_conveyor_part(&arrival.part_type);
            }
        }
        for timed in &scenario.orders {
            let after = Duration::try_from_secs_f64(timed.at_secs).unwrap_or_default();
            self.announce(timed.order.clone(), after);
        }
        for defect in &scenario.defects {
            self.inject_defects(&defect.part_type, defect.count);
        }
        Ok(scenario
            .blackouts
            .iter()
            .map(|w| {
                self.spawn_blackout(
                    Duration::try_from_secs_f64(w.from_secs).unwrap_or_default(),
                    Duration::try_from_secs_f64(w.until_secs).unwrap_or_default(),
                )
            })
            .collect())
    }

    // --- World mechanics ---

    /// Build a visible part in the quadrant of `location`.
    fn part_at(&self, world: &mut World, part_type: &str, location: &Location) -> CellResult<SimPart> {
        let (channel, y, z) = match location {
            Location::Bin(bin) => {
                let channel = self.layout.channel_for_bin(*bin).ok_or_else(|| {
                    CellError::Inventory(format!("bin {bin} is not covered by the layout"))
                })?;
                let ChannelKind::Bins { first_bin } = channel.kind else {
                    return Err(CellError::Inventory(format!("bin {bin} has no bin channel")));
                };
                let offset = bin - first_bin;
                let y = if offset / 2 == 0 { 0.2 } else { -0.2 };
                let z = if offset % 2 == 0 { 0.2 } else { -0.2 };
                (channel, y, z)
            }
            Location::Station(station) => {
                let channel = self
                    .layout
                    .channels
                    .iter()
                    .find(|c| matches!(&c.kind, ChannelKind::Station { station_id } if station_id == station))
                    .ok_or_else(|| {
                        CellError::Inventory(format!("station {station} has no channel"))
                    })?;
                (channel, 0.0, 0.0)
            }
            Location::Unknown => {
                return Err(CellError::Inventory(
                    "cannot place a part at an unknown location".into(),
                ))
            }
        };
        // Unique depth per part keeps poses distinct.
        world.next_x += 0.05;
        let sensor_pose = Pose::from_translation([world.next_x, y, z]);
        Ok(SimPart {
            part_type: part_type.to_string(),
            channel_id: channel.id.clone(),
            sensor_pose,
            world_pose: channel.mount.compose(&sensor_pose),
        })
    }

    fn record(&self, world: &mut World, call: SimCall) {
        debug!(?call, "Simulated call");
        world.calls.push((self.elapsed(), call));
    }

    fn take_failure(world: &mut World, kind: ActuatorKind) -> CellResult<()> {
        match world.actuator_failures.get_mut(&kind) {
            Some(n) if *n > 0 => {
                *n -= 1;
                Err(CellError::Actuator(format!("{kind} motion planning failed")))
            }
            _ => Ok(()),
        }
    }

    fn take_visible(world: &mut World, part_type: &str, source: &Pose) -> CellResult<SimPart> {
        let index = world
            .visible
            .iter()
            .position(|p| p.part_type == part_type && close(&p.world_pose, source))
            .ok_or_else(|| CellError::Actuator(format!("no {part_type} at the source pose")))?;
        Ok(world.visible.remove(index))
    }

    fn take_defective(world: &mut World, part_type: &str) -> bool {
        match world.defects.get_mut(part_type) {
            Some(n) if *n > 0 => {
                *n -= 1;
                true
            }
            _ => false,
        }
    }

    /// Carry a visible part onto a tray or station. Only successful
    /// transfers are recorded as `call`.
    #[allow(clippy::too_many_arguments)]
    fn transfer(
        &self,
        call: SimCall,
        kind: ActuatorKind,
        part_type: &str,
        source: &Pose,
        destination: &Pose,
        destination_id: &str,
        flipped: bool,
    ) -> CellResult<()> {
        {
            let mut world = self.world.lock();
            Self::take_failure(&mut world, kind)?;
            Self::take_visible(&mut world, part_type, source)?;
            self.record(&mut world, call);
            let defective = Self::take_defective(&mut world, part_type);
            world
                .placed
                .entry(destination_id.to_string())
                .or_default()
                .push(PlacedPart {
                    part_type: part_type.to_string(),
                    pose: *destination,
                    flipped,
                    defective,
                });
        }
        self.publish();
        Ok(())
    }

    fn stage(&self, kind: ActuatorKind, part_type: &str, source: &Pose, bin: u8) -> CellResult<Pose> {
        let pose = {
            let mut world = self.world.lock();
            Self::take_failure(&mut world, kind)?;
            Self::take_visible(&mut world, part_type, source)?;
            self.record(
                &mut world,
                SimCall::Stage {
                    actuator: kind,
                    part_type: part_type.to_string(),
                    bin,
                },
            );
            let part = self.part_at(&mut world, part_type, &Location::Bin(bin))?;
            let pose = part.world_pose;
            world.visible.push(part);
            pose
        };
        self.publish();
        Ok(pose)
    }

    fn bin_from_conveyor(
        &self,
        kind: ActuatorKind,
        part_type: &str,
        pose: &Pose,
        bin: u8,
    ) -> CellResult<Pose> {
        let pose = {
            let mut world = self.world.lock();
            Self::take_failure(&mut world, kind)?;
            let index = world
                .conveyor
                .iter()
                .position(|p| p.part_type == part_type && close(&p.world_pose, pose))
                .ok_or_else(|| CellError::Actuator(format!("no {part_type} on the conveyor")))?;
            let part = self.part_at(&mut world, part_type, &Location::Bin(bin))?;
            world.conveyor.remove(index);
            self.record(
                &mut world,
                SimCall::Conveyor {
                    actuator: kind,
                    part_type: part_type.to_string(),
                    bin,
                },
            );
            let pose = part.world_pose;
            world.visible.push(part);
            pose
        };
        self.publish();
        Ok(pose)
    }

    fn pick(&self, kind: ActuatorKind, part_type: &str, pose: &Pose) -> CellResult<()> {
        {
            let mut world = self.world.lock();
            Self::take_failure(&mut world, kind)?;
            self.record(
                &mut world,
                SimCall::Pick {
                    actuator: kind,
                    part_type: part_type.to_string(),
                },
            );
            let found = world.placed.values_mut().find_map(|parts| {
                let i = parts
                    .iter()
                    .position(|p| p.part_type == part_type && close(&p.pose, pose))?;
                Some(parts.remove(i))
            });
            let part =
                found.ok_or_else(|| CellError::Actuator(format!("no {part_type} to pick")))?;
            world.held.insert(kind, part);
        }
        self.publish();
        Ok(())
    }
}

fn close(a: &Pose, b: &Pose) -> bool {
    a.position
        .iter()
        .zip(b.position.iter())
        .all(|(x, y)| (x - y).abs() < POSE_TOLERANCE)
}

#[async_trait]
impl OrderSource for SimCell {
    async fn get_order_list(&self) -> CellResult<Vec<Order>> {
        let now = self.elapsed();
        let mut world = self.world.lock();
        if world.order_source_failures > 0 {
            world.order_source_failures -= 1;
            return Err(CellError::OrderSource("order topic unavailable".into()));
        }
        Ok(world
            .announced
            .iter()
            .filter(|(after, _)| *after <= now)
            .map(|(_, order)| order.clone())
            .collect())
    }
}

#[async_trait]
impl ShipmentSubmitter for SimCell {
    async fn get_status(&self, vehicle_id: &str) -> CellResult<VehicleStatus> {
        let mut world = self.world.lock();
        match world.busy_polls.get_mut(vehicle_id) {
            Some(n) if *n > 0 => {
                *n -= 1;
                Ok(VehicleStatus::Busy)
            }
            _ => Ok(VehicleStatus::Ready),
        }
    }

    async fn ship(&self, vehicle_id: &str, shipment_type: &str, station_id: &str) -> CellResult<()> {
        {
            let mut world = self.world.lock();
            if world.submit_failures > 0 {
                world.submit_failures -= 1;
                return Err(CellError::Submission(format!("{vehicle_id} did not respond")));
            }
            let parts = world.placed.remove(vehicle_id).unwrap_or_default();
            self.record(
                &mut world,
                SimCall::Ship {
                    vehicle_id: vehicle_id.to_string(),
                    shipment_type: shipment_type.to_string(),
                    station_id: station_id.to_string(),
                    parts,
                },
            );
        }
        self.publish();
        Ok(())
    }

    async fn submit_assembly(&self, station_id: &str, shipment_type: &str) -> CellResult<()> {
        let mut world = self.world.lock();
        if world.submit_failures > 0 {
            world.submit_failures -= 1;
            return Err(CellError::Submission(format!("{station_id} rejected the submission")));
        }
        let parts = world.placed.remove(station_id).unwrap_or_default();
        self.record(
            &mut world,
            SimCall::Submit {
                station_id: station_id.to_string(),
                shipment_type: shipment_type.to_string(),
                parts,
            },
        );
        Ok(())
    }
}

#[async_trait]
impl CompetitionLifecycle for SimCell {
    async fn get_state(&self) -> CellResult<CompetitionState> {
        let mut world = self.world.lock();
        if world.lifecycle_failures > 0 {
            world.lifecycle_failures -= 1;
            return Err(CellError::Lifecycle("state service timed out".into()));
        }
        if world.done {
            Ok(CompetitionState::Done)
        } else {
            Ok(CompetitionState::Running)
        }
    }

    async fn end(&self) -> CellResult<()> {
        self.world.lock().ended = true;
        info!("Simulated competition ended");
        Ok(())
    }
}

/// One of the cell's actuators.
pub struct SimActuator {
    kind: ActuatorKind,
    cell: Arc<SimCell>,
}

impl SimActuator {
    /// Actuator of `kind` acting on `cell`.
    pub fn new(kind: ActuatorKind, cell: Arc<SimCell>) -> Self {
        Self { kind, cell }
    }
}

#[async_trait]
impl Actuator for SimActuator {
    fn kind(&self) -> ActuatorKind {
        self.kind
    }

    async fn move_part(
        &self,
        part_type: &str,
        source: &Pose,
        destination: &Pose,
        destination_id: &str,
    ) -> CellResult<()> {
        let call = SimCall::Move {
            actuator: self.kind,
            part_type: part_type.to_string(),
            destination_id: destination_id.to_string(),
        };
        self.cell.transfer(
            call,
            self.kind,
            part_type,
            source,
            destination,
            destination_id,
            false,
        )
    }

    async fn flip_part(&self, request: &FlipRequest) -> CellResult<()> {
        let call = SimCall::Flip {
            actuator: self.kind,
            part_type: request.part_type.clone(),
            destination_id: request.destination_id.clone(),
            staging_bin: request.staging_bin,
        };
        self.cell.transfer(
            call,
            self.kind,
            &request.part_type,
            &request.source_pose,
            &request.destination_pose,
            &request.destination_id,
            true,
        )
    }

    async fn stage_part(&self, part_type: &str, source: &Pose, bin: u8) -> CellResult<Pose> {
        if self.kind != ActuatorKind::FarRange {
            return Err(CellError::Actuator(format!(
                "{} actuator cannot stage parts (bin {bin})",
                self.kind
            )));
        }
        self.cell.stage(self.kind, part_type, source, bin)
    }

    async fn pick_from_conveyor(&self, part_type: &str, pose: &Pose, bin: u8) -> CellResult<Pose> {
        if self.kind != ActuatorKind::NearRange {
            return Err(CellError::Actuator(format!(
                "{} actuator cannot reach the conveyor ({part_type} for bin {bin})",
                self.kind
            )));
        }
        self.cell.bin_from_conveyor(self.kind, part_type, pose, bin)
    }

    async fn pick_part(&self, part_type: &str, pose: &Pose) -> CellResult<()> {
        self.cell.pick(self.kind, part_type, pose)
    }

    async fn go_to_preset(&self, preset: &str) -> CellResult<()> {
        let mut world = self.cell.world.lock();
        if let Some(n) = world
            .preset_failures
            .get_mut(&(self.kind, preset.to_string()))
            .filter(|n| **n > 0)
        {
            *n -= 1;
            return Err(CellError::Actuator(format!(
                "{} could not reach preset {preset}",
                self.kind
            )));
        }
        self.cell.record(
            &mut world,
            SimCall::Preset {
                actuator: self.kind,
                preset: preset.to_string(),
            },
        );
        Ok(())
    }

    async fn activate_gripper(&self) -> CellResult<()> {
        self.cell.record(
            &mut self.cell.world.lock(),
            SimCall::Gripper {
                actuator: self.kind,
                active: true,
            },
        );
        Ok(())
    }

    async fn deactivate_gripper(&self) -> CellResult<()> {
        {
            let mut world = self.cell.world.lock();
            if let Some(part) = world.held.remove(&self.kind) {
                debug!(part_type = %part.part_type, "Dropped held part");
            }
            self.cell.record(
                &mut world,
                SimCall::Gripper {
                    actuator: self.kind,
                    active: false,
                },
            );
        }
        Ok(())
    }
}

// --- Scenario files ---

fn default_count() -> usize {
    1
}

/// Parts to put in the cell before the run.
#[derive(Debug, Clone, Deserialize)]
pub struct ScenarioPart {
    /// Product type.
    pub part_type: String,
    /// Bin to put the parts in.
    #[serde(default)]
    pub bin: Option<u8>,
    /// Station to put the parts at, instead of a bin.
    #[serde(default)]
    pub station: Option<String>,
    /// Number of units.
    #[serde(default = "default_count")]
    pub count: usize,
}

/// Parts waiting on the conveyor at the start.
#[derive(Debug, Clone, Deserialize)]
pub struct ScenarioConveyorPart {
    /// Product type.
    pub part_type: String,
    /// Number of units, in arrival order.
    #[serde(default = "default_count")]
    pub count: usize,
}

/// An order published some time after the start.
#[derive(Debug, Clone, Deserialize)]
pub struct ScenarioOrder {
    /// Seconds after the start at which the order is published.
    #[serde(default)]
    pub at_secs: f64,
    /// The order itself.
    #[serde(flatten)]
    pub order: Order,
}

/// Placements of a part type that come out defective.
#[derive(Debug, Clone, Deserialize)]
pub struct ScenarioDefect {
    /// Product type.
    pub part_type: String,
    /// How many of its next placements are defective.
    #[serde(default = "default_defect_count")]
    pub count: u32,
}

fn default_defect_count() -> u32 {
    1
}

/// A period without vision callbacks.
#[derive(Debug, Clone, Deserialize)]
pub struct ScenarioWindow {
    /// Start, in seconds after the cell started.
    pub from_secs: f64,
    /// End, in seconds after the cell started.
    pub until_secs: f64,
}

/// A simulated run, loadable from TOML.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct SimScenario {
    /// Parts in bins and at stations.
    #[serde(default)]
    pub parts: Vec<ScenarioPart>,
    /// Parts on the conveyor.
    #[serde(default)]
    pub conveyor: Vec<ScenarioConveyorPart>,
    /// Orders and when they appear.
    #[serde(default)]
    pub orders: Vec<ScenarioOrder>,
    /// Defects to inject.
    #[serde(default)]
    pub defects: Vec<ScenarioDefect>,
    /// Vision blackouts.
    #[serde(default)]
    pub blackouts: Vec<ScenarioWindow>,
}

impl SimScenario {
    /// Parse a scenario from TOML.
    pub fn from_toml_str(raw: &str) -> CellResult<Self> {
        toml::from_str(raw).map_err(|e| CellError::Config(format!("invalid scenario: {e}")))
    }

    /// Read and parse a scenario file.
    pub fn load(path: impl AsRef<std::path::Path>) -> CellResult<Self> {
        Self::from_toml_str(&std::fs::read_to_string(path)?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::CellConfig;

    fn cell() -> (SensorSuite, Arc<SimCell>) {
        let sensors = SensorSuite::from_config(&CellConfig::default());
        let cell = SimCell::new(&sensors);
        (sensors, cell)
    }

    #[tokio::test]
    async fn test_add_part_is_published_in_its_bin() {
        let (sensors, cell) = cell();
        cell.add_part("assembly_pump_red", &Location::Bin(6)).unwrap();
        cell.add_part("assembly_pump_red", &Location::Station("as2".into()))
            .unwrap();

        let inventory = sensors.rebuild_inventory();
        let locations: Vec<Location> = inventory
            .entries("assembly_pump_red")
            .iter()
            .map(|e| e.location.clone())
            .collect();
        assert_eq!(
            locations,
            vec![Location::Bin(6), Location::Station("as2".into())]
        );
        assert!(cell.add_part("x", &Location::Bin(42)).is_err());
    }

    #[tokio::test]
    async fn test_move_part_lands_on_tray_and_leaves_view() {
        let (sensors, cell) = cell();
        let source = cell.add_part("assembly_battery_blue", &Location::Bin(1)).unwrap();
        let arm = SimActuator::new(ActuatorKind::NearRange, cell.clone());
        arm.move_part("assembly_battery_blue", &source, &Pose::identity(), "agv1")
            .await
            .unwrap();

        assert!(cell.visible().is_empty());
        assert_eq!(cell.placed("agv1").len(), 1);
        assert_eq!(sensors.rebuild_inventory().total_count(), 0);
        assert!(arm
            .move_part("assembly_battery_blue", &source, &Pose::identity(), "agv1")
            .await
            .is_err());
    }

    #[tokio::test]
    async fn test_defect_is_reported_until_picked() {
        let (sensors, cell) = cell();
        let source = cell.add_part("assembly_sensor_green", &Location::Bin(2)).unwrap();
        cell.inject_defects("assembly_sensor_green", 1);
        let tray = Pose::from_translation([0.1, 0.1, 0.0]);
        let arm = SimActuator::new(ActuatorKind::NearRange, cell.clone());
        arm.move_part("assembly_sensor_green", &source, &tray, "agv3")
            .await
            .unwrap();

        let records = sensors.faults.poll();
        assert_eq!(records.len(), 1);
        assert_eq!(records[0].vehicle_id, "agv3");

        arm.pick_part("assembly_sensor_green", &tray).await.unwrap();
        arm.deactivate_gripper().await.unwrap();
        assert!(sensors.faults.poll().is_empty());
        assert!(cell.placed("agv3").is_empty());
    }

    #[tokio::test]
    async fn test_only_far_range_stages() {
        let (_sensors, cell) = cell();
        let source = cell.add_part("assembly_pump_blue", &Location::Bin(4)).unwrap();
        let near = SimActuator::new(ActuatorKind::NearRange, cell.clone());
        let far = SimActuator::new(ActuatorKind::FarRange, cell.clone());
        assert!(near.stage_part("assembly_pump_blue", &source, 2).await.is_err());

        far.stage_part("assembly_pump_blue", &source, 2).await.unwrap();
        let visible = cell.visible();
        assert_eq!(visible.len(), 1);
        assert_eq!(visible[0].channel_id, "bins0");
    }

    #[tokio::test]
    async fn test_injected_failures_are_consumed() {
        let (_sensors, cell) = cell();
        let source = cell.add_part("assembly_pump_red", &Location::Bin(1)).unwrap();
        cell.inject_actuator_failures(ActuatorKind::NearRange, 1);
        let arm = SimActuator::new(ActuatorKind::NearRange, cell.clone());
        let err = arm
            .move_part("assembly_pump_red", &source, &Pose::identity(), "agv1")
            .await
            .unwrap_err();
        assert!(matches!(err, CellError::Actuator(_)));
        assert_eq!(cell.visible().len(), 1, "failed call must not move the part");

        arm.move_part("assembly_pump_red", &source, &Pose::identity(), "agv1")
            .await
            .unwrap();
        assert_eq!(cell.placements().len(), 1);
    }

    #[tokio::test]
    async fn test_conveyor_part_is_binned_by_near_range_only() {
        let (sensors, cell) = cell();
        let pose = cell.add_conveyor_part("assembly_regulator_red");
        let part = sensors.conveyor.take_ready().unwrap();
        assert_eq!(part.world_pose, pose);

        let far = SimActuator::new(ActuatorKind::FarRange, cell.clone());
        assert!(far
            .pick_from_conveyor("assembly_regulator_red", &pose, 2)
            .await
            .is_err());

        let near = SimActuator::new(ActuatorKind::NearRange, cell.clone());
        near.pick_from_conveyor("assembly_regulator_red", &pose, 2)
            .await
            .unwrap();
        let entries = sensors.rebuild_inventory();
        assert_eq!(
            entries.entries("assembly_regulator_red")[0].location,
            Location::Bin(2)
        );
        assert!(near
            .pick_from_conveyor("assembly_regulator_red", &pose, 5)
            .await
            .is_err());
    }

    #[tokio::test]
    async fn test_preset_failures_are_per_preset() {
        let (_sensors, cell) = cell();
        cell.inject_preset_failures(ActuatorKind::FarRange, "home", 1);
        let far = SimActuator::new(ActuatorKind::FarRange, cell.clone());
        far.go_to_preset("at_bins1234").await.unwrap();
        assert!(far.go_to_preset("home").await.is_err());
        far.go_to_preset("home").await.unwrap();
        assert_eq!(cell.calls().len(), 2);
    }

    #[tokio::test]
    async fn test_collaborator_failures_are_consumed() {
        let (_sensors, cell) = cell();
        cell.inject_order_source_failures(1);
        cell.inject_lifecycle_failures(1);
        assert!(matches!(
            cell.get_order_list().await,
            Err(CellError::OrderSource(_))
        ));
        assert!(cell.get_order_list().await.is_ok());
        assert!(matches!(cell.get_state().await, Err(CellError::Lifecycle(_))));
        assert_eq!(cell.get_state().await.unwrap(), CompetitionState::Running);
    }

    #[tokio::test(start_paused = true)]
    async fn test_orders_are_revealed_on_schedule() {
        let (_sensors, cell) = cell();
        cell.announce(Order::new("order_0"), Duration::ZERO);
        cell.announce(Order::new("order_1"), Duration::from_secs(10));
        assert_eq!(cell.get_order_list().await.unwrap().len(), 1);
        tokio::time::advance(Duration::from_secs(10)).await;
        assert_eq!(cell.get_order_list().await.unwrap().len(), 2);
    }

    #[test]
    fn test_scenario_from_toml() {
        let scenario = SimScenario::from_toml_str(
            r#"
            [[parts]]
            part_type = "assembly_pump_red"
            bin = 1
            count = 2

            [[parts]]
            part_type = "assembly_regulator_red"
            station = "as2"

            [[conveyor]]
            part_type = "assembly_battery_green"
            count = 2

            [[orders]]
            at_secs = 5.0
            order_id = "order_0"
            priority = 3

            [[orders.kitting]]
            shipment_type = "order_0_kitting_0"
            vehicle_id = "agv1"
            station_id = "as1"
            products = [{ part_type = "assembly_pump_red" }]

            [[blackouts]]
            from_secs = 10.0
            until_secs = 20.0
            "#,
        )
        .unwrap();
        assert_eq!(scenario.parts[0].count, 2);
        assert_eq!(scenario.parts[1].count, 1);
        assert_eq!(scenario.orders[0].order.priority, 3);
        assert_eq!(scenario.orders[0].order.kitting[0].products.len(), 1);
        assert_eq!(scenario.blackouts.len(), 1);
        assert_eq!(scenario.conveyor[0].count, 2);
        assert!(scenario.defects.is_empty());
    }
}
