//! Sensor fusion for the kitting cell.
//!
//! Turns asynchronous per-channel detections into a queryable
//! part inventory, tracks defect reports per delivery vehicle and parts
//! arriving on the conveyor, and derives a
//! "sensors stale" condition used to gate unsafe actions.
//!
//! # Main types
//!
//! - [`SensorAggregator`]: Latest-snapshot store, one slot per vision channel.
//! - [`InventoryBuilder`]: Rebuilds the part inventory from aggregator snapshots.
//! - [`Inventory`]: Part type → located instances, replaced atomically on rebuild.
//! - [`FaultMonitor`]: Inspection sensors, one per delivery vehicle.
//! - [`BlackoutDetector`]: Staleness of inventory-relevant signals.
//! - [`ConveyorMonitor`]: Parts arriving on the conveyor belt.
//! - [`ChannelLayout`]: Which channel watches which bins or station.

/// Per-channel latest-snapshot store.
pub mod aggregator;
/// Sensor staleness detection.
pub mod blackout;
/// Conveyor breakbeam and proximity sensors.
pub mod conveyor;
/// Defect inspection sensors.
pub mod fault;
/// Inventory fusion.
pub mod inventory;
/// Channel layout and bin derivation.
pub mod layout;

pub use aggregator::{ChannelSnapshot, SensorAggregator};
pub use blackout::BlackoutDetector;
pub use conveyor::ConveyorMonitor;
pub use fault::FaultMonitor;
pub use inventory::{EntryRef, Inventory, InventoryBuilder};
pub use layout::{ChannelKind, ChannelLayout, ChannelSpec};
