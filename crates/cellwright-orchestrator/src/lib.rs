//! Task orchestration for the kitting cell.
//!
//! Takes orders from the order source, selects parts from the fused
//! inventory, routes each placement to the near-range or far-range actuator,
//! verifies placed parts against the inspection sensors, and ships vehicles or
//! submits assemblies once every line-item of a shipment is settled.
//!
//! # Main types
//!
//! - [`TaskScheduler`]: The control loop and per-slot state machine.
//! - [`OrderBook`]: Every order seen in the run, with shipment progress.
//! - [`CellConfig`]: Timing, retry and layout settings, loadable from TOML.
//! - [`CellMonitor`]: Actuator state and metrics.
//! - [`SimCell`]: In-memory cell used by the CLI demo and the tests.

/// Interfaces of the external systems the scheduler drives.
pub mod collaborators;
/// Scheduler configuration.
pub mod config;
/// The task scheduler.
pub mod engine;
/// Actuator state and metrics.
pub mod monitor;
/// Order bookkeeping and selection.
pub mod order_book;
/// Actuator selection and flip rules.
pub mod routing;
/// In-memory simulated cell.
pub mod sim;
/// Orders, shipments and line-item state.
pub mod types;

pub use collaborators::{
    Actuator, CompetitionLifecycle, CompetitionState, FlipRequest, OrderSource,
    ShipmentSubmitter, VehicleStatus,
};
pub use config::{CellConfig, ConveyorIntake, PresetNames, RetryPolicy};
pub use engine::{Collaborators, RunReport, SchedulerContext, SensorSuite, TaskScheduler};
pub use monitor::{ActuatorMetrics, ActuatorState, ActuatorStatus, CellMonitor};
pub use order_book::{OrderBook, OrderRecord, OrderStatus};
pub use routing::Route;
pub use sim::{PlacedPart, SimActuator, SimCall, SimCell, SimPart, SimScenario};
pub use types::{
    AssemblyShipment, KittingShipment, LineItem, Order, Product, ShipmentKind, ShipmentProgress,
    ShipmentStatus, SlotState, NORMAL_PRIORITY,
};
