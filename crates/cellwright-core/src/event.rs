use crate::ActuatorKind;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Identifies one line-item slot inside an order's shipment.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SlotTag {
    /// Order the slot belongs to.
    pub order_id: String,
    /// Shipment within the order.
    pub shipment_type: String,
    /// Product the slot asks for.
    pub part_type: String,
}

impl SlotTag {
    /// Build a tag from its parts.
    pub fn new(
        order_id: impl Into<String>,
        shipment_type: impl Into<String>,
        part_type: impl Into<String>,
    ) -> Self {
        Self {
            order_id: order_id.into(),
            shipment_type: shipment_type.into(),
            part_type: part_type.into(),
        }
    }
}

impl std::fmt::Display for SlotTag {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "{}/{}/{}",
            self.order_id, self.shipment_type, self.part_type
        )
    }
}

/// What happened in the cell.
///
/// Every condition the scheduler handles without aborting the run is reported
/// here as well as in the log, so operators get a structured stream instead of
/// having to scrape log lines.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum CellEventKind {
    /// A part was placed on its destination.
    PartPlaced {
        /// Slot the part was placed for.
        slot: SlotTag,
        /// Actuator that finished the placement.
        actuator: ActuatorKind,
        /// Whether the part was flipped on the way.
        flipped: bool,
    },

    /// Inspection found no defect; the line-item is complete.
    PartVerified {
        /// Verified slot.
        slot: SlotTag,
    },

    /// Inspection flagged the placed part as defective.
    DefectDetected {
        /// Slot whose part is defective.
        slot: SlotTag,
        /// Vehicle carrying the defective part.
        vehicle_id: String,
    },

    /// The defective unit was removed and the slot is pending again.
    ReworkCompleted {
        /// Slot put back to pending.
        slot: SlotTag,
        /// Vehicle the unit was removed from.
        vehicle_id: String,
    },

    /// Placement was postponed because sensors are stale.
    ItemDeferred {
        /// Deferred slot.
        slot: SlotTag,
    },

    /// No free inventory entry exists for the requested part.
    SensorGap {
        /// Slot waiting for a part.
        slot: SlotTag,
    },

    /// An actuator call failed; the slot will be retried.
    ActuatorFailed {
        /// Slot being worked on.
        slot: SlotTag,
        /// Actuator whose call failed.
        actuator: ActuatorKind,
        /// Error reported by the actuator.
        message: String,
    },

    /// Retries for a slot are exhausted; the slot was given up.
    ItemFailed {
        /// Slot given up.
        slot: SlotTag,
        /// Which limit was reached.
        reason: String,
    },

    /// A kitting vehicle was sent to its station.
    ShipmentShipped {
        /// Order of the shipment.
        order_id: String,
        /// Shipment within the order.
        shipment_type: String,
        /// Vehicle that was shipped.
        vehicle_id: String,
        /// Station the vehicle was sent to.
        station_id: String,
        /// True when not every line-item reached completion.
        forced: bool,
    },

    /// An assembly was submitted at its station.
    AssemblySubmitted {
        /// Order of the shipment.
        order_id: String,
        /// Shipment within the order.
        shipment_type: String,
        /// Station the assembly was built at.
        station_id: String,
        /// True when not every line-item reached completion.
        forced: bool,
    },

    /// Work on one order was suspended for a more urgent one.
    OrderPreempted {
        /// Suspended order.
        order_id: String,
        /// Order that took over.
        by: String,
    },

    /// A suspended order continues.
    OrderResumed {
        /// Resumed order.
        order_id: String,
    },

    /// Every shipment of an order has been shipped or submitted.
    OrderCompleted {
        /// Completed order.
        order_id: String,
    },

    /// Free inventory cannot cover an order's requirement for a part type.
    InsufficientParts {
        /// Order that cannot be covered.
        order_id: String,
        /// Missing part type.
        part_type: String,
        /// Units the order needs.
        required: usize,
        /// Free units in the inventory.
        available: usize,
    },

    /// A part taken off the conveyor was stored in an empty bin.
    ConveyorPartBinned {
        /// Type of the stored part.
        part_type: String,
        /// Bin it was stored in.
        bin: u8,
    },

    /// The control loop exited.
    RunFinished {
        /// Identifies the run.
        run_id: Uuid,
        /// Orders with every shipment closed.
        orders_completed: usize,
        /// Line-items given up during the run.
        items_failed: usize,
    },
}

/// A timestamped [`CellEventKind`].
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CellEvent {
    /// When the event was emitted.
    pub at: DateTime<Utc>,
    /// What happened.
    #[serde(flatten)]
    pub kind: CellEventKind,
}

impl CellEvent {
    /// Stamp `kind` with the current time.
    pub fn now(kind: CellEventKind) -> Self {
        Self {
            at: Utc::now(),
            kind,
        }
    }
}

impl From<CellEventKind> for CellEvent {
    fn from(kind: CellEventKind) -> Self {
        Self::now(kind)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_slot_tag_display() {
        let tag = SlotTag::new("order_0", "order_0_kitting_0", "assembly_pump_red");
        assert_eq!(tag.to_string(), "order_0/order_0_kitting_0/assembly_pump_red");
    }

    #[test]
    fn test_event_is_tagged() {
        let event = CellEvent::now(CellEventKind::OrderCompleted {
            order_id: "order_1".into(),
        });
        let json = serde_json::to_value(&event).unwrap();
        assert_eq!(json["type"], "order_completed");
        assert_eq!(json["order_id"], "order_1");
        assert!(json["at"].is_string());
    }
}
