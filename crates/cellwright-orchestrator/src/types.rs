use cellwright_core::{FaultRecord, Pose, SlotTag};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// Priority tier of an order. Larger is more urgent.
pub const NORMAL_PRIORITY: u8 = 1;

fn default_priority() -> u8 {
    NORMAL_PRIORITY
}

/// One required part and where it goes.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Product {
    /// Product type such as `assembly_pump_red`.
    pub part_type: String,
    /// Destination pose on the tray or at the station.
    #[serde(default)]
    pub pose: Pose,
}

impl Product {
    /// Product of a type at a destination pose.
    pub fn new(part_type: impl Into<String>, pose: Pose) -> Self {
        Self {
            part_type: part_type.into(),
            pose,
        }
    }
}

/// Parts to load onto a delivery vehicle, which is then sent to a station.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct KittingShipment {
    /// Shipment identifier within the order.
    pub shipment_type: String,
    /// Vehicle to load.
    pub vehicle_id: String,
    /// Station the vehicle is sent to.
    pub station_id: String,
    /// Parts to place on the tray.
    pub products: Vec<Product>,
}

/// Parts to install at an assembly station.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AssemblyShipment {
    /// Shipment identifier within the order.
    pub shipment_type: String,
    /// Station to build at.
    pub station_id: String,
    /// Parts to install.
    pub products: Vec<Product>,
}

/// An order as published by the order source.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Order {
    /// Order identifier.
    pub order_id: String,
    /// Priority tier, [`NORMAL_PRIORITY`] unless urgent.
    #[serde(default = "default_priority")]
    pub priority: u8,
    /// Kitting shipments in published order.
    #[serde(default)]
    pub kitting: Vec<KittingShipment>,
    /// Assembly shipments in published order.
    #[serde(default)]
    pub assembly: Vec<AssemblyShipment>,
}

impl Order {
    /// Normal-priority order with no shipments.
    pub fn new(order_id: impl Into<String>) -> Self {
        Self {
            order_id: order_id.into(),
            priority: NORMAL_PRIORITY,
            kitting: Vec::new(),
            assembly: Vec::new(),
        }
    }

    /// Set the priority tier.
    pub fn with_priority(mut self, priority: u8) -> Self {
        self.priority = priority;
        self
    }

    /// Append a kitting shipment.
    pub fn with_kitting(mut self, shipment: KittingShipment) -> Self {
        self.kitting.push(shipment);
        self
    }

    /// Append an assembly shipment.
    pub fn with_assembly(mut self, shipment: AssemblyShipment) -> Self {
        self.assembly.push(shipment);
        self
    }

    /// Number of parts required per part type across all shipments.
    pub fn required_counts(&self) -> BTreeMap<String, usize> {
        let mut counts = BTreeMap::new();
        let products = self
            .kitting
            .iter()
            .flat_map(|k| &k.products)
            .chain(self.assembly.iter().flat_map(|a| &a.products));
        for product in products {
            *counts.entry(product.part_type.clone()).or_default() += 1;
        }
        counts
    }
}

/// Per line-item state of the pick-place-verify lifecycle.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "state", rename_all = "snake_case")]
pub enum SlotState {
    /// Waiting for a part to be selected.
    Pending,
    /// A free matching part was selected.
    Located,
    /// The part was delivered.
    Placed,
    /// Waiting for the inspection sensor.
    Verifying,
    /// A defective unit sits in the slot and must be removed.
    Rejected {
        /// Fault reported by the inspection sensor.
        record: FaultRecord,
    },
    /// Placed and verified clean.
    Complete,
    /// Given up after exhausting retries or reworks.
    Failed {
        /// Which limit was reached.
        reason: String,
    },
}

impl SlotState {
    /// Complete or failed; the slot takes no further actions.
    pub fn is_terminal(&self) -> bool {
        matches!(self, SlotState::Complete | SlotState::Failed { .. })
    }
}

impl std::fmt::Display for SlotState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            SlotState::Pending => write!(f, "pending"),
            SlotState::Located => write!(f, "located"),
            SlotState::Placed => write!(f, "placed"),
            SlotState::Verifying => write!(f, "verifying"),
            SlotState::Rejected { .. } => write!(f, "rejected"),
            SlotState::Complete => write!(f, "complete"),
            SlotState::Failed { .. } => write!(f, "failed"),
        }
    }
}

/// One required part within a shipment, with its scheduler-owned state.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LineItem {
    /// Required part and its destination pose.
    pub product: Product,
    /// Lifecycle state.
    pub state: SlotState,
    /// Failed actuator calls so far.
    pub attempts: u32,
    /// Defective units removed from this slot so far.
    pub reworks: u32,
    /// Consecutive passes that found no free matching part.
    pub gaps: u32,
    /// Waiting for a sensor blackout to clear.
    pub deferred: bool,
    /// A defective unit was picked off the tray and is still in the gripper.
    #[serde(default)]
    pub held: bool,
}

impl LineItem {
    /// Pending slot for `product`.
    pub fn new(product: Product) -> Self {
        Self {
            product,
            state: SlotState::Pending,
            attempts: 0,
            reworks: 0,
            gaps: 0,
            deferred: false,
            held: false,
        }
    }

    /// Placed and verified clean.
    pub fn processed(&self) -> bool {
        self.state == SlotState::Complete
    }
}

/// Where a shipment is delivered.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum ShipmentKind {
    /// Loaded onto a vehicle and shipped.
    Kitting {
        /// Vehicle to load.
        vehicle_id: String,
        /// Station the vehicle is sent to.
        station_id: String,
    },
    /// Built at a station and submitted.
    Assembly {
        /// Station to build at.
        station_id: String,
    },
}

/// Whether a shipment has left the cell.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ShipmentStatus {
    /// Work remains.
    Open,
    /// Shipped or submitted.
    Shipped {
        /// Some line-items failed or were still open.
        forced: bool,
    },
    /// Every submission attempt failed.
    Abandoned,
}

/// Fulfillment progress of one shipment.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ShipmentProgress {
    /// Order the shipment belongs to.
    pub order_id: String,
    /// Shipment identifier within the order.
    pub shipment_type: String,
    /// Destination.
    pub kind: ShipmentKind,
    /// One slot per product, in published order.
    pub items: Vec<LineItem>,
    /// Whether it has left the cell.
    pub status: ShipmentStatus,
}

impl ShipmentProgress {
    /// Open progress for a kitting shipment.
    pub fn kitting(order_id: &str, shipment: &KittingShipment) -> Self {
        Self {
            order_id: order_id.to_string(),
            shipment_type: shipment.shipment_type.clone(),
            kind: ShipmentKind::Kitting {
                vehicle_id: shipment.vehicle_id.clone(),
                station_id: shipment.station_id.clone(),
            },
            items: shipment.products.iter().cloned().map(LineItem::new).collect(),
            status: ShipmentStatus::Open,
        }
    }

    /// Open progress for an assembly shipment.
    pub fn assembly(order_id: &str, shipment: &AssemblyShipment) -> Self {
        Self {
            order_id: order_id.to_string(),
            shipment_type: shipment.shipment_type.clone(),
            kind: ShipmentKind::Assembly {
                station_id: shipment.station_id.clone(),
            },
            items: shipment.products.iter().cloned().map(LineItem::new).collect(),
            status: ShipmentStatus::Open,
        }
    }

    /// Delivered by vehicle.
    pub fn is_kitting(&self) -> bool {
        matches!(self.kind, ShipmentKind::Kitting { .. })
    }

    /// Vehicle for kitting shipments, station for assembly shipments.
    pub fn destination_id(&self) -> &str {
        match &self.kind {
            ShipmentKind::Kitting { vehicle_id, .. } => vehicle_id,
            ShipmentKind::Assembly { station_id } => station_id,
        }
    }

    /// Slots placed and verified.
    pub fn completed_count(&self) -> usize {
        self.items.iter().filter(|i| i.processed()).count()
    }

    /// Slots given up.
    pub fn failed_count(&self) -> usize {
        self.items
            .iter()
            .filter(|i| matches!(i.state, SlotState::Failed { .. }))
            .count()
    }

    /// Every slot placed and verified.
    pub fn all_complete(&self) -> bool {
        self.items.iter().all(LineItem::processed)
    }

    /// Every slot complete or failed.
    pub fn all_terminal(&self) -> bool {
        self.items.iter().all(|i| i.state.is_terminal())
    }

    /// Shipped or submitted, forced or not.
    pub fn is_shipped(&self) -> bool {
        matches!(self.status, ShipmentStatus::Shipped { .. })
    }

    /// Shipped or abandoned; no more work will be done on it.
    pub fn is_closed(&self) -> bool {
        self.status != ShipmentStatus::Open
    }

    /// Tag of the slot at `index`.
    pub fn slot_tag(&self, index: usize) -> SlotTag {
        let part_type = self
            .items
            .get(index)
            .map(|i| i.product.part_type.as_str())
            .unwrap_or_default();
        SlotTag::new(&self.order_id, &self.shipment_type, part_type)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn kit() -> KittingShipment {
        KittingShipment {
            shipment_type: "order_0_kitting_0".into(),
            vehicle_id: "agv2".into(),
            station_id: "as1".into(),
            products: vec![
                Product::new("assembly_pump_red", Pose::identity()),
                Product::new("assembly_battery_blue", Pose::identity()),
            ],
        }
    }

    #[test]
    fn test_order_defaults_from_json() {
        let order: Order = serde_json::from_str(r#"{"order_id": "order_0"}"#).unwrap();
        assert_eq!(order.priority, NORMAL_PRIORITY);
        assert!(order.kitting.is_empty());
        assert!(order.assembly.is_empty());
    }

    #[test]
    fn test_required_counts() {
        let order = Order::new("order_0").with_kitting(kit()).with_assembly(AssemblyShipment {
            shipment_type: "order_0_assembly_0".into(),
            station_id: "as1".into(),
            products: vec![Product::new("assembly_pump_red", Pose::identity())],
        });
        let counts = order.required_counts();
        assert_eq!(counts["assembly_pump_red"], 2);
        assert_eq!(counts["assembly_battery_blue"], 1);
    }

    #[test]
    fn test_shipment_progress_from_kitting() {
        let progress = ShipmentProgress::kitting("order_0", &kit());
        assert_eq!(progress.items.len(), 2);
        assert_eq!(progress.destination_id(), "agv2");
        assert!(progress.is_kitting());
        assert!(!progress.all_terminal());
        assert_eq!(progress.completed_count(), 0);
        assert_eq!(
            progress.slot_tag(1).to_string(),
            "order_0/order_0_kitting_0/assembly_battery_blue"
        );
    }

    #[test]
    fn test_completion_accounting() {
        let mut progress = ShipmentProgress::kitting("order_0", &kit());
        progress.items[0].state = SlotState::Complete;
        assert!(!progress.all_complete());
        progress.items[1].state = SlotState::Failed {
            reason: "unreachable".into(),
        };
        assert!(progress.all_terminal());
        assert!(!progress.all_complete());
        assert_eq!(progress.failed_count(), 1);
        assert_eq!(progress.completed_count(), 1);
    }

    #[test]
    fn test_slot_state_display() {
        assert_eq!(SlotState::Pending.to_string(), "pending");
        assert_eq!(
            SlotState::Failed {
                reason: "x".into()
            }
            .to_string(),
            "failed"
        );
        assert!(SlotState::Complete.is_terminal());
        assert!(!SlotState::Verifying.is_terminal());
    }

    #[test]
    fn test_slot_state_serialization() {
        let state = SlotState::Failed {
            reason: "retries exhausted".to_string(),
        };
        let json = serde_json::to_string(&state).unwrap();
        assert!(json.contains("retries exhausted"));
        let parsed: SlotState = serde_json::from_str(&json).unwrap();
        assert_eq!(parsed, state);
    }
}
