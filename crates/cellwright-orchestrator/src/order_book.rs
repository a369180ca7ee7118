use crate::types::{Order, ShipmentProgress};
use serde::{Deserialize, Serialize};

/// Where an order stands in the run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OrderStatus {
    /// Waiting to be started or resumed.
    Pending,
    /// On the scheduler stack.
    InProgress,
    /// Suspended while a more urgent order drains.
    Preempted,
    /// Every shipment shipped or submitted.
    Completed,
}

/// An order together with the progress of each of its shipments.
///
/// Shipments are kept kitting first, then assembly, each in published order.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OrderRecord {
    /// The order as published.
    pub order: Order,
    /// Position in the order source's list.
    pub arrival: usize,
    /// Lifecycle state.
    pub status: OrderStatus,
    /// Per-shipment progress.
    pub shipments: Vec<ShipmentProgress>,
}

impl OrderRecord {
    fn new(order: Order, arrival: usize) -> Self {
        let shipments = order
            .kitting
            .iter()
            .map(|k| ShipmentProgress::kitting(&order.order_id, k))
            .chain(
                order
                    .assembly
                    .iter()
                    .map(|a| ShipmentProgress::assembly(&order.order_id, a)),
            )
            .collect();
        Self {
            order,
            arrival,
            status: OrderStatus::Pending,
            shipments,
        }
    }

    /// Order identifier.
    pub fn id(&self) -> &str {
        &self.order.order_id
    }

    /// Order priority, higher is more urgent.
    pub fn priority(&self) -> u8 {
        self.order.priority
    }

    /// Index of the first open shipment, optionally kitting only.
    pub fn next_open_shipment(&self, kitting_only: bool) -> Option<usize> {
        self.shipments
            .iter()
            .position(|s| !s.is_closed() && (!kitting_only || s.is_kitting()))
    }

    pub fn all_closed(&self) -> bool {
        self.shipments.iter().all(ShipmentProgress::is_closed)
    }
}

/// Append-only book of every order seen during the run.
pub struct OrderBook {
    orders: Vec<OrderRecord>,
}

impl OrderBook {
    /// Empty book.
    pub fn new() -> Self {
        Self { orders: Vec::new() }
    }

    /// Merge the order source's current list. Known orders are left untouched.
    /// Returns the ids of orders seen for the first time.
    pub fn refresh(&mut self, orders: Vec<Order>) -> Vec<String> {
        let mut added = Vec::new();
        for order in orders {
            if self.get(&order.order_id).is_some() {
                continue;
            }
            added.push(order.order_id.clone());
            let arrival = self.orders.len();
            self.orders.push(OrderRecord::new(order, arrival));
        }
        added
    }

    /// The next order to start: highest priority first, then arrival order.
    pub fn next_order(&self) -> Option<&OrderRecord> {
        self.orders
            .iter()
            .filter(|o| o.status == OrderStatus::Pending)
            .min_by_key(|o| (std::cmp::Reverse(o.priority()), o.arrival))
    }

    /// The most urgent pending order above `priority`, skipping `exclude`.
    pub fn preemptor_above(&self, priority: u8, exclude: &[String]) -> Option<&OrderRecord> {
        self.orders
            .iter()
            .filter(|o| {
                o.status == OrderStatus::Pending
                    && o.priority() > priority
                    && !exclude.iter().any(|id| id == o.id())
            })
            .min_by_key(|o| (std::cmp::Reverse(o.priority()), o.arrival))
    }

    /// Look up an order.
    pub fn get(&self, order_id: &str) -> Option<&OrderRecord> {
        self.orders.iter().find(|o| o.id() == order_id)
    }

    /// Look up an order for update.
    pub fn get_mut(&mut self, order_id: &str) -> Option<&mut OrderRecord> {
        self.orders.iter_mut().find(|o| o.id() == order_id)
    }

    fn set_status(&mut self, order_id: &str, status: OrderStatus) -> bool {
        if let Some(record) = self.get_mut(order_id) {
            record.status = status;
            true
        } else {
            false
        }
    }

    /// Mark an order as being worked on.
    pub fn mark_in_progress(&mut self, order_id: &str) -> bool {
        self.set_status(order_id, OrderStatus::InProgress)
    }

    /// Mark an order as suspended by a more urgent one.
    pub fn mark_preempted(&mut self, order_id: &str) -> bool {
        self.set_status(order_id, OrderStatus::Preempted)
    }

    /// Put an order back in line.
    pub fn mark_pending(&mut self, order_id: &str) -> bool {
        self.set_status(order_id, OrderStatus::Pending)
    }

    /// Mark an order as completed.
    pub fn mark_completed(&mut self, order_id: &str) -> bool {
        self.set_status(order_id, OrderStatus::Completed)
    }

    /// All orders in arrival order.
    pub fn all_orders(&self) -> &[OrderRecord] {
        &self.orders
    }

    /// Orders waiting to be started.
    pub fn pending_count(&self) -> usize {
        self.orders
            .iter()
            .filter(|o| o.status == OrderStatus::Pending)
            .count()
    }

    /// Orders with every shipment closed.
    pub fn completed_count(&self) -> usize {
        self.orders
            .iter()
            .filter(|o| o.status == OrderStatus::Completed)
            .count()
    }

    /// Every order seen so far.
    pub fn total_count(&self) -> usize {
        self.orders.len()
    }

    /// True when every known order is completed.
    pub fn is_done(&self) -> bool {
        self.orders
            .iter()
            .all(|o| o.status == OrderStatus::Completed)
    }
}

impl Default for OrderBook {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::{AssemblyShipment, KittingShipment, Product};
    use cellwright_core::Pose;

    fn order(id: &str, priority: u8) -> Order {
        Order::new(id)
            .with_priority(priority)
            .with_kitting(KittingShipment {
                shipment_type: format!("{id}_kitting_0"),
                vehicle_id: "agv1".into(),
                station_id: "as1".into(),
                products: vec![Product::new("assembly_pump_red", Pose::identity())],
            })
    }

    #[test]
    fn test_empty_book() {
        let book = OrderBook::new();
        assert_eq!(book.total_count(), 0);
        assert!(book.is_done());
        assert!(book.next_order().is_none());
    }

    #[test]
    fn test_refresh_is_append_only() {
        let mut book = OrderBook::new();
        assert_eq!(book.refresh(vec![order("order_0", 1)]), vec!["order_0"]);
        book.mark_in_progress("order_0");

        let added = book.refresh(vec![order("order_0", 1), order("order_1", 3)]);
        assert_eq!(added, vec!["order_1"]);
        assert_eq!(book.total_count(), 2);
        assert_eq!(
            book.get("order_0").unwrap().status,
            OrderStatus::InProgress,
            "re-listing an order must not reset it"
        );
    }

    #[test]
    fn test_next_order_prefers_priority_then_arrival() {
        let mut book = OrderBook::new();
        book.refresh(vec![order("a", 1), order("b", 3), order("c", 3)]);
        assert_eq!(book.next_order().unwrap().id(), "b");
        book.mark_completed("b");
        assert_eq!(book.next_order().unwrap().id(), "c");
        book.mark_completed("c");
        assert_eq!(book.next_order().unwrap().id(), "a");
    }

    #[test]
    fn test_preemptor_above() {
        let mut book = OrderBook::new();
        book.refresh(vec![order("order_0", 1)]);
        book.mark_in_progress("order_0");
        assert!(book.preemptor_above(1, &[]).is_none());

        book.refresh(vec![order("order_1", 3)]);
        assert_eq!(book.preemptor_above(1, &[]).unwrap().id(), "order_1");
        assert!(book.preemptor_above(3, &[]).is_none());
        assert!(book
            .preemptor_above(1, &["order_1".to_string()])
            .is_none());
    }

    #[test]
    fn test_shipments_kitting_first() {
        let mut book = OrderBook::new();
        let o = order("order_0", 1).with_assembly(AssemblyShipment {
            shipment_type: "order_0_assembly_0".into(),
            station_id: "as2".into(),
            products: Vec::new(),
        });
        book.refresh(vec![o]);
        let record = book.get("order_0").unwrap();
        assert_eq!(record.shipments.len(), 2);
        assert!(record.shipments[0].is_kitting());
        assert_eq!(record.next_open_shipment(false), Some(0));
        assert_eq!(record.next_open_shipment(true), Some(0));
    }

    #[test]
    fn test_is_done_and_counts() {
        let mut book = OrderBook::new();
        book.refresh(vec![order("a", 1), order("b", 1)]);
        assert_eq!(book.pending_count(), 2);
        book.mark_completed("a");
        assert!(!book.is_done());
        assert_eq!(book.completed_count(), 1);
        book.mark_completed("b");
        assert!(book.is_done());
        assert!(!book.mark_completed("missing"));
    }
}
