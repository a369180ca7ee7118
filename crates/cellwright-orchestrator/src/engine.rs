use crate::collaborators::{
    Actuator, CompetitionLifecycle, CompetitionState, FlipRequest, OrderSource,
    ShipmentSubmitter, VehicleStatus,
};
use crate::config::CellConfig;
use crate::monitor::CellMonitor;
use crate::order_book::{OrderBook, OrderRecord};
use crate::routing::{self, Route};
use crate::types::{LineItem, ShipmentKind, ShipmentProgress, ShipmentStatus, SlotState};
use cellwright_core::{
    ActuatorKind, CellError, CellEvent, CellEventKind, CellResult, FaultRecord, InventoryEntry,
    Location, Pose, SlotTag,
};
use cellwright_sensing::{
    BlackoutDetector, ConveyorMonitor, FaultMonitor, Inventory, InventoryBuilder,
    SensorAggregator,
};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tokio::sync::mpsc::UnboundedSender;
use tokio::time::{sleep, Instant};
use tracing::{debug, error, info, warn};
use uuid::Uuid;

/// The sensing pipeline the scheduler reads from.
#[derive(Clone)]
pub struct SensorSuite {
    /// Latest batch of every vision channel.
    pub aggregator: Arc<SensorAggregator>,
    /// Inventory rebuilt from the aggregator.
    pub inventory: Arc<InventoryBuilder>,
    /// Inspection sensors of the delivery vehicles.
    pub faults: Arc<FaultMonitor>,
    /// Staleness of the vision channels.
    pub blackout: Arc<BlackoutDetector>,
    /// Breakbeam and proximity sensors of the conveyor.
    pub conveyor: Arc<ConveyorMonitor>,
}

impl SensorSuite {
    /// Build the pipeline for the configured layout and vehicles. Every
    /// aggregator ingest counts as a signal for the blackout detector.
    pub fn from_config(config: &CellConfig) -> Self {
        let layout = Arc::new(config.layout.clone());
        let blackout = Arc::new(BlackoutDetector::new(config.blackout_threshold()));
        Self {
            aggregator: Arc::new(
                SensorAggregator::from_layout(&layout).with_blackout(blackout.clone()),
            ),
            inventory: Arc::new(InventoryBuilder::new(layout)),
            faults: Arc::new(FaultMonitor::new(config.vehicles.iter().cloned())),
            blackout,
            conveyor: Arc::new(ConveyorMonitor::new()),
        }
    }

    /// Rebuild the inventory from the latest snapshot of every channel.
    pub fn rebuild_inventory(&self) -> Arc<Inventory> {
        self.inventory.rebuild(&self.aggregator.snapshot_all())
    }
}

/// External systems driven or polled by the scheduler.
#[derive(Clone)]
pub struct Collaborators {
    /// Where orders come from.
    pub orders: Arc<dyn OrderSource>,
    /// Arm on the conveyor rail, reaching the near-conveyor bins.
    pub near: Arc<dyn Actuator>,
    /// Gantry reaching every bin and station.
    pub far: Arc<dyn Actuator>,
    /// Ships vehicles and submits assemblies.
    pub submitter: Arc<dyn ShipmentSubmitter>,
    /// Competition start and end.
    pub lifecycle: Arc<dyn CompetitionLifecycle>,
}

/// All state of one scheduler run.
pub struct SchedulerContext {
    /// Identifies the run in logs and the report.
    pub run_id: Uuid,
    /// Every order seen so far.
    pub book: OrderBook,
    /// Orders being worked on. The last one is active; the ones below it
    /// were preempted and resume in reverse order.
    pub stack: Vec<String>,
    /// Orders that already preempted another one.
    pub preemptors: Vec<String>,
    /// Line-items given up so far.
    pub items_failed: usize,
    /// Conveyor parts stored in bins at startup.
    pub parts_binned: usize,
}

impl SchedulerContext {
    /// Empty state with a fresh run id.
    pub fn new() -> Self {
        Self {
            run_id: Uuid::new_v4(),
            book: OrderBook::new(),
            stack: Vec::new(),
            preemptors: Vec::new(),
            items_failed: 0,
            parts_binned: 0,
        }
    }

    fn shipment(&self, slot: &SlotRef) -> Option<&ShipmentProgress> {
        self.book.get(&slot.order_id)?.shipments.get(slot.shipment)
    }

    fn shipment_mut(&mut self, slot: &SlotRef) -> Option<&mut ShipmentProgress> {
        self.book
            .get_mut(&slot.order_id)?
            .shipments
            .get_mut(slot.shipment)
    }

    fn item_mut(&mut self, slot: &SlotRef) -> Option<&mut LineItem> {
        self.shipment_mut(slot)?.items.get_mut(slot.item)
    }
}

impl Default for SchedulerContext {
    fn default() -> Self {
        Self::new()
    }
}

/// Summary of a finished run.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RunReport {
    /// Identifies the run.
    pub run_id: Uuid,
    /// Orders seen during the run.
    pub orders_total: usize,
    /// Orders with every shipment closed.
    pub orders_completed: usize,
    /// Shipped or submitted, forced ones included.
    pub shipments_shipped: usize,
    /// Shipped with failed or open line-items.
    pub shipments_forced: usize,
    /// Given up after every submission attempt failed.
    pub shipments_abandoned: usize,
    /// Line-items placed and verified.
    pub items_completed: usize,
    /// Line-items given up.
    pub items_failed: usize,
    /// Orders that preempted another one.
    pub preemptions: usize,
    /// Conveyor parts stored in bins at startup.
    pub parts_binned: usize,
    /// Wall time of the run.
    pub duration_ms: u64,
}

/// Addresses a line-item (or, with `item` unused, a shipment) in the book.
#[derive(Debug, Clone)]
struct SlotRef {
    order_id: String,
    shipment: usize,
    item: usize,
}

impl SlotRef {
    fn shipment(order_id: &str, shipment: usize) -> Self {
        Self {
            order_id: order_id.to_string(),
            shipment,
            item: 0,
        }
    }

    fn at(&self, item: usize) -> Self {
        Self {
            item,
            ..self.clone()
        }
    }
}

enum OrderOutcome {
    Completed,
    /// A preempting order finished its kitting shipments.
    Drained,
    Preempted(String),
}

enum ShipmentOutcome {
    Closed,
    Preempted(String),
}

enum SlotOutcome {
    Progress,
    Stalled,
    Deferred,
}

/// Drives orders through the pick-place-verify state machine.
///
/// One cooperative control loop: every actuator call, settling delay and
/// fault poll is awaited before the next decision is made. The loop's only
/// idle suspension is a sleep of `poll_interval` when a pass made no progress.
pub struct TaskScheduler {
    config: CellConfig,
    sensors: SensorSuite,
    collaborators: Collaborators,
    monitor: Arc<CellMonitor>,
    events: Option<UnboundedSender<CellEvent>>,
}

impl TaskScheduler {
    /// Create a scheduler. Fails if the configuration does not validate.
    pub fn new(
        config: CellConfig,
        sensors: SensorSuite,
        collaborators: Collaborators,
    ) -> CellResult<Self> {
        config.validate()?;
        Ok(Self {
            config,
            sensors,
            collaborators,
            monitor: Arc::new(CellMonitor::new()),
            events: None,
        })
    }

    /// Send every [`CellEvent`] to `tx` as well as to the log.
    pub fn with_events(mut self, tx: UnboundedSender<CellEvent>) -> Self {
        self.events = Some(tx);
        self
    }

    /// Share an existing monitor instead of a private one.
    pub fn with_monitor(mut self, monitor: Arc<CellMonitor>) -> Self {
        self.monitor = monitor;
        self
    }

    /// Actuator state and metrics.
    pub fn monitor(&self) -> &Arc<CellMonitor> {
        &self.monitor
    }

    /// The sensing pipeline.
    pub fn sensors(&self) -> &SensorSuite {
        &self.sensors
    }

    /// The validated configuration.
    pub fn config(&self) -> &CellConfig {
        &self.config
    }

    /// Run until every order is complete and no new order shows up within the
    /// idle timeout, or until the competition reports done.
    pub async fn run(&self) -> CellResult<RunReport> {
        let mut ctx = SchedulerContext::new();
        self.run_with(&mut ctx).await
    }

    /// [`run`](Self::run) with caller-owned state, left in place afterwards.
    pub async fn run_with(&self, ctx: &mut SchedulerContext) -> CellResult<RunReport> {
        let start = Instant::now();
        info!(run_id = %ctx.run_id, "Task scheduler: starting run");

        ctx.parts_binned += self.intake_conveyor().await;

        let mut idle_since = Instant::now();
        let mut source_failing_since: Option<Instant> = None;
        loop {
            match self.refresh_orders(ctx).await {
                Ok(()) => source_failing_since = None,
                Err(e) => {
                    let since = *source_failing_since.get_or_insert_with(Instant::now);
                    warn!(error = %e, "Order source unavailable");
                    if since.elapsed() >= self.config.idle_timeout() {
                        error!(error = %e, "Order source failed past the idle timeout");
                        return Err(e);
                    }
                }
            }

            if self.competition_state().await == CompetitionState::Done {
                info!("Competition finished");
                break;
            }

            let next = ctx.book.next_order().map(|o| o.id().to_string());
            if let Some(order_id) = next {
                self.fulfill_order(ctx, order_id).await;
                idle_since = Instant::now();
                continue;
            }

            if idle_since.elapsed() >= self.config.idle_timeout() {
                info!(
                    orders = ctx.book.total_count(),
                    completed = ctx.book.completed_count(),
                    "No pending orders, ending run"
                );
                break;
            }
            sleep(self.config.poll_interval()).await;
        }

        if self.competition_state().await == CompetitionState::Done {
            if let Err(e) = self.collaborators.lifecycle.end().await {
                warn!(error = %e, "Competition end request failed");
            }
        }

        let report = self.report(ctx, start);
        info!(
            run_id = %report.run_id,
            orders_completed = report.orders_completed,
            items_failed = report.items_failed,
            duration_ms = report.duration_ms,
            "Task scheduler: run finished"
        );
        self.emit(CellEventKind::RunFinished {
            run_id: report.run_id,
            orders_completed: report.orders_completed,
            items_failed: report.items_failed,
        });
        Ok(report)
    }

    fn report(&self, ctx: &SchedulerContext, start: Instant) -> RunReport {
        let shipments = || ctx.book.all_orders().iter().flat_map(|o| &o.shipments);
        RunReport {
            run_id: ctx.run_id,
            orders_total: ctx.book.total_count(),
            orders_completed: ctx.book.completed_count(),
            shipments_shipped: shipments().filter(|s| s.is_shipped()).count(),
            shipments_forced: shipments()
                .filter(|s| s.status == ShipmentStatus::Shipped { forced: true })
                .count(),
            shipments_abandoned: shipments()
                .filter(|s| s.status == ShipmentStatus::Abandoned)
                .count(),
            items_completed: shipments().map(ShipmentProgress::completed_count).sum(),
            items_failed: ctx.items_failed,
            preemptions: ctx.preemptors.len(),
            parts_binned: ctx.parts_binned,
            duration_ms: start.elapsed().as_millis() as u64,
        }
    }

    async fn competition_state(&self) -> CompetitionState {
        match self.collaborators.lifecycle.get_state().await {
            Ok(state) => state,
            Err(e) => {
                warn!(error = %e, "Competition state unavailable");
                CompetitionState::Running
            }
        }
    }

    // --- Conveyor ---

    /// Store conveyor arrivals in the near-conveyor bins that are empty at
    /// startup. Waits up to the configured window for parts to reach the
    /// pickup zone and returns how many were binned.
    async fn intake_conveyor(&self) -> usize {
        let intake = &self.config.conveyor;
        if !intake.enabled {
            return 0;
        }
        let layout = self.sensors.inventory.layout();
        let mut empty: Vec<u8> = self
            .sensors
            .rebuild_inventory()
            .empty_bins(layout)
            .into_iter()
            .filter(|bin| layout.near_conveyor_bins.contains(bin))
            .collect();
        if empty.is_empty() {
            debug!("No empty near-conveyor bins, skipping conveyor intake");
            return 0;
        }
        info!(bins = ?empty, "Conveyor intake: waiting for parts");

        let deadline = Instant::now() + intake.window();
        let mut binned = 0;
        while !empty.is_empty() {
            let Some(part) = self.sensors.conveyor.take_ready() else {
                if Instant::now() >= deadline {
                    break;
                }
                sleep(self.config.poll_interval()).await;
                continue;
            };
            let bin = empty[0];
            let tag = SlotTag::new("conveyor", "intake", &part.part_type);
            self.monitor.start(ActuatorKind::NearRange, &tag).await;
            let started = Instant::now();
            let result = self
                .collaborators
                .near
                .pick_from_conveyor(&part.part_type, &part.world_pose, bin)
                .await;
            self.settle_monitor(ActuatorKind::NearRange, started, result.is_ok())
                .await;
            match result {
                Ok(_) => {
                    empty.remove(0);
                    binned += 1;
                    self.monitor.record_pick(ActuatorKind::NearRange).await;
                    info!(part_type = %part.part_type, bin, "Conveyor part binned");
                    self.emit(CellEventKind::ConveyorPartBinned {
                        part_type: part.part_type.clone(),
                        bin,
                    });
                }
                Err(e) => {
                    warn!(part_type = %part.part_type, error = %e, "Conveyor part missed");
                }
            }
        }
        if self.sensors.conveyor.pending() > 0 {
            debug!(
                left = self.sensors.conveyor.pending(),
                "Conveyor parts left on the belt"
            );
        }
        binned
    }

    // --- Orders ---

    async fn refresh_orders(&self, ctx: &mut SchedulerContext) -> CellResult<()> {
        let orders = self.collaborators.orders.get_order_list().await?;
        for order_id in ctx.book.refresh(orders) {
            if let Some(record) = ctx.book.get(&order_id) {
                info!(
                    order = %order_id,
                    priority = record.priority(),
                    shipments = record.shipments.len(),
                    "New order"
                );
                self.check_sufficiency(record);
            }
        }
        Ok(())
    }

    /// Warn when free inventory cannot cover an order. Processing continues.
    fn check_sufficiency(&self, record: &OrderRecord) {
        let inventory = self.sensors.rebuild_inventory();
        for (part_type, required) in record.order.required_counts() {
            let available = inventory.free_count(&part_type);
            if available < required {
                warn!(
                    order = %record.id(),
                    part_type = %part_type,
                    required,
                    available,
                    "Insufficient parts"
                );
                self.emit(CellEventKind::InsufficientParts {
                    order_id: record.id().to_string(),
                    part_type,
                    required,
                    available,
                });
            }
        }
    }

    /// Work an order to completion, handling preemption with an explicit
    /// stack: a preempting order is pushed on top and drains before the
    /// order below it resumes.
    async fn fulfill_order(&self, ctx: &mut SchedulerContext, order_id: String) {
        info!(order = %order_id, "Starting order");
        ctx.book.mark_in_progress(&order_id);
        ctx.stack.push(order_id);

        while let Some(active) = ctx.stack.last().cloned() {
            let depth = ctx.stack.len() - 1;
            match self.advance_order(ctx, &active, depth).await {
                OrderOutcome::Completed => {
                    ctx.stack.pop();
                    ctx.book.mark_completed(&active);
                    info!(order = %active, "Order completed");
                    self.emit(CellEventKind::OrderCompleted {
                        order_id: active.clone(),
                    });
                    self.resume_top(ctx);
                }
                OrderOutcome::Drained => {
                    ctx.stack.pop();
                    ctx.book.mark_pending(&active);
                    info!(order = %active, "Preempting order drained its kitting shipments");
                    self.resume_top(ctx);
                }
                OrderOutcome::Preempted(by) => {
                    ctx.book.mark_preempted(&active);
                    ctx.book.mark_in_progress(&by);
                    warn!(order = %active, by = %by, "Order preempted");
                    self.emit(CellEventKind::OrderPreempted {
                        order_id: active,
                        by: by.clone(),
                    });
                    ctx.stack.push(by);
                }
            }
        }
    }

    fn resume_top(&self, ctx: &mut SchedulerContext) {
        if let Some(top) = ctx.stack.last() {
            ctx.book.mark_in_progress(top);
            info!(order = %top, "Order resumed");
            self.emit(CellEventKind::OrderResumed {
                order_id: top.clone(),
            });
        }
    }

    /// Process the active order's open shipments in order. Below the bottom
    /// of the stack only kitting shipments are drained.
    async fn advance_order(
        &self,
        ctx: &mut SchedulerContext,
        order_id: &str,
        depth: usize,
    ) -> OrderOutcome {
        let kitting_only = depth > 0;
        loop {
            let Some(record) = ctx.book.get(order_id) else {
                return OrderOutcome::Completed;
            };
            let Some(index) = record.next_open_shipment(kitting_only) else {
                return if record.all_closed() {
                    OrderOutcome::Completed
                } else {
                    OrderOutcome::Drained
                };
            };
            let shipment = SlotRef::shipment(order_id, index);
            if let ShipmentOutcome::Preempted(by) =
                self.fulfill_shipment(ctx, &shipment, depth).await
            {
                return OrderOutcome::Preempted(by);
            }
        }
    }

    /// A more urgent order that should take over, checked between line-items.
    async fn check_preemption(
        &self,
        ctx: &mut SchedulerContext,
        order_id: &str,
        depth: usize,
    ) -> Option<String> {
        if depth >= self.config.max_preemption_depth
            || ctx.preemptors.len() >= self.config.max_preemptions
        {
            return None;
        }
        if let Err(e) = self.refresh_orders(ctx).await {
            debug!(error = %e, "Order refresh failed during preemption check");
        }
        let priority = ctx.book.get(order_id)?.priority();
        let by = ctx
            .book
            .preemptor_above(priority, &ctx.preemptors)?
            .id()
            .to_string();
        ctx.preemptors.push(by.clone());
        Some(by)
    }

    // --- Shipments ---

    async fn fulfill_shipment(
        &self,
        ctx: &mut SchedulerContext,
        shipment: &SlotRef,
        depth: usize,
    ) -> ShipmentOutcome {
        let deadline = Instant::now() + self.config.shipment_timeout();
        if let Some(s) = ctx.shipment(shipment) {
            info!(
                order = %s.order_id,
                shipment = %s.shipment_type,
                destination = %s.destination_id(),
                items = s.items.len(),
                "Fulfilling shipment"
            );
        }

        loop {
            let Some(progress) = ctx.shipment(shipment) else {
                return ShipmentOutcome::Closed;
            };
            if progress.all_terminal() {
                break;
            }
            if Instant::now() >= deadline {
                warn!(
                    shipment = %progress.shipment_type,
                    "Shipment timed out, forcing progress"
                );
                self.fail_open_items(ctx, shipment, "shipment timeout");
                break;
            }

            // List order, except that items deferred for blackout go last.
            let open = || {
                progress
                    .items
                    .iter()
                    .enumerate()
                    .filter(|(_, item)| !item.state.is_terminal())
            };
            let mut queue: Vec<usize> = open()
                .filter(|(_, item)| !item.deferred)
                .chain(open().filter(|(_, item)| item.deferred))
                .map(|(i, _)| i)
                .collect();
            let mut requeued = Vec::new();

            let mut progressed = false;
            let mut next = 0;
            while next < queue.len() {
                let index = queue[next];
                next += 1;
                if let Some(by) = self.check_preemption(ctx, &shipment.order_id, depth).await {
                    return ShipmentOutcome::Preempted(by);
                }
                match self.process_slot(ctx, &shipment.at(index)).await {
                    SlotOutcome::Progress => progressed = true,
                    SlotOutcome::Stalled => {}
                    SlotOutcome::Deferred => {
                        if !requeued.contains(&index) {
                            requeued.push(index);
                            queue.push(index);
                        }
                    }
                }
            }

            if !progressed {
                sleep(self.config.poll_interval()).await;
            }
        }

        self.close_shipment(ctx, shipment).await;
        ShipmentOutcome::Closed
    }

    fn fail_open_items(&self, ctx: &mut SchedulerContext, shipment: &SlotRef, reason: &str) {
        let open: Vec<usize> = ctx
            .shipment(shipment)
            .map(|s| {
                s.items
                    .iter()
                    .enumerate()
                    .filter(|(_, item)| !item.state.is_terminal())
                    .map(|(i, _)| i)
                    .collect()
            })
            .unwrap_or_default();
        for index in open {
            self.fail_item(ctx, &shipment.at(index), reason.to_string());
        }
    }

    /// Ship or submit once every line-item is terminal.
    async fn close_shipment(&self, ctx: &mut SchedulerContext, shipment: &SlotRef) {
        let Some(progress) = ctx.shipment(shipment).cloned() else {
            return;
        };
        let forced = !progress.all_complete();
        if forced {
            warn!(
                shipment = %progress.shipment_type,
                completed = progress.completed_count(),
                failed = progress.failed_count(),
                "Shipping incomplete shipment"
            );
        }
        if let ShipmentKind::Kitting { vehicle_id, .. } = &progress.kind {
            self.wait_vehicle_ready(vehicle_id).await;
        }

        let mut attempt = 0;
        let status = loop {
            attempt += 1;
            match self.submit(&progress).await {
                Ok(()) => break ShipmentStatus::Shipped { forced },
                Err(e) if attempt < self.config.retry.max_attempts => {
                    warn!(shipment = %progress.shipment_type, attempt, error = %e, "Submission failed, retrying");
                    sleep(self.config.poll_interval()).await;
                }
                Err(e) => {
                    error!(shipment = %progress.shipment_type, error = %e, "Submission failed, abandoning shipment");
                    break ShipmentStatus::Abandoned;
                }
            }
        };

        if let Some(s) = ctx.shipment_mut(shipment) {
            s.status = status;
        }
        if status == ShipmentStatus::Abandoned {
            return;
        }
        match &progress.kind {
            ShipmentKind::Kitting {
                vehicle_id,
                station_id,
            } => {
                info!(
                    shipment = %progress.shipment_type,
                    vehicle = %vehicle_id,
                    station = %station_id,
                    forced,
                    "Shipment shipped"
                );
                self.emit(CellEventKind::ShipmentShipped {
                    order_id: progress.order_id.clone(),
                    shipment_type: progress.shipment_type.clone(),
                    vehicle_id: vehicle_id.clone(),
                    station_id: station_id.clone(),
                    forced,
                });
            }
            ShipmentKind::Assembly { station_id } => {
                info!(
                    shipment = %progress.shipment_type,
                    station = %station_id,
                    forced,
                    "Assembly submitted"
                );
                self.emit(CellEventKind::AssemblySubmitted {
                    order_id: progress.order_id.clone(),
                    shipment_type: progress.shipment_type.clone(),
                    station_id: station_id.clone(),
                    forced,
                });
            }
        }
    }

    async fn submit(&self, progress: &ShipmentProgress) -> CellResult<()> {
        let submitter = &self.collaborators.submitter;
        match &progress.kind {
            ShipmentKind::Kitting {
                vehicle_id,
                station_id,
            } => {
                submitter
                    .ship(vehicle_id, &progress.shipment_type, station_id)
                    .await
            }
            ShipmentKind::Assembly { station_id } => {
                submitter
                    .submit_assembly(station_id, &progress.shipment_type)
                    .await
            }
        }
    }

    async fn wait_vehicle_ready(&self, vehicle_id: &str) {
        let deadline = Instant::now() + self.config.vehicle_ready_timeout();
        loop {
            match self.collaborators.submitter.get_status(vehicle_id).await {
                Ok(VehicleStatus::Ready) => return,
                Ok(VehicleStatus::Busy) => debug!(vehicle = %vehicle_id, "Vehicle busy"),
                Err(e) => warn!(vehicle = %vehicle_id, error = %e, "Vehicle status unavailable"),
            }
            if Instant::now() >= deadline {
                warn!(vehicle = %vehicle_id, "Vehicle not ready before timeout, shipping anyway");
                return;
            }
            sleep(self.config.poll_interval()).await;
        }
    }

    // --- Line-items ---

    /// One visit to a slot: select, gate, route, place, verify.
    async fn process_slot(&self, ctx: &mut SchedulerContext, slot: &SlotRef) -> SlotOutcome {
        let Some(shipment) = ctx.shipment(slot) else {
            return SlotOutcome::Stalled;
        };
        let Some(item) = shipment.items.get(slot.item).cloned() else {
            return SlotOutcome::Stalled;
        };
        let kind = shipment.kind.clone();
        let tag = shipment.slot_tag(slot.item);

        if let SlotState::Rejected { record } = &item.state {
            return self.remove_defect(ctx, slot, &tag, record.clone()).await;
        }
        if item.state.is_terminal() {
            return SlotOutcome::Stalled;
        }

        // Pending → Located
        let part_type = item.product.part_type.as_str();
        let inventory = self.sensors.rebuild_inventory();
        let selected = match &kind {
            ShipmentKind::Kitting { .. } => {
                inventory.first_free_where(part_type, |e| e.location.bin().is_some())
            }
            ShipmentKind::Assembly { station_id } => inventory.first_free_where(part_type, |e| {
                matches!(&e.location, Location::Station(s) if s == station_id)
            }),
        }
        .map(|(entry_ref, entry)| (entry_ref, entry.clone()));

        let Some((entry_ref, entry)) = selected else {
            let gaps = ctx.item_mut(slot).map_or(0, |i| {
                i.gaps += 1;
                i.gaps
            });
            if gaps == 1 {
                warn!(slot = %tag, "No part found");
                self.emit(CellEventKind::SensorGap { slot: tag });
            } else {
                debug!(slot = %tag, passes = gaps, "Still no part found");
            }
            return SlotOutcome::Stalled;
        };
        self.set_state(ctx, slot, SlotState::Located);
        if let Some(i) = ctx.item_mut(slot) {
            i.gaps = 0;
        }
        debug!(slot = %tag, location = %entry.location, "Part located");

        // Blackout gate before committing to a placement.
        if self.sensors.blackout.is_blackout() {
            self.set_state(ctx, slot, SlotState::Pending);
            if !item.deferred {
                if let Some(i) = ctx.item_mut(slot) {
                    i.deferred = true;
                }
                warn!(slot = %tag, "Sensor blackout, deferring item");
                self.emit(CellEventKind::ItemDeferred { slot: tag });
            }
            return SlotOutcome::Deferred;
        }
        if item.deferred {
            if let Some(i) = ctx.item_mut(slot) {
                i.deferred = false;
            }
            info!(slot = %tag, "Blackout cleared, resuming deferred item");
        }

        // Located → Placed
        let presets = &self.config.presets;
        let (route, flip) = match &kind {
            ShipmentKind::Kitting { .. } => (
                routing::route(&entry, self.sensors.inventory.layout(), presets),
                routing::is_pump(part_type)
                    && routing::needs_flip(
                        item.product.pose.roll(),
                        self.config.pump_flip_tolerance,
                    ),
            ),
            ShipmentKind::Assembly { station_id } => {
                (routing::route_assembly(station_id, presets), false)
            }
        };
        let destination_id = match &kind {
            ShipmentKind::Kitting { vehicle_id, .. } => vehicle_id.as_str(),
            ShipmentKind::Assembly { station_id } => station_id.as_str(),
        };

        if let Err((actuator, e)) = self
            .place(&tag, &entry, &item.product.pose, destination_id, &route, flip, &inventory)
            .await
        {
            return self.actuator_failed(ctx, slot, &tag, actuator, e, SlotState::Pending);
        }

        if !self.sensors.inventory.mark_processed(&entry_ref) {
            warn!(slot = %tag, location = %entry.location, "Inventory was rebuilt during placement, entry left free");
        }
        self.set_state(ctx, slot, SlotState::Placed);
        self.monitor.record_placement(route.actuator, flip).await;
        info!(slot = %tag, actuator = %route.actuator, flipped = flip, "Part placed");
        self.emit(CellEventKind::PartPlaced {
            slot: tag.clone(),
            actuator: route.actuator,
            flipped: flip,
        });

        // Placed → Verifying → Complete | Rejected
        let vehicle_id = match kind {
            ShipmentKind::Kitting { vehicle_id, .. } => vehicle_id,
            ShipmentKind::Assembly { .. } => {
                self.set_state(ctx, slot, SlotState::Complete);
                return SlotOutcome::Progress;
            }
        };
        self.set_state(ctx, slot, SlotState::Verifying);
        sleep(self.config.settle_delay()).await;
        let records = self.sensors.faults.poll();
        match FaultMonitor::match_for(&records, &vehicle_id, part_type).cloned() {
            None => {
                self.set_state(ctx, slot, SlotState::Complete);
                info!(slot = %tag, vehicle = %vehicle_id, "Part verified");
                self.emit(CellEventKind::PartVerified { slot: tag });
                SlotOutcome::Progress
            }
            Some(record) => {
                warn!(slot = %tag, vehicle = %vehicle_id, "Defective part detected");
                self.emit(CellEventKind::DefectDetected {
                    slot: tag.clone(),
                    vehicle_id,
                });
                self.set_state(
                    ctx,
                    slot,
                    SlotState::Rejected {
                        record: record.clone(),
                    },
                );
                self.remove_defect(ctx, slot, &tag, record).await
            }
        }
    }

    /// Carry a part to its destination with the routed actuator.
    ///
    /// A far-range flip stages the part in an empty near-conveyor bin and the
    /// near-range actuator completes the flip from there.
    #[allow(clippy::too_many_arguments)]
    async fn place(
        &self,
        tag: &SlotTag,
        entry: &InventoryEntry,
        destination: &Pose,
        destination_id: &str,
        route: &Route,
        flip: bool,
        inventory: &Inventory,
    ) -> Result<(), (ActuatorKind, CellError)> {
        let layout = self.sensors.inventory.layout();
        let staging_bin = if flip {
            routing::staging_bin(&inventory.empty_bins(layout), layout)
        } else {
            None
        };
        let part_type = entry.part_type.as_str();
        let flip_from = |source_pose: Pose, staging_bin: Option<u8>| FlipRequest {
            part_type: part_type.to_string(),
            source_pose,
            destination_pose: *destination,
            destination_id: destination_id.to_string(),
            staging_bin,
        };

        match route.actuator {
            ActuatorKind::NearRange => {
                let arm = &self.collaborators.near;
                self.monitor.start(ActuatorKind::NearRange, tag).await;
                let started = Instant::now();
                let result = if flip {
                    arm.flip_part(&flip_from(entry.world_pose, staging_bin)).await
                } else {
                    arm.move_part(part_type, &entry.world_pose, destination, destination_id)
                        .await
                };
                self.settle_monitor(ActuatorKind::NearRange, started, result.is_ok())
                    .await;
                result.map_err(|e| (ActuatorKind::NearRange, e))
            }
            ActuatorKind::FarRange => {
                if flip && staging_bin.is_none() {
                    return Err((
                        ActuatorKind::FarRange,
                        CellError::Inventory(format!(
                            "no empty near-conveyor bin to stage {part_type}"
                        )),
                    ));
                }
                self.monitor.start(ActuatorKind::FarRange, tag).await;
                let started = Instant::now();
                let result = self
                    .far_transfer(entry, destination, destination_id, route, staging_bin)
                    .await;
                self.settle_monitor(ActuatorKind::FarRange, started, result.is_ok())
                    .await;
                let Some((bin, staged_pose)) = result.map_err(|e| (ActuatorKind::FarRange, e))?
                else {
                    return Ok(());
                };

                debug!(slot = %tag, bin, "Part staged for flip");
                self.monitor.start(ActuatorKind::NearRange, tag).await;
                let started = Instant::now();
                let result = self
                    .collaborators
                    .near
                    .flip_part(&flip_from(staged_pose, Some(bin)))
                    .await;
                self.settle_monitor(ActuatorKind::NearRange, started, result.is_ok())
                    .await;
                result.map_err(|e| (ActuatorKind::NearRange, e))
            }
        }
    }

    /// Gantry leg of a far-range placement. With a staging bin the part is
    /// only staged for a flip and its new pose is returned.
    async fn far_transfer(
        &self,
        entry: &InventoryEntry,
        destination: &Pose,
        destination_id: &str,
        route: &Route,
        staging_bin: Option<u8>,
    ) -> CellResult<Option<(u8, Pose)>> {
        let gantry = &self.collaborators.far;
        let part_type = entry.part_type.as_str();
        if let Some(preset) = &route.approach {
            gantry.go_to_preset(preset).await?;
        }
        let staged = match staging_bin {
            Some(bin) => {
                let pose = gantry.stage_part(part_type, &entry.world_pose, bin).await?;
                Some((bin, pose))
            }
            None => {
                gantry
                    .move_part(part_type, &entry.world_pose, destination, destination_id)
                    .await?;
                None
            }
        };
        // Delivery is committed here. The return leg only affects the monitor.
        if let Err(e) = gantry.go_to_preset(&self.config.presets.home).await {
            warn!(part_type, error = %e, "Far-range actuator failed to return home after delivery");
            self.monitor.record_failure(ActuatorKind::FarRange).await;
        }
        Ok(staged)
    }

    /// Grip the defective unit and lift it off the tray.
    async fn grab_defect(&self, part_type: &str, record: &FaultRecord) -> CellResult<()> {
        let arm = &self.collaborators.near;
        arm.activate_gripper().await?;
        arm.pick_part(part_type, &record.world_pose).await
    }

    /// Drop the held unit at the reject preset.
    async fn drop_defect(&self) -> CellResult<()> {
        let arm = &self.collaborators.near;
        arm.go_to_preset(&self.config.presets.reject).await?;
        arm.deactivate_gripper().await
    }

    /// Rework: take the defective unit off the tray, drop it, clear the
    /// fault, and put the slot back to pending. A unit still in the gripper
    /// from an interrupted attempt is dropped without picking again.
    async fn remove_defect(
        &self,
        ctx: &mut SchedulerContext,
        slot: &SlotRef,
        tag: &SlotTag,
        record: FaultRecord,
    ) -> SlotOutcome {
        let part_type = if record.part_type.is_empty() {
            tag.part_type.as_str()
        } else {
            record.part_type.as_str()
        };

        let rejected = SlotState::Rejected {
            record: record.clone(),
        };
        let held = ctx
            .shipment(slot)
            .and_then(|s| s.items.get(slot.item))
            .is_some_and(|i| i.held);

        if !held {
            self.monitor.start(ActuatorKind::NearRange, tag).await;
            let started = Instant::now();
            let result = self.grab_defect(part_type, &record).await;
            self.settle_monitor(ActuatorKind::NearRange, started, result.is_ok())
                .await;
            if let Err(e) = result {
                return self.actuator_failed(ctx, slot, tag, ActuatorKind::NearRange, e, rejected);
            }
            self.monitor.record_pick(ActuatorKind::NearRange).await;
            if let Some(i) = ctx.item_mut(slot) {
                i.held = true;
            }
            debug!(slot = %tag, "Defective part picked off the tray");
        }

        self.monitor.start(ActuatorKind::NearRange, tag).await;
        let started = Instant::now();
        let result = self.drop_defect().await;
        self.settle_monitor(ActuatorKind::NearRange, started, result.is_ok())
            .await;
        if let Err(e) = result {
            return self.actuator_failed(ctx, slot, tag, ActuatorKind::NearRange, e, rejected);
        }
        if let Some(i) = ctx.item_mut(slot) {
            i.held = false;
        }

        self.sensors.faults.acknowledge(&record);
        self.sensors.faults.poll();

        let reworks = ctx.item_mut(slot).map_or(0, |i| {
            i.state = SlotState::Pending;
            i.reworks += 1;
            i.reworks
        });
        info!(slot = %tag, vehicle = %record.vehicle_id, reworks, "Defective part removed");
        self.emit(CellEventKind::ReworkCompleted {
            slot: tag.clone(),
            vehicle_id: record.vehicle_id.clone(),
        });
        if reworks >= self.config.retry.max_reworks {
            self.fail_item(ctx, slot, format!("{reworks} defective parts removed"));
        }
        SlotOutcome::Progress
    }

    /// A failed actuator call leaves the slot in `resume` and counts an attempt.
    fn actuator_failed(
        &self,
        ctx: &mut SchedulerContext,
        slot: &SlotRef,
        tag: &SlotTag,
        actuator: ActuatorKind,
        error: CellError,
        resume: SlotState,
    ) -> SlotOutcome {
        warn!(slot = %tag, actuator = %actuator, error = %error, "Actuator call failed");
        self.emit(CellEventKind::ActuatorFailed {
            slot: tag.clone(),
            actuator,
            message: error.to_string(),
        });
        let attempts = ctx.item_mut(slot).map_or(0, |i| {
            i.state = resume;
            i.attempts += 1;
            i.attempts
        });
        if attempts >= self.config.retry.max_attempts {
            self.fail_item(ctx, slot, format!("{attempts} failed actuator calls"));
            return SlotOutcome::Progress;
        }
        SlotOutcome::Stalled
    }

    fn fail_item(&self, ctx: &mut SchedulerContext, slot: &SlotRef, reason: String) {
        let Some(tag) = ctx.shipment(slot).map(|s| s.slot_tag(slot.item)) else {
            return;
        };
        self.set_state(
            ctx,
            slot,
            SlotState::Failed {
                reason: reason.clone(),
            },
        );
        ctx.items_failed += 1;
        error!(slot = %tag, reason = %reason, "Line-item failed");
        self.emit(CellEventKind::ItemFailed { slot: tag, reason });
    }

    fn set_state(&self, ctx: &mut SchedulerContext, slot: &SlotRef, state: SlotState) {
        if let Some(item) = ctx.item_mut(slot) {
            debug!(order = %slot.order_id, item = slot.item, from = %item.state, to = %state, "Slot transition");
            item.state = state;
        }
    }

    async fn settle_monitor(&self, kind: ActuatorKind, started: Instant, ok: bool) {
        if ok {
            self.monitor
                .finish(kind, started.elapsed().as_millis() as u64)
                .await;
        } else {
            self.monitor.record_failure(kind).await;
        }
    }

    fn emit(&self, kind: CellEventKind) {
        if let Some(tx) = &self.events {
            let _ = tx.send(CellEvent::now(kind));
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::sim::SimCell;
    use std::time::Duration;

    fn scheduler(config: CellConfig) -> CellResult<(Arc<SimCell>, TaskScheduler)> {
        let sensors = SensorSuite::from_config(&config);
        let sim = SimCell::new(&sensors);
        let scheduler = TaskScheduler::new(config, sensors, sim.collaborators())?;
        Ok((sim, scheduler))
    }

    #[tokio::test]
    async fn test_new_rejects_invalid_config() {
        let config = CellConfig {
            poll_interval_ms: 0,
            ..CellConfig::default()
        };
        assert!(matches!(scheduler(config), Err(CellError::Config(_))));
    }

    #[tokio::test(start_paused = true)]
    async fn test_idle_run_ends_after_timeout() {
        let config = CellConfig {
            idle_timeout_secs: 2.0,
            ..CellConfig::default()
        };
        let (_sim, scheduler) = scheduler(config).unwrap();
        let start = Instant::now();
        let report = scheduler.run().await.unwrap();
        assert_eq!(report.orders_total, 0);
        assert_eq!(report.preemptions, 0);
        assert!(start.elapsed() >= Duration::from_secs(2));
    }

    #[tokio::test(start_paused = true)]
    async fn test_sensor_suite_feeds_blackout_detector() {
        let sensors = SensorSuite::from_config(&CellConfig::default());
        tokio::time::advance(Duration::from_secs(6)).await;
        assert!(sensors.blackout.is_blackout());
        sensors.aggregator.ingest("bins0", Vec::new());
        assert!(!sensors.blackout.is_blackout());
    }

    /// Near-range arm whose moves race an inventory rebuild.
    struct RebuildingArm {
        inner: crate::sim::SimActuator,
        sensors: SensorSuite,
    }

    #[async_trait::async_trait]
    impl Actuator for RebuildingArm {
        fn kind(&self) -> ActuatorKind {
            self.inner.kind()
        }
        async fn move_part(
            &self,
            part_type: &str,
            source: &Pose,
            destination: &Pose,
            destination_id: &str,
        ) -> CellResult<()> {
            self.sensors.rebuild_inventory();
            self.inner
                .move_part(part_type, source, destination, destination_id)
                .await
        }
        async fn flip_part(&self, request: &FlipRequest) -> CellResult<()> {
            self.inner.flip_part(request).await
        }
        async fn pick_part(&self, part_type: &str, pose: &Pose) -> CellResult<()> {
            self.inner.pick_part(part_type, pose).await
        }
        async fn go_to_preset(&self, preset: &str) -> CellResult<()> {
            self.inner.go_to_preset(preset).await
        }
        async fn activate_gripper(&self) -> CellResult<()> {
            self.inner.activate_gripper().await
        }
        async fn deactivate_gripper(&self) -> CellResult<()> {
            self.inner.deactivate_gripper().await
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_rebuild_during_placement_leaves_new_entries_free() {
        let config = CellConfig {
            settle_delay_secs: 0.5,
            idle_timeout_secs: 1.0,
            ..CellConfig::default()
        };
        let sensors = SensorSuite::from_config(&config);
        let sim = SimCell::new(&sensors);
        sim.add_part("assembly_battery_blue", &Location::Bin(1)).unwrap();
        sim.add_part("assembly_battery_blue", &Location::Bin(2)).unwrap();
        let mut collaborators = sim.collaborators();
        collaborators.near = Arc::new(RebuildingArm {
            inner: crate::sim::SimActuator::new(ActuatorKind::NearRange, sim.clone()),
            sensors: sensors.clone(),
        });
        sim.announce(
            crate::types::Order::new("order_0").with_kitting(crate::types::KittingShipment {
                shipment_type: "order_0_kitting_0".into(),
                vehicle_id: "agv1".into(),
                station_id: "as1".into(),
                products: vec![crate::types::Product::new(
                    "assembly_battery_blue",
                    Pose::identity(),
                )],
            }),
            Duration::ZERO,
        );

        let scheduler = TaskScheduler::new(config, sensors.clone(), collaborators).unwrap();
        let report = scheduler.run().await.unwrap();
        assert_eq!(report.items_completed, 1);
        assert_eq!(sim.placements().len(), 1);

        let current = sensors.inventory.current();
        assert!(current
            .entries("assembly_battery_blue")
            .iter()
            .all(InventoryEntry::is_free));
    }

    #[tokio::test(start_paused = true)]
    async fn test_run_with_keeps_book() {
        let (sim, scheduler) = scheduler(CellConfig {
            idle_timeout_secs: 1.0,
            ..CellConfig::default()
        })
        .unwrap();
        sim.announce(crate::types::Order::new("order_0"), Duration::ZERO);

        let mut ctx = SchedulerContext::new();
        let report = scheduler.run_with(&mut ctx).await.unwrap();
        assert_eq!(report.run_id, ctx.run_id);
        assert_eq!(report.orders_completed, 1);
        assert_eq!(ctx.book.completed_count(), 1);
    }
}
