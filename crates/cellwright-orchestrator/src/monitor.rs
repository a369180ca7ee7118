use cellwright_core::{ActuatorKind, SlotTag};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::RwLock;

/// What an actuator is doing right now.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ActuatorStatus {
    /// Waiting for work.
    Idle,
    /// Executing a call.
    Working,
    /// The last call failed.
    Error,
}

/// Counters tracked per actuator.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ActuatorMetrics {
    /// Parts delivered to a vehicle or station.
    pub placements: u32,
    /// Placements that turned the part over.
    pub flips: u32,
    /// Parts lifted without a placement, such as defects and conveyor parts.
    pub picks: u32,
    /// Failed calls.
    pub failures: u32,
    /// Time spent in successful calls.
    pub busy_ms: u64,
}

/// Real-time snapshot of one actuator.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ActuatorState {
    /// Which actuator.
    pub kind: ActuatorKind,
    /// Slot being worked on, if any.
    pub current_slot: Option<SlotTag>,
    /// Current status.
    pub status: ActuatorStatus,
    /// Counters since the monitor was created.
    pub metrics: ActuatorMetrics,
}

/// Tracks state and metrics of both actuators.
pub struct CellMonitor {
    states: Arc<RwLock<HashMap<ActuatorKind, ActuatorState>>>,
}

impl CellMonitor {
    /// Both actuators idle with zeroed counters.
    pub fn new() -> Self {
        let states = [ActuatorKind::NearRange, ActuatorKind::FarRange]
            .into_iter()
            .map(|kind| {
                (
                    kind,
                    ActuatorState {
                        kind,
                        current_slot: None,
                        status: ActuatorStatus::Idle,
                        metrics: ActuatorMetrics::default(),
                    },
                )
            })
            .collect();
        Self {
            states: Arc::new(RwLock::new(states)),
        }
    }

    /// Mark an actuator as working on a slot.
    pub async fn start(&self, kind: ActuatorKind, slot: &SlotTag) {
        let mut states = self.states.write().await;
        if let Some(state) = states.get_mut(&kind) {
            state.current_slot = Some(slot.clone());
            state.status = ActuatorStatus::Working;
        }
    }

    /// Mark an actuator as idle and add the time it was busy.
    pub async fn finish(&self, kind: ActuatorKind, busy_ms: u64) {
        let mut states = self.states.write().await;
        if let Some(state) = states.get_mut(&kind) {
            state.current_slot = None;
            state.status = ActuatorStatus::Idle;
            state.metrics.busy_ms += busy_ms;
        }
    }

    /// Count a finished placement.
    pub async fn record_placement(&self, kind: ActuatorKind, flipped: bool) {
        let mut states = self.states.write().await;
        if let Some(state) = states.get_mut(&kind) {
            state.metrics.placements += 1;
            if flipped {
                state.metrics.flips += 1;
            }
        }
    }

    /// Count a pick that was not a placement.
    pub async fn record_pick(&self, kind: ActuatorKind) {
        let mut states = self.states.write().await;
        if let Some(state) = states.get_mut(&kind) {
            state.metrics.picks += 1;
        }
    }

    /// Record a failed call. The actuator stays in error until the next start.
    pub async fn record_failure(&self, kind: ActuatorKind) {
        let mut states = self.states.write().await;
        if let Some(state) = states.get_mut(&kind) {
            state.metrics.failures += 1;
            state.current_slot = None;
            state.status = ActuatorStatus::Error;
        }
    }

    /// Both actuators, near-range first.
    pub async fn snapshot(&self) -> Vec<ActuatorState> {
        let states = self.states.read().await;
        let mut all: Vec<ActuatorState> = states.values().cloned().collect();
        all.sort_by_key(|s| s.kind == ActuatorKind::FarRange);
        all
    }

    /// State of one actuator.
    pub async fn get_state(&self, kind: ActuatorKind) -> Option<ActuatorState> {
        self.states.read().await.get(&kind).cloned()
    }

    /// Sum of both actuators' counters.
    pub async fn aggregate_metrics(&self) -> ActuatorMetrics {
        let states = self.states.read().await;
        let mut total = ActuatorMetrics::default();
        for state in states.values() {
            total.placements += state.metrics.placements;
            total.flips += state.metrics.flips;
            total.picks += state.metrics.picks;
            total.failures += state.metrics.failures;
            total.busy_ms += state.metrics.busy_ms;
        }
        total
    }

    /// Serialize the current state as JSON.
    pub async fn to_json(&self) -> serde_json::Value {
        let states = self.snapshot().await;
        let aggregate = self.aggregate_metrics().await;
        serde_json::json!({
            "actuators": states,
            "aggregate": aggregate,
        })
    }
}

impl Default for CellMonitor {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn slot() -> SlotTag {
        SlotTag::new("order_0", "order_0_kitting_0", "assembly_pump_red")
    }

    #[tokio::test]
    async fn test_initial_state() {
        let monitor = CellMonitor::new();
        let states = monitor.snapshot().await;
        assert_eq!(states.len(), 2);
        assert_eq!(states[0].kind, ActuatorKind::NearRange);
        for state in &states {
            assert_eq!(state.status, ActuatorStatus::Idle);
            assert!(state.current_slot.is_none());
        }
    }

    #[tokio::test]
    async fn test_start_and_finish() {
        let monitor = CellMonitor::new();
        monitor.start(ActuatorKind::FarRange, &slot()).await;
        let state = monitor.get_state(ActuatorKind::FarRange).await.unwrap();
        assert_eq!(state.status, ActuatorStatus::Working);
        assert_eq!(state.current_slot, Some(slot()));

        monitor.finish(ActuatorKind::FarRange, 1200).await;
        let state = monitor.get_state(ActuatorKind::FarRange).await.unwrap();
        assert_eq!(state.status, ActuatorStatus::Idle);
        assert_eq!(state.metrics.busy_ms, 1200);
    }

    #[tokio::test]
    async fn test_failure_sets_error() {
        let monitor = CellMonitor::new();
        monitor.start(ActuatorKind::NearRange, &slot()).await;
        monitor.record_failure(ActuatorKind::NearRange).await;
        let state = monitor.get_state(ActuatorKind::NearRange).await.unwrap();
        assert_eq!(state.status, ActuatorStatus::Error);
        assert_eq!(state.metrics.failures, 1);
        assert!(state.current_slot.is_none());
    }

    #[tokio::test]
    async fn test_aggregate_and_json() {
        let monitor = CellMonitor::new();
        monitor.record_placement(ActuatorKind::NearRange, true).await;
        monitor.record_placement(ActuatorKind::FarRange, false).await;
        monitor.record_pick(ActuatorKind::NearRange).await;

        let total = monitor.aggregate_metrics().await;
        assert_eq!(total.placements, 2);
        assert_eq!(total.flips, 1);
        assert_eq!(total.picks, 1);

        let json = monitor.to_json().await;
        assert!(json["actuators"].is_array());
        assert_eq!(json["aggregate"]["placements"], 2);
    }
}
