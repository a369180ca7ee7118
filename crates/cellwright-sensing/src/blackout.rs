use parking_lot::Mutex;
use std::time::Duration;
use tokio::time::Instant;

/// Derives a "sensors stale" condition from the last time any
/// inventory-relevant signal advanced.
///
/// Sensor callbacks call [`record_signal`](Self::record_signal); the scheduler
/// asks [`is_blackout`](Self::is_blackout) before committing to a placement.
#[derive(Debug)]
pub struct BlackoutDetector {
    threshold: Duration,
    last_signal: Mutex<Instant>,
}

impl BlackoutDetector {
    /// A detector that considers signals stale after `threshold` of silence.
    /// The clock starts at construction.
    pub fn new(threshold: Duration) -> Self {
        Self {
            threshold,
            last_signal: Mutex::new(Instant::now()),
        }
    }

    /// Silence after which sensing counts as blacked out.
    pub fn threshold(&self) -> Duration {
        self.threshold
    }

    /// Note that a signal advanced just now.
    pub fn record_signal(&self) {
        *self.last_signal.lock() = Instant::now();
    }

    /// Time since the last recorded signal.
    pub fn since_last_signal(&self) -> Duration {
        self.last_signal.lock().elapsed()
    }

    /// True when signals have been silent for longer than the threshold.
    pub fn is_blackout(&self) -> bool {
        let silent = self.since_last_signal();
        let stale = silent > self.threshold;
        if stale {
            tracing::debug!(silent_ms = silent.as_millis() as u64, "Sensor blackout");
        }
        stale
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test(start_paused = true)]
    async fn test_fresh_detector_is_clear() {
        let detector = BlackoutDetector::new(Duration::from_secs(5));
        assert!(!detector.is_blackout());
    }

    #[tokio::test(start_paused = true)]
    async fn test_blackout_after_threshold() {
        let detector = BlackoutDetector::new(Duration::from_secs(5));
        tokio::time::advance(Duration::from_secs(5)).await;
        assert!(!detector.is_blackout(), "threshold itself is not stale");
        tokio::time::advance(Duration::from_millis(1)).await;
        assert!(detector.is_blackout());
    }

    #[tokio::test(start_paused = true)]
    async fn test_signal_clears_blackout() {
        let detector = BlackoutDetector::new(Duration::from_secs(5));
        tokio::time::advance(Duration::from_secs(7)).await;
        assert!(detector.is_blackout());

        detector.record_signal();
        assert!(!detector.is_blackout());
        assert_eq!(detector.since_last_signal(), Duration::ZERO);
    }
}
