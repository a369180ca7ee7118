use crate::blackout::BlackoutDetector;
use crate::layout::ChannelLayout;
use cellwright_core::{DetectedInstance, Pose};
use parking_lot::RwLock;
use std::collections::HashMap;
use std::sync::Arc;
use tracing::{debug, warn};

/// The most recent batch reported by one channel.
#[derive(Debug, Clone)]
pub struct ChannelSnapshot {
    /// Reporting channel.
    pub channel_id: String,
    /// Detections of the last ingest, world poses resolved.
    pub batch: Arc<[DetectedInstance]>,
}

impl ChannelSnapshot {
    /// The channel reported nothing.
    pub fn is_empty(&self) -> bool {
        self.batch.is_empty()
    }
}

/// Stores the latest detection batch per vision channel.
///
/// Each ingest replaces the channel's batch wholesale; readers either see the
/// previous batch or the new one, never a mix. Ingest may be called from any
/// number of sensor callbacks concurrently.
pub struct SensorAggregator {
    /// Registered channels in snapshot order.
    channels: Vec<String>,
    mounts: HashMap<String, Pose>,
    latest: RwLock<HashMap<String, Arc<[DetectedInstance]>>>,
    blackout: Option<Arc<BlackoutDetector>>,
}

impl SensorAggregator {
    /// Aggregator for the given channels with identity mounts.
    pub fn new(channel_ids: impl IntoIterator<Item = impl Into<String>>) -> Self {
        Self {
            channels: channel_ids.into_iter().map(Into::into).collect(),
            mounts: HashMap::new(),
            latest: RwLock::new(HashMap::new()),
            blackout: None,
        }
    }

    /// Register every channel of the layout along with its mount pose.
    pub fn from_layout(layout: &ChannelLayout) -> Self {
        Self {
            channels: layout.channel_ids(),
            mounts: layout
                .channels
                .iter()
                .map(|c| (c.id.clone(), c.mount))
                .collect(),
            latest: RwLock::new(HashMap::new()),
            blackout: None,
        }
    }

    /// Feed every ingest into a blackout detector as a signal advance.
    pub fn with_blackout(mut self, blackout: Arc<BlackoutDetector>) -> Self {
        self.blackout = Some(blackout);
        self
    }

    /// Replace the channel's latest batch.
    pub fn ingest(&self, channel_id: &str, batch: Vec<DetectedInstance>) {
        if !self.channels.iter().any(|c| c == channel_id) {
            warn!(channel = %channel_id, "Detections from unregistered channel");
        }
        let batch: Arc<[DetectedInstance]> = batch
            .into_iter()
            .map(|mut d| {
                if d.channel_id != channel_id {
                    d.channel_id = channel_id.to_string();
                }
                d
            })
            .collect();
        debug!(channel = %channel_id, count = batch.len(), "Detections ingested");
        self.latest.write().insert(channel_id.to_string(), batch);
        if let Some(blackout) = &self.blackout {
            blackout.record_signal();
        }
    }

    /// Ingest `(part_type, sensor-frame pose)` readings, lifting each into the
    /// world frame with the channel's mount pose.
    pub fn ingest_raw(&self, channel_id: &str, models: Vec<(String, Pose)>) {
        let mount = self.mounts.get(channel_id).copied().unwrap_or_default();
        let batch = models
            .into_iter()
            .map(|(part_type, local)| {
                DetectedInstance::new(part_type, local, mount.compose(&local), channel_id)
            })
            .collect();
        self.ingest(channel_id, batch);
    }

    /// Latest batch of one channel; empty if it never reported.
    pub fn latest(&self, channel_id: &str) -> Arc<[DetectedInstance]> {
        self.latest
            .read()
            .get(channel_id)
            .cloned()
            .unwrap_or_else(|| Arc::from(Vec::new()))
    }

    /// Point-in-time read of every channel's most recent batch.
    ///
    /// Registered channels come first in registration order, followed by any
    /// unregistered channel that reported, sorted by id. Channels that never
    /// reported yield an empty batch.
    pub fn snapshot_all(&self) -> Vec<ChannelSnapshot> {
        let latest = self.latest.read();
        let mut snapshots: Vec<ChannelSnapshot> = self
            .channels
            .iter()
            .map(|id| ChannelSnapshot {
                channel_id: id.clone(),
                batch: latest
                    .get(id)
                    .cloned()
                    .unwrap_or_else(|| Arc::from(Vec::new())),
            })
            .collect();

        let mut extra: Vec<&String> = latest
            .keys()
            .filter(|id| !self.channels.contains(*id))
            .collect();
        extra.sort();
        snapshots.extend(extra.into_iter().map(|id| ChannelSnapshot {
            channel_id: id.clone(),
            batch: latest[id].clone(),
        }));
        drop(latest);

        for snapshot in snapshots.iter().filter(|s| s.is_empty()) {
            debug!(channel = %snapshot.channel_id, "No part found");
        }
        snapshots
    }

    /// Number of registered channels.
    pub fn channel_count(&self) -> usize {
        self.channels.len()
    }
}
