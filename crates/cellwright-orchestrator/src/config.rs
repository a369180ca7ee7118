use cellwright_core::{CellError, CellResult};
use cellwright_sensing::ChannelLayout;
use serde::{Deserialize, Serialize};
use std::path::Path;
use std::time::Duration;

/// Bounded retry before a line-item is given up.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RetryPolicy {
    /// Failed actuator calls tolerated per line-item.
    #[serde(default = "default_max_attempts")]
    pub max_attempts: u32,
    /// Defective units removed per line-item before the slot is failed.
    #[serde(default = "default_max_reworks")]
    pub max_reworks: u32,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: default_max_attempts(),
            max_reworks: default_max_reworks(),
        }
    }
}

/// Named actuator poses.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PresetNames {
    /// Where the far-range actuator parks between jobs.
    #[serde(default = "default_home_preset")]
    pub home: String,
    /// Where defective units are dropped.
    #[serde(default = "default_reject_preset")]
    pub reject: String,
    /// Prefix of bin cluster presets, followed by the cluster's bin numbers.
    #[serde(default = "default_cluster_prefix")]
    pub cluster_prefix: String,
    /// Prefix of station presets, followed by the station id.
    #[serde(default = "default_station_prefix")]
    pub station_prefix: String,
}

impl Default for PresetNames {
    fn default() -> Self {
        Self {
            home: default_home_preset(),
            reject: default_reject_preset(),
            cluster_prefix: default_cluster_prefix(),
            station_prefix: default_station_prefix(),
        }
    }
}

impl PresetNames {
    /// Preset above the four bins starting at `first_bin`, e.g. `at_bins1234`.
    pub fn cluster(&self, first_bin: u8) -> String {
        let bins: String = (first_bin..first_bin.saturating_add(4))
            .map(|b| b.to_string())
            .collect();
        format!("{}{bins}", self.cluster_prefix)
    }

    /// Preset in front of a station, e.g. `near_as2`.
    pub fn station(&self, station_id: &str) -> String {
        format!("{}{station_id}", self.station_prefix)
    }
}

/// Runtime configuration of the cell.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CellConfig {
    /// Silence after which sensors are considered stale.
    #[serde(default = "default_blackout_threshold_secs")]
    pub blackout_threshold_secs: f64,
    /// Wait between a placement and trusting the inspection sensor.
    #[serde(default = "default_settle_delay_secs")]
    pub settle_delay_secs: f64,
    /// Sleep of the control loop when no progress can be made.
    #[serde(default = "default_poll_interval_ms")]
    pub poll_interval_ms: u64,
    /// Retry limits per line-item and per shipment submission.
    #[serde(default)]
    pub retry: RetryPolicy,
    /// How many orders may be stacked on top of the one being worked on.
    #[serde(default = "default_max_preemption_depth")]
    pub max_preemption_depth: usize,
    /// How many preemptions are honored in one run.
    #[serde(default = "default_max_preemptions")]
    pub max_preemptions: usize,
    /// Hard timeout after which a shipment is sent with what it has.
    #[serde(default = "default_shipment_timeout_secs")]
    pub shipment_timeout_secs: f64,
    /// How long to wait for a vehicle to report ready before shipping anyway.
    #[serde(default = "default_vehicle_ready_timeout_secs")]
    pub vehicle_ready_timeout_secs: f64,
    /// How long to keep polling for new orders once every order completed.
    #[serde(default = "default_idle_timeout_secs")]
    pub idle_timeout_secs: f64,
    /// Roll tolerance around ±π within which pumps are flipped.
    #[serde(default = "default_pump_flip_tolerance")]
    pub pump_flip_tolerance: f64,
    /// Delivery vehicles, each with its own inspection sensor.
    #[serde(default = "default_vehicles")]
    pub vehicles: Vec<String>,
    /// Vision channels and the bins they cover.
    #[serde(default)]
    pub layout: ChannelLayout,
    /// Actuator preset names.
    #[serde(default)]
    pub presets: PresetNames,
    /// Startup intake of parts arriving on the conveyor.
    #[serde(default)]
    pub conveyor: ConveyorIntake,
}

/// Moving conveyor arrivals into empty bins before the first order.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ConveyorIntake {
    /// Whether the intake step runs at all.
    #[serde(default = "default_conveyor_enabled")]
    pub enabled: bool,
    /// How long to wait for further arrivals once the queue is empty. Zero
    /// takes only the parts already past the breakbeam.
    #[serde(default)]
    pub window_secs: f64,
}

impl Default for ConveyorIntake {
    fn default() -> Self {
        Self {
            enabled: default_conveyor_enabled(),
            window_secs: 0.0,
        }
    }
}

impl ConveyorIntake {
    /// How long startup waits for conveyor parts.
    pub fn window(&self) -> Duration {
        secs(self.window_secs)
    }
}

fn default_conveyor_enabled() -> bool {
    true
}

fn default_max_attempts() -> u32 {
    5
}
fn default_max_reworks() -> u32 {
    3
}
fn default_home_preset() -> String {
    "home".to_string()
}
fn default_reject_preset() -> String {
    "home2".to_string()
}
fn default_cluster_prefix() -> String {
    "at_bins".to_string()
}
fn default_station_prefix() -> String {
    "near_".to_string()
}
fn default_blackout_threshold_secs() -> f64 {
    5.0
}
fn default_settle_delay_secs() -> f64 {
    2.0
}
fn default_poll_interval_ms() -> u64 {
    500
}
fn default_max_preemption_depth() -> usize {
    1
}
fn default_max_preemptions() -> usize {
    1
}
fn default_shipment_timeout_secs() -> f64 {
    600.0
}
fn default_vehicle_ready_timeout_secs() -> f64 {
    30.0
}
fn default_idle_timeout_secs() -> f64 {
    60.0
}
fn default_pump_flip_tolerance() -> f64 {
    0.5
}
fn default_vehicles() -> Vec<String> {
    (1..=4).map(|n| format!("agv{n}")).collect()
}

impl Default for CellConfig {
    fn default() -> Self {
        Self {
            blackout_threshold_secs: default_blackout_threshold_secs(),
            settle_delay_secs: default_settle_delay_secs(),
            poll_interval_ms: default_poll_interval_ms(),
            retry: RetryPolicy::default(),
            max_preemption_depth: default_max_preemption_depth(),
            max_preemptions: default_max_preemptions(),
            shipment_timeout_secs: default_shipment_timeout_secs(),
            vehicle_ready_timeout_secs: default_vehicle_ready_timeout_secs(),
            idle_timeout_secs: default_idle_timeout_secs(),
            pump_flip_tolerance: default_pump_flip_tolerance(),
            vehicles: default_vehicles(),
            layout: ChannelLayout::default(),
            presets: PresetNames::default(),
            conveyor: ConveyorIntake::default(),
        }
    }
}

fn secs(value: f64) -> Duration {
    Duration::try_from_secs_f64(value).unwrap_or_default()
}

impl CellConfig {
    /// Parse a TOML document and validate it.
    pub fn from_toml_str(raw: &str) -> CellResult<Self> {
        let config: CellConfig =
            toml::from_str(raw).map_err(|e| CellError::Config(e.to_string()))?;
        config.validate()?;
        Ok(config)
    }

    /// Load and validate a TOML config file.
    pub fn load(path: impl AsRef<Path>) -> CellResult<Self> {
        let raw = std::fs::read_to_string(path.as_ref())?;
        Self::from_toml_str(&raw)
    }

    /// Reject non-positive polling, negative or non-finite durations, an empty
    /// vehicle list and an invalid layout.
    pub fn validate(&self) -> CellResult<()> {
        if self.poll_interval_ms == 0 {
            return Err(CellError::Config("poll_interval_ms must be positive".into()));
        }
        let durations = [
            ("blackout_threshold_secs", self.blackout_threshold_secs),
            ("settle_delay_secs", self.settle_delay_secs),
            ("shipment_timeout_secs", self.shipment_timeout_secs),
            ("vehicle_ready_timeout_secs", self.vehicle_ready_timeout_secs),
            ("idle_timeout_secs", self.idle_timeout_secs),
            ("pump_flip_tolerance", self.pump_flip_tolerance),
            ("conveyor.window_secs", self.conveyor.window_secs),
        ];
        for (name, value) in durations {
            if !value.is_finite() || value < 0.0 {
                return Err(CellError::Config(format!(
                    "{name} must be a non-negative number, got {value}"
                )));
            }
        }
        if self.vehicles.is_empty() {
            return Err(CellError::Config("at least one vehicle is required".into()));
        }
        self.layout.validate()
    }

    /// Sensor silence that counts as a blackout.
    pub fn blackout_threshold(&self) -> Duration {
        secs(self.blackout_threshold_secs)
    }

    /// Wait between a placement and its inspection.
    pub fn settle_delay(&self) -> Duration {
        secs(self.settle_delay_secs)
    }

    /// Sleep of a pass that made no progress.
    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.poll_interval_ms)
    }

    /// Deadline after which an incomplete shipment is forced out.
    pub fn shipment_timeout(&self) -> Duration {
        secs(self.shipment_timeout_secs)
    }

    /// How long to wait for a vehicle to report ready.
    pub fn vehicle_ready_timeout(&self) -> Duration {
        secs(self.vehicle_ready_timeout_secs)
    }

    /// Idle time with no pending order that ends the run.
    pub fn idle_timeout(&self) -> Duration {
        secs(self.idle_timeout_secs)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let config = CellConfig::default();
        assert_eq!(config.blackout_threshold(), Duration::from_secs(5));
        assert_eq!(config.settle_delay(), Duration::from_secs(2));
        assert_eq!(config.poll_interval(), Duration::from_millis(500));
        assert_eq!(config.retry.max_attempts, 5);
        assert_eq!(config.max_preemption_depth, 1);
        assert_eq!(config.max_preemptions, 1);
        assert!(config.conveyor.enabled);
        assert_eq!(config.conveyor.window(), Duration::ZERO);
        assert_eq!(config.vehicles, vec!["agv1", "agv2", "agv3", "agv4"]);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_empty_toml_gives_defaults() {
        let config = CellConfig::from_toml_str("").unwrap();
        assert_eq!(config, CellConfig::default());
    }

    #[test]
    fn test_partial_toml() {
        let config = CellConfig::from_toml_str(
            r#"
            settle_delay_secs = 1.0
            vehicles = ["agv1", "agv2"]

            [retry]
            max_reworks = 1

            [presets]
            reject = "drop_zone"
            "#,
        )
        .unwrap();
        assert_eq!(config.settle_delay(), Duration::from_secs(1));
        assert_eq!(config.retry.max_attempts, 5);
        assert_eq!(config.retry.max_reworks, 1);
        assert_eq!(config.presets.reject, "drop_zone");
        assert_eq!(config.presets.home, "home");
    }

    #[test]
    fn test_layout_from_toml() {
        let config = CellConfig::from_toml_str(
            r#"
            [layout]
            near_conveyor_bins = [1, 2]

            [[layout.channels]]
            id = "bins0"
            kind = "bins"
            first_bin = 1

            [[layout.channels]]
            id = "station1"
            kind = "station"
            station_id = "as1"
            "#,
        )
        .unwrap();
        assert_eq!(config.layout.channels.len(), 2);
        assert_eq!(config.layout.bins(), vec![1, 2, 3, 4]);
    }

    #[test]
    fn test_rejects_zero_poll_interval() {
        let err = CellConfig::from_toml_str("poll_interval_ms = 0").unwrap_err();
        assert!(err.to_string().contains("poll_interval_ms"));
    }

    #[test]
    fn test_rejects_negative_duration() {
        let err = CellConfig::from_toml_str("settle_delay_secs = -1.0").unwrap_err();
        assert!(err.to_string().contains("settle_delay_secs"));
    }

    #[test]
    fn test_rejects_malformed_toml() {
        assert!(matches!(
            CellConfig::from_toml_str("settle_delay_secs = \"soon\""),
            Err(CellError::Config(_))
        ));
    }

    #[test]
    fn test_rejects_bin_grid_past_u8_range() {
        let err = CellConfig::from_toml_str(
            r#"
            [layout]
            channels = [{ id = "bins0", kind = "bins", first_bin = 254 }]
            "#,
        )
        .unwrap_err();
        assert!(matches!(err, CellError::Config(_)));
    }

    #[test]
    fn test_preset_names() {
        let presets = PresetNames::default();
        assert_eq!(presets.cluster(1), "at_bins1234");
        assert_eq!(presets.cluster(5), "at_bins5678");
        assert_eq!(presets.station("as2"), "near_as2");
    }
}
