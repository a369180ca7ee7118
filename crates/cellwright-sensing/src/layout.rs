use cellwright_core::{CellError, CellResult, Location, Pose};
use serde::{Deserialize, Serialize};
use std::collections::HashSet;

/// What a vision channel looks at.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum ChannelKind {
    /// Four bins in a 2x2 grid.
    Bins {
        /// Number of the top-left bin.
        first_bin: u8,
    },
    /// An assembly station.
    Station {
        /// Station identifier such as `as1`.
        station_id: String,
    },
}

/// One vision channel of the cell.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ChannelSpec {
    /// Channel identifier used by the sensor callbacks.
    pub id: String,
    /// What the channel looks at.
    #[serde(flatten)]
    pub kind: ChannelKind,
    /// Sensor pose in the world frame, used to lift raw sensor-frame readings.
    #[serde(default)]
    pub mount: Pose,
}

impl ChannelSpec {
    /// Channel over the four bins starting at `first_bin`.
    pub fn bins(id: impl Into<String>, first_bin: u8) -> Self {
        Self {
            id: id.into(),
            kind: ChannelKind::Bins { first_bin },
            mount: Pose::identity(),
        }
    }

    /// Channel over an assembly station.
    pub fn station(id: impl Into<String>, station_id: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            kind: ChannelKind::Station {
                station_id: station_id.into(),
            },
            mount: Pose::identity(),
        }
    }

    /// Set the sensor mount pose.
    pub fn with_mount(mut self, mount: Pose) -> Self {
        self.mount = mount;
        self
    }
}

/// The set of vision channels and how their readings map to locations.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ChannelLayout {
    /// Registered channels in snapshot order.
    pub channels: Vec<ChannelSpec>,
    /// Bins the near-range actuator can reach from the conveyor rail.
    #[serde(default = "default_near_conveyor_bins")]
    pub near_conveyor_bins: Vec<u8>,
}

/// Highest `first_bin` whose four-bin grid still fits in a `u8`.
const MAX_FIRST_BIN: u8 = u8::MAX - 3;

/// The bins of a grid starting at `first_bin`, clamped at `u8::MAX`.
fn bin_range(first_bin: u8) -> std::ops::RangeInclusive<u8> {
    first_bin..=first_bin.saturating_add(3)
}

fn default_near_conveyor_bins() -> Vec<u8> {
    vec![1, 2, 5, 6]
}

impl Default for ChannelLayout {
    fn default() -> Self {
        Self {
            channels: vec![
                ChannelSpec::bins("bins0", 1),
                ChannelSpec::bins("bins1", 5),
                ChannelSpec::station("station1", "as1"),
                ChannelSpec::station("station2", "as2"),
                ChannelSpec::station("station3", "as3"),
                ChannelSpec::station("station4", "as4"),
            ],
            near_conveyor_bins: default_near_conveyor_bins(),
        }
    }
}

impl ChannelLayout {
    /// Look up a channel by id.
    pub fn get(&self, channel_id: &str) -> Option<&ChannelSpec> {
        self.channels.iter().find(|c| c.id == channel_id)
    }

    /// Channel ids in declaration order.
    pub fn channel_ids(&self) -> Vec<String> {
        self.channels.iter().map(|c| c.id.clone()).collect()
    }

    /// Derive where a detection sits from the channel that saw it.
    ///
    /// For bin channels the sensor-frame `y` picks the row (conveyor side
    /// first) and `z` picks the column, so each channel covers
    /// `first_bin..first_bin + 4`.
    pub fn locate(&self, channel_id: &str, sensor_pose: &Pose) -> Location {
        match self.get(channel_id).map(|c| &c.kind) {
            Some(ChannelKind::Bins { first_bin }) => {
                let [_, y, z] = sensor_pose.position;
                let row = if y >= 0.0 { 0 } else { 1 };
                let column = if z >= 0.0 { 0 } else { 1 };
                first_bin
                    .checked_add(2 * row + column)
                    .map_or(Location::Unknown, Location::Bin)
            }
            Some(ChannelKind::Station { station_id }) => Location::Station(station_id.clone()),
            None => Location::Unknown,
        }
    }

    /// Whether a location is one of the conveyor-adjacent bins.
    pub fn is_near_conveyor(&self, location: &Location) -> bool {
        location
            .bin()
            .is_some_and(|b| self.near_conveyor_bins.contains(&b))
    }

    /// Every bin number covered by the layout, ascending.
    pub fn bins(&self) -> Vec<u8> {
        let mut bins: Vec<u8> = self
            .channels
            .iter()
            .filter_map(|c| match c.kind {
                ChannelKind::Bins { first_bin } => Some(bin_range(first_bin)),
                ChannelKind::Station { .. } => None,
            })
            .flatten()
            .collect();
        bins.sort_unstable();
        bins
    }

    /// The channel whose grid contains `bin`.
    pub fn channel_for_bin(&self, bin: u8) -> Option<&ChannelSpec> {
        self.channels.iter().find(|c| match c.kind {
            ChannelKind::Bins { first_bin } => bin_range(first_bin).contains(&bin),
            ChannelKind::Station { .. } => false,
        })
    }

    /// Reject layouts that would make locations ambiguous.
    pub fn validate(&self) -> CellResult<()> {
        if self.channels.is_empty() {
            return Err(CellError::Config("channel layout is empty".into()));
        }
        let mut ids = HashSet::new();
        for channel in &self.channels {
            if !ids.insert(channel.id.as_str()) {
                return Err(CellError::Config(format!(
                    "duplicate channel id '{}'",
                    channel.id
                )));
            }
            if let ChannelKind::Bins { first_bin } = channel.kind {
                if first_bin > MAX_FIRST_BIN {
                    return Err(CellError::Config(format!(
                        "channel '{}': first_bin {first_bin} leaves no room for four bins",
                        channel.id
                    )));
                }
            }
        }
        let bins = self.bins();
        if bins.windows(2).any(|w| w[0] == w[1]) {
            return Err(CellError::Config(
                "bin channels cover overlapping bin numbers".into(),
            ));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn at(y: f64, z: f64) -> Pose {
        Pose::from_translation([1.0, y, z])
    }

    #[test]
    fn test_default_layout_bins() {
        let layout = ChannelLayout::default();
        assert_eq!(layout.bins(), vec![1, 2, 3, 4, 5, 6, 7, 8]);
        assert!(layout.validate().is_ok());
    }

    #[test]
    fn test_locate_bins0_quadrants() {
        let layout = ChannelLayout::default();
        assert_eq!(layout.locate("bins0", &at(0.3, 0.2)), Location::Bin(1));
        assert_eq!(layout.locate("bins0", &at(0.3, -0.2)), Location::Bin(2));
        assert_eq!(layout.locate("bins0", &at(-0.3, 0.2)), Location::Bin(3));
        assert_eq!(layout.locate("bins0", &at(-0.3, -0.2)), Location::Bin(4));
    }

    #[test]
    fn test_locate_bins1_offsets() {
        let layout = ChannelLayout::default();
        assert_eq!(layout.locate("bins1", &at(0.3, 0.2)), Location::Bin(5));
        assert_eq!(layout.locate("bins1", &at(-0.3, -0.2)), Location::Bin(8));
    }

    #[test]
    fn test_locate_station_and_unknown() {
        let layout = ChannelLayout::default();
        assert_eq!(
            layout.locate("station3", &Pose::identity()),
            Location::Station("as3".into())
        );
        assert_eq!(layout.locate("conveyor", &Pose::identity()), Location::Unknown);
    }

    #[test]
    fn test_near_conveyor() {
        let layout = ChannelLayout::default();
        for bin in [1, 2, 5, 6] {
            assert!(layout.is_near_conveyor(&Location::Bin(bin)));
        }
        for bin in [3, 4, 7, 8] {
            assert!(!layout.is_near_conveyor(&Location::Bin(bin)));
        }
        assert!(!layout.is_near_conveyor(&Location::Station("as1".into())));
    }

    #[test]
    fn test_channel_for_bin() {
        let layout = ChannelLayout::default();
        assert_eq!(layout.channel_for_bin(3).unwrap().id, "bins0");
        assert_eq!(layout.channel_for_bin(7).unwrap().id, "bins1");
        assert!(layout.channel_for_bin(9).is_none());
    }

    #[test]
    fn test_validate_duplicate_ids() {
        let layout = ChannelLayout {
            channels: vec![ChannelSpec::bins("bins0", 1), ChannelSpec::bins("bins0", 5)],
            near_conveyor_bins: default_near_conveyor_bins(),
        };
        assert!(layout.validate().is_err());
    }

    #[test]
    fn test_validate_overlapping_bins() {
        let layout = ChannelLayout {
            channels: vec![ChannelSpec::bins("bins0", 1), ChannelSpec::bins("bins1", 3)],
            near_conveyor_bins: default_near_conveyor_bins(),
        };
        assert!(layout.validate().is_err());
    }

    #[test]
    fn test_validate_rejects_first_bin_near_u8_max() {
        let layout = ChannelLayout {
            channels: vec![ChannelSpec::bins("bins0", 254)],
            near_conveyor_bins: Vec::new(),
        };
        let err = layout.validate().unwrap_err();
        assert!(matches!(err, CellError::Config(_)));
        assert!(err.to_string().contains("first_bin 254"));

        // Lookups stay total even on an unvalidated layout.
        assert_eq!(layout.bins(), vec![254, 255]);
        assert_eq!(layout.locate("bins0", &at(-0.3, -0.2)), Location::Unknown);
        assert!(layout.channel_for_bin(255).is_some());
    }

    #[test]
    fn test_last_fitting_grid_is_accepted() {
        let layout = ChannelLayout {
            channels: vec![ChannelSpec::bins("bins0", MAX_FIRST_BIN)],
            near_conveyor_bins: Vec::new(),
        };
        assert!(layout.validate().is_ok());
        assert_eq!(layout.bins(), vec![252, 253, 254, 255]);
        assert_eq!(layout.locate("bins0", &at(-0.3, -0.2)), Location::Bin(255));
    }

    #[test]
    fn test_layout_deserialization() {
        let layout: ChannelLayout = serde_json::from_value(serde_json::json!({
            "channels": [
                { "id": "bins0", "kind": "bins", "first_bin": 1 },
                { "id": "station2", "kind": "station", "station_id": "as2" }
            ],
            "near_conveyor_bins": [1, 2]
        }))
        .unwrap();
        assert_eq!(layout.channels.len(), 2);
        assert_eq!(layout.near_conveyor_bins, vec![1, 2]);
        assert_eq!(layout.get("bins0").unwrap().mount, Pose::identity());
        assert_eq!(
            layout.get("station2").unwrap().kind,
            ChannelKind::Station {
                station_id: "as2".into()
            }
        );
    }
}
