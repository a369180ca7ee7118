use crate::config::PresetNames;
use cellwright_core::{ActuatorKind, InventoryEntry, Location};
use cellwright_sensing::{ChannelKind, ChannelLayout};
use std::f64::consts::PI;

/// How a located part gets to its destination.
#[derive(Debug, Clone, PartialEq)]
pub struct Route {
    /// Actuator that picks the part.
    pub actuator: ActuatorKind,
    /// Preset the far-range actuator must reach before picking.
    pub approach: Option<String>,
}

impl Route {
    fn near() -> Self {
        Self {
            actuator: ActuatorKind::NearRange,
            approach: None,
        }
    }

    fn far(preset: String) -> Self {
        Self {
            actuator: ActuatorKind::FarRange,
            approach: Some(preset),
        }
    }
}

/// Pick the actuator for a kitting pick.
///
/// Parts in a conveyor-adjacent bin go to the near-range actuator. Anything
/// else goes to the far-range actuator, relocated to the bin's cluster, or to
/// the station for parts located at one.
pub fn route(entry: &InventoryEntry, layout: &ChannelLayout, presets: &PresetNames) -> Route {
    if layout.is_near_conveyor(&entry.location) {
        return Route::near();
    }
    match &entry.location {
        Location::Station(station_id) => Route::far(presets.station(station_id)),
        Location::Bin(bin) => {
            let first_bin = layout
                .channel_for_bin(*bin)
                .and_then(|c| match c.kind {
                    ChannelKind::Bins { first_bin } => Some(first_bin),
                    ChannelKind::Station { .. } => None,
                })
                .unwrap_or(*bin);
            Route::far(presets.cluster(first_bin))
        }
        Location::Unknown => Route::far(presets.home.clone()),
    }
}

/// Route for an assembly placement: always the far-range actuator at the
/// destination station.
pub fn route_assembly(station_id: &str, presets: &PresetNames) -> Route {
    Route::far(presets.station(station_id))
}

/// Whether a part of this type is subject to the orientation check.
pub fn is_pump(part_type: &str) -> bool {
    part_type.contains("pump")
}

/// True when `roll` lies strictly within `tolerance` of ±π.
pub fn needs_flip(roll: f64, tolerance: f64) -> bool {
    (roll.abs() - PI).abs() < tolerance
}

/// The first empty bin next to the conveyor, used to stage and regrasp a part.
pub fn staging_bin(empty_bins: &[u8], layout: &ChannelLayout) -> Option<u8> {
    empty_bins
        .iter()
        .copied()
        .find(|b| layout.is_near_conveyor(&Location::Bin(*b)))
}
