use cellwright_core::DetectedInstance;
use parking_lot::Mutex;
use std::collections::VecDeque;
use tracing::debug;

#[derive(Default)]
struct Belt {
    /// Parts past the breakbeam, oldest first.
    arrivals: VecDeque<DetectedInstance>,
    beam_blocked: bool,
    at_pickup: bool,
}

/// Parts arriving on the conveyor.
///
/// The breakbeam counts parts entering the belt; the proximity sensor at the
/// end of the belt says whether the oldest of them can be picked.
#[derive(Default)]
pub struct ConveyorMonitor {
    belt: Mutex<Belt>,
}

impl ConveyorMonitor {
    /// Empty belt.
    pub fn new() -> Self {
        Self::default()
    }

    /// Breakbeam callback. A part is queued on the rising edge only, so a
    /// beam held blocked across callbacks counts once.
    pub fn ingest_breakbeam(&self, object_detected: bool, part: Option<DetectedInstance>) {
        let mut belt = self.belt.lock();
        let rising = object_detected && !belt.beam_blocked;
        belt.beam_blocked = object_detected;
        if !rising {
            return;
        }
        match part {
            Some(part) => {
                debug!(part_type = %part.part_type, "Part entered the conveyor");
                belt.arrivals.push_back(part);
            }
            None => debug!("Breakbeam tripped without a conveyor reading"),
        }
    }

    /// Proximity callback at the pickup end of the belt.
    pub fn ingest_proximity(&self, object_detected: bool) {
        self.belt.lock().at_pickup = object_detected;
    }

    /// Take the oldest arrival if it has reached the pickup zone. Once taken
    /// it is gone whether or not the pick succeeds.
    pub fn take_ready(&self) -> Option<DetectedInstance> {
        let mut belt = self.belt.lock();
        if !belt.at_pickup {
            return None;
        }
        let part = belt.arrivals.pop_front();
        if belt.arrivals.is_empty() {
            belt.at_pickup = false;
        }
        part
    }

    /// Parts on the belt, picked or not yet at the pickup zone.
    pub fn pending(&self) -> usize {
        self.belt.lock().arrivals.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use cellwright_core::Pose;

    fn part(part_type: &str) -> DetectedInstance {
        DetectedInstance::new(part_type, Pose::identity(), Pose::identity(), "conveyor")
    }

    #[test]
    fn test_rising_edge_queues_once() {
        let conveyor = ConveyorMonitor::new();
        conveyor.ingest_breakbeam(true, Some(part("assembly_pump_red")));
        conveyor.ingest_breakbeam(true, Some(part("assembly_pump_red")));
        assert_eq!(conveyor.pending(), 1);

        conveyor.ingest_breakbeam(false, None);
        conveyor.ingest_breakbeam(true, Some(part("assembly_battery_blue")));
        assert_eq!(conveyor.pending(), 2);
    }

    #[test]
    fn test_take_needs_proximity() {
        let conveyor = ConveyorMonitor::new();
        conveyor.ingest_breakbeam(true, Some(part("assembly_sensor_green")));
        assert!(conveyor.take_ready().is_none());

        conveyor.ingest_proximity(true);
        let taken = conveyor.take_ready().unwrap();
        assert_eq!(taken.part_type, "assembly_sensor_green");
        assert_eq!(conveyor.pending(), 0);
        assert!(conveyor.take_ready().is_none());
    }

    #[test]
    fn test_arrivals_come_out_in_order() {
        let conveyor = ConveyorMonitor::new();
        for part_type in ["a", "b"] {
            conveyor.ingest_breakbeam(true, Some(part(part_type)));
            conveyor.ingest_breakbeam(false, None);
        }
        conveyor.ingest_proximity(true);
        assert_eq!(conveyor.take_ready().unwrap().part_type, "a");
        assert_eq!(conveyor.take_ready().unwrap().part_type, "b");
    }

    #[test]
    fn test_beam_without_reading_is_ignored() {
        let conveyor = ConveyorMonitor::new();
        conveyor.ingest_breakbeam(true, None);
        assert_eq!(conveyor.pending(), 0);
    }
}
