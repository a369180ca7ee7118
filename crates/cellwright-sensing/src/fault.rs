use cellwright_core::{DetectedInstance, FaultRecord};
use parking_lot::RwLock;
use std::collections::HashMap;
use std::sync::Arc;
use tracing::{debug, info, warn};

/// Defect inspection, one sensor per delivery vehicle.
///
/// A non-empty reading on a vehicle's sensor means the part on that
/// vehicle's tray is defective. Readings are stored with the same overwrite
/// semantics as the vision channels; [`poll`](Self::poll) turns the current
/// readings into [`FaultRecord`]s.
pub struct FaultMonitor {
    vehicles: Vec<String>,
    readings: RwLock<HashMap<String, Arc<[DetectedInstance]>>>,
    records: RwLock<Vec<FaultRecord>>,
}

impl FaultMonitor {
    /// Monitor the inspection sensors of the given vehicles.
    pub fn new(vehicle_ids: impl IntoIterator<Item = impl Into<String>>) -> Self {
        Self {
            vehicles: vehicle_ids.into_iter().map(Into::into).collect(),
            readings: RwLock::new(HashMap::new()),
            records: RwLock::new(Vec::new()),
        }
    }

    /// Monitored vehicles in registration order.
    pub fn vehicles(&self) -> &[String] {
        &self.vehicles
    }

    /// Replace the latest reading of a vehicle's inspection sensor.
    pub fn ingest(&self, vehicle_id: &str, batch: Vec<DetectedInstance>) {
        if !self.vehicles.iter().any(|v| v == vehicle_id) {
            warn!(vehicle = %vehicle_id, "Inspection reading from unknown vehicle");
        }
        if !batch.is_empty() {
            debug!(vehicle = %vehicle_id, count = batch.len(), "Defect reading");
        }
        self.readings
            .write()
            .insert(vehicle_id.to_string(), batch.into());
    }

    /// Derive fault records from the current readings, vehicle order first.
    pub fn poll(&self) -> Vec<FaultRecord> {
        let readings = self.readings.read();
        let mut ids: Vec<&String> = self.vehicles.iter().collect();
        let mut extra: Vec<&String> = readings
            .keys()
            .filter(|id| !self.vehicles.contains(*id))
            .collect();
        extra.sort();
        ids.extend(extra);

        let records: Vec<FaultRecord> = ids
            .into_iter()
            .filter_map(|id| readings.get(id).map(|batch| (id, batch)))
            .flat_map(|(id, batch)| {
                batch.iter().map(move |d| FaultRecord {
                    part_type: d.part_type.clone(),
                    world_pose: d.world_pose,
                    vehicle_id: id.clone(),
                })
            })
            .collect();
        drop(readings);

        *self.records.write() = records.clone();
        records
    }

    /// Records produced by the last [`poll`](Self::poll).
    pub fn records(&self) -> Vec<FaultRecord> {
        self.records.read().clone()
    }

    /// Forget the reading behind a record once the part was removed.
    ///
    /// The sensor will report again on its next callback; until then the
    /// record must not be matched a second time.
    pub fn acknowledge(&self, record: &FaultRecord) {
        let mut readings = self.readings.write();
        if let Some(batch) = readings.get_mut(&record.vehicle_id) {
            let position = batch.iter().position(|d| {
                d.world_pose == record.world_pose
                    && (d.part_type == record.part_type || record.part_type.is_empty())
            });
            if let Some(i) = position {
                let mut remaining = batch.to_vec();
                remaining.remove(i);
                *batch = remaining.into();
            }
        }
        drop(readings);
        self.records.write().retain(|r| r != record);
        info!(vehicle = %record.vehicle_id, part_type = %record.part_type, "Fault cleared");
    }

    /// The record that concerns `part_type` on `vehicle_id`, if any.
    ///
    /// Records on other vehicles never match. An exact part-type match wins;
    /// otherwise a record that does not name its part type is taken.
    pub fn match_for<'a>(
        records: &'a [FaultRecord],
        vehicle_id: &str,
        part_type: &str,
    ) -> Option<&'a FaultRecord> {
        let on_vehicle = || records.iter().filter(move |r| r.vehicle_id == vehicle_id);
        on_vehicle()
            .find(|r| r.part_type == part_type)
            .or_else(|| on_vehicle().find(|r| r.part_type.is_empty()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use cellwright_core::Pose;

    fn defect(part_type: &str, x: f64) -> DetectedInstance {
        let pose = Pose::from_translation([x, 0.0, 0.0]);
        DetectedInstance::new(part_type, pose, pose, "quality_control_sensor")
    }

    #[test]
    fn test_empty_readings_produce_no_records() {
        let monitor = FaultMonitor::new(["agv1", "agv2"]);
        assert!(monitor.poll().is_empty());
        monitor.ingest("agv1", Vec::new());
        assert!(monitor.poll().is_empty());
    }

    #[test]
    fn test_poll_keys_records_by_vehicle() {
        let monitor = FaultMonitor::new(["agv1", "agv2"]);
        monitor.ingest("agv2", vec![defect("assembly_pump_red", 1.0)]);
        monitor.ingest("agv1", vec![defect("assembly_battery_blue", 2.0)]);
        let records = monitor.poll();
        assert_eq!(records.len(), 2);
        assert_eq!(records[0].vehicle_id, "agv1");
        assert_eq!(records[1].vehicle_id, "agv2");
        assert_eq!(monitor.records(), records);
    }

    #[test]
    fn test_match_disambiguates_by_vehicle() {
        let records = vec![
            FaultRecord {
                part_type: "assembly_pump_red".into(),
                world_pose: Pose::identity(),
                vehicle_id: "agv1".into(),
            },
            FaultRecord {
                part_type: "assembly_pump_red".into(),
                world_pose: Pose::from_translation([1.0, 0.0, 0.0]),
                vehicle_id: "agv2".into(),
            },
        ];
        let hit = FaultMonitor::match_for(&records, "agv2", "assembly_pump_red").unwrap();
        assert_eq!(hit.world_pose.position, [1.0, 0.0, 0.0]);
        assert!(FaultMonitor::match_for(&records, "agv3", "assembly_pump_red").is_none());
        assert!(FaultMonitor::match_for(&records, "agv1", "assembly_sensor_green").is_none());
    }

    #[test]
    fn test_match_accepts_unnamed_record() {
        let records = vec![FaultRecord {
            part_type: String::new(),
            world_pose: Pose::identity(),
            vehicle_id: "agv1".into(),
        }];
        assert!(FaultMonitor::match_for(&records, "agv1", "assembly_pump_red").is_some());
    }

    #[test]
    fn test_acknowledge_clears_record() {
        let monitor = FaultMonitor::new(["agv1"]);
        monitor.ingest(
            "agv1",
            vec![defect("assembly_pump_red", 1.0), defect("assembly_pump_red", 2.0)],
        );
        let records = monitor.poll();
        monitor.acknowledge(&records[0]);
        assert_eq!(monitor.records().len(), 1);

        let after = monitor.poll();
        assert_eq!(after.len(), 1);
        assert_eq!(after[0].world_pose.position, [2.0, 0.0, 0.0]);
    }
}
