#![allow(clippy::unwrap_used, clippy::expect_used)]

use cellwright_core::*;
use uuid::Uuid;

// ---------------------------------------------------------------------------
// 1. Event stream serialization
// ---------------------------------------------------------------------------

#[test]
fn event_serialization_roundtrip() {
    let event = CellEvent::now(CellEventKind::ActuatorFailed {
        slot: SlotTag::new("order_0", "order_0_kitting_0", "assembly_sensor_blue"),
        actuator: ActuatorKind::FarRange,
        message: "trajectory aborted".into(),
    });

    let json = serde_json::to_string(&event).unwrap();
    let parsed: CellEvent = serde_json::from_str(&json).unwrap();

    assert_eq!(parsed, event);
    assert!(json.contains("\"type\":\"actuator_failed\""));
    assert!(json.contains("\"actuator\":\"far_range\""));
}

#[test]
fn run_finished_carries_run_id() {
    let run_id = Uuid::new_v4();
    let event: CellEvent = CellEventKind::RunFinished {
        run_id,
        orders_completed: 2,
        items_failed: 0,
    }
    .into();

    let value = serde_json::to_value(&event).unwrap();
    assert_eq!(value["run_id"], run_id.to_string());
    assert_eq!(value["orders_completed"], 2);
}

// ---------------------------------------------------------------------------
// 2. Error conversions
// ---------------------------------------------------------------------------

#[test]
fn json_error_converts() {
    fn parse(raw: &str) -> CellResult<Pose> {
        Ok(serde_json::from_str(raw)?)
    }

    let err = parse("{not json").unwrap_err();
    assert!(matches!(err, CellError::Json(_)));
    assert!(err.to_string().starts_with("JSON error"));
}

#[test]
fn io_error_converts() {
    let io = std::io::Error::new(std::io::ErrorKind::NotFound, "missing");
    let err: CellError = io.into();
    assert!(matches!(err, CellError::Io(_)));
}

// ---------------------------------------------------------------------------
// 3. Sensor-frame to world-frame
// ---------------------------------------------------------------------------

#[test]
fn detection_world_pose_from_mount() {
    let mount = Pose::from_translation([-1.9, 3.38, 1.8]);
    let local = Pose::from_rpy([0.2, -0.1, 0.0], std::f64::consts::PI, 0.0, 0.0);
    let detection = DetectedInstance::new("assembly_pump_red", local, mount.compose(&local), "bins0");

    assert!((detection.world_pose.position[0] - -1.7).abs() < 1e-9);
    assert!((detection.world_pose.position[1] - 3.28).abs() < 1e-9);
    assert!((detection.world_pose.roll().abs() - std::f64::consts::PI).abs() < 1e-9);
}

#[test]
fn fault_record_serialization() {
    let record = FaultRecord {
        part_type: "assembly_battery_green".into(),
        world_pose: Pose::identity(),
        vehicle_id: "agv2".into(),
    };
    let json = serde_json::to_string(&record).unwrap();
    let parsed: FaultRecord = serde_json::from_str(&json).unwrap();
    assert_eq!(parsed, record);
}
