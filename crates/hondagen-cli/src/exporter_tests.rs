use crate::exporter::{prune_old_log_files, ExportState};
use chrono::{TimeZone, Utc};
use hondagen_core::{DeviceSnapshot, Model};
use std::env;
use std::fs;
use std::path::PathBuf;
use std::time::SystemTime;

fn make_temp_dir(name: &str) -> PathBuf {
    let mut path = env::temp_dir();
    let uniq = SystemTime::now()
        .duration_since(SystemTime::UNIX_EPOCH)
        .expect("unix epoch")
        .as_nanos();
    path.push(format!("hondagen-tests-{name}-{uniq}"));
    fs::create_dir_all(&path).expect("create temp dir");
    path
}

fn snapshot() -> DeviceSnapshot {
    DeviceSnapshot {
        ts: Utc::now(),
        model: Model::Eu7000is,
        serial: "EEJD-1234567".into(),
        firmware_version: Some("1.2.3.4".into()),
        runtime_hours: 42.0,
        output_voltage: 120.0,
        output_current: 12.3,
        output_power: 1000.0,
        engine_running: true,
        eco_mode: false,
        engine_event: 0,
        engine_error: 0,
        fuel: None,
    }
}

#[test]
fn prune_removes_only_old_log_files() {
    // Arrange
    let dir = make_temp_dir("old-vs-fresh");
    let old_log = dir.join("hondagen-2026-05-01.jsonl");
    let fresh_log = dir.join("hondagen-2026-08-20.jsonl");
    let unrelated = dir.join("notes.txt");
    fs::write(&old_log, "old").expect("write old log");
    fs::write(&fresh_log, "fresh").expect("write fresh log");
    fs::write(&unrelated, "keep").expect("write unrelated");

    let now: SystemTime = Utc
        .with_ymd_and_hms(2026, 8, 29, 0, 0, 0)
        .single()
        .expect("valid date")
        .into();

    // Act
    prune_old_log_files(&dir, 90, now).expect("prune");

    // Assert
    assert!(!old_log.exists(), "old log should be pruned");
    assert!(fresh_log.exists(), "fresh log should be kept");
    assert!(unrelated.exists(), "non-log file should never be pruned");

    let _ = fs::remove_dir_all(dir);
}

#[test]
fn prune_keeps_boundary_age_log_file() {
    // Arrange
    let dir = make_temp_dir("boundary");
    let boundary_log = dir.join("hondagen-2026-05-31.jsonl");
    fs::write(&boundary_log, "boundary").expect("write boundary log");

    let now: SystemTime = Utc
        .with_ymd_and_hms(2026, 8, 29, 0, 0, 0)
        .single()
        .expect("valid date")
        .into();

    // Act
    prune_old_log_files(&dir, 90, now).expect("prune");

    // Assert
    assert!(
        boundary_log.exists(),
        "log exactly on retention boundary should be kept"
    );

    let _ = fs::remove_dir_all(dir);
}

#[test]
fn write_snapshot_appends_jsonl_and_latest() {
    let dir = make_temp_dir("write");
    let mut state = ExportState::new(dir.clone(), 90).expect("export state");

    state.write_snapshot(&snapshot(), 0).expect("first write");
    state.write_snapshot(&snapshot(), 2).expect("second write");

    let day = Utc::now().format("%Y-%m-%d").to_string();
    let log = fs::read_to_string(dir.join(format!("hondagen-{day}.jsonl"))).expect("read log");
    assert_eq!(log.lines().count(), 2);

    let latest: serde_json::Value =
        serde_json::from_str(&fs::read_to_string(dir.join("latest.json")).expect("read latest"))
            .expect("parse latest");
    assert_eq!(latest["serial"], "EEJD-1234567");
    assert_eq!(latest["services_due"], 2);
    assert_eq!(latest["metrics"]["runtime_hours"], 42.0);

    let _ = fs::remove_dir_all(dir);
}
