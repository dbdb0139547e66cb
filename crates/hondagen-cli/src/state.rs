use std::collections::BTreeMap;
use std::fs;
use std::path::Path;

use anyhow::{Context, Result};
use chrono::NaiveDate;
use hondagen_core::{
    DeviceSnapshot, MaintenanceTracker, Model, Schedule, ServiceKind, ServiceRecord,
};
use serde::{Deserialize, Serialize};
use tracing::debug;

/// Everything the daemon needs to survive a restart: the last known
/// hour meter, the service history and the last full reading. Written
/// through on every snapshot and every recorded service.
#[derive(Debug, Default, Serialize, Deserialize)]
pub struct PersistedState {
    pub serial: Option<String>,
    pub observed_hours: Option<f64>,
    pub first_seen: Option<NaiveDate>,
    #[serde(default)]
    pub records: BTreeMap<ServiceKind, ServiceRecord>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_snapshot: Option<DeviceSnapshot>,
}

impl PersistedState {
    /// A missing file is a fresh install, not an error.
    pub fn load(path: &Path) -> Result<Self> {
        if !path.exists() {
            debug!(path = %path.display(), "no state file, starting fresh");
            return Ok(Self::default());
        }
        let raw = fs::read_to_string(path)
            .with_context(|| format!("reading state file {}", path.display()))?;
        serde_json::from_str(&raw)
            .with_context(|| format!("parsing state file {}", path.display()))
    }

    pub fn save(&self, path: &Path) -> Result<()> {
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)?;
        }
        fs::write(path, serde_json::to_vec_pretty(self)?)
            .with_context(|| format!("writing state file {}", path.display()))
    }

    /// Rebuild a tracker from persisted history. The model comes from
    /// the stored serial so offline evaluation uses the right schedule.
    pub fn into_tracker(self, today: NaiveDate) -> MaintenanceTracker {
        let model = self
            .serial
            .as_deref()
            .map(Model::from_serial)
            .unwrap_or(Model::Unknown);
        let mut tracker = MaintenanceTracker::new(Schedule::for_model(model));
        tracker.load_records(self.records);
        if let Some(hours) = self.observed_hours {
            tracker.load_observed_hours(hours, self.first_seen.unwrap_or(today));
        }
        tracker
    }

    pub fn capture(
        tracker: &MaintenanceTracker,
        serial: &str,
        today: NaiveDate,
        last_snapshot: Option<DeviceSnapshot>,
    ) -> Self {
        Self {
            serial: Some(serial.to_string()),
            observed_hours: tracker.observed_hours(),
            first_seen: Some(tracker.first_seen().unwrap_or(today)),
            records: tracker.records().clone(),
            last_snapshot,
        }
    }
}
