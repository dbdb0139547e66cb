use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::model::Model;

/// One complete reading, produced once per successful poll sweep or
/// per completed push-stream cycle. Immutable once built.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DeviceSnapshot {
    pub ts: DateTime<Utc>,
    pub model: Model,
    pub serial: String,
    pub firmware_version: Option<String>,
    /// Non-negative; non-decreasing across snapshots unless the
    /// firmware resets its hour meter (treated as an anomaly upstream).
    pub runtime_hours: f64,
    pub output_voltage: f64,
    pub output_current: f64,
    pub output_power: f64,
    pub engine_running: bool,
    pub eco_mode: bool,
    pub engine_event: u8,
    pub engine_error: u8,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub fuel: Option<FuelReadings>,
}

/// Model-dependent fuel data. Poll models report level/remaining from
/// the B'4x registers; the push stream also carries raw volume and a
/// discrete gauge level.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct FuelReadings {
    pub level_percent: Option<u8>,
    pub volume_ml: Option<u32>,
    pub remaining_minutes: Option<u16>,
    pub gauge_level: Option<u8>,
}

/// Identification read once per connection.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DeviceIdentity {
    pub address: String,
    pub serial: String,
    pub model: Model,
    pub firmware_version: Option<String>,
}
