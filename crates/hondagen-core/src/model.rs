use serde::{Deserialize, Serialize};

/// Generator communication architecture, selected once from the
/// advertised-name prefix at connection establishment.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Architecture {
    /// Request-response diagnostic reads on a fixed interval.
    Poll,
    /// Continuous CAN data stream pushed by the generator.
    Push,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub enum Model {
    Eu2200i,
    Eu3200i,
    Em5000sx,
    Em6500sx,
    Eu7000is,
    Unknown,
}

impl Model {
    pub fn as_str(&self) -> &'static str {
        match self {
            Model::Eu2200i => "EU2200i",
            Model::Eu3200i => "EU3200i",
            Model::Em5000sx => "EM5000SX",
            Model::Em6500sx => "EM6500SX",
            Model::Eu7000is => "EU7000is",
            Model::Unknown => "Unknown",
        }
    }

    /// Map a serial number to a model via its 4-character prefix.
    /// Serials look like "EBKJ-1234567"; bare prefixes are accepted too.
    /// Arbitrary advertised names pass through here, so the prefix cut
    /// must not assume char boundaries.
    pub fn from_serial(serial: &str) -> Model {
        let prefix = serial
            .split_once('-')
            .map(|(p, _)| p)
            .unwrap_or_else(|| serial.get(..4).unwrap_or(serial));
        match prefix {
            "EAMT" => Model::Eu2200i,
            "EBKJ" => Model::Eu3200i,
            "EBMC" => Model::Em5000sx,
            "EBJC" => Model::Em6500sx,
            "EEJD" => Model::Eu7000is,
            _ => Model::Unknown,
        }
    }

    pub fn spec(&self) -> ModelSpec {
        match self {
            Model::Eu2200i => ModelSpec {
                max_power_watts: 2200,
                fuel_tank_liters: 3.6,
                remote_start: false,
                fuel_sensor: false,
                eco_control: false,
                architecture: Architecture::Poll,
            },
            Model::Eu3200i => ModelSpec {
                max_power_watts: 3200,
                fuel_tank_liters: 4.7,
                remote_start: false,
                fuel_sensor: true,
                eco_control: false,
                architecture: Architecture::Push,
            },
            Model::Em5000sx => ModelSpec {
                max_power_watts: 5000,
                fuel_tank_liters: 23.47,
                remote_start: true,
                fuel_sensor: false,
                eco_control: true,
                architecture: Architecture::Poll,
            },
            Model::Em6500sx => ModelSpec {
                max_power_watts: 6500,
                fuel_tank_liters: 23.47,
                remote_start: true,
                fuel_sensor: false,
                eco_control: true,
                architecture: Architecture::Poll,
            },
            Model::Eu7000is => ModelSpec {
                max_power_watts: 7000,
                fuel_tank_liters: 19.31,
                remote_start: true,
                fuel_sensor: true,
                eco_control: false,
                architecture: Architecture::Poll,
            },
            Model::Unknown => ModelSpec {
                max_power_watts: 0,
                fuel_tank_liters: 0.0,
                remote_start: false,
                fuel_sensor: false,
                eco_control: false,
                architecture: Architecture::Poll,
            },
        }
    }
}

impl std::fmt::Display for Model {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Static per-model capability table consulted by callers and drivers.
#[derive(Debug, Clone, Copy)]
pub struct ModelSpec {
    pub max_power_watts: u32,
    pub fuel_tank_liters: f64,
    pub remote_start: bool,
    pub fuel_sensor: bool,
    pub eco_control: bool,
    pub architecture: Architecture,
}

/// The BLE advertised name is the serial prefix. Unknown prefixes
/// default to Poll.
pub fn architecture_for_device_name(name: Option<&str>) -> Architecture {
    match name {
        Some(n) if n.starts_with("EBKJ") => Architecture::Push,
        _ => Architecture::Poll,
    }
}

pub fn engine_event_label(code: u8) -> &'static str {
    match code {
        0 => "no_event",
        1 => "engine_start",
        2 => "engine_stop",
        3 => "error",
        4 => "voltage_drop",
        _ => "unknown",
    }
}

pub fn engine_error_label(code: u8) -> &'static str {
    match code {
        0 => "no_error",
        1 => "co_detected",
        2 => "stop_failure",
        3 => "continuous_restarting",
        5 => "starting_circuit_fault",
        _ => "unknown",
    }
}
