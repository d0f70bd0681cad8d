//! Core data models for the fleet liveness agent

use std::fmt;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

/// Probe interval assigned to devices that do not specify one
pub const DEFAULT_INTERVAL_SECS: u64 = 60;

/// Longest probe interval accepted anywhere: one day
pub const MAX_INTERVAL_SECS: u64 = 86_400;

/// Reject intervals the scheduler cannot run
pub fn check_interval(interval_secs: u64) -> Result<(), String> {
    if interval_secs == 0 {
        return Err("probe interval must be at least one second".to_string());
    }
    if interval_secs > MAX_INTERVAL_SECS {
        return Err(format!(
            "probe interval {interval_secs}s exceeds the {MAX_INTERVAL_SECS}s maximum"
        ));
    }
    Ok(())
}

fn default_interval() -> u64 {
    DEFAULT_INTERVAL_SECS
}

/// A registered network endpoint probed for reachability
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Device {
    pub id: String,
    pub name: String,
    pub address: String,
    pub interval_secs: u64,
    /// Interval the device had before its most recent period change
    pub prev_interval_secs: u64,
    /// Set when the record changed out of band and the scheduler has not applied it yet
    pub dirty: bool,
    pub last_seen: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
    pub updated_at: Option<DateTime<Utc>>,
}

impl Device {
    pub fn interval(&self) -> Duration {
        Duration::from_secs(self.interval_secs)
    }
}

/// Attributes required to register a device
///
/// Remote commands and CSV imports use different field names for the same
/// attributes, so the aliases are accepted on input.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NewDevice {
    #[serde(alias = "identifier")]
    pub id: String,
    pub name: String,
    #[serde(alias = "ip")]
    pub address: String,
    #[serde(alias = "ping_period", alias = "interval", default = "default_interval")]
    pub interval_secs: u64,
}

impl NewDevice {
    pub fn new(id: impl Into<String>, name: impl Into<String>, address: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            name: name.into(),
            address: address.into(),
            interval_secs: DEFAULT_INTERVAL_SECS,
        }
    }

    pub fn with_interval(mut self, interval_secs: u64) -> Self {
        self.interval_secs = interval_secs;
        self
    }

    /// Reject records the scheduler cannot probe
    pub fn validate(&self) -> Result<(), String> {
        if self.id.trim().is_empty() {
            return Err("device id must not be empty".to_string());
        }
        if self.name.trim().is_empty() {
            return Err("device name must not be empty".to_string());
        }
        if self.address.trim().is_empty() {
            return Err("device address must not be empty".to_string());
        }
        check_interval(self.interval_secs)
    }
}

/// Identity changes for an existing device; absent fields are left untouched
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct DeviceUpdate {
    pub id: Option<String>,
    pub name: Option<String>,
    pub address: Option<String>,
}

impl DeviceUpdate {
    pub fn is_empty(&self) -> bool {
        self.id.is_none() && self.name.is_none() && self.address.is_none()
    }

    /// Apply the changes onto a copy of `device`
    pub fn merge_into(&self, device: &Device) -> Device {
        let mut merged = device.clone();
        if let Some(id) = &self.id {
            merged.id = id.clone();
        }
        if let Some(name) = &self.name {
            merged.name = name.clone();
        }
        if let Some(address) = &self.address {
            merged.address = address.clone();
        }
        merged
    }
}

/// Outcome of one reachability probe
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Liveness {
    Up,
    Down,
}

impl Liveness {
    pub fn is_up(self) -> bool {
        matches!(self, Liveness::Up)
    }

    /// Wire encoding used in telemetry payloads
    pub fn as_flag(self) -> u8 {
        match self {
            Liveness::Up => 1,
            Liveness::Down => 0,
        }
    }
}

impl fmt::Display for Liveness {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Liveness::Up => write!(f, "up"),
            Liveness::Down => write!(f, "down"),
        }
    }
}

/// Fleet-wide liveness counts
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct FleetTotals {
    pub total: usize,
    pub online: usize,
    pub offline: usize,
}

/// A timestamped set of telemetry values for one device
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TelemetryPoint {
    /// Milliseconds since the Unix epoch
    pub ts: i64,
    pub values: Map<String, Value>,
}

impl TelemetryPoint {
    pub fn new(at: DateTime<Utc>) -> Self {
        Self {
            ts: at.timestamp_millis(),
            values: Map::new(),
        }
    }

    pub fn with_value(mut self, key: &str, value: impl Into<Value>) -> Self {
        self.values.insert(key.to_string(), value.into());
        self
    }

    pub fn liveness(at: DateTime<Utc>, liveness: Liveness) -> Self {
        Self::new(at).with_value("online", liveness.as_flag())
    }

    pub fn totals(at: DateTime<Utc>, totals: &FleetTotals) -> Self {
        Self::new(at)
            .with_value("total devices", totals.total)
            .with_value("active devices", totals.online)
            .with_value("inactive devices", totals.offline)
    }
}
