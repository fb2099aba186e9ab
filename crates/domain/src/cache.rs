//! Last-known device data, each field stamped independently.
//!
//! Values never expire. A reader decides freshness from `updated_at`.

use chrono::Duration;
use serde::{Deserialize, Serialize};

use crate::session::IrrigationRecord;
use crate::state::OperationState;
use crate::time::Timestamp;

/// A value together with the time it was observed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Stamped<T> {
    pub value: T,
    pub updated_at: Timestamp,
}

impl<T> Stamped<T> {
    #[must_use]
    pub fn new(value: T, updated_at: Timestamp) -> Self {
        Self { value, updated_at }
    }

    /// How old the value is at `now`.
    #[must_use]
    pub fn age(&self, now: Timestamp) -> Duration {
        now - self.updated_at
    }
}

/// Valve position as last read from the device.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct ValveReading {
    pub open: bool,
    pub remaining_seconds: Option<u32>,
}

/// Everything known about the device without opening a connection.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct CachedStatus {
    pub battery_percent: Option<Stamped<u8>>,
    pub last_status: Option<Stamped<OperationState>>,
    pub valve: Option<Stamped<ValveReading>>,
    pub last_irrigation: Option<Stamped<IrrigationRecord>>,
}
