//! Irrigation sessions — one confirmed timed-open period.
//!
//! The countdown is a local prediction. It decrements once per tick and can be
//! re-based on the device's own remaining time when a poll reads it.

use std::fmt;
use std::str::FromStr;

use chrono::Duration;
use serde::{Deserialize, Serialize};

use crate::command::IrrigationMinutes;
use crate::time::Timestamp;

/// Unique identifier for an [`IrrigationSession`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct SessionId(uuid::Uuid);

impl Default for SessionId {
    fn default() -> Self {
        Self(uuid::Uuid::new_v4())
    }
}

impl SessionId {
    /// Generate a new random identifier.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }
}

impl fmt::Display for SessionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.0.fmt(f)
    }
}

impl FromStr for SessionId {
    type Err = uuid::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        uuid::Uuid::parse_str(s).map(Self)
    }
}

/// A completed irrigation, kept as the "last irrigation" cache entry.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct IrrigationRecord {
    pub ended_at: Timestamp,
    pub duration: IrrigationMinutes,
}

/// An active timed-open period.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct IrrigationSession {
    id: SessionId,
    requested: IrrigationMinutes,
    started_at: Timestamp,
    remaining_seconds: u32,
}

impl IrrigationSession {
    /// Start a session at confirmation time with the full duration remaining.
    #[must_use]
    pub fn start(requested: IrrigationMinutes, started_at: Timestamp) -> Self {
        Self {
            id: SessionId::new(),
            requested,
            started_at,
            remaining_seconds: requested.as_seconds(),
        }
    }

    #[must_use]
    pub fn id(&self) -> SessionId {
        self.id
    }

    #[must_use]
    pub fn requested(&self) -> IrrigationMinutes {
        self.requested
    }

    #[must_use]
    pub fn started_at(&self) -> Timestamp {
        self.started_at
    }

    #[must_use]
    pub fn remaining_seconds(&self) -> u32 {
        self.remaining_seconds
    }

    /// Seconds of the requested duration already consumed.
    #[must_use]
    pub fn elapsed_seconds(&self) -> u32 {
        self.requested.as_seconds() - self.remaining_seconds
    }

    /// Advance the countdown by one second. Returns the new remaining time;
    /// never goes below zero.
    pub fn tick(&mut self) -> u32 {
        self.remaining_seconds = self.remaining_seconds.saturating_sub(1);
        self.remaining_seconds
    }

    /// Re-base the countdown on a remaining time read from the device.
    ///
    /// Values above the requested duration are clamped to it.
    pub fn resync(&mut self, device_remaining_seconds: u32) {
        self.remaining_seconds = device_remaining_seconds.min(self.requested.as_seconds());
    }

    /// Record the session as completed after the elapsed countdown.
    ///
    /// `ended_at` is `started_at` plus the seconds counted down so far, so an
    /// expired session ends exactly one requested duration after it started.
    #[must_use]
    pub fn finish(&self) -> IrrigationRecord {
        IrrigationRecord {
            ended_at: self.started_at + Duration::seconds(i64::from(self.elapsed_seconds())),
            duration: self.requested,
        }
    }
}
