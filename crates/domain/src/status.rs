//! Point-in-time view of a controller for display.

use serde::{Deserialize, Serialize};

use crate::cache::{Stamped, ValveReading};
use crate::command::IrrigationMinutes;
use crate::error::FailureReason;
use crate::session::{IrrigationRecord, IrrigationSession};
use crate::state::OperationState;
use crate::time::{Timestamp, format_mm_ss};

/// The active irrigation as shown to a user.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SessionView {
    pub requested: IrrigationMinutes,
    pub started_at: Timestamp,
    pub remaining_seconds: u32,
    /// `MM:SS`.
    pub remaining: String,
}

impl From<&IrrigationSession> for SessionView {
    fn from(session: &IrrigationSession) -> Self {
        Self {
            requested: session.requested(),
            started_at: session.started_at(),
            remaining_seconds: session.remaining_seconds(),
            remaining: format_mm_ss(session.remaining_seconds()),
        }
    }
}

/// Everything the status display needs, without touching the device.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StatusSnapshot {
    pub name: String,
    pub address: String,
    pub state: OperationState,
    pub last_failure: Option<FailureReason>,
    pub session: Option<SessionView>,
    pub valve: Option<Stamped<ValveReading>>,
    pub battery_percent: Option<Stamped<u8>>,
    pub last_irrigation: Option<Stamped<IrrigationRecord>>,
    pub scanning: bool,
    /// Duration used by a plain open; `None` means untimed.
    pub default_duration: Option<IrrigationMinutes>,
    pub consecutive_failures: u32,
    pub reachable: bool,
    pub last_seen: Option<Timestamp>,
    pub last_poll: Option<Timestamp>,
}

impl StatusSnapshot {
    /// Remaining time as `MM:SS`, `00:00` without a session.
    #[must_use]
    pub fn remaining(&self) -> String {
        self.session
            .as_ref()
            .map_or_else(|| format_mm_ss(0), |s| s.remaining.clone())
    }
}
