//! Events emitted by the valve service for status consumers.

use serde::{Deserialize, Serialize};

use crate::cache::CachedStatus;
use crate::error::FailureReason;
use crate::session::{IrrigationRecord, SessionId};
use crate::state::OperationState;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ValveEvent {
    StateChanged {
        from: OperationState,
        to: OperationState,
        /// Set when `to` is [`OperationState::Error`].
        reason: Option<FailureReason>,
    },
    /// One second of an irrigation countdown elapsed.
    Tick {
        session: SessionId,
        remaining_seconds: u32,
    },
    ScanningChanged {
        enabled: bool,
    },
    IrrigationFinished {
        record: IrrigationRecord,
    },
    CacheUpdated {
        cache: CachedStatus,
    },
}
