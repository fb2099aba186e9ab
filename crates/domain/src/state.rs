//! Operation state machine for one controller.
//!
//! Exactly one [`OperationState`] is current. Transitions not listed in the
//! table below are rejected with [`StateError::InvalidTransition`]:
//!
//! | From | To | Trigger |
//! |------|----|---------|
//! | Idle | Connecting | command issued or poll due |
//! | Error | Connecting | new command after a failure |
//! | Connecting | Opening / Closing | link up, valve command sent |
//! | Connecting | Confirmed | link up, query-only poll answered |
//! | Connecting | Error | connect retries exhausted |
//! | Opening / Closing | Confirmed | Ack and matching status read |
//! | Opening / Closing | Error | Nack, mismatch, timeout |
//! | Confirmed | Idle | settle delay elapsed |
//! | Error | Idle | failure acknowledged by the next check |

use std::fmt;

use serde::{Deserialize, Serialize};

use crate::error::{FailureReason, StateError};

/// What the controller believes the valve operation is doing right now.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
pub enum OperationState {
    #[default]
    Idle,
    Connecting,
    Opening,
    Closing,
    Confirmed,
    Error,
}

impl OperationState {
    /// Fixed display label.
    #[must_use]
    pub fn label(self) -> &'static str {
        match self {
            Self::Idle => "Idle",
            Self::Connecting => "Connecting",
            Self::Opening => "Opening",
            Self::Closing => "Closing",
            Self::Confirmed => "Confirmed",
            Self::Error => "Error",
        }
    }

    /// A hardware operation is in flight.
    #[must_use]
    pub fn is_in_flight(self) -> bool {
        matches!(
            self,
            Self::Connecting | Self::Opening | Self::Closing | Self::Confirmed
        )
    }

    /// Whether `self -> to` appears in the transition table.
    #[must_use]
    pub fn can_transition_to(self, to: Self) -> bool {
        use OperationState::{Closing, Confirmed, Connecting, Error, Idle, Opening};
        matches!(
            (self, to),
            (Idle | Error, Connecting)
                | (Connecting, Opening | Closing | Confirmed | Error)
                | (Opening | Closing, Confirmed | Error)
                | (Confirmed | Error, Idle)
        )
    }
}

impl fmt::Display for OperationState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.label())
    }
}

/// A transition that was applied.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Transition {
    pub from: OperationState,
    pub to: OperationState,
}

/// Guarded holder of the current [`OperationState`].
#[derive(Debug, Clone, Default)]
pub struct StateMachine {
    current: OperationState,
    last_failure: Option<FailureReason>,
}

impl StateMachine {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    #[must_use]
    pub fn current(&self) -> OperationState {
        self.current
    }

    /// Reason for the most recent failure, kept until an operation is
    /// confirmed.
    #[must_use]
    pub fn last_failure(&self) -> Option<FailureReason> {
        self.last_failure
    }

    /// Start a hardware operation.
    ///
    /// # Errors
    ///
    /// Returns [`StateError::Conflict`] while another operation is in flight.
    pub fn begin(&mut self) -> Result<Transition, StateError> {
        if self.current.is_in_flight() {
            return Err(StateError::Conflict {
                current: self.current,
            });
        }
        self.transition(OperationState::Connecting)
    }

    /// Apply a transition from the table.
    ///
    /// Reaching [`OperationState::Confirmed`] clears the recorded failure.
    ///
    /// # Errors
    ///
    /// Returns [`StateError::InvalidTransition`] for anything not in the
    /// table; the current state is left unchanged.
    pub fn transition(&mut self, to: OperationState) -> Result<Transition, StateError> {
        let from = self.current;
        if !from.can_transition_to(to) {
            return Err(StateError::InvalidTransition { from, to });
        }
        self.current = to;
        if to == OperationState::Confirmed {
            self.last_failure = None;
        }
        Ok(Transition { from, to })
    }

    /// Move to [`OperationState::Error`] and record why.
    ///
    /// # Errors
    ///
    /// Returns [`StateError::InvalidTransition`] when no operation is in a
    /// state that can fail.
    pub fn fail(&mut self, reason: FailureReason) -> Result<Transition, StateError> {
        let transition = self.transition(OperationState::Error)?;
        self.last_failure = Some(reason);
        Ok(transition)
    }

    /// Return from Error to Idle. No-op in any other state.
    pub fn clear_error(&mut self) -> Option<Transition> {
        if self.current == OperationState::Error {
            self.transition(OperationState::Idle).ok()
        } else {
            None
        }
    }
}
