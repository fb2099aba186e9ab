//! Error taxonomy shared across the workspace.
//!
//! Each concern has its own typed error and folds into [`ValveError`] via
//! `#[from]`. No variant carries a free-form `String`.

use serde::{Deserialize, Serialize};

use crate::protocol::NackReason;
use crate::state::OperationState;

/// Top-level error for any valve operation.
#[derive(Debug, thiserror::Error)]
pub enum ValveError {
    #[error("connection error")]
    Conn(#[from] ConnError),

    #[error("protocol error")]
    Protocol(#[from] ProtocolError),

    #[error("state error")]
    State(#[from] StateError),

    #[error("validation error")]
    Validation(#[from] ValidationError),
}

/// Link-level failures surfaced by the connection manager.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ConnError {
    /// Every connect attempt failed or timed out.
    #[error("device unreachable after {attempts} connect attempts")]
    Unreachable {
        /// Number of attempts made before giving up.
        attempts: u32,
    },

    /// A send/receive exchange exceeded the command timeout.
    #[error("command exchange timed out")]
    Timeout,

    /// The link failed in the middle of an exchange.
    #[error("link dropped during exchange")]
    Dropped,
}

/// Why a frame could not be decoded.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum FrameError {
    #[error("frame is {actual} bytes, shorter than the {minimum}-byte envelope")]
    TooShort { actual: usize, minimum: usize },

    #[error("bad start marker 0x{0:02X}")]
    BadStartMarker(u8),

    #[error("bad end marker 0x{0:02X}")]
    BadEndMarker(u8),

    #[error("length byte says {declared} payload bytes, frame carries {actual}")]
    LengthMismatch { declared: usize, actual: usize },

    #[error("opcode 0x{opcode:02X} expects {expected} payload bytes, got {actual}")]
    PayloadLength {
        opcode: u8,
        expected: usize,
        actual: usize,
    },

    #[error("unknown opcode 0x{0:02X}")]
    UnknownOpcode(u8),

    #[error("field {field} out of range: {value}")]
    OutOfRange { field: &'static str, value: u32 },
}

/// Failures decoding or interpreting device responses.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ProtocolError {
    #[error("malformed frame")]
    Malformed(#[from] FrameError),

    #[error("unsupported opcode 0x{opcode:02X}")]
    Unsupported { opcode: u8 },

    #[error("device rejected command: {0}")]
    Nack(NackReason),

    #[error("unexpected response, expected {expected}")]
    Unexpected { expected: &'static str },
}

/// Violations of the operation state machine.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum StateError {
    /// A hardware operation is already in flight.
    #[error("operation already in flight (state {current})")]
    Conflict { current: OperationState },

    /// The device acknowledged a command but reports a different valve state.
    #[error("device reports valve open={reported_open}, expected open={expected_open}")]
    ConfirmationMismatch {
        expected_open: bool,
        reported_open: bool,
    },

    #[error("transition {from} -> {to} is not allowed")]
    InvalidTransition {
        from: OperationState,
        to: OperationState,
    },
}

/// Input validation failures.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ValidationError {
    #[error("duration {minutes} min outside {min}..={max}")]
    DurationOutOfRange { minutes: u32, min: u32, max: u32 },

    #[error("invalid BLE address")]
    InvalidAddress,

    #[error("advertised name does not match the vendor filter")]
    NameMismatch,
}

/// Display-facing projection of a [`ValveError`].
///
/// Kept separate so the status output can be serialised and compared without
/// carrying error sources around.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FailureReason {
    Unreachable,
    Timeout,
    LinkDropped,
    Malformed,
    Unsupported,
    Nack,
    UnexpectedResponse,
    ConfirmationMismatch,
    Conflict,
    InvalidTransition,
    InvalidInput,
}

impl FailureReason {
    /// Connectivity failures, as opposed to protocol or logic failures.
    #[must_use]
    pub fn is_connectivity(self) -> bool {
        matches!(self, Self::Unreachable | Self::Timeout | Self::LinkDropped)
    }
}

impl std::fmt::Display for FailureReason {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let label = match self {
            Self::Unreachable => "unreachable",
            Self::Timeout => "timeout",
            Self::LinkDropped => "link dropped",
            Self::Malformed => "malformed response",
            Self::Unsupported => "unsupported response",
            Self::Nack => "rejected by device",
            Self::UnexpectedResponse => "unexpected response",
            Self::ConfirmationMismatch => "confirmation mismatch",
            Self::Conflict => "operation in flight",
            Self::InvalidTransition => "invalid transition",
            Self::InvalidInput => "invalid input",
        };
        f.write_str(label)
    }
}

impl From<&ValveError> for FailureReason {
    fn from(err: &ValveError) -> Self {
        match err {
            ValveError::Conn(ConnError::Unreachable { .. }) => Self::Unreachable,
            ValveError::Conn(ConnError::Timeout) => Self::Timeout,
            ValveError::Conn(ConnError::Dropped) => Self::LinkDropped,
            ValveError::Protocol(ProtocolError::Malformed(_)) => Self::Malformed,
            ValveError::Protocol(ProtocolError::Unsupported { .. }) => Self::Unsupported,
            ValveError::Protocol(ProtocolError::Nack(_)) => Self::Nack,
            ValveError::Protocol(ProtocolError::Unexpected { .. }) => Self::UnexpectedResponse,
            ValveError::State(StateError::Conflict { .. }) => Self::Conflict,
            ValveError::State(StateError::ConfirmationMismatch { .. }) => {
                Self::ConfirmationMismatch
            }
            ValveError::State(StateError::InvalidTransition { .. }) => Self::InvalidTransition,
            ValveError::Validation(_) => Self::InvalidInput,
        }
    }
}
