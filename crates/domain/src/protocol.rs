//! Link protocol codec.
//!
//! Pure functions over byte slices — no IO, no state. The core and a
//! transport exchange *link frames*:
//!
//! | Offset | Field | Notes |
//! |--------|-------|-------|
//! | 0 | start marker | `0xA5` |
//! | 1 | opcode | see below |
//! | 2 | payload length | `n` |
//! | 3..3+n | payload | opcode-specific |
//! | 3+n | end marker | `0x5A` |
//!
//! Requests: `0x01` open, `0x02` open timed (`[minutes]`), `0x03` close,
//! `0x10` query status, `0x11` query battery.
//!
//! Responses: `0x80` ack, `0x81` nack (`[reason]`), `0x90` status
//! (`[flags, hours, minutes, seconds]`, flag bit 0 = open), `0x91` battery
//! (`[percent]`). `0x92` (firmware report) is recognised but not handled.
//!
//! The core uses [`encode`] and [`decode`]; transports use the mirror pair
//! [`decode_command`] and [`encode_response`].

use std::fmt;

use serde::{Deserialize, Serialize};

use crate::command::{Command, IrrigationMinutes};
use crate::error::{FrameError, ProtocolError};

pub const START_MARKER: u8 = 0xA5;
pub const END_MARKER: u8 = 0x5A;

const ENVELOPE_LEN: usize = 4;

pub const OP_OPEN: u8 = 0x01;
pub const OP_OPEN_TIMED: u8 = 0x02;
pub const OP_CLOSE: u8 = 0x03;
pub const OP_QUERY_STATUS: u8 = 0x10;
pub const OP_QUERY_BATTERY: u8 = 0x11;

pub const OP_ACK: u8 = 0x80;
pub const OP_NACK: u8 = 0x81;
pub const OP_STATUS_REPORT: u8 = 0x90;
pub const OP_BATTERY_REPORT: u8 = 0x91;
pub const OP_FIRMWARE_REPORT: u8 = 0x92;

const STATUS_OPEN_FLAG: u8 = 0x01;

/// Reason code carried by a Nack.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct NackReason(pub u8);

impl NackReason {
    pub const INVALID_PARAMETER: Self = Self(0x01);
    pub const NOT_PERMITTED: Self = Self(0x03);
    pub const BUSY: Self = Self(0x05);
}

impl fmt::Display for NackReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match *self {
            Self::INVALID_PARAMETER => f.write_str("invalid parameter"),
            Self::NOT_PERMITTED => f.write_str("not permitted"),
            Self::BUSY => f.write_str("busy"),
            Self(code) => write!(f, "code 0x{code:02X}"),
        }
    }
}

/// A decoded inbound message.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Response {
    Ack,
    Nack(NackReason),
    StatusReport {
        open: bool,
        /// Remaining open time the device reports; `None` when it reports
        /// zero.
        remaining_seconds: Option<u32>,
    },
    BatteryReport {
        percent: u8,
    },
}

/// Encode a command as a request frame.
#[must_use]
pub fn encode(command: &Command) -> Vec<u8> {
    match command {
        Command::OpenValve => frame(OP_OPEN, &[]),
        Command::OpenValveTimed(minutes) => {
            // IrrigationMinutes::MAX fits in one byte.
            #[allow(clippy::cast_possible_truncation)]
            let byte = minutes.get() as u8;
            frame(OP_OPEN_TIMED, &[byte])
        }
        Command::CloseValve => frame(OP_CLOSE, &[]),
        Command::QueryStatus => frame(OP_QUERY_STATUS, &[]),
        Command::QueryBattery => frame(OP_QUERY_BATTERY, &[]),
    }
}

/// Decode a response frame.
///
/// # Errors
///
/// Returns [`ProtocolError::Malformed`] when the envelope, length, or payload
/// does not match the format, and [`ProtocolError::Unsupported`] for a
/// recognised opcode that is not a handled response.
pub fn decode(bytes: &[u8]) -> Result<Response, ProtocolError> {
    let (opcode, payload) = unframe(bytes)?;
    match opcode {
        OP_ACK => {
            expect_len(opcode, payload, 0)?;
            Ok(Response::Ack)
        }
        OP_NACK => {
            expect_len(opcode, payload, 1)?;
            Ok(Response::Nack(NackReason(payload[0])))
        }
        OP_STATUS_REPORT => {
            expect_len(opcode, payload, 4)?;
            let open = payload[0] & STATUS_OPEN_FLAG != 0;
            let remaining = hms_to_seconds(payload[1], payload[2], payload[3])?;
            Ok(Response::StatusReport {
                open,
                remaining_seconds: (remaining > 0).then_some(remaining),
            })
        }
        OP_BATTERY_REPORT => {
            expect_len(opcode, payload, 1)?;
            let percent = payload[0];
            if percent > 100 {
                return Err(FrameError::OutOfRange {
                    field: "battery percent",
                    value: u32::from(percent),
                }
                .into());
            }
            Ok(Response::BatteryReport { percent })
        }
        OP_FIRMWARE_REPORT | OP_OPEN | OP_OPEN_TIMED | OP_CLOSE | OP_QUERY_STATUS
        | OP_QUERY_BATTERY => Err(ProtocolError::Unsupported { opcode }),
        other => Err(FrameError::UnknownOpcode(other).into()),
    }
}

/// Decode a request frame (transport side).
///
/// # Errors
///
/// Same classification as [`decode`], with request and response opcodes
/// swapping roles.
pub fn decode_command(bytes: &[u8]) -> Result<Command, ProtocolError> {
    let (opcode, payload) = unframe(bytes)?;
    match opcode {
        OP_OPEN => {
            expect_len(opcode, payload, 0)?;
            Ok(Command::OpenValve)
        }
        OP_OPEN_TIMED => {
            expect_len(opcode, payload, 1)?;
            let minutes = IrrigationMinutes::new(u32::from(payload[0])).map_err(|_| {
                FrameError::OutOfRange {
                    field: "minutes",
                    value: u32::from(payload[0]),
                }
            })?;
            Ok(Command::OpenValveTimed(minutes))
        }
        OP_CLOSE => {
            expect_len(opcode, payload, 0)?;
            Ok(Command::CloseValve)
        }
        OP_QUERY_STATUS => {
            expect_len(opcode, payload, 0)?;
            Ok(Command::QueryStatus)
        }
        OP_QUERY_BATTERY => {
            expect_len(opcode, payload, 0)?;
            Ok(Command::QueryBattery)
        }
        OP_ACK | OP_NACK | OP_STATUS_REPORT | OP_BATTERY_REPORT | OP_FIRMWARE_REPORT => {
            Err(ProtocolError::Unsupported { opcode })
        }
        other => Err(FrameError::UnknownOpcode(other).into()),
    }
}

/// Encode a response frame (transport side).
///
/// Remaining time is split into hours/minutes/seconds; hours saturate at 255.
#[must_use]
pub fn encode_response(response: &Response) -> Vec<u8> {
    match response {
        Response::Ack => frame(OP_ACK, &[]),
        Response::Nack(reason) => frame(OP_NACK, &[reason.0]),
        Response::StatusReport {
            open,
            remaining_seconds,
        } => {
            let flags = if *open { STATUS_OPEN_FLAG } else { 0 };
            let (h, m, s) = seconds_to_hms(remaining_seconds.unwrap_or(0));
            frame(OP_STATUS_REPORT, &[flags, h, m, s])
        }
        Response::BatteryReport { percent } => frame(OP_BATTERY_REPORT, &[*percent]),
    }
}

/// Wrap a payload in the link envelope.
///
/// Payloads are at most a few bytes; anything longer than 255 is truncated
/// by the length byte and would be rejected by [`unframe`].
#[must_use]
pub fn frame(opcode: u8, payload: &[u8]) -> Vec<u8> {
    let len = u8::try_from(payload.len()).unwrap_or(u8::MAX);
    let mut out = Vec::with_capacity(payload.len() + ENVELOPE_LEN);
    out.push(START_MARKER);
    out.push(opcode);
    out.push(len);
    out.extend_from_slice(payload);
    out.push(END_MARKER);
    out
}

fn unframe(bytes: &[u8]) -> Result<(u8, &[u8]), FrameError> {
    if bytes.len() < ENVELOPE_LEN {
        return Err(FrameError::TooShort {
            actual: bytes.len(),
            minimum: ENVELOPE_LEN,
        });
    }
    if bytes[0] != START_MARKER {
        return Err(FrameError::BadStartMarker(bytes[0]));
    }
    let last = bytes[bytes.len() - 1];
    if last != END_MARKER {
        return Err(FrameError::BadEndMarker(last));
    }
    let declared = usize::from(bytes[2]);
    let payload = &bytes[3..bytes.len() - 1];
    if declared != payload.len() {
        return Err(FrameError::LengthMismatch {
            declared,
            actual: payload.len(),
        });
    }
    Ok((bytes[1], payload))
}

fn expect_len(opcode: u8, payload: &[u8], expected: usize) -> Result<(), FrameError> {
    if payload.len() == expected {
        Ok(())
    } else {
        Err(FrameError::PayloadLength {
            opcode,
            expected,
            actual: payload.len(),
        })
    }
}

fn hms_to_seconds(hours: u8, minutes: u8, seconds: u8) -> Result<u32, FrameError> {
    if minutes >= 60 {
        return Err(FrameError::OutOfRange {
            field: "minutes",
            value: u32::from(minutes),
        });
    }
    if seconds >= 60 {
        return Err(FrameError::OutOfRange {
            field: "seconds",
            value: u32::from(seconds),
        });
    }
    Ok(u32::from(hours) * 3600 + u32::from(minutes) * 60 + u32::from(seconds))
}

/// Split seconds into `(hours, minutes, seconds)`, saturating hours at 255.
#[must_use]
pub fn seconds_to_hms(total: u32) -> (u8, u8, u8) {
    let hours = u8::try_from(total / 3600).unwrap_or(u8::MAX);
    // Both remainders are below 60.
    #[allow(clippy::cast_possible_truncation)]
    let (minutes, seconds) = (((total % 3600) / 60) as u8, (total % 60) as u8);
    (hours, minutes, seconds)
}
