//! Galcon 9001BT GATT layout and payload codecs.
//!
//! The controller exposes three characteristics in the vendor service:
//!
//! | Characteristic | UUID | Use |
//! |----------------|------|-----|
//! | wake | `e8680201-…` | write `[0x01, 0x02]` before anything else |
//! | status | `e8680102-…` | 7-byte status read |
//! | control | `e8680103-…` | 7-byte valve command |
//!
//! Everything here is pure; the GATT IO lives in [`crate::gatt`].

use valvehub_domain::command::Command;
use valvehub_domain::protocol::Response;

use crate::error::StatusParseError;

pub const WAKE_CHAR: uuid::Uuid = uuid::Uuid::from_u128(0xe868_0201_9c4b_11e4_b5f7_0002_a5d5_c51b);
pub const STATUS_CHAR: uuid::Uuid =
    uuid::Uuid::from_u128(0xe868_0102_9c4b_11e4_b5f7_0002_a5d5_c51b);
pub const CONTROL_CHAR: uuid::Uuid =
    uuid::Uuid::from_u128(0xe868_0103_9c4b_11e4_b5f7_0002_a5d5_c51b);

pub const WAKE_PAYLOAD: [u8; 2] = [0x01, 0x02];
pub const CLOSE_PAYLOAD: [u8; 7] = [0x01, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00];
pub const OPEN_PAYLOAD: [u8; 7] = [0x00, 0x01, 0x00, 0x00, 0x00, 0x00, 0x00];

const TIMED_OPEN_MODE: u8 = 0x03;
const STATUS_MIN_LEN: usize = 5;
const VALVE_OPEN_MASK: u8 = 0x01;
const MANUAL_OPEN_MASK: u8 = 0x01;

/// Control characteristic payload for a valve command, `None` for queries.
#[must_use]
pub fn control_payload(command: &Command) -> Option<[u8; 7]> {
    match command {
        Command::OpenValve => Some(OPEN_PAYLOAD),
        Command::OpenValveTimed(minutes) => {
            let (hours, minutes, seconds) = minutes.to_hms();
            Some([0x00, TIMED_OPEN_MODE, 0x00, hours, minutes, seconds, 0x00])
        }
        Command::CloseValve => Some(CLOSE_PAYLOAD),
        Command::QueryStatus | Command::QueryBattery => None,
    }
}

/// Parsed status characteristic.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct GalconStatus {
    pub valve_open: bool,
    /// Opened with the button on the unit rather than over BLE.
    pub manual_open: bool,
    pub remaining_seconds: u32,
    pub battery_percent: Option<u8>,
}

impl GalconStatus {
    /// Answer a query with this status, in link protocol terms.
    ///
    /// # Errors
    ///
    /// Returns [`StatusParseError::NoBattery`] for a battery query when the
    /// read carried no battery byte.
    pub fn answer(&self, command: &Command) -> Result<Response, StatusParseError> {
        match command {
            Command::QueryBattery => self
                .battery_percent
                .map(|percent| Response::BatteryReport { percent })
                .ok_or(StatusParseError::NoBattery),
            _ => Ok(Response::StatusReport {
                open: self.valve_open,
                remaining_seconds: (self.remaining_seconds > 0).then_some(self.remaining_seconds),
            }),
        }
    }
}

/// Parse the status characteristic.
///
/// | Byte | Field |
/// |------|-------|
/// | 0 | bit 0: valve open |
/// | 1 | bit 0: manual open |
/// | 2..=4 | remaining hours, minutes, seconds |
/// | 5 | battery percent (optional) |
/// | 6 | unknown |
///
/// # Errors
///
/// Returns [`StatusParseError::TooShort`] below 5 bytes.
pub fn parse_status(data: &[u8]) -> Result<GalconStatus, StatusParseError> {
    if data.len() < STATUS_MIN_LEN {
        return Err(StatusParseError::TooShort {
            minimum: STATUS_MIN_LEN,
            actual: data.len(),
        });
    }
    let remaining =
        u32::from(data[2]) * 3_600 + u32::from(data[3]) * 60 + u32::from(data[4]);
    Ok(GalconStatus {
        valve_open: data[0] & VALVE_OPEN_MASK != 0,
        manual_open: data[1] & MANUAL_OPEN_MASK != 0,
        remaining_seconds: remaining,
        battery_percent: data.get(5).copied(),
    })
}
