//! Commands the core can issue to a controller.

use std::fmt;

use serde::{Deserialize, Serialize};

use crate::error::ValidationError;

/// A timed-open duration, validated against the controller's own range.
///
/// The range is the device's, not any UI slider's.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(try_from = "u32", into = "u32")]
pub struct IrrigationMinutes(u8);

impl IrrigationMinutes {
    pub const MIN: u32 = 1;
    pub const MAX: u32 = 240;

    /// Validate a duration in minutes.
    ///
    /// # Errors
    ///
    /// Returns [`ValidationError::DurationOutOfRange`] outside `1..=240`.
    pub fn new(minutes: u32) -> Result<Self, ValidationError> {
        if (Self::MIN..=Self::MAX).contains(&minutes) {
            // MAX fits in a u8, so the cast is lossless.
            #[allow(clippy::cast_possible_truncation)]
            Ok(Self(minutes as u8))
        } else {
            Err(ValidationError::DurationOutOfRange {
                minutes,
                min: Self::MIN,
                max: Self::MAX,
            })
        }
    }

    /// Validate a default duration where `0` means "untimed".
    ///
    /// # Errors
    ///
    /// Returns [`ValidationError::DurationOutOfRange`] above 240.
    pub fn optional(minutes: u32) -> Result<Option<Self>, ValidationError> {
        if minutes == 0 {
            Ok(None)
        } else {
            Self::new(minutes).map(Some)
        }
    }

    #[must_use]
    pub fn get(self) -> u32 {
        u32::from(self.0)
    }

    #[must_use]
    pub fn as_seconds(self) -> u32 {
        self.get() * 60
    }

    /// Split into the `(hours, minutes, seconds)` triple the device uses.
    #[must_use]
    pub fn to_hms(self) -> (u8, u8, u8) {
        (self.0 / 60, self.0 % 60, 0)
    }
}

impl TryFrom<u32> for IrrigationMinutes {
    type Error = ValidationError;

    fn try_from(value: u32) -> Result<Self, Self::Error> {
        Self::new(value)
    }
}

impl From<IrrigationMinutes> for u32 {
    fn from(value: IrrigationMinutes) -> Self {
        value.get()
    }
}

impl fmt::Display for IrrigationMinutes {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} min", self.0)
    }
}

/// An outbound request to the controller.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "command", content = "minutes", rename_all = "snake_case")]
pub enum Command {
    /// Open until told otherwise.
    OpenValve,
    /// Open for a fixed duration; the device closes itself at expiry.
    OpenValveTimed(IrrigationMinutes),
    CloseValve,
    QueryStatus,
    QueryBattery,
}

impl Command {
    /// The valve state this command should leave behind, for valve commands.
    #[must_use]
    pub fn expected_open(self) -> Option<bool> {
        match self {
            Self::OpenValve | Self::OpenValveTimed(_) => Some(true),
            Self::CloseValve => Some(false),
            Self::QueryStatus | Self::QueryBattery => None,
        }
    }

    /// Whether the command changes the valve rather than reading it.
    #[must_use]
    pub fn is_valve_command(self) -> bool {
        self.expected_open().is_some()
    }
}

impl fmt::Display for Command {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::OpenValve => f.write_str("open"),
            Self::OpenValveTimed(minutes) => write!(f, "open for {minutes}"),
            Self::CloseValve => f.write_str("close"),
            Self::QueryStatus => f.write_str("query status"),
            Self::QueryBattery => f.write_str("query battery"),
        }
    }
}
