//! Device identity — the stable key for one physical controller.

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

use crate::error::ValidationError;

/// Prefix the Galcon 9001BT advertises its local name with.
pub const VENDOR_NAME_FILTER: &str = "GL9001A";

/// Name used when the advertisement carries none.
pub const DEFAULT_NAME: &str = "Galcon Irrigation";

/// A 6-byte BLE MAC address.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct BleAddress([u8; 6]);

impl BleAddress {
    /// Wrap raw address bytes (most significant byte first).
    #[must_use]
    pub const fn from_bytes(bytes: [u8; 6]) -> Self {
        Self(bytes)
    }

    /// Access the raw address bytes.
    #[must_use]
    pub fn into_inner(self) -> [u8; 6] {
        self.0
    }
}

impl fmt::Display for BleAddress {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let [a, b, c, d, e, g] = self.0;
        write!(f, "{a:02X}:{b:02X}:{c:02X}:{d:02X}:{e:02X}:{g:02X}")
    }
}

impl FromStr for BleAddress {
    type Err = ValidationError;

    /// Parse `AA:BB:CC:DD:EE:FF` (either case, surrounding whitespace
    /// ignored).
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let mut bytes = [0u8; 6];
        let mut parts = s.trim().split(':');
        for byte in &mut bytes {
            let part = parts.next().ok_or(ValidationError::InvalidAddress)?;
            if part.len() != 2 {
                return Err(ValidationError::InvalidAddress);
            }
            *byte = u8::from_str_radix(part, 16).map_err(|_| ValidationError::InvalidAddress)?;
        }
        if parts.next().is_some() {
            return Err(ValidationError::InvalidAddress);
        }
        Ok(Self(bytes))
    }
}

impl TryFrom<String> for BleAddress {
    type Error = ValidationError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        value.parse()
    }
}

impl From<BleAddress> for String {
    fn from(value: BleAddress) -> Self {
        value.to_string()
    }
}

/// Whether an advertised local name belongs to a supported controller.
///
/// The match is a case-insensitive substring test, since firmware revisions
/// append a serial suffix to the prefix.
#[must_use]
pub fn matches_vendor_name(name: &str) -> bool {
    name.to_ascii_uppercase()
        .contains(&VENDOR_NAME_FILTER.to_ascii_uppercase())
}

/// Stable identity of one paired controller. Immutable after pairing.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct DeviceIdentity {
    address: BleAddress,
    name: String,
}

impl DeviceIdentity {
    /// Identity for a manually configured controller.
    ///
    /// The name is a display label here and is not checked against the
    /// vendor filter.
    #[must_use]
    pub fn new(address: BleAddress, name: impl Into<String>) -> Self {
        Self {
            address,
            name: name.into(),
        }
    }

    /// Identity built from a discovery advertisement.
    ///
    /// # Errors
    ///
    /// Returns [`ValidationError::InvalidAddress`] for a malformed address and
    /// [`ValidationError::NameMismatch`] if the name fails the vendor filter.
    pub fn from_advertisement(address: &str, name: &str) -> Result<Self, ValidationError> {
        let address = address.parse()?;
        if !matches_vendor_name(name) {
            return Err(ValidationError::NameMismatch);
        }
        Ok(Self::new(address, name))
    }

    #[must_use]
    pub fn address(&self) -> BleAddress {
        self.address
    }

    #[must_use]
    pub fn name(&self) -> &str {
        &self.name
    }
}

impl fmt::Display for DeviceIdentity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} ({})", self.name, self.address)
    }
}
