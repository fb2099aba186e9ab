//! BLE adapter error types.

use valvehub_app::ports::LinkError;
use valvehub_domain::error::ProtocolError;
use valvehub_domain::identity::BleAddress;

/// Errors specific to the BLE adapter.
#[derive(Debug, thiserror::Error)]
pub enum BleError {
    /// No BLE adapter found on the host.
    #[error("no BLE adapter available")]
    NotAvailable,

    /// The controller did not show up during the scan window.
    #[error("controller {address} not found")]
    NotFound { address: BleAddress },

    /// BLE scan or GATT operation failed.
    #[error("BLE operation failed")]
    Ble(#[from] btleplug::Error),

    /// A required characteristic is missing after service discovery.
    #[error("characteristic {uuid} not found")]
    CharacteristicNotFound { uuid: uuid::Uuid },

    /// The status characteristic returned something unusable.
    #[error("failed to parse status payload")]
    StatusParse(#[from] StatusParseError),

    /// The core sent a frame this transport cannot interpret.
    #[error("request frame rejected")]
    BadRequest(#[source] ProtocolError),
}

/// Details about why a status read could not be parsed.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum StatusParseError {
    #[error("status payload must be at least {minimum} bytes, got {actual}")]
    TooShort { minimum: usize, actual: usize },

    #[error("status payload carries no battery byte")]
    NoBattery,
}

impl From<BleError> for LinkError {
    fn from(err: BleError) -> Self {
        match err {
            BleError::NotAvailable | BleError::NotFound { .. } => Self::Unavailable,
            other => Self::transport(other),
        }
    }
}
