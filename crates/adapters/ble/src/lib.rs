//! # valvehub-adapter-ble
//!
//! Active BLE adapter for the Galcon 9001BT irrigation controller.
//!
//! ## How it works
//!
//! The controller sleeps between contacts and only talks over GATT. For
//! every link the adapter scans until the configured address appears,
//! connects, and locates the vendor characteristics (see [`galcon`]). Link
//! frames from the core are then translated one by one: each request starts
//! with a wake write, valve commands become a control write, and queries
//! become a status read.
//!
//! | Link request | GATT traffic | Link response |
//! |--------------|--------------|---------------|
//! | open / open timed / close | wake, control write | ack, or nack on a refused write |
//! | query status | wake, status read | status report |
//! | query battery | wake, status read | battery report |
//!
//! Retries, timeouts and backoff belong to the core's connection manager;
//! the adapter attempts everything exactly once.
//!
//! ## Dependency rule
//!
//! Same as other adapters: depends on `valvehub-app` and `valvehub-domain`.

mod config;
mod error;
pub mod galcon;
mod gatt;
mod scanner;

pub use config::BleConfig;
pub use error::{BleError, StatusParseError};
pub use gatt::GattLink;
pub use scanner::{BleConnector, BleDiscovery};
