//! # valvehub-domain
//!
//! Pure domain model for a BLE irrigation valve controller.
//!
//! ## Responsibilities
//! - Device identity and the vendor name filter
//! - Commands and the link-frame protocol codec
//! - The operation state machine (Idle → Connecting → Opening/Closing →
//!   Confirmed → Idle, with Error as the failure sink)
//! - Irrigation sessions and their countdown
//! - Cached device data with per-field timestamps
//! - The background poll decision
//!
//! ## Dependency rule
//! This crate has **no internal dependencies** and performs no IO.
//! Link access, timers, and tasks live in the `app` crate behind ports.

pub mod error;
pub mod time;

pub mod cache;
pub mod command;
pub mod event;
pub mod identity;
pub mod protocol;
pub mod scan;
pub mod session;
pub mod state;
pub mod status;
