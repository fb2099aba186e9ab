//! # valvehub-app
//!
//! Application layer — use-cases and **port definitions** (traits).
//!
//! ## Responsibilities
//! - Define **port traits** that adapters must implement:
//!   - `LinkConnector` / `ValveLink` — byte-level link to a controller
//!   - `DiscoverySource` — bounded scans for advertising controllers
//!   - `EventPublisher` — status event fan-out
//! - Serialise all hardware contact through the `ConnectionManager`
//! - Drive the operation state machine in `ValveService`
//! - Run the irrigation countdown and the background poll scheduler
//! - Provide **in-process infrastructure** (event bus, cache store) that
//!   doesn't need IO
//!
//! ## Dependency rule
//! Depends on `valvehub-domain` only (plus `tokio` for tasks, time, and sync).
//! Never imports adapter crates. Adapters depend on *this* crate, not the reverse.

pub mod cache;
pub mod connection;
pub mod discovery;
pub mod event_bus;
pub mod ports;
pub mod scheduler;
pub mod services;
pub mod timer;

#[cfg(test)]
mod testing;
