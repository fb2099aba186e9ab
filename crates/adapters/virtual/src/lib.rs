//! # valvehub-adapter-virtual
//!
//! In-memory irrigation controller that speaks the link protocol. Used by
//! the end-to-end tests and by the daemon's `virtual` transport.
//!
//! ## Fault injection
//!
//! | Fault | Effect |
//! |-------|--------|
//! | `unreachable_connects` | the next *n* connects fail |
//! | `connect_delay` | every connect takes this long (exceed the connect timeout to hang) |
//! | `command_delay` | every exchange takes this long |
//! | `dropped_exchanges` | the next *n* exchanges fail at the transport |
//! | `stuck` | valve commands are acked but ignored |
//! | `nack` | valve commands are rejected with this reason |
//! | `raw_response` | every exchange answers with these bytes |
//!
//! ## Dependency rule
//!
//! Depends on `valvehub-app` (port traits) and `valvehub-domain` only.

mod device;

use std::future::Future;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use tokio::time::Instant;

use valvehub_app::ports::{DeviceFound, DiscoverySource, LinkConnector, LinkError, ValveLink};
use valvehub_domain::command::Command;
use valvehub_domain::error::ProtocolError;
use valvehub_domain::identity::DeviceIdentity;
use valvehub_domain::protocol::{self, NackReason, Response};

use device::SimulatedValve;

/// Failures the virtual transport reports through [`LinkError::transport`].
#[derive(Debug, thiserror::Error)]
pub enum VirtualError {
    #[error("simulated link loss")]
    LinkLost,

    #[error("request frame rejected")]
    BadRequest(#[source] ProtocolError),
}

/// Faults applied to upcoming connects and exchanges.
#[derive(Debug, Clone, Default)]
pub struct Faults {
    pub unreachable_connects: u32,
    pub connect_delay: Duration,
    pub command_delay: Duration,
    pub dropped_exchanges: u32,
    pub stuck: bool,
    pub nack: Option<NackReason>,
    pub raw_response: Option<Vec<u8>>,
}

/// What the controller has observed so far.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Counters {
    /// Connect attempts, successful or not.
    pub connects: u32,
    pub open_links: u32,
    /// Highest number of links ever open at once.
    pub max_open_links: u32,
    /// Every decoded request, in arrival order.
    pub commands: Vec<Command>,
}

struct State {
    valve: SimulatedValve,
    faults: Faults,
    counters: Counters,
    neighbours: Vec<DeviceFound>,
}

impl State {
    fn respond(&mut self, request: &[u8]) -> Result<Vec<u8>, LinkError> {
        let command = protocol::decode_command(request)
            .map_err(|err| LinkError::transport(VirtualError::BadRequest(err)))?;
        self.counters.commands.push(command);

        if self.faults.dropped_exchanges > 0 {
            self.faults.dropped_exchanges -= 1;
            return Err(LinkError::transport(VirtualError::LinkLost));
        }
        if let Some(raw) = &self.faults.raw_response {
            return Ok(raw.clone());
        }

        let response = match self.faults.nack {
            Some(reason) if command.is_valve_command() => Response::Nack(reason),
            _ if self.faults.stuck && command.is_valve_command() => Response::Ack,
            _ => self.valve.apply(command, Instant::now()),
        };
        tracing::debug!(%command, ?response, "virtual controller answered");
        Ok(protocol::encode_response(&response))
    }
}

fn lock(state: &Mutex<State>) -> MutexGuard<'_, State> {
    state.lock().unwrap_or_else(PoisonError::into_inner)
}

/// A simulated controller. Clones share the same device.
#[derive(Clone)]
pub struct VirtualController {
    identity: DeviceIdentity,
    state: Arc<Mutex<State>>,
}

impl VirtualController {
    #[must_use]
    pub fn new(identity: DeviceIdentity) -> Self {
        Self {
            identity,
            state: Arc::new(Mutex::new(State {
                valve: SimulatedValve::new(100),
                faults: Faults::default(),
                counters: Counters::default(),
                neighbours: Vec::new(),
            })),
        }
    }

    #[must_use]
    pub fn identity(&self) -> &DeviceIdentity {
        &self.identity
    }

    /// Change the active faults.
    pub fn inject(&self, update: impl FnOnce(&mut Faults)) {
        update(&mut lock(&self.state).faults);
    }

    /// Remove every fault.
    pub fn heal(&self) {
        lock(&self.state).faults = Faults::default();
    }

    #[must_use]
    pub fn counters(&self) -> Counters {
        lock(&self.state).counters.clone()
    }

    #[must_use]
    pub fn is_open(&self) -> bool {
        lock(&self.state).valve.is_open(Instant::now())
    }

    pub fn set_battery(&self, percent: u8) {
        lock(&self.state).valve.set_battery(percent);
    }

    /// Operate the valve as if by hand at the unit, bypassing the link.
    pub fn operate_locally(&self, command: Command) {
        lock(&self.state).valve.apply(command, Instant::now());
    }

    /// Make another advertisement visible to discovery scans.
    pub fn advertise(&self, found: DeviceFound) {
        lock(&self.state).neighbours.push(found);
    }
}

/// A link to a [`VirtualController`].
pub struct VirtualLink {
    state: Arc<Mutex<State>>,
    released: bool,
}

impl LinkConnector for VirtualController {
    type Link = VirtualLink;

    fn connect(
        &self,
        identity: &DeviceIdentity,
    ) -> impl Future<Output = Result<VirtualLink, LinkError>> + Send {
        let state = Arc::clone(&self.state);
        let ours = identity.address() == self.identity.address();
        async move {
            let delay = {
                let mut guard = lock(&state);
                guard.counters.connects += 1;
                guard.faults.connect_delay
            };
            if !delay.is_zero() {
                tokio::time::sleep(delay).await;
            }
            {
                let mut guard = lock(&state);
                if !ours {
                    return Err(LinkError::Unavailable);
                }
                if guard.faults.unreachable_connects > 0 {
                    guard.faults.unreachable_connects -= 1;
                    return Err(LinkError::Unavailable);
                }
                let counters = &mut guard.counters;
                counters.open_links += 1;
                counters.max_open_links = counters.max_open_links.max(counters.open_links);
            }
            Ok(VirtualLink {
                state,
                released: false,
            })
        }
    }
}

impl ValveLink for VirtualLink {
    fn transact(
        &mut self,
        request: &[u8],
    ) -> impl Future<Output = Result<Vec<u8>, LinkError>> + Send {
        let state = Arc::clone(&self.state);
        let request = request.to_vec();
        async move {
            let delay = lock(&state).faults.command_delay;
            if !delay.is_zero() {
                tokio::time::sleep(delay).await;
            }
            lock(&state).respond(&request)
        }
    }

    fn disconnect(&mut self) -> impl Future<Output = Result<(), LinkError>> + Send {
        if !self.released {
            self.released = true;
            lock(&self.state).counters.open_links -= 1;
        }
        async { Ok(()) }
    }
}

impl DiscoverySource for VirtualController {
    fn discover(
        &self,
        window: Duration,
    ) -> impl Future<Output = Result<Vec<DeviceFound>, LinkError>> + Send {
        let state = Arc::clone(&self.state);
        let own = DeviceFound {
            address: self.identity.address().to_string(),
            name: Some(self.identity.name().to_owned()),
        };
        async move {
            tokio::time::sleep(window).await;
            let mut found = vec![own];
            found.extend(lock(&state).neighbours.iter().cloned());
            Ok(found)
        }
    }
}
