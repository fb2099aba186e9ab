//! Scriptable in-memory controller shared by the unit tests.

use std::future::Future;
use std::sync::{Arc, Mutex, MutexGuard};

use valvehub_domain::command::Command;
use valvehub_domain::identity::DeviceIdentity;
use valvehub_domain::protocol::{self, NackReason, Response};

use crate::ports::{LinkConnector, LinkError, ValveLink};

pub struct SimState {
    pub open: bool,
    pub remaining: u32,
    pub battery: u8,
    /// Fail this many upcoming connects.
    pub unreachable: u32,
    /// Ack valve commands without acting on them.
    pub stuck: bool,
    pub nack: Option<NackReason>,
    pub connects: u32,
    pub open_links: u32,
    pub max_open_links: u32,
    pub log: Vec<Command>,
}

impl Default for SimState {
    fn default() -> Self {
        Self {
            open: false,
            remaining: 0,
            battery: 87,
            unreachable: 0,
            stuck: false,
            nack: None,
            connects: 0,
            open_links: 0,
            max_open_links: 0,
            log: Vec::new(),
        }
    }
}

#[derive(Clone, Default)]
pub struct SimConnector {
    state: Arc<Mutex<SimState>>,
}

impl SimConnector {
    pub fn state(&self) -> MutexGuard<'_, SimState> {
        self.state.lock().unwrap()
    }

    pub fn state_mut(&self) -> MutexGuard<'_, SimState> {
        self.state()
    }
}

pub struct SimLink {
    state: Arc<Mutex<SimState>>,
}

impl LinkConnector for SimConnector {
    type Link = SimLink;

    fn connect(
        &self,
        _identity: &DeviceIdentity,
    ) -> impl Future<Output = Result<SimLink, LinkError>> + Send {
        let result = {
            let mut state = self.state();
            state.connects += 1;
            if state.unreachable > 0 {
                state.unreachable -= 1;
                Err(LinkError::Unavailable)
            } else {
                state.open_links += 1;
                state.max_open_links = state.max_open_links.max(state.open_links);
                Ok(SimLink {
                    state: Arc::clone(&self.state),
                })
            }
        };
        async move { result }
    }
}

impl ValveLink for SimLink {
    fn transact(
        &mut self,
        request: &[u8],
    ) -> impl Future<Output = Result<Vec<u8>, LinkError>> + Send {
        let command = protocol::decode_command(request).unwrap();
        let mut state = self.state.lock().unwrap();
        state.log.push(command);
        let response = match command {
            Command::OpenValve | Command::OpenValveTimed(_) | Command::CloseValve
                if state.nack.is_some() =>
            {
                Response::Nack(state.nack.unwrap())
            }
            Command::OpenValve => {
                if !state.stuck {
                    state.open = true;
                    state.remaining = 0;
                }
                Response::Ack
            }
            Command::OpenValveTimed(minutes) => {
                if !state.stuck {
                    state.open = true;
                    state.remaining = minutes.as_seconds();
                }
                Response::Ack
            }
            Command::CloseValve => {
                if !state.stuck {
                    state.open = false;
                    state.remaining = 0;
                }
                Response::Ack
            }
            Command::QueryStatus => Response::StatusReport {
                open: state.open,
                remaining_seconds: (state.remaining > 0).then_some(state.remaining),
            },
            Command::QueryBattery => Response::BatteryReport {
                percent: state.battery,
            },
        };
        drop(state);
        let frame = protocol::encode_response(&response);
        async move { Ok(frame) }
    }

    fn disconnect(&mut self) -> impl Future<Output = Result<(), LinkError>> + Send {
        self.state.lock().unwrap().open_links -= 1;
        async { Ok(()) }
    }
}
