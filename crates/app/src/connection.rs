//! Connection manager — serialised, scoped access to one controller's link.
//!
//! All hardware contact goes through a single slot. [`ConnectionManager::acquire`]
//! queues callers in FIFO order (tokio's mutex is fair), so at most one link is
//! open at any time and operations run in the order they were requested.
//!
//! Within a slot, [`Slot::open`] connects with a bounded timeout and retries
//! with capped exponential backoff. The resulting [`Session`] sends commands
//! with their own timeout and never retries them. A session is always
//! disconnected: explicitly through [`Session::close`], or from `Drop` when the
//! owning future errors out, is cancelled, or panics.

use std::future::Future;
use std::pin::Pin;
use std::time::Duration;

use tokio::sync::{Mutex, MutexGuard};
use tokio::time::{sleep, timeout};

use valvehub_domain::command::Command;
use valvehub_domain::error::{ConnError, ValveError};
use valvehub_domain::identity::DeviceIdentity;
use valvehub_domain::protocol::{self, Response};

use crate::ports::{LinkConnector, ValveLink};

/// Boxed future returned by a [`ConnectionManager::with_connection`] operation.
pub type SessionFuture<'s, T> = Pin<Box<dyn Future<Output = Result<T, ValveError>> + Send + 's>>;

/// Timeouts, retry count, and backoff for link access.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConnectionConfig {
    pub connect_timeout: Duration,
    pub command_timeout: Duration,
    pub connect_attempts: u32,
    pub backoff_base: Duration,
    pub backoff_cap: Duration,
}

impl Default for ConnectionConfig {
    fn default() -> Self {
        Self {
            connect_timeout: Duration::from_secs(30),
            command_timeout: Duration::from_secs(10),
            connect_attempts: 3,
            backoff_base: Duration::from_secs(1),
            backoff_cap: Duration::from_secs(4),
        }
    }
}

impl ConnectionConfig {
    /// Delay after failed attempt number `attempt` (1-based).
    #[must_use]
    pub fn backoff(&self, attempt: u32) -> Duration {
        let factor = 1u32
            .checked_shl(attempt.saturating_sub(1))
            .unwrap_or(u32::MAX);
        self.backoff_base.saturating_mul(factor).min(self.backoff_cap)
    }
}

/// Owns the link connector and the single hardware slot.
pub struct ConnectionManager<C> {
    connector: C,
    config: ConnectionConfig,
    slot: Mutex<()>,
}

impl<C: LinkConnector> ConnectionManager<C> {
    pub fn new(connector: C, config: ConnectionConfig) -> Self {
        Self {
            connector,
            config,
            slot: Mutex::new(()),
        }
    }

    /// Wait for the hardware slot. Waiters are served in arrival order.
    pub async fn acquire(&self) -> Slot<'_, C> {
        let guard = self.slot.lock().await;
        Slot {
            manager: self,
            _guard: guard,
        }
    }

    /// Take the slot only if nobody holds it.
    pub fn try_acquire(&self) -> Option<Slot<'_, C>> {
        self.slot.try_lock().ok().map(|guard| Slot {
            manager: self,
            _guard: guard,
        })
    }

    /// Run `op` against a freshly opened session and close it afterwards.
    ///
    /// # Errors
    ///
    /// Returns [`ConnError::Unreachable`] if no link could be opened, or
    /// whatever `op` returns.
    pub async fn with_connection<T, F>(
        &self,
        identity: &DeviceIdentity,
        op: F,
    ) -> Result<T, ValveError>
    where
        F: for<'s> FnOnce(&'s mut Session<C::Link>) -> SessionFuture<'s, T>,
    {
        let slot = self.acquire().await;
        let mut session = slot.open(identity).await?;
        let result = op(&mut session).await;
        session.close().await;
        result
    }
}

/// Exclusive right to talk to the controller. Released on drop.
pub struct Slot<'a, C> {
    manager: &'a ConnectionManager<C>,
    _guard: MutexGuard<'a, ()>,
}

impl<C: LinkConnector> Slot<'_, C> {
    /// Connect, retrying with backoff.
    ///
    /// # Errors
    ///
    /// Returns [`ConnError::Unreachable`] once every attempt failed or timed
    /// out.
    #[tracing::instrument(skip_all, fields(address = %identity.address()))]
    pub async fn open(&self, identity: &DeviceIdentity) -> Result<Session<C::Link>, ConnError> {
        let config = &self.manager.config;
        let attempts = config.connect_attempts.max(1);
        for attempt in 1..=attempts {
            match timeout(config.connect_timeout, self.manager.connector.connect(identity)).await {
                Ok(Ok(link)) => {
                    tracing::debug!(attempt, "link open");
                    return Ok(Session {
                        link: Some(link),
                        command_timeout: config.command_timeout,
                    });
                }
                Ok(Err(err)) => {
                    tracing::warn!(attempt, error = %err, "connect failed");
                }
                Err(_) => {
                    tracing::warn!(
                        attempt,
                        timeout_secs = config.connect_timeout.as_secs_f32(),
                        "connect timed out"
                    );
                }
            }
            if attempt < attempts {
                sleep(config.backoff(attempt)).await;
            }
        }
        Err(ConnError::Unreachable { attempts })
    }
}

/// One open link.
pub struct Session<L: ValveLink + 'static> {
    link: Option<L>,
    command_timeout: Duration,
}

impl<L: ValveLink + 'static> Session<L> {
    /// Send one command and decode the reply. Never retried.
    ///
    /// # Errors
    ///
    /// [`ConnError::Timeout`] when no reply arrives within the command
    /// timeout, [`ConnError::Dropped`] when the transport fails, and a
    /// [`ProtocolError`](valvehub_domain::error::ProtocolError) when the reply
    /// does not decode.
    pub async fn exchange(&mut self, command: &Command) -> Result<Response, ValveError> {
        let link = self.link.as_mut().ok_or(ConnError::Dropped)?;
        let request = protocol::encode(command);
        let reply = match timeout(self.command_timeout, link.transact(&request)).await {
            Ok(Ok(reply)) => reply,
            Ok(Err(err)) => {
                tracing::warn!(%command, error = %err, "link failed during exchange");
                return Err(ConnError::Dropped.into());
            }
            Err(_) => {
                tracing::warn!(%command, "command timed out");
                return Err(ConnError::Timeout.into());
            }
        };
        let response = protocol::decode(&reply)?;
        tracing::trace!(%command, ?response, "exchange");
        Ok(response)
    }

    /// Disconnect. Failures are logged; the link is gone either way.
    pub async fn close(mut self) {
        if let Some(mut link) = self.link.take() {
            match timeout(self.command_timeout, link.disconnect()).await {
                Ok(Ok(())) => tracing::debug!("link closed"),
                Ok(Err(err)) => tracing::warn!(error = %err, "disconnect failed"),
                Err(_) => tracing::warn!("disconnect timed out"),
            }
        }
    }
}

impl<L: ValveLink + 'static> Drop for Session<L> {
    fn drop(&mut self) {
        let Some(mut link) = self.link.take() else {
            return;
        };
        match tokio::runtime::Handle::try_current() {
            Ok(handle) => {
                tracing::debug!("session abandoned, disconnecting in background");
                handle.spawn(async move {
                    if let Err(err) = link.disconnect().await {
                        tracing::warn!(error = %err, "background disconnect failed");
                    }
                });
            }
            Err(_) => tracing::warn!("session dropped outside a runtime, link not disconnected"),
        }
    }
}
