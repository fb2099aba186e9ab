//! Link port — a byte-level connection to one controller.
//!
//! A transport carries link frames (see `valvehub_domain::protocol`). The
//! connection manager owns every link it opens and always disconnects it.

use std::future::Future;

use valvehub_domain::identity::DeviceIdentity;

/// Opens links to a controller.
pub trait LinkConnector: Send + Sync + 'static {
    type Link: ValveLink + 'static;

    /// Establish a link. Must not retry internally; the connection manager
    /// owns retries, timeouts, and backoff.
    fn connect(
        &self,
        identity: &DeviceIdentity,
    ) -> impl Future<Output = Result<Self::Link, LinkError>> + Send;
}

/// An open link.
pub trait ValveLink: Send {
    /// Send one request frame and return the response frame.
    fn transact(&mut self, request: &[u8])
    -> impl Future<Output = Result<Vec<u8>, LinkError>> + Send;

    /// Release the link. Called exactly once per opened link.
    fn disconnect(&mut self) -> impl Future<Output = Result<(), LinkError>> + Send;
}

/// Transport-level failure reported by an adapter.
#[derive(Debug, thiserror::Error)]
pub enum LinkError {
    /// The device was not found or refused the connection.
    #[error("device unavailable")]
    Unavailable,

    #[error("transport failure")]
    Transport(#[source] Box<dyn std::error::Error + Send + Sync>),
}

impl LinkError {
    /// Wrap any adapter error as a transport failure.
    pub fn transport(err: impl std::error::Error + Send + Sync + 'static) -> Self {
        Self::Transport(Box::new(err))
    }
}
