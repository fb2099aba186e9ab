//! Irrigation timer — the one-second countdown task.
//!
//! The task only drives the clock. The session itself, and what happens at
//! expiry, belong to the [`CountdownTarget`] (the valve service).

use std::future::Future;
use std::time::Duration;

use tokio::task::JoinHandle;
use tokio::time::{Instant, interval_at};

use valvehub_domain::session::SessionId;

const TICK: Duration = Duration::from_secs(1);

/// Result of one countdown tick.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TickOutcome {
    Running { remaining_seconds: u32 },
    /// Remaining time reached zero; the target should close the valve.
    Expired,
    /// The session ended some other way; stop ticking.
    Gone,
}

/// Owner of the session the timer counts down.
pub trait CountdownTarget: Send + Sync + 'static {
    /// Advance the session by one second.
    fn tick(&self, session: SessionId) -> impl Future<Output = TickOutcome> + Send;

    /// Handle expiry. Called at most once per timer.
    fn expire(&self, session: SessionId) -> impl Future<Output = ()> + Send;
}

/// Spawns countdown tasks.
pub struct IrrigationTimer;

impl IrrigationTimer {
    /// Start counting down `session` on `target`.
    ///
    /// The first tick fires one second from now. Abort the returned handle to
    /// cancel the countdown.
    pub fn start<T: CountdownTarget>(target: T, session: SessionId) -> JoinHandle<()> {
        tokio::spawn(Self::run(target, session))
    }

    async fn run<T: CountdownTarget>(target: T, session: SessionId) {
        let mut ticker = interval_at(Instant::now() + TICK, TICK);
        loop {
            ticker.tick().await;
            match target.tick(session).await {
                TickOutcome::Running { remaining_seconds } => {
                    tracing::trace!(%session, remaining_seconds, "countdown tick");
                }
                TickOutcome::Expired => {
                    tracing::info!(%session, "irrigation time elapsed");
                    target.expire(session).await;
                    return;
                }
                TickOutcome::Gone => {
                    tracing::debug!(%session, "session gone, timer stopped");
                    return;
                }
            }
        }
    }
}
