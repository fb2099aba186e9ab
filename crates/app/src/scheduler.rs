//! Poll scheduler — the background task that asks the valve service whether
//! a connection is due.
//!
//! The scheduler checks on a short fixed cadence; the scan policy inside the
//! service decides whether a check actually connects.

use std::time::Duration;

use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;

use valvehub_domain::scan::PollDecision;

use crate::ports::{EventPublisher, LinkConnector};
use crate::services::valve_service::ValveService;

pub struct PollScheduler<C, P> {
    service: ValveService<C, P>,
    check_interval: Duration,
}

impl<C, P> PollScheduler<C, P>
where
    C: LinkConnector,
    P: EventPublisher + 'static,
{
    /// Spawn the scheduler. The first check runs immediately.
    pub fn start(service: ValveService<C, P>, check_interval: Duration) -> JoinHandle<()> {
        let scheduler = Self {
            service,
            check_interval,
        };
        tokio::spawn(scheduler.run())
    }

    async fn run(self) {
        let mut ticker = tokio::time::interval(self.check_interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        loop {
            ticker.tick().await;
            match self.service.poll_tick().await {
                PollDecision::Skip => {}
                decision => tracing::debug!(?decision, "poll check acted"),
            }
        }
    }
}
