//! Serial execution of console requests that change the device.
//!
//! Requests are queued on a channel and run one after another, so a line
//! typed after another never reaches the hardware first.

use std::sync::Arc;

use tokio::sync::mpsc;
use tokio::task::JoinHandle;

use valvehub_app::event_bus::InProcessEventBus;
use valvehub_app::ports::LinkConnector;
use valvehub_app::services::valve_service::ValveService;
use valvehub_domain::error::{FailureReason, ValveError};

use crate::console::Request;

pub type Service<C> = ValveService<C, Arc<InProcessEventBus>>;

pub struct CommandWorker<C> {
    service: Service<C>,
    requests: mpsc::Receiver<Request>,
}

impl<C: LinkConnector> CommandWorker<C> {
    /// Spawn the worker. It stops once every sender is dropped.
    pub fn start(service: Service<C>, capacity: usize) -> (mpsc::Sender<Request>, JoinHandle<()>) {
        let (sender, requests) = mpsc::channel(capacity);
        let worker = Self { service, requests };
        (sender, tokio::spawn(worker.run()))
    }

    async fn run(mut self) {
        while let Some(request) = self.requests.recv().await {
            self.execute(request).await;
        }
        tracing::debug!("command worker stopped");
    }

    async fn execute(&self, request: Request) {
        match request {
            Request::Open(Some(minutes)) => report("open", self.service.open_for(minutes).await),
            Request::Open(None) => report("open", self.service.open().await),
            Request::Close => report("close", self.service.close().await),
            Request::Scan(enabled) => self.service.set_scanning(enabled).await,
            Request::Duration(minutes) => report("duration", self.service.set_duration(minutes)),
            other => tracing::debug!(?other, "not a device request, ignored"),
        }
    }
}

fn report(operation: &'static str, result: Result<(), ValveError>) {
    match result {
        Ok(()) => tracing::info!(operation, "request done"),
        Err(err) => {
            let reason = FailureReason::from(&err);
            tracing::warn!(operation, %reason, error = ?err, "request failed");
        }
    }
}
