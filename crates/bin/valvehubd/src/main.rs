//! # valvehubd — valvehub daemon
//!
//! Composition root that wires the valve service to a transport and drives
//! it from the console.
//!
//! ## Responsibilities
//! - Parse configuration (config file, env vars)
//! - Initialise logging
//! - Construct the transport adapter (BLE or virtual)
//! - Construct the connection manager, valve service, and event bus
//! - Start the poll scheduler
//! - Read commands from stdin, print status as JSON to stdout
//! - Persist the cached status when configured
//! - Stop on `quit`, end of input, or Ctrl-C
//!
//! ## Dependency rule
//! This is the **only** crate that depends on all other crates.
//! It is the wiring layer — no domain logic belongs here.

mod cache_file;
mod config;
mod console;
mod worker;

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use tokio::io::{AsyncBufReadExt as _, BufReader};
use tokio::sync::broadcast::{self, error::RecvError};
use tokio::sync::mpsc;
use tracing_subscriber::EnvFilter;

use valvehub_adapter_ble::{BleConnector, BleDiscovery};
use valvehub_adapter_virtual::VirtualController;
use valvehub_app::cache::CacheStore;
use valvehub_app::connection::ConnectionManager;
use valvehub_app::discovery::discover_controllers;
use valvehub_app::event_bus::InProcessEventBus;
use valvehub_app::ports::{DiscoverySource, LinkConnector};
use valvehub_app::scheduler::PollScheduler;
use valvehub_app::services::valve_service::ValveService;
use valvehub_domain::event::ValveEvent;
use valvehub_domain::identity::DeviceIdentity;
use valvehub_domain::time::format_mm_ss;

use config::{Config, Transport};
use console::{HELP, Request};
use worker::{CommandWorker, Service};

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let config = Config::load()?;

    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_new(&config.logging.filter)?)
        .init();

    let identity = config.identity()?;
    tracing::info!(device = %identity, transport = ?config.transport.kind, "valvehubd starting");

    match config.transport.kind {
        Transport::Ble => {
            let connector = BleConnector::new(config.ble.clone());
            run(&config, identity, connector, BleDiscovery).await
        }
        Transport::Virtual => {
            let controller = VirtualController::new(identity.clone());
            run(&config, identity, controller.clone(), controller).await
        }
    }
}

async fn run<C, D>(
    config: &Config,
    identity: DeviceIdentity,
    connector: C,
    discovery: D,
) -> Result<(), Box<dyn std::error::Error>>
where
    C: LinkConnector,
    D: DiscoverySource + 'static,
{
    let cached = match &config.device.cache_file {
        Some(path) => cache_file::load(path).await?.unwrap_or_default(),
        None => valvehub_domain::cache::CachedStatus::default(),
    };

    // Event bus
    let bus = Arc::new(InProcessEventBus::new(256));
    let watcher = tokio::spawn(watch_events(
        bus.subscribe(),
        config.device.cache_file.clone(),
    ));

    // Service
    let service = ValveService::new(
        identity,
        ConnectionManager::new(connector, config.connection()),
        Arc::clone(&bus),
        CacheStore::with_snapshot(cached),
        config.valve()?,
    );
    let scheduler = PollScheduler::start(service.clone(), config.check_interval());
    let (requests, worker) = CommandWorker::start(service.clone(), 32);

    let discovery = Arc::new(discovery);
    let discovery_window = config.ble.discovery_window();

    println!("{HELP}");
    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    loop {
        tokio::select! {
            line = lines.next_line() => {
                let Some(line) = line? else { break };
                match console::parse(&line) {
                    Ok(Some(Request::Quit)) => break,
                    Ok(Some(request)) => {
                        dispatch(&service, &requests, &discovery, discovery_window, request).await;
                    }
                    Ok(None) => {}
                    Err(err) => eprintln!("{err}"),
                }
            }
            _ = tokio::signal::ctrl_c() => break,
        }
    }

    worker.abort();
    scheduler.abort();
    watcher.abort();
    tracing::info!("valvehubd stopped");
    Ok(())
}

/// Device requests go to the command worker in arrival order; the rest are
/// answered here.
async fn dispatch<C, D>(
    service: &Service<C>,
    requests: &mpsc::Sender<Request>,
    discovery: &Arc<D>,
    window: Duration,
    request: Request,
) where
    C: LinkConnector,
    D: DiscoverySource + 'static,
{
    match request {
        Request::Open(_) | Request::Close | Request::Scan(_) | Request::Duration(_) => {
            if requests.send(request).await.is_err() {
                tracing::warn!(?request, "command worker gone, request dropped");
            }
        }
        Request::Status => match serde_json::to_string_pretty(&service.snapshot()) {
            Ok(json) => println!("{json}"),
            Err(err) => tracing::warn!(%err, "failed to serialise status"),
        },
        Request::Discover => {
            let discovery = Arc::clone(discovery);
            tokio::spawn(async move {
                match discover_controllers(discovery.as_ref(), window).await {
                    Ok(found) if found.is_empty() => println!("no controllers found"),
                    Ok(found) => {
                        for identity in found {
                            println!("{}  {}", identity.address(), identity.name());
                        }
                    }
                    Err(err) => tracing::warn!(%err, "discovery failed"),
                }
            });
        }
        Request::Help => println!("{HELP}"),
        Request::Quit => {}
    }
}

async fn watch_events(mut events: broadcast::Receiver<ValveEvent>, cache_path: Option<PathBuf>) {
    loop {
        match events.recv().await {
            Ok(ValveEvent::StateChanged { from, to, reason }) => {
                tracing::info!(%from, %to, reason = ?reason, "state changed");
            }
            Ok(ValveEvent::Tick {
                remaining_seconds, ..
            }) => {
                if remaining_seconds % 60 == 0 {
                    tracing::info!(remaining = %format_mm_ss(remaining_seconds), "irrigating");
                }
            }
            Ok(ValveEvent::ScanningChanged { enabled }) => {
                tracing::info!(enabled, "scanning changed");
            }
            Ok(ValveEvent::IrrigationFinished { record }) => {
                tracing::info!(
                    minutes = record.duration.get(),
                    ended_at = %record.ended_at,
                    "irrigation finished"
                );
            }
            Ok(ValveEvent::CacheUpdated { cache }) => {
                if let Some(path) = &cache_path
                    && let Err(err) = cache_file::save(path, &cache).await
                {
                    tracing::warn!(%err, path = %path.display(), "failed to persist cache");
                }
            }
            Err(RecvError::Lagged(skipped)) => {
                tracing::warn!(skipped, "event watcher lagged");
            }
            Err(RecvError::Closed) => break,
        }
    }
}
