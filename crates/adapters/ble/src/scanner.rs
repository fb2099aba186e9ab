//! BLE scanning — locates the configured controller for a connect and lists
//! advertising devices for discovery.

use std::collections::HashMap;
use std::future::Future;
use std::time::Duration;

use btleplug::api::{BDAddr, Central, CentralEvent, Manager as _, Peripheral as _, ScanFilter};
use btleplug::platform::{Adapter, Manager, Peripheral};
use tokio_stream::StreamExt as _;

use valvehub_app::ports::{DeviceFound, DiscoverySource, LinkConnector, LinkError};
use valvehub_domain::identity::{BleAddress, DeviceIdentity};

use crate::config::BleConfig;
use crate::error::BleError;
use crate::gatt::GattLink;

/// First BLE adapter on the host.
///
/// # Errors
///
/// Returns [`BleError::NotAvailable`] when the host has no adapter.
async fn first_adapter() -> Result<Adapter, BleError> {
    let manager = Manager::new().await?;
    let adapters = manager.adapters().await?;
    adapters.into_iter().next().ok_or(BleError::NotAvailable)
}

async fn stop_scan(central: &Adapter) {
    if let Err(err) = central.stop_scan().await {
        tracing::warn!(%err, "failed to stop BLE scan");
    }
}

/// Scan until the peripheral with `address` shows up or `window` runs out.
async fn find_peripheral(address: BleAddress, window: Duration) -> Result<Peripheral, BleError> {
    let target = BDAddr::from(address.into_inner());
    let central = first_adapter().await?;
    let mut events = central.events().await?;
    central.start_scan(ScanFilter::default()).await?;

    let found = search(&central, &mut events, target, window).await;
    stop_scan(&central).await;
    found?.ok_or(BleError::NotFound { address })
}

async fn search(
    central: &Adapter,
    events: &mut (impl tokio_stream::Stream<Item = CentralEvent> + Unpin),
    target: BDAddr,
    window: Duration,
) -> Result<Option<Peripheral>, BleError> {
    // Already known from an earlier scan.
    if let Some(peripheral) = central
        .peripherals()
        .await?
        .into_iter()
        .find(|p| p.address() == target)
    {
        return Ok(Some(peripheral));
    }

    let deadline = tokio::time::Instant::now() + window;
    while tokio::time::Instant::now() < deadline {
        let remaining = deadline - tokio::time::Instant::now();
        match tokio::time::timeout(remaining, events.next()).await {
            Ok(Some(CentralEvent::DeviceDiscovered(id) | CentralEvent::DeviceUpdated(id))) => {
                if let Ok(peripheral) = central.peripheral(&id).await
                    && peripheral.address() == target
                {
                    return Ok(Some(peripheral));
                }
            }
            Ok(Some(_)) => {}
            Ok(None) | Err(_) => break,
        }
    }
    Ok(None)
}

/// Opens [`GattLink`]s to controllers found by address.
#[derive(Debug, Clone, Default)]
pub struct BleConnector {
    config: BleConfig,
}

impl BleConnector {
    #[must_use]
    pub fn new(config: BleConfig) -> Self {
        Self { config }
    }
}

impl LinkConnector for BleConnector {
    type Link = GattLink;

    fn connect(
        &self,
        identity: &DeviceIdentity,
    ) -> impl Future<Output = Result<GattLink, LinkError>> + Send {
        let address = identity.address();
        let config = self.config.clone();
        async move {
            let peripheral = find_peripheral(address, config.scan_window()).await?;
            tracing::debug!(%address, "controller found, connecting");
            Ok(GattLink::open(peripheral, &config).await?)
        }
    }
}

/// Bounded discovery scan over the host's first BLE adapter.
#[derive(Debug, Clone, Copy, Default)]
pub struct BleDiscovery;

impl BleDiscovery {
    async fn scan(window: Duration) -> Result<Vec<DeviceFound>, BleError> {
        let central = first_adapter().await?;
        let mut events = central.events().await?;
        central.start_scan(ScanFilter::default()).await?;

        tracing::info!(window_secs = window.as_secs(), "BLE discovery started");

        let mut seen: HashMap<BDAddr, Option<String>> = HashMap::new();
        let deadline = tokio::time::Instant::now() + window;
        while tokio::time::Instant::now() < deadline {
            let remaining = deadline - tokio::time::Instant::now();
            match tokio::time::timeout(remaining, events.next()).await {
                Ok(Some(CentralEvent::DeviceDiscovered(id) | CentralEvent::DeviceUpdated(id))) => {
                    if let Ok(peripheral) = central.peripheral(&id).await
                        && let Ok(Some(props)) = peripheral.properties().await
                    {
                        tracing::trace!(address = %props.address, name = ?props.local_name, "BLE device detected");
                        let name = seen.entry(props.address).or_default();
                        if props.local_name.is_some() {
                            *name = props.local_name;
                        }
                    }
                }
                Ok(Some(_)) => {}
                Ok(None) | Err(_) => break,
            }
        }
        stop_scan(&central).await;

        Ok(seen
            .into_iter()
            .map(|(address, name)| DeviceFound {
                address: address.to_string(),
                name,
            })
            .collect())
    }
}

impl DiscoverySource for BleDiscovery {
    fn discover(
        &self,
        window: Duration,
    ) -> impl Future<Output = Result<Vec<DeviceFound>, LinkError>> + Send {
        async move { Self::scan(window).await.map_err(LinkError::from) }
    }
}
