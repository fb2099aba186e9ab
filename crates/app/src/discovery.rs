//! Discovery — turns raw advertisements into controller candidates.

use std::collections::HashSet;
use std::time::Duration;

use valvehub_domain::identity::{BleAddress, DeviceIdentity};

use crate::ports::{DeviceFound, DiscoverySource, LinkError};

/// Filters advertisements to supported controllers, once per address.
#[derive(Debug, Default)]
pub struct DiscoveryFilter {
    seen: HashSet<BleAddress>,
}

impl DiscoveryFilter {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Accept `found` if it is a supported controller not seen before.
    pub fn accept(&mut self, found: &DeviceFound) -> Option<DeviceIdentity> {
        let name = found.name.as_deref()?;
        match DeviceIdentity::from_advertisement(&found.address, name) {
            Ok(identity) => self.seen.insert(identity.address()).then_some(identity),
            Err(err) => {
                tracing::trace!(address = %found.address, name, %err, "advertisement ignored");
                None
            }
        }
    }
}

/// Scan `source` for `window` and return matching controllers.
///
/// # Errors
///
/// Propagates the scan failure from the source.
pub async fn discover_controllers<S: DiscoverySource>(
    source: &S,
    window: Duration,
) -> Result<Vec<DeviceIdentity>, LinkError> {
    let found = source.discover(window).await?;
    let mut filter = DiscoveryFilter::new();
    let candidates: Vec<DeviceIdentity> = found.iter().filter_map(|f| filter.accept(f)).collect();
    tracing::info!(seen = found.len(), candidates = candidates.len(), "discovery finished");
    Ok(candidates)
}
