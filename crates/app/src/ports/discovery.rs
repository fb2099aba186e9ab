//! Discovery port — bounded scans for advertising controllers.

use std::future::Future;
use std::time::Duration;

use super::link::LinkError;

/// One advertisement seen during a scan.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DeviceFound {
    /// Address as the radio stack reports it.
    pub address: String,
    /// Advertised local name, if any.
    pub name: Option<String>,
}

/// Something that can list nearby devices.
pub trait DiscoverySource: Send + Sync {
    /// Scan for `window` and return every advertisement seen.
    fn discover(
        &self,
        window: Duration,
    ) -> impl Future<Output = Result<Vec<DeviceFound>, LinkError>> + Send;
}
