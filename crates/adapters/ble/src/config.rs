//! BLE adapter configuration.

use std::time::Duration;

use serde::Deserialize;

/// Configuration for the Galcon BLE transport.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct BleConfig {
    /// How long to scan for the configured controller before a connect
    /// gives up, in seconds.
    pub scan_window_secs: u16,
    /// Pause after the wake write before the first real request, in
    /// milliseconds.
    pub wake_settle_ms: u64,
    /// Pause after a control write so the device can act on it, in
    /// milliseconds.
    pub post_command_ms: u64,
    /// Length of an explicit discovery scan, in seconds.
    pub discovery_secs: u16,
}

impl BleConfig {
    #[must_use]
    pub fn scan_window(&self) -> Duration {
        Duration::from_secs(u64::from(self.scan_window_secs))
    }

    #[must_use]
    pub fn wake_settle(&self) -> Duration {
        Duration::from_millis(self.wake_settle_ms)
    }

    #[must_use]
    pub fn post_command(&self) -> Duration {
        Duration::from_millis(self.post_command_ms)
    }

    #[must_use]
    pub fn discovery_window(&self) -> Duration {
        Duration::from_secs(u64::from(self.discovery_secs))
    }
}

impl Default for BleConfig {
    fn default() -> Self {
        Self {
            scan_window_secs: 10,
            wake_settle_ms: 1_000,
            post_command_ms: 1_500,
            discovery_secs: 10,
        }
    }
}
