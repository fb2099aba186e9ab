//! Configuration loading — TOML file with environment variable overrides.
//!
//! Looks for `valvehub.toml` in the working directory. Every field has a
//! sensible default so the file is optional. Environment variables take
//! precedence over file values.

use std::path::PathBuf;
use std::time::Duration;

use serde::Deserialize;

use valvehub_adapter_ble::BleConfig;
use valvehub_app::connection::ConnectionConfig;
use valvehub_app::services::valve_service::ValveConfig;
use valvehub_domain::command::IrrigationMinutes;
use valvehub_domain::identity::{BleAddress, DEFAULT_NAME, DeviceIdentity};

/// Address the virtual controller uses when none is configured.
const VIRTUAL_ADDRESS: BleAddress = BleAddress::from_bytes([0x02, 0x00, 0x00, 0x00, 0x00, 0x01]);

/// Top-level configuration.
#[derive(Debug, Default, Deserialize)]
#[serde(default)]
pub struct Config {
    /// The controller this daemon drives.
    pub device: DeviceConfig,
    /// Connection manager limits.
    pub connection: ConnectionSection,
    /// Verification, polling and failure thresholds.
    pub timing: TimingConfig,
    /// BLE transport settings.
    pub ble: BleConfig,
    /// Logging settings.
    pub logging: LoggingConfig,
    /// Which transport to use.
    pub transport: TransportConfig,
}

#[derive(Debug, Deserialize)]
#[serde(default)]
pub struct DeviceConfig {
    /// Controller address (`AA:BB:CC:DD:EE:FF`). Required for BLE.
    pub address: Option<String>,
    pub name: String,
    /// Minutes for a plain `open`; `0` opens untimed.
    pub default_duration: u32,
    /// Whether background polling starts enabled.
    pub scanning: bool,
    /// Where to persist the cached status between runs.
    pub cache_file: Option<PathBuf>,
}

#[derive(Debug, Deserialize)]
#[serde(default)]
pub struct ConnectionSection {
    pub connect_timeout_secs: u64,
    pub command_timeout_secs: u64,
    pub connect_attempts: u32,
    pub backoff_base_ms: u64,
    pub backoff_cap_ms: u64,
}

#[derive(Debug, Deserialize)]
#[serde(default)]
pub struct TimingConfig {
    pub settle_delay_ms: u64,
    pub verify_reads: u32,
    pub verify_delay_ms: u64,
    pub poll_interval_secs: u64,
    /// How often the scheduler asks whether a poll is due.
    pub check_interval_secs: u64,
    pub confirm_retry_secs: u64,
    pub max_consecutive_failures: u32,
    pub scan_off_after_irrigation: bool,
}

/// Logging configuration.
#[derive(Debug, Deserialize)]
#[serde(default)]
pub struct LoggingConfig {
    /// Filter directive (`RUST_LOG` syntax).
    pub filter: String,
}

#[derive(Debug, Default, Deserialize)]
#[serde(default)]
pub struct TransportConfig {
    pub kind: Transport,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Transport {
    #[default]
    Ble,
    /// In-memory simulated controller.
    Virtual,
}

impl std::str::FromStr for Transport {
    type Err = ConfigError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "ble" => Ok(Self::Ble),
            "virtual" => Ok(Self::Virtual),
            other => Err(ConfigError::Validation(format!(
                "unknown transport {other:?}, expected \"ble\" or \"virtual\""
            ))),
        }
    }
}

impl Config {
    /// Load configuration from `valvehub.toml` (if present), apply
    /// environment-variable overrides, then validate.
    ///
    /// # Errors
    ///
    /// Returns an error if the TOML file exists but is malformed, an
    /// override cannot be parsed, or validation fails.
    pub fn load() -> Result<Self, ConfigError> {
        let mut config = Self::from_file("valvehub.toml")?;
        config.apply_overrides(|key| std::env::var(key).ok())?;
        config.validate()?;
        Ok(config)
    }

    fn from_file(path: &str) -> Result<Self, ConfigError> {
        match std::fs::read_to_string(path) {
            Ok(content) => toml::from_str(&content).map_err(ConfigError::Parse),
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => Ok(Self::default()),
            Err(err) => Err(ConfigError::Io(err)),
        }
    }

    fn apply_overrides(&mut self, var: impl Fn(&str) -> Option<String>) -> Result<(), ConfigError> {
        if let Some(val) = var("VALVEHUB_ADDRESS") {
            self.device.address = Some(val);
        }
        if let Some(val) = var("VALVEHUB_NAME") {
            self.device.name = val;
        }
        if let Some(val) = var("VALVEHUB_TRANSPORT") {
            self.transport.kind = val.parse()?;
        }
        if let Some(val) = var("VALVEHUB_DURATION") {
            self.device.default_duration = val.trim().parse().map_err(|_| {
                ConfigError::Validation(format!("VALVEHUB_DURATION must be minutes, got {val:?}"))
            })?;
        }
        if let Some(val) = var("VALVEHUB_SCANNING") {
            self.device.scanning = parse_flag(&val).ok_or_else(|| {
                ConfigError::Validation(format!("VALVEHUB_SCANNING must be on or off, got {val:?}"))
            })?;
        }
        if let Some(val) = var("VALVEHUB_LOG") {
            self.logging.filter = val;
        }
        if let Some(val) = var("RUST_LOG") {
            self.logging.filter = val;
        }
        Ok(())
    }

    fn validate(&self) -> Result<(), ConfigError> {
        if self.transport.kind == Transport::Ble && self.device.address.is_none() {
            return Err(ConfigError::Validation(
                "device.address is required for the ble transport".to_string(),
            ));
        }
        self.address()?;
        IrrigationMinutes::optional(self.device.default_duration)
            .map_err(|err| ConfigError::Validation(format!("device.default_duration: {err}")))?;
        if self.connection.connect_attempts == 0 {
            return Err(ConfigError::Validation(
                "connection.connect_attempts must be non-zero".to_string(),
            ));
        }
        if self.connection.connect_timeout_secs == 0 || self.connection.command_timeout_secs == 0 {
            return Err(ConfigError::Validation(
                "connection timeouts must be non-zero".to_string(),
            ));
        }
        if self.timing.verify_reads == 0 {
            return Err(ConfigError::Validation(
                "timing.verify_reads must be non-zero".to_string(),
            ));
        }
        if self.timing.poll_interval_secs == 0 || self.timing.check_interval_secs == 0 {
            return Err(ConfigError::Validation(
                "timing intervals must be non-zero".to_string(),
            ));
        }
        Ok(())
    }

    fn address(&self) -> Result<Option<BleAddress>, ConfigError> {
        self.device
            .address
            .as_deref()
            .map(|raw| {
                raw.parse().map_err(|_| {
                    ConfigError::Validation(format!("device.address {raw:?} is not a BLE address"))
                })
            })
            .transpose()
    }

    /// Identity of the configured controller.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError::Validation`] for a malformed address.
    pub fn identity(&self) -> Result<DeviceIdentity, ConfigError> {
        let address = self.address()?.unwrap_or(VIRTUAL_ADDRESS);
        Ok(DeviceIdentity::new(address, self.device.name.clone()))
    }

    #[must_use]
    pub fn connection(&self) -> ConnectionConfig {
        let section = &self.connection;
        ConnectionConfig {
            connect_timeout: Duration::from_secs(section.connect_timeout_secs),
            command_timeout: Duration::from_secs(section.command_timeout_secs),
            connect_attempts: section.connect_attempts,
            backoff_base: Duration::from_millis(section.backoff_base_ms),
            backoff_cap: Duration::from_millis(section.backoff_cap_ms),
        }
    }

    /// # Errors
    ///
    /// Returns [`ConfigError::Validation`] for an out-of-range default
    /// duration.
    pub fn valve(&self) -> Result<ValveConfig, ConfigError> {
        let timing = &self.timing;
        Ok(ValveConfig {
            default_duration: IrrigationMinutes::optional(self.device.default_duration)
                .map_err(|err| ConfigError::Validation(format!("device.default_duration: {err}")))?,
            scanning: self.device.scanning,
            settle_delay: Duration::from_millis(timing.settle_delay_ms),
            verify_reads: timing.verify_reads,
            verify_delay: Duration::from_millis(timing.verify_delay_ms),
            poll_interval: Duration::from_secs(timing.poll_interval_secs),
            confirm_retry: Duration::from_secs(timing.confirm_retry_secs),
            max_consecutive_failures: timing.max_consecutive_failures,
            scan_off_after_irrigation: timing.scan_off_after_irrigation,
        })
    }

    #[must_use]
    pub fn check_interval(&self) -> Duration {
        Duration::from_secs(self.timing.check_interval_secs)
    }
}

fn parse_flag(value: &str) -> Option<bool> {
    match value.trim().to_ascii_lowercase().as_str() {
        "1" | "true" | "on" | "yes" => Some(true),
        "0" | "false" | "off" | "no" => Some(false),
        _ => None,
    }
}

impl Default for DeviceConfig {
    fn default() -> Self {
        Self {
            address: None,
            name: DEFAULT_NAME.to_string(),
            default_duration: 20,
            scanning: true,
            cache_file: None,
        }
    }
}

impl Default for ConnectionSection {
    fn default() -> Self {
        Self {
            connect_timeout_secs: 30,
            command_timeout_secs: 10,
            connect_attempts: 3,
            backoff_base_ms: 1_000,
            backoff_cap_ms: 4_000,
        }
    }
}

impl Default for TimingConfig {
    fn default() -> Self {
        Self {
            settle_delay_ms: 1_500,
            verify_reads: 3,
            verify_delay_ms: 1_500,
            poll_interval_secs: 300,
            check_interval_secs: 5,
            confirm_retry_secs: 30,
            max_consecutive_failures: 5,
            scan_off_after_irrigation: false,
        }
    }
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            filter: "valvehubd=info,valvehub_app=info,valvehub_adapter_ble=info".to_string(),
        }
    }
}

/// Configuration errors.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    /// TOML parse failure.
    #[error("failed to parse config file")]
    Parse(#[from] toml::de::Error),
    /// File I/O failure.
    #[error("failed to read config file")]
    Io(#[from] std::io::Error),
    /// Semantic validation failure.
    #[error("invalid configuration: {0}")]
    Validation(String),
}
