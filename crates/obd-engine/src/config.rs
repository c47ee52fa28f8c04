//! Engine configuration

use config::{Config, ConfigError, Environment, File};
use obd_protocol::ObdProtocol;
use obd_scheduler::SchedulerConfig;
use serde::{Deserialize, Serialize};
use std::time::Duration;

/// Engine configuration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct EngineConfig {
    pub scan: ScanConfig,

    /// Transport open timeout (milliseconds)
    pub connect_timeout_ms: u64,

    pub handshake: HandshakeConfig,

    pub scheduler: SchedulerConfig,

    pub polling: PollingConfig,

    pub logging: LoggingConfig,

    pub transport: TransportConfig,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            scan: ScanConfig::default(),
            connect_timeout_ms: 10_000,
            handshake: HandshakeConfig::default(),
            scheduler: SchedulerConfig::default(),
            polling: PollingConfig::default(),
            logging: LoggingConfig::default(),
            transport: TransportConfig::default(),
        }
    }
}

impl EngineConfig {
    /// Load from an optional file plus `OBD__`-prefixed environment variables
    ///
    /// `OBD__SCHEDULER__RETRY_LIMIT=3` overrides `scheduler.retry_limit`.
    pub fn load(path: Option<&str>) -> Result<Self, ConfigError> {
        let mut builder = Config::builder();
        if let Some(path) = path {
            builder = builder.add_source(File::with_name(path).required(false));
        }
        builder
            .add_source(Environment::with_prefix("OBD").separator("__").try_parsing(true))
            .build()?
            .try_deserialize()
    }

    pub fn connect_timeout(&self) -> Duration {
        Duration::from_millis(self.connect_timeout_ms)
    }
}

/// Device discovery settings
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ScanConfig {
    /// Scan window (milliseconds)
    pub duration_ms: u64,
    /// Connect to this device instead of the first one found
    pub device_id: Option<String>,
}

impl Default for ScanConfig {
    fn default() -> Self {
        Self {
            duration_ms: 10_000,
            device_id: None,
        }
    }
}

impl ScanConfig {
    pub fn duration(&self) -> Duration {
        Duration::from_millis(self.duration_ms)
    }
}

/// Adapter initialization settings
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct HandshakeConfig {
    /// Per-step response timeout (milliseconds)
    pub step_timeout_ms: u64,
    /// Retries per step after the first attempt
    pub retries: u32,
    /// Protocol forced with `ATSPn`; `Auto` sends `ATSP0`
    pub protocol: ObdProtocol,
}

impl Default for HandshakeConfig {
    fn default() -> Self {
        Self {
            step_timeout_ms: 2000,
            retries: 2,
            protocol: ObdProtocol::Auto,
        }
    }
}

impl HandshakeConfig {
    pub fn step_timeout(&self) -> Duration {
        Duration::from_millis(self.step_timeout_ms)
    }
}

/// Periodic snapshot settings
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct PollingConfig {
    /// Interval between snapshots (milliseconds)
    pub interval_ms: u64,
    /// Snapshots buffered for a slow consumer before new ones are dropped
    pub channel_capacity: usize,
}

impl Default for PollingConfig {
    fn default() -> Self {
        Self {
            interval_ms: 2000,
            channel_capacity: 16,
        }
    }
}

impl PollingConfig {
    pub fn interval(&self) -> Duration {
        Duration::from_millis(self.interval_ms)
    }
}

/// Log output settings
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct LoggingConfig {
    /// Maximum level: trace, debug, info, warn, error
    pub level: String,
    /// Emit JSON lines instead of human-readable text
    pub json: bool,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
            json: false,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TransportKind {
    /// Built-in ELM327 emulator
    Simulated,
    /// OS serial port (RFCOMM bridge or USB adapter)
    Serial,
}

/// Which transport backend the binary builds
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct TransportConfig {
    pub kind: TransportKind,
    /// Serial baud rate
    pub baud_rate: u32,
}

impl Default for TransportConfig {
    fn default() -> Self {
        Self {
            kind: TransportKind::Simulated,
            baud_rate: ObdProtocol::Auto.default_baud_rate(),
        }
    }
}
