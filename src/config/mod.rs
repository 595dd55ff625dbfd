use std::path::Path;

use serde::{Deserialize, Serialize};

use crate::serial::interface::{DEFAULT_BAUD_RATE, DEFAULT_LATENCY_TIMER_MS};
pub use crate::serial::protocol::ProtocolVariant;
use crate::servo::BaudRate;

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("Could not read config: {0}")]
    Io(#[from] std::io::Error),

    #[error("Could not parse config: {0}")]
    Parse(#[from] serde_json::Error),

    #[error("Invalid configuration: {0}")]
    Invalid(String),
}

pub type Result<T> = std::result::Result<T, ConfigError>;

/// Settings applied when a bus connection is opened.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct ConnectOptions {
    pub baud_rate: u32,
    pub protocol: ProtocolVariant,
    pub latency_timer_ms: u64,
}

impl Default for ConnectOptions {
    fn default() -> Self {
        Self {
            baud_rate: DEFAULT_BAUD_RATE,
            protocol: ProtocolVariant::default(),
            latency_timer_ms: DEFAULT_LATENCY_TIMER_MS,
        }
    }
}

impl ConnectOptions {
    pub fn with_baud_rate(mut self, baud_rate: u32) -> Self {
        self.baud_rate = baud_rate;
        self
    }

    pub fn with_protocol(mut self, protocol: ProtocolVariant) -> Self {
        self.protocol = protocol;
        self
    }

    /// Only rates the servos themselves can be configured for are accepted.
    pub fn validate(&self) -> Result<()> {
        if BaudRate::from_bits_per_second(self.baud_rate).is_none() {
            return Err(ConfigError::Invalid(format!(
                "unsupported baud rate {}",
                self.baud_rate
            )));
        }
        if self.latency_timer_ms == 0 {
            return Err(ConfigError::Invalid("latency timer must be non-zero".into()));
        }
        Ok(())
    }
}

fn default_baud_rate() -> u32 {
    DEFAULT_BAUD_RATE
}

fn default_latency_timer_ms() -> u64 {
    DEFAULT_LATENCY_TIMER_MS
}

/// On-disk bus description, e.g.
///
/// ```json
/// { "port_name": "/dev/ttyUSB0", "baud_rate": 1000000, "protocol": "sts" }
/// ```
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct BusConfig {
    pub port_name: String,
    #[serde(default = "default_baud_rate")]
    pub baud_rate: u32,
    #[serde(default)]
    pub protocol: ProtocolVariant,
    #[serde(default = "default_latency_timer_ms")]
    pub latency_timer_ms: u64,
}

impl BusConfig {
    pub fn new(port_name: impl Into<String>) -> Self {
        Self {
            port_name: port_name.into(),
            baud_rate: DEFAULT_BAUD_RATE,
            protocol: ProtocolVariant::default(),
            latency_timer_ms: DEFAULT_LATENCY_TIMER_MS,
        }
    }

    pub fn from_json_str(json: &str) -> Result<Self> {
        let config: BusConfig = serde_json::from_str(json)?;
        config.validate()?;
        Ok(config)
    }

    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let text = std::fs::read_to_string(path.as_ref())?;
        log::debug!("Loaded bus config from {}", path.as_ref().display());
        Self::from_json_str(&text)
    }

    pub fn validate(&self) -> Result<()> {
        if self.port_name.trim().is_empty() {
            return Err(ConfigError::Invalid("port_name is empty".into()));
        }
        self.connect_options().validate()
    }

    pub fn connect_options(&self) -> ConnectOptions {
        ConnectOptions {
            baud_rate: self.baud_rate,
            protocol: self.protocol,
            latency_timer_ms: self.latency_timer_ms,
        }
    }
}
