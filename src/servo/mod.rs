pub mod lock;
pub mod manager;
pub mod models;

pub use manager::ServoBus;
pub use models::*;

use std::fmt;

use serde::{Deserialize, Serialize};

use crate::config::ConfigError;
use crate::serial::{CommError, CommResult};

/// What happened to the lock bit after a protected write failed.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum Compensation {
    /// The servo was locked again.
    Relocked,
    /// The re-lock failed too; the servo may still be unlocked.
    RelockFailed(String),
}

impl fmt::Display for Compensation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Compensation::Relocked => f.write_str("servo re-locked"),
            Compensation::RelockFailed(reason) => write!(f, "re-lock also failed: {}", reason),
        }
    }
}

#[derive(Debug, thiserror::Error)]
pub enum ServoError {
    #[error("Servo bus not connected")]
    NotConnected,

    #[error("Connection failed: {0}")]
    ConnectionFailed(String),

    #[error(transparent)]
    Comm(#[from] CommError),

    #[error("{operation} failed: {result}")]
    SyncWrite {
        operation: &'static str,
        result: CommResult,
    },

    #[error("Invalid servo id {0} (expected 1-252)")]
    InvalidId(u8),

    #[error("Invalid position {0} (expected 0-4095)")]
    InvalidPosition(f64),

    #[error("Invalid baud rate index {0} (expected 0-7)")]
    InvalidBaudRate(u8),

    #[error("{operation} on servo {id} failed, {compensation}: {source}")]
    ProtectedWrite {
        operation: &'static str,
        id: u8,
        compensation: Compensation,
        source: CommError,
    },

    #[error("{operation} could not lock servo {id}, it may be left unlocked and unsafe to power cycle: {source}")]
    LeftUnlocked {
        operation: &'static str,
        id: u8,
        source: CommError,
    },

    #[error("Configuration error: {0}")]
    Config(#[from] ConfigError),
}

impl ServoError {
    /// Rejected before any bus I/O took place.
    pub fn is_validation(&self) -> bool {
        matches!(
            self,
            ServoError::InvalidId(_)
                | ServoError::InvalidPosition(_)
                | ServoError::InvalidBaudRate(_)
        )
    }
}

pub type Result<T> = std::result::Result<T, ServoError>;
