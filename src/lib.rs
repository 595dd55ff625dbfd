//! Driver for half-duplex Feetech SCS/STS serial servo buses.
//!
//! [`ServoBus`] is the entry point: connect it with [`ConnectOptions`], then
//! read and write servo registers by id. The `serial` module holds the
//! lower layers (transport, packet codec, protocol engine, group
//! transactions) for callers that need raw access.

pub mod config;
pub mod serial;
pub mod servo;

pub use config::{BusConfig, ConfigError, ConnectOptions, ProtocolVariant};
pub use serial::{CommError, CommResult, SerialError, SerialPortIO, TransportProvider};
pub use servo::{BaudRate, Compensation, ConnectionState, OperatingMode, ServoBus, ServoError};
