pub mod group;
pub mod interface;
pub mod packet;
pub mod protocol;

pub use group::{GroupSyncRead, GroupSyncWrite};
pub use interface::{NativePortProvider, NativeSerialPort, SerialInterface, TransportProvider};
pub use packet::{DecodeError, EncodeError, Packet};
pub use protocol::{CommError, CommResult, PacketHandler, ProtocolVariant, TxRxResult, Width};

#[derive(Debug, thiserror::Error)]
pub enum SerialError {
    #[error("Port not found: {0}")]
    PortNotFound(String),

    #[error("Connection failed: {0}")]
    ConnectionFailed(String),

    #[error("Communication timeout")]
    Timeout,

    #[error("Port is not open")]
    NotOpen,

    #[error("IO error: {0}")]
    IoError(#[from] std::io::Error),

    #[error("Serialport error: {0}")]
    SerialportError(#[from] serialport::Error),
}

pub type Result<T> = std::result::Result<T, SerialError>;

/// Byte-oriented half-duplex channel underneath a [`SerialInterface`].
///
/// Implementations only move bytes; framing, timeouts per transaction and
/// serialization of transactions are handled above this trait.
#[async_trait::async_trait]
pub trait SerialPortIO: Send {
    /// Open (or reopen) the channel at the given baud rate.
    async fn open(&mut self, baud_rate: u32) -> Result<()>;

    /// Close the channel. Closing an already closed channel is not an error.
    async fn close(&mut self) -> Result<()>;

    async fn send_data(&mut self, data: &[u8]) -> Result<usize>;

    /// Read whatever is available, waiting at most `timeout_ms` for the first
    /// byte. Returns [`SerialError::Timeout`] when nothing arrived.
    async fn read_data(&mut self, buf: &mut [u8], timeout_ms: u64) -> Result<usize>;

    /// Drop any bytes still sitting in the receive buffer.
    async fn clear_input(&mut self) -> Result<()>;

    fn port_name(&self) -> String;
}
