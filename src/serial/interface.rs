use std::time::Duration;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::time::timeout;
use tokio_serial::{
    ClearBuffer, DataBits, FlowControl, Parity, SerialPort, SerialPortBuilderExt, SerialStream,
    StopBits,
};

use super::{Result, SerialError, SerialPortIO};

pub const DEFAULT_BAUD_RATE: u32 = 1_000_000;
pub const DEFAULT_LATENCY_TIMER_MS: u64 = 50;

/// Serial device backed by the operating system's driver.
pub struct NativeSerialPort {
    port_name: String,
    stream: Option<SerialStream>,
}

impl NativeSerialPort {
    pub fn new(port_name: impl Into<String>) -> Self {
        Self {
            port_name: port_name.into(),
            stream: None,
        }
    }
}

#[async_trait::async_trait]
impl SerialPortIO for NativeSerialPort {
    async fn open(&mut self, baud_rate: u32) -> Result<()> {
        // Servo buses are always 8N1 without flow control
        let stream = tokio_serial::new(&self.port_name, baud_rate)
            .data_bits(DataBits::Eight)
            .stop_bits(StopBits::One)
            .parity(Parity::None)
            .flow_control(FlowControl::None)
            .timeout(Duration::from_millis(1000))
            .open_native_async()
            .map_err(|e| SerialError::ConnectionFailed(e.to_string()))?;

        self.stream = Some(stream);
        Ok(())
    }

    async fn close(&mut self) -> Result<()> {
        if let Some(mut stream) = self.stream.take() {
            AsyncWriteExt::shutdown(&mut stream).await?;
        }
        Ok(())
    }

    async fn send_data(&mut self, data: &[u8]) -> Result<usize> {
        let stream = self.stream.as_mut().ok_or(SerialError::NotOpen)?;
        AsyncWriteExt::write_all(&mut *stream, data).await?;
        AsyncWriteExt::flush(&mut *stream).await?;
        Ok(data.len())
    }

    async fn read_data(&mut self, buf: &mut [u8], timeout_ms: u64) -> Result<usize> {
        let stream = self.stream.as_mut().ok_or(SerialError::NotOpen)?;
        let read = AsyncReadExt::read(&mut *stream, buf);
        match timeout(Duration::from_millis(timeout_ms), read).await {
            Ok(Ok(0)) => Err(SerialError::IoError(std::io::ErrorKind::UnexpectedEof.into())),
            Ok(Ok(n)) => Ok(n),
            Ok(Err(e)) if e.kind() == std::io::ErrorKind::TimedOut => Err(SerialError::Timeout),
            Ok(Err(e)) => Err(SerialError::IoError(e)),
            Err(_) => Err(SerialError::Timeout),
        }
    }

    async fn clear_input(&mut self) -> Result<()> {
        let stream = self.stream.as_mut().ok_or(SerialError::NotOpen)?;
        SerialPort::clear(&*stream, ClearBuffer::Input)
            .map_err(|e| SerialError::ConnectionFailed(e.to_string()))
    }

    fn port_name(&self) -> String {
        self.port_name.clone()
    }
}

/// Hands out a fresh, not yet opened transport for each connection attempt.
#[async_trait::async_trait]
pub trait TransportProvider: Send + Sync {
    async fn acquire(&self) -> Result<Box<dyn SerialPortIO>>;
}

/// Provides a [`NativeSerialPort`] for a fixed device path.
pub struct NativePortProvider {
    port_name: String,
}

impl NativePortProvider {
    pub fn new(port_name: impl Into<String>) -> Self {
        Self {
            port_name: port_name.into(),
        }
    }
}

#[async_trait::async_trait]
impl TransportProvider for NativePortProvider {
    async fn acquire(&self) -> Result<Box<dyn SerialPortIO>> {
        let available = serialport::available_ports()?;
        if !available.iter().any(|p| p.port_name == self.port_name) {
            return Err(SerialError::PortNotFound(self.port_name.clone()));
        }
        Ok(Box::new(NativeSerialPort::new(self.port_name.clone())))
    }
}

/// The bus port: sole owner of one transport for its whole open lifetime.
pub struct SerialInterface {
    io: Box<dyn SerialPortIO>,
    is_open: bool,
    baud_rate: u32,
    latency_timer_ms: u64,
}

impl SerialInterface {
    pub fn from_io(io: Box<dyn SerialPortIO>) -> Self {
        Self {
            io,
            is_open: false,
            baud_rate: DEFAULT_BAUD_RATE,
            latency_timer_ms: DEFAULT_LATENCY_TIMER_MS,
        }
    }

    pub fn with_latency_timer(mut self, latency_timer_ms: u64) -> Self {
        self.latency_timer_ms = latency_timer_ms;
        self
    }

    pub async fn open(&mut self, baud_rate: u32) -> Result<()> {
        self.io.open(baud_rate).await?;
        self.is_open = true;
        self.baud_rate = baud_rate;
        log::info!("Opened {} at {} baud", self.io.port_name(), baud_rate);
        Ok(())
    }

    pub async fn close(&mut self) -> Result<()> {
        self.is_open = false;
        self.io.close().await
    }

    pub fn is_open(&self) -> bool {
        self.is_open
    }

    pub fn baud_rate(&self) -> u32 {
        self.baud_rate
    }

    pub fn port_name(&self) -> String {
        self.io.port_name()
    }

    /// Time allowed for receiving a status packet of `packet_len` bytes.
    pub fn packet_timeout(&self, packet_len: usize) -> Duration {
        let byte_time_ms = 10_000.0 / self.baud_rate.max(1) as f64;
        let ms = byte_time_ms * (packet_len + 3) as f64 + self.latency_timer_ms as f64;
        Duration::from_secs_f64(ms / 1000.0)
    }

    pub async fn send_data(&mut self, data: &[u8]) -> Result<usize> {
        if !self.is_open {
            return Err(SerialError::NotOpen);
        }
        self.io.send_data(data).await
    }

    pub async fn read_data(&mut self, buf: &mut [u8], timeout_ms: u64) -> Result<usize> {
        if !self.is_open {
            return Err(SerialError::NotOpen);
        }
        self.io.read_data(buf, timeout_ms).await
    }

    pub async fn clear_input(&mut self) -> Result<()> {
        if !self.is_open {
            return Err(SerialError::NotOpen);
        }
        self.io.clear_input().await
    }
}
