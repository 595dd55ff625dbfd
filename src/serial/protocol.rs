use std::fmt;
use std::time::Instant;

use serde::{Deserialize, Serialize};
use tokio::sync::Mutex;

use super::interface::SerialInterface;
use super::packet::{self, instruction, FrameScan, Packet, BROADCAST_ID, MIN_PACKET_LEN};
use super::SerialError;

/// Byte order used for two-byte registers.
///
/// STS servos store words low byte first, the older SCS family high byte
/// first.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ProtocolVariant {
    #[default]
    Sts,
    Scs,
}

impl ProtocolVariant {
    pub fn encode_word(self, value: u16) -> [u8; 2] {
        match self {
            ProtocolVariant::Sts => value.to_le_bytes(),
            ProtocolVariant::Scs => value.to_be_bytes(),
        }
    }

    pub fn decode_word(self, bytes: [u8; 2]) -> u16 {
        match self {
            ProtocolVariant::Sts => u16::from_le_bytes(bytes),
            ProtocolVariant::Scs => u16::from_be_bytes(bytes),
        }
    }
}

/// Outcome classification of one bus transaction.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum CommResult {
    Success,
    TxFail,
    RxFail,
    RxTimeout,
    RxCorrupt,
    NotAvailable,
}

impl CommResult {
    pub fn is_success(self) -> bool {
        self == CommResult::Success
    }

    pub fn text(self) -> &'static str {
        match self {
            CommResult::Success => "Communication success",
            CommResult::TxFail => "Failed to transmit instruction packet",
            CommResult::RxFail => "Failed to get status packet from device",
            CommResult::RxTimeout => "There is no status packet",
            CommResult::RxCorrupt => "Incorrect status packet",
            CommResult::NotAvailable => "Protocol does not support this function",
        }
    }
}

impl fmt::Display for CommResult {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.text())
    }
}

/// Register width in bytes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Width {
    Byte,
    Word,
}

impl Width {
    pub fn size(self) -> usize {
        match self {
            Width::Byte => 1,
            Width::Word => 2,
        }
    }
}

/// A transaction that did not end in [`CommResult::Success`].
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("{operation} failed for servo {id}: {result} (error byte 0x{error:02X})")]
pub struct CommError {
    pub operation: &'static str,
    pub id: u8,
    pub result: CommResult,
    pub error: u8,
}

/// Value, comm result and hardware error byte of one transaction.
///
/// `value` is only meaningful when `result` is [`CommResult::Success`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TxRxResult<T = Vec<u8>> {
    pub value: T,
    pub result: CommResult,
    pub error: u8,
}

impl<T: Default> TxRxResult<T> {
    fn failed(result: CommResult) -> Self {
        Self {
            value: T::default(),
            result,
            error: 0,
        }
    }
}

impl<T> TxRxResult<T> {
    fn map<U>(self, f: impl FnOnce(T) -> U) -> TxRxResult<U> {
        TxRxResult {
            value: f(self.value),
            result: self.result,
            error: self.error,
        }
    }

    /// Turn a non-success result into a [`CommError`] naming `operation`.
    ///
    /// A set hardware error byte on a successful transaction is logged but
    /// does not fail it.
    pub fn check(self, operation: &'static str, id: u8) -> Result<T, CommError> {
        if !self.result.is_success() {
            return Err(CommError {
                operation,
                id,
                result: self.result,
                error: self.error,
            });
        }
        if self.error != 0 {
            log::warn!(
                "{} on servo {} reported hardware error 0x{:02X}: {}",
                operation,
                id,
                self.error,
                packet::hardware_error_text(self.error)
            );
        }
        Ok(self.value)
    }
}

/// Executes request/response transactions over one port.
///
/// The port sits behind an async mutex held for the whole transaction, so
/// concurrent callers never interleave bytes on the wire.
pub struct PacketHandler {
    port: Mutex<SerialInterface>,
    variant: ProtocolVariant,
}

impl PacketHandler {
    pub fn new(port: SerialInterface, variant: ProtocolVariant) -> Self {
        Self {
            port: Mutex::new(port),
            variant,
        }
    }

    pub fn variant(&self) -> ProtocolVariant {
        self.variant
    }

    pub async fn port_name(&self) -> String {
        self.port.lock().await.port_name()
    }

    pub async fn close(&self) -> super::Result<()> {
        self.port.lock().await.close().await
    }

    /// Send an instruction that produces no status packet.
    pub async fn tx_only(&self, id: u8, instruction: u8, params: &[u8]) -> CommResult {
        let mut port = self.port.lock().await;
        send_packet(&mut port, id, instruction, params).await
    }

    /// Send an instruction to one servo and wait for its status packet
    /// carrying exactly `response_width` parameter bytes.
    pub async fn tx_rx(
        &self,
        id: u8,
        instruction: u8,
        params: &[u8],
        response_width: usize,
    ) -> TxRxResult {
        if id == BROADCAST_ID {
            return TxRxResult::failed(CommResult::NotAvailable);
        }

        let mut port = self.port.lock().await;
        let sent = send_packet(&mut port, id, instruction, params).await;
        if !sent.is_success() {
            return TxRxResult::failed(sent);
        }

        match receive_packet(&mut port, id, MIN_PACKET_LEN + response_width).await {
            Ok(status) if status.params.len() == response_width => TxRxResult {
                error: status.error(),
                value: status.params,
                result: CommResult::Success,
            },
            Ok(status) => {
                log::warn!(
                    "Servo {} answered with {} data bytes, expected {}",
                    id,
                    status.params.len(),
                    response_width
                );
                TxRxResult {
                    value: Vec::new(),
                    result: CommResult::RxCorrupt,
                    error: status.error(),
                }
            }
            Err(result) => TxRxResult::failed(result),
        }
    }

    pub async fn ping(&self, id: u8) -> TxRxResult<()> {
        self.tx_rx(id, instruction::PING, &[], 0).await.map(|_| ())
    }

    pub async fn read_bytes(&self, id: u8, address: u8, len: u8) -> TxRxResult {
        self.tx_rx(id, instruction::READ, &[address, len], len as usize)
            .await
    }

    /// Read a one or two byte register as an unsigned integer.
    pub async fn read_register(&self, id: u8, address: u8, width: Width) -> TxRxResult<u16> {
        let variant = self.variant;
        self.read_bytes(id, address, width.size() as u8)
            .await
            .map(|data| match data.as_slice() {
                [b] => *b as u16,
                [a, b] => variant.decode_word([*a, *b]),
                _ => 0,
            })
    }

    pub async fn write_bytes(&self, id: u8, address: u8, data: &[u8]) -> TxRxResult<()> {
        let mut params = Vec::with_capacity(data.len() + 1);
        params.push(address);
        params.extend_from_slice(data);
        self.tx_rx(id, instruction::WRITE, &params, 0).await.map(|_| ())
    }

    pub async fn write_register(
        &self,
        id: u8,
        address: u8,
        value: u16,
        width: Width,
    ) -> TxRxResult<()> {
        let bytes = self.register_bytes(value, width);
        self.write_bytes(id, address, &bytes).await
    }

    /// Stage a write that only takes effect on the next [`action`](Self::action).
    pub async fn reg_write_bytes(&self, id: u8, address: u8, data: &[u8]) -> TxRxResult<()> {
        let mut params = Vec::with_capacity(data.len() + 1);
        params.push(address);
        params.extend_from_slice(data);
        self.tx_rx(id, instruction::REG_WRITE, &params, 0)
            .await
            .map(|_| ())
    }

    /// Trigger every staged write on the bus at once.
    pub async fn action(&self) -> CommResult {
        self.tx_only(BROADCAST_ID, instruction::ACTION, &[]).await
    }

    /// Broadcast one SYNC_WRITE frame. `param` is the concatenation of
    /// `(id, data)` blocks, each `data_len` bytes of data.
    pub async fn sync_write_tx_only(&self, address: u8, data_len: u8, param: &[u8]) -> CommResult {
        let mut params = Vec::with_capacity(param.len() + 2);
        params.push(address);
        params.push(data_len);
        params.extend_from_slice(param);
        self.tx_only(BROADCAST_ID, instruction::SYNC_WRITE, &params)
            .await
    }

    pub fn register_bytes(&self, value: u16, width: Width) -> Vec<u8> {
        match width {
            Width::Byte => vec![value as u8],
            Width::Word => self.variant.encode_word(value).to_vec(),
        }
    }
}

async fn send_packet(
    port: &mut SerialInterface,
    id: u8,
    instruction: u8,
    params: &[u8],
) -> CommResult {
    let pkt = match packet::encode(id, instruction, params) {
        Ok(pkt) => pkt,
        Err(e) => {
            log::error!("Refusing to send instruction 0x{:02X} to {}: {}", instruction, id, e);
            return CommResult::TxFail;
        }
    };

    if let Err(e) = port.clear_input().await {
        log::warn!("Could not clear receive buffer: {}", e);
        return CommResult::TxFail;
    }

    log::debug!("TX {}", hex::encode(&pkt));
    match port.send_data(&pkt).await {
        Ok(n) if n == pkt.len() => CommResult::Success,
        Ok(n) => {
            log::warn!("Short write: {} of {} bytes", n, pkt.len());
            CommResult::TxFail
        }
        Err(e) => {
            log::warn!("Transmit failed: {}", e);
            CommResult::TxFail
        }
    }
}

/// Wait for a status packet from `id`, skipping line noise and packets from
/// other servos.
async fn receive_packet(
    port: &mut SerialInterface,
    id: u8,
    expected_len: usize,
) -> Result<Packet, CommResult> {
    let deadline = Instant::now() + port.packet_timeout(expected_len);
    let mut buf: Vec<u8> = Vec::with_capacity(expected_len);
    let mut chunk = [0u8; 64];

    loop {
        loop {
            match packet::scan_frame(&buf) {
                FrameScan::Incomplete => break,
                FrameScan::Discard(n) => {
                    log::debug!("RX discarding {}", hex::encode(&buf[..n]));
                    buf.drain(..n);
                }
                FrameScan::Frame(n) => {
                    let frame: Vec<u8> = buf.drain(..n).collect();
                    log::debug!("RX {}", hex::encode(&frame));
                    match packet::decode(&frame) {
                        Ok(status) if status.id == id => return Ok(status),
                        Ok(status) => {
                            log::debug!("Ignoring status packet from servo {}", status.id);
                        }
                        Err(e) => {
                            log::warn!("Corrupt status packet from servo {}: {}", id, e);
                            return Err(CommResult::RxCorrupt);
                        }
                    }
                }
            }
        }

        let remaining = deadline.saturating_duration_since(Instant::now());
        if remaining.is_zero() {
            break;
        }
        let wait_ms = (remaining.as_millis() as u64).max(1);
        match port.read_data(&mut chunk, wait_ms).await {
            Ok(n) => buf.extend_from_slice(&chunk[..n]),
            Err(SerialError::Timeout) => break,
            Err(e) => {
                log::warn!("Receive failed: {}", e);
                return Err(CommResult::RxFail);
            }
        }
    }

    if buf.is_empty() {
        Err(CommResult::RxTimeout)
    } else {
        Err(CommResult::RxCorrupt)
    }
}
