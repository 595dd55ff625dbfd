//! SCS/STS packet framing.
//!
//! Frame layout, shared by instruction and status packets:
//!
//! ```text
//! FF FF | ID | LEN | INST/ERR | PARAM... | CHK
//! ```
//!
//! `LEN` counts the instruction (or error) byte, the parameters and the
//! checksum. `CHK` is the inverted low byte of the sum of every byte from
//! `ID` up to the last parameter.

pub const HEADER: [u8; 2] = [0xFF, 0xFF];

pub const BROADCAST_ID: u8 = 0xFE;
pub const MIN_ID: u8 = 1;
pub const MAX_ID: u8 = 0xFC;

/// Largest frame the servo firmware accepts or emits.
pub const TXPACKET_MAX_LEN: usize = 250;
pub const RXPACKET_MAX_LEN: usize = 250;

/// Smallest valid frame: header, id, length, instruction/error, checksum.
pub const MIN_PACKET_LEN: usize = 6;

/// Indexes within every frame
pub mod idx {
    pub const ID: usize = 2;
    pub const LENGTH: usize = 3;
    pub const INSTRUCTION: usize = 4;
    pub const ERROR: usize = 4;
    pub const PARAM_0: usize = 5;
}

pub mod instruction {
    pub const PING: u8 = 0x01;
    pub const READ: u8 = 0x02;
    pub const WRITE: u8 = 0x03;
    pub const REG_WRITE: u8 = 0x04;
    pub const ACTION: u8 = 0x05;
    pub const SYNC_WRITE: u8 = 0x83;
}

/// Error bits reported in the status packet
pub mod errbit {
    pub const VOLTAGE: u8 = 1 << 0;
    pub const ANGLE: u8 = 1 << 1;
    pub const OVERHEAT: u8 = 1 << 2;
    pub const OVERELE: u8 = 1 << 3;
    pub const OVERLOAD: u8 = 1 << 5;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
pub enum EncodeError {
    #[error("Packet of {0} bytes exceeds the {max} byte limit", max = TXPACKET_MAX_LEN)]
    TooLong(usize),
}

/// Why a received frame was rejected. Every variant means "corrupt".
#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
pub enum DecodeError {
    #[error("Packet truncated ({0} bytes)")]
    Truncated(usize),

    #[error("Missing packet header")]
    BadHeader,

    #[error("Length field {field} does not match a {actual} byte packet")]
    BadLength { field: u8, actual: usize },

    #[error("Checksum mismatch: expected 0x{expected:02X}, got 0x{actual:02X}")]
    BadChecksum { expected: u8, actual: u8 },
}

/// A decoded frame.
///
/// `code` is the instruction for outbound frames and the hardware error byte
/// for status frames.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Packet {
    pub id: u8,
    pub code: u8,
    pub params: Vec<u8>,
}

impl Packet {
    pub fn error(&self) -> u8 {
        self.code
    }
}

pub fn checksum(body: &[u8]) -> u8 {
    !body.iter().fold(0u8, |acc, &b| acc.wrapping_add(b))
}

/// Build a complete frame for `instruction` addressed to `id`.
pub fn encode(id: u8, instruction: u8, params: &[u8]) -> Result<Vec<u8>, EncodeError> {
    let total = MIN_PACKET_LEN + params.len();
    if total > TXPACKET_MAX_LEN {
        return Err(EncodeError::TooLong(total));
    }

    let mut pkt = Vec::with_capacity(total);
    pkt.extend_from_slice(&HEADER);
    pkt.push(id);
    pkt.push((params.len() + 2) as u8);
    pkt.push(instruction);
    pkt.extend_from_slice(params);
    let chk = checksum(&pkt[idx::ID..]);
    pkt.push(chk);
    Ok(pkt)
}

/// Validate and split one complete frame.
pub fn decode(bytes: &[u8]) -> Result<Packet, DecodeError> {
    if bytes.len() < MIN_PACKET_LEN {
        return Err(DecodeError::Truncated(bytes.len()));
    }
    if bytes[..2] != HEADER {
        return Err(DecodeError::BadHeader);
    }

    let field = bytes[idx::LENGTH];
    if field < 2 || field as usize + 4 != bytes.len() {
        return Err(DecodeError::BadLength {
            field,
            actual: bytes.len(),
        });
    }

    let last = bytes.len() - 1;
    let expected = checksum(&bytes[idx::ID..last]);
    if expected != bytes[last] {
        return Err(DecodeError::BadChecksum {
            expected,
            actual: bytes[last],
        });
    }

    Ok(Packet {
        id: bytes[idx::ID],
        code: bytes[idx::INSTRUCTION],
        params: bytes[idx::PARAM_0..last].to_vec(),
    })
}

/// Result of looking for a status frame at the front of a receive buffer.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FrameScan {
    /// More bytes are needed before a decision can be made.
    Incomplete,
    /// Drop this many leading bytes; they cannot start a valid frame.
    Discard(usize),
    /// A frame of this many bytes starts at offset 0.
    Frame(usize),
}

pub fn scan_frame(buf: &[u8]) -> FrameScan {
    let start = buf.windows(2).position(|w| w == HEADER);
    match start {
        None => {
            // keep a trailing 0xFF, it may be the first half of a header
            let keep = usize::from(buf.last() == Some(&HEADER[0]));
            if buf.len() > keep {
                FrameScan::Discard(buf.len() - keep)
            } else {
                FrameScan::Incomplete
            }
        }
        Some(0) => {
            if buf.len() < idx::PARAM_0 {
                return FrameScan::Incomplete;
            }
            let id = buf[idx::ID];
            let length = buf[idx::LENGTH] as usize;
            let error = buf[idx::ERROR];
            if id > 0xFD || length < 2 || length + 4 > RXPACKET_MAX_LEN || error > 0x7F {
                return FrameScan::Discard(1);
            }
            if buf.len() < length + 4 {
                FrameScan::Incomplete
            } else {
                FrameScan::Frame(length + 4)
            }
        }
        Some(n) => FrameScan::Discard(n),
    }
}

/// Human readable list of the hardware error bits set in `error`.
pub fn hardware_error_text(error: u8) -> String {
    const BITS: [(u8, &str); 5] = [
        (errbit::VOLTAGE, "Input voltage error"),
        (errbit::ANGLE, "Angle sensor error"),
        (errbit::OVERHEAT, "Overheat error"),
        (errbit::OVERELE, "Over-current error"),
        (errbit::OVERLOAD, "Overload error"),
    ];

    let parts: Vec<&str> = BITS
        .iter()
        .filter(|(bit, _)| error & bit != 0)
        .map(|(_, text)| *text)
        .collect();
    if parts.is_empty() {
        "No error".to_string()
    } else {
        parts.join(", ")
    }
}
