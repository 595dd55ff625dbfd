use serde::{Deserialize, Serialize};

use super::{Result, ServoError};
use crate::serial::packet::{MAX_ID, MIN_ID};

/// STS/SCS memory map entries used by the driver
pub mod reg {
    /* EEPROM */
    pub const MODEL: u8 = 3; // 2 bytes
    pub const ID: u8 = 5;
    pub const BAUD_RATE: u8 = 6;
    pub const MODE: u8 = 33;
    /* SRAM */
    pub const TORQUE_ENABLE: u8 = 40;
    pub const ACCELERATION: u8 = 41;
    pub const GOAL_POSITION: u8 = 42; // 2 bytes
    pub const GOAL_SPEED: u8 = 46; // 2 bytes, sign-magnitude
    pub const LOCK: u8 = 55;
    pub const PRESENT_POSITION: u8 = 56; // 2 bytes, read-only
    pub const PRESENT_SPEED: u8 = 58; // 2 bytes, sign-magnitude
}

pub const POSITION_MAX: f64 = 4095.0;
pub const ACCELERATION_MAX: f64 = 254.0;
pub const WHEEL_SPEED_MAX: i32 = 10_000;

const SIGN_BIT: u16 = 1 << 15;

/// Facade connection lifecycle
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
pub enum ConnectionState {
    Disconnected,
    Connecting,
    Connected,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[repr(u8)]
pub enum OperatingMode {
    Position = 0,
    Wheel = 1,
}

impl OperatingMode {
    pub fn from_raw(raw: u8) -> Option<Self> {
        match raw {
            0 => Some(OperatingMode::Position),
            1 => Some(OperatingMode::Wheel),
            _ => None,
        }
    }
}

/// Baud rates selectable through the baud-rate register, by register index.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[repr(u8)]
pub enum BaudRate {
    B1M = 0,
    B500K = 1,
    B250K = 2,
    B128K = 3,
    B115200 = 4,
    B76800 = 5,
    B57600 = 6,
    B38400 = 7,
}

impl BaudRate {
    pub const ALL: [BaudRate; 8] = [
        BaudRate::B1M,
        BaudRate::B500K,
        BaudRate::B250K,
        BaudRate::B128K,
        BaudRate::B115200,
        BaudRate::B76800,
        BaudRate::B57600,
        BaudRate::B38400,
    ];

    pub fn from_index(index: u8) -> Result<Self> {
        Self::ALL
            .get(index as usize)
            .copied()
            .ok_or(ServoError::InvalidBaudRate(index))
    }

    pub fn from_bits_per_second(bps: u32) -> Option<Self> {
        Self::ALL.into_iter().find(|b| b.bits_per_second() == bps)
    }

    pub fn index(self) -> u8 {
        self as u8
    }

    pub fn bits_per_second(self) -> u32 {
        match self {
            BaudRate::B1M => 1_000_000,
            BaudRate::B500K => 500_000,
            BaudRate::B250K => 250_000,
            BaudRate::B128K => 128_000,
            BaudRate::B115200 => 115_200,
            BaudRate::B76800 => 76_800,
            BaudRate::B57600 => 57_600,
            BaudRate::B38400 => 38_400,
        }
    }
}

pub fn validate_id(id: u8) -> Result<u8> {
    if (MIN_ID..=MAX_ID).contains(&id) {
        Ok(id)
    } else {
        Err(ServoError::InvalidId(id))
    }
}

/// Strict: anything outside 0..=4095 (or NaN) is rejected.
pub fn position_to_raw(position: f64) -> Result<u16> {
    if !(0.0..=POSITION_MAX).contains(&position) {
        return Err(ServoError::InvalidPosition(position));
    }
    Ok(position.round() as u16)
}

/// Permissive: out of range values are clamped into 0..=254.
pub fn acceleration_to_raw(acceleration: f64) -> u8 {
    acceleration.clamp(0.0, ACCELERATION_MAX).round() as u8
}

/// Clamp to +-10000 and encode as sign-magnitude (bit 15 set when negative).
pub fn wheel_speed_to_raw(speed: i32) -> u16 {
    let clamped = speed.clamp(-WHEEL_SPEED_MAX, WHEEL_SPEED_MAX);
    let magnitude = clamped.unsigned_abs() as u16;
    if clamped < 0 {
        SIGN_BIT | magnitude
    } else {
        magnitude
    }
}

pub fn speed_from_raw(raw: u16) -> i32 {
    let magnitude = (raw & !SIGN_BIT) as i32;
    if raw & SIGN_BIT != 0 {
        -magnitude
    } else {
        magnitude
    }
}
