//! Command encoding for the reader's pseudo-APDUs and vendor escape commands.
//!
//! Everything here is stateless. Builders take fixed-size arrays so a
//! wrong-length key or payload cannot reach the wire; callers holding slices
//! validate first (see [`crate::format`] and [`crate::card`]).

use std::fmt;
use std::str::FromStr;

use crate::address::BLOCK_SIZE;
use crate::error::{MifareError, Result};

/// Length of a MIFARE Classic sector key.
pub const KEY_SIZE: usize = 6;

/// Vendor control function number; the control code is
/// `pcsc::ctl_code(ESCAPE_FUNCTION)`.
pub const ESCAPE_FUNCTION: u32 = 3500;

/// Reader-control command returning the firmware version string.
pub const GET_FIRMWARE_VERSION: [u8; 5] = [0xE0, 0x00, 0x00, 0x18, 0x00];
pub const GET_UID: [u8; 5] = [0xFF, 0xCA, 0x00, 0x00, 0x00];

const LOAD_KEY_HEADER: [u8; 5] = [0xFF, 0x82, 0x00, 0x00, 0x06];
const AUTHENTICATE_HEADER: [u8; 5] = [0xFF, 0x86, 0x00, 0x00, 0x05];
const AUTHENTICATE_VERSION: [u8; 2] = [0x01, 0x00];
const READ_BINARY: [u8; 3] = [0xFF, 0xB0, 0x00];
const UPDATE_BINARY: [u8; 3] = [0xFF, 0xD6, 0x00];

/// Header byte of a successful ACS escape reply.
const ESCAPE_REPLY_OK: u8 = 0xE1;

/// Status words seen from the reader. Only `SUCCESS` is interpreted; the rest
/// are named for log messages.
pub mod sw {
    pub const SUCCESS: u16 = 0x9000;
    /// Authentication failure, or a generic operation failure.
    pub const OPERATION_FAILED: u16 = 0x6300;
    pub const CARD_NOT_FOUND: u16 = 0x6200;
    pub const INVALID_BLOCK: u16 = 0x6A00;
}

/// Which of the two sector keys an authentication uses.
#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash)]
pub enum KeyType {
    A = 0x60,
    B = 0x61,
}

impl KeyType {
    pub fn code(self) -> u8 {
        self as u8
    }
}

impl fmt::Display for KeyType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            KeyType::A => f.write_str("Key A"),
            KeyType::B => f.write_str("Key B"),
        }
    }
}

impl FromStr for KeyType {
    type Err = MifareError;

    fn from_str(s: &str) -> Result<Self> {
        match s.trim().to_ascii_lowercase().as_str() {
            "a" | "keya" | "key a" | "60" => Ok(KeyType::A),
            "b" | "keyb" | "key b" | "61" => Ok(KeyType::B),
            other => Err(MifareError::malformed(format!(
                "unknown key type \"{}\" (expected A or B)",
                other
            ))),
        }
    }
}

/// Reply to a command: payload plus the two status bytes.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Response {
    pub data: Vec<u8>,
    pub sw1: u8,
    pub sw2: u8,
}

impl Response {
    /// Splits a card reply into payload and trailing status word.
    pub fn from_apdu(raw: &[u8]) -> Result<Self> {
        if raw.len() < 2 {
            return Err(MifareError::MalformedResponse {
                operation: "transmit",
                reason: format!("{} byte reply has no status word", raw.len()),
            });
        }
        let (data, status) = raw.split_at(raw.len() - 2);
        Ok(Response {
            data: data.to_vec(),
            sw1: status[0],
            sw2: status[1],
        })
    }

    /// Escape replies have no trailing status word: the whole reply is the
    /// payload and its first two bytes are reported as `sw1`/`sw2`.
    pub fn from_control(raw: &[u8]) -> Self {
        Response {
            data: raw.to_vec(),
            sw1: raw.first().copied().unwrap_or(0),
            sw2: raw.get(1).copied().unwrap_or(0),
        }
    }

    pub fn is_success(&self) -> bool {
        is_success(self.sw1, self.sw2)
    }

    pub fn status_word(&self) -> u16 {
        u16::from_be_bytes([self.sw1, self.sw2])
    }

    /// Converts a non-success status word into a [`MifareError::ProtocolFailure`].
    pub fn check(self, operation: &'static str) -> Result<Self> {
        if self.is_success() {
            Ok(self)
        } else {
            Err(MifareError::protocol(operation, self.sw1, self.sw2))
        }
    }
}

pub fn is_success(sw1: u8, sw2: u8) -> bool {
    sw1 == 0x90 && sw2 == 0x00
}

pub fn build_get_firmware_version() -> Vec<u8> {
    GET_FIRMWARE_VERSION.to_vec()
}

pub fn build_get_uid() -> Vec<u8> {
    GET_UID.to_vec()
}

pub fn build_load_key(slot: u8, key: &[u8; KEY_SIZE]) -> Vec<u8> {
    let mut cmd = LOAD_KEY_HEADER.to_vec();
    cmd.push(slot);
    cmd.extend_from_slice(key);
    cmd
}

pub fn build_authenticate(block: u8, key_type: KeyType, slot: u8) -> Vec<u8> {
    let mut cmd = AUTHENTICATE_HEADER.to_vec();
    cmd.extend_from_slice(&AUTHENTICATE_VERSION);
    cmd.extend_from_slice(&[block, key_type.code(), slot]);
    cmd
}

pub fn build_read(block: u8, length: u8) -> Vec<u8> {
    let mut cmd = READ_BINARY.to_vec();
    cmd.extend_from_slice(&[block, length]);
    cmd
}

/// Read of one full block.
pub fn build_read_block(block: u8) -> Vec<u8> {
    build_read(block, BLOCK_SIZE as u8)
}

pub fn build_write(block: u8, data: &[u8; BLOCK_SIZE]) -> Vec<u8> {
    let mut cmd = UPDATE_BINARY.to_vec();
    cmd.extend_from_slice(&[block, BLOCK_SIZE as u8]);
    cmd.extend_from_slice(data);
    cmd
}

/// Extracts the version string from a firmware-version escape reply:
/// `E1 00 00 00 <len> <ascii...>`.
pub fn parse_firmware_version(reply: &[u8]) -> Result<String> {
    let malformed = |reason: String| MifareError::MalformedResponse {
        operation: "get firmware version",
        reason,
    };
    if reply.first() != Some(&ESCAPE_REPLY_OK) || reply.len() <= 5 {
        return Err(malformed(format!("unexpected reply {}", hex::encode_upper(reply))));
    }
    let len = reply[4] as usize;
    let end = (5 + len).min(reply.len());
    let version: String = reply[5..end].iter().map(|&b| b as char).collect();
    Ok(version)
}
