//! Byte layouts of the two structured block kinds: sector trailers and
//! value blocks.

use std::fmt;

use crate::address::BLOCK_SIZE;
use crate::error::{MifareError, Result};
use crate::format::format_hex;
use crate::protocol::KEY_SIZE;

/// Contents of a sector trailer: `key A | access bits | GPB | key B`.
///
/// Access bits are kept as the three raw bytes; decoding them into
/// per-block permissions is not done here.
#[derive(Clone, Copy, PartialEq, Eq)]
pub struct SectorTrailer {
    pub key_a: [u8; KEY_SIZE],
    pub access_bits: [u8; 3],
    pub general_purpose: u8,
    pub key_b: [u8; KEY_SIZE],
}

impl SectorTrailer {
    /// Access bytes shipped on new cards: key A/B readable/writable with key A.
    pub const TRANSPORT_ACCESS_BITS: [u8; 3] = [0xFF, 0x07, 0x80];

    pub fn new(key_a: [u8; KEY_SIZE], access_bits: [u8; 3], key_b: [u8; KEY_SIZE]) -> Self {
        SectorTrailer {
            key_a,
            access_bits,
            general_purpose: 0x69,
            key_b,
        }
    }

    pub fn from_bytes(block: &[u8; BLOCK_SIZE]) -> Self {
        let mut key_a = [0u8; KEY_SIZE];
        let mut access_bits = [0u8; 3];
        let mut key_b = [0u8; KEY_SIZE];
        key_a.copy_from_slice(&block[0..6]);
        access_bits.copy_from_slice(&block[6..9]);
        key_b.copy_from_slice(&block[10..16]);
        SectorTrailer {
            key_a,
            access_bits,
            general_purpose: block[9],
            key_b,
        }
    }

    pub fn to_bytes(&self) -> [u8; BLOCK_SIZE] {
        let mut block = [0u8; BLOCK_SIZE];
        block[0..6].copy_from_slice(&self.key_a);
        block[6..9].copy_from_slice(&self.access_bits);
        block[9] = self.general_purpose;
        block[10..16].copy_from_slice(&self.key_b);
        block
    }
}

// Keys stay out of debug output and logs.
impl fmt::Debug for SectorTrailer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SectorTrailer")
            .field("key_a", &"XX XX XX XX XX XX")
            .field("access_bits", &format_hex(&self.access_bits, " "))
            .field("general_purpose", &self.general_purpose)
            .field("key_b", &"XX XX XX XX XX XX")
            .finish()
    }
}

/// A block formatted as a signed 32-bit value with its integrity copies:
/// `value | !value | value | addr | !addr | addr | !addr`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ValueBlock {
    pub value: i32,
    /// Address byte, conventionally the block number; used by backup/restore.
    pub address: u8,
}

impl ValueBlock {
    pub fn new(value: i32, address: u8) -> Self {
        ValueBlock { value, address }
    }

    pub fn to_bytes(&self) -> [u8; BLOCK_SIZE] {
        let mut data = [0u8; BLOCK_SIZE];
        let value = self.value.to_le_bytes();
        data[0..4].copy_from_slice(&value);
        data[4..8].copy_from_slice(&(!self.value).to_le_bytes());
        data[8..12].copy_from_slice(&value);
        data[12] = self.address;
        data[13] = !self.address;
        data[14] = self.address;
        data[15] = !self.address;
        data
    }

    pub fn from_bytes(data: &[u8; BLOCK_SIZE]) -> Result<Self> {
        let word = |at: usize| i32::from_le_bytes([data[at], data[at + 1], data[at + 2], data[at + 3]]);
        let value = word(0);
        if word(8) != value || word(4) != !value {
            return Err(MifareError::MalformedResponse {
                operation: "read value",
                reason: "value copies do not match".to_string(),
            });
        }
        let address = data[12];
        if data[14] != address || data[13] != !address || data[15] != !address {
            return Err(MifareError::MalformedResponse {
                operation: "read value",
                reason: "address copies do not match".to_string(),
            });
        }
        Ok(ValueBlock { value, address })
    }
}
