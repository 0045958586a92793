//! Hex parsing and display helpers for user-typed keys and block data.

use std::sync::OnceLock;

use regex::Regex;

use crate::address::BLOCK_SIZE;
use crate::error::{MifareError, Result};
use crate::protocol::KEY_SIZE;

fn separators() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"[:\s-]").expect("static regex"))
}

fn hex_digits() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"^[0-9A-Fa-f]*$").expect("static regex"))
}

/// Strips `:`, `-` and whitespace separators: `"a0:b1 c2"` becomes `"a0b1c2"`.
pub fn normalize_hex(input: &str) -> String {
    separators().replace_all(input, "").into_owned()
}

/// Parses hex text that must decode to exactly `len` bytes.
pub fn parse_hex_exact(input: &str, len: usize, what: &str) -> Result<Vec<u8>> {
    let clean = normalize_hex(input);
    if clean.is_empty() {
        return Err(MifareError::malformed(format!("{} cannot be empty", what)));
    }
    if !hex_digits().is_match(&clean) {
        return Err(MifareError::malformed(format!(
            "{} must contain only hex characters (0-9, A-F)",
            what
        )));
    }
    if clean.len() != len * 2 {
        return Err(MifareError::malformed(format!(
            "{} must be exactly {} bytes ({} hex characters), got {}",
            what,
            len,
            len * 2,
            clean.len()
        )));
    }
    hex::decode(&clean).map_err(|e| MifareError::malformed(format!("{}: {}", what, e)))
}

pub fn parse_key_hex(input: &str) -> Result<[u8; KEY_SIZE]> {
    let bytes = parse_hex_exact(input, KEY_SIZE, "key")?;
    key_from_slice(&bytes)
}

pub fn parse_block_hex(input: &str) -> Result<[u8; BLOCK_SIZE]> {
    let bytes = parse_hex_exact(input, BLOCK_SIZE, "block data")?;
    block_from_slice(&bytes)
}

/// Parses the three access-condition bytes of a trailer, e.g. `"FF0780"`.
pub fn parse_access_bits_hex(input: &str) -> Result<[u8; 3]> {
    let bytes = parse_hex_exact(input, 3, "access conditions")?;
    let mut out = [0u8; 3];
    out.copy_from_slice(&bytes);
    Ok(out)
}

pub fn key_from_slice(key: &[u8]) -> Result<[u8; KEY_SIZE]> {
    key.try_into().map_err(|_| {
        MifareError::malformed(format!("key must be exactly {} bytes, got {}", KEY_SIZE, key.len()))
    })
}

pub fn block_from_slice(data: &[u8]) -> Result<[u8; BLOCK_SIZE]> {
    data.try_into().map_err(|_| {
        MifareError::malformed(format!(
            "block data must be exactly {} bytes, got {}",
            BLOCK_SIZE,
            data.len()
        ))
    })
}

/// Uppercase hex with `separator` between bytes.
pub fn format_hex(bytes: &[u8], separator: &str) -> String {
    bytes
        .iter()
        .map(|b| format!("{:02X}", b))
        .collect::<Vec<String>>()
        .join(separator)
}

/// `Block 04: 00 11 .. FF | ..."3DU` style line.
pub fn format_block(block: u8, data: &[u8]) -> String {
    let ascii: String = data
        .iter()
        .map(|&b| if (32..=126).contains(&b) { b as char } else { '.' })
        .collect();
    format!("Block {:02}: {} | {}", block, format_hex(data, " "), ascii)
}
