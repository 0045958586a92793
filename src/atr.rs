//! Card identification from the ATR a PC/SC reader synthesizes for
//! contactless storage cards.
//!
//! Such ATRs embed the PC/SC registered application provider ID followed by
//! a standard byte and a two-byte card name:
//!
//! ```text
//! 3B 8F 80 01 80 4F 0C | A0 00 00 03 06 | SS | NN NN | 00 00 00 00 | TCK
//! ```

use std::fmt;

use crate::address::Geometry;

/// PC/SC RID preceding the storage-card description.
const PCSC_RID: [u8; 5] = [0xA0, 0x00, 0x00, 0x03, 0x06];

/// Contactless card families named by the PC/SC Part 3 supplement.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CardName {
    Classic1K,
    Classic4K,
    Ultralight,
    Mini,
    Other(u16),
}

impl CardName {
    fn from_code(code: u16) -> Self {
        match code {
            0x0001 => CardName::Classic1K,
            0x0002 => CardName::Classic4K,
            0x0003 => CardName::Ultralight,
            0x0026 => CardName::Mini,
            other => CardName::Other(other),
        }
    }

    /// Geometry implied by the card name, if it is a supported Classic card.
    pub fn geometry(self) -> Option<Geometry> {
        match self {
            CardName::Classic1K => Some(Geometry::Classic1K),
            CardName::Classic4K => Some(Geometry::Classic4K),
            _ => None,
        }
    }
}

impl fmt::Display for CardName {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            CardName::Classic1K => f.write_str("MIFARE Classic 1K"),
            CardName::Classic4K => f.write_str("MIFARE Classic 4K"),
            CardName::Ultralight => f.write_str("MIFARE Ultralight"),
            CardName::Mini => f.write_str("MIFARE Mini"),
            CardName::Other(code) => write!(f, "card name {:04X}", code),
        }
    }
}

/// Reads the card name out of a storage-card ATR, or `None` if the ATR does
/// not carry one.
pub fn storage_card_name(atr: &[u8]) -> Option<CardName> {
    let rid_at = atr
        .windows(PCSC_RID.len())
        .position(|w| w == PCSC_RID)?;
    // standard byte, then the two name bytes
    let name = atr.get(rid_at + PCSC_RID.len() + 1..rid_at + PCSC_RID.len() + 3)?;
    Some(CardName::from_code(u16::from_be_bytes([name[0], name[1]])))
}

/// Geometry confirmed by the ATR, when it names a Classic 1K or 4K card.
pub fn geometry_from_atr(atr: &[u8]) -> Option<Geometry> {
    storage_card_name(atr).and_then(CardName::geometry)
}
