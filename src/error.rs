//! Error type shared by every card and reader operation.

use thiserror::Error;

use crate::address::Geometry;

/// Failure of a reader, card, or input-validation step.
///
/// Expected conditions (no card, wrong key, block outside the geometry) are
/// ordinary variants here; nothing in this crate panics on them.
#[derive(Debug, Error)]
pub enum MifareError {
    /// The session is not in the `Connected` state.
    #[error("reader not connected")]
    NotConnected,

    #[error("no reader matching \"{0}\" found")]
    ReaderNotFound(String),

    /// The operation needs a detected card.
    #[error("no card present")]
    CardAbsent,

    #[error("sector {sector} is not authenticated")]
    NotAuthenticated { sector: u8 },

    /// Wrong-length key or block data, or text that is not hex.
    #[error("malformed input: {0}")]
    MalformedInput(String),

    #[error("block {block} is out of range for {geometry}")]
    InvalidBlock { block: u8, geometry: Geometry },

    #[error("sector {sector} is out of range for {geometry}")]
    InvalidSector { sector: u8, geometry: Geometry },

    /// The reader or card answered with something other than `90 00`.
    #[error("{operation} failed: status {sw1:02X} {sw2:02X}")]
    ProtocolFailure {
        operation: &'static str,
        sw1: u8,
        sw2: u8,
    },

    #[error("unexpected response to {operation}: {reason}")]
    MalformedResponse {
        operation: &'static str,
        reason: String,
    },

    #[error("no known default key accepted for sector {sector}")]
    DefaultKeysExhausted { sector: u8 },

    /// The PC/SC channel itself failed.
    #[error("transport fault: {0}")]
    Transport(#[from] pcsc::Error),
}

impl MifareError {
    pub(crate) fn protocol(operation: &'static str, sw1: u8, sw2: u8) -> Self {
        MifareError::ProtocolFailure {
            operation,
            sw1,
            sw2,
        }
    }

    pub(crate) fn malformed(reason: impl Into<String>) -> Self {
        MifareError::MalformedInput(reason.into())
    }

    /// Status word carried by the error, if the card produced one.
    pub fn status(&self) -> Option<(u8, u8)> {
        match self {
            MifareError::ProtocolFailure { sw1, sw2, .. } => Some((*sw1, *sw2)),
            _ => None,
        }
    }

    /// True when the failure was caught before any command reached the reader.
    pub fn is_precondition(&self) -> bool {
        matches!(
            self,
            MifareError::NotConnected
                | MifareError::CardAbsent
                | MifareError::NotAuthenticated { .. }
                | MifareError::MalformedInput(_)
                | MifareError::InvalidBlock { .. }
                | MifareError::InvalidSector { .. }
        )
    }
}

pub type Result<T, E = MifareError> = std::result::Result<T, E>;
