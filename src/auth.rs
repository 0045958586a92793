//! Key loading and sector authentication.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use tracing::{debug, info, warn};

use crate::card::SectorTrust;
use crate::error::{MifareError, Result};
use crate::format::{key_from_slice, parse_key_hex};
use crate::protocol::{self, KeyType, KEY_SIZE};
use crate::session::ReaderSession;

/// Factory default key.
pub const DEFAULT_KEY: [u8; KEY_SIZE] = [0xFF; KEY_SIZE];
/// Published transport key (MAD key A).
pub const TRANSPORT_KEY: [u8; KEY_SIZE] = [0xA0, 0xA1, 0xA2, 0xA3, 0xA4, 0xA5];

/// Well-known keys tried by [`Authenticator::try_known_default_keys`], in order.
pub const KNOWN_DEFAULT_KEYS: [[u8; KEY_SIZE]; 4] = [
    DEFAULT_KEY,
    TRANSPORT_KEY,
    [0x00; KEY_SIZE],
    [0xA0, 0xB0, 0xC0, 0xD0, 0xE0, 0xF0],
];

/// Drives the load-key / authenticate exchange and records the outcome
/// through [`SectorTrust`].
pub struct Authenticator {
    session: Arc<ReaderSession>,
    cards: Arc<dyn SectorTrust>,
    /// Last key loaded into each reader slot. Advisory only.
    loaded_keys: Mutex<HashMap<u8, [u8; KEY_SIZE]>>,
}

impl Authenticator {
    pub fn new(session: Arc<ReaderSession>, cards: Arc<dyn SectorTrust>) -> Self {
        Authenticator {
            session,
            cards,
            loaded_keys: Mutex::new(HashMap::new()),
        }
    }

    fn loaded(&self) -> MutexGuard<'_, HashMap<u8, [u8; KEY_SIZE]>> {
        self.loaded_keys
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
    }

    /// Loads `key` into reader key slot `slot`.
    pub fn load_key(&self, key: &[u8], slot: u8) -> Result<()> {
        let key = key_from_slice(key)?;
        if !self.session.is_connected() {
            return Err(MifareError::NotConnected);
        }

        let response = self
            .session
            .send_command(&protocol::build_load_key(slot, &key))?;
        if response.is_success() {
            self.loaded().insert(slot, key);
            info!(slot, "Key loaded");
            Ok(())
        } else {
            // The slot content is unknown after a failed load.
            self.loaded().remove(&slot);
            warn!(slot, sw = %format!("{:04X}", response.status_word()), "Failed to load key");
            Err(MifareError::protocol("load key", response.sw1, response.sw2))
        }
    }

    /// Authenticates `sector` with `key`, always reloading the key first.
    pub fn authenticate_sector(
        &self,
        sector: u8,
        key_type: KeyType,
        key: &[u8],
        slot: u8,
    ) -> Result<()> {
        let key = key_from_slice(key)?;
        if !self.session.is_connected() {
            return Err(MifareError::NotConnected);
        }
        let identity = self.cards.card_identity();
        if !identity.present {
            return Err(MifareError::CardAbsent);
        }
        // Any block of the sector will do.
        let block = identity.geometry.first_block_of(sector)?;

        self.load_key(&key, slot)?;
        let response = self
            .session
            .send_command(&protocol::build_authenticate(block, key_type, slot))?;
        if response.is_success() {
            self.cards.set_sector_authenticated(sector, true);
            info!(sector, %key_type, "Sector authenticated");
            Ok(())
        } else {
            warn!(
                sector,
                %key_type,
                sw = %format!("{:04X}", response.status_word()),
                "Authentication failed"
            );
            Err(MifareError::protocol("authenticate", response.sw1, response.sw2))
        }
    }

    /// Like [`Self::authenticate_sector`] with a typed key such as
    /// `"FF FF FF FF FF FF"` or `"a0:a1:a2:a3:a4:a5"`, using slot 0.
    pub fn authenticate_with_hex(&self, sector: u8, key_type: KeyType, key_hex: &str) -> Result<()> {
        let key = parse_key_hex(key_hex).map_err(|e| {
            warn!(error = %e, "Invalid key format");
            e
        })?;
        self.authenticate_sector(sector, key_type, &key, 0)
    }

    /// Tries [`KNOWN_DEFAULT_KEYS`] in order and returns the first that works.
    ///
    /// Only rejected keys move on to the next candidate; a missing reader or
    /// card, or a transport fault, ends the attempt immediately.
    pub fn try_known_default_keys(&self, sector: u8, key_type: KeyType) -> Result<[u8; KEY_SIZE]> {
        for (index, key) in KNOWN_DEFAULT_KEYS.iter().enumerate() {
            debug!(
                sector,
                attempt = index + 1,
                total = KNOWN_DEFAULT_KEYS.len(),
                "Trying default key"
            );
            match self.authenticate_sector(sector, key_type, key, 0) {
                Ok(()) => {
                    info!(sector, attempt = index + 1, "Sector authenticated with default key");
                    return Ok(*key);
                }
                Err(MifareError::ProtocolFailure { .. }) => continue,
                Err(e) => return Err(e),
            }
        }
        warn!(sector, "No default keys worked");
        Err(MifareError::DefaultKeysExhausted { sector })
    }

    /// Key last loaded into `slot`, if known.
    pub fn loaded_key(&self, slot: u8) -> Option<[u8; KEY_SIZE]> {
        self.loaded().get(&slot).copied()
    }

    /// Forgets loaded keys and every sector's authentication.
    pub fn clear_loaded_keys(&self) {
        self.loaded().clear();
        self.cards.clear_authentication();
        debug!("Cleared all loaded keys and authentication states");
    }
}
