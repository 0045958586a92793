//! Card presence, identity, and block I/O gated by per-sector authentication.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, PoisonError, RwLock, Weak};

use tracing::{debug, info, warn};

use crate::address::{Geometry, BLOCK_SIZE};
use crate::atr;
use crate::error::{MifareError, Result};
use crate::format::{block_from_slice, format_hex};
use crate::layout::{SectorTrailer, ValueBlock};
use crate::protocol;
use crate::session::{ReaderSession, ReaderStatus, SubscriptionId};

/// What is known about the card in the field. Always replaced as a whole.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CardIdentity {
    pub uid: Option<Vec<u8>>,
    pub geometry: Geometry,
    pub present: bool,
    /// False while `geometry` is only the default guess made at detection.
    pub geometry_confirmed: bool,
}

impl CardIdentity {
    pub fn uid_hex(&self) -> Option<String> {
        self.uid.as_deref().map(|uid| format_hex(uid, ""))
    }
}

/// The authentication flags [`crate::auth::Authenticator`] may touch.
///
/// The table itself stays owned by [`CardOperations`]; this is the whole
/// surface through which anything else changes it.
pub trait SectorTrust: Send + Sync {
    fn card_identity(&self) -> CardIdentity;
    fn set_sector_authenticated(&self, sector: u8, authenticated: bool);
    fn is_sector_authenticated(&self, sector: u8) -> bool;
    /// Forgets every sector at once.
    fn clear_authentication(&self);
}

pub struct CardOperations {
    session: Arc<ReaderSession>,
    identity: RwLock<Arc<CardIdentity>>,
    authenticated: Mutex<HashMap<u8, bool>>,
    subscription: SubscriptionId,
}

impl CardOperations {
    /// Creates the card handler for `session`.
    ///
    /// Identity and authentication are discarded whenever the session leaves
    /// the `Connected` state.
    pub fn new(session: Arc<ReaderSession>) -> Arc<Self> {
        Arc::new_cyclic(|weak: &Weak<Self>| {
            let weak = weak.clone();
            let subscription = session.subscribe(move |status| {
                if status != ReaderStatus::Connected {
                    if let Some(ops) = weak.upgrade() {
                        ops.forget_card();
                    }
                }
            });
            CardOperations {
                session,
                identity: RwLock::new(Arc::new(CardIdentity::default())),
                authenticated: Mutex::new(HashMap::new()),
                subscription,
            }
        })
    }

    pub fn session(&self) -> &Arc<ReaderSession> {
        &self.session
    }

    fn identity(&self) -> Arc<CardIdentity> {
        Arc::clone(&self.identity.read().unwrap_or_else(PoisonError::into_inner))
    }

    fn replace_identity(&self, identity: CardIdentity) {
        *self.identity.write().unwrap_or_else(PoisonError::into_inner) = Arc::new(identity);
    }

    fn table(&self) -> std::sync::MutexGuard<'_, HashMap<u8, bool>> {
        self.authenticated
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
    }

    // Lock order: table, then identity.
    fn forget_card(&self) {
        let mut table = self.table();
        self.replace_identity(CardIdentity::default());
        table.clear();
    }

    /// Polls for a card with GET UID.
    ///
    /// Geometry is set from the ATR when it names a Classic 1K or 4K card.
    /// Otherwise the same card keeps what it had, and a new card is
    /// provisionally Classic 1K.
    pub fn detect_card(&self) -> Result<bool> {
        if !self.session.is_connected() {
            self.forget_card();
            return Err(MifareError::NotConnected);
        }

        let response = match self.session.send_command(&protocol::build_get_uid()) {
            Ok(response) => response,
            Err(MifareError::Transport(
                pcsc::Error::NoSmartcard | pcsc::Error::RemovedCard | pcsc::Error::ResetCard,
            )) => {
                debug!("No card in the field");
                self.forget_card();
                return Ok(false);
            }
            Err(e) => {
                warn!(error = %e, "Card detection failed");
                self.forget_card();
                return Err(e);
            }
        };

        if !response.is_success() || response.data.is_empty() {
            debug!(sw = %format!("{:04X}", response.status_word()), "No card detected");
            self.forget_card();
            return Ok(false);
        }

        let from_atr = self
            .session
            .atr()
            .as_deref()
            .and_then(atr::geometry_from_atr);
        let uid = response.data;

        let mut table = self.table();
        let previous = self.identity();
        let same_card = previous.present && previous.uid.as_deref() == Some(uid.as_slice());
        let (geometry, geometry_confirmed) = match from_atr {
            Some(geometry) => (geometry, true),
            None if same_card => (previous.geometry, previous.geometry_confirmed),
            None => (Geometry::Classic1K, false),
        };

        let identity = CardIdentity {
            uid: Some(uid),
            geometry,
            present: true,
            geometry_confirmed,
        };
        if !same_card || previous.geometry != geometry {
            table.clear();
        }
        info!(
            uid = %identity.uid_hex().unwrap_or_default(),
            %geometry,
            confirmed = geometry_confirmed,
            "Card detected"
        );
        self.replace_identity(identity);
        Ok(true)
    }

    /// Sets the card's real geometry once the caller knows its capacity.
    ///
    /// Sector numbering may change with geometry, so authentication is reset
    /// when it does.
    pub fn confirm_geometry(&self, geometry: Geometry) -> Result<()> {
        if geometry == Geometry::Unknown {
            return Err(MifareError::malformed("cannot confirm an unknown geometry"));
        }
        let mut table = self.table();
        let current = self.identity();
        if !current.present {
            return Err(MifareError::CardAbsent);
        }
        if current.geometry != geometry {
            info!(%geometry, "Card geometry changed, clearing authentication");
            table.clear();
        }
        self.replace_identity(CardIdentity {
            geometry,
            geometry_confirmed: true,
            ..(*current).clone()
        });
        Ok(())
    }

    /// Checks presence and authentication for `block`, returning its sector.
    fn accessible_sector(&self, identity: &CardIdentity, block: u8) -> Result<u8> {
        let sector = identity.geometry.sector_of(block)?;
        if !self.is_sector_authenticated(sector) {
            return Err(MifareError::NotAuthenticated { sector });
        }
        Ok(sector)
    }

    pub fn read_block(&self, block: u8) -> Result<[u8; BLOCK_SIZE]> {
        let identity = self.identity();
        if !identity.present {
            return Err(MifareError::CardAbsent);
        }
        self.accessible_sector(&identity, block)?;

        let response = self
            .session
            .send_command(&protocol::build_read_block(block))?
            .check("read block")?;
        let data = block_from_slice(&response.data).map_err(|_| MifareError::MalformedResponse {
            operation: "read block",
            reason: format!("expected {} bytes, got {}", BLOCK_SIZE, response.data.len()),
        })?;
        debug!(block, "Read block");
        Ok(data)
    }

    /// Writes one block.
    ///
    /// Writing a sector trailer does not reset that sector's authentication;
    /// use [`Self::write_sector_trailer`] or [`Self::invalidate_sector`] when
    /// the keys change.
    pub fn write_block(&self, block: u8, data: &[u8]) -> Result<()> {
        let identity = self.identity();
        if !identity.present {
            return Err(MifareError::CardAbsent);
        }
        let data = block_from_slice(data)?;
        let sector = self.accessible_sector(&identity, block)?;

        if identity.geometry.is_trailer_block(block)? {
            warn!(block, sector, "Writing sector trailer");
        }
        self.session
            .send_command(&protocol::build_write(block, &data))?
            .check("write block")?;
        info!(block, "Write block successful");
        Ok(())
    }

    /// Reads every block of an authenticated sector, trailer included.
    pub fn read_sector(&self, sector: u8) -> Result<Vec<(u8, [u8; BLOCK_SIZE])>> {
        let identity = self.identity();
        if !identity.present {
            return Err(MifareError::CardAbsent);
        }
        let blocks = identity.geometry.sector_blocks(sector)?;
        if !self.is_sector_authenticated(sector) {
            return Err(MifareError::NotAuthenticated { sector });
        }
        blocks
            .map(|block| self.read_block(block).map(|data| (block, data)))
            .collect()
    }

    /// Rewrites the trailer of `sector` and drops its authentication, since
    /// the keys it was authenticated with may no longer be valid.
    pub fn write_sector_trailer(&self, sector: u8, trailer: &SectorTrailer) -> Result<()> {
        let identity = self.identity();
        if !identity.present {
            return Err(MifareError::CardAbsent);
        }
        let block = identity.geometry.trailer_block_of(sector)?;
        self.write_block(block, &trailer.to_bytes())?;
        self.invalidate_sector(sector);
        Ok(())
    }

    pub fn read_trailer(&self, sector: u8) -> Result<SectorTrailer> {
        let identity = self.identity();
        if !identity.present {
            return Err(MifareError::CardAbsent);
        }
        let block = identity.geometry.trailer_block_of(sector)?;
        Ok(SectorTrailer::from_bytes(&self.read_block(block)?))
    }

    fn reject_trailer(&self, block: u8) -> Result<()> {
        let identity = self.identity();
        if identity.present && identity.geometry.is_trailer_block(block)? {
            return Err(MifareError::malformed(format!(
                "block {} is a sector trailer, not a value block",
                block
            )));
        }
        Ok(())
    }

    pub fn read_value(&self, block: u8) -> Result<ValueBlock> {
        self.reject_trailer(block)?;
        ValueBlock::from_bytes(&self.read_block(block)?)
    }

    /// Formats `block` as a value block holding `value`.
    pub fn write_value(&self, block: u8, value: i32) -> Result<()> {
        self.reject_trailer(block)?;
        self.write_block(block, &ValueBlock::new(value, block).to_bytes())
    }

    pub fn get_card_info(&self) -> CardIdentity {
        (*self.identity()).clone()
    }

    /// Marks one sector unauthenticated.
    pub fn invalidate_sector(&self, sector: u8) {
        self.set_sector_authenticated(sector, false);
    }

    /// Sectors currently authenticated, ascending.
    pub fn authenticated_sectors(&self) -> Vec<u8> {
        let mut sectors: Vec<u8> = self
            .table()
            .iter()
            .filter_map(|(&sector, &ok)| ok.then_some(sector))
            .collect();
        sectors.sort_unstable();
        sectors
    }

    /// Empties the authentication table; keys loaded in the reader stay.
    pub fn clear_authentication(&self) {
        self.table().clear();
        debug!("Cleared all authentication states");
    }
}

impl SectorTrust for CardOperations {
    fn card_identity(&self) -> CardIdentity {
        self.get_card_info()
    }

    fn set_sector_authenticated(&self, sector: u8, authenticated: bool) {
        self.table().insert(sector, authenticated);
        debug!(sector, authenticated, "Sector authentication status");
    }

    fn is_sector_authenticated(&self, sector: u8) -> bool {
        self.table().get(&sector).copied().unwrap_or(false)
    }

    fn clear_authentication(&self) {
        CardOperations::clear_authentication(self);
    }
}

impl Drop for CardOperations {
    fn drop(&mut self) {
        self.session.unsubscribe(self.subscription);
    }
}
