//! MIFARE Classic 1K/4K access through a PC/SC contactless reader.
//!
//! A [`ReaderSession`] owns the reader connection and serializes every
//! command on one channel. [`CardOperations`] tracks the card in the field
//! and which sectors are authenticated; [`Authenticator`] loads keys and
//! authenticates sectors on its behalf.
//!
//! ```no_run
//! use std::sync::Arc;
//! use mifare_classic::{Authenticator, CardOperations, KeyType, ReaderSession, SessionConfig};
//!
//! # fn main() -> mifare_classic::Result<()> {
//! let session = Arc::new(ReaderSession::pcsc(SessionConfig::default()));
//! session.connect(None)?;
//! let card = CardOperations::new(Arc::clone(&session));
//! let auth = Authenticator::new(Arc::clone(&session), card.clone());
//! if card.detect_card()? {
//!     auth.authenticate_with_hex(1, KeyType::A, "FF FF FF FF FF FF")?;
//!     let data = card.read_block(4)?;
//!     println!("{}", mifare_classic::format::format_block(4, &data));
//! }
//! # Ok(())
//! # }
//! ```

pub mod address;
pub mod atr;
pub mod auth;
pub mod card;
pub mod error;
pub mod format;
pub mod layout;
pub mod protocol;
pub mod session;
pub mod transport;

pub use address::{Geometry, BLOCK_SIZE};
pub use auth::{Authenticator, KNOWN_DEFAULT_KEYS};
pub use card::{CardIdentity, CardOperations, SectorTrust};
pub use error::{MifareError, Result};
pub use layout::{SectorTrailer, ValueBlock};
pub use protocol::{KeyType, Response, KEY_SIZE};
pub use session::{ReaderInfo, ReaderSession, ReaderStatus, SessionConfig, SubscriptionId};
pub use transport::{Connector, PcscConnector, Transport};
