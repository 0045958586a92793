//! The physical channel to the reader, behind two small traits so the
//! session logic can run against PC/SC hardware or a scripted stand-in.

use std::ffi::CString;

use pcsc::{Card, Context, Disposition, Protocols, Scope, ShareMode, MAX_BUFFER_SIZE};
use tracing::{debug, warn};

use crate::protocol::ESCAPE_FUNCTION;

/// An open connection to one reader.
pub trait Transport: Send {
    /// Sends a card APDU; the reply still carries its status word.
    fn transmit(&mut self, command: &[u8]) -> Result<Vec<u8>, pcsc::Error>;

    /// Sends a vendor command over the reader's escape channel.
    fn control(&mut self, command: &[u8]) -> Result<Vec<u8>, pcsc::Error>;

    /// ATR of the card in the field, if the reader reports one.
    fn atr(&self) -> Option<Vec<u8>>;

    fn disconnect(self: Box<Self>) -> Result<(), pcsc::Error>;
}

/// Reader discovery and connection.
pub trait Connector: Send + Sync {
    /// Names of attached readers. Empty when the PC/SC service is missing.
    fn list_readers(&self) -> Vec<String>;

    fn connect(&self, reader: &str, share_mode: ShareMode)
        -> Result<Box<dyn Transport>, pcsc::Error>;
}

/// [`Connector`] backed by the platform PC/SC service.
#[derive(Debug, Default)]
pub struct PcscConnector;

impl PcscConnector {
    pub fn new() -> Self {
        PcscConnector
    }
}

impl Connector for PcscConnector {
    fn list_readers(&self) -> Vec<String> {
        let ctx = match Context::establish(Scope::User) {
            Ok(ctx) => ctx,
            Err(e) => {
                warn!(error = %e, "Failed to establish PC/SC context");
                return Vec::new();
            }
        };

        let mut readers_buffer = [0; 2048];
        match ctx.list_readers(&mut readers_buffer) {
            Ok(readers) => readers
                .map(|reader| reader.to_string_lossy().into_owned())
                .collect(),
            Err(pcsc::Error::NoReadersAvailable) => Vec::new(),
            Err(e) => {
                warn!(error = %e, "Failed to list readers");
                Vec::new()
            }
        }
    }

    fn connect(
        &self,
        reader: &str,
        share_mode: ShareMode,
    ) -> Result<Box<dyn Transport>, pcsc::Error> {
        let ctx = Context::establish(Scope::User)?;
        let name = CString::new(reader).map_err(|_| pcsc::Error::UnknownReader)?;
        let card = ctx.connect(&name, share_mode, Protocols::ANY)?;
        debug!(reader, "PC/SC connection established");
        Ok(Box::new(PcscTransport { card }))
    }
}

/// [`Transport`] over a connected `pcsc::Card`.
pub struct PcscTransport {
    card: Card,
}

impl Transport for PcscTransport {
    fn transmit(&mut self, command: &[u8]) -> Result<Vec<u8>, pcsc::Error> {
        let mut recv_buffer = [0; MAX_BUFFER_SIZE];
        let response = self.card.transmit(command, &mut recv_buffer)?;
        Ok(response.to_vec())
    }

    fn control(&mut self, command: &[u8]) -> Result<Vec<u8>, pcsc::Error> {
        let mut recv_buffer = [0; MAX_BUFFER_SIZE];
        let code = pcsc::ctl_code(ESCAPE_FUNCTION.into());
        let response = self.card.control(code, command, &mut recv_buffer)?;
        Ok(response.to_vec())
    }

    fn atr(&self) -> Option<Vec<u8>> {
        self.card
            .status2_owned()
            .ok()
            .map(|status| status.atr().to_vec())
    }

    fn disconnect(self: Box<Self>) -> Result<(), pcsc::Error> {
        self.card
            .disconnect(Disposition::LeaveCard)
            .map_err(|(_, e)| e)
    }
}
