//! Scripted stand-in for a PC/SC reader with a MIFARE Classic card on it.

#![allow(dead_code)]

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use std::thread;
use std::time::Duration;

use mifare_classic::{Connector, ReaderSession, SessionConfig, Transport};
use pcsc::ShareMode;

pub const READER_NAME: &str = "ACS ACR1252 Dual Reader PICC 00 00";
pub const UID: [u8; 4] = [0x04, 0xA1, 0xB2, 0xC3];
pub const FIRMWARE: &str = "ACR1252U_V1.13";

const OK: [u8; 2] = [0x90, 0x00];
const FAIL: [u8; 2] = [0x63, 0x00];

/// Builds a storage-card ATR carrying the given PC/SC card name.
pub fn storage_atr(name: [u8; 2]) -> Vec<u8> {
    let mut atr = vec![0x3B, 0x8F, 0x80, 0x01, 0x80, 0x4F, 0x0C, 0xA0, 0x00, 0x00, 0x03, 0x06, 0x03];
    atr.extend_from_slice(&name);
    atr.extend_from_slice(&[0x00, 0x00, 0x00, 0x00, 0x6A]);
    atr
}

pub fn firmware_reply(version: &str) -> Vec<u8> {
    let mut reply = vec![0xE1, 0x00, 0x00, 0x00, version.len() as u8];
    reply.extend_from_slice(version.as_bytes());
    reply
}

/// A simulated card: accepts `accepted_keys`, stores written blocks.
pub struct SimCard {
    pub present: bool,
    pub uid: Vec<u8>,
    pub accepted_keys: Vec<[u8; 6]>,
    pub slots: HashMap<u8, [u8; 6]>,
    pub memory: HashMap<u8, [u8; 16]>,
}

impl SimCard {
    pub fn new(accepted_keys: Vec<[u8; 6]>) -> Self {
        SimCard {
            present: true,
            uid: UID.to_vec(),
            accepted_keys,
            slots: HashMap::new(),
            memory: HashMap::new(),
        }
    }

    fn respond(&mut self, apdu: &[u8]) -> Vec<u8> {
        if !self.present {
            return FAIL.to_vec();
        }
        match apdu {
            [0xFF, 0xCA, 0x00, 0x00, 0x00] => [self.uid.as_slice(), OK.as_slice()].concat(),
            [0xFF, 0x82, 0x00, 0x00, 0x06, slot, key @ ..] if key.len() == 6 => {
                let mut stored = [0u8; 6];
                stored.copy_from_slice(key);
                self.slots.insert(*slot, stored);
                OK.to_vec()
            }
            [0xFF, 0x86, 0x00, 0x00, 0x05, 0x01, 0x00, _block, _key_type, slot] => {
                match self.slots.get(slot) {
                    Some(key) if self.accepted_keys.contains(key) => OK.to_vec(),
                    _ => FAIL.to_vec(),
                }
            }
            [0xFF, 0xB0, 0x00, block, 0x10] => {
                let data = self.memory.get(block).copied().unwrap_or([*block; 16]);
                [data.as_slice(), OK.as_slice()].concat()
            }
            [0xFF, 0xD6, 0x00, block, 0x10, data @ ..] if data.len() == 16 => {
                let mut stored = [0u8; 16];
                stored.copy_from_slice(data);
                self.memory.insert(*block, stored);
                OK.to_vec()
            }
            _ => vec![0x6A, 0x00],
        }
    }
}

#[derive(Default)]
pub struct MockState {
    pub transmits: Vec<Vec<u8>>,
    pub controls: Vec<Vec<u8>>,
    pub fail_control: bool,
    pub atr: Option<Vec<u8>>,
    pub connects: usize,
    pub disconnects: usize,
    pub card: Option<SimCard>,
    /// Time each transmit or control call spends on the wire.
    pub delay: Duration,
}

impl MockState {
    /// Number of transmitted commands starting with `prefix`.
    pub fn count(&self, prefix: &[u8]) -> usize {
        self.transmits.iter().filter(|c| c.starts_with(prefix)).count()
    }
}

/// Connector and transport share this handle so tests can inspect and
/// steer the reader while the session owns it.
#[derive(Clone)]
pub struct MockReader {
    pub state: Arc<Mutex<MockState>>,
    pub readers: Vec<String>,
    in_flight: Arc<AtomicBool>,
    /// Calls that started while another was still on the wire.
    pub overlaps: Arc<AtomicUsize>,
}

impl MockReader {
    pub fn with_card(card: SimCard) -> Self {
        MockReader {
            state: Arc::new(Mutex::new(MockState {
                card: Some(card),
                ..MockState::default()
            })),
            readers: vec!["Generic USB Reader 00 00".to_string(), READER_NAME.to_string()],
            in_flight: Arc::new(AtomicBool::new(false)),
            overlaps: Arc::new(AtomicUsize::new(0)),
        }
    }

    /// Reader with a card that accepts the factory default key.
    pub fn new() -> Self {
        Self::with_card(SimCard::new(vec![[0xFF; 6]]))
    }

    pub fn state(&self) -> MutexGuard<'_, MockState> {
        self.state.lock().unwrap()
    }

    /// Session with a fast monitor so lifecycle tests finish quickly.
    pub fn session(&self) -> Arc<ReaderSession> {
        self.session_with(
            SessionConfig::default()
                .with_monitor_interval(Duration::from_millis(100))
                .with_monitor_stop_timeout(Duration::from_secs(1)),
        )
    }

    pub fn session_with(&self, config: SessionConfig) -> Arc<ReaderSession> {
        Arc::new(ReaderSession::new(config, self.clone()))
    }
}

impl Connector for MockReader {
    fn list_readers(&self) -> Vec<String> {
        self.readers.clone()
    }

    fn connect(&self, reader: &str, _share_mode: ShareMode) -> Result<Box<dyn Transport>, pcsc::Error> {
        if !self.readers.iter().any(|r| r == reader) {
            return Err(pcsc::Error::UnknownReader);
        }
        self.state().connects += 1;
        Ok(Box::new(MockTransport {
            state: Arc::clone(&self.state),
            in_flight: Arc::clone(&self.in_flight),
            overlaps: Arc::clone(&self.overlaps),
        }))
    }
}

pub struct MockTransport {
    state: Arc<Mutex<MockState>>,
    in_flight: Arc<AtomicBool>,
    overlaps: Arc<AtomicUsize>,
}

impl MockTransport {
    /// Marks a call as on the wire for the configured delay. The state lock
    /// is not held meanwhile, so only the caller can serialize calls.
    fn on_wire<T>(&self, f: impl FnOnce(&mut MockState) -> T) -> T {
        if self.in_flight.swap(true, Ordering::SeqCst) {
            self.overlaps.fetch_add(1, Ordering::SeqCst);
        }
        let delay = self.state.lock().unwrap().delay;
        thread::sleep(delay);
        let result = f(&mut self.state.lock().unwrap());
        self.in_flight.store(false, Ordering::SeqCst);
        result
    }
}

impl Transport for MockTransport {
    fn transmit(&mut self, command: &[u8]) -> Result<Vec<u8>, pcsc::Error> {
        self.on_wire(|state| {
            state.transmits.push(command.to_vec());
            match state.card.as_mut() {
                Some(card) => Ok(card.respond(command)),
                None => Err(pcsc::Error::NoSmartcard),
            }
        })
    }

    fn control(&mut self, command: &[u8]) -> Result<Vec<u8>, pcsc::Error> {
        self.on_wire(|state| {
            state.controls.push(command.to_vec());
            if state.fail_control {
                return Err(pcsc::Error::ReaderUnavailable);
            }
            Ok(firmware_reply(FIRMWARE))
        })
    }

    fn atr(&self) -> Option<Vec<u8>> {
        self.state.lock().unwrap().atr.clone()
    }

    fn disconnect(self: Box<Self>) -> Result<(), pcsc::Error> {
        self.state.lock().unwrap().disconnects += 1;
        Ok(())
    }
}
