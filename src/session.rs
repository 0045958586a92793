//! Reader connection lifecycle, the serialized command channel, status
//! notifications and the background liveness monitor.

use std::panic::{self, AssertUnwindSafe};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::mpsc::{self, Receiver, RecvTimeoutError, Sender};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

use pcsc::ShareMode;
use tracing::{debug, error, info, trace, warn};

use crate::error::{MifareError, Result};
use crate::protocol::{self, Response};
use crate::transport::{Connector, PcscConnector, Transport};

/// Reader name fragment used when `connect` is called without a name.
pub const DEFAULT_READER_HINT: &str = "ACR1252";

/// Granularity at which the monitor checks for cancellation while waiting.
const MONITOR_TICK: Duration = Duration::from_millis(50);

/// Settings for a [`ReaderSession`].
#[derive(Debug, Clone)]
pub struct SessionConfig {
    /// Substring matched against reader names during discovery.
    pub reader_hint: String,
    pub share_mode: ShareMode,
    /// Period between liveness probes.
    pub monitor_interval: Duration,
    /// How long `disconnect` waits for the monitor thread to exit.
    pub monitor_stop_timeout: Duration,
}

impl Default for SessionConfig {
    fn default() -> Self {
        SessionConfig {
            reader_hint: DEFAULT_READER_HINT.to_string(),
            share_mode: ShareMode::Shared,
            monitor_interval: Duration::from_secs(2),
            monitor_stop_timeout: Duration::from_secs(1),
        }
    }
}

impl SessionConfig {
    pub fn with_reader_hint(mut self, hint: impl Into<String>) -> Self {
        self.reader_hint = hint.into();
        self
    }

    pub fn with_share_mode(mut self, share_mode: ShareMode) -> Self {
        self.share_mode = share_mode;
        self
    }

    pub fn with_monitor_interval(mut self, interval: Duration) -> Self {
        self.monitor_interval = interval;
        self
    }

    pub fn with_monitor_stop_timeout(mut self, timeout: Duration) -> Self {
        self.monitor_stop_timeout = timeout;
        self
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ReaderStatus {
    Disconnected,
    Connecting,
    Connected,
    Error,
}

/// Observer of status transitions. Runs on the thread that caused the
/// transition.
pub type StatusCallback = Arc<dyn Fn(ReaderStatus) + Send + Sync>;

/// Handle returned by [`ReaderSession::subscribe`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct SubscriptionId(u64);

/// Snapshot of the session for display.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReaderInfo {
    pub name: Option<String>,
    pub status: ReaderStatus,
    pub firmware_version: Option<String>,
    pub connected: bool,
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

/// State reachable from both the caller and the monitor thread.
struct Shared {
    config: SessionConfig,
    connector: Box<dyn Connector>,
    /// The one command channel; holding this lock means owning the reader.
    channel: Mutex<Option<Box<dyn Transport>>>,
    status: Mutex<ReaderStatus>,
    reader_name: Mutex<Option<String>>,
    firmware_version: Mutex<Option<String>>,
    subscribers: Mutex<Vec<(SubscriptionId, StatusCallback)>>,
    next_subscription: AtomicU64,
}

impl Shared {
    fn status(&self) -> ReaderStatus {
        *lock(&self.status)
    }

    fn is_connected(&self) -> bool {
        self.status() == ReaderStatus::Connected && lock(&self.channel).is_some()
    }

    fn notify(&self, status: ReaderStatus) {
        *lock(&self.status) = status;
        // Dispatch from a copy so callbacks may subscribe or unsubscribe.
        let subscribers: Vec<StatusCallback> = lock(&self.subscribers)
            .iter()
            .map(|(_, callback)| Arc::clone(callback))
            .collect();
        for callback in subscribers {
            if panic::catch_unwind(AssertUnwindSafe(|| callback(status))).is_err() {
                error!(?status, "Status subscriber panicked");
            }
        }
    }

    /// Runs `f` against the transport with the channel lock held.
    fn with_channel<T>(
        &self,
        f: impl FnOnce(&mut Box<dyn Transport>) -> std::result::Result<T, pcsc::Error>,
    ) -> Result<T> {
        if self.status() != ReaderStatus::Connected {
            return Err(MifareError::NotConnected);
        }
        let mut channel = lock(&self.channel);
        let transport = channel.as_mut().ok_or(MifareError::NotConnected)?;
        Ok(f(transport)?)
    }

    fn send_command(&self, command: &[u8]) -> Result<Response> {
        let raw = self
            .with_channel(|t| t.transmit(command))
            .map_err(|e| {
                if !matches!(e, MifareError::NotConnected) {
                    error!(error = %e, "APDU command failed");
                }
                e
            })?;
        let response = Response::from_apdu(&raw)?;
        debug!(
            command = %hex::encode_upper(redact(command)),
            data = %hex::encode_upper(&response.data),
            sw = %format!("{:02X}{:02X}", response.sw1, response.sw2),
            "APDU"
        );
        Ok(response)
    }

    fn send_control(&self, command: &[u8]) -> Result<Response> {
        let raw = self.with_channel(|t| t.control(command))?;
        trace!(
            command = %hex::encode_upper(command),
            reply = %hex::encode_upper(&raw),
            "Escape command"
        );
        Ok(Response::from_control(&raw))
    }
}

/// Keeps key bytes of a load-key command out of the logs.
fn redact(command: &[u8]) -> &[u8] {
    if command.starts_with(&[0xFF, 0x82]) {
        &command[..command.len().min(6)]
    } else {
        command
    }
}

struct Monitor {
    stop: Arc<AtomicBool>,
    done: Receiver<()>,
    handle: JoinHandle<()>,
}

/// One physical reader connection.
///
/// All commands, including the monitor's probes, are serialized on a single
/// channel lock. Status callbacks are always invoked with that lock released.
pub struct ReaderSession {
    shared: Arc<Shared>,
    monitor: Mutex<Option<Monitor>>,
}

impl ReaderSession {
    pub fn new(config: SessionConfig, connector: impl Connector + 'static) -> Self {
        ReaderSession {
            shared: Arc::new(Shared {
                config,
                connector: Box::new(connector),
                channel: Mutex::new(None),
                status: Mutex::new(ReaderStatus::Disconnected),
                reader_name: Mutex::new(None),
                firmware_version: Mutex::new(None),
                subscribers: Mutex::new(Vec::new()),
                next_subscription: AtomicU64::new(0),
            }),
            monitor: Mutex::new(None),
        }
    }

    /// Session over the system PC/SC service.
    pub fn pcsc(config: SessionConfig) -> Self {
        Self::new(config, PcscConnector::new())
    }

    pub fn config(&self) -> &SessionConfig {
        &self.shared.config
    }

    pub fn status(&self) -> ReaderStatus {
        self.shared.status()
    }

    pub fn is_connected(&self) -> bool {
        self.shared.is_connected()
    }

    pub fn reader_name(&self) -> Option<String> {
        lock(&self.shared.reader_name).clone()
    }

    pub fn firmware_version(&self) -> Option<String> {
        lock(&self.shared.firmware_version).clone()
    }

    pub fn reader_info(&self) -> ReaderInfo {
        ReaderInfo {
            name: self.reader_name(),
            status: self.status(),
            firmware_version: self.firmware_version(),
            connected: self.is_connected(),
        }
    }

    pub fn list_readers(&self) -> Vec<String> {
        self.shared.connector.list_readers()
    }

    /// First listed reader whose name contains `hint`.
    pub fn find_target_reader(&self, hint: &str) -> Option<String> {
        let found = self
            .list_readers()
            .into_iter()
            .find(|name| name.contains(hint));
        match &found {
            Some(name) => info!(reader = %name, "Found target reader"),
            None => warn!(hint, "Target reader not found"),
        }
        found
    }

    /// Connects to the reader matching `reader` (or the configured hint).
    ///
    /// An existing connection is torn down first.
    pub fn connect(&self, reader: Option<&str>) -> Result<()> {
        if self.is_connected() || lock(&self.monitor).is_some() {
            self.disconnect();
        }
        self.shared.notify(ReaderStatus::Connecting);

        let hint = reader.unwrap_or(self.shared.config.reader_hint.as_str());
        let name = match self.find_target_reader(hint) {
            Some(name) => name,
            None => {
                self.shared.notify(ReaderStatus::Error);
                return Err(MifareError::ReaderNotFound(hint.to_string()));
            }
        };

        match self
            .shared
            .connector
            .connect(&name, self.shared.config.share_mode)
        {
            Ok(transport) => {
                *lock(&self.shared.channel) = Some(transport);
                *lock(&self.shared.reader_name) = Some(name.clone());
            }
            Err(e) => {
                error!(reader = %name, error = %e, "Failed to connect to reader");
                self.shared.notify(ReaderStatus::Error);
                return Err(e.into());
            }
        }

        self.shared.notify(ReaderStatus::Connected);
        info!(reader = %name, "Connected to reader");

        self.fetch_firmware_version();
        self.start_monitor();
        Ok(())
    }

    /// Tears the connection down. Always ends in `Disconnected`.
    pub fn disconnect(&self) {
        self.stop_monitor();

        let transport = lock(&self.shared.channel).take();
        if let Some(transport) = transport {
            if let Err(e) = transport.disconnect() {
                warn!(error = %e, "Reader did not disconnect cleanly");
            }
        }
        *lock(&self.shared.reader_name) = None;
        *lock(&self.shared.firmware_version) = None;

        info!("Disconnected from reader");
        self.shared.notify(ReaderStatus::Disconnected);
    }

    /// Sends a card APDU and splits off its status word.
    pub fn send_command(&self, command: &[u8]) -> Result<Response> {
        self.shared.send_command(command)
    }

    /// Sends a vendor escape command. See [`Response::from_control`].
    pub fn send_control(&self, command: &[u8]) -> Result<Response> {
        self.shared.send_control(command)
    }

    /// ATR of the card in the field, if the reader reports one.
    pub fn atr(&self) -> Option<Vec<u8>> {
        if !self.is_connected() {
            return None;
        }
        lock(&self.shared.channel).as_ref().and_then(|t| t.atr())
    }

    pub fn subscribe(&self, callback: impl Fn(ReaderStatus) + Send + Sync + 'static) -> SubscriptionId {
        let id = SubscriptionId(self.shared.next_subscription.fetch_add(1, Ordering::Relaxed));
        lock(&self.shared.subscribers).push((id, Arc::new(callback)));
        id
    }

    /// Returns false if `id` was not subscribed.
    pub fn unsubscribe(&self, id: SubscriptionId) -> bool {
        let mut subscribers = lock(&self.shared.subscribers);
        let before = subscribers.len();
        subscribers.retain(|(sub, _)| *sub != id);
        subscribers.len() != before
    }

    /// Sets the current status and calls every subscriber in order.
    pub fn notify(&self, status: ReaderStatus) {
        self.shared.notify(status);
    }

    /// True while a monitor thread is registered and has not exited.
    pub fn is_monitoring(&self) -> bool {
        lock(&self.monitor)
            .as_ref()
            .map(|m| !m.handle.is_finished())
            .unwrap_or(false)
    }

    fn fetch_firmware_version(&self) {
        let result = self
            .send_control(&protocol::build_get_firmware_version())
            .and_then(|reply| protocol::parse_firmware_version(&reply.data));
        match result {
            Ok(version) => {
                info!(firmware = %version, "Reader firmware version");
                *lock(&self.shared.firmware_version) = Some(version);
            }
            Err(e) => warn!(error = %e, "Failed to get firmware version"),
        }
    }

    fn start_monitor(&self) {
        let mut slot = lock(&self.monitor);
        if slot.is_some() {
            return;
        }
        let stop = Arc::new(AtomicBool::new(false));
        let (done_tx, done_rx) = mpsc::channel();
        let shared = Arc::clone(&self.shared);
        let thread_stop = Arc::clone(&stop);
        let spawned = thread::Builder::new()
            .name("reader-monitor".to_string())
            .spawn(move || run_monitor(shared, thread_stop, done_tx));
        match spawned {
            Ok(handle) => {
                debug!("Started reader monitoring");
                *slot = Some(Monitor {
                    stop,
                    done: done_rx,
                    handle,
                });
            }
            Err(e) => error!(error = %e, "Failed to spawn reader monitor"),
        }
    }

    fn stop_monitor(&self) {
        let Some(monitor) = lock(&self.monitor).take() else {
            return;
        };
        monitor.stop.store(true, Ordering::SeqCst);

        // A status callback running on the monitor thread asked to disconnect;
        // the loop exits on its own once the callback returns.
        if monitor.handle.thread().id() == thread::current().id() {
            return;
        }

        match monitor.done.recv_timeout(self.shared.config.monitor_stop_timeout) {
            Ok(()) | Err(RecvTimeoutError::Disconnected) => {
                let _ = monitor.handle.join();
                debug!("Stopped reader monitoring");
            }
            Err(RecvTimeoutError::Timeout) => warn!(
                timeout = ?self.shared.config.monitor_stop_timeout,
                "Reader monitor did not stop in time, detaching"
            ),
        }
    }
}

impl Drop for ReaderSession {
    fn drop(&mut self) {
        if self.is_connected() || lock(&self.monitor).is_some() {
            self.disconnect();
        }
    }
}

/// Sleeps for `period`, waking early when `stop` is set. Returns true if
/// stopped.
fn wait_or_stop(stop: &AtomicBool, period: Duration) -> bool {
    let deadline = Instant::now() + period;
    loop {
        if stop.load(Ordering::SeqCst) {
            return true;
        }
        let now = Instant::now();
        if now >= deadline {
            return false;
        }
        thread::sleep(MONITOR_TICK.min(deadline - now));
    }
}

fn run_monitor(shared: Arc<Shared>, stop: Arc<AtomicBool>, done: Sender<()>) {
    let interval = shared.config.monitor_interval;
    while !wait_or_stop(&stop, interval) {
        match shared.send_control(&protocol::build_get_firmware_version()) {
            Ok(_) => trace!("Reader liveness probe ok"),
            Err(e) => {
                if !stop.load(Ordering::SeqCst) {
                    warn!(error = %e, "Reader monitoring detected disconnection");
                    shared.notify(ReaderStatus::Error);
                }
                break;
            }
        }
    }
    let _ = done.send(());
}
