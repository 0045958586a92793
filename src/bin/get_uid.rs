use std::sync::Arc;
use std::thread;
use std::time::Duration;

use clap::Parser;
use mifare_classic::{CardOperations, MifareError, ReaderSession, SessionConfig};
use tracing::{debug, warn};
use tracing_subscriber::EnvFilter;

#[derive(Parser)]
#[command(name = "get_uid")]
#[command(about = "Print the UID of each MIFARE card placed on the reader")]
#[command(version)]
struct Args {
    /// Substring of the reader name to connect to
    #[arg(short, long)]
    reader: Option<String>,

    /// Milliseconds between card polls
    #[arg(long, default_value_t = 500)]
    poll_ms: u64,
}

fn main() {
    // RUST_LOG=debug shows every APDU exchanged with the reader.
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .with_target(false)
        .init();

    let args = Args::parse();
    let poll = Duration::from_millis(args.poll_ms);

    println!("MIFARE UID Reader");
    println!("-----------------");

    let session = Arc::new(ReaderSession::pcsc(SessionConfig::default()));
    for reader in session.list_readers() {
        println!("Found reader: {}", reader);
    }

    if let Err(e) = session.connect(args.reader.as_deref()) {
        eprintln!("Failed to connect: {}", e);
        return;
    }
    let card = CardOperations::new(Arc::clone(&session));

    println!("Waiting for cards... (place card on reader and hold it steady)");
    println!("Press Ctrl+C to quit");

    let mut last_uid: Option<String> = None;
    loop {
        match card.detect_card() {
            Ok(true) => {
                let uid = card.get_card_info().uid_hex();
                if uid != last_uid {
                    if let Some(uid) = &uid {
                        println!("Card UID: {}", uid);
                    }
                    last_uid = uid;
                }
            }
            Ok(false) => {
                if last_uid.take().is_some() {
                    println!("Card removed");
                }
            }
            Err(MifareError::NotConnected) => {
                warn!("Reader connection lost, reconnecting");
                last_uid = None;
                thread::sleep(poll);
                if let Err(e) = session.connect(args.reader.as_deref()) {
                    debug!(error = %e, "Reconnect failed");
                }
            }
            Err(e) => debug!(error = %e, "Card poll failed"),
        }
        thread::sleep(poll);
    }
}
