use std::process::ExitCode;
use std::sync::Arc;

use clap::Parser;
use mifare_classic::format::{format_block, format_hex};
use mifare_classic::{
    Authenticator, CardOperations, Geometry, KeyType, MifareError, ReaderSession, SessionConfig,
    BLOCK_SIZE,
};
use tracing_subscriber::EnvFilter;

#[derive(Parser)]
#[command(name = "card")]
#[command(about = "Dump every MIFARE Classic sector readable with a well-known default key")]
#[command(version)]
struct Args {
    /// Substring of the reader name to connect to
    #[arg(short, long)]
    reader: Option<String>,

    /// Key to authenticate with (A or B)
    #[arg(short, long, default_value = "A")]
    key_type: KeyType,

    /// Card capacity (1k or 4k) when the reader cannot tell
    #[arg(short, long)]
    geometry: Option<Geometry>,

    /// Print trailer keys and the key that opened each sector
    #[arg(long)]
    show_keys: bool,
}

fn masked_trailer(data: &[u8; BLOCK_SIZE]) -> [u8; BLOCK_SIZE] {
    let mut data = *data;
    data[0..6].fill(0);
    data[10..16].fill(0);
    data
}

fn main() -> ExitCode {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .with_target(false)
        .init();

    let args = Args::parse();

    println!("MIFARE Classic Card Dump");
    println!("------------------------");

    let session = Arc::new(ReaderSession::pcsc(SessionConfig::default()));
    if let Err(e) = session.connect(args.reader.as_deref()) {
        eprintln!("Failed to connect: {}", e);
        return ExitCode::FAILURE;
    }
    let info = session.reader_info();
    println!("Reader: {}", info.name.unwrap_or_default());
    if let Some(firmware) = info.firmware_version {
        println!("Firmware: {}", firmware);
    }

    let card = CardOperations::new(Arc::clone(&session));
    let auth = Authenticator::new(Arc::clone(&session), card.clone());

    match card.detect_card() {
        Ok(true) => {}
        Ok(false) => {
            println!("No card on the reader");
            return ExitCode::FAILURE;
        }
        Err(e) => {
            eprintln!("Card detection failed: {}", e);
            return ExitCode::FAILURE;
        }
    }
    if let Some(geometry) = args.geometry {
        if let Err(e) = card.confirm_geometry(geometry) {
            eprintln!("Cannot set geometry: {}", e);
            return ExitCode::FAILURE;
        }
    }

    let identity = card.get_card_info();
    println!("Card UID: {}", identity.uid_hex().unwrap_or_default());
    println!(
        "Card type: {}{}",
        identity.geometry,
        if identity.geometry_confirmed { "" } else { " (assumed)" }
    );

    let mut opened = 0;
    for sector in 0..identity.geometry.sector_count() {
        println!("\nSector {}:", sector);
        match auth.try_known_default_keys(sector, args.key_type) {
            Ok(key) => {
                let shown = if args.show_keys {
                    format_hex(&key, " ")
                } else {
                    "XX XX XX XX XX XX".to_string()
                };
                println!("  Authenticated with {}: {}", args.key_type, shown);
                opened += 1;
            }
            Err(MifareError::DefaultKeysExhausted { .. }) => {
                println!("  No default key accepted");
                continue;
            }
            Err(e) => {
                eprintln!("  Authentication aborted: {}", e);
                break;
            }
        }

        match card.read_sector(sector) {
            Ok(blocks) => {
                let trailer = identity.geometry.trailer_block_of(sector).ok();
                for (block, data) in blocks {
                    let data = if Some(block) == trailer && !args.show_keys {
                        masked_trailer(&data)
                    } else {
                        data
                    };
                    println!("  {}", format_block(block, &data));
                }
            }
            Err(e) => println!("  Error reading sector: {}", e),
        }
    }

    println!(
        "\nDump complete: {} of {} sectors readable",
        opened,
        identity.geometry.sector_count()
    );
    session.disconnect();
    ExitCode::SUCCESS
}
