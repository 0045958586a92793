mod common;

use std::sync::Arc;

use common::{storage_atr, MockReader, SimCard, UID};
use mifare_classic::{
    Authenticator, CardOperations, Geometry, KeyType, MifareError, ReaderSession, SectorTrailer, SectorTrust,
    KNOWN_DEFAULT_KEYS,
};

const LOAD_KEY: [u8; 2] = [0xFF, 0x82];
const AUTHENTICATE: [u8; 2] = [0xFF, 0x86];

struct Rig {
    reader: MockReader,
    session: Arc<ReaderSession>,
    card: Arc<CardOperations>,
    auth: Authenticator,
}

fn connected(reader: MockReader) -> Rig {
    let session = reader.session();
    session.connect(None).unwrap();
    let card = CardOperations::new(Arc::clone(&session));
    let auth = Authenticator::new(Arc::clone(&session), card.clone());
    Rig {
        reader,
        session,
        card,
        auth,
    }
}

fn detected(reader: MockReader) -> Rig {
    let rig = connected(reader);
    assert!(rig.card.detect_card().unwrap());
    rig
}

#[test]
fn detect_reports_uid_and_provisional_geometry() {
    let rig = detected(MockReader::new());

    let info = rig.card.get_card_info();
    assert!(info.present);
    assert_eq!(info.uid.as_deref(), Some(&UID[..]));
    assert_eq!(info.uid_hex().as_deref(), Some("04A1B2C3"));
    assert_eq!(info.geometry, Geometry::Classic1K);
    assert!(!info.geometry_confirmed);
}

#[test]
fn authenticate_read_then_reject_short_write() {
    let rig = detected(MockReader::new());

    rig.auth
        .authenticate_sector(0, KeyType::A, &[0xFF; 6], 0)
        .unwrap();
    assert!(rig.card.is_sector_authenticated(0));

    let data = rig.card.read_block(0).unwrap();
    assert_eq!(data.len(), 16);

    let sent = rig.reader.state().transmits.len();
    let err = rig.card.write_block(0, &[0u8; 15]).unwrap_err();
    assert!(matches!(err, MifareError::MalformedInput(_)), "{:?}", err);
    assert_eq!(rig.reader.state().transmits.len(), sent);
}

#[test]
fn unauthenticated_read_sends_nothing() {
    let rig = detected(MockReader::new());
    let sent = rig.reader.state().transmits.len();

    let err = rig.card.read_block(5).unwrap_err();
    assert!(matches!(err, MifareError::NotAuthenticated { sector: 1 }), "{:?}", err);
    assert_eq!(rig.reader.state().transmits.len(), sent);
}

#[test]
fn out_of_range_block_is_rejected() {
    let rig = detected(MockReader::new());
    rig.auth
        .authenticate_sector(15, KeyType::A, &[0xFF; 6], 0)
        .unwrap();

    let err = rig.card.read_block(64).unwrap_err();
    assert!(matches!(err, MifareError::InvalidBlock { block: 64, .. }), "{:?}", err);

    let err = rig
        .auth
        .authenticate_sector(16, KeyType::A, &[0xFF; 6], 0)
        .unwrap_err();
    assert!(matches!(err, MifareError::InvalidSector { sector: 16, .. }), "{:?}", err);
}

#[test]
fn wrong_key_leaves_sector_locked() {
    let rig = detected(MockReader::new());

    let err = rig
        .auth
        .authenticate_sector(1, KeyType::B, &[0xA0, 0xA1, 0xA2, 0xA3, 0xA4, 0xA5], 0)
        .unwrap_err();
    assert_eq!(err.status(), Some((0x63, 0x00)));
    assert!(!rig.card.is_sector_authenticated(1));
}

#[test]
fn authenticate_targets_first_block_and_reloads_key() {
    let rig = detected(MockReader::new());

    rig.auth
        .authenticate_sector(3, KeyType::B, &[0xFF; 6], 1)
        .unwrap();
    rig.auth
        .authenticate_sector(3, KeyType::B, &[0xFF; 6], 1)
        .unwrap();

    let state = rig.reader.state();
    assert_eq!(state.count(&LOAD_KEY), 2);
    let auth = state
        .transmits
        .iter()
        .rev()
        .find(|c| c.starts_with(&AUTHENTICATE))
        .unwrap();
    assert_eq!(auth.as_slice(), &[0xFF, 0x86, 0x00, 0x00, 0x05, 0x01, 0x00, 12, 0x61, 0x01]);
    drop(state);
    assert_eq!(rig.auth.loaded_key(1), Some([0xFF; 6]));
}

#[test]
fn hex_keys_are_normalized() {
    let rig = detected(MockReader::new());

    rig.auth
        .authenticate_with_hex(2, KeyType::A, "ff:ff:ff:ff:ff:ff")
        .unwrap();
    assert!(rig.card.is_sector_authenticated(2));

    let sent = rig.reader.state().transmits.len();
    let err = rig
        .auth
        .authenticate_with_hex(2, KeyType::A, "FF FF FF")
        .unwrap_err();
    assert!(matches!(err, MifareError::MalformedInput(_)), "{:?}", err);
    assert_eq!(rig.reader.state().transmits.len(), sent);
}

#[test]
fn default_keys_stop_at_first_accepted() {
    let rig = detected(MockReader::with_card(SimCard::new(vec![KNOWN_DEFAULT_KEYS[2]])));

    let key = rig.auth.try_known_default_keys(2, KeyType::A).unwrap();
    assert_eq!(key, [0x00; 6]);
    assert!(rig.card.is_sector_authenticated(2));

    let state = rig.reader.state();
    assert_eq!(state.count(&LOAD_KEY), 3);
    assert_eq!(state.count(&AUTHENTICATE), 3);
}

#[test]
fn default_keys_exhausted() {
    let rig = detected(MockReader::with_card(SimCard::new(vec![[0x12; 6]])));

    let err = rig.auth.try_known_default_keys(4, KeyType::A).unwrap_err();
    assert!(matches!(err, MifareError::DefaultKeysExhausted { sector: 4 }), "{:?}", err);
    assert_eq!(rig.reader.state().count(&AUTHENTICATE), KNOWN_DEFAULT_KEYS.len());
    assert!(!rig.card.is_sector_authenticated(4));
}

#[test]
fn default_keys_stop_without_card() {
    let rig = connected(MockReader::new());

    let err = rig.auth.try_known_default_keys(0, KeyType::A).unwrap_err();
    assert!(matches!(err, MifareError::CardAbsent), "{:?}", err);
    assert!(rig.reader.state().transmits.is_empty());
}

#[test]
fn clear_loaded_keys_forgets_every_sector() {
    let rig = detected(MockReader::new());
    for sector in [0, 1, 5] {
        rig.auth
            .authenticate_sector(sector, KeyType::A, &[0xFF; 6], 0)
            .unwrap();
    }
    assert_eq!(rig.card.authenticated_sectors(), vec![0, 1, 5]);

    rig.auth.clear_loaded_keys();
    assert!(rig.card.authenticated_sectors().is_empty());
    assert_eq!(rig.auth.loaded_key(0), None);
    for sector in 0..16 {
        assert!(!rig.card.is_sector_authenticated(sector));
    }
}

#[test]
fn authenticate_without_connection_changes_nothing() {
    let reader = MockReader::new();
    let session = reader.session();
    let card = CardOperations::new(Arc::clone(&session));
    let auth = Authenticator::new(Arc::clone(&session), card.clone());

    let err = auth
        .authenticate_sector(0, KeyType::A, &[0xFF; 6], 0)
        .unwrap_err();
    assert!(matches!(err, MifareError::NotConnected), "{:?}", err);
    assert!(card.authenticated_sectors().is_empty());
    assert!(matches!(auth.load_key(&[0xFF; 6], 0), Err(MifareError::NotConnected)));
    assert!(reader.state().transmits.is_empty());
}

#[test]
fn removed_card_clears_identity_and_table() {
    let rig = detected(MockReader::new());
    rig.auth
        .authenticate_sector(1, KeyType::A, &[0xFF; 6], 0)
        .unwrap();

    rig.reader.state().card.as_mut().unwrap().present = false;
    assert!(!rig.card.detect_card().unwrap());

    let info = rig.card.get_card_info();
    assert!(!info.present);
    assert_eq!(info.uid, None);
    assert!(rig.card.authenticated_sectors().is_empty());

    let err = rig.card.read_block(4).unwrap_err();
    assert!(matches!(err, MifareError::CardAbsent), "{:?}", err);
}

#[test]
fn new_uid_clears_table_same_uid_keeps_it() {
    let rig = detected(MockReader::new());
    rig.auth
        .authenticate_sector(1, KeyType::A, &[0xFF; 6], 0)
        .unwrap();

    assert!(rig.card.detect_card().unwrap());
    assert!(rig.card.is_sector_authenticated(1));

    rig.reader.state().card.as_mut().unwrap().uid = vec![0x11, 0x22, 0x33, 0x44];
    assert!(rig.card.detect_card().unwrap());
    assert!(!rig.card.is_sector_authenticated(1));
}

#[test]
fn atr_confirms_4k_geometry() {
    let reader = MockReader::new();
    reader.state().atr = Some(storage_atr([0x00, 0x02]));
    let rig = detected(reader);

    let info = rig.card.get_card_info();
    assert_eq!(info.geometry, Geometry::Classic4K);
    assert!(info.geometry_confirmed);

    rig.auth
        .authenticate_sector(39, KeyType::A, &[0xFF; 6], 0)
        .unwrap();
    let state = rig.reader.state();
    let auth = state.transmits.last().unwrap();
    assert_eq!(auth[7], 240);
    drop(state);

    let blocks = rig.card.read_sector(39).unwrap();
    assert_eq!(blocks.len(), 16);
    assert_eq!(blocks.first().map(|b| b.0), Some(240));
    assert_eq!(blocks.last().map(|b| b.0), Some(255));
}

#[test]
fn confirm_geometry_resets_authentication() {
    let rig = detected(MockReader::new());
    rig.auth
        .authenticate_sector(0, KeyType::A, &[0xFF; 6], 0)
        .unwrap();

    rig.card.confirm_geometry(Geometry::Classic1K).unwrap();
    assert!(rig.card.is_sector_authenticated(0));
    assert!(rig.card.get_card_info().geometry_confirmed);

    rig.card.confirm_geometry(Geometry::Classic4K).unwrap();
    assert!(!rig.card.is_sector_authenticated(0));
    assert_eq!(rig.card.get_card_info().geometry, Geometry::Classic4K);
    assert!(rig.card.confirm_geometry(Geometry::Unknown).is_err());
}

#[test]
fn trailer_rewrite_invalidates_sector() {
    let rig = detected(MockReader::new());
    rig.auth
        .authenticate_sector(1, KeyType::A, &[0xFF; 6], 0)
        .unwrap();

    let trailer = SectorTrailer::new([0x11; 6], SectorTrailer::TRANSPORT_ACCESS_BITS, [0x22; 6]);
    rig.card.write_sector_trailer(1, &trailer).unwrap();

    assert!(!rig.card.is_sector_authenticated(1));
    let stored = rig.reader.state().card.as_ref().unwrap().memory[&7];
    assert_eq!(stored, trailer.to_bytes());
}

#[test]
fn value_blocks() {
    let rig = detected(MockReader::new());
    rig.auth
        .authenticate_sector(1, KeyType::A, &[0xFF; 6], 0)
        .unwrap();

    rig.card.write_value(4, -42).unwrap();
    let value = rig.card.read_value(4).unwrap();
    assert_eq!(value.value, -42);
    assert_eq!(value.address, 4);

    let err = rig.card.write_value(7, 1).unwrap_err();
    assert!(matches!(err, MifareError::MalformedInput(_)), "{:?}", err);

    // Block 5 holds plain data in the simulated card.
    assert!(matches!(
        rig.card.read_value(5),
        Err(MifareError::MalformedResponse { .. })
    ));
}

#[test]
fn disconnect_discards_card_state() {
    let rig = detected(MockReader::new());
    rig.auth
        .authenticate_sector(0, KeyType::A, &[0xFF; 6], 0)
        .unwrap();

    rig.session.disconnect();

    let info = rig.card.get_card_info();
    assert!(!info.present);
    assert_eq!(info.geometry, Geometry::Unknown);
    assert!(rig.card.authenticated_sectors().is_empty());
    assert!(matches!(rig.card.detect_card(), Err(MifareError::NotConnected)));
}

#[test]
fn redetect_keeps_confirmed_geometry() {
    let rig = detected(MockReader::new());
    rig.card.confirm_geometry(Geometry::Classic4K).unwrap();
    rig.auth
        .authenticate_sector(35, KeyType::A, &[0xFF; 6], 0)
        .unwrap();

    assert!(rig.card.detect_card().unwrap());

    let info = rig.card.get_card_info();
    assert_eq!(info.geometry, Geometry::Classic4K);
    assert!(info.geometry_confirmed);
    assert!(rig.card.is_sector_authenticated(35));
}

#[test]
fn new_card_drops_confirmed_geometry() {
    let rig = detected(MockReader::new());
    rig.card.confirm_geometry(Geometry::Classic4K).unwrap();

    rig.reader.state().card.as_mut().unwrap().uid = vec![0x11, 0x22, 0x33, 0x44];
    assert!(rig.card.detect_card().unwrap());

    let info = rig.card.get_card_info();
    assert_eq!(info.geometry, Geometry::Classic1K);
    assert!(!info.geometry_confirmed);
}

#[test]
fn card_leaving_field_is_not_an_error() {
    let rig = detected(MockReader::new());
    rig.auth
        .authenticate_sector(0, KeyType::A, &[0xFF; 6], 0)
        .unwrap();

    rig.reader.state().card = None;
    assert!(!rig.card.detect_card().unwrap());

    let info = rig.card.get_card_info();
    assert!(!info.present);
    assert_eq!(info.uid, None);
    assert!(rig.card.authenticated_sectors().is_empty());
    assert_eq!(rig.session.status(), mifare_classic::ReaderStatus::Connected);
}
