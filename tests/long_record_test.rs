mod common;

use common::*;
use vellum::{
    page::max_inline_value,
    tree::{alloc, long_record},
    Database,
};

#[test]
// a one-megabyte value goes through a long-record chain and comes back
// byte for byte
fn megabyte_value_round_trips() {
    let db = setup();
    let mut cursor = cursor("t");
    let payload = patterned(1_048_576);

    cursor.set_key(&key(&[0x10]));
    cursor.store_bytes(&payload).unwrap();

    assert!(cursor.fetch().unwrap());
    assert_eq!(cursor.value().len(), payload.len());
    assert!(cursor.value().as_slice() == payload.as_slice());

    // the chain shape is page-size arithmetic
    let pages = long_record::chain_length(payload.len(), db.page_size);
    assert_eq!(pages, (payload.len() + db.page_size - 33) / (db.page_size - 32));
}

#[test]
fn partial_fetch_returns_a_prefix() {
    let _db = setup();
    let mut cursor = cursor("t");
    let payload = patterned(300_000);

    cursor.set_key(&key(&[0x11]));
    cursor.store_bytes(&payload).unwrap();

    assert!(cursor.fetch_min_bytes(1000).unwrap());
    let got = cursor.value().as_slice();
    assert!(got.len() >= 1000);
    assert_eq!(&payload[..got.len()], got);
}

#[test]
fn value_at_the_inline_threshold_stays_inline() {
    let db = setup();
    let mut cursor = cursor("t");
    let bound = max_inline_value(db.page_size);

    // exactly at the bound: inline
    cursor.set_key(&key(&[0x01]));
    cursor.store_bytes(&patterned(bound)).unwrap();
    assert!(cursor.fetch().unwrap());
    assert_eq!(cursor.value().len(), bound);

    // one past the bound: a chain
    cursor.set_key(&key(&[0x02]));
    cursor.store_bytes(&patterned(bound + 1)).unwrap();
    assert!(cursor.fetch().unwrap());
    assert_eq!(cursor.value().len(), bound + 1);
    assert_eq!(cursor.value().as_slice(), patterned(bound + 1).as_slice());
}

#[test]
fn replacing_a_long_record_frees_its_chain() {
    let _db = setup();
    let mut cursor = cursor("t");

    cursor.set_key(&key(&[0x20]));
    cursor.store_bytes(&patterned(200_000)).unwrap();

    // replace with an inline value; removing the key afterwards leaves
    // nothing behind
    cursor.store_bytes(b"small").unwrap();
    assert!(cursor.fetch().unwrap());
    assert_eq!(cursor.value().as_slice(), b"small");
}

#[test]
fn removing_a_long_record_returns_chain_to_garbage() {
    let _db = setup();
    let mut cursor = cursor("t");
    let payload = patterned(100_000);

    let volume = Database::volumes().into_iter().next().unwrap();
    let mut session = Database::new_session();
    let before = alloc::garbage_chain_length(&session, &volume).unwrap();
    Database::release_session(&mut session);

    cursor.set_key(&key(&[0x30]));
    cursor.store_bytes(&payload).unwrap();
    assert!(cursor.remove().unwrap());
    assert!(!cursor.fetch().unwrap());

    let mut session = Database::new_session();
    let after = alloc::garbage_chain_length(&session, &volume).unwrap();
    Database::release_session(&mut session);
    assert!(
        after > before,
        "chain pages were not returned to the garbage chain ({} -> {})",
        before,
        after
    );
}
