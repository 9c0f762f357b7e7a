mod common;

use common::*;
use vellum::{Database, ErrorKind};

#[test]
fn append_only_freezes_volume_writes() {
    let _db = setup();
    let mut cursor = cursor("t");

    cursor.set_key(&key(&[1]));
    cursor.store_bytes(b"before backup").unwrap();

    // backup window: journal appends continue, volume writes stand
    // still
    Database::set_append_only(true);
    cursor.set_key(&key(&[2]));
    cursor.store_bytes(b"during backup").unwrap();

    let copied = Database::copier_pass(16).unwrap();
    assert_eq!(copied, 0, "copier wrote into a frozen volume");

    Database::set_append_only(false);
    cursor.set_key(&key(&[2]));
    assert!(cursor.fetch().unwrap());
    assert_eq!(cursor.value().as_slice(), b"during backup");
}

#[test]
fn copier_drains_the_page_map() {
    let db = setup();
    {
        let mut cursor = cursor("t");
        for i in 0..200u32 {
            cursor.set_key(&seq_key(i));
            cursor.store_bytes(&[3u8; 64]).unwrap();
        }
    }

    Database::checkpoint().unwrap();
    let before = Database::journal().page_map().len();
    assert!(before > 0, "checkpoint journaled no pages");

    let mut total = 0;
    for _ in 0..64 {
        let copied = Database::copier_pass(32).unwrap();
        total += copied;
        if copied == 0 {
            break;
        }
    }
    assert!(total > 0, "copier never copied a page");
    assert!(Database::journal().page_map().len() < before);

    // the volume file is now the page images' home; a clean reopen
    // still reads everything
    db.close_and_reopen();
    let mut cursor = cursor("t");
    for i in 0..200u32 {
        cursor.set_key(&seq_key(i));
        assert!(cursor.fetch().unwrap(), "key {} lost after copy-back", i);
    }
}

#[test]
fn missing_tree_is_a_validation_error() {
    let _db = setup();
    let volume = Database::volumes().into_iter().next().unwrap();
    let err = Database::get_tree(volume.handle(), "nope", false).unwrap_err();
    assert_eq!(err.kind(), ErrorKind::Validation);
}

#[test]
fn remove_tree_drops_records_and_directory_entry() {
    let _db = setup();
    {
        let mut cursor = cursor("goner");
        for i in 0..300u32 {
            cursor.set_key(&seq_key(i));
            cursor.store_bytes(&[1u8; 32]).unwrap();
        }
    }

    let volume = Database::volumes().into_iter().next().unwrap();
    let mut session = Database::new_session();
    Database::remove_tree(volume.handle(), "goner", &mut session).unwrap();
    Database::release_session(&mut session);

    let names = Database::tree_names(volume.handle()).unwrap();
    assert!(!names.contains(&"goner".to_string()));
    assert_eq!(
        Database::get_tree(volume.handle(), "goner", false)
            .unwrap_err()
            .kind(),
        ErrorKind::Validation
    );
}

#[test]
fn volume_counters_advance() {
    let _db = setup();
    let volume = Database::volumes().into_iter().next().unwrap();
    let writes_before = volume.write_counter();

    {
        let mut cursor = cursor("t");
        for i in 0..500u32 {
            cursor.set_key(&seq_key(i));
            cursor.store_bytes(&[0u8; 32]).unwrap();
        }
    }
    Database::checkpoint().unwrap();
    while Database::copier_pass(64).unwrap() > 0 {}

    assert!(volume.write_counter() > writes_before);
}
