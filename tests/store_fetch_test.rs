mod common;

use common::*;
use vellum::{Database, Direction, Key};

#[test]
// create a volume, create a tree, store one record, read it back, and
// walk off both edges
fn empty_tree_single_insert_fetch() {
    let _db = setup();
    let mut cursor = cursor("t");

    cursor.set_key(&key(&[0x01]));
    cursor.store_bytes(&[0xAA, 0xBB]).unwrap();

    cursor.set_key(&key(&[0x01]));
    assert!(cursor.fetch().unwrap());
    assert_eq!(cursor.value().as_slice(), &[0xAA, 0xBB]);

    // traverse GT from before the key finds it
    cursor.set_key(&Key::left_edge());
    assert!(cursor.traverse(Direction::Gt, true).unwrap());
    assert_eq!(cursor.key(), &key(&[0x01]));

    // and GT from the key itself finds nothing: no wrap-around
    assert!(!cursor.traverse(Direction::Gt, true).unwrap());
}

#[test]
fn store_replaces_value() {
    let _db = setup();
    let mut cursor = cursor("t");

    cursor.set_key(&key(b"k"));
    cursor.store_bytes(b"one").unwrap();
    cursor.store_bytes(b"two").unwrap();

    assert!(cursor.fetch().unwrap());
    assert_eq!(cursor.value().as_slice(), b"two");
}

#[test]
fn fetch_missing_key_is_undefined() {
    let _db = setup();
    let mut cursor = cursor("t");

    cursor.set_key(&key(b"absent"));
    assert!(!cursor.fetch().unwrap());
}

#[test]
fn remove_then_traverse_skips_to_next() {
    let _db = setup();
    let mut cursor = cursor("t");

    for b in [1u8, 2, 3].iter() {
        cursor.set_key(&key(&[*b]));
        cursor.store_bytes(&[*b]).unwrap();
    }

    cursor.set_key(&key(&[2]));
    assert!(cursor.remove().unwrap());
    assert!(!cursor.fetch().unwrap());

    cursor.set_key(&key(&[1]));
    assert!(cursor.traverse(Direction::Gt, true).unwrap());
    assert_eq!(cursor.key(), &key(&[3]));
}

#[test]
fn separate_trees_are_independent() {
    let _db = setup();
    let mut a = cursor("a");
    let mut b = cursor("b");

    a.set_key(&key(b"k"));
    a.store_bytes(b"from-a").unwrap();

    b.set_key(&key(b"k"));
    assert!(!b.fetch().unwrap());

    let volume = Database::volumes().into_iter().next().unwrap();
    let names = Database::tree_names(volume.handle()).unwrap();
    assert!(names.contains(&"a".to_string()));
    assert!(names.contains(&"b".to_string()));
}

#[test]
fn reopen_after_clean_shutdown_keeps_contents() {
    let db = setup();
    {
        let mut cursor = cursor("t");
        for i in 0..100u32 {
            cursor.set_key(&seq_key(i));
            cursor.store_bytes(&i.to_be_bytes()).unwrap();
        }
    }

    db.close_and_reopen();

    let mut cursor = cursor("t");
    for i in 0..100u32 {
        cursor.set_key(&seq_key(i));
        assert!(cursor.fetch().unwrap(), "key {} lost across reopen", i);
        assert_eq!(cursor.value().as_slice(), &i.to_be_bytes());
    }
}

#[test]
fn max_length_key_round_trips() {
    let db = setup();
    let mut cursor = cursor("t");

    // the page-size bound, minus the terminator
    let bound = db.page_size / 8;
    let segment = vec![7u8; bound - 1];
    let mut k = Key::new();
    k.append(&segment).unwrap();

    cursor.set_key(&k);
    cursor.store_bytes(b"big-key").unwrap();
    assert!(cursor.fetch().unwrap());
    assert_eq!(cursor.value().as_slice(), b"big-key");

    // one byte more is a validation error
    let mut too_big = Key::new();
    too_big.append(&vec![7u8; bound]).unwrap();
    cursor.set_key(&too_big);
    let err = cursor.store_bytes(b"x").unwrap_err();
    assert_eq!(err.kind(), vellum::ErrorKind::Validation);
}
