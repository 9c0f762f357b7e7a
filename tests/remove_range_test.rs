mod common;

use common::*;
use vellum::{tree::alloc, tree::icheck, utils::HandyRwLock, Database, Direction, Key};

#[test]
// load 4096 sequential keys, carve out a span crossing many pages, and
// verify the survivors, the page accounting and the garbage chain
fn remove_range_spanning_pages() {
    let _db = setup();
    let mut cursor = cursor("t");
    let value = vec![9u8; 64];

    for i in 0..4096u32 {
        cursor.set_key(&seq_key(i));
        cursor.store_bytes(&value).unwrap();
    }

    let volume = Database::volumes().into_iter().next().unwrap();
    let pages_before = volume.next_available_page();

    // the half-open range [1000, 3001) removes keys 1000..=3000
    assert!(cursor
        .remove_key_range(&seq_key(1000), &seq_key(3001))
        .unwrap());

    cursor.set_key(&Key::left_edge());
    let mut seen = Vec::new();
    while cursor.traverse(Direction::Gt, true).unwrap() {
        seen.push(cursor.key().clone());
    }
    assert_eq!(seen.len(), 4096 - 2001);
    for i in 0..1000u32 {
        assert_eq!(seen[i as usize], seq_key(i));
    }
    for (offset, i) in (3001..4096u32).enumerate() {
        assert_eq!(seen[1000 + offset], seq_key(i));
    }

    // no page growth from a removal, and the freed span reached the
    // garbage chain
    assert!(volume.next_available_page() <= pages_before);
    let mut session = Database::new_session();
    let garbage = alloc::garbage_chain_length(&session, &volume).unwrap();
    Database::release_session(&mut session);
    assert!(garbage > 0, "no pages returned to the garbage chain");

    let tree = cursor.tree().clone();
    let mut session = Database::new_session();
    let report = icheck::check_tree(&tree, &mut session).unwrap();
    Database::release_session(&mut session);
    assert!(report.is_healthy(), "problems: {:?}", report.problems);
    assert_eq!(report.records, 4096 - 2001);
}

#[test]
fn remove_range_within_one_leaf() {
    let _db = setup();
    let mut cursor = cursor("t");

    for i in 0..20u32 {
        cursor.set_key(&seq_key(i));
        cursor.store_bytes(&[1]).unwrap();
    }

    assert!(cursor.remove_key_range(&seq_key(5), &seq_key(10)).unwrap());

    for i in 0..20u32 {
        cursor.set_key(&seq_key(i));
        let expected = !(5..10).contains(&i);
        assert_eq!(cursor.fetch().unwrap(), expected, "key {}", i);
    }
}

#[test]
fn remove_everything_then_reuse() {
    let _db = setup();
    let mut cursor = cursor("t");

    for i in 0..1500u32 {
        cursor.set_key(&seq_key(i));
        cursor.store_bytes(&[7u8; 32]).unwrap();
    }

    assert!(cursor
        .remove_key_range(&Key::left_edge(), &Key::right_edge())
        .unwrap());

    cursor.set_key(&Key::left_edge());
    assert!(!cursor.traverse(Direction::Gt, true).unwrap());
    assert_eq!(cursor.tree().rl().depth(), 1, "root did not shrink");

    // freed pages come back out of the garbage chain
    for i in 0..100u32 {
        cursor.set_key(&seq_key(i));
        cursor.store_bytes(&[8u8; 32]).unwrap();
    }
    cursor.set_key(&Key::left_edge());
    let mut count = 0;
    while cursor.traverse(Direction::Gt, true).unwrap() {
        count += 1;
    }
    assert_eq!(count, 100);
}

#[test]
fn empty_and_inverted_ranges_are_validation_errors() {
    let _db = setup();
    let mut cursor = cursor("t");
    cursor.set_key(&seq_key(0));
    cursor.store_bytes(&[1]).unwrap();

    let err = cursor
        .remove_key_range(&seq_key(5), &seq_key(5))
        .unwrap_err();
    assert_eq!(err.kind(), vellum::ErrorKind::Validation);

    let err = cursor
        .remove_key_range(&seq_key(9), &seq_key(5))
        .unwrap_err();
    assert_eq!(err.kind(), vellum::ErrorKind::Validation);
}

#[test]
fn transactional_range_remove_applies_at_commit() {
    let _db = setup();
    let mut cursor = cursor("t");

    for i in 0..50u32 {
        cursor.set_key(&seq_key(i));
        cursor.store_bytes(&[1]).unwrap();
    }

    cursor.begin().unwrap();
    cursor
        .remove_key_range(&seq_key(10), &seq_key(20))
        .unwrap();

    // inside the transaction the span is already invisible
    cursor.set_key(&seq_key(15));
    assert!(!cursor.fetch().unwrap());

    cursor.commit().unwrap();

    for i in 0..50u32 {
        cursor.set_key(&seq_key(i));
        let expected = !(10..20).contains(&i);
        assert_eq!(cursor.fetch().unwrap(), expected, "key {}", i);
    }
}
