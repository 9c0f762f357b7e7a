mod common;

use common::*;
use vellum::{Direction, Key, RangeKeyFilter};

#[test]
fn directions_behave_at_edges() {
    let _db = setup();
    let mut cursor = cursor("t");

    for b in [2u8, 4, 6].iter() {
        cursor.set_key(&key(&[*b]));
        cursor.store_bytes(&[*b]).unwrap();
    }

    // GTEQ lands on an exact match, GT steps past it
    cursor.set_key(&key(&[4]));
    assert!(cursor.traverse(Direction::Gteq, true).unwrap());
    assert_eq!(cursor.key(), &key(&[4]));
    assert!(cursor.traverse(Direction::Gt, true).unwrap());
    assert_eq!(cursor.key(), &key(&[6]));

    // LTEQ/LT mirror it
    cursor.set_key(&key(&[4]));
    assert!(cursor.traverse(Direction::Lteq, true).unwrap());
    assert_eq!(cursor.key(), &key(&[4]));
    assert!(cursor.traverse(Direction::Lt, true).unwrap());
    assert_eq!(cursor.key(), &key(&[2]));

    // both edges answer no-key instead of wrapping
    cursor.set_key(&key(&[6]));
    assert!(!cursor.traverse(Direction::Gt, true).unwrap());
    cursor.set_key(&key(&[2]));
    assert!(!cursor.traverse(Direction::Lt, true).unwrap());

    // EQ is a point probe
    cursor.set_key(&key(&[4]));
    assert!(cursor.traverse(Direction::Eq, true).unwrap());
    cursor.set_key(&key(&[5]));
    assert!(!cursor.traverse(Direction::Eq, true).unwrap());
}

#[test]
fn deep_traversal_descends_into_logical_children() {
    let _db = setup();
    let mut cursor = cursor("t");

    let parent = key(b"a");
    cursor.set_key(&parent);
    cursor.store_bytes(b"p").unwrap();

    let mut child = parent.clone();
    child.append(b"x").unwrap();
    cursor.set_key(&child);
    cursor.store_bytes(b"c").unwrap();

    let sibling = key(b"b");
    cursor.set_key(&sibling);
    cursor.store_bytes(b"s").unwrap();

    // deep: parent, child, sibling
    cursor.set_key(&Key::left_edge());
    let mut deep_keys = Vec::new();
    while cursor.traverse(Direction::Gt, true).unwrap() {
        deep_keys.push(cursor.key().clone());
    }
    assert_eq!(deep_keys, vec![parent.clone(), child.clone(), sibling.clone()]);

    // sibling-only: the child is skipped
    cursor.set_key(&Key::left_edge());
    let mut flat_keys = Vec::new();
    while cursor.traverse(Direction::Gt, false).unwrap() {
        flat_keys.push(cursor.key().clone());
    }
    assert_eq!(flat_keys, vec![parent, sibling]);
}

#[test]
fn key_filter_restricts_and_steers() {
    let _db = setup();
    let mut cursor = cursor("t");

    for i in 0..100u32 {
        cursor.set_key(&seq_key(i));
        cursor.store_bytes(&[1]).unwrap();
    }

    let filter = RangeKeyFilter {
        low: Some(seq_key(40)),
        high: Some(seq_key(44)),
    };

    cursor.set_key(&Key::left_edge());
    let mut seen = Vec::new();
    while cursor
        .traverse_filtered(Direction::Gt, true, Some(&filter))
        .unwrap()
    {
        seen.push(cursor.key().clone());
        if seen.len() > 10 {
            break;
        }
    }
    assert_eq!(
        seen,
        (40..=44).map(seq_key).collect::<Vec<_>>(),
        "filter did not clamp the walk"
    );
}

#[test]
fn traverse_reports_values_too() {
    let _db = setup();
    let mut cursor = cursor("t");

    for i in 0..10u32 {
        cursor.set_key(&seq_key(i));
        cursor.store_bytes(&i.to_be_bytes()).unwrap();
    }

    cursor.set_key(&Key::left_edge());
    let mut i = 0u32;
    while cursor.traverse(Direction::Gt, true).unwrap() {
        assert_eq!(cursor.value().as_slice(), &i.to_be_bytes());
        i += 1;
    }
    assert_eq!(i, 10);
}
