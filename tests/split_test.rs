mod common;

use common::*;
use vellum::{tree::icheck, utils::HandyRwLock, Database, Direction, Key};

#[test]
// sequential load forces leaf splits and root growth; every key stays
// reachable in order
fn sequential_inserts_split_pages() {
    let _db = setup();
    let mut cursor = cursor("t");
    let value = vec![0x5Au8; 128];

    for i in 0..1024u32 {
        cursor.set_key(&seq_key(i));
        cursor.store_bytes(&value).unwrap();
    }

    assert!(cursor.tree().rl().depth() >= 2, "tree never split");

    // forward traversal reports every key in order
    cursor.set_key(&Key::left_edge());
    let mut count = 0u32;
    while cursor.traverse(Direction::Gt, true).unwrap() {
        assert_eq!(cursor.key(), &seq_key(count), "order broken at {}", count);
        assert_eq!(cursor.value().len(), 128);
        count += 1;
    }
    assert_eq!(count, 1024);
}

#[test]
fn random_inserts_stay_sorted() {
    use rand::{rngs::StdRng, seq::SliceRandom, SeedableRng};

    let _db = setup();
    let mut cursor = cursor("t");

    let mut order: Vec<u32> = (0..800).collect();
    order.shuffle(&mut StdRng::seed_from_u64(7));
    for i in order {
        cursor.set_key(&seq_key(i));
        cursor.store_bytes(&i.to_be_bytes()).unwrap();
    }

    cursor.set_key(&Key::left_edge());
    let mut expected = 0u32;
    while cursor.traverse(Direction::Gt, true).unwrap() {
        assert_eq!(cursor.key(), &seq_key(expected));
        assert_eq!(cursor.value().as_slice(), &expected.to_be_bytes());
        expected += 1;
    }
    assert_eq!(expected, 800);
}

#[test]
fn split_tree_passes_integrity_check() {
    let _db = setup();
    let mut cursor = cursor("t");

    for i in 0..2048u32 {
        cursor.set_key(&seq_key(i));
        cursor.store_bytes(&[1u8; 64]).unwrap();
    }

    let tree = cursor.tree().clone();
    let mut session = Database::new_session();
    let report = icheck::check_tree(&tree, &mut session).unwrap();
    Database::release_session(&mut session);

    assert!(report.is_healthy(), "problems: {:?}", report.problems);
    assert_eq!(report.records, 2048);
    assert!(report.depth >= 2);
    assert!(report.data_pages > 1);
}

#[test]
fn backward_traversal_spans_pages() {
    let _db = setup();
    let mut cursor = cursor("t");

    for i in 0..600u32 {
        cursor.set_key(&seq_key(i));
        cursor.store_bytes(&[0u8; 64]).unwrap();
    }

    cursor.set_key(&Key::right_edge());
    let mut expected: i64 = 599;
    while cursor.traverse(Direction::Lt, true).unwrap() {
        assert_eq!(cursor.key(), &seq_key(expected as u32));
        expected -= 1;
    }
    assert_eq!(expected, -1);
}
