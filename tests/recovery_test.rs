mod common;

use common::*;
use vellum::Database;

#[test]
// begin, store, commit, force (commit forces), kill the process
// (simulated by reopening without shutdown): the committed effect
// survives
fn crash_after_commit_keeps_effects() {
    let db = setup();
    {
        let mut cursor = cursor("t");
        cursor.begin().unwrap();
        cursor.set_key(&key(&[0x20]));
        cursor.store_bytes(&[0x01]).unwrap();
        cursor.commit().unwrap();
    }

    db.crash_and_reopen();

    let mut cursor = cursor("t");
    cursor.set_key(&key(&[0x20]));
    assert!(cursor.fetch().unwrap(), "committed record lost");
    assert_eq!(cursor.value().as_slice(), &[0x01]);
}

#[test]
// begin, store, flush nothing, kill: the effect is invisible and no
// long-record pages leak
fn crash_before_commit_discards_effects() {
    let db = setup();
    {
        let mut cursor = cursor("t");
        // anchor the tree so it exists after the crash
        cursor.set_key(&key(&[0x01]));
        cursor.store_bytes(&[0x01]).unwrap();
        Database::checkpoint().unwrap();

        cursor.begin().unwrap();
        cursor.set_key(&key(&[0x21]));
        cursor.store_bytes(&[0x02]).unwrap();
        // a long value inside the doomed transaction must not leak
        cursor.set_key(&key(&[0x22]));
        cursor.store_bytes(&patterned(500_000)).unwrap();
        // no commit
        std::mem::forget(cursor);
    }

    db.crash_and_reopen();

    let mut cursor = cursor("t");
    cursor.set_key(&key(&[0x21]));
    assert!(!cursor.fetch().unwrap(), "uncommitted record resurrected");
    cursor.set_key(&key(&[0x22]));
    assert!(!cursor.fetch().unwrap());

    // nothing of the transaction made it to disk, so no chain pages
    // can have leaked; the volume still passes an integrity check
    let volume = Database::volumes().into_iter().next().unwrap();
    let tree = Database::get_tree(volume.handle(), "t", false).unwrap();
    let mut session = Database::new_session();
    let report = vellum::tree::icheck::check_tree(&tree, &mut session).unwrap();
    Database::release_session(&mut session);
    assert!(report.is_healthy(), "problems: {:?}", report.problems);
    assert_eq!(report.records, 1);
}

#[test]
fn committed_transaction_with_long_value_survives_crash() {
    let db = setup();
    let payload = patterned(400_000);
    {
        let mut cursor = cursor("t");
        cursor.begin().unwrap();
        cursor.set_key(&key(&[0x33]));
        cursor.store_bytes(&payload).unwrap();
        cursor.commit().unwrap();
    }

    db.crash_and_reopen();

    let mut cursor = cursor("t");
    cursor.set_key(&key(&[0x33]));
    assert!(cursor.fetch().unwrap());
    assert!(cursor.value().as_slice() == payload.as_slice());
}

#[test]
fn abort_discards_the_update_buffer() {
    let _db = setup();
    let mut cursor = cursor("t");

    cursor.set_key(&key(&[0x01]));
    cursor.store_bytes(b"durable").unwrap();

    cursor.begin().unwrap();
    cursor.set_key(&key(&[0x01]));
    cursor.store_bytes(b"doomed").unwrap();
    cursor.set_key(&key(&[0x02]));
    cursor.store_bytes(b"also doomed").unwrap();
    cursor.abort().unwrap();

    cursor.set_key(&key(&[0x01]));
    assert!(cursor.fetch().unwrap());
    assert_eq!(cursor.value().as_slice(), b"durable");
    cursor.set_key(&key(&[0x02]));
    assert!(!cursor.fetch().unwrap());
}

#[test]
fn transaction_reads_its_own_writes() {
    let _db = setup();
    let mut cursor = cursor("t");

    cursor.set_key(&key(&[0x01]));
    cursor.store_bytes(b"before").unwrap();

    cursor.begin().unwrap();

    // own write visible through the buffer
    cursor.set_key(&key(&[0x02]));
    cursor.store_bytes(b"pending").unwrap();
    assert!(cursor.fetch().unwrap());
    assert_eq!(cursor.value().as_slice(), b"pending");

    // pending remove hides the committed record
    cursor.set_key(&key(&[0x01]));
    assert!(cursor.remove().unwrap());
    assert!(!cursor.fetch().unwrap());

    // traverse merges the buffer: only the pending store shows
    cursor.set_key(&vellum::Key::left_edge());
    assert!(cursor.traverse(vellum::Direction::Gt, true).unwrap());
    assert_eq!(cursor.key(), &key(&[0x02]));
    assert!(!cursor.traverse(vellum::Direction::Gt, true).unwrap());

    cursor.commit().unwrap();

    cursor.set_key(&key(&[0x01]));
    assert!(!cursor.fetch().unwrap());
    cursor.set_key(&key(&[0x02]));
    assert!(cursor.fetch().unwrap());
}

#[test]
fn several_crashes_in_a_row_converge() {
    let db = setup();
    for round in 0..3u32 {
        let mut cursor = cursor("t");
        cursor.begin().unwrap();
        cursor.set_key(&seq_key(round));
        cursor.store_bytes(&round.to_be_bytes()).unwrap();
        cursor.commit().unwrap();
        drop(cursor);
        db.crash_and_reopen();
    }

    let mut cursor = cursor("t");
    for round in 0..3u32 {
        cursor.set_key(&seq_key(round));
        assert!(cursor.fetch().unwrap(), "round {} lost", round);
        assert_eq!(cursor.value().as_slice(), &round.to_be_bytes());
    }
}
