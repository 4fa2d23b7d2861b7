//! Snapshot isolation, the single-writer rule and nested transactions
//! through the public API.

#![allow(missing_docs)]

use std::sync::atomic::{AtomicBool, Ordering};

use sapling::{Db, DbOptions, Dbi, Result, SaplingError, TxnMode};

fn open() -> Result<Db> {
    Db::open(DbOptions::default().with_page_size(512).with_max_dbis(8))
}

#[test]
fn hello_world_round_trip() -> Result<()> {
    let db = Db::open(DbOptions::default())?;
    let mut txn = db.begin_write()?;
    txn.put(Dbi::MAIN, b"hello", b"world")?;
    txn.commit()?;

    let txn = db.begin_read()?;
    assert_eq!(txn.get(Dbi::MAIN, b"hello")?.as_deref(), Some(&b"world"[..]));
    assert_eq!(txn.get(Dbi::MAIN, b"absent")?, None);
    assert_eq!(txn.snapshot_txnid(), 1);
    txn.commit()
}

#[test]
fn uncommitted_writes_are_invisible_to_readers() -> Result<()> {
    let db = open()?;
    let mut writer = db.begin_write()?;
    writer.put(Dbi::MAIN, b"k", b"draft")?;

    let reader = db.begin_read()?;
    assert_eq!(reader.get(Dbi::MAIN, b"k")?, None);
    writer.commit()?;
    // The reader keeps the snapshot it started with.
    assert_eq!(reader.get(Dbi::MAIN, b"k")?, None);
    reader.commit()?;

    let fresh = db.begin(TxnMode::ReadOnly)?;
    assert_eq!(fresh.get(Dbi::MAIN, b"k")?.as_deref(), Some(&b"draft"[..]));
    Ok(())
}

#[test]
fn abort_leaves_committed_state_alone() -> Result<()> {
    let db = open()?;
    let mut txn = db.begin_write()?;
    txn.put(Dbi::MAIN, b"a", b"1")?;
    txn.commit()?;

    let mut txn = db.begin_write()?;
    txn.put(Dbi::MAIN, b"a", b"2")?;
    txn.del(Dbi::MAIN, b"a")?;
    txn.put(Dbi::MAIN, b"b", b"3")?;
    txn.abort();

    let read = db.begin_read()?;
    assert_eq!(read.get(Dbi::MAIN, b"a")?.as_deref(), Some(&b"1"[..]));
    assert_eq!(read.get(Dbi::MAIN, b"b")?, None);
    assert_eq!(read.snapshot_txnid(), 1);
    Ok(())
}

#[test]
fn nested_abort_then_nested_commit() -> Result<()> {
    let db = open()?;
    let mut txn = db.begin_write()?;
    txn.put(Dbi::MAIN, b"base", b"0")?;

    let mut child = txn.begin_nested()?;
    child.put(Dbi::MAIN, b"discarded", b"x")?;
    child.abort();

    let mut child = txn.begin_nested()?;
    child.put(Dbi::MAIN, b"kept", b"y")?;
    {
        let mut grandchild = child.begin_nested()?;
        grandchild.put(Dbi::MAIN, b"deep", b"z")?;
        grandchild.commit()?;
    }
    child.commit()?;
    txn.commit()?;

    let read = db.begin_read()?;
    assert_eq!(read.get(Dbi::MAIN, b"discarded")?, None);
    assert_eq!(read.get(Dbi::MAIN, b"kept")?.as_deref(), Some(&b"y"[..]));
    assert_eq!(read.get(Dbi::MAIN, b"deep")?.as_deref(), Some(&b"z"[..]));
    assert_eq!(read.stat()?.entries, 3);
    Ok(())
}

#[test]
fn nested_read_only_child_cannot_write() -> Result<()> {
    let db = open()?;
    let mut read = db.begin_read()?;
    let mut child = read.begin_nested()?;
    assert_eq!(child.mode(), TxnMode::ReadOnly);
    assert!(matches!(child.put(Dbi::MAIN, b"k", b"v"), Err(SaplingError::ReadOnly)));
    Ok(())
}

#[test]
fn writer_slot_is_released_by_drop() -> Result<()> {
    let db = open()?;
    {
        let mut txn = db.begin_write()?;
        txn.put(Dbi::MAIN, b"k", b"v")?;
        assert!(db.lock_snapshot().writer);
    }
    assert!(!db.lock_snapshot().any_active());
    let read = db.begin_read()?;
    assert_eq!(read.get(Dbi::MAIN, b"k")?, None);
    Ok(())
}

#[test]
fn stat_reflects_the_viewing_transaction() -> Result<()> {
    let db = open()?;
    let mut txn = db.begin_write()?;
    for i in 0..50u32 {
        txn.put(Dbi::MAIN, &i.to_be_bytes(), b"v")?;
    }
    let inside = txn.stat()?;
    assert!(inside.has_write_txn);
    assert_eq!(inside.entries, 50);
    assert_eq!(db.stat()?.entries, 0);
    txn.commit()?;

    let after = db.stat()?;
    assert_eq!(after.entries, 50);
    assert_eq!(after.txnid, 1);
    assert_eq!(after.page_size, 512);
    assert!(after.depth >= 1);
    Ok(())
}

#[test]
fn readers_never_observe_a_torn_commit() -> Result<()> {
    let db = open()?;
    let mut txn = db.begin_write()?;
    txn.put(Dbi::MAIN, b"left", &0u64.to_le_bytes())?;
    txn.put(Dbi::MAIN, b"right", &0u64.to_le_bytes())?;
    txn.commit()?;

    let done = AtomicBool::new(false);
    std::thread::scope(|s| -> Result<()> {
        let mut readers = Vec::new();
        for _ in 0..4 {
            readers.push(s.spawn(|| -> Result<u64> {
                let mut checks = 0;
                while !done.load(Ordering::Acquire) {
                    let read = db.begin_read()?;
                    let left = read.get(Dbi::MAIN, b"left")?;
                    let right = read.get(Dbi::MAIN, b"right")?;
                    assert_eq!(left, right);
                    read.commit()?;
                    checks += 1;
                }
                Ok(checks)
            }));
        }
        for round in 1..=200u64 {
            let mut txn = db.begin_write()?;
            txn.put(Dbi::MAIN, b"left", &round.to_le_bytes())?;
            txn.put(Dbi::MAIN, b"right", &round.to_le_bytes())?;
            txn.commit()?;
        }
        done.store(true, Ordering::Release);
        for reader in readers {
            reader.join().expect("reader thread panicked")?;
        }
        Ok(())
    })?;

    let read = db.begin_read()?;
    assert_eq!(read.get(Dbi::MAIN, b"left")?, Some(200u64.to_le_bytes().to_vec()));
    Ok(())
}
