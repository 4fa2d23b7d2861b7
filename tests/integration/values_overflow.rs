//! Large values spilling to overflow chains, and reserved in-place values.

#![allow(missing_docs)]

use sapling::{Db, DbOptions, Dbi, Result, SaplingError};

fn pattern(len: usize, seed: u8) -> Vec<u8> {
    (0..len).map(|i| (i as u8).wrapping_mul(31).wrapping_add(seed)).collect()
}

#[test]
fn large_values_round_trip() -> Result<()> {
    let db = Db::open(DbOptions::default())?;
    let big = pattern(20_000, 7);
    let mut txn = db.begin_write()?;
    txn.put(Dbi::MAIN, b"big", &big)?;
    txn.put(Dbi::MAIN, b"small", b"s")?;
    txn.commit()?;

    let txn = db.begin_read()?;
    assert_eq!(txn.get(Dbi::MAIN, b"big")?, Some(big));
    let report = txn.verify(Dbi::MAIN)?;
    assert_eq!(report.entries, 2);
    assert!(report.overflow_pages >= 5);
    Ok(())
}

#[test]
fn value_length_limits() -> Result<()> {
    let db = Db::open(DbOptions::default())?;
    let mut txn = db.begin_write()?;
    let max = pattern(65_535, 1);
    txn.put(Dbi::MAIN, b"max", &max)?;
    assert_eq!(txn.get(Dbi::MAIN, b"max")?, Some(max));
    let err = txn.put(Dbi::MAIN, b"over", &pattern(65_536, 1));
    assert!(matches!(err, Err(SaplingError::Full(_))));
    txn.put(Dbi::MAIN, b"empty", b"")?;
    assert_eq!(txn.get(Dbi::MAIN, b"empty")?, Some(Vec::new()));
    txn.commit()
}

#[test]
fn overwrite_and_delete_release_chains() -> Result<()> {
    let db = Db::open(DbOptions::default().with_page_size(512).with_max_dbis(4))?;
    let mut txn = db.begin_write()?;
    txn.put(Dbi::MAIN, b"k", &pattern(5_000, 2))?;
    txn.commit()?;

    let mut txn = db.begin_write()?;
    txn.put(Dbi::MAIN, b"k", &pattern(3_000, 3))?;
    assert_eq!(txn.get(Dbi::MAIN, b"k")?, Some(pattern(3_000, 3)));
    txn.put(Dbi::MAIN, b"k", b"inline now")?;
    assert_eq!(txn.verify(Dbi::MAIN)?.overflow_pages, 0);
    txn.commit()?;

    let mut txn = db.begin_write()?;
    txn.put(Dbi::MAIN, b"k", &pattern(5_000, 4))?;
    txn.del(Dbi::MAIN, b"k")?;
    assert_eq!(txn.get(Dbi::MAIN, b"k")?, None);
    assert_eq!(txn.verify(Dbi::MAIN)?.overflow_pages, 0);
    txn.commit()
}

#[test]
fn snapshot_keeps_replaced_overflow_value() -> Result<()> {
    let db = Db::open(DbOptions::default().with_page_size(512).with_max_dbis(4))?;
    let first = pattern(8_000, 9);
    let mut txn = db.begin_write()?;
    txn.put(Dbi::MAIN, b"doc", &first)?;
    txn.commit()?;

    let reader = db.begin_read()?;
    for round in 0..5u8 {
        let mut txn = db.begin_write()?;
        txn.put(Dbi::MAIN, b"doc", &pattern(8_000, round))?;
        txn.put(Dbi::MAIN, &[round], &pattern(2_000, round))?;
        txn.commit()?;
    }
    assert_eq!(reader.get(Dbi::MAIN, b"doc")?, Some(first));
    reader.commit()?;

    let latest = db.begin_read()?;
    assert_eq!(latest.get(Dbi::MAIN, b"doc")?, Some(pattern(8_000, 4)));
    assert_eq!(latest.verify(Dbi::MAIN)?.entries, 6);
    Ok(())
}

#[test]
fn reserve_fills_value_in_place() -> Result<()> {
    let db = Db::open(DbOptions::default())?;
    let mut txn = db.begin_write()?;
    {
        let mut slot = txn.put_reserve(Dbi::MAIN, b"counter", 8)?;
        slot.copy_from_slice(&42u64.to_le_bytes());
    }
    {
        let mut slot = txn.put_reserve(Dbi::MAIN, b"counter", 8)?;
        assert!(slot.iter().all(|&b| b == 0));
        slot[0] = 1;
    }
    txn.commit()?;

    let txn = db.begin_read()?;
    assert_eq!(txn.get(Dbi::MAIN, b"counter")?, Some(1u64.to_le_bytes().to_vec()));
    Ok(())
}
