//! Commit-time prefix watches and expiring keys.

#![allow(missing_docs)]

use std::sync::{Arc, Mutex};

use sapling::{
    Db, DbOptions, Dbi, DbiFlags, Result, SaplingError, SweepCheckpoint, TtlFlags, WatchCallback,
};

type Events = Arc<Mutex<Vec<(Vec<u8>, Option<Vec<u8>>)>>>;

fn recorder() -> (Events, WatchCallback) {
    let events: Events = Arc::default();
    let sink = Arc::clone(&events);
    let callback: WatchCallback = Arc::new(move |key: &[u8], value: Option<&[u8]>| {
        if let Ok(mut events) = sink.lock() {
            events.push((key.to_vec(), value.map(<[u8]>::to_vec)));
        }
    });
    (events, callback)
}

fn drain(events: &Events) -> Vec<(Vec<u8>, Option<Vec<u8>>)> {
    events.lock().map(|mut e| std::mem::take(&mut *e)).unwrap_or_default()
}

#[test]
fn watch_sees_committed_values_under_prefix() -> Result<()> {
    let db = Db::open(DbOptions::default())?;
    let (events, callback) = recorder();
    db.watch(Dbi::MAIN, b"cfg/", callback)?;

    let mut txn = db.begin_write()?;
    txn.put(Dbi::MAIN, b"cfg/a", b"1")?;
    txn.put(Dbi::MAIN, b"data/x", b"ignored")?;
    {
        let mut child = txn.begin_nested()?;
        child.put(Dbi::MAIN, b"cfg/b", b"2")?;
        child.commit()?;
    }
    {
        let mut child = txn.begin_nested()?;
        child.put(Dbi::MAIN, b"cfg/dropped", b"3")?;
        child.abort();
    }
    txn.commit()?;
    assert_eq!(
        drain(&events),
        vec![
            (b"cfg/a".to_vec(), Some(b"1".to_vec())),
            (b"cfg/b".to_vec(), Some(b"2".to_vec())),
        ]
    );

    let mut txn = db.begin_write()?;
    txn.del_range(Dbi::MAIN, Some(&b"cfg/"[..]), Some(&b"cfg0"[..]))?;
    txn.commit()?;
    assert_eq!(
        drain(&events),
        vec![(b"cfg/a".to_vec(), None), (b"cfg/b".to_vec(), None)]
    );
    Ok(())
}

#[test]
fn every_matching_watch_fires_and_unwatch_stops_delivery() -> Result<()> {
    let db = Db::open(DbOptions::default())?;
    let (broad, broad_cb) = recorder();
    let (narrow, narrow_cb) = recorder();
    db.watch(Dbi::MAIN, b"", broad_cb.clone())?;
    db.watch(Dbi::MAIN, b"user:", narrow_cb)?;

    let mut txn = db.begin_write()?;
    txn.put(Dbi::MAIN, b"user:1", b"ann")?;
    txn.put(Dbi::MAIN, b"zone", b"eu")?;
    txn.commit()?;
    assert_eq!(drain(&broad).len(), 2);
    assert_eq!(drain(&narrow).len(), 1);

    db.unwatch(Dbi::MAIN, b"", &broad_cb)?;
    let mut txn = db.begin_write()?;
    txn.put(Dbi::MAIN, b"user:2", b"bob")?;
    txn.commit()?;
    assert!(drain(&broad).is_empty());
    assert_eq!(drain(&narrow), vec![(b"user:2".to_vec(), Some(b"bob".to_vec()))]);
    Ok(())
}

#[test]
fn callbacks_may_open_transactions() -> Result<()> {
    let db = Arc::new(Db::open(DbOptions::default())?);
    let seen = Arc::new(Mutex::new(Vec::new()));
    let weak = Arc::downgrade(&db);
    let sink = Arc::clone(&seen);
    let callback: WatchCallback = Arc::new(move |key: &[u8], _: Option<&[u8]>| {
        let Some(db) = weak.upgrade() else {
            return;
        };
        let stat = db.begin_read().and_then(|txn| txn.stat());
        if let (Ok(stat), Ok(mut seen)) = (stat, sink.lock()) {
            seen.push((key.to_vec(), stat.txnid));
        }
    });
    db.watch(Dbi::MAIN, b"k", callback)?;
    let mut txn = db.begin_write()?;
    txn.put(Dbi::MAIN, b"k1", b"v")?;
    txn.commit()?;
    let seen = seen.lock().map(|s| s.clone()).unwrap_or_default();
    assert_eq!(seen, vec![(b"k1".to_vec(), 1)]);
    Ok(())
}

#[test]
fn watched_dbi_cannot_become_dupsort() -> Result<()> {
    let db = Db::open(DbOptions::default())?;
    let dbi = db.dbi_open(1, None, DbiFlags::NONE)?;
    let (_, callback) = recorder();
    db.watch(dbi, b"", callback)?;
    assert!(matches!(db.dbi_set_dupsort(dbi, None), Err(SaplingError::Busy(_))));
    assert!(matches!(db.dbi_open(1, None, DbiFlags::DUPSORT), Err(SaplingError::Busy(_))));
    Ok(())
}

fn ttl_db() -> Result<(Db, Dbi, Dbi)> {
    let db = Db::open(DbOptions::default())?;
    let data = db.dbi_open(1, None, DbiFlags::NONE)?;
    let meta = db.dbi_open(2, None, DbiFlags::NONE)?;
    Ok((db, data, meta))
}

#[test]
fn ttl_keys_expire_and_sweep() -> Result<()> {
    let (db, data, meta) = ttl_db()?;
    let mut txn = db.begin_write()?;
    txn.put_ttl(data, meta, b"session:1", b"a", 1_000)?;
    txn.put_ttl(data, meta, b"session:2", b"b", 2_000)?;
    txn.put_ttl(data, meta, b"session:3", b"c", 3_000)?;
    txn.put(data, b"plain", b"untracked")?;
    txn.commit()?;

    let txn = db.begin_read()?;
    assert_eq!(txn.get_ttl(data, meta, b"session:1", 999)?, Some(b"a".to_vec()));
    assert_eq!(txn.get_ttl(data, meta, b"session:1", 1_000)?, None);
    assert_eq!(txn.get_ttl(data, meta, b"plain", 0)?, None);
    assert_eq!(txn.get(data, b"session:1")?, Some(b"a".to_vec()));
    txn.commit()?;

    let mut txn = db.begin_write()?;
    assert_eq!(txn.sweep_ttl_limit(data, meta, 5_000, 0)?, 0);
    assert_eq!(txn.sweep_ttl_limit(data, meta, 5_000, 1)?, 1);
    assert_eq!(txn.sweep_ttl(data, meta, 2_000)?, 1);
    assert_eq!(txn.get(data, b"session:2")?, None);
    assert_eq!(txn.get(data, b"session:3")?, Some(b"c".to_vec()));
    assert_eq!(txn.sweep_ttl(data, meta, 2_500)?, 0);
    assert_eq!(txn.sweep_ttl(data, meta, 10_000)?, 1);
    assert_eq!(txn.dbi_stat(meta)?.entries, 0);
    assert_eq!(txn.get(data, b"plain")?, Some(b"untracked".to_vec()));
    txn.commit()
}

#[test]
fn ttl_refresh_replaces_the_old_expiry() -> Result<()> {
    let (db, data, meta) = ttl_db()?;
    let mut txn = db.begin_write()?;
    txn.put_ttl(data, meta, b"k", b"v1", 100)?;
    txn.put_ttl(data, meta, b"k", b"v2", 900)?;
    assert_eq!(txn.dbi_stat(meta)?.entries, 2);
    assert_eq!(txn.sweep_ttl(data, meta, 500)?, 0);
    assert_eq!(txn.get_ttl(data, meta, b"k", 500)?, Some(b"v2".to_vec()));
    txn.commit()
}

#[test]
fn checkpointed_sweeps_walk_the_index_in_batches() -> Result<()> {
    let (db, data, meta) = ttl_db()?;
    let mut txn = db.begin_write()?;
    for n in 1..=10u64 {
        txn.put_ttl(data, meta, format!("s{n:02}").as_bytes(), b"v", n * 100)?;
    }
    txn.commit()?;

    let mut checkpoint = SweepCheckpoint::default();
    let mut txn = db.begin_write()?;
    assert_eq!(txn.sweep_ttl_from(data, meta, 1_000, 3, &mut checkpoint)?, 3);
    assert!(checkpoint.is_set());
    txn.put_ttl(data, meta, b"early", b"v", 50)?;
    assert_eq!(txn.sweep_ttl_from(data, meta, 1_000, 3, &mut checkpoint)?, 3);
    assert_eq!(txn.get(data, b"early")?, Some(b"v".to_vec()));
    assert_eq!(txn.get(data, b"s06")?, None);
    assert_eq!(txn.get(data, b"s07")?, Some(b"v".to_vec()));
    assert_eq!(txn.sweep_ttl_from(data, meta, 1_000, 3, &mut checkpoint)?, 3);
    assert_eq!(txn.sweep_ttl_from(data, meta, 1_000, 3, &mut checkpoint)?, 1);
    assert!(!checkpoint.is_set());
    assert_eq!(txn.sweep_ttl_from(data, meta, 1_000, 3, &mut checkpoint)?, 1);
    assert_eq!(txn.get(data, b"early")?, None);
    assert_eq!(txn.dbi_stat(meta)?.entries, 0);
    txn.commit()
}

#[test]
fn cursor_reads_respect_expiry() -> Result<()> {
    let (db, data, meta) = ttl_db()?;
    let mut txn = db.begin_write()?;
    txn.put_ttl(data, meta, b"a", b"gone", 100)?;
    txn.put_ttl(data, meta, b"b", b"live", 900)?;
    txn.put(data, b"c", b"plain")?;
    txn.commit()?;

    let txn = db.begin_read()?;
    let mut cur = txn.cursor(data)?;
    assert!(matches!(
        cur.get_ttl(meta, 500, TtlFlags::NONE),
        Err(SaplingError::NotFound)
    ));
    assert!(cur.first()?);
    assert_eq!(cur.get_ttl(meta, 500, TtlFlags::LAZY_DELETE)?, None);
    assert_eq!(cur.key()?, Some(b"a".to_vec()));
    assert!(cur.next()?);
    assert_eq!(cur.get_ttl(meta, 500, TtlFlags::NONE)?, Some(b"live".to_vec()));
    assert!(cur.next()?);
    assert_eq!(cur.get_ttl(meta, 500, TtlFlags::NONE)?, None);
    txn.commit()?;

    let mut txn = db.begin_write()?;
    {
        let mut cur = txn.cursor_mut(data)?;
        assert!(cur.first()?);
        assert_eq!(cur.get_ttl(meta, 500, TtlFlags::NONE)?, None);
        assert_eq!(cur.key()?, Some(b"a".to_vec()));
        assert_eq!(cur.get_ttl(meta, 500, TtlFlags::LAZY_DELETE)?, None);
        assert_eq!(cur.key()?, Some(b"b".to_vec()));
        assert!(matches!(cur.get_ttl(data, 500, TtlFlags::NONE), Err(SaplingError::Invalid(_))));
    }
    assert_eq!(txn.get(data, b"a")?, None);
    assert_eq!(txn.dbi_stat(meta)?.entries, 2);
    txn.commit()
}

#[test]
fn ttl_needs_two_plain_dbis() -> Result<()> {
    let (db, data, _) = ttl_db()?;
    let dup = db.dbi_open(3, None, DbiFlags::DUPSORT)?;
    let mut txn = db.begin_write()?;
    assert!(matches!(txn.put_ttl(data, data, b"k", b"v", 1), Err(SaplingError::Invalid(_))));
    assert!(matches!(txn.put_ttl(data, dup, b"k", b"v", 1), Err(SaplingError::Invalid(_))));
    txn.put(data, b"k", b"v")?;
    txn.commit()
}
