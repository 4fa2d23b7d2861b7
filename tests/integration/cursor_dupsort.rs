//! Cursor navigation over plain and DUPSORT sub-databases.

#![allow(missing_docs)]

use sapling::{Comparator, Db, DbOptions, Dbi, DbiFlags, Result, SaplingError};

fn open() -> Result<Db> {
    Db::open(DbOptions::default().with_page_size(256).with_max_dbis(8))
}

fn key(n: u32) -> Vec<u8> {
    format!("k{n:04}").into_bytes()
}

#[test]
fn duplicates_of_one_key() -> Result<()> {
    let db = open()?;
    let dbi = db.dbi_open(1, None, DbiFlags::DUPSORT)?;
    let mut txn = db.begin_write()?;
    txn.put(dbi, b"x", b"1")?;
    txn.put(dbi, b"x", b"2")?;
    txn.commit()?;

    let txn = db.begin_read()?;
    let mut cur = txn.cursor(dbi)?;
    assert!(cur.seek(b"x")?);
    assert_eq!(cur.get()?, Some((b"x".to_vec(), b"1".to_vec())));
    assert_eq!(cur.count_dup()?, 2);
    assert!(cur.next_dup()?);
    assert_eq!(cur.get()?, Some((b"x".to_vec(), b"2".to_vec())));
    // Running out of duplicates keeps the position.
    assert!(!cur.next_dup()?);
    assert_eq!(cur.get()?, Some((b"x".to_vec(), b"2".to_vec())));
    assert!(cur.prev_dup()?);
    assert_eq!(cur.get()?, Some((b"x".to_vec(), b"1".to_vec())));
    Ok(())
}

#[test]
fn first_and_last_dup_span_leaves() -> Result<()> {
    let db = open()?;
    let dbi = db.dbi_open(1, None, DbiFlags::DUPSORT)?;
    let mut txn = db.begin_write()?;
    txn.put(dbi, b"a", b"only")?;
    for v in 0..120u32 {
        txn.put(dbi, b"m", &key(v))?;
    }
    txn.put(dbi, b"z", b"only")?;

    let mut cur = txn.cursor(dbi)?;
    assert!(cur.seek(b"m")?);
    assert!(cur.last_dup()?);
    assert_eq!(cur.get()?, Some((b"m".to_vec(), key(119))));
    assert_eq!(cur.count_dup()?, 120);
    assert_eq!(cur.get()?, Some((b"m".to_vec(), key(119))));
    assert!(cur.first_dup()?);
    assert_eq!(cur.get()?, Some((b"m".to_vec(), key(0))));
    assert!(!cur.prev_dup()?);
    assert!(cur.prev()?);
    assert_eq!(cur.key()?, Some(b"a".to_vec()));
    assert_eq!(txn.count_range(dbi, Some(&b"m"[..]), Some(&b"n"[..]))?, 120);
    Ok(())
}

#[test]
fn custom_value_order() -> Result<()> {
    let db = open()?;
    let dbi = db.dbi_open(2, None, DbiFlags::NONE)?;
    db.dbi_set_dupsort(dbi, Some(Comparator::new(|a: &[u8], b: &[u8]| b.cmp(a))))?;
    let mut txn = db.begin_write()?;
    for v in [b"1", b"3", b"2"] {
        txn.put(dbi, b"k", v)?;
    }
    assert_eq!(txn.get(dbi, b"k")?, Some(b"3".to_vec()));
    let mut cur = txn.cursor(dbi)?;
    let mut values = Vec::new();
    let mut more = cur.first()?;
    while more {
        if let Some((_, v)) = cur.get()? {
            values.push(v);
        }
        more = cur.next_dup()?;
    }
    assert_eq!(values, vec![b"3".to_vec(), b"2".to_vec(), b"1".to_vec()]);
    Ok(())
}

#[test]
fn dup_moves_require_dupsort() -> Result<()> {
    let db = open()?;
    let mut txn = db.begin_write()?;
    txn.put(Dbi::MAIN, b"k", b"v")?;
    let mut cur = txn.cursor(Dbi::MAIN)?;
    assert!(cur.first()?);
    assert!(matches!(cur.next_dup(), Err(SaplingError::Invalid(_))));
    assert!(matches!(cur.count_dup(), Err(SaplingError::Invalid(_))));
    Ok(())
}

#[test]
fn full_scans_both_directions() -> Result<()> {
    let db = open()?;
    let mut txn = db.begin_write()?;
    for n in (0..400).rev() {
        txn.put(Dbi::MAIN, &key(n), &n.to_le_bytes())?;
    }
    txn.commit()?;

    let txn = db.begin_read()?;
    let mut cur = txn.cursor(Dbi::MAIN)?;
    let mut forward = Vec::new();
    let mut more = cur.first()?;
    while more {
        forward.push(cur.key()?.expect("positioned"));
        more = cur.next()?;
    }
    assert!(!cur.is_positioned());
    let mut backward = Vec::new();
    let mut more = cur.last()?;
    while more {
        backward.push(cur.key()?.expect("positioned"));
        more = cur.prev()?;
    }
    backward.reverse();
    assert_eq!(forward.len(), 400);
    assert_eq!(forward, backward);
    assert_eq!(forward[17], key(17));
    Ok(())
}

#[test]
fn seek_prefix_and_in_prefix() -> Result<()> {
    let db = open()?;
    let mut txn = db.begin_write()?;
    for k in ["app", "apple", "apricot", "banana", "band"] {
        txn.put(Dbi::MAIN, k.as_bytes(), b"")?;
    }
    let mut cur = txn.cursor(Dbi::MAIN)?;
    assert!(cur.seek_prefix(b"ap")?);
    let mut hits = Vec::new();
    while cur.in_prefix(b"ap")? {
        hits.push(cur.key()?.expect("positioned"));
        if !cur.next()? {
            break;
        }
    }
    assert_eq!(hits, vec![b"app".to_vec(), b"apple".to_vec(), b"apricot".to_vec()]);
    assert!(!cur.seek_prefix(b"c")?);
    assert!(!cur.is_positioned());
    assert!(!cur.seek_prefix(b"bx")?);
    assert!(!cur.seek(b"bx")?);
    Ok(())
}

#[test]
fn cursor_del_on_duplicates_keeps_a_position() -> Result<()> {
    let db = open()?;
    let dbi = db.dbi_open(1, None, DbiFlags::DUPSORT)?;
    let mut txn = db.begin_write()?;
    txn.put(dbi, b"k", b"b")?;
    txn.put(dbi, b"k", b"a")?;
    txn.put(dbi, b"l", b"c")?;
    {
        let mut cur = txn.cursor_mut(dbi)?;
        assert!(matches!(cur.put(b"x"), Err(SaplingError::NotFound)));
        assert!(cur.first()?);
        assert_eq!(cur.get()?, Some((b"k".to_vec(), b"a".to_vec())));
        assert!(matches!(cur.put(b"x"), Err(SaplingError::Invalid(_))));
        cur.del()?;
        assert_eq!(cur.get()?, Some((b"k".to_vec(), b"b".to_vec())));
        cur.del()?;
        assert_eq!(cur.key()?, Some(b"l".to_vec()));
        cur.del()?;
        assert!(!cur.is_positioned());
        assert!(matches!(cur.del(), Err(SaplingError::NotFound)));
    }
    assert_eq!(txn.dbi_stat(dbi)?.entries, 0);
    txn.commit()
}

#[test]
fn cursor_put_rewrites_the_current_entry() -> Result<()> {
    let db = open()?;
    let mut txn = db.begin_write()?;
    for n in 0..100 {
        txn.put(Dbi::MAIN, &key(n), b"old")?;
    }
    {
        let mut cur = txn.cursor_mut(Dbi::MAIN)?;
        assert!(matches!(cur.put(b"nowhere"), Err(SaplingError::NotFound)));
        let mut more = cur.first()?;
        while more {
            cur.put(b"UPDATED")?;
            more = cur.next()?;
        }

        assert!(cur.seek(&key(40))?);
        let big = vec![9u8; 1_000];
        cur.put(&big)?;
        assert_eq!(cur.get()?, Some((key(40), big)));
        assert!(cur.next()?);
        assert_eq!(cur.key()?, Some(key(41)));
        cur.put(b"")?;
        assert!(cur.prev()?);
        cur.put(b"small again")?;
        assert_eq!(cur.key()?, Some(key(40)));
    }
    assert_eq!(txn.stat()?.entries, 100);
    assert_eq!(txn.verify(Dbi::MAIN)?.overflow_pages, 0);
    assert_eq!(txn.get(Dbi::MAIN, &key(0))?, Some(b"UPDATED".to_vec()));
    assert_eq!(txn.get(Dbi::MAIN, &key(40))?, Some(b"small again".to_vec()));
    assert_eq!(txn.get(Dbi::MAIN, &key(41))?, Some(Vec::new()));
    assert_eq!(txn.get(Dbi::MAIN, &key(99))?, Some(b"UPDATED".to_vec()));
    txn.commit()?;

    let txn = db.begin_read()?;
    let mut cur = txn.cursor(Dbi::MAIN)?;
    assert!(cur.first()?);
    assert!(matches!(cur.put(b"v"), Err(SaplingError::ReadOnly)));
    Ok(())
}

#[test]
fn renew_moves_a_cursor_to_a_new_snapshot() -> Result<()> {
    let db = open()?;
    let mut txn = db.begin_write()?;
    txn.put(Dbi::MAIN, b"v1", b"")?;
    txn.commit()?;

    let old = db.begin_read()?;
    let mut txn = db.begin_write()?;
    txn.put(Dbi::MAIN, b"v2", b"")?;
    txn.commit()?;
    let new = db.begin_read()?;

    let mut cur = old.cursor(Dbi::MAIN)?;
    assert!(cur.last()?);
    assert_eq!(cur.key()?, Some(b"v1".to_vec()));
    cur.renew(&new)?;
    assert!(!cur.is_positioned());
    assert!(cur.last()?);
    assert_eq!(cur.key()?, Some(b"v2".to_vec()));
    Ok(())
}
