//! Randomized workloads checked against an in-memory model.

#![allow(missing_docs)]

use std::collections::BTreeMap;

use proptest::prelude::*;
use rand::{Rng, SeedableRng};
use rand_chacha::ChaCha8Rng;
use sapling::{Db, DbOptions, Dbi, Result, SaplingError};

fn open_small() -> Result<Db> {
    Db::open(DbOptions::default().with_page_size(256).with_max_dbis(4))
}

fn scan(db: &Db) -> Result<Vec<(Vec<u8>, Vec<u8>)>> {
    let txn = db.begin_read()?;
    let mut cur = txn.cursor(Dbi::MAIN)?;
    let mut out = Vec::new();
    let mut more = cur.first()?;
    while more {
        out.extend(cur.get()?);
        more = cur.next()?;
    }
    Ok(out)
}

#[test]
fn ten_thousand_random_inserts_on_small_pages() -> Result<()> {
    let db = open_small()?;
    let mut rng = ChaCha8Rng::seed_from_u64(0x5A91);
    let mut model = BTreeMap::new();

    for _ in 0..10 {
        let mut txn = db.begin_write()?;
        for _ in 0..1_000 {
            let key = rng.gen::<u64>().to_be_bytes().to_vec();
            let len = rng.gen_range(0..40);
            let value: Vec<u8> = (0..len).map(|_| rng.gen()).collect();
            txn.put(Dbi::MAIN, &key, &value)?;
            model.insert(key, value);
        }
        txn.commit()?;
    }
    let txn = db.begin_read()?;
    let report = txn.verify(Dbi::MAIN)?;
    assert_eq!(report.entries as usize, model.len());
    assert!(report.depth >= 3);
    txn.commit()?;
    assert_eq!(scan(&db)?, model.clone().into_iter().collect::<Vec<_>>());

    let doomed: Vec<Vec<u8>> = model.keys().step_by(2).cloned().collect();
    let mut txn = db.begin_write()?;
    for key in &doomed {
        txn.del(Dbi::MAIN, key)?;
        model.remove(key);
    }
    txn.commit()?;
    let txn = db.begin_read()?;
    assert_eq!(txn.verify(Dbi::MAIN)?.entries as usize, model.len());
    txn.commit()?;
    assert_eq!(scan(&db)?, model.into_iter().collect::<Vec<_>>());
    Ok(())
}

#[test]
fn rewrites_without_readers_stop_growing_the_file() -> Result<()> {
    let db = open_small()?;
    let rewrite = |tag: u8| -> Result<()> {
        let mut txn = db.begin_write()?;
        for n in 0..300u32 {
            txn.put(Dbi::MAIN, &n.to_be_bytes(), &[tag; 12])?;
        }
        txn.commit()
    };
    for tag in 0..3 {
        rewrite(tag)?;
    }
    let plateau = db.num_pages();
    for tag in 3..60 {
        rewrite(tag)?;
        assert!(
            db.num_pages() <= plateau,
            "page count grew to {} past {plateau}",
            db.num_pages()
        );
    }
    let txn = db.begin_read()?;
    assert_eq!(txn.get(Dbi::MAIN, &7u32.to_be_bytes())?, Some(vec![59; 12]));
    Ok(())
}

#[test]
fn delete_then_reinsert_reuses_pages() -> Result<()> {
    let db = open_small()?;
    let keys: Vec<[u8; 4]> = (0..400u32).map(|n| n.to_be_bytes()).collect();
    let round = |tag: u8| -> Result<()> {
        let mut txn = db.begin_write()?;
        for key in &keys {
            txn.del(Dbi::MAIN, key)?;
        }
        assert_eq!(txn.verify(Dbi::MAIN)?.entries, 0);
        txn.commit()?;
        let mut txn = db.begin_write()?;
        for key in &keys {
            txn.put(Dbi::MAIN, key, &[tag; 10])?;
        }
        assert_eq!(txn.verify(Dbi::MAIN)?.entries, 400);
        txn.commit()
    };

    let mut txn = db.begin_write()?;
    for key in &keys {
        txn.put(Dbi::MAIN, key, &[0; 10])?;
    }
    txn.commit()?;
    for tag in 1..4 {
        round(tag)?;
    }
    let plateau = db.num_pages();
    for tag in 4..30 {
        round(tag)?;
        assert!(
            db.num_pages() <= plateau,
            "page count grew to {} past {plateau}",
            db.num_pages()
        );
    }
    let txn = db.begin_read()?;
    assert_eq!(txn.get(Dbi::MAIN, &keys[123])?, Some(vec![29; 10]));
    Ok(())
}

#[test]
fn ascending_deletes_keep_the_tree_valid() -> Result<()> {
    let db = open_small()?;
    let mut txn = db.begin_write()?;
    for n in 0..3_000u32 {
        txn.put(Dbi::MAIN, &n.to_be_bytes(), b"v")?;
    }
    txn.commit()?;

    for chunk in (0..3_000u32).collect::<Vec<_>>().chunks(50) {
        let mut txn = db.begin_write()?;
        for n in chunk {
            txn.del(Dbi::MAIN, &n.to_be_bytes())?;
            txn.verify(Dbi::MAIN)?;
        }
        txn.commit()?;
    }
    assert_eq!(db.stat()?.entries, 0);
    assert_eq!(db.stat()?.depth, 0);
    Ok(())
}

#[test]
fn pinned_snapshot_forces_growth_until_released() -> Result<()> {
    let db = open_small()?;
    let mut txn = db.begin_write()?;
    for n in 0..300u32 {
        txn.put(Dbi::MAIN, &n.to_be_bytes(), b"first!")?;
    }
    txn.commit()?;

    let reader = db.begin_read()?;
    let pinned = db.num_pages();
    let mut txn = db.begin_write()?;
    for n in 0..300u32 {
        txn.put(Dbi::MAIN, &n.to_be_bytes(), b"second")?;
    }
    txn.commit()?;
    let grown = db.num_pages();
    assert!(grown > pinned);
    assert_eq!(reader.get(Dbi::MAIN, &5u32.to_be_bytes())?, Some(b"first!".to_vec()));
    reader.commit()?;

    let mut txn = db.begin_write()?;
    for n in 0..300u32 {
        txn.put(Dbi::MAIN, &n.to_be_bytes(), b"third!")?;
    }
    txn.commit()?;
    assert_eq!(db.num_pages(), grown);
    Ok(())
}

#[derive(Clone, Debug)]
enum Step {
    Put(u16, u8),
    Del(u16),
    Nested(Vec<(u16, u8)>, bool),
}

#[derive(Clone, Debug)]
struct Batch {
    steps: Vec<Step>,
    commit: bool,
}

fn step() -> impl Strategy<Value = Step> {
    prop_oneof![
        4 => (0u16..500, any::<u8>()).prop_map(|(k, v)| Step::Put(k, v)),
        2 => (0u16..500).prop_map(Step::Del),
        1 => (prop::collection::vec((0u16..500, any::<u8>()), 0..20), any::<bool>())
            .prop_map(|(puts, keep)| Step::Nested(puts, keep)),
    ]
}

fn batch() -> impl Strategy<Value = Batch> {
    (prop::collection::vec(step(), 0..60), prop::bool::weighted(0.8))
        .prop_map(|(steps, commit)| Batch { steps, commit })
}

fn apply(db: &Db, model: &mut BTreeMap<Vec<u8>, Vec<u8>>, batch: &Batch) -> Result<()> {
    let mut draft = model.clone();
    let mut txn = db.begin_write()?;
    for step in &batch.steps {
        match step {
            Step::Put(k, v) => {
                let key = k.to_be_bytes();
                let value = vec![*v; usize::from(*v % 32)];
                txn.put(Dbi::MAIN, &key, &value)?;
                draft.insert(key.to_vec(), value);
            }
            Step::Del(k) => {
                let key = k.to_be_bytes();
                match txn.del(Dbi::MAIN, &key) {
                    Ok(()) => assert!(draft.remove(key.as_slice()).is_some()),
                    Err(SaplingError::NotFound) => assert!(!draft.contains_key(key.as_slice())),
                    Err(err) => return Err(err),
                }
            }
            Step::Nested(puts, keep) => {
                let mut child = txn.begin_nested()?;
                let mut inner = draft.clone();
                for (k, v) in puts {
                    let key = k.to_be_bytes();
                    child.put(Dbi::MAIN, &key, &[*v])?;
                    inner.insert(key.to_vec(), vec![*v]);
                }
                if *keep {
                    child.commit()?;
                    draft = inner;
                } else {
                    child.abort();
                }
            }
        }
    }
    if batch.commit {
        txn.commit()?;
        *model = draft;
    } else {
        txn.abort();
    }
    Ok(())
}

proptest! {
    #![proptest_config(ProptestConfig::with_cases(24))]
    #[test]
    fn transactions_match_a_model(batches in prop::collection::vec(batch(), 1..12)) {
        let db = open_small().expect("open");
        let mut model = BTreeMap::new();
        for b in &batches {
            apply(&db, &mut model, b).expect("apply batch");
        }
        let txn = db.begin_read().expect("reader");
        let report = txn.verify(Dbi::MAIN).expect("verify");
        prop_assert_eq!(report.entries as usize, model.len());
        drop(txn);
        let actual = scan(&db).expect("scan");
        prop_assert_eq!(actual, model.into_iter().collect::<Vec<_>>());
    }
}
