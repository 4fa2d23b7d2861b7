//! Multi-step data operations built on the keyed primitives of [`Txn`].

use std::cmp::Ordering;

use tracing::debug;

use super::cursor::{reposition_after_remove, seek_user_key};
use super::transaction::{check_key, Txn};
use crate::storage::btree::build::build_tree;
use crate::storage::btree::cmp::composite;
use crate::storage::btree::cursor as nav;
use crate::storage::btree::page::{self, CellValue, LEAF_CELL_HEADER_LEN, MAX_KV_LEN, SLOT_LEN};
use crate::storage::btree::tree::{self, Path};
use crate::storage::cow::{retire_tree, tree_has_overflow};
use crate::types::{Dbi, Result, SaplingError};

const NO_VALUE: &[u8] = &[];

/// Largest value that stays inline next to a key of `klen` bytes.
fn inline_capacity(page_size: usize, klen: usize) -> usize {
    page::max_leaf_footprint(page_size)
        .saturating_sub(SLOT_LEN + LEAF_CELL_HEADER_LEN + klen)
        .min(MAX_KV_LEN)
}

impl<'a> Txn<'a> {
    /// Replaces the value of `key` only if it currently equals `expected`.
    ///
    /// `NotFound` when the key is absent, `Conflict` when the value differs.
    pub fn put_if(&mut self, dbi: Dbi, key: &[u8], value: &[u8], expected: &[u8]) -> Result<()> {
        self.check_write()?;
        let idx = self.check_dbi(dbi)?;
        if self.is_dupsort(idx) {
            return Err(SaplingError::Invalid("put_if is not supported on DUPSORT DBIs"));
        }
        match self.get(dbi, key)? {
            None => Err(SaplingError::NotFound),
            Some(current) if current != expected => Err(SaplingError::Conflict),
            Some(_) => self.put(dbi, key, value),
        }
    }

    /// Read-modify-write of `key` through `f(old, operand, out) -> needed_len`.
    ///
    /// `out` is sized to the inline capacity for the key. When `f` reports a
    /// larger need it is called once more with a buffer of exactly that size.
    pub fn merge<F>(&mut self, dbi: Dbi, key: &[u8], operand: &[u8], mut f: F) -> Result<()>
    where
        F: FnMut(Option<&[u8]>, &[u8], &mut [u8]) -> usize,
    {
        self.check_write()?;
        let idx = self.check_dbi(dbi)?;
        if self.is_dupsort(idx) {
            return Err(SaplingError::Invalid("merge is not supported on DUPSORT DBIs"));
        }
        let page_size = self.db().page_size();
        check_key(key, page_size)?;
        let old = self.get(dbi, key)?;
        let mut cap = inline_capacity(page_size, key.len());
        for _ in 0..2 {
            let mut out = vec![0u8; cap];
            let need = f(old.as_deref(), operand, &mut out);
            if need <= cap {
                out.truncate(need);
                return self.put(dbi, key, &out);
            }
            if need > MAX_KV_LEN {
                return Err(SaplingError::Full("merge output exceeds 65535 bytes"));
            }
            cap = need;
        }
        Err(SaplingError::Full("merge output grew past the retried buffer"))
    }

    /// Counts entries with `lo <= key < hi`; either bound may be open.
    ///
    /// Duplicates count individually.
    pub fn count_range(&self, dbi: Dbi, lo: Option<&[u8]>, hi: Option<&[u8]>) -> Result<u64> {
        let idx = self.check_dbi(dbi)?;
        let (rec, order) = self.tree(idx);
        if let (Some(lo), Some(hi)) = (lo, hi) {
            if order.key.compare(lo, hi) != Ordering::Less {
                return Ok(0);
            }
        }
        let pages = self.db().pages.read();
        let mut path = Path::new();
        let mut positioned = match lo {
            Some(lo) => seek_user_key(&pages, order, rec.root, lo, &mut path)?,
            None => nav::first(&pages, rec.root, &mut path)?,
        };
        let mut count = 0;
        while positioned {
            let Some(cell) = nav::current(&pages, &path)? else {
                break;
            };
            if hi.is_some_and(|hi| order.compare_user_keys(cell.key, hi).is_ge()) {
                break;
            }
            count += 1;
            positioned = nav::next(&pages, &mut path)?;
        }
        Ok(count)
    }

    /// Deletes entries with `lo <= key < hi` and returns how many went.
    pub fn del_range(&mut self, dbi: Dbi, lo: Option<&[u8]>, hi: Option<&[u8]>) -> Result<u64> {
        self.check_write()?;
        let idx = self.check_dbi(dbi)?;
        if let (Some(lo), Some(hi)) = (lo, hi) {
            if self.tree(idx).1.key.compare(lo, hi) != Ordering::Less {
                return Ok(0);
            }
        }
        let removed = self.mutate(dbi, |ctx, order, rec| {
            let mut removed = Vec::new();
            let mut path = Path::new();
            let mut positioned = match lo {
                Some(lo) => seek_user_key(ctx.pages, order, rec.root, lo, &mut path)?,
                None => nav::first(ctx.pages, rec.root, &mut path)?,
            };
            while positioned {
                let stored = match nav::current(ctx.pages, &path)? {
                    Some(cell) => cell.key.to_vec(),
                    None => break,
                };
                if hi.is_some_and(|hi| order.compare_user_keys(&stored, hi).is_ge()) {
                    break;
                }
                rec.root = tree::cow_path(ctx, &mut path)?;
                let emptied = tree::remove_at(ctx, rec, &path)?;
                positioned =
                    reposition_after_remove(ctx.pages, order, rec.root, &mut path, &stored, emptied)?;
                removed.push(order.user_key(&stored).to_vec());
            }
            Ok(removed)
        })?;
        for key in &removed {
            self.track(dbi, key);
        }
        Ok(removed.len() as u64)
    }

    /// Inserts entries already sorted by key (and by value for DUPSORT DBIs).
    ///
    /// Out-of-order input is `Invalid`; a repeated key on a plain DBI is
    /// `Exists`. Empty trees, and untouched overflow-free plain trees, are
    /// rebuilt bottom-up; anything else falls back to individual puts. The
    /// whole load runs in a nested transaction.
    pub fn load_sorted<K, V>(&mut self, dbi: Dbi, entries: &[(K, V)]) -> Result<()>
    where
        K: AsRef<[u8]>,
        V: AsRef<[u8]>,
    {
        self.check_write()?;
        let idx = self.check_dbi(dbi)?;
        let page_size = self.db().page_size();
        let order = self.tree(idx).1.clone();
        let mut needs_overflow = false;
        for (i, (k, v)) in entries.iter().enumerate() {
            let (k, v) = (k.as_ref(), v.as_ref());
            if k.len() > MAX_KV_LEN || v.len() > MAX_KV_LEN {
                return Err(SaplingError::Full("key or value exceeds 65535 bytes"));
            }
            if order.dupsort {
                check_key(&composite::encode(k, v)?, page_size)?;
            } else {
                check_key(k, page_size)?;
                needs_overflow |= !page::leaf_cell_fits(page_size, k.len(), v.len());
            }
            let Some((pk, pv)) = i.checked_sub(1).map(|p| &entries[p]) else {
                continue;
            };
            match order.key.compare(pk.as_ref(), k) {
                Ordering::Greater => {
                    return Err(SaplingError::Invalid("load_sorted input is out of order"))
                }
                Ordering::Equal if !order.dupsort => return Err(SaplingError::Exists),
                Ordering::Equal if order.value.compare(pv.as_ref(), v) == Ordering::Greater => {
                    return Err(SaplingError::Invalid("load_sorted duplicates are out of order"))
                }
                _ => {}
            }
        }
        if entries.is_empty() {
            return Ok(());
        }

        let root = self.tree(idx).0.root;
        if !root.is_valid() && !needs_overflow {
            debug!(dbi = %dbi, entries = entries.len(), "bulk load into empty tree");
            if !order.dupsort {
                return self.nested(|child| child.install_built(dbi, entries));
            }
            let mut stored: Vec<(Vec<u8>, &[u8])> = Vec::with_capacity(entries.len());
            for (k, v) in entries {
                let encoded = composite::encode(k.as_ref(), v.as_ref())?;
                if stored.last().is_some_and(|(prev, _)| *prev == encoded) {
                    continue;
                }
                stored.push((encoded, NO_VALUE));
            }
            return self.nested(|child| child.install_built(dbi, &stored));
        }

        let mergeable = !order.dupsort
            && !needs_overflow
            && self.is_untouched()
            && !tree_has_overflow(&self.db().pages.read(), root)?;
        if mergeable {
            let existing = self.collect_inline(idx)?;
            let merged = merge_sorted(&order.key, existing, entries);
            debug!(dbi = %dbi, entries = merged.len(), "bulk load rebuilding tree");
            return self.nested(|child| child.install_built(dbi, &merged));
        }

        self.nested(|child| {
            for (k, v) in entries {
                child.put(dbi, k.as_ref(), v.as_ref())?;
            }
            Ok(())
        })
    }

    /// Replaces the tree of `dbi` with one built from `entries`.
    fn install_built<K, V>(&mut self, dbi: Dbi, entries: &[(K, V)]) -> Result<()>
    where
        K: AsRef<[u8]>,
        V: AsRef<[u8]>,
    {
        let keys = self.mutate(dbi, |ctx, order, rec| {
            let built = build_tree(ctx, entries)?;
            retire_tree(ctx, rec.root)?;
            *rec = built;
            Ok(entries
                .iter()
                .map(|(k, _)| order.user_key(k.as_ref()).to_vec())
                .collect::<Vec<_>>())
        })?;
        for key in &keys {
            self.track(dbi, key);
        }
        Ok(())
    }

    fn collect_inline(&self, idx: usize) -> Result<Vec<(Vec<u8>, Vec<u8>)>> {
        let (rec, _) = self.tree(idx);
        let pages = self.db().pages.read();
        let mut out = Vec::with_capacity(rec.entries as usize);
        let mut path = Path::new();
        let mut positioned = nav::first(&pages, rec.root, &mut path)?;
        while positioned {
            let Some(cell) = nav::current(&pages, &path)? else {
                break;
            };
            match cell.value {
                CellValue::Inline(v) => out.push((cell.key.to_vec(), v.to_vec())),
                CellValue::Overflow { .. } => {
                    return Err(SaplingError::Corruption("overflow value in a tree marked inline"))
                }
            }
            positioned = nav::next(&pages, &mut path)?;
        }
        Ok(out)
    }
}

/// Merges two key-sorted runs; on equal keys the incoming entry wins.
fn merge_sorted<K, V>(
    cmp: &crate::storage::btree::Comparator,
    existing: Vec<(Vec<u8>, Vec<u8>)>,
    incoming: &[(K, V)],
) -> Vec<(Vec<u8>, Vec<u8>)>
where
    K: AsRef<[u8]>,
    V: AsRef<[u8]>,
{
    let mut out = Vec::with_capacity(existing.len() + incoming.len());
    let mut old = existing.into_iter().peekable();
    for (k, v) in incoming {
        let k = k.as_ref();
        while let Some((ok, _)) = old.peek() {
            match cmp.compare(ok, k) {
                Ordering::Less => out.extend(old.next()),
                Ordering::Equal => {
                    old.next();
                    break;
                }
                Ordering::Greater => break,
            }
        }
        out.push((k.to_vec(), v.as_ref().to_vec()));
    }
    out.extend(old);
    out
}
