use parking_lot::{MappedRwLockWriteGuard, RwLockWriteGuard};
use rustc_hash::FxHashSet;
use tracing::{debug, error, trace};

use super::database::{Db, WriterState};
use super::flags::{PutFlags, TxnMode};
use super::stat::Stat;
use super::watch;
use crate::primitives::pager::{write_meta, DbiRecord, FreeList, Meta, PageTable};
use crate::storage::btree::cmp::composite;
use crate::storage::btree::cursor as nav;
use crate::storage::btree::page::{self, NewValue, MAX_KV_LEN};
use crate::storage::btree::tree::{self, Path};
use crate::storage::btree::{verify_tree, TreeOrder, TreeReport};
use crate::storage::cow::{CowContext, PageSet};
use crate::types::{Dbi, PageNo, Result, SaplingError, TxnId};

/// Writable view over a value reserved by [`Txn::put_reserve`].
pub type ReservedValue<'t> = MappedRwLockWriteGuard<'t, [u8]>;

/// Keys changed by a write transaction, in first-touch order.
#[derive(Default, Debug)]
pub(crate) struct ChangeLog {
    entries: Vec<(Dbi, Vec<u8>)>,
    seen: FxHashSet<(Dbi, Vec<u8>)>,
}

impl ChangeLog {
    fn record(&mut self, dbi: Dbi, key: &[u8]) {
        if self.seen.insert((dbi, key.to_vec())) {
            self.entries.push((dbi, key.to_vec()));
        }
    }

    fn absorb(&mut self, other: ChangeLog) {
        for (dbi, key) in other.entries {
            self.record(dbi, &key);
        }
    }

    fn take(&mut self) -> Vec<(Dbi, Vec<u8>)> {
        self.seen.clear();
        std::mem::take(&mut self.entries)
    }
}

/// Per-transaction view: DBI roots, page bookkeeping and pending changes.
#[derive(Debug)]
pub(crate) struct TxnState {
    pub(crate) mode: TxnMode,
    /// Last committed txnid visible to this transaction.
    pub(crate) txnid: TxnId,
    pub(crate) trees: Vec<DbiRecord>,
    pub(crate) orders: Vec<TreeOrder>,
    pub(crate) pages: PageSet,
    /// Page count when this transaction began; pages at or above it are its own.
    pub(crate) base_num_pages: u32,
    changes: ChangeLog,
    track_changes: bool,
    poisoned: bool,
}

impl TxnState {
    pub(crate) fn snapshot(state: &WriterState, mode: TxnMode, track_changes: bool) -> Self {
        Self {
            mode,
            txnid: state.txnid,
            trees: state.dbis.iter().map(|d| d.record).collect(),
            orders: state.dbis.iter().map(|d| d.order.clone()).collect(),
            pages: PageSet::new(state.free, state.num_pages),
            base_num_pages: state.num_pages,
            changes: ChangeLog::default(),
            track_changes,
            poisoned: false,
        }
    }

    fn child(&self) -> Self {
        Self {
            mode: self.mode,
            txnid: self.txnid,
            trees: self.trees.clone(),
            orders: self.orders.clone(),
            pages: PageSet::new(self.pages.free, self.pages.num_pages),
            base_num_pages: self.pages.num_pages,
            changes: ChangeLog::default(),
            track_changes: self.track_changes,
            poisoned: false,
        }
    }
}

/// Returns every page a rolled-back transaction holds.
///
/// Pages past `base` go back to the allocator; the rest (free-list pops and
/// the untouched remainder of the chain) are rebuilt into a fresh chain.
fn reclaim(pages: &mut PageTable, set: &PageSet, base: u32) -> Result<(FreeList, usize)> {
    let mut held = set.free.collect(pages)?;
    held.extend(set.new_pages.iter().copied());
    held.sort_unstable();
    held.dedup();
    let mut fresh = FreeList::empty();
    let mut released = 0;
    for &pgno in held.iter().rev() {
        if pgno.0 >= base {
            pages.release(pgno);
            released += 1;
        } else {
            fresh.push(pages, pgno)?;
        }
    }
    Ok((fresh, released))
}

/// A read-only snapshot or the single writer, optionally nested under a parent.
///
/// Dropping an unfinished transaction aborts it.
pub struct Txn<'a> {
    db: &'a Db,
    parent: Option<&'a mut TxnState>,
    state: TxnState,
    done: bool,
}

impl std::fmt::Debug for Txn<'_> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Txn")
            .field("mode", &self.state.mode)
            .field("txnid", &self.state.txnid)
            .field("nested", &self.parent.is_some())
            .finish_non_exhaustive()
    }
}

impl<'a> Txn<'a> {
    pub(crate) fn top_level(db: &'a Db, state: TxnState) -> Self {
        trace!(mode = ?state.mode, txnid = state.txnid, "transaction started");
        Self {
            db,
            parent: None,
            state,
            done: false,
        }
    }

    /// Access mode.
    pub fn mode(&self) -> TxnMode {
        self.state.mode
    }

    /// Whether this transaction runs under a parent.
    pub fn is_nested(&self) -> bool {
        self.parent.is_some()
    }

    /// Txnid of the committed state this transaction started from.
    pub fn snapshot_txnid(&self) -> TxnId {
        self.state.txnid
    }

    pub(crate) fn db(&self) -> &'a Db {
        self.db
    }

    /// Starts a child that sees this transaction's uncommitted writes.
    ///
    /// The child of a read-only transaction is read-only.
    pub fn begin_nested(&mut self) -> Result<Txn<'_>> {
        if self.state.poisoned {
            return Err(SaplingError::Invalid("transaction poisoned by an earlier failure"));
        }
        let state = self.state.child();
        Ok(Txn {
            db: self.db,
            parent: Some(&mut self.state),
            state,
            done: false,
        })
    }

    /// Publishes the transaction.
    ///
    /// A nested commit folds into the parent; a top-level commit writes a new
    /// meta slot and then notifies watchers from a fresh snapshot.
    pub fn commit(mut self) -> Result<()> {
        self.done = true;
        if self.state.mode == TxnMode::ReadOnly {
            return self.end_read();
        }
        if self.state.poisoned {
            self.rollback()?;
            return Err(SaplingError::Invalid("transaction poisoned by an earlier failure"));
        }
        if self.parent.is_some() {
            self.commit_nested()
        } else {
            self.commit_top()
        }
    }

    /// Discards the transaction and every page it allocated.
    pub fn abort(mut self) {
        self.done = true;
        if let Err(err) = self.finish_abort() {
            error!(%err, "abort failed to reclaim pages");
        }
    }

    fn finish_abort(&mut self) -> Result<()> {
        match self.state.mode {
            TxnMode::ReadOnly => self.end_read(),
            TxnMode::ReadWrite => self.rollback(),
        }
    }

    fn end_read(&mut self) -> Result<()> {
        if self.parent.is_some() {
            return Ok(());
        }
        self.db.end_reader(self.state.txnid)
    }

    fn rollback(&mut self) -> Result<()> {
        let base = self.state.base_num_pages;
        let db = self.db;
        match self.parent.as_deref_mut() {
            Some(parent) => {
                let mut pages = db.pages.write();
                match reclaim(&mut pages, &self.state.pages, base) {
                    Ok((free, released)) => {
                        parent.pages.free = free;
                        trace!(released, "nested transaction aborted");
                        Ok(())
                    }
                    Err(err) => {
                        parent.pages.free = FreeList::empty();
                        parent.poisoned = true;
                        Err(err)
                    }
                }
            }
            None => {
                let mut state = db.state.lock();
                let mut pages = db.pages.write();
                state.write_active = false;
                match reclaim(&mut pages, &self.state.pages, base) {
                    Ok((free, released)) => {
                        state.free = free;
                        debug!(
                            txnid = self.state.txnid,
                            released,
                            new_pages = self.state.pages.new_pages.len(),
                            "write transaction aborted"
                        );
                        Ok(())
                    }
                    Err(err) => {
                        state.free = FreeList::empty();
                        Err(err)
                    }
                }
            }
        }
    }

    fn commit_nested(&mut self) -> Result<()> {
        let db = self.db;
        let Some(parent) = self.parent.as_deref_mut() else {
            return Err(SaplingError::Invalid("not a nested transaction"));
        };
        let child = &mut self.state;
        let mut pages = db.pages.write();
        parent.trees = std::mem::take(&mut child.trees);
        parent.pages.free = child.pages.free;
        parent.pages.num_pages = child.pages.num_pages;
        parent.pages.new_pages.extend(child.pages.new_pages.drain());
        for pgno in child.pages.old_pages.drain(..) {
            if parent.pages.new_pages.remove(&pgno) {
                if let Err(err) = parent.pages.free.push(&mut pages, pgno) {
                    parent.poisoned = true;
                    return Err(err);
                }
            } else {
                parent.pages.old_pages.push(pgno);
            }
        }
        parent.changes.absorb(std::mem::take(&mut child.changes));
        trace!(num_pages = parent.pages.num_pages, "nested transaction committed");
        Ok(())
    }

    fn commit_top(&mut self) -> Result<()> {
        let db = self.db;
        let mut state = db.state.lock();
        let freed_at = state.txnid;
        let meta = Meta {
            txnid: freed_at + 1,
            free_head: self.state.pages.free.head(),
            num_pages: self.state.pages.num_pages,
            dbis: self.state.trees.clone(),
        };
        let written = {
            let mut pages = db.pages.write();
            pages
                .meta_slots_mut()
                .and_then(|(s0, s1)| write_meta(s0, s1, &meta))
        };
        if let Err(err) = written {
            drop(state);
            if let Err(undo) = self.rollback() {
                error!(%undo, "rollback after failed meta write");
            }
            return Err(err);
        }

        let set = &self.state.pages;
        state
            .deferred
            .extend(set.old_pages.iter().map(|&pgno| (freed_at, pgno)));
        state.txnid = meta.txnid;
        state.free = set.free;
        state.num_pages = set.num_pages;
        for (slot, rec) in state.dbis.iter_mut().zip(&self.state.trees) {
            slot.record = *rec;
        }
        state.write_active = false;
        let changes = self.state.changes.take();
        let watches = if changes.is_empty() {
            Vec::new()
        } else {
            state.watches.clone()
        };
        debug!(
            txnid = meta.txnid,
            new_pages = self.state.pages.new_pages.len(),
            old_pages = self.state.pages.old_pages.len(),
            num_pages = meta.num_pages,
            "write transaction committed"
        );
        drop(state);
        if !watches.is_empty() {
            watch::notify(db, &watches, &changes);
        }
        Ok(())
    }

    pub(crate) fn check_dbi(&self, dbi: Dbi) -> Result<usize> {
        let idx = dbi.index();
        if idx < self.state.trees.len() {
            Ok(idx)
        } else {
            Err(SaplingError::Invalid("unknown DBI"))
        }
    }

    pub(crate) fn check_write(&self) -> Result<()> {
        if self.state.mode == TxnMode::ReadOnly {
            return Err(SaplingError::ReadOnly);
        }
        if self.state.poisoned {
            return Err(SaplingError::Invalid("transaction poisoned by an earlier failure"));
        }
        Ok(())
    }

    pub(crate) fn tree(&self, idx: usize) -> (&DbiRecord, &TreeOrder) {
        (&self.state.trees[idx], &self.state.orders[idx])
    }

    pub(crate) fn is_dupsort(&self, idx: usize) -> bool {
        self.state.orders[idx].dupsort
    }

    /// Whether nothing has been allocated or replaced yet.
    pub(crate) fn is_untouched(&self) -> bool {
        self.state.pages.is_clean()
    }

    pub(crate) fn track(&mut self, dbi: Dbi, key: &[u8]) {
        if self.state.track_changes {
            self.state.changes.record(dbi, key);
        }
    }

    fn note<T>(&mut self, result: Result<T>) -> Result<T> {
        if let Err(err) = &result {
            if err.requires_abort() {
                error!(%err, "write transaction poisoned");
                self.state.poisoned = true;
            }
        }
        result
    }

    /// Runs `f` against the tree of `dbi` with copy-on-write access to pages.
    pub(crate) fn mutate<R, F>(&mut self, dbi: Dbi, f: F) -> Result<R>
    where
        F: FnOnce(&mut CowContext<'_>, &TreeOrder, &mut DbiRecord) -> Result<R>,
    {
        self.check_write()?;
        let idx = self.check_dbi(dbi)?;
        let db = self.db;
        let result = {
            let mut pages = db.pages.write();
            let state = &mut self.state;
            let mut ctx = CowContext::new(&mut pages, &mut state.pages);
            f(&mut ctx, &state.orders[idx], &mut state.trees[idx])
        };
        self.note(result)
    }

    /// Runs `f` in a nested transaction, committing on success.
    pub(crate) fn nested<R, F>(&mut self, f: F) -> Result<R>
    where
        F: FnOnce(&mut Txn<'_>) -> Result<R>,
    {
        let mut child = self.begin_nested()?;
        match f(&mut child) {
            Ok(value) => {
                child.commit()?;
                Ok(value)
            }
            Err(err) => {
                child.abort();
                Err(err)
            }
        }
    }

    /// Value stored under `key`; for DUPSORT DBIs, the first duplicate.
    pub fn get(&self, dbi: Dbi, key: &[u8]) -> Result<Option<Vec<u8>>> {
        let idx = self.check_dbi(dbi)?;
        let (rec, order) = self.tree(idx);
        let pages = self.db.pages.read();
        if !order.dupsort {
            return tree::lookup(&pages, order, rec.root, key);
        }
        let mut path = Path::new();
        let below = |stored: &[u8]| order.compare_user_keys(stored, key).is_lt();
        if !nav::seek_by(&pages, rec.root, below, &mut path)? {
            return Ok(None);
        }
        match nav::current(&pages, &path)? {
            Some(cell) if order.compare_user_keys(cell.key, key).is_eq() => {
                Ok(Some(composite::split(cell.key).1.to_vec()))
            }
            _ => Ok(None),
        }
    }

    /// Inserts or replaces `key`.
    pub fn put(&mut self, dbi: Dbi, key: &[u8], value: &[u8]) -> Result<()> {
        self.put_with(dbi, key, value, PutFlags::NONE)
    }

    /// Inserts `key` with modifiers.
    ///
    /// On DUPSORT DBIs the pair is added to the key's duplicates; storing an
    /// exact pair that already exists succeeds without change, with or without
    /// `NO_OVERWRITE`.
    pub fn put_with(&mut self, dbi: Dbi, key: &[u8], value: &[u8], flags: PutFlags) -> Result<()> {
        self.check_write()?;
        let idx = self.check_dbi(dbi)?;
        let page_size = self.db.page_size();
        if self.is_dupsort(idx) {
            let stored = composite::encode(key, value)?;
            check_key(&stored, page_size)?;
            let inserted = self.mutate(dbi, |ctx, order, rec| {
                match tree::insert(ctx, order, rec, &stored, NewValue::Inline(&[]), true) {
                    Ok(_) => Ok(true),
                    Err(SaplingError::Exists) => Ok(false),
                    Err(err) => Err(err),
                }
            })?;
            if inserted {
                self.track(dbi, key);
            }
            return Ok(());
        }
        check_key(key, page_size)?;
        if value.len() > MAX_KV_LEN {
            return Err(SaplingError::Full("value exceeds 65535 bytes"));
        }
        let no_overwrite = flags.contains(PutFlags::NO_OVERWRITE);
        self.mutate(dbi, |ctx, order, rec| {
            if page::leaf_cell_fits(ctx.page_size(), key.len(), value.len()) {
                return tree::insert(ctx, order, rec, key, NewValue::Inline(value), no_overwrite)
                    .map(drop);
            }
            if no_overwrite && tree::contains(ctx.pages, order, rec.root, key)? {
                return Err(SaplingError::Exists);
            }
            let head = ctx.write_overflow(value)?;
            let spilled = NewValue::Overflow {
                len: value.len() as u32,
                head,
            };
            match tree::insert(ctx, order, rec, key, spilled, no_overwrite) {
                Ok(_) => Ok(()),
                Err(err) => {
                    ctx.release_chain(head)?;
                    Err(err)
                }
            }
        })?;
        self.track(dbi, key);
        Ok(())
    }

    /// Inserts `key` with `len` zeroed value bytes and returns them for writing.
    ///
    /// The value must fit inline; DUPSORT DBIs are rejected.
    pub fn put_reserve(&mut self, dbi: Dbi, key: &[u8], len: usize) -> Result<ReservedValue<'_>> {
        self.check_write()?;
        let idx = self.check_dbi(dbi)?;
        if self.is_dupsort(idx) {
            return Err(SaplingError::Invalid("reserve is not supported on DUPSORT DBIs"));
        }
        let db = self.db;
        check_key(key, db.page_size())?;
        if len > MAX_KV_LEN || !page::leaf_cell_fits(db.page_size(), key.len(), len) {
            return Err(SaplingError::Invalid("reserved value must fit inline"));
        }
        let mut pages = db.pages.write();
        let placed = {
            let state = &mut self.state;
            let mut ctx = CowContext::new(&mut pages, &mut state.pages);
            tree::insert(
                &mut ctx,
                &state.orders[idx],
                &mut state.trees[idx],
                key,
                NewValue::Reserved(len),
                false,
            )
        };
        let placement = self.note(placed)?;
        self.track(dbi, key);
        Ok(RwLockWriteGuard::map(pages, move |table| {
            &mut table.slot_mut(placement.page)[placement.range]
        }))
    }

    /// Removes `key`; on DUPSORT DBIs every duplicate goes.
    pub fn del(&mut self, dbi: Dbi, key: &[u8]) -> Result<()> {
        self.check_write()?;
        let idx = self.check_dbi(dbi)?;
        if !self.is_dupsort(idx) {
            self.mutate(dbi, |ctx, order, rec| tree::remove(ctx, order, rec, key))?;
            self.track(dbi, key);
            return Ok(());
        }
        let removed = self.mutate(dbi, |ctx, order, rec| {
            let mut removed = 0u64;
            loop {
                let mut path = Path::new();
                let below = |stored: &[u8]| order.compare_user_keys(stored, key).is_lt();
                if !nav::seek_by(ctx.pages, rec.root, below, &mut path)? {
                    break;
                }
                let same = matches!(
                    nav::current(ctx.pages, &path)?,
                    Some(cell) if order.compare_user_keys(cell.key, key).is_eq()
                );
                if !same {
                    break;
                }
                rec.root = tree::cow_path(ctx, &mut path)?;
                tree::remove_at(ctx, rec, &path)?;
                removed += 1;
            }
            Ok(removed)
        })?;
        if removed == 0 {
            return Err(SaplingError::NotFound);
        }
        self.track(dbi, key);
        Ok(())
    }

    /// Removes one exact `(key, value)` pair from a DUPSORT DBI.
    pub fn del_dup(&mut self, dbi: Dbi, key: &[u8], value: &[u8]) -> Result<()> {
        self.check_write()?;
        let idx = self.check_dbi(dbi)?;
        if !self.is_dupsort(idx) {
            return Err(SaplingError::Invalid("del_dup requires a DUPSORT DBI"));
        }
        let stored = composite::encode(key, value)?;
        self.mutate(dbi, |ctx, order, rec| tree::remove(ctx, order, rec, &stored))?;
        self.track(dbi, key);
        Ok(())
    }

    /// Deletes the entry addressed by `path`, copying the path first.
    /// Returns `true` when the leaf emptied and was unlinked.
    pub(crate) fn remove_at_path(&mut self, dbi: Dbi, path: &mut Path) -> Result<bool> {
        self.mutate(dbi, |ctx, _, rec| {
            rec.root = tree::cow_path(ctx, path)?;
            tree::remove_at(ctx, rec, path)
        })
    }

    pub(crate) fn replace_at_path(&mut self, dbi: Dbi, path: &mut Path, value: &[u8]) -> Result<bool> {
        self.mutate(dbi, |ctx, _, rec| tree::replace_at(ctx, rec, path, value))
    }

    /// Statistics of DBI 0 as seen by this transaction.
    pub fn stat(&self) -> Result<Stat> {
        self.dbi_stat(Dbi::MAIN)
    }

    /// Statistics of `dbi` as seen by this transaction.
    pub fn dbi_stat(&self, dbi: Dbi) -> Result<Stat> {
        let idx = self.check_dbi(dbi)?;
        let rec = self.state.trees[idx];
        let has_write_txn = self.db.state.lock().write_active;
        let depth = tree::depth(&self.db.pages.read(), rec.root)?;
        Ok(Stat {
            entries: rec.entries,
            txnid: self.state.txnid,
            depth,
            num_pages: self.state.pages.num_pages,
            page_size: self.db.page_size() as u32,
            has_write_txn,
        })
    }

    /// Checks the structure of `dbi`'s tree.
    pub fn verify(&self, dbi: Dbi) -> Result<TreeReport> {
        let idx = self.check_dbi(dbi)?;
        let (rec, order) = self.tree(idx);
        verify_tree(&self.db.pages.read(), order, rec)
    }

    /// Root page of `dbi` in this transaction's view.
    pub fn root(&self, dbi: Dbi) -> Result<PageNo> {
        let idx = self.check_dbi(dbi)?;
        Ok(self.state.trees[idx].root)
    }
}

impl Drop for Txn<'_> {
    fn drop(&mut self) {
        if self.done {
            return;
        }
        self.done = true;
        if let Err(err) = self.finish_abort() {
            error!(%err, "dropped transaction failed to release its pages");
        }
    }
}

/// Rejects keys (or DUPSORT composites) too long to guarantee two-way splits.
pub(crate) fn check_key(stored: &[u8], page_size: usize) -> Result<()> {
    if stored.len() > tree::max_key_len(page_size) {
        return Err(SaplingError::Full("key exceeds the maximum key size for this page size"));
    }
    Ok(())
}
