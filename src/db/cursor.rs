use crate::primitives::pager::PageTable;
use crate::storage::btree::cmp::composite;
use crate::storage::btree::cursor as nav;
use crate::storage::btree::page::{self, MAX_KV_LEN};
use crate::storage::btree::tree::{self, Path};
use crate::storage::btree::TreeOrder;
use crate::types::{Dbi, PageNo, Result, SaplingError};

use super::flags::{TtlFlags, TxnMode};
use super::transaction::Txn;
use super::ttl::Liveness;

/// Positions on the first entry whose user key is `>= key`.
///
/// On DUPSORT trees that is the first duplicate of the least such key.
pub(crate) fn seek_user_key(
    pages: &PageTable,
    order: &TreeOrder,
    root: PageNo,
    key: &[u8],
    path: &mut Path,
) -> Result<bool> {
    if order.dupsort {
        nav::seek_by(pages, root, |s| order.compare_user_keys(s, key).is_lt(), path)
    } else {
        nav::seek(pages, order, root, key, path)
    }
}

/// Moves `path` onto the successor of the just-removed `stored` key.
///
/// An emptied leaf was unlinked, so the position is re-derived from the root.
pub(crate) fn reposition_after_remove(
    pages: &PageTable,
    order: &TreeOrder,
    root: PageNo,
    path: &mut Path,
    stored: &[u8],
    emptied: bool,
) -> Result<bool> {
    if emptied {
        return nav::seek(pages, order, root, stored, path);
    }
    let Some(f) = path.last() else {
        return Ok(false);
    };
    if f.idx < page::count(pages.page(f.page)?) {
        return Ok(true);
    }
    nav::next(pages, path)
}

fn dupsort_order<'s>(txn: &'s Txn<'_>, idx: usize) -> Result<&'s TreeOrder> {
    let (_, order) = txn.tree(idx);
    if order.dupsort {
        Ok(order)
    } else {
        Err(SaplingError::Invalid("duplicate navigation requires a DUPSORT DBI"))
    }
}

fn current_user_key(pages: &PageTable, order: &TreeOrder, path: &Path) -> Result<Vec<u8>> {
    match nav::current(pages, path)? {
        Some(cell) => Ok(order.user_key(cell.key).to_vec()),
        None => Err(SaplingError::NotFound),
    }
}

enum TxnRef<'t, 'a> {
    Shared(&'t Txn<'a>),
    Exclusive(&'t mut Txn<'a>),
}

impl<'a> TxnRef<'_, 'a> {
    fn get(&self) -> &Txn<'a> {
        match self {
            TxnRef::Shared(t) => *t,
            TxnRef::Exclusive(t) => &**t,
        }
    }
}

/// Ordered position inside one DBI of one transaction.
///
/// Every move returns `Ok(false)` and leaves the cursor unpositioned when it
/// runs off either end, except the `*_dup` moves, which stay put.
pub struct Cursor<'t, 'a> {
    txn: TxnRef<'t, 'a>,
    dbi: Dbi,
    idx: usize,
    path: Path,
}

impl std::fmt::Debug for Cursor<'_, '_> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Cursor")
            .field("dbi", &self.dbi)
            .field("depth", &self.path.len())
            .finish_non_exhaustive()
    }
}

impl<'a> Txn<'a> {
    /// Opens a read cursor over `dbi`.
    pub fn cursor(&self, dbi: Dbi) -> Result<Cursor<'_, 'a>> {
        let idx = self.check_dbi(dbi)?;
        Ok(Cursor {
            txn: TxnRef::Shared(self),
            dbi,
            idx,
            path: Path::new(),
        })
    }

    /// Opens a cursor that can also write through `put` and `del`.
    pub fn cursor_mut(&mut self, dbi: Dbi) -> Result<Cursor<'_, 'a>> {
        let idx = self.check_dbi(dbi)?;
        Ok(Cursor {
            txn: TxnRef::Exclusive(self),
            dbi,
            idx,
            path: Path::new(),
        })
    }
}

impl<'t, 'a> Cursor<'t, 'a> {
    /// DBI this cursor walks.
    pub fn dbi(&self) -> Dbi {
        self.dbi
    }

    /// Whether the cursor sits on an entry.
    pub fn is_positioned(&self) -> bool {
        !self.path.is_empty()
    }

    /// Rebinds the cursor to another transaction, unpositioned.
    pub fn renew(&mut self, txn: &'t Txn<'a>) -> Result<()> {
        self.idx = txn.check_dbi(self.dbi)?;
        self.txn = TxnRef::Shared(txn);
        self.path.clear();
        Ok(())
    }

    /// Moves to the smallest entry.
    pub fn first(&mut self) -> Result<bool> {
        let txn = self.txn.get();
        let (rec, _) = txn.tree(self.idx);
        nav::first(&txn.db().pages.read(), rec.root, &mut self.path)
    }

    /// Moves to the largest entry.
    pub fn last(&mut self) -> Result<bool> {
        let txn = self.txn.get();
        let (rec, _) = txn.tree(self.idx);
        nav::last(&txn.db().pages.read(), rec.root, &mut self.path)
    }

    /// Moves to the next entry.
    pub fn next(&mut self) -> Result<bool> {
        let txn = self.txn.get();
        nav::next(&txn.db().pages.read(), &mut self.path)
    }

    /// Moves to the previous entry.
    pub fn prev(&mut self) -> Result<bool> {
        let txn = self.txn.get();
        nav::prev(&txn.db().pages.read(), &mut self.path)
    }

    /// Moves to the least key `>= key`.
    pub fn seek(&mut self, key: &[u8]) -> Result<bool> {
        let txn = self.txn.get();
        let (rec, order) = txn.tree(self.idx);
        seek_user_key(&txn.db().pages.read(), order, rec.root, key, &mut self.path)
    }

    /// Moves to the first key starting with `prefix`.
    ///
    /// Leaves the cursor unpositioned when no such key exists.
    pub fn seek_prefix(&mut self, prefix: &[u8]) -> Result<bool> {
        if self.seek(prefix)? && self.in_prefix(prefix)? {
            return Ok(true);
        }
        self.path.clear();
        Ok(false)
    }

    /// Whether the current key starts with `prefix`.
    pub fn in_prefix(&self, prefix: &[u8]) -> Result<bool> {
        let txn = self.txn.get();
        let (_, order) = txn.tree(self.idx);
        let pages = txn.db().pages.read();
        Ok(nav::current(&pages, &self.path)?
            .is_some_and(|cell| order.user_key(cell.key).starts_with(prefix)))
    }

    /// Key under the cursor.
    pub fn key(&self) -> Result<Option<Vec<u8>>> {
        let txn = self.txn.get();
        let (_, order) = txn.tree(self.idx);
        let pages = txn.db().pages.read();
        Ok(nav::current(&pages, &self.path)?.map(|cell| order.user_key(cell.key).to_vec()))
    }

    /// Key and value under the cursor.
    pub fn get(&self) -> Result<Option<(Vec<u8>, Vec<u8>)>> {
        let txn = self.txn.get();
        let (_, order) = txn.tree(self.idx);
        let pages = txn.db().pages.read();
        let Some(cell) = nav::current(&pages, &self.path)? else {
            return Ok(None);
        };
        if order.dupsort {
            let (k, v) = composite::split(cell.key);
            return Ok(Some((k.to_vec(), v.to_vec())));
        }
        let value = tree::cell_value(&pages, cell.value)?;
        Ok(Some((cell.key.to_vec(), value)))
    }

    /// Replaces the value of the entry under the cursor, keeping the position.
    ///
    /// An unpositioned cursor yields `NotFound`; DUPSORT DBIs are rejected
    /// because their values are part of the ordering.
    pub fn put(&mut self, value: &[u8]) -> Result<()> {
        if !self.is_positioned() {
            return Err(SaplingError::NotFound);
        }
        let dbi = self.dbi;
        let idx = self.idx;
        let txn = match &mut self.txn {
            TxnRef::Exclusive(t) => &mut **t,
            TxnRef::Shared(_) => return Err(SaplingError::ReadOnly),
        };
        if value.len() > MAX_KV_LEN {
            return Err(SaplingError::Full("value exceeds 65535 bytes"));
        }
        if txn.is_dupsort(idx) {
            return Err(SaplingError::Invalid("cursor put is not supported on DUPSORT DBIs"));
        }
        let key = {
            let pages = txn.db().pages.read();
            match nav::current(&pages, &self.path)? {
                Some(cell) => cell.key.to_vec(),
                None => return Err(SaplingError::NotFound),
            }
        };
        if txn.replace_at_path(dbi, &mut self.path, value)? {
            txn.track(dbi, &key);
            return Ok(());
        }
        txn.put(dbi, &key, value)?;
        let (rec, order) = txn.tree(idx);
        nav::seek(&txn.db().pages.read(), order, rec.root, &key, &mut self.path)?;
        Ok(())
    }

    /// Value under the cursor while its key is tracked in `ttl` and live at `now_ms`.
    ///
    /// Expired and untracked entries read as `None`. With
    /// [`TtlFlags::LAZY_DELETE`] on a write transaction an expired entry is
    /// removed together with its metadata rows, and the cursor moves onto the
    /// successor.
    pub fn get_ttl(&mut self, ttl: Dbi, now_ms: u64, flags: TtlFlags) -> Result<Option<Vec<u8>>> {
        let data = self.dbi;
        self.txn.get().check_ttl_dbis(data, ttl)?;
        let Some(key) = self.key()? else {
            return Err(SaplingError::NotFound);
        };
        let expiry = match self.txn.get().liveness(ttl, &key, now_ms)? {
            Liveness::Untracked => return Ok(None),
            Liveness::Live => return Ok(self.get()?.map(|(_, value)| value)),
            Liveness::Expired(expiry) => expiry,
        };
        if !flags.contains(TtlFlags::LAZY_DELETE) {
            return Ok(None);
        }
        if let TxnRef::Exclusive(txn) = &mut self.txn {
            if txn.mode() == TxnMode::ReadWrite {
                txn.nested(|child| child.remove_tracked(data, ttl, &key, expiry))?;
                self.seek(&key)?;
            }
        }
        Ok(None)
    }

    /// Deletes the entry under the cursor and moves onto its successor.
    pub fn del(&mut self) -> Result<()> {
        let dbi = self.dbi;
        let idx = self.idx;
        let txn = match &mut self.txn {
            TxnRef::Exclusive(t) => &mut **t,
            TxnRef::Shared(_) => return Err(SaplingError::ReadOnly),
        };
        let stored = {
            let pages = txn.db().pages.read();
            match nav::current(&pages, &self.path)? {
                Some(cell) => cell.key.to_vec(),
                None => return Err(SaplingError::NotFound),
            }
        };
        let emptied = txn.remove_at_path(dbi, &mut self.path)?;
        let (rec, order) = txn.tree(idx);
        let user = order.user_key(&stored).to_vec();
        reposition_after_remove(
            &txn.db().pages.read(),
            order,
            rec.root,
            &mut self.path,
            &stored,
            emptied,
        )?;
        txn.track(dbi, &user);
        Ok(())
    }

    fn step_dup(&mut self, forward: bool) -> Result<bool> {
        let txn = self.txn.get();
        let order = dupsort_order(txn, self.idx)?;
        let pages = txn.db().pages.read();
        let key = current_user_key(&pages, order, &self.path)?;
        let saved = self.path.clone();
        let moved = if forward {
            nav::next(&pages, &mut self.path)?
        } else {
            nav::prev(&pages, &mut self.path)?
        };
        if moved {
            if let Some(cell) = nav::current(&pages, &self.path)? {
                if order.compare_user_keys(cell.key, &key).is_eq() {
                    return Ok(true);
                }
            }
        }
        self.path = saved;
        Ok(false)
    }

    /// Moves to the next duplicate of the current key; stays put if none.
    pub fn next_dup(&mut self) -> Result<bool> {
        self.step_dup(true)
    }

    /// Moves to the previous duplicate of the current key; stays put if none.
    pub fn prev_dup(&mut self) -> Result<bool> {
        self.step_dup(false)
    }

    /// Moves to the first duplicate of the current key.
    pub fn first_dup(&mut self) -> Result<bool> {
        let txn = self.txn.get();
        let order = dupsort_order(txn, self.idx)?;
        let (rec, _) = txn.tree(self.idx);
        let pages = txn.db().pages.read();
        let key = current_user_key(&pages, order, &self.path)?;
        nav::seek_by(
            &pages,
            rec.root,
            |s| order.compare_user_keys(s, &key).is_lt(),
            &mut self.path,
        )
    }

    /// Moves to the last duplicate of the current key.
    pub fn last_dup(&mut self) -> Result<bool> {
        let txn = self.txn.get();
        let order = dupsort_order(txn, self.idx)?;
        let (rec, _) = txn.tree(self.idx);
        let pages = txn.db().pages.read();
        let key = current_user_key(&pages, order, &self.path)?;
        let past = nav::seek_by(
            &pages,
            rec.root,
            |s| order.compare_user_keys(s, &key).is_le(),
            &mut self.path,
        )?;
        if past {
            nav::prev(&pages, &mut self.path)
        } else {
            nav::last(&pages, rec.root, &mut self.path)
        }
    }

    /// Number of duplicates of the current key; the position is kept.
    pub fn count_dup(&mut self) -> Result<u64> {
        let saved = self.path.clone();
        let counted = self.count_dup_from_first();
        self.path = saved;
        counted
    }

    fn count_dup_from_first(&mut self) -> Result<u64> {
        if !self.first_dup()? {
            return Ok(0);
        }
        let mut n = 1;
        while self.next_dup()? {
            n += 1;
        }
        Ok(n)
    }
}
