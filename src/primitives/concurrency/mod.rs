#![forbid(unsafe_code)]
//! Bookkeeping for the single-writer, many-reader model.
//!
//! Nothing here blocks: contention is reported to callers as `Busy` by the
//! database layer, which owns the mutexes wrapping these structures.

use crate::types::TxnId;

/// Multiset of txnids observed by the read transactions currently open.
#[derive(Default, Debug)]
pub struct ReaderRegistry {
    active: Vec<TxnId>,
}

impl ReaderRegistry {
    /// Records a reader pinned at `txnid`.
    pub fn register(&mut self, txnid: TxnId) {
        self.active.push(txnid);
    }

    /// Drops one reader pinned at `txnid`. Returns `false` if none was registered.
    pub fn release(&mut self, txnid: TxnId) -> bool {
        match self.active.iter().position(|&t| t == txnid) {
            Some(pos) => {
                self.active.swap_remove(pos);
                true
            }
            None => false,
        }
    }

    /// Number of open readers.
    pub fn len(&self) -> usize {
        self.active.len()
    }

    /// Returns `true` when no reader is open.
    pub fn is_empty(&self) -> bool {
        self.active.is_empty()
    }

    /// Oldest snapshot still pinned, if any.
    pub fn oldest(&self) -> Option<TxnId> {
        self.active.iter().copied().min()
    }

    /// Whether a page vacated by the commit of `freed_at` can be recycled.
    ///
    /// A reader pinned at `t` still sees every page freed by a commit `>= t`.
    pub fn can_recycle(&self, freed_at: TxnId) -> bool {
        match self.oldest() {
            None => true,
            Some(min) => freed_at < min,
        }
    }
}

/// Snapshot of lock state for observability.
#[derive(Default, Debug, Clone, Copy, PartialEq, Eq)]
pub struct LockSnapshot {
    /// Number of active readers.
    pub readers: usize,
    /// Whether a write transaction is open.
    pub writer: bool,
}

impl LockSnapshot {
    /// Returns `true` when any transaction is open.
    pub fn any_active(&self) -> bool {
        self.writer || self.readers > 0
    }
}
