use std::sync::Arc;

use tracing::{trace, warn};

use super::database::Db;
use crate::types::{Dbi, Result, SaplingError};

/// Commit hook: receives the changed key and its committed value, `None` once deleted.
pub type WatchCallback = Arc<dyn Fn(&[u8], Option<&[u8]>) + Send + Sync>;

/// A registered prefix watch.
#[derive(Clone)]
pub(crate) struct Watch {
    pub dbi: Dbi,
    prefix: Vec<u8>,
    callback: WatchCallback,
}

impl Watch {
    fn same(&self, dbi: Dbi, prefix: &[u8], callback: &WatchCallback) -> bool {
        self.dbi == dbi && self.prefix == prefix && same_callback(&self.callback, callback)
    }

    fn matches(&self, dbi: Dbi, key: &[u8]) -> bool {
        self.dbi == dbi && key.starts_with(&self.prefix)
    }
}

impl std::fmt::Debug for Watch {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Watch")
            .field("dbi", &self.dbi)
            .field("prefix", &self.prefix)
            .finish_non_exhaustive()
    }
}

fn same_callback(a: &WatchCallback, b: &WatchCallback) -> bool {
    std::ptr::eq(Arc::as_ptr(a) as *const (), Arc::as_ptr(b) as *const ())
}

impl Db {
    /// Calls `callback` after every commit that changes a key of `dbi` starting with `prefix`.
    ///
    /// Registration is refused while a write transaction is open.
    pub fn watch(&self, dbi: Dbi, prefix: &[u8], callback: WatchCallback) -> Result<()> {
        let mut state = self.state.lock();
        if state.write_active {
            return Err(SaplingError::Busy("a write transaction is active"));
        }
        match state.dbis.get(dbi.index()) {
            None => return Err(SaplingError::Invalid("unknown DBI")),
            Some(slot) if slot.order.dupsort => {
                return Err(SaplingError::Invalid("watches are not supported on DUPSORT DBIs"))
            }
            Some(_) => {}
        }
        if state.watches.iter().any(|w| w.same(dbi, prefix, &callback)) {
            return Err(SaplingError::Exists);
        }
        state.watches.push(Watch {
            dbi,
            prefix: prefix.to_vec(),
            callback,
        });
        trace!(dbi = %dbi, prefix_len = prefix.len(), "watch registered");
        Ok(())
    }

    /// Removes a registration made with the same DBI, prefix and callback.
    pub fn unwatch(&self, dbi: Dbi, prefix: &[u8], callback: &WatchCallback) -> Result<()> {
        let mut state = self.state.lock();
        if state.write_active {
            return Err(SaplingError::Busy("a write transaction is active"));
        }
        let pos = state
            .watches
            .iter()
            .position(|w| w.same(dbi, prefix, callback))
            .ok_or(SaplingError::NotFound)?;
        state.watches.remove(pos);
        Ok(())
    }
}

/// Delivers committed changes to matching watches from a fresh snapshot.
///
/// Runs without any database lock held, so callbacks may start transactions.
pub(crate) fn notify(db: &Db, watches: &[Watch], changes: &[(Dbi, Vec<u8>)]) {
    let txn = match db.begin_read() {
        Ok(txn) => txn,
        Err(err) => {
            warn!(%err, "watch notification skipped");
            return;
        }
    };
    for (dbi, key) in changes {
        let mut value: Option<Option<Vec<u8>>> = None;
        for w in watches.iter().filter(|w| w.matches(*dbi, key)) {
            let current = value.get_or_insert_with(|| {
                txn.get(*dbi, key).unwrap_or_else(|err| {
                    warn!(%err, dbi = %dbi, "watch value lookup failed");
                    None
                })
            });
            (w.callback)(key, current.as_deref());
        }
    }
    if let Err(err) = txn.commit() {
        warn!(%err, "watch snapshot did not close cleanly");
    }
}
