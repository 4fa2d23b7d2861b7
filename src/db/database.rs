use std::sync::Arc;

use parking_lot::{Mutex, RwLock};
use tracing::{debug, info};

use super::config::DbOptions;
use super::flags::{DbiFlags, TxnMode};
use super::stat::Stat;
use super::transaction::{Txn, TxnState};
use super::watch::Watch;
use crate::primitives::concurrency::{LockSnapshot, ReaderRegistry};
use crate::primitives::pager::{
    init_meta, DbiRecord, FreeList, HeapAllocator, Meta, PageAllocator, PageTable, META_SLOTS,
};
use crate::storage::btree::{tree, Comparator, TreeOrder};
use crate::types::{Dbi, PageNo, Result, SaplingError, TxnId};

/// Committed state of one sub-database plus its ordering policy.
#[derive(Clone, Debug)]
pub(crate) struct DbiSlot {
    pub record: DbiRecord,
    pub order: TreeOrder,
}

/// Everything guarded by the writer mutex.
pub(crate) struct WriterState {
    pub txnid: TxnId,
    pub free: FreeList,
    pub num_pages: u32,
    pub dbis: Vec<DbiSlot>,
    pub write_active: bool,
    /// Pages vacated by committed writers, tagged with the txnid they were freed at.
    pub deferred: Vec<(TxnId, PageNo)>,
    pub watches: Vec<Watch>,
}

impl WriterState {
    pub(crate) fn meta(&self) -> Meta {
        Meta {
            txnid: self.txnid,
            free_head: self.free.head(),
            num_pages: self.num_pages,
            dbis: self.dbis.iter().map(|d| d.record).collect(),
        }
    }

    pub(crate) fn has_watch(&self, dbi: Dbi) -> bool {
        self.watches.iter().any(|w| w.dbi == dbi)
    }
}

/// Moves every deferred page no active reader can still reach onto the free chain.
pub(crate) fn collect_garbage(
    state: &mut WriterState,
    readers: &ReaderRegistry,
    pages: &mut PageTable,
) -> Result<usize> {
    let mut moved = 0;
    let mut i = 0;
    while i < state.deferred.len() {
        let (freed_at, pgno) = state.deferred[i];
        if readers.can_recycle(freed_at) {
            state.free.push(pages, pgno)?;
            state.deferred.swap_remove(i);
            moved += 1;
        } else {
            i += 1;
        }
    }
    if moved > 0 {
        debug!(moved, pending = state.deferred.len(), "deferred pages recycled");
    }
    Ok(moved)
}

fn default_order(cmp: &Comparator) -> TreeOrder {
    TreeOrder {
        key: cmp.clone(),
        ..TreeOrder::default()
    }
}

/// An in-memory database: one page table shared by every transaction.
///
/// Lock order is `state` → `readers` → `pages`. Data operations only take
/// `pages`; begin, commit and metadata changes take `state` first.
pub struct Db {
    pub(crate) page_size: usize,
    pub(crate) max_dbis: usize,
    default_cmp: Comparator,
    pub(crate) pages: RwLock<PageTable>,
    pub(crate) state: Mutex<WriterState>,
    pub(crate) readers: Mutex<ReaderRegistry>,
}

impl std::fmt::Debug for Db {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Db")
            .field("page_size", &self.page_size)
            .field("max_dbis", &self.max_dbis)
            .finish_non_exhaustive()
    }
}

impl Db {
    /// Creates an empty database with both meta slots initialized at txnid 0.
    pub fn open(options: DbOptions) -> Result<Self> {
        let max_dbis = options.validate()?;
        let page_size = options.page_size as usize;
        let allocator: Arc<dyn PageAllocator> = options
            .allocator
            .clone()
            .unwrap_or_else(|| Arc::new(HeapAllocator));
        let default_cmp = options.comparator.clone().unwrap_or_default();

        let mut pages = PageTable::new(allocator, page_size);
        for slot in META_SLOTS {
            pages.install(slot)?;
        }
        let dbis = vec![DbiSlot {
            record: DbiRecord::default(),
            order: default_order(&default_cmp),
        }];
        let state = WriterState {
            txnid: 0,
            free: FreeList::empty(),
            num_pages: META_SLOTS.len() as u32,
            dbis,
            write_active: false,
            deferred: Vec::new(),
            watches: Vec::new(),
        };
        {
            let (s0, s1) = pages.meta_slots_mut()?;
            init_meta(s0, s1, &state.meta())?;
        }
        info!(page_size, max_dbis, "database opened");
        Ok(Self {
            page_size,
            max_dbis,
            default_cmp,
            pages: RwLock::new(pages),
            state: Mutex::new(state),
            readers: Mutex::new(ReaderRegistry::default()),
        })
    }

    /// Releases every page. Transactions borrow the handle, so none can be open.
    pub fn close(self) {
        let num_pages = self.num_pages();
        drop(self);
        debug!(num_pages, "database closed");
    }

    /// Bytes per page.
    pub fn page_size(&self) -> usize {
        self.page_size
    }

    /// Committed page count.
    pub fn num_pages(&self) -> u32 {
        self.state.lock().num_pages
    }

    /// Whether a writer or any reader is open right now.
    pub fn lock_snapshot(&self) -> LockSnapshot {
        let state = self.state.lock();
        let readers = self.readers.lock();
        LockSnapshot {
            readers: readers.len(),
            writer: state.write_active,
        }
    }

    /// Starts a read-only snapshot of the last committed state.
    pub fn begin_read(&self) -> Result<Txn<'_>> {
        self.begin(TxnMode::ReadOnly)
    }

    /// Starts the single write transaction, or fails with `Busy`.
    pub fn begin_write(&self) -> Result<Txn<'_>> {
        self.begin(TxnMode::ReadWrite)
    }

    /// Starts a top-level transaction in `mode`.
    pub fn begin(&self, mode: TxnMode) -> Result<Txn<'_>> {
        let mut state = self.state.lock();
        let txn_state = match mode {
            TxnMode::ReadOnly => {
                self.readers.lock().register(state.txnid);
                TxnState::snapshot(&state, mode, false)
            }
            TxnMode::ReadWrite => {
                if state.write_active {
                    return Err(SaplingError::Busy("another write transaction is active"));
                }
                {
                    let readers = self.readers.lock();
                    let mut pages = self.pages.write();
                    collect_garbage(&mut state, &readers, &mut pages)?;
                }
                state.write_active = true;
                let track = !state.watches.is_empty();
                TxnState::snapshot(&state, mode, track)
            }
        };
        Ok(Txn::top_level(self, txn_state))
    }

    /// Unregisters a reader and recycles what it was pinning, unless a writer
    /// currently owns the free chain.
    pub(crate) fn end_reader(&self, txnid: TxnId) -> Result<()> {
        let mut state = self.state.lock();
        let mut readers = self.readers.lock();
        readers.release(txnid);
        if state.write_active || state.deferred.is_empty() {
            return Ok(());
        }
        let mut pages = self.pages.write();
        collect_garbage(&mut state, &readers, &mut pages)?;
        Ok(())
    }

    pub(crate) fn default_order(&self) -> TreeOrder {
        default_order(&self.default_cmp)
    }

    pub(crate) fn ensure_idle(&self, state: &WriterState) -> Result<()> {
        if state.write_active || !self.readers.lock().is_empty() {
            return Err(SaplingError::Busy("transactions are open"));
        }
        Ok(())
    }

    /// Opens (or reconfigures) sub-database `index`, extending the DBI table as needed.
    ///
    /// `comparator` defaults to the database comparator. Turning DUPSORT on or
    /// off for a DBI that holds entries fails with `Invalid`.
    pub fn dbi_open(
        &self,
        index: u32,
        comparator: Option<Comparator>,
        flags: DbiFlags,
    ) -> Result<Dbi> {
        let mut state = self.state.lock();
        self.ensure_idle(&state)?;
        let idx = index as usize;
        if idx >= self.max_dbis {
            return Err(SaplingError::Invalid("DBI index beyond max_dbis"));
        }
        let dupsort = flags.contains(DbiFlags::DUPSORT);
        if let Some(slot) = state.dbis.get(idx) {
            if slot.order.dupsort != dupsort && slot.record.entries > 0 {
                return Err(SaplingError::Invalid("cannot change DUPSORT on a non-empty DBI"));
            }
            if dupsort && state.has_watch(Dbi(index)) {
                return Err(SaplingError::Busy("DBI has registered watches"));
            }
        }
        while state.dbis.len() <= idx {
            state.dbis.push(DbiSlot {
                record: DbiRecord::default(),
                order: self.default_order(),
            });
        }
        let slot = &mut state.dbis[idx];
        slot.order.key = comparator.unwrap_or_else(|| self.default_cmp.clone());
        slot.order.dupsort = dupsort;
        debug!(dbi = index, dupsort, "dbi opened");
        Ok(Dbi(index))
    }

    /// Installs a value comparator on `dbi` and switches it to DUPSORT.
    pub fn dbi_set_dupsort(&self, dbi: Dbi, value_cmp: Option<Comparator>) -> Result<()> {
        let mut state = self.state.lock();
        self.ensure_idle(&state)?;
        if state.has_watch(dbi) {
            return Err(SaplingError::Busy("DBI has registered watches"));
        }
        let slot = state
            .dbis
            .get_mut(dbi.index())
            .ok_or(SaplingError::Invalid("unknown DBI"))?;
        if !slot.order.dupsort && slot.record.entries > 0 {
            return Err(SaplingError::Invalid("cannot change DUPSORT on a non-empty DBI"));
        }
        slot.order.value = value_cmp.unwrap_or_default();
        slot.order.dupsort = true;
        Ok(())
    }

    /// Statistics of DBI 0.
    pub fn stat(&self) -> Result<Stat> {
        self.dbi_stat(Dbi::MAIN)
    }

    /// Statistics of `dbi` as of the last commit.
    pub fn dbi_stat(&self, dbi: Dbi) -> Result<Stat> {
        let state = self.state.lock();
        let slot = state
            .dbis
            .get(dbi.index())
            .ok_or(SaplingError::Invalid("unknown DBI"))?;
        let depth = tree::depth(&self.pages.read(), slot.record.root)?;
        Ok(Stat {
            entries: slot.record.entries,
            txnid: state.txnid,
            depth,
            num_pages: state.num_pages,
            page_size: self.page_size as u32,
            has_write_txn: state.write_active,
        })
    }
}
