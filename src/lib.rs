//! Sapling: an in-memory copy-on-write B+tree with MVCC snapshots, nested
//! transactions, sorted duplicates and checkpoint streams.
//!
//! ```
//! use sapling::{Db, DbOptions, Dbi};
//!
//! let db = Db::open(DbOptions::default())?;
//! let mut txn = db.begin_write()?;
//! txn.put(Dbi::MAIN, b"hello", b"world")?;
//! txn.commit()?;
//!
//! let txn = db.begin_read()?;
//! assert_eq!(txn.get(Dbi::MAIN, b"hello")?.as_deref(), Some(&b"world"[..]));
//! # Ok::<(), sapling::SaplingError>(())
//! ```

#![warn(missing_docs)]

pub mod db;
pub mod logging;
pub mod primitives;
pub mod storage;
pub mod types;

pub use db::{
    Cursor, Db, DbOptions, DbiFlags, PutFlags, ReservedValue, Stat, SweepCheckpoint, TtlFlags, Txn,
    TxnMode, WatchCallback, CHECKPOINT_MAGIC, CHECKPOINT_VERSION,
};
pub use primitives::concurrency::LockSnapshot;
pub use primitives::pager::{HeapAllocator, PageAllocator};
pub use storage::btree::{Comparator, TreeReport};
pub use types::{Dbi, PageNo, Result, SaplingError, TxnId};
