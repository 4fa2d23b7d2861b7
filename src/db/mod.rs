#![forbid(unsafe_code)]
//! Database handle, transactions and the operations layered on them.

mod checkpoint;
mod config;
mod cursor;
mod database;
mod flags;
mod ops;
mod stat;
mod transaction;
mod ttl;
mod watch;


pub use checkpoint::{CHECKPOINT_MAGIC, CHECKPOINT_VERSION};
pub use config::DbOptions;
pub use cursor::Cursor;
pub use database::Db;
pub use flags::{DbiFlags, PutFlags, TtlFlags, TxnMode};
pub use stat::Stat;
pub use transaction::{ReservedValue, Txn};
pub use ttl::SweepCheckpoint;
pub use watch::WatchCallback;
