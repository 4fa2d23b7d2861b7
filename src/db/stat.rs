use serde::Serialize;

use crate::types::TxnId;

/// Point-in-time statistics for one sub-database.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize)]
pub struct Stat {
    /// Entries in the tree (each duplicate counts once).
    pub entries: u64,
    /// Commit counter the numbers were taken at.
    pub txnid: TxnId,
    /// Levels from the root to the leftmost leaf; 0 for an empty tree.
    pub depth: u32,
    /// Pages in the page table, meta slots included.
    pub num_pages: u32,
    /// Bytes per page.
    pub page_size: u32,
    /// Whether the database had a write transaction open.
    pub has_write_txn: bool,
}
