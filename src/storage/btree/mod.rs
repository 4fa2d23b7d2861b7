#![forbid(unsafe_code)]

//! Copy-on-write B+ tree over the shared page table.

/// Slotted page format for leaf, internal and overflow pages.
pub mod page;

/// Key/value ordering and the DUPSORT composite encoding.
pub mod cmp;
pub mod build;
pub mod cursor;
pub mod tree;
mod verify;

pub use cmp::{CompareFn, Comparator, TreeOrder};
pub use verify::{verify_tree, TreeReport};
