#![forbid(unsafe_code)]

//! Tree storage: the B+ tree engine and per-transaction page management.

pub mod btree;
pub mod cow;
