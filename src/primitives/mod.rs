//! Low-level primitives for building the storage engine.
//!
//! Includes byte utilities, reader bookkeeping and the in-memory page table.

/// Byte-level utilities and encoding/decoding.
///
/// Fixed-width little-endian fields and order-preserving big-endian keys.
pub mod bytes;

/// Concurrency bookkeeping.
///
/// Reader registry used to compute the safe page-recycling horizon.
pub mod concurrency;

/// Page table, allocator capability, free list and meta slots.
pub mod pager;
