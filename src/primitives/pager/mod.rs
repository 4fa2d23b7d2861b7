#![forbid(unsafe_code)]
//! In-memory page table and the allocator capability backing it.
//!
//! The table exclusively owns every page buffer. Transactions refer to pages by
//! [`PageNo`] only, so one buffer can be shared by any number of snapshots.

mod freelist;
mod meta;

use std::fmt;
use std::sync::Arc;

pub use freelist::FreeList;
pub use meta::{
    init_meta, load_best, max_dbis_for_page_size, write_meta, DbiRecord, Meta, META_MAGIC, META_SLOTS,
    META_VERSION,
};

use crate::types::{PageNo, Result, SaplingError};

/// Source of page buffers.
///
/// Returned buffers must be zeroed and exactly `page_size` bytes long.
pub trait PageAllocator: Send + Sync + fmt::Debug {
    /// Hands out a zeroed buffer, or `None` when memory is exhausted.
    fn alloc_page(&self, page_size: usize) -> Option<Box<[u8]>>;
    /// Takes a buffer back.
    fn free_page(&self, page: Box<[u8]>);
}

/// Allocator backed by the global heap.
#[derive(Default, Debug, Clone, Copy)]
pub struct HeapAllocator;

impl PageAllocator for HeapAllocator {
    fn alloc_page(&self, page_size: usize) -> Option<Box<[u8]>> {
        Some(vec![0u8; page_size].into_boxed_slice())
    }

    fn free_page(&self, page: Box<[u8]>) {
        drop(page);
    }
}

/// Page-number to buffer mapping.
///
/// Slots past the committed page count may be empty after an abort released
/// their buffers; they are refilled when the page number is handed out again.
pub struct PageTable {
    page_size: usize,
    slots: Vec<Box<[u8]>>,
    allocator: Arc<dyn PageAllocator>,
}

impl fmt::Debug for PageTable {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PageTable")
            .field("page_size", &self.page_size)
            .field("slots", &self.slots.len())
            .field("allocator", &self.allocator)
            .finish()
    }
}

impl PageTable {
    /// Creates an empty table.
    pub fn new(allocator: Arc<dyn PageAllocator>, page_size: usize) -> Self {
        Self {
            page_size,
            slots: Vec::new(),
            allocator,
        }
    }

    /// Size of every page in bytes.
    pub fn page_size(&self) -> usize {
        self.page_size
    }

    /// Number of slots, populated or not.
    pub fn len(&self) -> usize {
        self.slots.len()
    }

    /// Returns `true` if the table has no slots.
    pub fn is_empty(&self) -> bool {
        self.slots.is_empty()
    }

    /// Borrows a populated page.
    pub fn page(&self, pgno: PageNo) -> Result<&[u8]> {
        match self.slots.get(pgno.index()) {
            Some(buf) if buf.len() == self.page_size => Ok(buf),
            _ => Err(SaplingError::Corruption("page number outside the page table")),
        }
    }

    /// Mutably borrows a populated page.
    pub fn page_mut(&mut self, pgno: PageNo) -> Result<&mut [u8]> {
        let page_size = self.page_size;
        match self.slots.get_mut(pgno.index()) {
            Some(buf) if buf.len() == page_size => Ok(buf),
            _ => Err(SaplingError::Corruption("page number outside the page table")),
        }
    }

    /// Makes `pgno` a populated, zeroed page, asking the allocator for a buffer
    /// if the slot is empty or beyond the end of the table.
    pub fn install(&mut self, pgno: PageNo) -> Result<()> {
        let idx = pgno.index();
        if idx > self.slots.len() {
            return Err(SaplingError::Corruption("page table grown out of order"));
        }
        if idx < self.slots.len() && self.slots[idx].len() == self.page_size {
            self.slots[idx].fill(0);
            return Ok(());
        }
        let buf = self.fresh_buffer()?;
        if idx == self.slots.len() {
            self.slots.push(buf);
        } else {
            self.slots[idx] = buf;
        }
        Ok(())
    }

    /// Returns the buffer of `pgno` to the allocator, leaving the slot empty.
    pub fn release(&mut self, pgno: PageNo) {
        if let Some(slot) = self.slots.get_mut(pgno.index()) {
            let buf = std::mem::take(slot);
            if !buf.is_empty() {
                self.allocator.free_page(buf);
            }
        }
    }

    /// Copies page `src` over page `dst`.
    pub fn copy_page(&mut self, src: PageNo, dst: PageNo) -> Result<()> {
        self.page(src)?;
        self.page(dst)?;
        let (s, d) = (src.index(), dst.index());
        if s == d {
            return Ok(());
        }
        if s < d {
            let (lo, hi) = self.slots.split_at_mut(d);
            hi[0].copy_from_slice(&lo[s]);
        } else {
            let (lo, hi) = self.slots.split_at_mut(s);
            lo[d].copy_from_slice(&hi[0]);
        }
        Ok(())
    }

    /// Allocates a detached zeroed buffer of the table's page size.
    pub fn fresh_buffer(&self) -> Result<Box<[u8]>> {
        let buf = self
            .allocator
            .alloc_page(self.page_size)
            .ok_or(SaplingError::Alloc)?;
        if buf.len() != self.page_size {
            return Err(SaplingError::Invalid("allocator returned a buffer of the wrong size"));
        }
        Ok(buf)
    }

    /// Swaps in a complete set of page images, returning the previous ones.
    pub fn replace_all(&mut self, slots: Vec<Box<[u8]>>) -> Vec<Box<[u8]>> {
        std::mem::replace(&mut self.slots, slots)
    }

    /// Returns every buffer in `slots` to the allocator.
    pub fn release_detached(&self, slots: Vec<Box<[u8]>>) {
        for buf in slots {
            if !buf.is_empty() {
                self.allocator.free_page(buf);
            }
        }
    }

    /// Mutable views of both meta slots.
    pub fn meta_slots_mut(&mut self) -> Result<(&mut [u8], &mut [u8])> {
        let page_size = self.page_size;
        if self.slots.len() < META_SLOTS.len()
            || self.slots[..META_SLOTS.len()].iter().any(|s| s.len() != page_size)
        {
            return Err(SaplingError::Corruption("meta slots missing from the page table"));
        }
        let (first, rest) = self.slots.split_at_mut(1);
        Ok((&mut first[0], &mut rest[0]))
    }

    /// Mutable access used by reserved-value guards that already validated `pgno`.
    pub(crate) fn slot_mut(&mut self, pgno: PageNo) -> &mut [u8] {
        &mut self.slots[pgno.index()]
    }
}

impl Drop for PageTable {
    fn drop(&mut self) {
        let slots = std::mem::take(&mut self.slots);
        self.release_detached(slots);
    }
}
