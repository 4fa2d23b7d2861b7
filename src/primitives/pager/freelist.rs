use rustc_hash::FxHashSet;

use super::PageTable;
use crate::primitives::bytes::le;
use crate::types::{PageNo, Result, SaplingError};

/// Free pages chained through their own first four bytes.
///
/// A freed page is zeroed and its leading `u32` rewritten to the previous head;
/// [`PageNo::INVALID`] terminates the chain.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub struct FreeList {
    head: PageNo,
}

impl Default for FreeList {
    fn default() -> Self {
        Self::empty()
    }
}

impl FreeList {
    /// A chain with no pages.
    pub const fn empty() -> Self {
        Self {
            head: PageNo::INVALID,
        }
    }

    /// Adopts an existing chain starting at `head`.
    pub const fn from_head(head: PageNo) -> Self {
        Self { head }
    }

    /// First page of the chain.
    pub fn head(&self) -> PageNo {
        self.head
    }

    /// Returns `true` when the chain is empty.
    pub fn is_empty(&self) -> bool {
        !self.head.is_valid()
    }

    /// Links `pgno` in front of the chain.
    pub fn push(&mut self, pages: &mut PageTable, pgno: PageNo) -> Result<()> {
        let buf = pages.page_mut(pgno)?;
        buf.fill(0);
        le::write_u32(buf, 0, self.head.0);
        self.head = pgno;
        Ok(())
    }

    /// Unlinks the head page and returns it zeroed.
    pub fn pop(&mut self, pages: &mut PageTable) -> Result<Option<PageNo>> {
        if self.is_empty() {
            return Ok(None);
        }
        let pgno = self.head;
        let buf = pages.page_mut(pgno)?;
        let next = PageNo(le::read_u32(buf, 0));
        buf.fill(0);
        self.head = next;
        Ok(Some(pgno))
    }

    /// Walks the chain without modifying it.
    pub fn collect(&self, pages: &PageTable) -> Result<Vec<PageNo>> {
        let mut out = Vec::new();
        let mut seen = FxHashSet::default();
        let mut cur = self.head;
        while cur.is_valid() {
            if !seen.insert(cur) {
                return Err(SaplingError::Corruption("free list contains a cycle"));
            }
            out.push(cur);
            cur = PageNo(le::read_u32(pages.page(cur)?, 0));
        }
        Ok(out)
    }
}
