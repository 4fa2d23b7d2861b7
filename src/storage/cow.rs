#![forbid(unsafe_code)]
//! Per-transaction page allocation, copy-on-write and overflow chains.
//!
//! A [`PageSet`] records which pages a write transaction created (`new_pages`)
//! and which committed pages it replaced (`old_pages`). Pages it created are
//! private: they are mutated in place and may be recycled immediately. Pages it
//! replaced stay readable until deferred GC proves no snapshot still needs them.

use rustc_hash::FxHashSet;
use tracing::trace;

use crate::primitives::pager::{FreeList, PageTable};
use crate::storage::btree::page::{self, overflow};
use crate::types::page::PageKind;
use crate::types::{PageNo, Result, SaplingError};

/// Page bookkeeping of one write transaction.
#[derive(Clone, Debug, Default)]
pub struct PageSet {
    /// This transaction's view of the recycled-page chain.
    pub free: FreeList,
    /// Page table high-water mark as seen by this transaction.
    pub num_pages: u32,
    /// Pages allocated by this transaction.
    pub new_pages: FxHashSet<PageNo>,
    /// Committed pages this transaction copied or dropped.
    pub old_pages: Vec<PageNo>,
}

impl PageSet {
    /// Starts a set over the given free chain and page count.
    pub fn new(free: FreeList, num_pages: u32) -> Self {
        Self {
            free,
            num_pages,
            new_pages: FxHashSet::default(),
            old_pages: Vec::new(),
        }
    }

    /// Whether nothing has been allocated or replaced yet.
    pub fn is_clean(&self) -> bool {
        self.new_pages.is_empty() && self.old_pages.is_empty()
    }
}

/// Mutable view over the page table on behalf of one write transaction.
pub struct CowContext<'p> {
    /// Shared page table.
    pub pages: &'p mut PageTable,
    /// The transaction's bookkeeping.
    pub set: &'p mut PageSet,
}

impl<'p> CowContext<'p> {
    /// Binds a page table and page set.
    pub fn new(pages: &'p mut PageTable, set: &'p mut PageSet) -> Self {
        Self { pages, set }
    }

    /// Bytes per page.
    pub fn page_size(&self) -> usize {
        self.pages.page_size()
    }

    /// Pops a recycled page or grows the table by one zeroed page.
    pub fn alloc(&mut self) -> Result<PageNo> {
        if let Some(pgno) = self.set.free.pop(self.pages)? {
            self.set.new_pages.insert(pgno);
            return Ok(pgno);
        }
        if self.set.num_pages >= PageNo::INVALID.0 {
            return Err(SaplingError::Full("page number space exhausted"));
        }
        let pgno = PageNo(self.set.num_pages);
        self.pages.install(pgno)?;
        self.set.num_pages += 1;
        self.set.new_pages.insert(pgno);
        Ok(pgno)
    }

    /// Returns a private copy of `pgno`, copying at most once per transaction.
    pub fn cow(&mut self, pgno: PageNo) -> Result<PageNo> {
        if self.set.new_pages.contains(&pgno) {
            return Ok(pgno);
        }
        let fresh = self.alloc()?;
        self.pages.copy_page(pgno, fresh)?;
        page::set_page_no(self.pages.page_mut(fresh)?, fresh);
        self.set.old_pages.push(pgno);
        Ok(fresh)
    }

    /// Drops `pgno` from the tree being built.
    ///
    /// Private pages go straight back onto the transaction's free chain;
    /// committed pages are recorded for deferred reclamation.
    pub fn retire(&mut self, pgno: PageNo) -> Result<()> {
        if self.set.new_pages.remove(&pgno) {
            self.set.free.push(self.pages, pgno)
        } else {
            self.set.old_pages.push(pgno);
            Ok(())
        }
    }

    /// Writes `value` into a fresh overflow chain and returns its head.
    pub fn write_overflow(&mut self, value: &[u8]) -> Result<PageNo> {
        let cap = page::overflow_capacity(self.page_size());
        let mut head = PageNo::INVALID;
        let mut prev = PageNo::INVALID;
        for chunk in value.chunks(cap) {
            let pgno = match self.alloc() {
                Ok(p) => p,
                Err(err) => {
                    self.release_chain(head)?;
                    return Err(err);
                }
            };
            let buf = self.pages.page_mut(pgno)?;
            overflow::init(buf, pgno);
            overflow::write_data(buf, chunk)?;
            if prev.is_valid() {
                overflow::set_next(self.pages.page_mut(prev)?, pgno);
            } else {
                head = pgno;
            }
            prev = pgno;
        }
        trace!(head = %head, len = value.len(), "overflow chain written");
        Ok(head)
    }

    /// Retires every page of the chain starting at `head`.
    pub fn retire_overflow(&mut self, head: PageNo) -> Result<()> {
        for pgno in chain_pages(self.pages, head)? {
            self.retire(pgno)?;
        }
        Ok(())
    }

    /// Undoes [`CowContext::write_overflow`] for a chain that never got linked.
    pub fn release_chain(&mut self, head: PageNo) -> Result<()> {
        if !head.is_valid() {
            return Ok(());
        }
        self.retire_overflow(head)
    }
}

/// Page numbers of the chain starting at `head`, validated for kind and cycles.
pub fn chain_pages(pages: &PageTable, head: PageNo) -> Result<Vec<PageNo>> {
    let mut out = Vec::new();
    let mut cur = head;
    while cur.is_valid() {
        if out.len() > pages.len() {
            return Err(SaplingError::Corruption("overflow chain longer than page table"));
        }
        let buf = pages.page(cur)?;
        if page::kind(buf)? != PageKind::Overflow {
            return Err(SaplingError::Corruption("overflow chain points at a non-overflow page"));
        }
        out.push(cur);
        cur = overflow::next(buf);
    }
    Ok(out)
}

/// Reassembles a value of `len` bytes from the chain at `head`.
pub fn read_overflow(pages: &PageTable, len: u32, head: PageNo) -> Result<Vec<u8>> {
    let mut out = Vec::with_capacity(len as usize);
    let mut cur = head;
    let mut hops = 0usize;
    while out.len() < len as usize {
        if !cur.is_valid() || hops > pages.len() {
            return Err(SaplingError::Corruption("overflow chain shorter than its value"));
        }
        let buf = pages.page(cur)?;
        if page::kind(buf)? != PageKind::Overflow {
            return Err(SaplingError::Corruption("overflow chain points at a non-overflow page"));
        }
        let chunk = overflow::data(buf)?;
        if chunk.is_empty() || out.len() + chunk.len() > len as usize {
            return Err(SaplingError::Corruption("overflow chunk length mismatch"));
        }
        out.extend_from_slice(chunk);
        cur = overflow::next(buf);
        hops += 1;
    }
    Ok(out)
}

/// Returns `true` when any leaf of the tree at `root` references an overflow chain.
pub fn tree_has_overflow(pages: &PageTable, root: PageNo) -> Result<bool> {
    let mut stack = vec![root];
    while let Some(pgno) = stack.pop() {
        if !pgno.is_valid() {
            continue;
        }
        let buf = pages.page(pgno)?;
        match page::kind(buf)? {
            PageKind::Leaf => {
                for i in 0..page::count(buf) {
                    if matches!(page::leaf::cell(buf, i)?.value, page::CellValue::Overflow { .. }) {
                        return Ok(true);
                    }
                }
            }
            PageKind::Internal => {
                for i in 0..=page::count(buf) {
                    stack.push(page::internal::child(buf, i)?);
                }
            }
            _ => return Err(SaplingError::Corruption("unexpected page kind inside a tree")),
        }
        if stack.len() > pages.len() {
            return Err(SaplingError::Corruption("tree walk exceeded page table"));
        }
    }
    Ok(false)
}

/// Retires every page of the tree at `root`, overflow chains included.
pub fn retire_tree(ctx: &mut CowContext<'_>, root: PageNo) -> Result<()> {
    let mut stack = vec![root];
    let mut doomed = Vec::new();
    let mut chains = Vec::new();
    while let Some(pgno) = stack.pop() {
        if !pgno.is_valid() {
            continue;
        }
        let buf = ctx.pages.page(pgno)?;
        match page::kind(buf)? {
            PageKind::Leaf => {
                for i in 0..page::count(buf) {
                    if let page::CellValue::Overflow { head, .. } = page::leaf::cell(buf, i)?.value {
                        chains.push(head);
                    }
                }
            }
            PageKind::Internal => {
                for i in 0..=page::count(buf) {
                    stack.push(page::internal::child(buf, i)?);
                }
            }
            _ => return Err(SaplingError::Corruption("unexpected page kind inside a tree")),
        }
        doomed.push(pgno);
        if doomed.len() > ctx.pages.len() {
            return Err(SaplingError::Corruption("tree walk exceeded page table"));
        }
    }
    for head in chains {
        ctx.retire_overflow(head)?;
    }
    for pgno in doomed {
        ctx.retire(pgno)?;
    }
    Ok(())
}
