#![forbid(unsafe_code)]
//! Slotted page layout for internal, leaf and overflow pages.
//!
//! Every accessor is offset arithmetic over a raw page buffer. Cells grow down
//! from the end of the page, the slot array grows up from the header, and the
//! `dend` header field marks the lowest byte in use by cells.
//!
//! ```text
//! internal: kind u8 | pad | count u16 | pgno u32 | left u32 | dend u16 | pad | slots...
//!           cell = klen u16 | right u32 | key
//! leaf:     kind u8 | pad | count u16 | pgno u32 | dend u16 | slots...
//!           cell = klen u16 | vlen u16 | key | value (or 8-byte overflow ref when vlen = 0xFFFF)
//! overflow: kind u8 | pad | count u16 | pgno u32 | next u32 | len u16 | payload
//! ```

use std::cmp::Ordering;
use std::ops::Range;

use crate::primitives::bytes::le;
use crate::types::page::{self as common, PageKind};
use crate::types::{PageNo, Result, SaplingError};

/// Internal page header length.
pub const INTERNAL_HEADER_LEN: usize = 16;
/// Leaf page header length.
pub const LEAF_HEADER_LEN: usize = 10;
/// Overflow page header length.
pub const OVERFLOW_HEADER_LEN: usize = 14;
/// Size of one slot entry.
pub const SLOT_LEN: usize = 2;
/// Internal cell header (`klen:u16` + `right:u32`).
pub const INTERNAL_CELL_HEADER_LEN: usize = 6;
/// Leaf cell header (`klen:u16` + `vlen:u16`).
pub const LEAF_CELL_HEADER_LEN: usize = 4;
/// `vlen` value tagging an overflow reference.
pub const OVERFLOW_SENTINEL: u16 = u16::MAX;
/// Overflow reference payload (`logical_len:u32` + `first_page:u32`).
pub const OVERFLOW_REF_LEN: usize = 8;
/// Longest key or value accepted anywhere.
pub const MAX_KV_LEN: usize = u16::MAX as usize;

const I_LEFT: usize = 8;
const I_DEND: usize = 12;
const L_DEND: usize = 8;
const OV_NEXT: usize = 8;
const OV_LEN: usize = 12;

/// Returned when a cell does not fit in the page's free space.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub struct PageFull;

/// Decodes the kind tag of `page`.
pub fn kind(page: &[u8]) -> Result<PageKind> {
    PageKind::from_u8(page[common::KIND])
}

/// Number of slots (leaf cells, internal keys).
pub fn count(page: &[u8]) -> usize {
    le::read_u16(page, common::COUNT) as usize
}

fn set_count(page: &mut [u8], n: usize) {
    le::write_u16(page, common::COUNT, n as u16);
}

/// Page number recorded in the page itself.
pub fn page_no(page: &[u8]) -> PageNo {
    PageNo(le::read_u32(page, common::PAGE_NO))
}

/// Rewrites the self page number after a copy.
pub fn set_page_no(page: &mut [u8], pgno: PageNo) {
    le::write_u32(page, common::PAGE_NO, pgno.0);
}

fn init(page: &mut [u8], kind: PageKind, pgno: PageNo) {
    page.fill(0);
    page[common::KIND] = kind as u8;
    set_page_no(page, pgno);
}

fn slot(page: &[u8], header: usize, i: usize) -> Result<usize> {
    let at = header + i * SLOT_LEN;
    if i >= count(page) || at + SLOT_LEN > page.len() {
        return Err(SaplingError::Corruption("slot index beyond slot array"));
    }
    Ok(le::read_u16(page, at) as usize)
}

fn set_slot(page: &mut [u8], header: usize, i: usize, off: usize) {
    le::write_u16(page, header + i * SLOT_LEN, off as u16);
}

fn bytes(page: &[u8], range: Range<usize>) -> Result<&[u8]> {
    page.get(range)
        .ok_or(SaplingError::Corruption("cell extends beyond page"))
}

/// Opens a slot at `pos` and compacts nothing; callers checked free space.
fn insert_slot(page: &mut [u8], header: usize, pos: usize, off: usize) {
    let n = count(page);
    let start = header + pos * SLOT_LEN;
    let end = header + n * SLOT_LEN;
    page.copy_within(start..end, start + SLOT_LEN);
    set_slot(page, header, pos, off);
    set_count(page, n + 1);
}

/// Removes the cell at `slot_idx` of size `cell_len`, sliding lower cells up
/// over the gap and dropping the slot.
fn remove_cell(page: &mut [u8], header: usize, dend_at: usize, slot_idx: usize, cell_len: usize) -> Result<()> {
    let n = count(page);
    let off = slot(page, header, slot_idx)?;
    let dend = le::read_u16(page, dend_at) as usize;
    if off < dend || off + cell_len > page.len() {
        return Err(SaplingError::Corruption("cell offset outside data area"));
    }
    page.copy_within(dend..off, dend + cell_len);
    for i in 0..n {
        if i == slot_idx {
            continue;
        }
        let s = slot(page, header, i)?;
        if s >= dend && s < off {
            set_slot(page, header, i, s + cell_len);
        }
    }
    le::write_u16(page, dend_at, (dend + cell_len) as u16);
    let start = header + slot_idx * SLOT_LEN;
    let end = header + n * SLOT_LEN;
    page.copy_within(start + SLOT_LEN..end, start);
    set_count(page, n - 1);
    Ok(())
}

/// Value as stored in a leaf cell.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum CellValue<'a> {
    /// Bytes stored in the cell.
    Inline(&'a [u8]),
    /// Value spilled to an overflow chain.
    Overflow {
        /// Logical value length.
        len: u32,
        /// First page of the chain.
        head: PageNo,
    },
}

/// Value to be written into a new leaf cell.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum NewValue<'a> {
    /// Copy these bytes inline.
    Inline(&'a [u8]),
    /// Write an overflow reference.
    Overflow {
        /// Logical value length.
        len: u32,
        /// First page of the chain.
        head: PageNo,
    },
    /// Zero-fill this many inline bytes for the caller to write later.
    Reserved(usize),
}

impl<'a> NewValue<'a> {
    /// Bytes the value occupies inside the cell.
    pub fn stored_len(&self) -> usize {
        match self {
            NewValue::Inline(v) => v.len(),
            NewValue::Overflow { .. } => OVERFLOW_REF_LEN,
            NewValue::Reserved(n) => *n,
        }
    }

    /// Whether the value lives in an overflow chain.
    pub fn is_overflow(&self) -> bool {
        matches!(self, NewValue::Overflow { .. })
    }
}

impl<'a> From<CellValue<'a>> for NewValue<'a> {
    fn from(v: CellValue<'a>) -> Self {
        match v {
            CellValue::Inline(b) => NewValue::Inline(b),
            CellValue::Overflow { len, head } => NewValue::Overflow { len, head },
        }
    }
}

/// Leaf cell size for a key and stored value length, excluding the slot.
pub fn leaf_cell_len(klen: usize, stored_len: usize) -> usize {
    LEAF_CELL_HEADER_LEN + klen + stored_len
}

/// Largest slot-plus-cell footprint stored in a leaf.
///
/// Keeping every cell within half of the usable area guarantees that any page
/// plus one incoming cell can be divided between two pages.
pub fn max_leaf_footprint(page_size: usize) -> usize {
    (page_size - LEAF_HEADER_LEN) / 2
}

/// Whether a cell with `klen` key bytes and `stored_len` value bytes may be stored.
pub fn leaf_cell_fits(page_size: usize, klen: usize, stored_len: usize) -> bool {
    SLOT_LEN + leaf_cell_len(klen, stored_len) <= max_leaf_footprint(page_size)
}

/// Payload capacity of one overflow page.
pub fn overflow_capacity(page_size: usize) -> usize {
    page_size - OVERFLOW_HEADER_LEN
}

/// Decoded leaf cell.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub struct LeafCell<'a> {
    /// Stored key (composite for DUPSORT trees).
    pub key: &'a [u8],
    /// Stored value.
    pub value: CellValue<'a>,
}

impl<'a> LeafCell<'a> {
    /// Cell size in bytes, excluding the slot.
    pub fn len(&self) -> usize {
        let stored = match self.value {
            CellValue::Inline(v) => v.len(),
            CellValue::Overflow { .. } => OVERFLOW_REF_LEN,
        };
        leaf_cell_len(self.key.len(), stored)
    }

    /// Returns `true` for a zero-length key with an empty inline value.
    pub fn is_empty(&self) -> bool {
        self.key.is_empty() && matches!(self.value, CellValue::Inline(v) if v.is_empty())
    }
}

pub mod leaf {
    //! Leaf page accessors.

    use super::*;

    /// Formats `page` as an empty leaf.
    pub fn init(page: &mut [u8], pgno: PageNo) {
        super::init(page, PageKind::Leaf, pgno);
        let end = page.len() as u16;
        le::write_u16(page, L_DEND, end);
    }

    /// Free bytes between the slot array and the cell area.
    pub fn free_space(page: &[u8]) -> usize {
        let dend = le::read_u16(page, L_DEND) as usize;
        dend.saturating_sub(LEAF_HEADER_LEN + count(page) * SLOT_LEN)
    }

    /// Decodes cell `i`.
    pub fn cell(page: &[u8], i: usize) -> Result<LeafCell<'_>> {
        let off = slot(page, LEAF_HEADER_LEN, i)?;
        let head = bytes(page, off..off + LEAF_CELL_HEADER_LEN)?;
        let klen = le::read_u16(head, 0) as usize;
        let vlen = le::read_u16(head, 2);
        let kstart = off + LEAF_CELL_HEADER_LEN;
        let key = bytes(page, kstart..kstart + klen)?;
        let vstart = kstart + klen;
        let value = if vlen == OVERFLOW_SENTINEL {
            let r = bytes(page, vstart..vstart + OVERFLOW_REF_LEN)?;
            CellValue::Overflow {
                len: le::read_u32(r, 0),
                head: PageNo(le::read_u32(r, 4)),
            }
        } else {
            CellValue::Inline(bytes(page, vstart..vstart + vlen as usize)?)
        };
        Ok(LeafCell { key, value })
    }

    /// Stored key of cell `i`.
    pub fn key(page: &[u8], i: usize) -> Result<&[u8]> {
        Ok(cell(page, i)?.key)
    }

    /// Binary search: first slot whose key is `>= key` and whether it is equal.
    pub fn find<F>(page: &[u8], key: &[u8], cmp: F) -> Result<(usize, bool)>
    where
        F: Fn(&[u8], &[u8]) -> Ordering,
    {
        let n = count(page);
        let (mut lo, mut hi) = (0usize, n);
        while lo < hi {
            let mid = lo + (hi - lo) / 2;
            match cmp(self::key(page, mid)?, key) {
                Ordering::Less => lo = mid + 1,
                Ordering::Equal => return Ok((mid, true)),
                Ordering::Greater => hi = mid,
            }
        }
        Ok((lo, false))
    }

    /// Inserts a cell at slot `pos`. Returns the byte range of the value bytes.
    pub fn insert(
        page: &mut [u8],
        pos: usize,
        key: &[u8],
        value: NewValue<'_>,
    ) -> std::result::Result<Range<usize>, PageFull> {
        let stored = value.stored_len();
        let cell_len = leaf_cell_len(key.len(), stored);
        if pos > count(page) || SLOT_LEN + cell_len > free_space(page) {
            return Err(PageFull);
        }
        let dend = le::read_u16(page, L_DEND) as usize;
        let off = dend - cell_len;
        le::write_u16(page, off, key.len() as u16);
        let vstart = off + LEAF_CELL_HEADER_LEN + key.len();
        page[off + LEAF_CELL_HEADER_LEN..vstart].copy_from_slice(key);
        match value {
            NewValue::Inline(v) => {
                le::write_u16(page, off + 2, v.len() as u16);
                page[vstart..vstart + v.len()].copy_from_slice(v);
            }
            NewValue::Overflow { len, head } => {
                le::write_u16(page, off + 2, OVERFLOW_SENTINEL);
                le::write_u32(page, vstart, len);
                le::write_u32(page, vstart + 4, head.0);
            }
            NewValue::Reserved(n) => {
                le::write_u16(page, off + 2, n as u16);
                page[vstart..vstart + n].fill(0);
            }
        }
        le::write_u16(page, L_DEND, off as u16);
        insert_slot(page, LEAF_HEADER_LEN, pos, off);
        Ok(vstart..vstart + stored)
    }

    /// Removes cell `pos`, compacting the cell area.
    pub fn remove(page: &mut [u8], pos: usize) -> Result<()> {
        let len = cell(page, pos)?.len();
        remove_cell(page, LEAF_HEADER_LEN, L_DEND, pos, len)
    }

    /// Byte range of the value of cell `i` inside the page.
    pub fn value_range(page: &[u8], i: usize) -> Result<Range<usize>> {
        let off = slot(page, LEAF_HEADER_LEN, i)?;
        let c = cell(page, i)?;
        let start = off + LEAF_CELL_HEADER_LEN + c.key.len();
        Ok(start..off + c.len())
    }
}

pub mod internal {
    //! Internal page accessors. `n` keys address `n + 1` children; child 0 is
    //! the header's left pointer and child `i + 1` is the right pointer of key `i`.

    use super::*;

    /// Formats `page` as an empty internal node.
    pub fn init(page: &mut [u8], pgno: PageNo) {
        super::init(page, PageKind::Internal, pgno);
        le::write_u32(page, I_LEFT, PageNo::INVALID.0);
        let end = page.len() as u16;
        le::write_u16(page, I_DEND, end);
    }

    /// Free bytes between the slot array and the cell area.
    pub fn free_space(page: &[u8]) -> usize {
        let dend = le::read_u16(page, I_DEND) as usize;
        dend.saturating_sub(INTERNAL_HEADER_LEN + count(page) * SLOT_LEN)
    }

    /// Cell size for a key of `klen` bytes, excluding the slot.
    pub fn cell_len(klen: usize) -> usize {
        INTERNAL_CELL_HEADER_LEN + klen
    }

    fn cell_at(page: &[u8], i: usize) -> Result<(usize, &[u8])> {
        let off = slot(page, INTERNAL_HEADER_LEN, i)?;
        let head = bytes(page, off..off + INTERNAL_CELL_HEADER_LEN)?;
        let klen = le::read_u16(head, 0) as usize;
        let kstart = off + INTERNAL_CELL_HEADER_LEN;
        Ok((off, bytes(page, kstart..kstart + klen)?))
    }

    /// Separator key `i`.
    pub fn key(page: &[u8], i: usize) -> Result<&[u8]> {
        Ok(cell_at(page, i)?.1)
    }

    /// Leftmost child pointer.
    pub fn left(page: &[u8]) -> PageNo {
        PageNo(le::read_u32(page, I_LEFT))
    }

    /// Overwrites the leftmost child pointer.
    pub fn set_left(page: &mut [u8], child: PageNo) {
        le::write_u32(page, I_LEFT, child.0);
    }

    /// Child `idx` in `0..=count`.
    pub fn child(page: &[u8], idx: usize) -> Result<PageNo> {
        if idx == 0 {
            return Ok(left(page));
        }
        let (off, _) = cell_at(page, idx - 1)?;
        Ok(PageNo(le::read_u32(page, off + 2)))
    }

    /// Repoints child `idx` at `pgno`.
    pub fn set_child(page: &mut [u8], idx: usize, pgno: PageNo) -> Result<()> {
        if idx == 0 {
            set_left(page, pgno);
            return Ok(());
        }
        let (off, _) = cell_at(page, idx - 1)?;
        le::write_u32(page, off + 2, pgno.0);
        Ok(())
    }

    /// Index of the child whose subtree may contain `key`: the first separator
    /// strictly greater than `key`, or `count` when there is none.
    pub fn find_child<F>(page: &[u8], key: &[u8], cmp: F) -> Result<usize>
    where
        F: Fn(&[u8], &[u8]) -> Ordering,
    {
        let n = count(page);
        let (mut lo, mut hi) = (0usize, n);
        while lo < hi {
            let mid = lo + (hi - lo) / 2;
            if cmp(self::key(page, mid)?, key) == Ordering::Greater {
                hi = mid;
            } else {
                lo = mid + 1;
            }
        }
        Ok(lo)
    }

    /// Inserts separator `key` with right child `right` at slot `pos`.
    pub fn insert(
        page: &mut [u8],
        pos: usize,
        key: &[u8],
        right: PageNo,
    ) -> std::result::Result<(), PageFull> {
        let len = cell_len(key.len());
        if pos > count(page) || SLOT_LEN + len > free_space(page) {
            return Err(PageFull);
        }
        let dend = le::read_u16(page, I_DEND) as usize;
        let off = dend - len;
        le::write_u16(page, off, key.len() as u16);
        le::write_u32(page, off + 2, right.0);
        page[off + INTERNAL_CELL_HEADER_LEN..off + len].copy_from_slice(key);
        le::write_u16(page, I_DEND, off as u16);
        insert_slot(page, INTERNAL_HEADER_LEN, pos, off);
        Ok(())
    }

    /// Drops child `child_idx` along with the separator bounding it.
    ///
    /// Removing child 0 promotes child 1 to the left pointer and drops key 0;
    /// otherwise key `child_idx - 1` (whose right pointer is the child) goes.
    pub fn remove_child(page: &mut [u8], child_idx: usize) -> Result<()> {
        if count(page) == 0 {
            return Err(SaplingError::Corruption("internal page without separators"));
        }
        let slot_idx = child_idx.saturating_sub(1);
        if child_idx == 0 {
            let promoted = child(page, 1)?;
            set_left(page, promoted);
        }
        let klen = key(page, slot_idx)?.len();
        remove_cell(page, INTERNAL_HEADER_LEN, I_DEND, slot_idx, cell_len(klen))
    }
}

pub mod overflow {
    //! Overflow chunk accessors.

    use super::*;

    /// Formats `page` as an empty chunk with no successor.
    pub fn init(page: &mut [u8], pgno: PageNo) {
        super::init(page, PageKind::Overflow, pgno);
        le::write_u32(page, OV_NEXT, PageNo::INVALID.0);
    }

    /// Next chunk of the chain.
    pub fn next(page: &[u8]) -> PageNo {
        PageNo(le::read_u32(page, OV_NEXT))
    }

    /// Links the next chunk.
    pub fn set_next(page: &mut [u8], next: PageNo) {
        le::write_u32(page, OV_NEXT, next.0);
    }

    /// Payload of this chunk.
    pub fn data(page: &[u8]) -> Result<&[u8]> {
        let len = le::read_u16(page, OV_LEN) as usize;
        bytes(page, OVERFLOW_HEADER_LEN..OVERFLOW_HEADER_LEN + len)
    }

    /// Stores `chunk` as this page's payload.
    pub fn write_data(page: &mut [u8], chunk: &[u8]) -> Result<()> {
        if OVERFLOW_HEADER_LEN + chunk.len() > page.len() {
            return Err(SaplingError::Invalid("overflow chunk larger than page payload"));
        }
        le::write_u16(page, OV_LEN, chunk.len() as u16);
        page[OVERFLOW_HEADER_LEN..OVERFLOW_HEADER_LEN + chunk.len()].copy_from_slice(chunk);
        Ok(())
    }
}
