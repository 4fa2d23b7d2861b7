#![forbid(unsafe_code)]
//! Copy-on-write insert, delete and lookup over slotted pages.
//!
//! Mutations record the root-to-leaf path as fixed-capacity [`Path`] frames,
//! copy every page on that path once, and then apply the change bottom-up:
//! splits push separators into already-private ancestors, and an emptied leaf is
//! unlinked from its parent with at most one level of parent collapse.

use std::ops::Range;

use smallvec::SmallVec;
use tracing::trace;

use super::cmp::TreeOrder;
use super::page::{
    self, internal, leaf, CellValue, NewValue, PageFull, INTERNAL_CELL_HEADER_LEN,
    INTERNAL_HEADER_LEN, LEAF_HEADER_LEN, SLOT_LEN,
};
use crate::primitives::pager::{DbiRecord, PageTable};
use crate::storage::cow::{read_overflow, CowContext};
use crate::types::page::PageKind;
use crate::types::{PageNo, Result, SaplingError};

/// Deepest supported root-to-leaf path.
pub const MAX_DEPTH: usize = 32;

/// One hop of a root-to-leaf path: a page and the slot or child index taken.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub struct Frame {
    /// Page at this level.
    pub page: PageNo,
    /// Child index for internal pages, cell index for the leaf.
    pub idx: usize,
}

/// Root-to-leaf path; the last frame is the leaf.
pub type Path = SmallVec<[Frame; MAX_DEPTH]>;

/// Where an inserted value's bytes landed.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct Placement {
    /// Leaf holding the new cell.
    pub page: PageNo,
    /// Byte range of the inline value inside that page.
    pub range: Range<usize>,
    /// Whether an existing entry with the same key was replaced.
    pub replaced: bool,
}

/// Longest key any tree accepts for `page_size`.
///
/// Bounded so that a key plus an overflow reference, or a key as a separator,
/// always fits in half a page.
pub fn max_key_len(page_size: usize) -> usize {
    let as_leaf = page::max_leaf_footprint(page_size)
        .saturating_sub(SLOT_LEN + page::LEAF_CELL_HEADER_LEN + page::OVERFLOW_REF_LEN);
    let as_separator = ((page_size - INTERNAL_HEADER_LEN) / 2)
        .saturating_sub(SLOT_LEN + INTERNAL_CELL_HEADER_LEN);
    as_leaf.min(as_separator).min(page::MAX_KV_LEN)
}

/// Descends from `root` towards `key`. The leaf frame's index is the first cell
/// `>= key`; the flag reports an exact match.
pub fn descend(
    pages: &PageTable,
    order: &TreeOrder,
    root: PageNo,
    key: &[u8],
) -> Result<(Path, bool)> {
    let mut path = Path::new();
    let mut cur = root;
    loop {
        if path.len() >= MAX_DEPTH {
            return Err(SaplingError::Corruption("tree deeper than the path limit"));
        }
        let buf = pages.page(cur)?;
        match page::kind(buf)? {
            PageKind::Internal => {
                let idx = internal::find_child(buf, key, order.stored())?;
                path.push(Frame { page: cur, idx });
                cur = internal::child(buf, idx)?;
            }
            PageKind::Leaf => {
                let (pos, found) = leaf::find(buf, key, order.stored())?;
                path.push(Frame { page: cur, idx: pos });
                return Ok((path, found));
            }
            _ => return Err(SaplingError::Corruption("unexpected page kind inside a tree")),
        }
    }
}

/// Materializes a cell value, following overflow chains.
pub fn cell_value(pages: &PageTable, value: CellValue<'_>) -> Result<Vec<u8>> {
    match value {
        CellValue::Inline(v) => Ok(v.to_vec()),
        CellValue::Overflow { len, head } => read_overflow(pages, len, head),
    }
}

/// Exact-match lookup of a stored key.
pub fn lookup(
    pages: &PageTable,
    order: &TreeOrder,
    root: PageNo,
    key: &[u8],
) -> Result<Option<Vec<u8>>> {
    if !root.is_valid() {
        return Ok(None);
    }
    let (path, found) = descend(pages, order, root, key)?;
    if !found {
        return Ok(None);
    }
    let Some(last) = path.last() else {
        return Ok(None);
    };
    let cell = leaf::cell(pages.page(last.page)?, last.idx)?;
    cell_value(pages, cell.value).map(Some)
}

/// Whether `key` is stored, without reading its value.
pub fn contains(pages: &PageTable, order: &TreeOrder, root: PageNo, key: &[u8]) -> Result<bool> {
    if !root.is_valid() {
        return Ok(false);
    }
    descend(pages, order, root, key).map(|(_, found)| found)
}

/// Copies every page on `path` (bottom-up) and relinks parents to the copies.
/// Returns the new root.
pub fn cow_path(ctx: &mut CowContext<'_>, path: &mut [Frame]) -> Result<PageNo> {
    let mut child = PageNo::INVALID;
    for d in (0..path.len()).rev() {
        let copy = ctx.cow(path[d].page)?;
        if child.is_valid() {
            internal::set_child(ctx.pages.page_mut(copy)?, path[d].idx, child)?;
        }
        path[d].page = copy;
        child = copy;
    }
    Ok(child)
}

/// Inserts or replaces `key`.
///
/// With `no_overwrite`, an existing key yields `Exists` before anything is copied.
pub fn insert(
    ctx: &mut CowContext<'_>,
    order: &TreeOrder,
    tree: &mut DbiRecord,
    key: &[u8],
    value: NewValue<'_>,
    no_overwrite: bool,
) -> Result<Placement> {
    if !tree.root.is_valid() {
        let pgno = ctx.alloc()?;
        let buf = ctx.pages.page_mut(pgno)?;
        leaf::init(buf, pgno);
        let range = leaf::insert(buf, 0, key, value)
            .map_err(|PageFull| SaplingError::Full("entry does not fit in an empty leaf"))?;
        tree.root = pgno;
        tree.entries += 1;
        return Ok(Placement {
            page: pgno,
            range,
            replaced: false,
        });
    }

    let (mut path, found) = descend(ctx.pages, order, tree.root, key)?;
    if found && no_overwrite {
        return Err(SaplingError::Exists);
    }
    if path.len() >= MAX_DEPTH - 1 {
        return Err(SaplingError::Full("tree depth limit reached"));
    }
    tree.root = cow_path(ctx, &mut path)?;
    let Frame { page: leaf_pg, idx: pos } = *path
        .last()
        .ok_or(SaplingError::Corruption("empty descent path"))?;

    if found {
        let old = leaf::cell(ctx.pages.page(leaf_pg)?, pos)?.value;
        if let CellValue::Overflow { head, .. } = old {
            ctx.retire_overflow(head)?;
        }
        leaf::remove(ctx.pages.page_mut(leaf_pg)?, pos)?;
    }

    if let Ok(range) = leaf::insert(ctx.pages.page_mut(leaf_pg)?, pos, key, value) {
        if !found {
            tree.entries += 1;
        }
        return Ok(Placement {
            page: leaf_pg,
            range,
            replaced: found,
        });
    }

    let (right, sep) = split_leaf(ctx, leaf_pg, pos, key, value)?;
    if !found {
        tree.entries += 1;
    }
    let target = if order.compare(key, &sep).is_lt() {
        leaf_pg
    } else {
        right
    };
    let placed = leaf::find(ctx.pages.page(target)?, key, order.stored())?;
    let range = leaf::value_range(ctx.pages.page(target)?, placed.0)?;
    let internals = path.len() - 1;
    propagate(ctx, tree, &path[..internals], leaf_pg, right, sep)?;
    Ok(Placement {
        page: target,
        range,
        replaced: found,
    })
}

/// Pushes `sep`/`right` into the ancestors on `path`, splitting as needed, and
/// grows a new root when the old root splits.
fn propagate(
    ctx: &mut CowContext<'_>,
    tree: &mut DbiRecord,
    path: &[Frame],
    mut left: PageNo,
    mut right: PageNo,
    mut sep: Vec<u8>,
) -> Result<()> {
    for frame in path.iter().rev() {
        let parent = frame.page;
        if internal::insert(ctx.pages.page_mut(parent)?, frame.idx, &sep, right).is_ok() {
            return Ok(());
        }
        let (new_right, new_sep) = split_internal(ctx, parent, frame.idx, &sep, right)?;
        left = parent;
        right = new_right;
        sep = new_sep;
    }
    let root = ctx.alloc()?;
    let buf = ctx.pages.page_mut(root)?;
    internal::init(buf, root);
    internal::set_left(buf, left);
    internal::insert(buf, 0, &sep, right)
        .map_err(|PageFull| SaplingError::Corruption("separator does not fit in a new root"))?;
    trace!(root = %root, "root split");
    tree.root = root;
    Ok(())
}

#[derive(Clone, Debug)]
enum OwnedValue {
    Inline(Vec<u8>),
    Overflow { len: u32, head: PageNo },
    Reserved(usize),
}

#[derive(Clone, Debug)]
struct OwnedCell {
    key: Vec<u8>,
    value: OwnedValue,
}

impl OwnedCell {
    fn new(key: &[u8], value: NewValue<'_>) -> Self {
        let value = match value {
            NewValue::Inline(v) => OwnedValue::Inline(v.to_vec()),
            NewValue::Overflow { len, head } => OwnedValue::Overflow { len, head },
            NewValue::Reserved(n) => OwnedValue::Reserved(n),
        };
        Self {
            key: key.to_vec(),
            value,
        }
    }

    fn as_new(&self) -> NewValue<'_> {
        match &self.value {
            OwnedValue::Inline(v) => NewValue::Inline(v),
            OwnedValue::Overflow { len, head } => NewValue::Overflow {
                len: *len,
                head: *head,
            },
            OwnedValue::Reserved(n) => NewValue::Reserved(*n),
        }
    }

    fn footprint(&self) -> usize {
        SLOT_LEN + page::leaf_cell_len(self.key.len(), self.as_new().stored_len())
    }
}

/// Picks a split point in `lo..=hi` nearest to `preferred` for which
/// `fits(cut)` holds.
fn nearest_cut<F>(preferred: usize, lo: usize, hi: usize, fits: F) -> Option<usize>
where
    F: Fn(usize) -> bool,
{
    if lo > hi {
        return None;
    }
    let preferred = preferred.clamp(lo, hi);
    for delta in 0..=(hi - lo) {
        if let Some(c) = preferred.checked_sub(delta) {
            if c >= lo && fits(c) {
                return Some(c);
            }
        }
        let c = preferred + delta;
        if delta > 0 && c <= hi && fits(c) {
            return Some(c);
        }
    }
    None
}

fn prefix_sums(sizes: impl Iterator<Item = usize>) -> Vec<usize> {
    let mut acc = vec![0usize];
    let mut total = 0usize;
    for s in sizes {
        total += s;
        acc.push(total);
    }
    acc
}

/// Splits the full leaf `leaf_pg` while inserting `key` at `pos`. Returns the new
/// right sibling and the separator (its first key).
fn split_leaf(
    ctx: &mut CowContext<'_>,
    leaf_pg: PageNo,
    pos: usize,
    key: &[u8],
    value: NewValue<'_>,
) -> Result<(PageNo, Vec<u8>)> {
    let mut cells = {
        let buf = ctx.pages.page(leaf_pg)?;
        let n = page::count(buf);
        let mut cells = Vec::with_capacity(n + 1);
        for i in 0..n {
            let c = leaf::cell(buf, i)?;
            cells.push(OwnedCell::new(c.key, c.value.into()));
        }
        cells
    };
    cells.insert(pos.min(cells.len()), OwnedCell::new(key, value));

    let capacity = ctx.page_size() - LEAF_HEADER_LEN;
    let sums = prefix_sums(cells.iter().map(OwnedCell::footprint));
    let total = cells.len();
    let whole = sums[total];
    let cut = nearest_cut(total / 2, 1, total - 1, |c| {
        sums[c] <= capacity && whole - sums[c] <= capacity
    })
    .ok_or(SaplingError::Full("entry cannot be split across two leaves"))?;

    let right = ctx.alloc()?;
    leaf::init(ctx.pages.page_mut(right)?, right);
    leaf::init(ctx.pages.page_mut(leaf_pg)?, leaf_pg);
    for (j, cell) in cells.iter().enumerate() {
        let (dst, dpos) = if j < cut { (leaf_pg, j) } else { (right, j - cut) };
        leaf::insert(ctx.pages.page_mut(dst)?, dpos, &cell.key, cell.as_new())
            .map_err(|PageFull| SaplingError::Corruption("leaf split half overflowed"))?;
    }
    trace!(left = %leaf_pg, right = %right, cut, total, "leaf split");
    Ok((right, cells[cut].key.clone()))
}

/// Splits the full internal page `pgno` while inserting `key`/`right_child` at
/// slot `ins_pos`. The middle separator moves up; its right pointer becomes the
/// new page's leftmost child.
pub(crate) fn split_internal(
    ctx: &mut CowContext<'_>,
    pgno: PageNo,
    ins_pos: usize,
    key: &[u8],
    right_child: PageNo,
) -> Result<(PageNo, Vec<u8>)> {
    let (old_left, mut cells) = {
        let buf = ctx.pages.page(pgno)?;
        let n = page::count(buf);
        let mut cells: Vec<(Vec<u8>, PageNo)> = Vec::with_capacity(n + 1);
        for i in 0..n {
            cells.push((internal::key(buf, i)?.to_vec(), internal::child(buf, i + 1)?));
        }
        (internal::left(buf), cells)
    };
    cells.insert(ins_pos.min(cells.len()), (key.to_vec(), right_child));

    let capacity = ctx.page_size() - INTERNAL_HEADER_LEN;
    let sums = prefix_sums(
        cells
            .iter()
            .map(|(k, _)| SLOT_LEN + internal::cell_len(k.len())),
    );
    let total = cells.len();
    let whole = sums[total];
    let fits = |mid: usize| sums[mid] <= capacity && whole - sums[mid + 1] <= capacity;
    let balanced = if total >= 3 {
        nearest_cut(total / 2, 1, total - 2, fits)
    } else {
        None
    };
    let mid = balanced
        .or_else(|| nearest_cut(total / 2, 0, total.saturating_sub(1), fits))
        .ok_or(SaplingError::Full("separator cannot be split across two pages"))?;

    let (sep, right_left) = cells[mid].clone();
    let right = ctx.alloc()?;
    {
        let rbuf = ctx.pages.page_mut(right)?;
        internal::init(rbuf, right);
        internal::set_left(rbuf, right_left);
    }
    {
        let lbuf = ctx.pages.page_mut(pgno)?;
        internal::init(lbuf, pgno);
        internal::set_left(lbuf, old_left);
    }
    for (j, (k, child)) in cells.iter().enumerate() {
        if j == mid {
            continue;
        }
        let (dst, dpos) = if j < mid { (pgno, j) } else { (right, j - mid - 1) };
        internal::insert(ctx.pages.page_mut(dst)?, dpos, k, *child)
            .map_err(|PageFull| SaplingError::Corruption("internal split half overflowed"))?;
    }
    trace!(left = %pgno, right = %right, mid, total, "internal split");
    Ok((right, sep))
}

/// Removes `key`, failing with `NotFound` before any page is copied when absent.
pub fn remove(
    ctx: &mut CowContext<'_>,
    order: &TreeOrder,
    tree: &mut DbiRecord,
    key: &[u8],
) -> Result<()> {
    if !tree.root.is_valid() {
        return Err(SaplingError::NotFound);
    }
    let (mut path, found) = descend(ctx.pages, order, tree.root, key)?;
    if !found {
        return Err(SaplingError::NotFound);
    }
    tree.root = cow_path(ctx, &mut path)?;
    remove_at(ctx, tree, &path)?;
    Ok(())
}

/// Removes the cell addressed by the last frame of an already-copied `path`.
///
/// Returns `true` when the leaf became empty and was unlinked. Collapse goes
/// at most one level: a parent left with a single child is replaced by that
/// child, and nothing above it is touched.
pub fn remove_at(ctx: &mut CowContext<'_>, tree: &mut DbiRecord, path: &[Frame]) -> Result<bool> {
    let Some((last, internals)) = path.split_last() else {
        return Err(SaplingError::Corruption("empty descent path"));
    };
    let old = leaf::cell(ctx.pages.page(last.page)?, last.idx)?.value;
    if let CellValue::Overflow { head, .. } = old {
        ctx.retire_overflow(head)?;
    }
    let buf = ctx.pages.page_mut(last.page)?;
    leaf::remove(buf, last.idx)?;
    tree.entries = tree.entries.saturating_sub(1);
    if page::count(buf) > 0 {
        return Ok(false);
    }

    ctx.retire(last.page)?;
    let Some((parent, above)) = internals.split_last() else {
        tree.root = PageNo::INVALID;
        return Ok(true);
    };
    let pbuf = ctx.pages.page_mut(parent.page)?;
    internal::remove_child(pbuf, parent.idx)?;
    if page::count(pbuf) > 0 {
        return Ok(true);
    }
    let sole = internal::left(pbuf);
    ctx.retire(parent.page)?;
    match above.last() {
        None => tree.root = sole,
        Some(gp) => internal::set_child(ctx.pages.page_mut(gp.page)?, gp.idx, sole)?,
    }
    trace!(collapsed = %parent.page, promoted = %sole, "parent collapsed");
    Ok(true)
}

/// Replaces the value of the cell addressed by `path` without moving it.
///
/// Returns `false`, with nothing copied, when the new inline value would not
/// fit the leaf in place; the caller then goes through [`insert`].
pub fn replace_at(
    ctx: &mut CowContext<'_>,
    tree: &mut DbiRecord,
    path: &mut [Frame],
    value: &[u8],
) -> Result<bool> {
    let Some(&Frame { page: pg, idx }) = path.last() else {
        return Err(SaplingError::Corruption("empty descent path"));
    };
    let key = {
        let buf = ctx.pages.page(pg)?;
        let old = leaf::cell(buf, idx)?;
        let need = page::leaf_cell_len(old.key.len(), value.len());
        if !page::leaf_cell_fits(ctx.page_size(), old.key.len(), value.len())
            || need > leaf::free_space(buf) + old.len()
        {
            return Ok(false);
        }
        old.key.to_vec()
    };
    tree.root = cow_path(ctx, path)?;
    let leaf_pg = path[path.len() - 1].page;
    let old = leaf::cell(ctx.pages.page(leaf_pg)?, idx)?.value;
    if let CellValue::Overflow { head, .. } = old {
        ctx.retire_overflow(head)?;
    }
    let buf = ctx.pages.page_mut(leaf_pg)?;
    leaf::remove(buf, idx)?;
    leaf::insert(buf, idx, &key, NewValue::Inline(value))
        .map_err(|PageFull| SaplingError::Corruption("replacement no longer fits its leaf"))?;
    Ok(true)
}

/// Number of levels from the root to the leftmost leaf (0 for an empty tree).
///
/// Collapses can leave leaves at different levels; `verify_tree` reports the
/// deepest one.
pub fn depth(pages: &PageTable, root: PageNo) -> Result<u32> {
    let mut d = 0;
    let mut cur = root;
    while cur.is_valid() {
        d += 1;
        if d as usize > MAX_DEPTH {
            return Err(SaplingError::Corruption("tree deeper than the path limit"));
        }
        let buf = pages.page(cur)?;
        cur = match page::kind(buf)? {
            PageKind::Internal => internal::left(buf),
            PageKind::Leaf => PageNo::INVALID,
            _ => return Err(SaplingError::Corruption("unexpected page kind inside a tree")),
        };
    }
    Ok(d)
}
