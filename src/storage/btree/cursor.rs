#![forbid(unsafe_code)]
//! Stack-based tree walking shared by read and write cursors.
//!
//! Positions are [`Path`]s of `(page, index)` frames from the root to a leaf
//! cell; an empty path means the cursor is unpositioned. Every move re-derives
//! position from the frames it holds and never follows sibling links.

use std::cmp::Ordering;

use super::cmp::TreeOrder;
use super::page::{self, internal, leaf, LeafCell};
use super::tree::{descend, Frame, Path, MAX_DEPTH};
use crate::primitives::pager::PageTable;
use crate::types::page::PageKind;
use crate::types::{PageNo, Result, SaplingError};

#[derive(Clone, Copy, Debug, Eq, PartialEq)]
enum Edge {
    Leftmost,
    Rightmost,
}

fn descend_edge(pages: &PageTable, start: PageNo, path: &mut Path, edge: Edge) -> Result<bool> {
    let mut cur = start;
    loop {
        if path.len() >= MAX_DEPTH {
            return Err(SaplingError::Corruption("tree deeper than the path limit"));
        }
        let buf = pages.page(cur)?;
        let n = page::count(buf);
        match page::kind(buf)? {
            PageKind::Internal => {
                let idx = if edge == Edge::Leftmost { 0 } else { n };
                path.push(Frame { page: cur, idx });
                cur = internal::child(buf, idx)?;
            }
            PageKind::Leaf => {
                if n == 0 {
                    path.clear();
                    return Ok(false);
                }
                let idx = if edge == Edge::Leftmost { 0 } else { n - 1 };
                path.push(Frame { page: cur, idx });
                return Ok(true);
            }
            _ => return Err(SaplingError::Corruption("unexpected page kind inside a tree")),
        }
    }
}

/// Positions on the smallest entry.
pub fn first(pages: &PageTable, root: PageNo, path: &mut Path) -> Result<bool> {
    path.clear();
    if !root.is_valid() {
        return Ok(false);
    }
    descend_edge(pages, root, path, Edge::Leftmost)
}

/// Positions on the largest entry.
pub fn last(pages: &PageTable, root: PageNo, path: &mut Path) -> Result<bool> {
    path.clear();
    if !root.is_valid() {
        return Ok(false);
    }
    descend_edge(pages, root, path, Edge::Rightmost)
}

/// Positions on the least stored key `>= key`.
pub fn seek(
    pages: &PageTable,
    order: &TreeOrder,
    root: PageNo,
    key: &[u8],
    path: &mut Path,
) -> Result<bool> {
    path.clear();
    if !root.is_valid() {
        return Ok(false);
    }
    let (found_path, _) = descend(pages, order, root, key)?;
    *path = found_path;
    if on_entry(pages, path)? {
        return Ok(true);
    }
    next(pages, path)
}

/// Positions on the first stored key for which `below` is false.
///
/// `below` must hold for a prefix of the key order and fail for the rest, as
/// "user key < target" does for DUPSORT composites under any value order.
pub fn seek_by<F>(pages: &PageTable, root: PageNo, below: F, path: &mut Path) -> Result<bool>
where
    F: Fn(&[u8]) -> bool,
{
    path.clear();
    if !root.is_valid() {
        return Ok(false);
    }
    let by_stored = |stored: &[u8], _: &[u8]| {
        if below(stored) {
            Ordering::Less
        } else {
            Ordering::Greater
        }
    };
    let mut cur = root;
    loop {
        if path.len() >= MAX_DEPTH {
            return Err(SaplingError::Corruption("tree deeper than the path limit"));
        }
        let buf = pages.page(cur)?;
        match page::kind(buf)? {
            PageKind::Internal => {
                let idx = internal::find_child(buf, &[], by_stored)?;
                path.push(Frame { page: cur, idx });
                cur = internal::child(buf, idx)?;
            }
            PageKind::Leaf => {
                let (pos, _) = leaf::find(buf, &[], by_stored)?;
                path.push(Frame { page: cur, idx: pos });
                break;
            }
            _ => return Err(SaplingError::Corruption("unexpected page kind inside a tree")),
        }
    }
    if on_entry(pages, path)? {
        return Ok(true);
    }
    next(pages, path)
}

fn on_entry(pages: &PageTable, path: &Path) -> Result<bool> {
    match path.last() {
        Some(f) => Ok(f.idx < page::count(pages.page(f.page)?)),
        None => Ok(false),
    }
}

/// Steps forward, climbing to the nearest ancestor with a right neighbour
/// when the leaf is exhausted.
pub fn next(pages: &PageTable, path: &mut Path) -> Result<bool> {
    let Some(leaf) = path.last_mut() else {
        return Ok(false);
    };
    let n = page::count(pages.page(leaf.page)?);
    if leaf.idx + 1 < n {
        leaf.idx += 1;
        return Ok(true);
    }
    loop {
        path.pop();
        let Some(top) = path.last_mut() else {
            break;
        };
        let buf = pages.page(top.page)?;
        if top.idx < page::count(buf) {
            top.idx += 1;
            let child = internal::child(buf, top.idx)?;
            return descend_edge(pages, child, path, Edge::Leftmost);
        }
    }
    path.clear();
    Ok(false)
}

/// Steps backward, climbing to the nearest ancestor with a left neighbour
/// when the leaf is exhausted.
pub fn prev(pages: &PageTable, path: &mut Path) -> Result<bool> {
    let Some(leaf) = path.last_mut() else {
        return Ok(false);
    };
    if leaf.idx > 0 {
        let n = page::count(pages.page(leaf.page)?);
        if n == 0 {
            path.clear();
            return Ok(false);
        }
        leaf.idx = leaf.idx.min(n) - 1;
        return Ok(true);
    }
    loop {
        path.pop();
        let Some(top) = path.last_mut() else {
            break;
        };
        if top.idx > 0 {
            top.idx -= 1;
            let child = internal::child(pages.page(top.page)?, top.idx)?;
            return descend_edge(pages, child, path, Edge::Rightmost);
        }
    }
    path.clear();
    Ok(false)
}

/// Cell under the cursor, if positioned.
pub fn current<'p>(pages: &'p PageTable, path: &Path) -> Result<Option<LeafCell<'p>>> {
    let Some(f) = path.last() else {
        return Ok(None);
    };
    let buf = pages.page(f.page)?;
    if f.idx >= page::count(buf) {
        return Ok(None);
    }
    page::leaf::cell(buf, f.idx).map(Some)
}
