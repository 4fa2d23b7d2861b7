#![forbid(unsafe_code)]
//! Structural checks over one tree.

use serde::Serialize;

use super::cmp::TreeOrder;
use super::page::{self, internal, leaf, CellValue};
use super::tree::MAX_DEPTH;
use crate::primitives::pager::{DbiRecord, PageTable};
use crate::storage::cow::chain_pages;
use crate::types::page::PageKind;
use crate::types::{PageNo, Result, SaplingError};

/// Shape of a tree that passed verification.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize)]
pub struct TreeReport {
    /// Leaf cells counted during the walk.
    pub entries: u64,
    /// Levels from the root to the deepest leaf.
    pub depth: u32,
    /// Leaf pages reached.
    pub leaf_pages: u64,
    /// Internal pages reached.
    pub internal_pages: u64,
    /// Overflow pages referenced by leaf cells.
    pub overflow_pages: u64,
}

struct Pending {
    page: PageNo,
    level: u32,
    lo: Option<Vec<u8>>,
    hi: Option<Vec<u8>>,
}

/// Walks the tree described by `tree` and checks page kinds, in-page
/// ordering, separator bounds and the recorded entry count.
///
/// Leaves may sit at different levels: a collapsed parent is replaced by its
/// only child, which leaves that subtree one level shorter than its siblings.
pub fn verify_tree(pages: &PageTable, order: &TreeOrder, tree: &DbiRecord) -> Result<TreeReport> {
    let mut report = TreeReport::default();
    if !tree.root.is_valid() {
        if tree.entries != 0 {
            return Err(SaplingError::Corruption("empty tree with a non-zero entry count"));
        }
        return Ok(report);
    }
    let mut deepest = 0u32;
    let mut visited = 0usize;
    let mut stack = vec![Pending {
        page: tree.root,
        level: 1,
        lo: None,
        hi: None,
    }];
    while let Some(item) = stack.pop() {
        visited += 1;
        if visited > pages.len() || item.level as usize > MAX_DEPTH {
            return Err(SaplingError::Corruption("tree walk revisits pages"));
        }
        let buf = pages.page(item.page)?;
        if page::page_no(buf) != item.page {
            return Err(SaplingError::Corruption("page records a different page number"));
        }
        let n = page::count(buf);
        let in_bounds = |key: &[u8]| {
            item.lo.as_deref().map_or(true, |lo| order.compare(key, lo).is_ge())
                && item.hi.as_deref().map_or(true, |hi| order.compare(key, hi).is_lt())
        };
        match page::kind(buf)? {
            PageKind::Leaf => {
                if n == 0 {
                    return Err(SaplingError::Corruption("empty leaf linked into a tree"));
                }
                deepest = deepest.max(item.level);
                let mut prev: Option<&[u8]> = None;
                for i in 0..n {
                    let cell = leaf::cell(buf, i)?;
                    if prev.is_some_and(|p| order.compare(p, cell.key).is_ge()) {
                        return Err(SaplingError::Corruption("leaf keys out of order"));
                    }
                    if !in_bounds(cell.key) {
                        return Err(SaplingError::Corruption("leaf key outside separator bounds"));
                    }
                    if let CellValue::Overflow { len, head } = cell.value {
                        let chain = chain_pages(pages, head)?;
                        let cap = page::overflow_capacity(pages.page_size());
                        if chain.len() != (len as usize).div_ceil(cap) {
                            return Err(SaplingError::Corruption("overflow chain length mismatch"));
                        }
                        report.overflow_pages += chain.len() as u64;
                    }
                    prev = Some(cell.key);
                }
                report.entries += n as u64;
                report.leaf_pages += 1;
            }
            PageKind::Internal => {
                if n == 0 {
                    return Err(SaplingError::Corruption("internal page without separators"));
                }
                let keys: Vec<&[u8]> = (0..n).map(|i| internal::key(buf, i)).collect::<Result<_>>()?;
                for pair in keys.windows(2) {
                    if order.compare(pair[0], pair[1]).is_ge() {
                        return Err(SaplingError::Corruption("separators out of order"));
                    }
                }
                for k in &keys {
                    if !in_bounds(k) {
                        return Err(SaplingError::Corruption("separator outside parent bounds"));
                    }
                }
                for c in 0..=n {
                    let lo = if c == 0 {
                        item.lo.clone()
                    } else {
                        Some(keys[c - 1].to_vec())
                    };
                    let hi = if c == n {
                        item.hi.clone()
                    } else {
                        Some(keys[c].to_vec())
                    };
                    stack.push(Pending {
                        page: internal::child(buf, c)?,
                        level: item.level + 1,
                        lo,
                        hi,
                    });
                }
                report.internal_pages += 1;
            }
            _ => return Err(SaplingError::Corruption("unexpected page kind inside a tree")),
        }
    }
    report.depth = deepest;
    if report.entries != tree.entries {
        return Err(SaplingError::Corruption("entry count disagrees with the tree"));
    }
    Ok(report)
}
