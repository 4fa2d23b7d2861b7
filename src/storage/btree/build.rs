#![forbid(unsafe_code)]
//! Bottom-up construction of a tree from entries already in stored-key order.
//!
//! Leaves are packed left to right until full. Each internal level then groups
//! the level below into runs of at least two children, choosing the largest
//! run a page can address while leaving a feasible grouping for the rest.

use tracing::debug;

use super::page::{self, internal, leaf, NewValue, INTERNAL_HEADER_LEN, SLOT_LEN};
use crate::primitives::pager::DbiRecord;
use crate::storage::cow::CowContext;
use crate::types::{PageNo, Result, SaplingError};

struct LevelNode {
    page: PageNo,
    min_key: Vec<u8>,
}

/// Builds a fresh tree holding `entries` (stored key, inline value) in order.
///
/// The caller guarantees ordering and that every cell fits inline.
pub fn build_tree<K, V>(ctx: &mut CowContext<'_>, entries: &[(K, V)]) -> Result<DbiRecord>
where
    K: AsRef<[u8]>,
    V: AsRef<[u8]>,
{
    if entries.is_empty() {
        return Ok(DbiRecord::default());
    }
    let mut level = pack_leaves(ctx, entries)?;
    let leaves = level.len();
    let mut height = 1;
    while level.len() > 1 {
        level = build_level(ctx, level)?;
        height += 1;
    }
    let root = level
        .pop()
        .map(|n| n.page)
        .ok_or(SaplingError::Corruption("bulk build produced no root"))?;
    debug!(entries = entries.len(), leaves, height, "bulk build finished");
    Ok(DbiRecord {
        root,
        entries: entries.len() as u64,
    })
}

fn fresh_leaf(ctx: &mut CowContext<'_>) -> Result<PageNo> {
    let pgno = ctx.alloc()?;
    leaf::init(ctx.pages.page_mut(pgno)?, pgno);
    Ok(pgno)
}

fn pack_leaves<K, V>(ctx: &mut CowContext<'_>, entries: &[(K, V)]) -> Result<Vec<LevelNode>>
where
    K: AsRef<[u8]>,
    V: AsRef<[u8]>,
{
    let mut level = Vec::new();
    let mut cur = fresh_leaf(ctx)?;
    level.push(LevelNode {
        page: cur,
        min_key: entries[0].0.as_ref().to_vec(),
    });
    for (k, v) in entries {
        let (k, v) = (k.as_ref(), v.as_ref());
        let buf = ctx.pages.page_mut(cur)?;
        let n = page::count(buf);
        if leaf::insert(buf, n, k, NewValue::Inline(v)).is_ok() {
            continue;
        }
        if n == 0 {
            return Err(SaplingError::Full("entry does not fit in an empty leaf"));
        }
        cur = fresh_leaf(ctx)?;
        level.push(LevelNode {
            page: cur,
            min_key: k.to_vec(),
        });
        leaf::insert(ctx.pages.page_mut(cur)?, 0, k, NewValue::Inline(v))
            .map_err(|_| SaplingError::Full("entry does not fit in an empty leaf"))?;
    }
    Ok(level)
}

/// Chooses run lengths for one internal level.
///
/// `caps[i]` is the most children a page starting at node `i` can address.
/// Returns `None` when no grouping with runs of at least two exists.
fn plan_groups(caps: &[usize]) -> Option<Vec<usize>> {
    let n = caps.len();
    let mut feasible = vec![false; n + 1];
    let mut choice = vec![0usize; n + 1];
    feasible[n] = true;
    for i in (0..n).rev() {
        let max_group = caps[i].min(n - i);
        for group in (2..=max_group).rev() {
            if feasible[i + group] {
                feasible[i] = true;
                choice[i] = group;
                break;
            }
        }
    }
    if !feasible[0] {
        return None;
    }
    let mut groups = Vec::new();
    let mut i = 0;
    while i < n {
        groups.push(choice[i]);
        i += choice[i];
    }
    Some(groups)
}

fn build_level(ctx: &mut CowContext<'_>, below: Vec<LevelNode>) -> Result<Vec<LevelNode>> {
    let usable = ctx.page_size() - INTERNAL_HEADER_LEN;
    let caps: Vec<usize> = (0..below.len())
        .map(|i| {
            let mut free = usable;
            let mut children = 1;
            for node in &below[i + 1..] {
                let need = SLOT_LEN + internal::cell_len(node.min_key.len());
                if need > free {
                    break;
                }
                free -= need;
                children += 1;
            }
            children
        })
        .collect();
    let groups =
        plan_groups(&caps).ok_or(SaplingError::Full("separators do not fit an internal level"))?;

    let mut out = Vec::with_capacity(groups.len());
    let mut nodes = below.into_iter();
    for group in groups {
        let pgno = ctx.alloc()?;
        let buf = ctx.pages.page_mut(pgno)?;
        internal::init(buf, pgno);
        let head = nodes
            .next()
            .ok_or(SaplingError::Corruption("bulk level plan overran its input"))?;
        internal::set_left(buf, head.page);
        for slot in 0..group - 1 {
            let node = nodes
                .next()
                .ok_or(SaplingError::Corruption("bulk level plan overran its input"))?;
            internal::insert(buf, slot, &node.min_key, node.page)
                .map_err(|_| SaplingError::Corruption("bulk level plan exceeded page capacity"))?;
        }
        out.push(LevelNode {
            page: pgno,
            min_key: head.min_key,
        });
    }
    Ok(out)
}
