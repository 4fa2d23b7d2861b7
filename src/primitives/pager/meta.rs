use crate::primitives::bytes::le;
use crate::types::{checksum::xor_fold, PageNo, Result, SaplingError, TxnId};

/// Magic tag at the start of a valid meta slot ("SAPT" little-endian).
pub const META_MAGIC: u32 = 0x5341_5054;
/// Meta layout version.
pub const META_VERSION: u32 = 2;
/// Page numbers of the two ping-pong meta slots.
pub const META_SLOTS: [PageNo; 2] = [PageNo(0), PageNo(1)];

const MAGIC: usize = 0;
const VERSION: usize = 4;
const TXNID: usize = 8;
const FREE_HEAD: usize = 16;
const NUM_PAGES: usize = 20;
const NUM_DBIS: usize = 24;
const DBIS_START: usize = 28;
const DBI_RECORD_LEN: usize = 12;
const CHECKSUM_LEN: usize = 4;

/// Hard ceiling on sub-databases regardless of page size.
pub const MAX_DBIS: usize = 32;

/// Number of DBI records a meta slot of `page_size` bytes can hold.
pub fn max_dbis_for_page_size(page_size: usize) -> usize {
    (page_size.saturating_sub(DBIS_START + CHECKSUM_LEN) / DBI_RECORD_LEN).min(MAX_DBIS)
}

/// Durable root and entry count of one sub-database.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct DbiRecord {
    /// Root page, or [`PageNo::INVALID`] for an empty tree.
    pub root: PageNo,
    /// Number of entries stored in the tree.
    pub entries: u64,
}

impl Default for DbiRecord {
    fn default() -> Self {
        Self {
            root: PageNo::INVALID,
            entries: 0,
        }
    }
}

/// Decoded contents of a meta slot.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Meta {
    /// Commit counter of the last published transaction.
    pub txnid: TxnId,
    /// Head of the recycled-page chain.
    pub free_head: PageNo,
    /// Number of pages in the page table.
    pub num_pages: u32,
    /// Per-DBI roots; never empty.
    pub dbis: Vec<DbiRecord>,
}

/// Encodes `meta` into the slot that currently holds the older txnid.
///
/// Slot 0 is only overwritten when slot 1 is strictly newer, so a torn write
/// always leaves the newest published state intact.
pub fn write_meta(slot0: &mut [u8], slot1: &mut [u8], meta: &Meta) -> Result<()> {
    let t0 = le::read_u64(slot0, TXNID);
    let t1 = le::read_u64(slot1, TXNID);
    let dst = if t1 > t0 { slot0 } else { slot1 };
    encode(dst, meta)
}

/// Encodes `meta` into both slots, as done for a fresh database or a
/// checkpoint image.
pub fn init_meta(slot0: &mut [u8], slot1: &mut [u8], meta: &Meta) -> Result<()> {
    encode(slot0, meta)?;
    encode(slot1, meta)
}

fn encode(dst: &mut [u8], meta: &Meta) -> Result<()> {
    let max = max_dbis_for_page_size(dst.len());
    if meta.dbis.is_empty() || meta.dbis.len() > max {
        return Err(SaplingError::Invalid("DBI count does not fit in a meta slot"));
    }
    dst.fill(0);
    le::write_u32(dst, MAGIC, META_MAGIC);
    le::write_u32(dst, VERSION, META_VERSION);
    le::write_u64(dst, TXNID, meta.txnid);
    le::write_u32(dst, FREE_HEAD, meta.free_head.0);
    le::write_u32(dst, NUM_PAGES, meta.num_pages);
    le::write_u32(dst, NUM_DBIS, meta.dbis.len() as u32);
    let mut off = DBIS_START;
    for rec in &meta.dbis {
        le::write_u32(dst, off, rec.root.0);
        le::write_u64(dst, off + 4, rec.entries);
        off += DBI_RECORD_LEN;
    }
    let sum = xor_fold(&dst[..off]);
    le::write_u32(dst, off, sum);
    Ok(())
}

fn decode(src: &[u8]) -> Result<Meta> {
    if le::read_u32(src, MAGIC) != META_MAGIC {
        return Err(SaplingError::Corruption("meta slot magic mismatch"));
    }
    if le::read_u32(src, VERSION) != META_VERSION {
        return Err(SaplingError::Corruption("unsupported meta version"));
    }
    let nd = le::read_u32(src, NUM_DBIS) as usize;
    if nd == 0 || nd > max_dbis_for_page_size(src.len()) {
        return Err(SaplingError::Corruption("meta slot DBI count out of range"));
    }
    let cpos = DBIS_START + nd * DBI_RECORD_LEN;
    if cpos + CHECKSUM_LEN > src.len() {
        return Err(SaplingError::Corruption("meta slot checksum beyond page"));
    }
    if le::read_u32(src, cpos) != xor_fold(&src[..cpos]) {
        return Err(SaplingError::Corruption("meta slot checksum mismatch"));
    }
    let dbis = (0..nd)
        .map(|i| {
            let off = DBIS_START + i * DBI_RECORD_LEN;
            DbiRecord {
                root: PageNo(le::read_u32(src, off)),
                entries: le::read_u64(src, off + 4),
            }
        })
        .collect();
    Ok(Meta {
        txnid: le::read_u64(src, TXNID),
        free_head: PageNo(le::read_u32(src, FREE_HEAD)),
        num_pages: le::read_u32(src, NUM_PAGES),
        dbis,
    })
}

/// Picks the valid slot with the highest txnid; ties go to slot 0.
pub fn load_best(slot0: &[u8], slot1: &[u8]) -> Result<Meta> {
    match (decode(slot0), decode(slot1)) {
        (Ok(m0), Ok(m1)) => Ok(if m0.txnid >= m1.txnid { m0 } else { m1 }),
        (Ok(m0), Err(_)) => Ok(m0),
        (Err(_), Ok(m1)) => Ok(m1),
        (Err(e), Err(_)) => Err(e),
    }
}
