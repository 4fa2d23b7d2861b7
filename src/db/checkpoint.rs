//! Whole-database snapshots as a flat stream of page images.
//!
//! Stream layout: a 16-byte header of little-endian `u32`s
//! `[magic][version][page_size][page_count]`, then `page_count` raw pages in
//! page-number order.

use std::io::{Read, Write};

use tracing::{info, warn};

use super::database::{collect_garbage, Db, DbiSlot};
use crate::primitives::bytes::le;
use crate::primitives::pager::{init_meta, load_best, FreeList, Meta, META_SLOTS};
use crate::types::{PageNo, Result, SaplingError};

/// Stream magic, `"SCKP"` read as a little-endian word.
pub const CHECKPOINT_MAGIC: u32 = 0x5343_4B50;
/// Stream format version.
pub const CHECKPOINT_VERSION: u32 = 1;

const HEADER_LEN: usize = 16;

impl Db {
    /// Writes every committed page to `out` and returns the bytes written.
    ///
    /// Fails with `Busy` while any transaction is open. Deferred pages are
    /// recycled first and both meta images are re-encoded from the committed
    /// state, so the stream restores to exactly what is visible now.
    pub fn checkpoint<W: Write>(&self, mut out: W) -> Result<u64> {
        let mut state = self.state.lock();
        self.ensure_idle(&state)?;
        let readers = self.readers.lock();
        let mut pages = self.pages.write();
        collect_garbage(&mut state, &readers, &mut pages)?;

        let meta = state.meta();
        let mut slot0 = pages.fresh_buffer()?;
        let mut slot1 = pages.fresh_buffer()?;
        init_meta(&mut slot0, &mut slot1, &meta)?;

        let mut header = [0u8; HEADER_LEN];
        le::write_u32(&mut header, 0, CHECKPOINT_MAGIC);
        le::write_u32(&mut header, 4, CHECKPOINT_VERSION);
        le::write_u32(&mut header, 8, self.page_size as u32);
        le::write_u32(&mut header, 12, meta.num_pages);
        out.write_all(&header)?;
        let mut written = HEADER_LEN as u64;
        for i in 0..meta.num_pages {
            let image: &[u8] = match i {
                0 => &slot0[..],
                1 => &slot1[..],
                _ => pages.page(PageNo(i))?,
            };
            out.write_all(image)?;
            written += image.len() as u64;
        }
        out.flush()?;
        pages.release_detached(vec![slot0, slot1]);
        info!(
            txnid = meta.txnid,
            num_pages = meta.num_pages,
            bytes = written,
            "checkpoint written"
        );
        Ok(written)
    }

    /// Replaces the whole database with a stream produced by [`Db::checkpoint`].
    ///
    /// The stream is read and validated completely before anything changes;
    /// on any failure the current contents stay in place. DBI comparators and
    /// watches registered on this handle are kept.
    pub fn restore<R: Read>(&self, mut input: R) -> Result<()> {
        let mut state = self.state.lock();
        self.ensure_idle(&state)?;

        let mut header = [0u8; HEADER_LEN];
        input.read_exact(&mut header)?;
        let magic = le::read_u32(&header, 0);
        let version = le::read_u32(&header, 4);
        let page_size = le::read_u32(&header, 8) as usize;
        let npages = le::read_u32(&header, 12);
        if magic != CHECKPOINT_MAGIC || version != CHECKPOINT_VERSION {
            warn!(magic, version, "restore rejected: not a checkpoint stream");
            return Err(SaplingError::Invalid("not a checkpoint stream"));
        }
        if page_size != self.page_size {
            warn!(page_size, expected = self.page_size, "restore rejected: page size differs");
            return Err(SaplingError::Invalid("checkpoint page size differs"));
        }
        if (npages as usize) < META_SLOTS.len() {
            warn!(npages, "restore rejected: stream lacks meta pages");
            return Err(SaplingError::Invalid("checkpoint holds fewer than two pages"));
        }

        let mut pages = self.pages.write();
        let mut images = Vec::new();
        let loaded = (0..npages).try_for_each(|_| {
            let mut buf = pages.fresh_buffer()?;
            let read = input.read_exact(&mut buf);
            images.push(buf);
            read.map_err(SaplingError::from)
        });
        let meta = loaded.and_then(|()| self.validate_images(&images, npages));
        let meta = match meta {
            Ok(meta) => meta,
            Err(err) => {
                warn!(%err, npages, "restore rejected");
                pages.release_detached(images);
                return Err(err);
            }
        };

        let previous = pages.replace_all(images);
        pages.release_detached(previous);
        drop(pages);

        let dbis = meta
            .dbis
            .iter()
            .enumerate()
            .map(|(i, record)| DbiSlot {
                record: *record,
                order: state
                    .dbis
                    .get(i)
                    .map(|slot| slot.order.clone())
                    .unwrap_or_else(|| self.default_order()),
            })
            .collect();
        state.txnid = meta.txnid;
        state.free = FreeList::from_head(meta.free_head);
        state.num_pages = meta.num_pages;
        state.dbis = dbis;
        state.deferred.clear();
        info!(
            txnid = meta.txnid,
            num_pages = meta.num_pages,
            dbis = meta.dbis.len(),
            "checkpoint restored"
        );
        Ok(())
    }

    fn validate_images(&self, images: &[Box<[u8]>], npages: u32) -> Result<Meta> {
        let (Some(slot0), Some(slot1)) = (images.first(), images.get(1)) else {
            return Err(SaplingError::Corruption("checkpoint lacks meta pages"));
        };
        let meta = load_best(slot0, slot1)?;
        if meta.num_pages < META_SLOTS.len() as u32 || meta.num_pages > npages {
            return Err(SaplingError::Corruption("meta page count disagrees with the stream"));
        }
        if meta.dbis.len() > self.max_dbis {
            return Err(SaplingError::Corruption("checkpoint has more DBIs than this handle allows"));
        }
        let in_range = |pgno: PageNo| !pgno.is_valid() || pgno.0 < meta.num_pages;
        if !in_range(meta.free_head) || !meta.dbis.iter().all(|d| in_range(d.root)) {
            return Err(SaplingError::Corruption("meta references pages beyond the stream"));
        }
        Ok(meta)
    }
}
