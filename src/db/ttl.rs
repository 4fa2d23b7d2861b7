//! Expiring keys tracked in a companion metadata DBI.
//!
//! The metadata DBI holds two row kinds per tracked key:
//! `[0x00 | key] -> expiry (u64 LE, ms)` for lookups and
//! `[0x01 | expiry (u64 BE) | key] -> ()` so a sweep can walk expiries in order.

use tracing::debug;

use super::transaction::Txn;
use crate::primitives::bytes::{le, ord};
use crate::storage::btree::page::MAX_KV_LEN;
use crate::types::{Dbi, Result, SaplingError};

const LOOKUP_TAG: u8 = 0x00;
const INDEX_TAG: u8 = 0x01;
const INDEX_OVERHEAD: usize = 1 + 8;

fn lookup_key(key: &[u8]) -> Vec<u8> {
    let mut out = Vec::with_capacity(1 + key.len());
    out.push(LOOKUP_TAG);
    out.extend_from_slice(key);
    out
}

fn index_key(key: &[u8], expiry: u64) -> Vec<u8> {
    let mut out = Vec::with_capacity(INDEX_OVERHEAD + key.len());
    out.push(INDEX_TAG);
    ord::put_u64_be(&mut out, expiry);
    out.extend_from_slice(key);
    out
}

fn decode_expiry(raw: &[u8]) -> Result<u64> {
    if raw.len() != 8 {
        return Err(SaplingError::Corruption("TTL lookup row is not eight bytes"));
    }
    Ok(le::read_u64(raw, 0))
}

/// Where a bounded sweep stopped, so the next batch skips rows already walked.
///
/// Start from `SweepCheckpoint::default()`. The position is dropped once a
/// sweep runs out of expired rows, so the following batch rescans from the
/// earliest expiry.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct SweepCheckpoint {
    resume_at: Option<Vec<u8>>,
}

impl SweepCheckpoint {
    /// Forgets the saved position.
    pub fn clear(&mut self) {
        self.resume_at = None;
    }

    /// Whether a later sweep would resume mid-index.
    pub fn is_set(&self) -> bool {
        self.resume_at.is_some()
    }
}

/// State of one tracked key at a point in time.
pub(crate) enum Liveness {
    Untracked,
    Live,
    Expired(u64),
}

fn ignore_missing(result: Result<()>) -> Result<bool> {
    match result {
        Ok(()) => Ok(true),
        Err(SaplingError::NotFound) => Ok(false),
        Err(err) => Err(err),
    }
}

impl<'a> Txn<'a> {
    pub(crate) fn check_ttl_dbis(&self, data: Dbi, ttl: Dbi) -> Result<()> {
        let d = self.check_dbi(data)?;
        let t = self.check_dbi(ttl)?;
        if d == t {
            return Err(SaplingError::Invalid("TTL metadata needs its own DBI"));
        }
        if self.is_dupsort(d) || self.is_dupsort(t) {
            return Err(SaplingError::Invalid("TTL helpers do not support DUPSORT DBIs"));
        }
        Ok(())
    }

    /// Stores `key` in `data` and records that it expires at `expires_at_ms`.
    ///
    /// A previous expiry for the key is replaced.
    pub fn put_ttl(
        &mut self,
        data: Dbi,
        ttl: Dbi,
        key: &[u8],
        value: &[u8],
        expires_at_ms: u64,
    ) -> Result<()> {
        self.check_write()?;
        self.check_ttl_dbis(data, ttl)?;
        if key.len() > MAX_KV_LEN - INDEX_OVERHEAD {
            return Err(SaplingError::Full("key too long for TTL tracking"));
        }
        let lookup = lookup_key(key);
        self.nested(|child| {
            if let Some(raw) = child.get(ttl, &lookup)? {
                let old = decode_expiry(&raw)?;
                ignore_missing(child.del(ttl, &index_key(key, old)))?;
            }
            child.put(data, key, value)?;
            child.put(ttl, &lookup, &expires_at_ms.to_le_bytes())?;
            child.put(ttl, &index_key(key, expires_at_ms), &[])
        })
    }

    /// Reads `key` from `data` unless it is untracked or expired at `now_ms`.
    pub fn get_ttl(&self, data: Dbi, ttl: Dbi, key: &[u8], now_ms: u64) -> Result<Option<Vec<u8>>> {
        self.check_ttl_dbis(data, ttl)?;
        match self.liveness(ttl, key, now_ms)? {
            Liveness::Live => self.get(data, key),
            Liveness::Untracked | Liveness::Expired(_) => Ok(None),
        }
    }

    pub(crate) fn liveness(&self, ttl: Dbi, key: &[u8], now_ms: u64) -> Result<Liveness> {
        let Some(raw) = self.get(ttl, &lookup_key(key))? else {
            return Ok(Liveness::Untracked);
        };
        let expiry = decode_expiry(&raw)?;
        Ok(if expiry <= now_ms {
            Liveness::Expired(expiry)
        } else {
            Liveness::Live
        })
    }

    /// Drops `key` from `data` along with both of its metadata rows.
    ///
    /// Returns whether any metadata row was still present.
    pub(crate) fn remove_tracked(&mut self, data: Dbi, ttl: Dbi, key: &[u8], expiry: u64) -> Result<bool> {
        ignore_missing(self.del(data, key))?;
        let lookup_gone = ignore_missing(self.del(ttl, &lookup_key(key)))?;
        let index_gone = ignore_missing(self.del(ttl, &index_key(key, expiry)))?;
        Ok(lookup_gone || index_gone)
    }

    /// Removes every key expired at `now_ms`; returns how many were removed.
    pub fn sweep_ttl(&mut self, data: Dbi, ttl: Dbi, now_ms: u64) -> Result<u64> {
        self.sweep_ttl_limit(data, ttl, now_ms, usize::MAX)
    }

    /// Like [`Txn::sweep_ttl`] but stops after `max` keys; `max == 0` does nothing.
    pub fn sweep_ttl_limit(&mut self, data: Dbi, ttl: Dbi, now_ms: u64, max: usize) -> Result<u64> {
        self.sweep_ttl_from(data, ttl, now_ms, max, &mut SweepCheckpoint::default())
    }

    /// Bounded sweep that resumes where the previous batch sharing
    /// `checkpoint` stopped instead of rescanning the index from its start.
    ///
    /// The checkpoint only advances when the sweep succeeds.
    pub fn sweep_ttl_from(
        &mut self,
        data: Dbi,
        ttl: Dbi,
        now_ms: u64,
        max: usize,
        checkpoint: &mut SweepCheckpoint,
    ) -> Result<u64> {
        self.check_write()?;
        self.check_ttl_dbis(data, ttl)?;
        if max == 0 {
            return Ok(0);
        }
        let start = checkpoint.resume_at.clone();
        let (removed, resume_at) = self.nested(|child| {
            let expired = child.collect_expired(ttl, now_ms, max, start.as_deref())?;
            let resume_at = match expired.last() {
                Some((key, expiry)) if expired.len() == max => Some(index_key(key, *expiry)),
                _ => None,
            };
            let mut removed = 0u64;
            for (key, expiry) in expired {
                if child.remove_tracked(data, ttl, &key, expiry)? {
                    removed += 1;
                }
            }
            Ok((removed, resume_at))
        })?;
        checkpoint.resume_at = resume_at;
        if removed > 0 {
            debug!(dbi = %data, removed, now_ms, "expired keys swept");
        }
        Ok(removed)
    }

    fn collect_expired(
        &self,
        ttl: Dbi,
        now_ms: u64,
        max: usize,
        start: Option<&[u8]>,
    ) -> Result<Vec<(Vec<u8>, u64)>> {
        let mut out = Vec::new();
        let mut cur = self.cursor(ttl)?;
        let mut positioned = cur.seek(start.unwrap_or(&[INDEX_TAG]))?;
        while positioned && out.len() < max {
            let Some(row) = cur.key()? else {
                break;
            };
            if row.len() < INDEX_OVERHEAD || row[0] != INDEX_TAG {
                break;
            }
            let Some(expiry) = ord::get_u64_be(&row[1..]) else {
                break;
            };
            if expiry > now_ms {
                break;
            }
            out.push((row[INDEX_OVERHEAD..].to_vec(), expiry));
            positioned = cur.next()?;
        }
        Ok(out)
    }
}
