#![forbid(unsafe_code)]
//! Key and value ordering per sub-database, plus the DUPSORT composite-key codec.
//!
//! A DUPSORT tree stores each `(key, value)` pair as the composite key
//! `[key_len:u32 LE][key][value]` with an empty cell value. Composites are
//! ordered by the key comparator on the key part, then the value comparator on
//! the value part.

use std::cmp::Ordering;
use std::fmt;
use std::sync::Arc;

use crate::primitives::bytes::le;
use crate::storage::btree::page::MAX_KV_LEN;
use crate::types::{Result, SaplingError};

/// Signature of a user-supplied total order over byte strings.
pub type CompareFn = dyn Fn(&[u8], &[u8]) -> Ordering + Send + Sync;

/// Shareable comparator; the default is bytewise with shorter-is-less on ties.
#[derive(Clone, Default)]
pub struct Comparator {
    custom: Option<Arc<CompareFn>>,
}

impl Comparator {
    /// Bytewise lexicographic order.
    pub fn lexicographic() -> Self {
        Self::default()
    }

    /// Wraps a caller-provided total order.
    pub fn new<F>(f: F) -> Self
    where
        F: Fn(&[u8], &[u8]) -> Ordering + Send + Sync + 'static,
    {
        Self {
            custom: Some(Arc::new(f)),
        }
    }

    /// Compares `a` with `b`.
    #[inline]
    pub fn compare(&self, a: &[u8], b: &[u8]) -> Ordering {
        match &self.custom {
            Some(f) => f(a, b),
            None => a.cmp(b),
        }
    }

    /// Returns `true` for the built-in bytewise order.
    pub fn is_default(&self) -> bool {
        self.custom.is_none()
    }
}

impl fmt::Debug for Comparator {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(if self.custom.is_some() {
            "Comparator(custom)"
        } else {
            "Comparator(lexicographic)"
        })
    }
}

/// Ordering policy of one sub-database.
#[derive(Clone, Debug, Default)]
pub struct TreeOrder {
    /// Orders user keys.
    pub key: Comparator,
    /// Orders duplicate values; only consulted when `dupsort` is set.
    pub value: Comparator,
    /// Whether stored keys are composites.
    pub dupsort: bool,
}

impl TreeOrder {
    /// Compares two stored keys.
    pub fn compare(&self, a: &[u8], b: &[u8]) -> Ordering {
        if !self.dupsort {
            return self.key.compare(a, b);
        }
        let (ak, av) = composite::split(a);
        let (bk, bv) = composite::split(b);
        self.key
            .compare(ak, bk)
            .then_with(|| self.value.compare(av, bv))
    }

    /// Compares the user-key part of two stored keys.
    pub fn compare_user_keys(&self, stored: &[u8], user: &[u8]) -> Ordering {
        self.key.compare(self.user_key(stored), user)
    }

    /// User-key part of a stored key.
    pub fn user_key<'a>(&self, stored: &'a [u8]) -> &'a [u8] {
        if self.dupsort {
            composite::split(stored).0
        } else {
            stored
        }
    }

    /// Closure form of [`TreeOrder::compare`] for the page search routines.
    pub fn stored(&self) -> impl Fn(&[u8], &[u8]) -> Ordering + '_ {
        move |a, b| self.compare(a, b)
    }
}

pub mod composite {
    //! `[key_len:u32 LE][key][value]` encoding of DUPSORT entries.

    use super::*;

    const LEN_PREFIX: usize = 4;

    /// Encodes a composite key, failing with `Full` above the key size ceiling.
    pub fn encode(key: &[u8], value: &[u8]) -> Result<Vec<u8>> {
        let total = LEN_PREFIX + key.len() + value.len();
        if total > MAX_KV_LEN {
            return Err(SaplingError::Full("composite key exceeds 65535 bytes"));
        }
        let mut out = Vec::with_capacity(total);
        out.extend_from_slice(&(key.len() as u32).to_le_bytes());
        out.extend_from_slice(key);
        out.extend_from_slice(value);
        Ok(out)
    }

    /// Splits a composite into `(key, value)`.
    ///
    /// A prefix claiming more bytes than present is clamped so a damaged
    /// composite still yields slices.
    pub fn split(stored: &[u8]) -> (&[u8], &[u8]) {
        if stored.len() < LEN_PREFIX {
            return (stored, &[]);
        }
        let klen = (le::read_u32(stored, 0) as usize).min(stored.len() - LEN_PREFIX);
        let body = &stored[LEN_PREFIX..];
        body.split_at(klen)
    }
}
