#![forbid(unsafe_code)]
//! Identifiers, error kinds and page-level constants shared by every layer.

use std::fmt;

/// Checksum helpers used by the meta-page protocol.
pub mod checksum;

pub use checksum::{Checksum, XorFold};

/// Page number inside the page table.
#[derive(Copy, Clone, Eq, PartialEq, Ord, PartialOrd, Hash, Debug)]
pub struct PageNo(pub u32);

impl PageNo {
    /// Sentinel stored wherever "no page" is meant (empty root, end of chain).
    pub const INVALID: PageNo = PageNo(u32::MAX);

    /// Returns `true` unless this is the [`PageNo::INVALID`] sentinel.
    pub const fn is_valid(self) -> bool {
        self.0 != u32::MAX
    }

    /// Index into the page table.
    pub const fn index(self) -> usize {
        self.0 as usize
    }
}

impl fmt::Display for PageNo {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.is_valid() {
            write!(f, "{}", self.0)
        } else {
            f.write_str("invalid")
        }
    }
}

/// Monotonic commit counter. Read transactions are tagged with the value they observed.
pub type TxnId = u64;

/// Handle to a sub-database. DBI 0 always exists.
#[derive(Copy, Clone, Eq, PartialEq, Ord, PartialOrd, Hash, Debug, Default)]
pub struct Dbi(pub u32);

impl Dbi {
    /// The main sub-database created by `Db::open`.
    pub const MAIN: Dbi = Dbi(0);

    /// Index into per-DBI tables.
    pub const fn index(self) -> usize {
        self.0 as usize
    }
}

impl fmt::Display for Dbi {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Error kinds reported by the engine.
///
/// `NotFound` and `Exists` are expected outcomes the caller may branch on; the
/// transaction stays usable. Variants for which [`SaplingError::requires_abort`]
/// returns `true` leave the enclosing write transaction poisoned.
#[derive(thiserror::Error, Debug)]
pub enum SaplingError {
    /// Key or record absent.
    #[error("not found")]
    NotFound,
    /// Entry, value or callback output cannot fit.
    #[error("full: {0}")]
    Full(&'static str),
    /// Write attempted against a read-only snapshot.
    #[error("transaction is read-only")]
    ReadOnly,
    /// Writer contention or a metadata change attempted while transactions are open.
    #[error("busy: {0}")]
    Busy(&'static str),
    /// No-overwrite violation or duplicate registration.
    #[error("already exists")]
    Exists,
    /// Compare-and-swap mismatch.
    #[error("conflict: stored value does not match the expected value")]
    Conflict,
    /// Bad argument or unsupported combination of flags.
    #[error("invalid argument: {0}")]
    Invalid(&'static str),
    /// Structural damage found while decoding pages, meta slots or streams.
    #[error("corruption: {0}")]
    Corruption(&'static str),
    /// The page allocator refused to hand out a buffer.
    #[error("page allocation failed")]
    Alloc,
    /// Checkpoint or restore stream failure.
    #[error("IO: {0}")]
    Io(#[from] std::io::Error),
    /// Option parsing failure.
    #[error("config: {0}")]
    Config(String),
}

impl SaplingError {
    /// Returns `true` when the enclosing transaction cannot proceed safely.
    pub fn requires_abort(&self) -> bool {
        matches!(
            self,
            SaplingError::Corruption(_) | SaplingError::Alloc | SaplingError::Io(_)
        )
    }
}

/// Result alias used throughout the crate.
pub type Result<T> = std::result::Result<T, SaplingError>;

pub mod page {
    //! Page kinds and the header fields every page shares.

    use super::{Result, SaplingError};

    /// Byte offset of the kind tag.
    pub const KIND: usize = 0;
    /// Byte offset of the little-endian `u16` entry count.
    pub const COUNT: usize = 2;
    /// Byte offset of the little-endian `u32` self page number.
    pub const PAGE_NO: usize = 4;

    /// Smallest supported page size.
    pub const MIN_PAGE_SIZE: usize = 256;
    /// Largest supported page size; offsets inside a page are `u16`.
    pub const MAX_PAGE_SIZE: usize = u16::MAX as usize;
    /// Default page size for new databases.
    pub const DEFAULT_PAGE_SIZE: u32 = 4096;

    /// Kind tag stored in the first byte of every page.
    #[repr(u8)]
    #[derive(Copy, Clone, Debug, Eq, PartialEq)]
    pub enum PageKind {
        /// One of the two ping-pong meta slots.
        Meta = 0,
        /// Separator keys plus child page numbers.
        Internal = 1,
        /// Sorted key/value cells.
        Leaf = 2,
        /// One chunk of an oversized value.
        Overflow = 3,
    }

    impl PageKind {
        /// Decodes a kind tag.
        pub fn from_u8(value: u8) -> Result<Self> {
            match value {
                0 => Ok(Self::Meta),
                1 => Ok(Self::Internal),
                2 => Ok(Self::Leaf),
                3 => Ok(Self::Overflow),
                _ => Err(SaplingError::Corruption("unknown page kind")),
            }
        }
    }
}
