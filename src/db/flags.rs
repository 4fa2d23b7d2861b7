use std::ops::BitOr;

/// Access mode of a transaction.
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub enum TxnMode {
    /// Snapshot reads only.
    ReadOnly,
    /// The single writer.
    ReadWrite,
}

/// Modifiers for [`super::Txn::put_with`].
#[derive(Copy, Clone, Debug, Default, Eq, PartialEq)]
pub struct PutFlags(u32);

impl PutFlags {
    /// No modifiers.
    pub const NONE: PutFlags = PutFlags(0);
    /// Fail with `Exists` instead of replacing a present key.
    pub const NO_OVERWRITE: PutFlags = PutFlags(1);

    /// Whether every bit of `other` is set.
    pub const fn contains(self, other: PutFlags) -> bool {
        self.0 & other.0 == other.0
    }
}

impl BitOr for PutFlags {
    type Output = PutFlags;

    fn bitor(self, rhs: PutFlags) -> PutFlags {
        PutFlags(self.0 | rhs.0)
    }
}

/// Sub-database options for [`super::Db::dbi_open`].
#[derive(Copy, Clone, Debug, Default, Eq, PartialEq)]
pub struct DbiFlags(u32);

impl DbiFlags {
    /// Plain key/value tree.
    pub const NONE: DbiFlags = DbiFlags(0);
    /// Sorted duplicate values under one key.
    pub const DUPSORT: DbiFlags = DbiFlags(1);

    /// Whether every bit of `other` is set.
    pub const fn contains(self, other: DbiFlags) -> bool {
        self.0 & other.0 == other.0
    }
}

impl BitOr for DbiFlags {
    type Output = DbiFlags;

    fn bitor(self, rhs: DbiFlags) -> DbiFlags {
        DbiFlags(self.0 | rhs.0)
    }
}

/// Modifiers for [`super::Cursor::get_ttl`].
#[derive(Copy, Clone, Debug, Default, Eq, PartialEq)]
pub struct TtlFlags(u32);

impl TtlFlags {
    /// Report expired entries as absent and leave them in place.
    pub const NONE: TtlFlags = TtlFlags(0);
    /// On a write transaction, remove an expired entry when it is read.
    pub const LAZY_DELETE: TtlFlags = TtlFlags(1);

    /// Whether every bit of `other` is set.
    pub const fn contains(self, other: TtlFlags) -> bool {
        self.0 & other.0 == other.0
    }
}
