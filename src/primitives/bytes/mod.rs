#![forbid(unsafe_code)]
//! Fixed-width integer encoders shared by the page codec, meta slots and TTL keys.
//!
//! Callers are responsible for bounds; every page field lives at a fixed offset
//! well inside the minimum page size.

pub mod le {
    //! Little-endian fields of the on-disk format.

    /// Reads a `u16` at `off`.
    #[inline]
    pub fn read_u16(buf: &[u8], off: usize) -> u16 {
        u16::from_le_bytes([buf[off], buf[off + 1]])
    }

    /// Writes a `u16` at `off`.
    #[inline]
    pub fn write_u16(buf: &mut [u8], off: usize, v: u16) {
        buf[off..off + 2].copy_from_slice(&v.to_le_bytes());
    }

    /// Reads a `u32` at `off`.
    #[inline]
    pub fn read_u32(buf: &[u8], off: usize) -> u32 {
        u32::from_le_bytes([buf[off], buf[off + 1], buf[off + 2], buf[off + 3]])
    }

    /// Writes a `u32` at `off`.
    #[inline]
    pub fn write_u32(buf: &mut [u8], off: usize, v: u32) {
        buf[off..off + 4].copy_from_slice(&v.to_le_bytes());
    }

    /// Reads a `u64` at `off`.
    #[inline]
    pub fn read_u64(buf: &[u8], off: usize) -> u64 {
        let mut raw = [0u8; 8];
        raw.copy_from_slice(&buf[off..off + 8]);
        u64::from_le_bytes(raw)
    }

    /// Writes a `u64` at `off`.
    #[inline]
    pub fn write_u64(buf: &mut [u8], off: usize, v: u64) {
        buf[off..off + 8].copy_from_slice(&v.to_le_bytes());
    }
}

pub mod ord {
    //! Order-preserving encoders for keys that must sort numerically.

    const U64_LEN: usize = core::mem::size_of::<u64>();

    /// Big-endian encoding for lexicographic order preservation.
    pub fn put_u64_be(dst: &mut Vec<u8>, v: u64) {
        dst.extend_from_slice(&v.to_be_bytes());
    }

    /// Decodes a big-endian `u64`, or `None` when `src` is shorter than eight bytes.
    pub fn get_u64_be(src: &[u8]) -> Option<u64> {
        let head = src.get(..U64_LEN)?;
        let mut raw = [0u8; U64_LEN];
        raw.copy_from_slice(head);
        Some(u64::from_be_bytes(raw))
    }
}
