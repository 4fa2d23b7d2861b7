#![forbid(unsafe_code)]

/// Streaming checksum over a byte sequence.
pub trait Checksum {
    /// Clears accumulated state.
    fn reset(&mut self);
    /// Feeds more bytes.
    fn update(&mut self, bytes: &[u8]);
    /// Returns the checksum of everything fed since the last reset.
    fn finalize(&self) -> u32;
}

/// Seed mixed into every XOR fold so an all-zero page never validates.
pub const XOR_FOLD_SEED: u32 = 0xDEAD_BEEF;

/// XOR of all little-endian `u32` words, seeded with [`XOR_FOLD_SEED`].
///
/// Not cryptographic; it only detects torn or zeroed meta slots. Input that does
/// not end on a word boundary is zero-padded.
#[derive(Clone, Debug, Default)]
pub struct XorFold {
    acc: u32,
    pending: [u8; 4],
    pending_len: usize,
}

impl XorFold {
    fn fold_word(&mut self, word: [u8; 4]) {
        self.acc ^= u32::from_le_bytes(word);
    }
}

impl Checksum for XorFold {
    fn reset(&mut self) {
        *self = Self::default();
    }

    fn update(&mut self, mut bytes: &[u8]) {
        while self.pending_len > 0 && !bytes.is_empty() {
            self.pending[self.pending_len] = bytes[0];
            self.pending_len += 1;
            bytes = &bytes[1..];
            if self.pending_len == 4 {
                let word = self.pending;
                self.fold_word(word);
                self.pending_len = 0;
            }
        }
        let mut chunks = bytes.chunks_exact(4);
        for chunk in &mut chunks {
            self.fold_word([chunk[0], chunk[1], chunk[2], chunk[3]]);
        }
        for &b in chunks.remainder() {
            self.pending[self.pending_len] = b;
            self.pending_len += 1;
        }
    }

    fn finalize(&self) -> u32 {
        let mut acc = self.acc;
        if self.pending_len > 0 {
            let mut word = [0u8; 4];
            word[..self.pending_len].copy_from_slice(&self.pending[..self.pending_len]);
            acc ^= u32::from_le_bytes(word);
        }
        acc ^ XOR_FOLD_SEED
    }
}

/// One-shot XOR fold of `bytes`.
pub fn xor_fold(bytes: &[u8]) -> u32 {
    let mut c = XorFold::default();
    c.update(bytes);
    c.finalize()
}
