//! Pool Mixing Function.
//!
//! One-way mixing of a byte pool with a cryptographic hash. Every `H`-byte block
//! (H = digest size) is replaced by the hash of the preceding block and the next
//! 64 bytes, both windows wrapping around the buffer. Because each block is
//! rewritten in order, the previous block is already mixed when the next one is
//! hashed, so one pass carries entropy across the whole pool.

use sha1::digest::FixedOutputReset;
use sha1::{Digest, Sha1};

/// Bytes hashed after the preceding block.
pub const LOOKAHEAD: usize = 64;

/// Hash-driven pool mixer.
pub struct Mixer<D = Sha1> {
    hasher: D,
}

impl<D: Digest + FixedOutputReset> Mixer<D> {
    /// Creates a mixer backed by a fresh digest instance.
    pub fn new() -> Self {
        Self { hasher: D::new() }
    }

    /// Digest size in bytes; also the block stride of [`Mixer::mix`].
    pub fn block_size(&self) -> usize {
        <D as Digest>::output_size()
    }

    /// Mixes `buf` in place.
    ///
    /// `buf` must hold at least `LOOKAHEAD` bytes and one digest block; the
    /// pool and its exported copies are always `ALLOC_SIZE` long.
    pub fn mix(&mut self, buf: &mut [u8]) {
        let h = self.block_size();
        let len = buf.len();
        debug_assert!(len >= LOOKAHEAD && len >= h);

        let mut i = 0;
        while i < len {
            if i == 0 {
                Digest::update(&mut self.hasher, &buf[len - h..]);
            } else {
                Digest::update(&mut self.hasher, &buf[i - h..i]);
            }

            if i + LOOKAHEAD < len {
                Digest::update(&mut self.hasher, &buf[i..i + LOOKAHEAD]);
            } else {
                let tail = len - i;
                Digest::update(&mut self.hasher, &buf[i..]);
                Digest::update(&mut self.hasher, &buf[..LOOKAHEAD - tail]);
            }

            let digest = self.hasher.finalize_reset();
            let n = h.min(len - i);
            buf[i..i + n].copy_from_slice(&digest[..n]);
            i += h;
        }
    }
}

impl<D: Digest + FixedOutputReset> Default for Mixer<D> {
    fn default() -> Self {
        Self::new()
    }
}
