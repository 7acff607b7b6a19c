//! Entropy Pool.
//!
//! Fixed-size byte buffer that accumulates entropy by XOR and tracks a quality
//! score in `[0, 100]`.
//!
//! # Design
//! - **Wrap-Around Mixing**: Injected bytes advance a write index; when it reaches
//!   the end of the pool the whole pool is mixed and the index restarts at 0.
//! - **Explicit Quality**: Raw byte injection never changes quality. Only sources
//!   with a declared quality credit it, through [`EntropyPool::add_quality`].
//! - **Zeroization**: Pool contents are wiped on drop.
//!
//! The pool never leaves the crate; only masked output blocks do.

pub(crate) mod mix;

use zeroize::{Zeroize, ZeroizeOnDrop, Zeroizing};

use crate::error::CsprngError;
use mix::Mixer;

/// Nominal pool size.
pub const POOL_SIZE: usize = 256;

/// Allocated pool length: `POOL_SIZE` rounded up to whole SHA-1 blocks.
pub const ALLOC_SIZE: usize = 260;

/// Quality at which the pool is considered fully seeded.
pub const MAX_QUALITY: f64 = 100.0;

/// The entropy pool.
#[derive(Zeroize, ZeroizeOnDrop)]
pub struct EntropyPool {
    bytes: [u8; ALLOC_SIZE],
    index: usize,
    quality: f64,
    mix_count: u64,
    #[zeroize(skip)]
    mixer: Mixer,
}

impl EntropyPool {
    /// Creates an all-zero pool with quality 0.
    pub fn new() -> Self {
        Self {
            bytes: [0u8; ALLOC_SIZE],
            index: 0,
            quality: 0.0,
            mix_count: 0,
            mixer: Mixer::new(),
        }
    }

    /// XORs a single byte into the pool. Does not change quality.
    pub fn add_byte(&mut self, b: u8) {
        self.bytes[self.index] ^= b;
        self.index += 1;
        if self.index == ALLOC_SIZE {
            self.mix();
            self.index = 0;
        }
    }

    /// XORs `buf[offset..offset + length]` into the pool. Does not change quality.
    ///
    /// # Errors
    /// * `CsprngError::IndexOutOfRange` if the range does not fit `buf`.
    pub fn add_bytes(&mut self, buf: &[u8], offset: usize, length: usize) -> Result<(), CsprngError> {
        let end = offset.checked_add(length).ok_or(CsprngError::IndexOutOfRange)?;
        let chunk = buf.get(offset..end).ok_or(CsprngError::IndexOutOfRange)?;
        for &b in chunk {
            self.add_byte(b);
        }
        Ok(())
    }

    /// XORs all of `buf` into the pool.
    pub fn absorb(&mut self, buf: &[u8]) {
        for &b in buf {
            self.add_byte(b);
        }
    }

    /// Credits `quality` to the pool.
    ///
    /// Saturates at [`MAX_QUALITY`]; negative or non-finite credits are ignored so
    /// the running total never decreases here.
    pub fn add_quality(&mut self, quality: f64) {
        if !quality.is_finite() || quality <= 0.0 {
            return;
        }
        if self.quality < MAX_QUALITY {
            self.quality = (self.quality + quality).min(MAX_QUALITY);
        }
    }

    /// Current quality in `[0, 100]`.
    pub fn quality(&self) -> f64 {
        self.quality
    }

    /// Returns true once the pool has reached full quality.
    pub fn is_seeded(&self) -> bool {
        self.quality >= MAX_QUALITY
    }

    /// Drops quality to 0, forcing a new slow poll.
    pub fn reset_quality(&mut self) {
        self.quality = 0.0;
    }

    /// Mixes the live pool once.
    pub fn mix(&mut self) {
        self.mixer.mix(&mut self.bytes);
        self.mix_count += 1;
    }

    /// Number of mix passes applied to the live pool so far.
    pub fn mix_count(&self) -> u64 {
        self.mix_count
    }

    /// Mixes a buffer other than the live pool with the pool's mixer.
    pub(crate) fn mix_external(&mut self, buf: &mut [u8]) {
        self.mixer.mix(buf);
    }

    pub(crate) fn bytes(&self) -> &[u8; ALLOC_SIZE] {
        &self.bytes
    }

    pub(crate) fn bytes_mut(&mut self) -> &mut [u8; ALLOC_SIZE] {
        &mut self.bytes
    }

    /// Working copy with every byte complemented.
    pub(crate) fn complement(&self) -> Zeroizing<[u8; ALLOC_SIZE]> {
        let mut export = Zeroizing::new([0u8; ALLOC_SIZE]);
        for (dst, src) in export.iter_mut().zip(self.bytes.iter()) {
            *dst = src ^ 0xFF;
        }
        export
    }
}

impl Default for EntropyPool {
    fn default() -> Self {
        Self::new()
    }
}
