//! X9.17-style Output Whitening.
//!
//! A 16-byte secondary pool chained through AES-256. Each pass walks the target
//! buffer in cipher-block chunks: the chunk is folded into the secondary pool,
//! the pool is encrypted and written back over the chunk, then encrypted once
//! more so the written value is never the chaining state.
//!
//! The key is taken from the main pool and the state is rekeyed after
//! [`X917_LIFETIME`] chunks.

use aes::cipher::generic_array::GenericArray;
use aes::cipher::{BlockEncrypt, KeyInit};
use aes::Aes256;
use zeroize::{Zeroize, ZeroizeOnDrop};

/// Secondary pool size (the AES block size).
pub const X917_POOL_SIZE: usize = 16;

/// Chunks processed before a forced rekey.
pub const X917_LIFETIME: usize = 8192;

/// AES-256 key length.
pub const KEY_SIZE: usize = 32;

/// Cipher-driven whitening state.
#[derive(Zeroize, ZeroizeOnDrop)]
pub(crate) struct X917State {
    pool: [u8; X917_POOL_SIZE],
    iterations: usize,
    initialized: bool,
    #[zeroize(skip)]
    cipher: Aes256,
}

impl X917State {
    /// Uninitialized state. The placeholder cipher is replaced by the first
    /// [`X917State::rekey`] before any output is produced.
    pub fn new() -> Self {
        Self {
            pool: [0u8; X917_POOL_SIZE],
            iterations: 0,
            initialized: false,
            cipher: Aes256::new(&GenericArray::from([0u8; KEY_SIZE])),
        }
    }

    pub fn is_initialized(&self) -> bool {
        self.initialized
    }

    pub fn iterations(&self) -> usize {
        self.iterations
    }

    /// True when the cipher must be (re)keyed before the next block.
    pub fn needs_rekey(&self) -> bool {
        !self.initialized || self.iterations >= X917_LIFETIME
    }

    /// Installs a fresh key. The key is typed as exactly 32 bytes, so cipher
    /// initialization cannot fail.
    pub fn rekey(&mut self, key: &[u8; KEY_SIZE]) {
        self.cipher = Aes256::new(&GenericArray::from(*key));
    }

    /// Marks the state keyed and restarts the lifetime counter.
    pub fn mark_initialized(&mut self) {
        self.initialized = true;
        self.iterations = 0;
    }

    /// Runs one derivation pass over `buf`.
    pub fn generate(&mut self, buf: &mut [u8]) {
        for chunk in buf.chunks_mut(X917_POOL_SIZE) {
            for (p, c) in self.pool.iter_mut().zip(chunk.iter()) {
                *p ^= *c;
            }
            self.encrypt_pool();
            chunk.copy_from_slice(&self.pool[..chunk.len()]);
            self.encrypt_pool();
            self.iterations += 1;
        }
    }

    fn encrypt_pool(&mut self) {
        self.cipher.encrypt_block(GenericArray::from_mut_slice(&mut self.pool));
    }
}
