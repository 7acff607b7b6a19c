//! Operating System Entropy Source.
//!
//! Wraps the kernel CSPRNG (`getrandom` and friends) as a custom source.

use rand_core::{OsRng, RngCore};

use super::{EntropyError, EntropySource};

/// Custom source backed by `rand_core::OsRng`.
pub struct OsSource {
    batch: usize,
    quality: f64,
}

impl OsSource {
    /// Creates a source producing `batch` bytes credited at `quality`.
    pub fn new(batch: usize, quality: f64) -> Self {
        Self { batch, quality }
    }
}

impl Default for OsSource {
    fn default() -> Self {
        Self::new(64, 75.0)
    }
}

impl EntropySource for OsSource {
    fn name(&self) -> &str {
        "OsRng"
    }

    fn next_bytes(&mut self) -> Result<Vec<u8>, EntropyError> {
        let mut out = vec![0u8; self.batch];
        OsRng.try_fill_bytes(&mut out).map_err(|e| {
            log::debug!("OS entropy unavailable: {}", e);
            EntropyError::CollectionFailed
        })?;
        Ok(out)
    }

    fn quality(&self) -> f64 {
        self.quality
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_os_source_fills_batch() {
        let mut source = OsSource::new(32, 40.0);
        let a = source.next_bytes().unwrap();
        let b = source.next_bytes().unwrap();
        assert_eq!(a.len(), 32);
        assert_ne!(a, b);
    }
}
