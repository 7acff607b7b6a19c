//! Entropy collection.
//!
//! This module defines the custom entropy source interface and everything that
//! feeds the pool: the slow-poll collector that reads configured sources on a
//! background worker, and the fast poll that stirs cheap ambient state inline.
//!
//! # Design
//! - **Multi-Source**: Files, URLs, external programs and custom sources are polled
//!   round-robin until the pool reaches full quality.
//! - **Fail-Safe**: A failing source is skipped; the poll carries on with the rest.
//! - **Channel Handoff**: The collector never touches the pool. Harvested bytes
//!   travel over a channel and are folded in under the generator lock.

pub mod collector;
pub mod custom;
pub mod fast_poll;
pub mod jitter;
pub mod os;
pub mod sources;

use core::fmt;

/// Error types for custom entropy sources.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EntropyError {
    /// Failed to collect entropy bytes.
    CollectionFailed,
    /// Source is exhausted (e.g., drained buffer).
    Exhausted,
    /// Platform not supported.
    NotSupported,
}

impl fmt::Display for EntropyError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            EntropyError::CollectionFailed => write!(f, "Entropy collection failed"),
            EntropyError::Exhausted => write!(f, "Entropy source exhausted"),
            EntropyError::NotSupported => write!(f, "Entropy source not supported on this platform"),
        }
    }
}

impl std::error::Error for EntropyError {}

/// A pluggable ("other") entropy source polled by the collector.
pub trait EntropySource: Send {
    /// Returns an identifier for the source, used in logs.
    fn name(&self) -> &str;

    /// Produces the next batch of entropy bytes.
    ///
    /// # Returns
    /// * `Ok(bytes)` on success.
    /// * `Err(EntropyError)` if the source fails; the collector skips it.
    fn next_bytes(&mut self) -> Result<Vec<u8>, EntropyError>;

    /// Quality credited to the pool for each successful batch, in `[0, 100]`.
    fn quality(&self) -> f64;
}

impl<S: EntropySource + ?Sized> EntropySource for Box<S> {
    fn name(&self) -> &str {
        (**self).name()
    }

    fn next_bytes(&mut self) -> Result<Vec<u8>, EntropyError> {
        (**self).next_bytes()
    }

    fn quality(&self) -> f64 {
        (**self).quality()
    }
}
