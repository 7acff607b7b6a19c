//! Application-Provided Entropy Source.
//!
//! Allows injecting entropy from external events (e.g., UI interactions, network
//! packets) into the slow poll, with a quality the application vouches for.

use std::sync::{Arc, Mutex, PoisonError};

use zeroize::Zeroize;

use super::{EntropyError, EntropySource};

/// Source that hands out bytes pushed into it by the application.
///
/// Clones share the same buffer, so one handle can be registered with the
/// generator while another keeps feeding it.
#[derive(Clone)]
pub struct BufferedSource {
    name: String,
    quality: f64,
    buffer: Arc<Mutex<Vec<u8>>>,
}

impl BufferedSource {
    /// Creates an empty source that credits `quality` per non-empty batch.
    pub fn new(name: impl Into<String>, quality: f64) -> Self {
        Self {
            name: name.into(),
            quality,
            buffer: Arc::new(Mutex::new(Vec::new())),
        }
    }

    /// Appends entropy bytes.
    pub fn add_bytes(&self, bytes: &[u8]) {
        self.buffer
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .extend_from_slice(bytes);
    }

    /// Bytes waiting to be polled.
    pub fn pending(&self) -> usize {
        self.buffer.lock().unwrap_or_else(PoisonError::into_inner).len()
    }
}

impl EntropySource for BufferedSource {
    fn name(&self) -> &str {
        &self.name
    }

    fn next_bytes(&mut self) -> Result<Vec<u8>, EntropyError> {
        let mut buffer = self.buffer.lock().unwrap_or_else(PoisonError::into_inner);
        if buffer.is_empty() {
            return Err(EntropyError::Exhausted);
        }
        let drained = buffer.clone();
        buffer.zeroize();
        Ok(drained)
    }

    fn quality(&self) -> f64 {
        self.quality
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_buffered_source_drains() {
        let mut source = BufferedSource::new("ui-events", 12.5);
        let feeder = source.clone();
        feeder.add_bytes(&[0x01, 0x02]);
        feeder.add_bytes(&[0x03]);
        assert_eq!(source.pending(), 3);

        assert_eq!(source.next_bytes(), Ok(vec![0x01, 0x02, 0x03]));
        assert_eq!(source.pending(), 0);
        assert_eq!(source.next_bytes(), Err(EntropyError::Exhausted));
        assert_eq!(source.quality(), 12.5);
        assert_eq!(source.name(), "ui-events");
    }
}
