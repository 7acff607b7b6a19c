//! Error taxonomy for the generator.
//!
//! Per-source I/O failures never reach this type: the collector logs and skips
//! them. Everything here is fatal to the operation that returned it.

use core::fmt;

/// Errors surfaced by the pool, the generator and configuration parsing.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CsprngError {
    /// A blocking slow poll finished but the pool quality is still below 100.
    InsufficientEntropy,
    /// A source descriptor or configuration property is malformed.
    InvalidSourceConfig(&'static str),
    /// An `offset`/`length` pair does not fit the supplied buffer.
    IndexOutOfRange,
}

impl fmt::Display for CsprngError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            CsprngError::InsufficientEntropy => write!(f, "Insufficient randomness was polled"),
            CsprngError::InvalidSourceConfig(reason) => {
                write!(f, "Invalid entropy source configuration: {}", reason)
            }
            CsprngError::IndexOutOfRange => write!(f, "Buffer index out of range"),
        }
    }
}

impl std::error::Error for CsprngError {}

impl From<CsprngError> for rand_core::Error {
    fn from(e: CsprngError) -> Self {
        rand_core::Error::new(e)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_display_names_the_cause() {
        let e = CsprngError::InvalidSourceConfig("read count must be positive");
        assert_eq!(
            e.to_string(),
            "Invalid entropy source configuration: read count must be positive"
        );
        assert_eq!(CsprngError::IndexOutOfRange.to_string(), "Buffer index out of range");
    }
}
