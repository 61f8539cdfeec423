//! Error types for CloudRAID
//!
//! Provides a unified error type for codec and shard operations.

use thiserror::Error;

/// Result type alias for CloudRAID core operations
pub type Result<T> = std::result::Result<T, CloudRaidError>;

/// Unified error type for the core crate
#[derive(Error, Debug)]
pub enum CloudRaidError {
    // ===== Codec Errors =====
    #[error("Parity mismatch at chunk offset {offset}")]
    ParityMismatch { offset: u64 },

    #[error("Insufficient shards: have {available}, need {required}")]
    InsufficientShards { available: usize, required: usize },

    #[error("Invalid device index: {index} (max: {max})")]
    InvalidDeviceIndex { index: usize, max: usize },

    #[error("Hash verification failed for {0}")]
    HashVerificationFailed(String),

    #[error("Truncated shard input: expected {expected} bytes, reconstructed {actual}")]
    Truncated { expected: u64, actual: u64 },

    // ===== Metadata Shard Errors =====
    #[error("Invalid metadata shard: {0}")]
    InvalidMetadata(String),

    #[error("Unsupported metadata version: {found} (expected {expected})")]
    UnsupportedMetadataVersion { found: u8, expected: u8 },

    // ===== I/O Errors =====
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

impl CloudRaidError {
    /// Whether retrying the same operation could succeed
    pub fn is_transient(&self) -> bool {
        matches!(self, CloudRaidError::Io(_))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_display() {
        let err = CloudRaidError::InsufficientShards {
            available: 1,
            required: 2,
        };
        assert_eq!(err.to_string(), "Insufficient shards: have 1, need 2");
    }

    #[test]
    fn test_error_from_io() {
        let io_err = std::io::Error::new(std::io::ErrorKind::NotFound, "file not found");
        let err: CloudRaidError = io_err.into();
        assert!(matches!(err, CloudRaidError::Io(_)));
        assert!(err.is_transient());
        assert!(!CloudRaidError::ParityMismatch { offset: 0 }.is_transient());
    }
}
