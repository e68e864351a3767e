//! Error types shared across the MBA workspace

use thiserror::Error;

/// Result type alias for common operations
pub type Result<T> = std::result::Result<T, MbaError>;

/// Main error type for shared utilities
#[derive(Error, Debug)]
pub enum MbaError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Checksum mismatch: expected {expected}, got {actual}")]
    ChecksumMismatch { expected: String, actual: String },

    #[error("Invalid fingerprint: {0}")]
    InvalidFingerprint(String),
}
