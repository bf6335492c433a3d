//! Common error types for VaultDrop.

use thiserror::Error;

/// Top-level error type for VaultDrop operations.
#[derive(Debug, Error)]
pub enum Error {
    /// Cryptographic operation failed: bad or short envelope, key derivation
    /// failure, or the cipher engine not being initialized.
    #[error("Crypto error: {0}")]
    Crypto(String),

    /// Remote store or network operation failed.
    #[error("Storage error: {0}")]
    Storage(String),

    /// Multipart session state violation or missing parts.
    #[error("Multipart error: {0}")]
    Multipart(String),

    /// A per-file or global finalize timeout expired during archive assembly.
    #[error("Archive timeout: {0}")]
    ArchiveTimeout(String),

    /// I/O operation failed.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// Serialization or deserialization failed.
    #[error("Serialization error: {0}")]
    Serialization(String),

    /// Invalid input provided.
    #[error("Invalid input: {0}")]
    InvalidInput(String),

    /// Resource not found.
    #[error("Not found: {0}")]
    NotFound(String),
}

impl Error {
    /// True if this error is a per-file or global archive timeout.
    pub fn is_timeout(&self) -> bool {
        matches!(self, Error::ArchiveTimeout(_))
    }
}

/// Result type alias using the common Error.
pub type Result<T> = std::result::Result<T, Error>;
