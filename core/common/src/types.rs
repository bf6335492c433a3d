//! Common types used throughout VaultDrop.

use bytes::Bytes;
use futures::Stream;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::pin::Pin;

/// Byte stream type for upload/download operations.
///
/// Errors travel in-band as `Err` items so that a failing decrypt or a broken
/// network read can surface mid-stream without tearing down sibling streams.
pub type ByteStream = Pin<Box<dyn Stream<Item = crate::Result<Bytes>> + Send>>;

/// Opaque identifier for a transfer: one logical batch of files uploaded
/// together.
///
/// Transfer ids are interpolated into object keys
/// (`uploads/{transfer}/{file}`), so construction rejects anything that
/// could escape the transfer's key prefix.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct TransferId(String);

impl TransferId {
    /// Create a new TransferId from a string.
    ///
    /// # Preconditions
    /// - `id` must be non-empty
    /// - `id` must not contain path separators or `..`
    ///
    /// # Errors
    /// - Returns error if the id is empty or not key-path safe
    pub fn new(id: impl Into<String>) -> crate::Result<Self> {
        let id = id.into();
        if id.is_empty() {
            return Err(crate::Error::InvalidInput(
                "TransferId cannot be empty".to_string(),
            ));
        }
        if id.contains('/') || id.contains('\\') || id.contains("..") {
            return Err(crate::Error::InvalidInput(
                "TransferId cannot contain path separators".to_string(),
            ));
        }
        Ok(Self(id))
    }

    /// Get the inner string value.
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for TransferId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Policy governing whether uploads are encrypted.
///
/// `Opportunistic` preserves the degraded mode of the storage gateway: when
/// the cipher engine is unavailable, uploads proceed unencrypted and are
/// flagged as such in object metadata. `Required` turns that situation into a
/// hard failure instead.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum EncryptionPolicy {
    /// Every upload must be encrypted; a missing or failing engine is an error.
    Required,
    /// Encrypt when the engine is ready, otherwise store plaintext flagged
    /// `encrypted = false`.
    Opportunistic,
    /// Never encrypt.
    Disabled,
}

impl Default for EncryptionPolicy {
    fn default() -> Self {
        Self::Opportunistic
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_transfer_id_valid() {
        let id = TransferId::new("a1b2c3").unwrap();
        assert_eq!(id.as_str(), "a1b2c3");
        assert_eq!(id.to_string(), "a1b2c3");
    }

    #[test]
    fn test_transfer_id_empty_fails() {
        assert!(TransferId::new("").is_err());
    }

    #[test]
    fn test_transfer_id_path_escape_fails() {
        assert!(TransferId::new("a/b").is_err());
        assert!(TransferId::new("a\\b").is_err());
        assert!(TransferId::new("..").is_err());
        assert!(TransferId::new("a..b").is_err());
    }

    #[test]
    fn test_encryption_policy_default() {
        assert_eq!(EncryptionPolicy::default(), EncryptionPolicy::Opportunistic);
    }

    #[test]
    fn test_encryption_policy_serde() {
        let json = serde_json::to_string(&EncryptionPolicy::Required).unwrap();
        assert_eq!(json, "\"required\"");
        let back: EncryptionPolicy = serde_json::from_str("\"disabled\"").unwrap();
        assert_eq!(back, EncryptionPolicy::Disabled);
    }
}
