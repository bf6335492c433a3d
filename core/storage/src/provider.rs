//! Storage provider trait definitions.

use async_trait::async_trait;
use bytes::Bytes;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::time::Duration;

use vaultdrop_common::{ByteStream, Result};

/// Metadata for a stored object.
///
/// `encrypted` is a required field on every listing and head result: callers
/// can always tell which objects would be decrypted on download, without a
/// separate metadata probe.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ObjectMeta {
    /// Full object key (e.g. `uploads/{transfer}/{file}`).
    pub key: String,
    /// File name (last key segment).
    pub name: String,
    /// Stored size in bytes. For encrypted objects this is the envelope
    /// size, not the plaintext size.
    pub size: u64,
    /// Whether the stored bytes are an `IV || ciphertext` envelope.
    pub encrypted: bool,
    /// Content type recorded at upload time.
    pub content_type: String,
    /// Last modification time.
    pub modified: DateTime<Utc>,
    /// ETag reported by the store, if any.
    pub etag: Option<String>,
}

/// Write options recorded as object metadata.
#[derive(Debug, Clone)]
pub struct PutOptions {
    /// Flag the stored bytes as an encrypted envelope.
    pub encrypted: bool,
    /// Content type to record.
    pub content_type: String,
}

impl Default for PutOptions {
    fn default() -> Self {
        Self {
            encrypted: false,
            content_type: "application/octet-stream".to_string(),
        }
    }
}

/// One completed part of a multipart session.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CompletedPart {
    /// Part number, starting at 1.
    pub part_number: u32,
    /// ETag the store returned for the part.
    pub etag: String,
}

/// Storage provider trait for S3-compatible backends.
///
/// Operations here are raw: encryption is applied a layer up, by the
/// [`ObjectStorage`](crate::ObjectStorage) gateway. All operations are async
/// and large data moves as streams.
#[async_trait]
pub trait StorageProvider: Send + Sync {
    /// Get the provider name (e.g. "s3", "memory").
    fn name(&self) -> &str;

    /// Store a complete object.
    ///
    /// # Postconditions
    /// - Object exists at `key` with `opts` recorded as its metadata
    /// - A previous object at `key` is replaced
    ///
    /// # Errors
    /// - Network/remote-store errors as `Error::Storage`
    async fn put(&self, key: &str, data: Bytes, opts: &PutOptions) -> Result<ObjectMeta>;

    /// Store an object from a stream.
    async fn put_stream(&self, key: &str, stream: ByteStream, opts: &PutOptions)
        -> Result<ObjectMeta>;

    /// Open a read stream over an object's stored bytes.
    ///
    /// # Errors
    /// - `Error::NotFound` if no object exists at `key`
    async fn get(&self, key: &str) -> Result<ByteStream>;

    /// Fetch an object's metadata without its bytes.
    async fn head(&self, key: &str) -> Result<ObjectMeta>;

    /// Delete an object. Deleting a missing object is not an error.
    async fn delete(&self, key: &str) -> Result<()>;

    /// List objects under a key prefix.
    ///
    /// # Postconditions
    /// - Results are in ascending key order
    /// - Every entry carries its `encrypted` flag
    async fn list(&self, prefix: &str) -> Result<Vec<ObjectMeta>>;

    /// Produce a presigned GET URL valid for `ttl`.
    async fn signed_url(&self, key: &str, ttl: Duration) -> Result<String>;
}

/// Capability trait for providers that support multipart upload sessions.
///
/// Callers that need multipart take `Arc<dyn MultipartStorage>`; there is no
/// runtime capability probe.
#[async_trait]
pub trait MultipartStorage: StorageProvider {
    /// Negotiate a new multipart session for `key`.
    ///
    /// # Postconditions
    /// - Returns an upload id the store associates with `key`
    async fn create_multipart(&self, key: &str, opts: &PutOptions) -> Result<String>;

    /// Upload one part.
    ///
    /// # Preconditions
    /// - `part_number >= 1`; parts need not arrive in order
    ///
    /// # Returns
    /// The part's etag, needed for completion.
    async fn upload_part(
        &self,
        key: &str,
        upload_id: &str,
        part_number: u32,
        data: Bytes,
    ) -> Result<String>;

    /// Complete a session.
    ///
    /// # Preconditions
    /// - `parts` must be in ascending part-number order; the store rejects
    ///   out-of-order part lists
    ///
    /// # Postconditions
    /// - The assembled object exists at `key`; the session is consumed
    async fn complete_multipart(
        &self,
        key: &str,
        upload_id: &str,
        parts: &[CompletedPart],
    ) -> Result<ObjectMeta>;

    /// Abort a session, releasing the store's reserved multipart resources.
    async fn abort_multipart(&self, key: &str, upload_id: &str) -> Result<()>;
}

/// Last segment of an object key, used as the display name.
pub(crate) fn name_from_key(key: &str) -> String {
    key.rsplit('/').next().unwrap_or(key).to_string()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_name_from_key() {
        assert_eq!(name_from_key("uploads/t-1/report.pdf"), "report.pdf");
        assert_eq!(name_from_key("flat"), "flat");
    }

    #[test]
    fn test_put_options_default() {
        let opts = PutOptions::default();
        assert!(!opts.encrypted);
        assert_eq!(opts.content_type, "application/octet-stream");
    }

    #[test]
    fn test_object_meta_serde_roundtrip() {
        let meta = ObjectMeta {
            key: "uploads/t-1/a.txt".to_string(),
            name: "a.txt".to_string(),
            size: 42,
            encrypted: true,
            content_type: "text/plain".to_string(),
            modified: Utc::now(),
            etag: Some("\"abc\"".to_string()),
        };
        let json = serde_json::to_string(&meta).unwrap();
        let back: ObjectMeta = serde_json::from_str(&json).unwrap();
        assert_eq!(back.key, meta.key);
        assert!(back.encrypted);
    }
}
