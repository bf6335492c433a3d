//! The object storage gateway.
//!
//! Every write and read goes through here, and the cipher engine is applied
//! transparently according to the configured [`EncryptionPolicy`]: uploads
//! are encrypted before the provider sees them, downloads are decrypted
//! based on the `encrypted` flag recorded at upload time. When the engine is
//! unavailable under the opportunistic policy, uploads proceed unencrypted
//! and are flagged as such: a deliberate degraded mode, not a silent
//! failure.

use bytes::Bytes;
use futures::future::join_all;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, error, warn};

use crate::multipart::MultipartUpload;
use crate::progress::{ProgressEvent, ProgressObserver};
use crate::provider::{MultipartStorage, ObjectMeta, PutOptions};
use vaultdrop_common::{ByteStream, EncryptionPolicy, Error, Result, TransferId};
use vaultdrop_crypto::CryptoEngine;

/// One file handed to [`ObjectStorage::upload_files_parallel`].
#[derive(Debug, Clone)]
pub struct FileUpload {
    /// File name within the transfer.
    pub name: String,
    /// Complete file content.
    pub data: Bytes,
    /// Content type; defaults to `application/octet-stream`.
    pub content_type: Option<String>,
}

/// Per-file result record from a batch upload.
///
/// A failed file is reported here, not as a batch failure: the contract is
/// exactly one outcome per input file, in input order.
#[derive(Debug, Clone)]
pub struct UploadOutcome {
    /// File name within the transfer.
    pub name: String,
    /// Object key, when the upload succeeded.
    pub key: Option<String>,
    /// Rendered error, when it failed.
    pub error: Option<String>,
}

impl UploadOutcome {
    /// True if the file was stored.
    pub fn success(&self) -> bool {
        self.error.is_none()
    }
}

/// Uniform upload/download/list/delete against a provider, with transparent
/// encryption.
pub struct ObjectStorage {
    provider: Arc<dyn MultipartStorage>,
    engine: Option<Arc<CryptoEngine>>,
    policy: EncryptionPolicy,
    progress: Option<Arc<dyn ProgressObserver>>,
}

impl ObjectStorage {
    /// Create a gateway over a provider.
    ///
    /// `engine: None` means the cipher engine is not initialized; what that
    /// implies for uploads depends on `policy`.
    pub fn new(
        provider: Arc<dyn MultipartStorage>,
        engine: Option<Arc<CryptoEngine>>,
        policy: EncryptionPolicy,
    ) -> Self {
        Self {
            provider,
            engine,
            policy,
            progress: None,
        }
    }

    /// Subscribe an observer to upload progress events.
    pub fn with_progress(mut self, observer: Arc<dyn ProgressObserver>) -> Self {
        self.progress = Some(observer);
        self
    }

    /// The underlying provider.
    pub fn provider(&self) -> &Arc<dyn MultipartStorage> {
        &self.provider
    }

    /// The cipher engine, if initialized.
    pub fn engine(&self) -> Option<&Arc<CryptoEngine>> {
        self.engine.as_ref()
    }

    /// True if crypto operations are available.
    pub fn is_ready(&self) -> bool {
        self.engine.is_some()
    }

    /// Build the object key for a file within a transfer.
    ///
    /// # Postconditions
    /// - Key is `uploads/{transfer}/{name}` with any path components
    ///   stripped from `name`
    pub fn object_key(transfer: &TransferId, name: &str) -> Result<String> {
        let name = sanitize_file_name(name)?;
        Ok(format!("uploads/{}/{}", transfer, name))
    }

    /// Resolve the engine to use for an upload, honoring the policy.
    ///
    /// Returns `None` when the upload should be stored as plaintext.
    fn upload_engine(&self) -> Result<Option<&Arc<CryptoEngine>>> {
        match (self.policy, &self.engine) {
            (EncryptionPolicy::Disabled, _) => Ok(None),
            (EncryptionPolicy::Opportunistic, None) => {
                warn!("Cipher engine not initialized; storing plaintext (degraded mode)");
                Ok(None)
            }
            (EncryptionPolicy::Required, None) => Err(Error::Crypto(
                "Encryption required but cipher engine is not initialized".to_string(),
            )),
            (_, Some(engine)) => Ok(Some(engine)),
        }
    }

    fn emit(&self, event: ProgressEvent) {
        if let Some(observer) = &self.progress {
            observer.on_progress(event);
        }
    }

    /// Upload one file, encrypting per policy.
    ///
    /// Under the opportunistic policy an encryption failure falls back to
    /// storing the plaintext buffer, logged and flagged `encrypted = false`,
    /// rather than aborting the transfer: availability over strict
    /// confidentiality.
    pub async fn upload(
        &self,
        transfer: &TransferId,
        name: &str,
        data: Bytes,
    ) -> Result<ObjectMeta> {
        self.upload_with_content_type(transfer, name, data, None).await
    }

    /// [`upload`](Self::upload) with an explicit content type.
    pub async fn upload_with_content_type(
        &self,
        transfer: &TransferId,
        name: &str,
        data: Bytes,
        content_type: Option<&str>,
    ) -> Result<ObjectMeta> {
        let key = Self::object_key(transfer, name)?;
        let mut opts = PutOptions {
            encrypted: false,
            content_type: content_type
                .unwrap_or("application/octet-stream")
                .to_string(),
        };

        let body = match self.upload_engine()? {
            None => data,
            Some(engine) => match engine.encrypt_buffer(transfer, &data) {
                Ok(envelope) => {
                    opts.encrypted = true;
                    Bytes::from(envelope)
                }
                Err(e) if self.policy == EncryptionPolicy::Opportunistic => {
                    error!(key = %key, error = %e, "Encryption failed; storing plaintext");
                    data
                }
                Err(e) => return Err(e),
            },
        };

        debug!(key = %key, encrypted = opts.encrypted, size = body.len(), "Uploading object");
        self.provider.put(&key, body, &opts).await
    }

    /// Upload a stream to an explicit object key.
    ///
    /// The stream is wrapped in the encrypting transform when a transfer id
    /// is given and the policy allows it.
    pub async fn upload_stream(
        &self,
        stream: ByteStream,
        key: &str,
        transfer: Option<&TransferId>,
    ) -> Result<ObjectMeta> {
        let mut opts = PutOptions::default();
        let body = match (transfer, self.upload_engine()?) {
            (Some(transfer), Some(engine)) => {
                opts.encrypted = true;
                engine.encrypt_stream(transfer, stream)
            }
            _ => stream,
        };
        self.provider.put_stream(key, body, &opts).await
    }

    /// Open a download stream, decrypting transparently when the object was
    /// stored encrypted.
    ///
    /// # Errors
    /// - `Error::Crypto` if the object is flagged encrypted but the engine
    ///   is not initialized; never silently returns ciphertext
    pub async fn download(&self, transfer: &TransferId, name: &str) -> Result<ByteStream> {
        let key = Self::object_key(transfer, name)?;
        let meta = self.provider.head(&key).await?;
        let stream = self.provider.get(&key).await?;

        if !meta.encrypted {
            return Ok(stream);
        }
        match &self.engine {
            Some(engine) => Ok(engine.decrypt_stream(transfer, stream)),
            None => Err(Error::Crypto(format!(
                "Object {} is encrypted but the cipher engine is not initialized",
                key
            ))),
        }
    }

    /// Delete one file's object.
    pub async fn delete(&self, transfer: &TransferId, name: &str) -> Result<()> {
        let key = Self::object_key(transfer, name)?;
        self.provider.delete(&key).await
    }

    /// List a transfer's objects. Every entry carries its `encrypted` flag.
    pub async fn list(&self, transfer: &TransferId) -> Result<Vec<ObjectMeta>> {
        self.provider
            .list(&format!("uploads/{}/", transfer))
            .await
    }

    /// Presigned GET URL for an object key.
    pub async fn signed_url(&self, key: &str, ttl: Duration) -> Result<String> {
        self.provider.signed_url(key, ttl).await
    }

    /// Negotiate a multipart session for a large file.
    ///
    /// The session inherits this gateway's engine and policy, so parts are
    /// encrypted exactly when single-shot uploads would be.
    pub async fn init_multipart(
        &self,
        transfer: &TransferId,
        name: &str,
    ) -> Result<MultipartUpload> {
        let key = Self::object_key(transfer, name)?;
        let engine = self.upload_engine()?.cloned();
        MultipartUpload::init(
            Arc::clone(&self.provider),
            engine,
            transfer.clone(),
            key,
        )
        .await
    }

    /// Upload a large input through a multipart session: 16 MiB parts,
    /// dispatched in waves of at most 6.
    pub async fn upload_large(
        &self,
        transfer: &TransferId,
        name: &str,
        stream: ByteStream,
    ) -> Result<ObjectMeta> {
        let upload = self.init_multipart(transfer, name).await?;
        upload
            .pump_stream(
                stream,
                crate::multipart::PART_SIZE,
                crate::multipart::MAX_CONCURRENT_PARTS,
                self.progress.clone(),
            )
            .await
    }

    /// Upload a batch of files with bounded concurrency.
    ///
    /// Files are partitioned into fixed-size waves of `concurrency`; each
    /// wave's uploads run concurrently and the next wave starts only once
    /// the whole wave has resolved. Per-file failures become
    /// `UploadOutcome { error: Some(..) }` records; the batch never aborts.
    ///
    /// # Postconditions
    /// - Exactly one outcome per input file, in input order
    pub async fn upload_files_parallel(
        &self,
        transfer: &TransferId,
        files: Vec<FileUpload>,
        concurrency: usize,
    ) -> Vec<UploadOutcome> {
        let concurrency = concurrency.max(1);
        let mut outcomes = Vec::with_capacity(files.len());

        for wave in files.chunks(concurrency) {
            let uploads = wave.iter().map(|file| async {
                self.emit(ProgressEvent::FileStarted {
                    name: file.name.clone(),
                });
                let result = self
                    .upload_with_content_type(
                        transfer,
                        &file.name,
                        file.data.clone(),
                        file.content_type.as_deref(),
                    )
                    .await;
                (file.name.clone(), result)
            });

            for (name, result) in join_all(uploads).await {
                let outcome = match result {
                    Ok(meta) => {
                        self.emit(ProgressEvent::FileCompleted {
                            name: name.clone(),
                            key: meta.key.clone(),
                        });
                        UploadOutcome {
                            name,
                            key: Some(meta.key),
                            error: None,
                        }
                    }
                    Err(e) => {
                        warn!(name = %name, error = %e, "File upload failed in batch");
                        self.emit(ProgressEvent::FileFailed {
                            name: name.clone(),
                            error: e.to_string(),
                        });
                        UploadOutcome {
                            name,
                            key: None,
                            error: Some(e.to_string()),
                        }
                    }
                };
                outcomes.push(outcome);
            }
        }

        outcomes
    }
}

/// Strip path components from a file name so it cannot escape the
/// transfer's key prefix.
fn sanitize_file_name(name: &str) -> Result<String> {
    let name = name
        .rsplit(['/', '\\'])
        .next()
        .unwrap_or(name)
        .trim()
        .to_string();
    if name.is_empty() || name == "." || name == ".." {
        return Err(Error::InvalidInput(format!("Invalid file name: {:?}", name)));
    }
    Ok(name)
}
