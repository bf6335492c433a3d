//! The multipart upload coordinator.
//!
//! One [`MultipartUpload`] tracks one large file's session through the
//! `Init -> UploadingParts -> Completing -> Done` state machine, with
//! `Aborted` reachable from every non-`Done` state. Completion sorts the
//! part list by part number before submission (the remote store rejects
//! out-of-order lists), and a completion failure triggers an automatic
//! best-effort abort so the store's reserved multipart resources are
//! released.
//!
//! [`pump_stream`](MultipartUpload::pump_stream) is the client-side chunker:
//! fixed-size parts dispatched in waves of bounded width, where a wave only
//! advances once every in-flight part in it has resolved. That keeps a
//! simple, verifiable cap on concurrent network and crypto work.

use bytes::Bytes;
use futures::future::join_all;
use futures::StreamExt;
use std::sync::{Arc, Mutex};
use tracing::{debug, warn};

use crate::progress::{ProgressEvent, ProgressObserver};
use crate::provider::{CompletedPart, MultipartStorage, ObjectMeta, PutOptions};
use vaultdrop_common::{ByteStream, Error, Result, TransferId};
use vaultdrop_crypto::CryptoEngine;

/// Fixed client-side chunk size (16 MiB).
pub const PART_SIZE: usize = 16 * 1024 * 1024;

/// Maximum concurrent part uploads per session.
pub const MAX_CONCURRENT_PARTS: usize = 6;

/// Lifecycle of one multipart session.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MultipartState {
    /// Session negotiated, no parts uploaded yet.
    Init,
    /// At least one part upload issued.
    UploadingParts,
    /// Completion submitted to the store.
    Completing,
    /// Object assembled; the session no longer exists.
    Done,
    /// Session aborted; the store released its resources.
    Aborted,
}

/// One multipart upload session.
pub struct MultipartUpload {
    provider: Arc<dyn MultipartStorage>,
    engine: Option<Arc<CryptoEngine>>,
    transfer: TransferId,
    key: String,
    upload_id: String,
    state: Mutex<MultipartState>,
}

impl MultipartUpload {
    /// Negotiate a new session for `key`.
    ///
    /// When an engine is given, the pumped stream is encrypted and the
    /// object is flagged accordingly; the envelope is identical to a
    /// single-shot upload's, so transparent decryption on download works the
    /// same way.
    pub async fn init(
        provider: Arc<dyn MultipartStorage>,
        engine: Option<Arc<CryptoEngine>>,
        transfer: TransferId,
        key: String,
    ) -> Result<Self> {
        let opts = PutOptions {
            encrypted: engine.is_some(),
            ..Default::default()
        };
        let upload_id = provider.create_multipart(&key, &opts).await?;
        debug!(key = %key, upload_id = %upload_id, "Multipart session negotiated");
        Ok(Self {
            provider,
            engine,
            transfer,
            key,
            upload_id,
            state: Mutex::new(MultipartState::Init),
        })
    }

    /// The store-assigned upload id.
    pub fn upload_id(&self) -> &str {
        &self.upload_id
    }

    /// The object key this session assembles.
    pub fn object_key(&self) -> &str {
        &self.key
    }

    /// Current session state.
    pub fn state(&self) -> MultipartState {
        *self.state.lock().unwrap()
    }

    /// Upload one part.
    ///
    /// # Preconditions
    /// - `part_number >= 1`; parts may be uploaded in any order
    /// - Session is in `Init` or `UploadingParts`
    ///
    /// # Errors
    /// - `Error::Multipart` on a state violation or part number 0
    pub async fn upload_part(&self, part_number: u32, data: Bytes) -> Result<CompletedPart> {
        if part_number == 0 {
            return Err(Error::Multipart("Part numbers start at 1".to_string()));
        }
        {
            let mut state = self.state.lock().unwrap();
            match *state {
                MultipartState::Init | MultipartState::UploadingParts => {
                    *state = MultipartState::UploadingParts;
                }
                other => {
                    return Err(Error::Multipart(format!(
                        "Cannot upload part in state {:?}",
                        other
                    )));
                }
            }
        }

        let etag = self
            .provider
            .upload_part(&self.key, &self.upload_id, part_number, data)
            .await?;
        Ok(CompletedPart { part_number, etag })
    }

    /// Complete the session.
    ///
    /// Parts are sorted by part number before submission regardless of input
    /// order. A completion failure triggers an automatic abort (logged, not
    /// re-thrown) and surfaces as `Error::Multipart`.
    ///
    /// # Preconditions
    /// - Part numbers must be contiguous from 1 once sorted
    pub async fn complete(&self, mut parts: Vec<CompletedPart>) -> Result<ObjectMeta> {
        {
            let mut state = self.state.lock().unwrap();
            match *state {
                MultipartState::Init | MultipartState::UploadingParts => {
                    *state = MultipartState::Completing;
                }
                other => {
                    return Err(Error::Multipart(format!(
                        "Cannot complete in state {:?}",
                        other
                    )));
                }
            }
        }

        parts.sort_by_key(|p| p.part_number);
        for (i, part) in parts.iter().enumerate() {
            if part.part_number != (i + 1) as u32 {
                self.abort_best_effort().await;
                return Err(Error::Multipart(format!(
                    "Part list not contiguous: expected {}, found {}",
                    i + 1,
                    part.part_number
                )));
            }
        }
        if parts.is_empty() {
            self.abort_best_effort().await;
            return Err(Error::Multipart("Cannot complete with zero parts".to_string()));
        }

        match self
            .provider
            .complete_multipart(&self.key, &self.upload_id, &parts)
            .await
        {
            Ok(meta) => {
                *self.state.lock().unwrap() = MultipartState::Done;
                Ok(meta)
            }
            Err(e) => {
                self.abort_best_effort().await;
                Err(Error::Multipart(format!(
                    "Completion of {} failed: {}",
                    self.key, e
                )))
            }
        }
    }

    /// Abort the session, releasing the store's reserved resources.
    ///
    /// Aborting an already-aborted session is a no-op.
    ///
    /// # Errors
    /// - `Error::Multipart` if the session already completed
    pub async fn abort(&self) -> Result<()> {
        {
            let mut state = self.state.lock().unwrap();
            match *state {
                MultipartState::Done => {
                    return Err(Error::Multipart(
                        "Cannot abort a completed session".to_string(),
                    ));
                }
                MultipartState::Aborted => return Ok(()),
                _ => *state = MultipartState::Aborted,
            }
        }
        self.provider.abort_multipart(&self.key, &self.upload_id).await
    }

    async fn abort_best_effort(&self) {
        if let Err(e) = self.abort().await {
            warn!(key = %self.key, upload_id = %self.upload_id, error = %e,
                "Multipart abort failed; session left for out-of-band cleanup");
        }
    }

    /// Pump a source stream through this session.
    ///
    /// The source is encrypted (when the session has an engine), split into
    /// `part_size` chunks, and uploaded in waves of at most `max_in_flight`
    /// concurrent parts; the next wave starts only once the whole wave has
    /// resolved. Any part failure aborts the session and propagates.
    pub async fn pump_stream(
        &self,
        source: ByteStream,
        part_size: usize,
        max_in_flight: usize,
        progress: Option<Arc<dyn ProgressObserver>>,
    ) -> Result<ObjectMeta> {
        let source = match &self.engine {
            Some(engine) => engine.encrypt_stream(&self.transfer, source),
            None => source,
        };
        match self
            .pump_inner(source, part_size.max(1), max_in_flight.max(1), progress)
            .await
        {
            Ok(meta) => Ok(meta),
            Err(e) => {
                self.abort_best_effort().await;
                Err(e)
            }
        }
    }

    async fn pump_inner(
        &self,
        mut source: ByteStream,
        part_size: usize,
        max_in_flight: usize,
        progress: Option<Arc<dyn ProgressObserver>>,
    ) -> Result<ObjectMeta> {
        let mut pending: Vec<u8> = Vec::new();
        let mut exhausted = false;
        let mut next_part: u32 = 1;
        let mut parts: Vec<CompletedPart> = Vec::new();

        loop {
            let mut wave: Vec<(u32, Bytes)> = Vec::new();
            while wave.len() < max_in_flight {
                match next_part_bytes(&mut source, &mut pending, part_size, &mut exhausted).await? {
                    Some(data) => {
                        wave.push((next_part, data));
                        next_part += 1;
                    }
                    None => break,
                }
            }
            if wave.is_empty() {
                break;
            }

            let uploads = wave
                .into_iter()
                .map(|(n, data)| async move { self.upload_part(n, data).await });
            for completed in join_all(uploads).await {
                let part = completed?;
                if let Some(observer) = &progress {
                    observer.on_progress(ProgressEvent::PartUploaded {
                        key: self.key.clone(),
                        part_number: part.part_number,
                    });
                }
                parts.push(part);
            }
        }

        // Zero-length sources still need one (empty) part to complete.
        if parts.is_empty() {
            parts.push(self.upload_part(1, Bytes::new()).await?);
        }
        self.complete(parts).await
    }
}

/// Read the source until a full part is buffered, or the source ends.
///
/// Returns `None` once the source is exhausted and no bytes remain.
async fn next_part_bytes(
    source: &mut ByteStream,
    pending: &mut Vec<u8>,
    part_size: usize,
    exhausted: &mut bool,
) -> Result<Option<Bytes>> {
    while pending.len() < part_size && !*exhausted {
        match source.next().await {
            Some(Ok(chunk)) => pending.extend_from_slice(&chunk),
            Some(Err(e)) => return Err(e),
            None => *exhausted = true,
        }
    }

    if pending.len() >= part_size {
        let rest = pending.split_off(part_size);
        return Ok(Some(Bytes::from(std::mem::replace(pending, rest))));
    }
    if pending.is_empty() {
        Ok(None)
    } else {
        Ok(Some(Bytes::from(std::mem::take(pending))))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::gateway::ObjectStorage;
    use crate::memory::MemoryProvider;
    use crate::provider::StorageProvider;
    use vaultdrop_common::EncryptionPolicy;
    use vaultdrop_crypto::{GlobalSalt, MasterKey};

    fn transfer() -> TransferId {
        TransferId::new("t-1").unwrap()
    }

    fn engine() -> Arc<CryptoEngine> {
        Arc::new(CryptoEngine::new(
            MasterKey::from_bytes([1u8; 32]),
            GlobalSalt::from_bytes([2u8; 16]),
        ))
    }

    async fn init_plain(provider: &Arc<MemoryProvider>) -> MultipartUpload {
        MultipartUpload::init(
            Arc::clone(provider) as Arc<dyn MultipartStorage>,
            None,
            transfer(),
            "uploads/t-1/big.bin".to_string(),
        )
        .await
        .unwrap()
    }

    fn chunked(data: Vec<u8>, chunk: usize) -> ByteStream {
        let chunks: Vec<_> = data
            .chunks(chunk)
            .map(|c| Ok(Bytes::copy_from_slice(c)))
            .collect();
        Box::pin(futures::stream::iter(chunks))
    }

    async fn collect(mut stream: ByteStream) -> Vec<u8> {
        let mut out = Vec::new();
        while let Some(chunk) = stream.next().await {
            out.extend_from_slice(&chunk.unwrap());
        }
        out
    }

    fn patterned(len: usize) -> Vec<u8> {
        (0..len).map(|i| (i % 251) as u8).collect()
    }

    #[tokio::test]
    async fn test_out_of_order_upload_matches_single_shot() {
        let provider = Arc::new(MemoryProvider::new());
        let data = patterned(40 * 1024); // 3 parts of 16 KiB, last partial

        // Single-shot reference object.
        provider
            .put("reference", Bytes::from(data.clone()), &PutOptions::default())
            .await
            .unwrap();

        let upload = init_plain(&provider).await;
        let part_size = 16 * 1024;
        let p3 = upload
            .upload_part(3, Bytes::copy_from_slice(&data[2 * part_size..]))
            .await
            .unwrap();
        let p1 = upload
            .upload_part(1, Bytes::copy_from_slice(&data[..part_size]))
            .await
            .unwrap();
        let p2 = upload
            .upload_part(2, Bytes::copy_from_slice(&data[part_size..2 * part_size]))
            .await
            .unwrap();

        // Completion list handed over out of numeric order; complete() sorts.
        upload.complete(vec![p3, p1, p2]).await.unwrap();
        assert_eq!(upload.state(), MultipartState::Done);

        let assembled = collect(provider.get("uploads/t-1/big.bin").await.unwrap()).await;
        let reference = collect(provider.get("reference").await.unwrap()).await;
        assert_eq!(assembled, reference);
    }

    #[tokio::test]
    async fn test_part_number_zero_rejected() {
        let provider = Arc::new(MemoryProvider::new());
        let upload = init_plain(&provider).await;
        let err = upload.upload_part(0, Bytes::from_static(b"x")).await.unwrap_err();
        assert!(matches!(err, Error::Multipart(_)));
    }

    #[tokio::test]
    async fn test_missing_part_fails_and_aborts() {
        let provider = Arc::new(MemoryProvider::new());
        let upload = init_plain(&provider).await;
        let p2 = upload.upload_part(2, Bytes::from_static(b"b")).await.unwrap();

        let err = upload.complete(vec![p2]).await.unwrap_err();
        assert!(matches!(err, Error::Multipart(_)));
        assert_eq!(upload.state(), MultipartState::Aborted);
        assert_eq!(provider.open_session_count(), 0);
    }

    #[tokio::test]
    async fn test_store_completion_failure_auto_aborts() {
        let provider = Arc::new(MemoryProvider::new());
        let upload = init_plain(&provider).await;
        let p1 = upload.upload_part(1, Bytes::from_static(b"a")).await.unwrap();

        // Completion stores the assembled object via put; fail it late.
        provider.fail_puts_matching("big.bin");
        let err = upload.complete(vec![p1]).await.unwrap_err();
        assert!(matches!(err, Error::Multipart(_)));
        assert_eq!(upload.state(), MultipartState::Aborted);
    }

    #[tokio::test]
    async fn test_upload_after_complete_rejected() {
        let provider = Arc::new(MemoryProvider::new());
        let upload = init_plain(&provider).await;
        let p1 = upload.upload_part(1, Bytes::from_static(b"a")).await.unwrap();
        upload.complete(vec![p1]).await.unwrap();

        let err = upload.upload_part(2, Bytes::from_static(b"b")).await.unwrap_err();
        assert!(matches!(err, Error::Multipart(_)));
    }

    #[tokio::test]
    async fn test_abort_after_done_rejected_and_idempotent_otherwise() {
        let provider = Arc::new(MemoryProvider::new());

        let upload = init_plain(&provider).await;
        upload.abort().await.unwrap();
        // Second abort is a no-op.
        upload.abort().await.unwrap();
        assert_eq!(upload.state(), MultipartState::Aborted);

        let upload = init_plain(&provider).await;
        let p1 = upload.upload_part(1, Bytes::from_static(b"a")).await.unwrap();
        upload.complete(vec![p1]).await.unwrap();
        assert!(upload.abort().await.is_err());
    }

    #[tokio::test]
    async fn test_pump_stream_roundtrip_encrypted() {
        let provider = Arc::new(MemoryProvider::new());
        let storage = ObjectStorage::new(
            Arc::clone(&provider) as Arc<dyn MultipartStorage>,
            Some(engine()),
            EncryptionPolicy::Opportunistic,
        );
        let t = transfer();
        let data = patterned(40 * 1024);

        let upload = storage.init_multipart(&t, "big.bin").await.unwrap();
        upload
            .pump_stream(chunked(data.clone(), 3000), 16 * 1024, 2, None)
            .await
            .unwrap();

        // The stored object is one envelope; transparent download decrypts it.
        assert!(provider.head("uploads/t-1/big.bin").await.unwrap().encrypted);
        let mut downloaded = Vec::new();
        let mut stream = storage.download(&t, "big.bin").await.unwrap();
        while let Some(chunk) = stream.next().await {
            downloaded.extend_from_slice(&chunk.unwrap());
        }
        assert_eq!(downloaded, data);
    }

    #[tokio::test]
    async fn test_pump_stream_empty_source() {
        let provider = Arc::new(MemoryProvider::new());
        let upload = init_plain(&provider).await;
        upload
            .pump_stream(chunked(Vec::new(), 1), 1024, 2, None)
            .await
            .unwrap();
        let meta = provider.head("uploads/t-1/big.bin").await.unwrap();
        assert_eq!(meta.size, 0);
    }

    #[tokio::test]
    async fn test_pump_part_failure_aborts_session() {
        let provider = Arc::new(MemoryProvider::new());
        provider.fail_puts_matching("big.bin");
        let upload = init_plain(&provider).await;

        let err = upload
            .pump_stream(chunked(patterned(8 * 1024), 1024), 1024, 3, None)
            .await
            .unwrap_err();
        assert!(matches!(err, Error::Storage(_) | Error::Multipart(_)));
        assert_eq!(upload.state(), MultipartState::Aborted);
        assert_eq!(provider.open_session_count(), 0);
    }
}
