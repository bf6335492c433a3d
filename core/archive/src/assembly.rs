//! The archive assembly engine.
//!
//! One [`assemble`] call turns every object stored under a transfer into a
//! single streamed zip. Files are fetched through the storage gateway (so
//! decryption is transparent) in fixed-size batches, one file at a time in
//! listed order; the output stream applies backpressure through a bounded
//! channel so the whole set is never buffered in memory.
//!
//! Every source stream runs behind a spawned forwarding task whose abort
//! handle is tracked in a shared registry. A forwarder is removed from the
//! registry by completion, error, or forced teardown, so no handle outlives
//! the job.

use bytes::Bytes;
use futures::StreamExt;
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::{mpsc, oneshot};
use tokio::task::AbortHandle;
use tokio::time::timeout;
use tracing::{debug, error, info, warn};

use crate::zip::{estimate_archive_size, ZipWriter};
use vaultdrop_common::{ByteStream, Error, Result, TransferId};
use vaultdrop_storage::ObjectStorage;

/// What to do when one file exceeds the per-file timeout.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum TimeoutPolicy {
    /// Close the truncated entry, record the omission, continue. Partial
    /// delivery beats total failure.
    #[default]
    SkipFile,
    /// Tear the whole archive down with `Error::ArchiveTimeout`.
    Abort,
}

/// Assembly tuning knobs.
#[derive(Debug, Clone)]
pub struct ArchiveConfig {
    /// Files per batch; batches run strictly sequentially.
    pub batch_size: usize,
    /// Budget for fetching and writing one file.
    pub per_file_timeout: Duration,
    /// Budget for writing the central directory and flushing the tail.
    pub finalize_timeout: Duration,
    /// Pause before tearing down stragglers after a successful finalize.
    pub grace_delay: Duration,
    /// Reaction to a per-file timeout.
    pub on_file_timeout: TimeoutPolicy,
    /// Output channel capacity, in chunks.
    pub channel_capacity: usize,
}

impl Default for ArchiveConfig {
    fn default() -> Self {
        Self {
            batch_size: 10,
            per_file_timeout: Duration::from_secs(180),
            finalize_timeout: Duration::from_secs(300),
            grace_delay: Duration::from_millis(100),
            on_file_timeout: TimeoutPolicy::SkipFile,
            channel_capacity: 16,
        }
    }
}

/// A file left out of the archive, and why.
#[derive(Debug, Clone)]
pub struct OmittedFile {
    pub name: String,
    pub reason: String,
}

/// Manifest of what the finished archive actually contains.
#[derive(Debug, Clone, Default)]
pub struct ArchiveSummary {
    /// Entry names written in full.
    pub written: Vec<String>,
    /// Files skipped or truncated, with reasons.
    pub omitted: Vec<OmittedFile>,
}

/// A streaming archive response.
pub struct Archive {
    /// The zip bytes. Errors are in-band; dropping the stream cancels the job.
    pub stream: ByteStream,
    /// Content-Length hint. Exact when nothing is omitted.
    pub estimated_size: u64,
    /// Always `application/zip`.
    pub content_type: &'static str,
    /// Resolves once the job finishes. Dropped without a value if the job
    /// aborts.
    pub summary: oneshot::Receiver<ArchiveSummary>,
}

/// Registry of abort handles for in-flight source forwarders.
#[derive(Clone, Default)]
struct ActiveStreams {
    inner: Arc<Mutex<HashMap<u64, AbortHandle>>>,
    next_id: Arc<AtomicU64>,
}

impl ActiveStreams {
    fn register(&self, handle: AbortHandle) -> u64 {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        self.inner.lock().unwrap().insert(id, handle);
        id
    }

    /// Abort and deregister one forwarder. Idempotent.
    fn finish(&self, id: u64) {
        if let Some(handle) = self.inner.lock().unwrap().remove(&id) {
            handle.abort();
        }
    }

    /// Force-destroy every tracked forwarder.
    fn abort_all(&self) {
        let mut inner = self.inner.lock().unwrap();
        for (_, handle) in inner.drain() {
            handle.abort();
        }
    }

    fn len(&self) -> usize {
        self.inner.lock().unwrap().len()
    }
}

/// Assemble a streaming zip of everything stored under `transfer`.
///
/// Listing failures surface immediately; per-file failures after that are
/// downgraded to omissions in the summary. An empty transfer yields a valid
/// empty archive.
///
/// # Errors
/// - `Error::Storage` if the transfer's objects cannot be listed
pub async fn assemble(
    storage: Arc<ObjectStorage>,
    transfer: &TransferId,
    config: ArchiveConfig,
) -> Result<Archive> {
    let objects = storage.list(transfer).await?;
    let names: Vec<String> = objects.iter().map(|m| m.name.clone()).collect();
    // Sizes of encrypted objects include the envelope, so the estimate runs
    // slightly high for them. It is a hint, not a promise.
    let estimated_size =
        estimate_archive_size(objects.iter().map(|m| (m.name.as_str(), m.size)));

    info!(transfer = %transfer, files = names.len(), estimated_size, "Assembling archive");

    let (chunk_tx, chunk_rx) = mpsc::channel::<Result<Bytes>>(config.channel_capacity.max(1));
    let (summary_tx, summary_rx) = oneshot::channel();

    let transfer = transfer.clone();
    tokio::spawn(async move {
        run_job(storage, transfer, names, config, chunk_tx, summary_tx).await;
    });

    Ok(Archive {
        stream: Box::pin(tokio_stream_from(chunk_rx)),
        estimated_size,
        content_type: "application/zip",
        summary: summary_rx,
    })
}

fn tokio_stream_from(
    rx: mpsc::Receiver<Result<Bytes>>,
) -> impl futures::Stream<Item = Result<Bytes>> {
    futures::stream::unfold(rx, |mut rx| async move {
        rx.recv().await.map(|item| (item, rx))
    })
}

async fn run_job(
    storage: Arc<ObjectStorage>,
    transfer: TransferId,
    names: Vec<String>,
    config: ArchiveConfig,
    chunk_tx: mpsc::Sender<Result<Bytes>>,
    summary_tx: oneshot::Sender<ArchiveSummary>,
) {
    let active = ActiveStreams::default();
    let mut writer = ZipWriter::new(Vec::new());
    let mut summary = ArchiveSummary::default();

    for (batch_index, batch) in names.chunks(config.batch_size.max(1)).enumerate() {
        debug!(transfer = %transfer, batch = batch_index, files = batch.len(), "Processing batch");
        for name in batch {
            match write_file(&storage, &transfer, name, &config, &active, &mut writer, &chunk_tx)
                .await
            {
                Ok(FileOutcome::Written) => summary.written.push(name.clone()),
                Ok(FileOutcome::Omitted(reason)) => {
                    warn!(transfer = %transfer, file = %name, reason = %reason, "File omitted from archive");
                    summary.omitted.push(OmittedFile {
                        name: name.clone(),
                        reason,
                    });
                }
                Err(e) => {
                    // Writer or consumer failure; nothing more can be sent.
                    error!(transfer = %transfer, error = %e, "Archive job aborted");
                    active.abort_all();
                    let _ = chunk_tx.send(Err(e)).await;
                    return;
                }
            }
        }
    }

    match timeout(config.finalize_timeout, finalize(writer, &chunk_tx)).await {
        Ok(Ok(())) => {
            debug!(transfer = %transfer, written = summary.written.len(),
                omitted = summary.omitted.len(), "Archive finalized");
            tokio::time::sleep(config.grace_delay).await;
            active.abort_all();
            let _ = summary_tx.send(summary);
        }
        Ok(Err(e)) => {
            error!(transfer = %transfer, error = %e, "Archive finalize failed");
            active.abort_all();
            let _ = chunk_tx.send(Err(e)).await;
        }
        Err(_) => {
            error!(transfer = %transfer, "Archive finalize timed out");
            active.abort_all();
            let _ = chunk_tx
                .send(Err(Error::ArchiveTimeout(format!(
                    "Finalize of archive for {} timed out",
                    transfer
                ))))
                .await;
        }
    }
}

enum FileOutcome {
    Written,
    Omitted(String),
}

/// Stream one file into the archive.
///
/// Returns `Ok(Omitted)` for per-file trouble the job survives; `Err` only
/// for failures that kill the whole archive (sink or consumer gone, or the
/// Abort timeout policy firing).
async fn write_file(
    storage: &Arc<ObjectStorage>,
    transfer: &TransferId,
    name: &str,
    config: &ArchiveConfig,
    active: &ActiveStreams,
    writer: &mut ZipWriter<Vec<u8>>,
    chunk_tx: &mpsc::Sender<Result<Bytes>>,
) -> Result<FileOutcome> {
    let source = match storage.download(transfer, name).await {
        Ok(stream) => stream,
        Err(e) => return Ok(FileOutcome::Omitted(format!("Fetch failed: {}", e))),
    };

    // The forwarder decouples the source from the writer so a slow or
    // wedged source can be aborted without poisoning the zip state.
    let (fwd_tx, mut fwd_rx) = mpsc::channel::<Result<Bytes>>(4);
    let forwarder = tokio::spawn(forward(source, fwd_tx));
    let stream_id = active.register(forwarder.abort_handle());

    writer.begin_entry(name)?;
    // The inner result separates source errors (omission-worthy, outer
    // `Option`) from writer and consumer errors (fatal, outer `Err`).
    let piped = timeout(config.per_file_timeout, async {
        while let Some(item) = fwd_rx.recv().await {
            let chunk = match item {
                Ok(chunk) => chunk,
                Err(e) => return Ok(Some(e)),
            };
            writer.write_chunk(&chunk)?;
            drain_to_channel(writer, chunk_tx).await?;
        }
        Ok::<_, Error>(None)
    })
    .await;
    active.finish(stream_id);

    let outcome = match piped {
        Ok(Ok(None)) => {
            writer.end_entry()?;
            FileOutcome::Written
        }
        Ok(Ok(Some(e))) => {
            writer.end_entry()?;
            FileOutcome::Omitted(format!("Read failed mid-stream: {}", e))
        }
        Ok(Err(e)) => return Err(e),
        Err(_) => {
            writer.end_entry()?;
            match config.on_file_timeout {
                TimeoutPolicy::SkipFile => FileOutcome::Omitted(format!(
                    "Timed out after {:?}",
                    config.per_file_timeout
                )),
                TimeoutPolicy::Abort => {
                    return Err(Error::ArchiveTimeout(format!(
                        "File {} exceeded the per-file timeout",
                        name
                    )));
                }
            }
        }
    };
    drain_to_channel(writer, chunk_tx).await?;
    Ok(outcome)
}

async fn forward(mut source: ByteStream, tx: mpsc::Sender<Result<Bytes>>) {
    while let Some(item) = source.next().await {
        if tx.send(item).await.is_err() {
            break;
        }
    }
}

/// Move buffered zip bytes out to the bounded output channel.
async fn drain_to_channel(
    writer: &mut ZipWriter<Vec<u8>>,
    chunk_tx: &mpsc::Sender<Result<Bytes>>,
) -> Result<()> {
    let buffered = writer.sink_mut();
    if buffered.is_empty() {
        return Ok(());
    }
    let chunk = Bytes::from(std::mem::take(buffered));
    chunk_tx
        .send(Ok(chunk))
        .await
        .map_err(|_| Error::Storage("Archive consumer went away".to_string()))
}

async fn finalize(writer: ZipWriter<Vec<u8>>, chunk_tx: &mpsc::Sender<Result<Bytes>>) -> Result<()> {
    let tail = writer.finish()?;
    if !tail.is_empty() {
        chunk_tx
            .send(Ok(Bytes::from(tail)))
            .await
            .map_err(|_| Error::Storage("Archive consumer went away".to_string()))?;
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::zip::reader;
    use vaultdrop_common::EncryptionPolicy;
    use vaultdrop_crypto::{CryptoEngine, GlobalSalt, MasterKey};
    use vaultdrop_storage::{MemoryProvider, MultipartStorage};

    fn storage(provider: Arc<MemoryProvider>) -> Arc<ObjectStorage> {
        let engine = Arc::new(CryptoEngine::new(
            MasterKey::from_bytes([1u8; 32]),
            GlobalSalt::from_bytes([2u8; 16]),
        ));
        Arc::new(ObjectStorage::new(
            provider as Arc<dyn MultipartStorage>,
            Some(engine),
            EncryptionPolicy::Opportunistic,
        ))
    }

    fn transfer() -> TransferId {
        TransferId::new("t-1").unwrap()
    }

    fn payload(len: usize) -> Bytes {
        Bytes::from((0..len).map(|i| (i % 251) as u8).collect::<Vec<u8>>())
    }

    async fn collect(mut stream: ByteStream) -> Result<Vec<u8>> {
        let mut out = Vec::new();
        while let Some(chunk) = stream.next().await {
            out.extend_from_slice(&chunk?);
        }
        Ok(out)
    }

    fn fast_config() -> ArchiveConfig {
        ArchiveConfig {
            per_file_timeout: Duration::from_millis(200),
            finalize_timeout: Duration::from_secs(5),
            grace_delay: Duration::from_millis(1),
            ..Default::default()
        }
    }

    #[tokio::test]
    async fn test_archive_contains_all_files_with_original_sizes() {
        let provider = Arc::new(MemoryProvider::new());
        let storage = storage(Arc::clone(&provider));
        let t = transfer();

        let files = [("a.txt", 100), ("b.bin", 20_000), ("c.dat", 1)];
        for (name, len) in files {
            storage.upload(&t, name, payload(len)).await.unwrap();
        }

        let archive = assemble(Arc::clone(&storage), &t, fast_config())
            .await
            .unwrap();
        assert_eq!(archive.content_type, "application/zip");
        let data = collect(archive.stream).await.unwrap();

        let entries = reader::parse(&data);
        assert_eq!(entries.len(), 3);
        for (name, len) in files {
            let entry = entries.iter().find(|e| e.name == name).unwrap();
            assert_eq!(entry.size, len as u64, "size of {}", name);
        }

        let summary = archive.summary.await.unwrap();
        assert_eq!(summary.written.len(), 3);
        assert!(summary.omitted.is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn test_stalled_file_is_omitted_and_archive_survives() {
        let provider = Arc::new(MemoryProvider::new());
        let storage = storage(Arc::clone(&provider));
        let t = transfer();

        storage.upload(&t, "ok-1.txt", payload(500)).await.unwrap();
        storage.upload(&t, "stuck.bin", payload(500)).await.unwrap();
        storage.upload(&t, "ok-2.txt", payload(700)).await.unwrap();
        provider.stall_gets_matching("stuck.bin");

        let archive = assemble(Arc::clone(&storage), &t, fast_config())
            .await
            .unwrap();
        let data = collect(archive.stream).await.unwrap();

        let entries = reader::parse(&data);
        let ok: Vec<_> = entries
            .iter()
            .filter(|e| e.name.starts_with("ok-"))
            .collect();
        assert_eq!(ok.len(), 2);
        assert_eq!(ok.iter().map(|e| e.size).sum::<u64>(), 1200);

        let summary = archive.summary.await.unwrap();
        assert_eq!(summary.written.len(), 2);
        assert_eq!(summary.omitted.len(), 1);
        assert_eq!(summary.omitted[0].name, "stuck.bin");
    }

    #[tokio::test(start_paused = true)]
    async fn test_abort_policy_kills_archive_on_timeout() {
        let provider = Arc::new(MemoryProvider::new());
        let storage = storage(Arc::clone(&provider));
        let t = transfer();

        storage.upload(&t, "stuck.bin", payload(500)).await.unwrap();
        provider.stall_gets_matching("stuck.bin");

        let config = ArchiveConfig {
            on_file_timeout: TimeoutPolicy::Abort,
            ..fast_config()
        };
        let archive = assemble(Arc::clone(&storage), &t, config).await.unwrap();
        let err = collect(archive.stream).await.unwrap_err();
        assert!(err.is_timeout());
        assert!(archive.summary.await.is_err());
    }

    #[tokio::test]
    async fn test_empty_transfer_yields_empty_archive() {
        let provider = Arc::new(MemoryProvider::new());
        let storage = storage(provider);

        let archive = assemble(Arc::clone(&storage), &transfer(), fast_config())
            .await
            .unwrap();
        assert_eq!(archive.estimated_size, 22);
        let data = collect(archive.stream).await.unwrap();
        assert_eq!(data.len(), 22);
        assert!(reader::parse(&data).is_empty());
    }

    #[tokio::test]
    async fn test_dropped_stream_stops_job() {
        let provider = Arc::new(MemoryProvider::new());
        let storage = storage(Arc::clone(&provider));
        let t = transfer();
        for i in 0..5 {
            storage
                .upload(&t, &format!("f-{}.bin", i), payload(200_000))
                .await
                .unwrap();
        }

        let archive = assemble(Arc::clone(&storage), &t, fast_config())
            .await
            .unwrap();
        drop(archive.stream);
        // The summary side resolves with an error once the job bails out.
        assert!(archive.summary.await.is_err());
    }

    #[test]
    fn test_active_streams_no_orphans() {
        let active = ActiveStreams::default();
        let rt = tokio::runtime::Builder::new_current_thread()
            .enable_all()
            .build()
            .unwrap();
        rt.block_on(async {
            let a = active.register(tokio::spawn(async {}).abort_handle());
            let b = active.register(tokio::spawn(std::future::pending::<()>()).abort_handle());
            assert_eq!(active.len(), 2);
            active.finish(a);
            active.finish(a); // idempotent
            assert_eq!(active.len(), 1);
            active.abort_all();
            assert_eq!(active.len(), 0);
            let _ = b;
        });
    }
}
