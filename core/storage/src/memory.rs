//! In-memory storage provider for testing.

use async_trait::async_trait;
use bytes::Bytes;
use chrono::Utc;
use futures::{stream, StreamExt};
use std::collections::{BTreeMap, HashMap};
use std::sync::{Arc, RwLock};
use std::task::Poll;
use std::time::Duration;
use uuid::Uuid;

use crate::provider::{
    name_from_key, CompletedPart, MultipartStorage, ObjectMeta, PutOptions, StorageProvider,
};
use vaultdrop_common::{ByteStream, Error, Result};

/// Read chunk size for simulated download streams. Deliberately small so
/// stream consumers see multiple chunks even for modest objects.
const STREAM_CHUNK: usize = 8 * 1024;

#[derive(Debug, Clone)]
struct StoredObject {
    data: Bytes,
    meta: ObjectMeta,
}

#[derive(Debug)]
struct MultipartSession {
    key: String,
    opts: PutOptions,
    parts: BTreeMap<u32, (String, Bytes)>,
}

/// In-memory storage provider.
///
/// Useful for testing and development. All data is stored in memory and lost
/// on drop. Supports failure and stall injection so partial-failure and
/// timeout behavior can be driven deterministically from tests.
#[derive(Default)]
pub struct MemoryProvider {
    objects: Arc<RwLock<HashMap<String, StoredObject>>>,
    sessions: Arc<RwLock<HashMap<String, MultipartSession>>>,
    fail_puts: RwLock<Vec<String>>,
    stall_gets: RwLock<Vec<String>>,
}

impl MemoryProvider {
    /// Create a new empty memory provider.
    pub fn new() -> Self {
        Self::default()
    }

    /// Make every `put` whose key contains `fragment` fail with a storage
    /// error.
    pub fn fail_puts_matching(&self, fragment: impl Into<String>) {
        self.fail_puts.write().unwrap().push(fragment.into());
    }

    /// Make every `get` whose key contains `fragment` return a stream that
    /// never yields, simulating a stalled remote read.
    pub fn stall_gets_matching(&self, fragment: impl Into<String>) {
        self.stall_gets.write().unwrap().push(fragment.into());
    }

    /// Number of live multipart sessions, for leak assertions in tests.
    pub fn open_session_count(&self) -> usize {
        self.sessions.read().unwrap().len()
    }

    fn put_should_fail(&self, key: &str) -> bool {
        self.fail_puts
            .read()
            .unwrap()
            .iter()
            .any(|f| key.contains(f.as_str()))
    }

    fn get_should_stall(&self, key: &str) -> bool {
        self.stall_gets
            .read()
            .unwrap()
            .iter()
            .any(|f| key.contains(f.as_str()))
    }

    fn meta_for(key: &str, size: u64, opts: &PutOptions) -> ObjectMeta {
        ObjectMeta {
            key: key.to_string(),
            name: name_from_key(key),
            size,
            encrypted: opts.encrypted,
            content_type: opts.content_type.clone(),
            modified: Utc::now(),
            etag: Some(format!("\"{}\"", Uuid::new_v4())),
        }
    }
}

#[async_trait]
impl StorageProvider for MemoryProvider {
    fn name(&self) -> &str {
        "memory"
    }

    async fn put(&self, key: &str, data: Bytes, opts: &PutOptions) -> Result<ObjectMeta> {
        if self.put_should_fail(key) {
            return Err(Error::Storage(format!("Injected put failure for {}", key)));
        }

        let meta = Self::meta_for(key, data.len() as u64, opts);
        self.objects.write().unwrap().insert(
            key.to_string(),
            StoredObject {
                data,
                meta: meta.clone(),
            },
        );
        Ok(meta)
    }

    async fn put_stream(
        &self,
        key: &str,
        mut stream: ByteStream,
        opts: &PutOptions,
    ) -> Result<ObjectMeta> {
        let mut data = Vec::new();
        while let Some(chunk) = stream.next().await {
            data.extend_from_slice(&chunk?);
        }
        self.put(key, Bytes::from(data), opts).await
    }

    async fn get(&self, key: &str) -> Result<ByteStream> {
        if self.get_should_stall(key) {
            return Ok(Box::pin(stream::poll_fn(|_| Poll::Pending)));
        }

        let data = {
            let objects = self.objects.read().unwrap();
            objects
                .get(key)
                .map(|o| o.data.clone())
                .ok_or_else(|| Error::NotFound(format!("Object not found: {}", key)))?
        };

        let chunks: Vec<_> = (0..data.len().max(1))
            .step_by(STREAM_CHUNK)
            .map(|start| {
                let end = (start + STREAM_CHUNK).min(data.len());
                Ok(data.slice(start..end))
            })
            .collect();
        Ok(Box::pin(stream::iter(chunks)))
    }

    async fn head(&self, key: &str) -> Result<ObjectMeta> {
        self.objects
            .read()
            .unwrap()
            .get(key)
            .map(|o| o.meta.clone())
            .ok_or_else(|| Error::NotFound(format!("Object not found: {}", key)))
    }

    async fn delete(&self, key: &str) -> Result<()> {
        self.objects.write().unwrap().remove(key);
        Ok(())
    }

    async fn list(&self, prefix: &str) -> Result<Vec<ObjectMeta>> {
        let objects = self.objects.read().unwrap();
        let mut metas: Vec<_> = objects
            .values()
            .filter(|o| o.meta.key.starts_with(prefix))
            .map(|o| o.meta.clone())
            .collect();
        metas.sort_by(|a, b| a.key.cmp(&b.key));
        Ok(metas)
    }

    async fn signed_url(&self, key: &str, ttl: Duration) -> Result<String> {
        if !self.objects.read().unwrap().contains_key(key) {
            return Err(Error::NotFound(format!("Object not found: {}", key)));
        }
        Ok(format!("memory://{}?expires={}", key, ttl.as_secs()))
    }
}

#[async_trait]
impl MultipartStorage for MemoryProvider {
    async fn create_multipart(&self, key: &str, opts: &PutOptions) -> Result<String> {
        let upload_id = Uuid::new_v4().to_string();
        self.sessions.write().unwrap().insert(
            upload_id.clone(),
            MultipartSession {
                key: key.to_string(),
                opts: opts.clone(),
                parts: BTreeMap::new(),
            },
        );
        Ok(upload_id)
    }

    async fn upload_part(
        &self,
        key: &str,
        upload_id: &str,
        part_number: u32,
        data: Bytes,
    ) -> Result<String> {
        if part_number == 0 {
            return Err(Error::Storage("Part numbers start at 1".to_string()));
        }
        if self.put_should_fail(key) {
            return Err(Error::Storage(format!("Injected put failure for {}", key)));
        }

        let mut sessions = self.sessions.write().unwrap();
        let session = sessions
            .get_mut(upload_id)
            .ok_or_else(|| Error::NotFound(format!("No such upload: {}", upload_id)))?;
        if session.key != key {
            return Err(Error::Storage(format!(
                "Upload {} belongs to key {}",
                upload_id, session.key
            )));
        }

        let etag = format!("\"{}\"", Uuid::new_v4());
        session.parts.insert(part_number, (etag.clone(), data));
        Ok(etag)
    }

    async fn complete_multipart(
        &self,
        key: &str,
        upload_id: &str,
        parts: &[CompletedPart],
    ) -> Result<ObjectMeta> {
        let session = {
            let mut sessions = self.sessions.write().unwrap();
            sessions
                .remove(upload_id)
                .ok_or_else(|| Error::NotFound(format!("No such upload: {}", upload_id)))?
        };
        if session.key != key {
            return Err(Error::Storage(format!(
                "Upload {} belongs to key {}",
                upload_id, session.key
            )));
        }

        if parts.is_empty() {
            return Err(Error::Storage("Complete requires at least one part".to_string()));
        }
        // Real stores reject part lists that are not in ascending order.
        for pair in parts.windows(2) {
            if pair[1].part_number <= pair[0].part_number {
                return Err(Error::Storage(format!(
                    "Part list out of order: {} after {}",
                    pair[1].part_number, pair[0].part_number
                )));
            }
        }
        for (i, part) in parts.iter().enumerate() {
            if part.part_number != (i + 1) as u32 {
                return Err(Error::Storage(format!(
                    "Missing part {} in completion list",
                    i + 1
                )));
            }
        }

        let mut assembled = Vec::new();
        for part in parts {
            let (etag, data) = session.parts.get(&part.part_number).ok_or_else(|| {
                Error::Storage(format!("Part {} was never uploaded", part.part_number))
            })?;
            if etag != &part.etag {
                return Err(Error::Storage(format!(
                    "ETag mismatch for part {}",
                    part.part_number
                )));
            }
            assembled.extend_from_slice(data);
        }

        self.put(&session.key, Bytes::from(assembled), &session.opts)
            .await
    }

    async fn abort_multipart(&self, _key: &str, upload_id: &str) -> Result<()> {
        self.sessions.write().unwrap().remove(upload_id);
        Ok(())
    }
}
