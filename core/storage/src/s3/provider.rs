//! The S3 provider implementation.

use async_trait::async_trait;
use bytes::Bytes;
use chrono::{DateTime, Utc};
use futures::StreamExt;
use reqwest::{Client, Method, StatusCode};
use std::time::Duration;
use tracing::{debug, warn};

use super::sign::{canonical_query_string, encode_path, sha256_hex, Signer, EMPTY_SHA256};
use super::{xml, S3Config};
use crate::provider::{
    name_from_key, CompletedPart, MultipartStorage, ObjectMeta, PutOptions, StorageProvider,
};
use vaultdrop_common::{ByteStream, Error, Result};

/// User metadata header carrying the at-rest encryption flag.
const META_ENCRYPTED: &str = "x-amz-meta-encrypted";

/// Page size requested from ListObjectsV2.
const LIST_PAGE_SIZE: &str = "1000";

/// S3-compatible storage provider with SigV4 request signing.
pub struct S3Provider {
    http: Client,
    signer: Signer,
    /// Host header value, bucket-prefixed under virtual-hosted addressing.
    host: String,
    /// `scheme://host[:port]`, no trailing slash.
    base_url: String,
    /// `/bucket` under path-style addressing, empty otherwise.
    path_prefix: String,
}

impl S3Provider {
    /// Create a provider for the given store.
    ///
    /// # Errors
    /// - `Error::InvalidInput` if the endpoint URL does not parse
    pub fn new(config: S3Config) -> Result<Self> {
        let endpoint = url::Url::parse(&config.endpoint)
            .map_err(|e| Error::InvalidInput(format!("Invalid S3 endpoint: {}", e)))?;
        let endpoint_host = endpoint
            .host_str()
            .ok_or_else(|| Error::InvalidInput("S3 endpoint has no host".to_string()))?;

        let bare_host = match endpoint.port() {
            Some(port) => format!("{}:{}", endpoint_host, port),
            None => endpoint_host.to_string(),
        };
        let (host, path_prefix) = if config.path_style {
            (bare_host, format!("/{}", config.bucket))
        } else {
            (format!("{}.{}", config.bucket, bare_host), String::new())
        };
        let base_url = format!("{}://{}", endpoint.scheme(), host);

        let http = Client::builder()
            .user_agent("VaultDrop/0.1")
            .build()
            .map_err(|e| Error::Storage(format!("Failed to create HTTP client: {}", e)))?;
        let signer = Signer::new(&config.access_key_id, &config.secret_access_key, &config.region);

        Ok(Self {
            http,
            signer,
            host,
            base_url,
            path_prefix,
        })
    }

    fn canonical_uri(&self, key: &str) -> String {
        encode_path(&format!("{}/{}", self.path_prefix, key))
    }

    /// Sign and send one request; non-success statuses become errors.
    async fn send(
        &self,
        method: Method,
        key: &str,
        query: &[(String, String)],
        extra_headers: &[(String, String)],
        body: Option<Bytes>,
    ) -> Result<reqwest::Response> {
        let canonical_uri = self.canonical_uri(key);
        let payload_hash = match &body {
            Some(data) => sha256_hex(data),
            None => EMPTY_SHA256.to_string(),
        };
        let headers = self.signer.auth_headers(
            method.as_str(),
            &self.host,
            &canonical_uri,
            query,
            extra_headers,
            &payload_hash,
            Utc::now(),
        );

        let query_string = canonical_query_string(query);
        let mut url = format!("{}{}", self.base_url, canonical_uri);
        if !query_string.is_empty() {
            url.push('?');
            url.push_str(&query_string);
        }

        let mut request = self.http.request(method.clone(), &url);
        for (name, value) in &headers {
            request = request.header(name.as_str(), value.as_str());
        }
        if let Some(data) = body {
            request = request.body(data);
        }

        let response = request
            .send()
            .await
            .map_err(|e| Error::Storage(format!("Request to {} failed: {}", self.host, e)))?;

        let status = response.status();
        if status.is_success() {
            Ok(response)
        } else if status == StatusCode::NOT_FOUND {
            Err(Error::NotFound(format!("Object not found: {}", key)))
        } else {
            let body = response.text().await.unwrap_or_default();
            Err(Error::Storage(format!(
                "{} {} failed: {} - {}",
                method, key, status, body
            )))
        }
    }

    fn meta_headers(opts: &PutOptions) -> Vec<(String, String)> {
        vec![
            ("content-type".to_string(), opts.content_type.clone()),
            (META_ENCRYPTED.to_string(), opts.encrypted.to_string()),
        ]
    }

    fn meta_from_response(key: &str, response: &reqwest::Response) -> ObjectMeta {
        let header = |name: &str| {
            response
                .headers()
                .get(name)
                .and_then(|v| v.to_str().ok())
                .map(str::to_string)
        };

        ObjectMeta {
            key: key.to_string(),
            name: name_from_key(key),
            size: header("content-length")
                .and_then(|v| v.parse().ok())
                .unwrap_or(0),
            encrypted: header(META_ENCRYPTED).as_deref() == Some("true"),
            content_type: header("content-type")
                .unwrap_or_else(|| "application/octet-stream".to_string()),
            modified: header("last-modified")
                .and_then(|v| DateTime::parse_from_rfc2822(&v).ok())
                .map(|d| d.with_timezone(&Utc))
                .unwrap_or_else(Utc::now),
            etag: header("etag"),
        }
    }
}

#[async_trait]
impl StorageProvider for S3Provider {
    fn name(&self) -> &str {
        "s3"
    }

    async fn put(&self, key: &str, data: Bytes, opts: &PutOptions) -> Result<ObjectMeta> {
        let size = data.len() as u64;
        let response = self
            .send(Method::PUT, key, &[], &Self::meta_headers(opts), Some(data))
            .await?;
        debug!(key = %key, size, "Stored object");

        let mut meta = Self::meta_from_response(key, &response);
        meta.size = size;
        meta.encrypted = opts.encrypted;
        meta.content_type = opts.content_type.clone();
        Ok(meta)
    }

    async fn put_stream(
        &self,
        key: &str,
        mut stream: ByteStream,
        opts: &PutOptions,
    ) -> Result<ObjectMeta> {
        // SigV4 needs the payload hash up front, so buffer the stream.
        // Callers with large inputs go through the multipart session instead.
        let mut data = Vec::new();
        while let Some(chunk) = stream.next().await {
            data.extend_from_slice(&chunk?);
        }
        self.put(key, Bytes::from(data), opts).await
    }

    async fn get(&self, key: &str) -> Result<ByteStream> {
        let response = self.send(Method::GET, key, &[], &[], None).await?;
        let key = key.to_string();
        let stream = response.bytes_stream().map(move |result| {
            result.map_err(|e| Error::Storage(format!("Read of {} failed: {}", key, e)))
        });
        Ok(Box::pin(stream))
    }

    async fn head(&self, key: &str) -> Result<ObjectMeta> {
        let response = self.send(Method::HEAD, key, &[], &[], None).await?;
        Ok(Self::meta_from_response(key, &response))
    }

    async fn delete(&self, key: &str) -> Result<()> {
        self.send(Method::DELETE, key, &[], &[], None).await?;
        Ok(())
    }

    async fn list(&self, prefix: &str) -> Result<Vec<ObjectMeta>> {
        let mut entries = Vec::new();
        let mut token: Option<String> = None;

        loop {
            let mut query = vec![
                ("list-type".to_string(), "2".to_string()),
                ("prefix".to_string(), prefix.to_string()),
                ("max-keys".to_string(), LIST_PAGE_SIZE.to_string()),
            ];
            if let Some(t) = &token {
                query.push(("continuation-token".to_string(), t.clone()));
            }

            let response = self.send(Method::GET, "", &query, &[], None).await?;
            let body = response
                .text()
                .await
                .map_err(|e| Error::Storage(format!("List read failed: {}", e)))?;
            let page = xml::parse_list_page(&body)?;
            entries.extend(page.entries);

            match page.next_token {
                Some(t) => token = Some(t),
                None => break,
            }
        }

        // Listing does not return user metadata; one HEAD per entry fills
        // in the encryption flag and content type.
        let mut metas = Vec::with_capacity(entries.len());
        for entry in entries {
            match self.head(&entry.key).await {
                Ok(meta) => metas.push(meta),
                Err(e) => {
                    warn!(key = %entry.key, error = %e, "HEAD during listing failed");
                    metas.push(ObjectMeta {
                        key: entry.key.clone(),
                        name: name_from_key(&entry.key),
                        size: entry.size,
                        encrypted: false,
                        content_type: "application/octet-stream".to_string(),
                        modified: entry.modified.unwrap_or_else(Utc::now),
                        etag: entry.etag,
                    });
                }
            }
        }
        metas.sort_by(|a, b| a.key.cmp(&b.key));
        Ok(metas)
    }

    async fn signed_url(&self, key: &str, ttl: Duration) -> Result<String> {
        // Fails early on missing objects so callers never hand out dead links.
        self.head(key).await?;

        let canonical_uri = self.canonical_uri(key);
        let query = self
            .signer
            .presign_query("GET", &self.host, &canonical_uri, ttl, Utc::now());
        Ok(format!("{}{}?{}", self.base_url, canonical_uri, query))
    }
}

#[async_trait]
impl MultipartStorage for S3Provider {
    async fn create_multipart(&self, key: &str, opts: &PutOptions) -> Result<String> {
        let query = vec![("uploads".to_string(), String::new())];
        let response = self
            .send(Method::POST, key, &query, &Self::meta_headers(opts), None)
            .await?;
        let body = response
            .text()
            .await
            .map_err(|e| Error::Storage(format!("Initiate read failed: {}", e)))?;
        let upload_id = xml::parse_upload_id(&body)?;
        debug!(key = %key, upload_id = %upload_id, "Initiated multipart upload");
        Ok(upload_id)
    }

    async fn upload_part(
        &self,
        key: &str,
        upload_id: &str,
        part_number: u32,
        data: Bytes,
    ) -> Result<String> {
        let query = vec![
            ("partNumber".to_string(), part_number.to_string()),
            ("uploadId".to_string(), upload_id.to_string()),
        ];
        let response = self.send(Method::PUT, key, &query, &[], Some(data)).await?;

        response
            .headers()
            .get("etag")
            .and_then(|v| v.to_str().ok())
            .map(str::to_string)
            .ok_or_else(|| {
                Error::Storage(format!("Part {} response carries no ETag", part_number))
            })
    }

    async fn complete_multipart(
        &self,
        key: &str,
        upload_id: &str,
        parts: &[CompletedPart],
    ) -> Result<ObjectMeta> {
        let query = vec![("uploadId".to_string(), upload_id.to_string())];
        let body = Bytes::from(xml::complete_body(parts));
        let response = self
            .send(Method::POST, key, &query, &[], Some(body))
            .await?;

        // S3 may return 200 with an error document in the body.
        let body = response
            .text()
            .await
            .map_err(|e| Error::Storage(format!("Complete read failed: {}", e)))?;
        if body.contains("<Error>") {
            return Err(Error::Storage(format!(
                "Completion of {} rejected: {}",
                key, body
            )));
        }

        self.head(key).await
    }

    async fn abort_multipart(&self, key: &str, upload_id: &str) -> Result<()> {
        let query = vec![("uploadId".to_string(), upload_id.to_string())];
        self.send(Method::DELETE, key, &query, &[], None).await?;
        Ok(())
    }
}
