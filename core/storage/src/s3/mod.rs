//! S3-compatible storage provider.
//!
//! Talks the S3 REST protocol directly over HTTP with hand-rolled SigV4
//! signing, so any compatible store works: AWS S3, MinIO, Ceph RGW.

mod provider;
mod sign;
mod xml;

pub use provider::S3Provider;

use serde::{Deserialize, Serialize};

/// Connection settings for an S3-compatible store.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct S3Config {
    /// Endpoint URL, e.g. `https://s3.amazonaws.com` or `http://localhost:9000`.
    pub endpoint: String,
    /// Signing region.
    #[serde(default = "default_region")]
    pub region: String,
    /// Bucket name.
    pub bucket: String,
    /// Access key id.
    pub access_key_id: String,
    /// Secret access key.
    pub secret_access_key: String,
    /// Use path-style addressing (`endpoint/bucket/key`) instead of
    /// virtual-hosted style. Required by most self-hosted stores.
    #[serde(default = "default_path_style")]
    pub path_style: bool,
}

fn default_region() -> String {
    "us-east-1".to_string()
}

fn default_path_style() -> bool {
    true
}
