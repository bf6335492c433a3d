//! Object storage for VaultDrop.
//!
//! This module provides a trait-based interface for S3-compatible backends,
//! an in-memory provider for tests, and the two layers built on top of the
//! providers:
//!
//! - the [`ObjectStorage`] gateway, which applies the cipher engine
//!   transparently on every write and read according to the configured
//!   [`EncryptionPolicy`](vaultdrop_common::EncryptionPolicy), and
//! - the [`MultipartUpload`] coordinator, which negotiates multipart
//!   sessions and pumps large inputs through them in bounded waves.
//!
//! # Design Principles
//! - Provider isolation: no backend-specific logic above the provider traits
//! - Capability over reflection: multipart support is the
//!   [`MultipartStorage`] subtrait, not a runtime probe
//! - Streaming support: large objects move as [`ByteStream`]s
//!
//! [`ByteStream`]: vaultdrop_common::ByteStream

pub mod gateway;
pub mod memory;
pub mod multipart;
pub mod progress;
pub mod provider;
pub mod s3;

pub use gateway::{FileUpload, ObjectStorage, UploadOutcome};
pub use memory::MemoryProvider;
pub use multipart::{MultipartState, MultipartUpload, MAX_CONCURRENT_PARTS, PART_SIZE};
pub use progress::{ChannelObserver, ProgressEvent, ProgressObserver};
pub use provider::{CompletedPart, MultipartStorage, ObjectMeta, PutOptions, StorageProvider};
pub use s3::{S3Config, S3Provider};
