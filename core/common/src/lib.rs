//! Common utilities and types shared across VaultDrop modules.
//!
//! This module provides the error taxonomy and foundational types used
//! throughout the storage engine, ensuring consistency and type safety.

pub mod error;
pub mod types;

pub use error::{Error, Result};
pub use types::{ByteStream, EncryptionPolicy, TransferId};
