//! Cryptographic primitives for VaultDrop.
//!
//! This module provides:
//! - Per-transfer key derivation using PBKDF2-HMAC-SHA256
//! - AES-256-CBC buffer encryption with an `IV || ciphertext` envelope
//! - Chunk-boundary-agnostic streaming encryption for large transfers
//! - A shared cipher engine holding the master key, global salt,
//!   and derived-key cache
//!
//! # Security Guarantees
//! - All key material is automatically zeroized on drop
//! - No plaintext or key material is ever logged
//!
//! The envelope deliberately carries no integrity tag: objects are encrypted
//! with plain CBC, and tampering is detectable only as a padding failure.

pub mod cipher;
pub mod engine;
pub mod kdf;
pub mod keys;
pub mod stream;

pub use cipher::{decrypt_buffer, encrypt_buffer};
pub use engine::{CryptoEngine, EngineConfig};
pub use kdf::{derive_transfer_key, PBKDF2_ITERATIONS};
pub use keys::{GlobalSalt, MasterKey, TransferKey, IV_LEN, KEY_LEN, SALT_LEN};
pub use stream::{decrypt_stream, encrypt_stream, DecryptTransform, EncryptTransform};
