//! The cipher engine: master key, global salt, and derived-key cache.
//!
//! The engine is an explicit context object shared by handle
//! (`Arc<CryptoEngine>`) rather than ambient static state. Construction
//! requires both the master key and the global salt, so any engine a caller
//! holds is ready; "engine not initialized" is represented by the absence of
//! an engine, which the storage gateway maps to its degraded mode.

use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::RwLock;

use serde::{Deserialize, Serialize};

use crate::cipher;
use crate::kdf::derive_transfer_key;
use crate::keys::{GlobalSalt, MasterKey, TransferKey};
use crate::stream;
use vaultdrop_common::{ByteStream, Result, TransferId};

/// Configuration for building a [`CryptoEngine`].
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EngineConfig {
    /// Hex-encoded 32-byte master key. When absent, a random ephemeral key is
    /// generated at startup.
    pub master_key_hex: Option<String>,
    /// Hex-encoded 16-byte global salt. Takes precedence over the salt file.
    pub salt_hex: Option<String>,
    /// Fallback path for salt persistence when no salt is configured.
    #[serde(default = "default_salt_file")]
    pub salt_file: PathBuf,
}

fn default_salt_file() -> PathBuf {
    PathBuf::from("vaultdrop.salt")
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            master_key_hex: None,
            salt_hex: None,
            salt_file: default_salt_file(),
        }
    }
}

/// Per-transfer key derivation and caching, plus the buffer and stream
/// cipher entry points bound to derived keys.
pub struct CryptoEngine {
    master: MasterKey,
    salt: GlobalSalt,
    cache: RwLock<HashMap<String, TransferKey>>,
}

impl CryptoEngine {
    /// Create an engine from explicit key material.
    pub fn new(master: MasterKey, salt: GlobalSalt) -> Self {
        Self {
            master,
            salt,
            cache: RwLock::new(HashMap::new()),
        }
    }

    /// Build an engine from configuration.
    ///
    /// # Postconditions
    /// - Missing master key: a random ephemeral key is generated and a
    ///   warning logged (objects it encrypts are unreadable after restart)
    /// - Missing salt: loaded from, or persisted to, the configured salt file
    ///
    /// # Errors
    /// - Invalid hex in either configured value
    /// - I/O errors on the salt file
    pub fn from_config(config: &EngineConfig) -> Result<Self> {
        let master = match &config.master_key_hex {
            Some(hex) => MasterKey::from_hex(hex)?,
            None => {
                tracing::warn!(
                    "No master key configured; generated an ephemeral key. \
                     Objects encrypted under it cannot be decrypted after a restart."
                );
                MasterKey::generate()
            }
        };
        let salt = match &config.salt_hex {
            Some(hex) => GlobalSalt::from_hex(hex)?,
            None => GlobalSalt::load_or_create(&config.salt_file)?,
        };
        Ok(Self::new(master, salt))
    }

    /// The global salt this engine derives with.
    pub fn salt(&self) -> &GlobalSalt {
        &self.salt
    }

    /// Hex-encode the master key for administrative export.
    pub fn export_master_key(&self) -> String {
        self.master.to_hex()
    }

    /// Derive (or fetch from cache) the key for a transfer.
    ///
    /// Derivation is a pure function of the engine's key material and the
    /// transfer id, so a racing double-derivation wastes a little work but
    /// cannot corrupt the cache.
    pub fn derive_key(&self, transfer: &TransferId) -> TransferKey {
        if let Some(key) = self.cache.read().unwrap().get(transfer.as_str()) {
            return key.clone();
        }

        let key = derive_transfer_key(&self.master, &self.salt, transfer);
        self.cache
            .write()
            .unwrap()
            .insert(transfer.as_str().to_string(), key.clone());
        key
    }

    /// Force derivation ahead of a bulk operation, so repeated PBKDF2 cost
    /// is paid once.
    pub fn preload_key(&self, transfer: &TransferId) {
        let _ = self.derive_key(transfer);
    }

    /// Evict one cached key, or all of them.
    pub fn clear_key_cache(&self, transfer: Option<&TransferId>) {
        let mut cache = self.cache.write().unwrap();
        match transfer {
            Some(t) => {
                cache.remove(t.as_str());
            }
            None => cache.clear(),
        }
    }

    /// Number of cached transfer keys.
    pub fn cached_key_count(&self) -> usize {
        self.cache.read().unwrap().len()
    }

    /// Encrypt a buffer under the transfer's derived key.
    pub fn encrypt_buffer(&self, transfer: &TransferId, plaintext: &[u8]) -> Result<Vec<u8>> {
        let key = self.derive_key(transfer);
        Ok(cipher::encrypt_buffer(&key, plaintext))
    }

    /// Decrypt an envelope under the transfer's derived key.
    pub fn decrypt_buffer(&self, transfer: &TransferId, envelope: &[u8]) -> Result<Vec<u8>> {
        let key = self.derive_key(transfer);
        cipher::decrypt_buffer(&key, envelope)
    }

    /// Wrap a plaintext stream in an encrypting transform.
    pub fn encrypt_stream(&self, transfer: &TransferId, inner: ByteStream) -> ByteStream {
        let key = self.derive_key(transfer);
        stream::encrypt_stream(&key, inner)
    }

    /// Wrap an envelope stream in a decrypting transform.
    pub fn decrypt_stream(&self, transfer: &TransferId, inner: ByteStream) -> ByteStream {
        let key = self.derive_key(transfer);
        stream::decrypt_stream(&key, inner)
    }
}

impl std::fmt::Debug for CryptoEngine {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CryptoEngine")
            .field("salt", &self.salt)
            .field("cached_keys", &self.cached_key_count())
            .finish_non_exhaustive()
    }
}
