//! Key types with secure memory handling.
//!
//! All key types automatically zeroize their memory on drop to prevent
//! sensitive data from persisting in memory. The global salt is not secret
//! and is persisted in the clear.

use std::fmt;
use std::fs;
use std::path::Path;

use zeroize::{Zeroize, ZeroizeOnDrop};

use vaultdrop_common::{Error, Result};

/// Length of encryption keys in bytes (256-bit).
pub const KEY_LEN: usize = 32;

/// Length of the global salt in bytes.
pub const SALT_LEN: usize = 16;

/// Length of the CBC initialization vector in bytes (one AES block).
pub const IV_LEN: usize = 16;

/// Process-wide master secret.
///
/// The master key is the root of the per-transfer key hierarchy. It is set
/// at startup from configuration, or freshly generated when no key is
/// configured (ephemeral: objects encrypted under it become unreadable
/// after a restart). It never leaves the cipher engine except through
/// administrative export.
#[derive(Clone, Zeroize, ZeroizeOnDrop)]
pub struct MasterKey {
    key: [u8; KEY_LEN],
}

impl MasterKey {
    /// Create a master key from raw bytes.
    pub fn from_bytes(key: [u8; KEY_LEN]) -> Self {
        Self { key }
    }

    /// Generate a random master key from the OS RNG.
    pub fn generate() -> Self {
        use rand::RngCore;
        let mut key = [0u8; KEY_LEN];
        rand::thread_rng().fill_bytes(&mut key);
        Self { key }
    }

    /// Parse a master key from a 64-character hex string.
    ///
    /// # Errors
    /// - Returns error if the string is not valid hex or not 32 bytes
    pub fn from_hex(s: &str) -> Result<Self> {
        let bytes = hex::decode(s.trim())
            .map_err(|e| Error::InvalidInput(format!("Invalid master key hex: {}", e)))?;
        let key: [u8; KEY_LEN] = bytes
            .try_into()
            .map_err(|_| Error::InvalidInput("Master key must be 32 bytes".to_string()))?;
        Ok(Self::from_bytes(key))
    }

    /// Hex-encode the key for administrative export.
    ///
    /// # Security
    /// The returned string is the raw secret; callers must treat it as such.
    pub fn to_hex(&self) -> String {
        hex::encode(self.key)
    }

    /// Get the key bytes.
    ///
    /// # Security
    /// The returned slice should be used immediately and not stored.
    pub fn as_bytes(&self) -> &[u8; KEY_LEN] {
        &self.key
    }
}

impl fmt::Debug for MasterKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "MasterKey([REDACTED])")
    }
}

/// Process-wide salt mixed into every transfer-key derivation.
///
/// Persisted once and constant for the process lifetime after first load:
/// configuration wins, then a salt file, then fresh generation (persisted to
/// the salt file so later restarts derive the same keys).
#[derive(Clone, PartialEq, Eq)]
pub struct GlobalSalt {
    salt: [u8; SALT_LEN],
}

impl GlobalSalt {
    /// Create a salt from raw bytes.
    pub fn from_bytes(salt: [u8; SALT_LEN]) -> Self {
        Self { salt }
    }

    /// Generate a random salt.
    pub fn generate() -> Self {
        use rand::RngCore;
        let mut salt = [0u8; SALT_LEN];
        rand::thread_rng().fill_bytes(&mut salt);
        Self { salt }
    }

    /// Parse a salt from a 32-character hex string.
    pub fn from_hex(s: &str) -> Result<Self> {
        let bytes = hex::decode(s.trim())
            .map_err(|e| Error::InvalidInput(format!("Invalid salt hex: {}", e)))?;
        let salt: [u8; SALT_LEN] = bytes
            .try_into()
            .map_err(|_| Error::InvalidInput("Salt must be 16 bytes".to_string()))?;
        Ok(Self::from_bytes(salt))
    }

    /// Hex-encode the salt. This encoding is what the key derivation mixes in.
    pub fn to_hex(&self) -> String {
        hex::encode(self.salt)
    }

    /// Get the salt bytes.
    pub fn as_bytes(&self) -> &[u8; SALT_LEN] {
        &self.salt
    }

    /// Load the salt from a file, generating and persisting a new one if the
    /// file does not exist.
    ///
    /// # Postconditions
    /// - The file at `path` contains the hex encoding of the returned salt
    ///
    /// # Errors
    /// - I/O errors reading or writing the salt file
    /// - Corrupt (non-hex or wrong-length) file contents
    pub fn load_or_create(path: &Path) -> Result<Self> {
        if path.exists() {
            let contents = fs::read_to_string(path)?;
            return Self::from_hex(&contents);
        }

        let salt = Self::generate();
        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() {
                fs::create_dir_all(parent)?;
            }
        }
        fs::write(path, salt.to_hex())?;
        #[cfg(unix)]
        {
            use std::os::unix::fs::PermissionsExt;
            let _ = fs::set_permissions(path, fs::Permissions::from_mode(0o600));
        }
        Ok(salt)
    }
}

impl fmt::Debug for GlobalSalt {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "GlobalSalt({})", self.to_hex())
    }
}

/// Symmetric key derived for one transfer.
///
/// One per transfer id, deterministic for a given
/// (master key, global salt, transfer id) triple.
#[derive(Clone, Zeroize, ZeroizeOnDrop)]
pub struct TransferKey {
    key: [u8; KEY_LEN],
}

impl TransferKey {
    /// Create a transfer key from raw bytes.
    pub fn from_bytes(key: [u8; KEY_LEN]) -> Self {
        Self { key }
    }

    /// Get the key bytes.
    pub fn as_bytes(&self) -> &[u8; KEY_LEN] {
        &self.key
    }
}

impl fmt::Debug for TransferKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "TransferKey([REDACTED])")
    }
}
