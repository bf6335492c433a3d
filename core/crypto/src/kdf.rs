//! Per-transfer key derivation using PBKDF2-HMAC-SHA256.
//!
//! Each transfer gets its own 256-bit key derived from the process-wide
//! master key, the global salt, and the transfer id. The iteration count is
//! low by password-hashing standards because the input is already a
//! full-entropy 32-byte secret, not a password; PBKDF2 here is a deterministic
//! expansion step, not a hardening step.

use pbkdf2::pbkdf2_hmac;
use sha2::Sha256;

use crate::keys::{GlobalSalt, MasterKey, TransferKey, KEY_LEN};
use vaultdrop_common::TransferId;

/// PBKDF2 iteration count for transfer-key derivation.
pub const PBKDF2_ITERATIONS: u32 = 1000;

/// Derive the symmetric key for one transfer.
///
/// The PBKDF2 salt is `transfer_id ++ hex(global_salt)`, so two deployments
/// sharing a master key but not a salt still derive distinct keys.
///
/// # Postconditions
/// - Deterministic for a given (master key, global salt, transfer id) triple
pub fn derive_transfer_key(
    master: &MasterKey,
    salt: &GlobalSalt,
    transfer: &TransferId,
) -> TransferKey {
    let salt_hex = salt.to_hex();
    let mut kdf_salt = Vec::with_capacity(transfer.as_str().len() + salt_hex.len());
    kdf_salt.extend_from_slice(transfer.as_str().as_bytes());
    kdf_salt.extend_from_slice(salt_hex.as_bytes());

    let mut key = [0u8; KEY_LEN];
    pbkdf2_hmac::<Sha256>(master.as_bytes(), &kdf_salt, PBKDF2_ITERATIONS, &mut key);
    TransferKey::from_bytes(key)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn transfer(id: &str) -> TransferId {
        TransferId::new(id).unwrap()
    }

    #[test]
    fn test_derive_deterministic() {
        let master = MasterKey::from_bytes([7u8; KEY_LEN]);
        let salt = GlobalSalt::from_bytes([3u8; 16]);

        let k1 = derive_transfer_key(&master, &salt, &transfer("t-1"));
        let k2 = derive_transfer_key(&master, &salt, &transfer("t-1"));
        assert_eq!(k1.as_bytes(), k2.as_bytes());
    }

    #[test]
    fn test_derive_differs_per_transfer() {
        let master = MasterKey::from_bytes([7u8; KEY_LEN]);
        let salt = GlobalSalt::from_bytes([3u8; 16]);

        let k1 = derive_transfer_key(&master, &salt, &transfer("t-1"));
        let k2 = derive_transfer_key(&master, &salt, &transfer("t-2"));
        assert_ne!(k1.as_bytes(), k2.as_bytes());
    }

    #[test]
    fn test_derive_differs_per_salt() {
        let master = MasterKey::from_bytes([7u8; KEY_LEN]);
        let s1 = GlobalSalt::from_bytes([1u8; 16]);
        let s2 = GlobalSalt::from_bytes([2u8; 16]);

        let k1 = derive_transfer_key(&master, &s1, &transfer("t-1"));
        let k2 = derive_transfer_key(&master, &s2, &transfer("t-1"));
        assert_ne!(k1.as_bytes(), k2.as_bytes());
    }

    #[test]
    fn test_derive_differs_per_master() {
        let salt = GlobalSalt::from_bytes([3u8; 16]);
        let m1 = MasterKey::from_bytes([1u8; KEY_LEN]);
        let m2 = MasterKey::from_bytes([2u8; KEY_LEN]);

        let k1 = derive_transfer_key(&m1, &salt, &transfer("t-1"));
        let k2 = derive_transfer_key(&m2, &salt, &transfer("t-1"));
        assert_ne!(k1.as_bytes(), k2.as_bytes());
    }
}
