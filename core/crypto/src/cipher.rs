//! Buffer-level AES-256-CBC encryption.
//!
//! The envelope layout is `IV(16 bytes) || ciphertext` with PKCS#7 padding.
//! A fresh random IV is generated for every encryption call, so encrypting
//! the same plaintext twice never yields the same envelope.

use aes::cipher::{block_padding::Pkcs7, BlockDecryptMut, BlockEncryptMut, KeyIvInit};

use crate::keys::{TransferKey, IV_LEN};
use vaultdrop_common::{Error, Result};

pub(crate) type Aes256CbcEnc = cbc::Encryptor<aes::Aes256>;
pub(crate) type Aes256CbcDec = cbc::Decryptor<aes::Aes256>;

/// AES block length in bytes.
pub const BLOCK_LEN: usize = 16;

/// Generate a random IV for one encryption call.
pub(crate) fn random_iv() -> [u8; IV_LEN] {
    use rand::RngCore;
    let mut iv = [0u8; IV_LEN];
    rand::thread_rng().fill_bytes(&mut iv);
    iv
}

/// Encrypt a buffer into an `IV || ciphertext` envelope.
///
/// # Postconditions
/// - Output length is `IV_LEN + padded(plaintext)`; padding always adds at
///   least one byte, so the ciphertext portion is never empty
pub fn encrypt_buffer(key: &TransferKey, plaintext: &[u8]) -> Vec<u8> {
    let iv = random_iv();
    let ciphertext = Aes256CbcEnc::new(key.as_bytes().into(), (&iv).into())
        .encrypt_padded_vec_mut::<Pkcs7>(plaintext);

    let mut envelope = Vec::with_capacity(IV_LEN + ciphertext.len());
    envelope.extend_from_slice(&iv);
    envelope.extend_from_slice(&ciphertext);
    envelope
}

/// Decrypt an `IV || ciphertext` envelope.
///
/// # Errors
/// - `Error::Crypto` if the envelope is shorter than the IV, the ciphertext
///   after the IV is empty or not block-aligned, or the padding is invalid
pub fn decrypt_buffer(key: &TransferKey, envelope: &[u8]) -> Result<Vec<u8>> {
    if envelope.len() < IV_LEN {
        return Err(Error::Crypto(format!(
            "Envelope too short: {} bytes, need at least {}",
            envelope.len(),
            IV_LEN
        )));
    }

    let (iv, ciphertext) = envelope.split_at(IV_LEN);
    if ciphertext.is_empty() {
        return Err(Error::Crypto("Envelope has no ciphertext after IV".to_string()));
    }
    if ciphertext.len() % BLOCK_LEN != 0 {
        return Err(Error::Crypto(format!(
            "Ciphertext length {} is not a multiple of the block size",
            ciphertext.len()
        )));
    }

    let iv: &[u8; IV_LEN] = iv.try_into().map_err(|_| {
        Error::Crypto("Envelope IV has unexpected length".to_string())
    })?;
    Aes256CbcDec::new(key.as_bytes().into(), iv.into())
        .decrypt_padded_vec_mut::<Pkcs7>(ciphertext)
        .map_err(|_| Error::Crypto("Invalid padding in decrypted data".to_string()))
}
