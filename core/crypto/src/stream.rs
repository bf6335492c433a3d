//! Streaming AES-256-CBC encryption for large transfers.
//!
//! The transforms here produce and consume the same `IV || ciphertext`
//! envelope as the buffer API, but incrementally: an encrypting transform
//! prepends the IV to its first output and appends the padded final block on
//! flush; a decrypting transform buffers input until the IV is available and
//! withholds the final block until flush so padding can be stripped.
//!
//! Chunk boundaries of the underlying transport are arbitrary, so nothing
//! here assumes the first chunk contains the whole IV; a one-byte-at-a-time
//! stream decrypts just as well as a single-shot one.

use aes::cipher::generic_array::GenericArray;
use aes::cipher::{BlockDecryptMut, BlockEncryptMut, KeyIvInit};
use bytes::Bytes;
use futures::StreamExt;

use crate::cipher::{random_iv, Aes256CbcDec, Aes256CbcEnc, BLOCK_LEN};
use crate::keys::{TransferKey, IV_LEN};
use vaultdrop_common::{ByteStream, Error, Result};

/// Incremental encryptor producing an `IV || ciphertext` envelope.
pub struct EncryptTransform {
    cipher: Aes256CbcEnc,
    iv: Option<[u8; IV_LEN]>,
    pending: Vec<u8>,
}

impl EncryptTransform {
    /// Create an encrypting transform with a fresh random IV.
    pub fn new(key: &TransferKey) -> Self {
        let iv = random_iv();
        Self {
            cipher: Aes256CbcEnc::new(key.as_bytes().into(), (&iv).into()),
            iv: Some(iv),
            pending: Vec::new(),
        }
    }

    /// Feed plaintext, returning whatever ciphertext is ready.
    ///
    /// The first non-empty output starts with the IV. Bytes that do not fill
    /// a whole block are buffered until the next call or [`finalize`].
    ///
    /// [`finalize`]: EncryptTransform::finalize
    pub fn update(&mut self, input: &[u8]) -> Vec<u8> {
        let mut out = Vec::new();
        self.pending.extend_from_slice(input);

        let full = self.pending.len() - self.pending.len() % BLOCK_LEN;
        if full == 0 {
            return out;
        }

        if let Some(iv) = self.iv.take() {
            out.extend_from_slice(&iv);
        }
        for block in self.pending[..full].chunks_exact_mut(BLOCK_LEN) {
            self.cipher
                .encrypt_block_mut(GenericArray::from_mut_slice(block));
        }
        out.extend_from_slice(&self.pending[..full]);
        self.pending.drain(..full);
        out
    }

    /// Flush the transform, emitting the padded final block (and the IV, if
    /// no output was produced yet).
    pub fn finalize(mut self) -> Vec<u8> {
        let mut out = Vec::new();
        if let Some(iv) = self.iv.take() {
            out.extend_from_slice(&iv);
        }

        // PKCS#7: always pad, even when the input ended on a block boundary.
        let pad = (BLOCK_LEN - self.pending.len() % BLOCK_LEN) as u8;
        self.pending.resize(self.pending.len() + pad as usize, pad);
        debug_assert_eq!(self.pending.len(), BLOCK_LEN);
        self.cipher
            .encrypt_block_mut(GenericArray::from_mut_slice(&mut self.pending));
        out.extend_from_slice(&self.pending);
        out
    }
}

/// Incremental decryptor consuming an `IV || ciphertext` envelope.
pub struct DecryptTransform {
    key: TransferKey,
    cipher: Option<Aes256CbcDec>,
    pending: Vec<u8>,
}

impl DecryptTransform {
    /// Create a decrypting transform. The IV is extracted from the first
    /// 16 bytes of input, however they arrive.
    pub fn new(key: &TransferKey) -> Self {
        Self {
            key: key.clone(),
            cipher: None,
            pending: Vec::new(),
        }
    }

    /// Feed envelope bytes, returning whatever plaintext is ready.
    ///
    /// The final ciphertext block is always withheld so that [`finalize`]
    /// can strip the padding.
    ///
    /// [`finalize`]: DecryptTransform::finalize
    pub fn update(&mut self, input: &[u8]) -> Result<Vec<u8>> {
        self.pending.extend_from_slice(input);

        if self.cipher.is_none() {
            if self.pending.len() < IV_LEN {
                return Ok(Vec::new());
            }
            let iv: [u8; IV_LEN] = self.pending[..IV_LEN]
                .try_into()
                .map_err(|_| Error::Crypto("IV extraction failed".to_string()))?;
            self.cipher = Some(Aes256CbcDec::new(
                self.key.as_bytes().into(),
                (&iv).into(),
            ));
            self.pending.drain(..IV_LEN);
        }

        // Decrypt complete blocks, but keep at least one full block buffered:
        // the stream may end after this chunk, and the final block carries
        // the padding.
        let avail = self.pending.len();
        let mut emit = avail - avail % BLOCK_LEN;
        if emit == avail && emit > 0 {
            emit -= BLOCK_LEN;
        }
        if emit == 0 {
            return Ok(Vec::new());
        }

        let cipher = self
            .cipher
            .as_mut()
            .ok_or_else(|| Error::Crypto("Decryptor not initialized".to_string()))?;
        for block in self.pending[..emit].chunks_exact_mut(BLOCK_LEN) {
            cipher.decrypt_block_mut(GenericArray::from_mut_slice(block));
        }
        let out = self.pending[..emit].to_vec();
        self.pending.drain(..emit);
        Ok(out)
    }

    /// Flush the transform, decrypting the withheld final block and stripping
    /// its padding.
    ///
    /// # Errors
    /// - `Error::Crypto` if the input never reached IV length, ended with no
    ///   ciphertext, is not block-aligned, or carries invalid padding; an
    ///   insufficient-data error must propagate, never a silent truncation
    pub fn finalize(mut self) -> Result<Vec<u8>> {
        let Some(mut cipher) = self.cipher.take() else {
            return Err(Error::Crypto(format!(
                "Stream ended before IV: got {} of {} bytes",
                self.pending.len(),
                IV_LEN
            )));
        };
        if self.pending.is_empty() {
            return Err(Error::Crypto(
                "Stream ended with no ciphertext after IV".to_string(),
            ));
        }
        if self.pending.len() % BLOCK_LEN != 0 {
            return Err(Error::Crypto(format!(
                "Stream ended mid-block: {} trailing bytes",
                self.pending.len() % BLOCK_LEN
            )));
        }

        for block in self.pending.chunks_exact_mut(BLOCK_LEN) {
            cipher.decrypt_block_mut(GenericArray::from_mut_slice(block));
        }
        strip_pkcs7(&mut self.pending)?;
        Ok(std::mem::take(&mut self.pending))
    }
}

fn strip_pkcs7(buf: &mut Vec<u8>) -> Result<()> {
    let pad = *buf
        .last()
        .ok_or_else(|| Error::Crypto("Empty block while unpadding".to_string()))?
        as usize;
    if pad == 0 || pad > BLOCK_LEN || pad > buf.len() {
        return Err(Error::Crypto("Invalid padding in decrypted data".to_string()));
    }
    if buf[buf.len() - pad..].iter().any(|&b| b as usize != pad) {
        return Err(Error::Crypto("Invalid padding in decrypted data".to_string()));
    }
    buf.truncate(buf.len() - pad);
    Ok(())
}

/// Common face of the two transforms, for the stream adapters.
trait CipherTransform: Send {
    fn update(&mut self, input: &[u8]) -> Result<Vec<u8>>;
    fn finalize(self: Box<Self>) -> Result<Vec<u8>>;
}

impl CipherTransform for EncryptTransform {
    fn update(&mut self, input: &[u8]) -> Result<Vec<u8>> {
        Ok(EncryptTransform::update(self, input))
    }

    fn finalize(self: Box<Self>) -> Result<Vec<u8>> {
        Ok(EncryptTransform::finalize(*self))
    }
}

impl CipherTransform for DecryptTransform {
    fn update(&mut self, input: &[u8]) -> Result<Vec<u8>> {
        DecryptTransform::update(self, input)
    }

    fn finalize(self: Box<Self>) -> Result<Vec<u8>> {
        DecryptTransform::finalize(*self)
    }
}

/// Wrap a plaintext stream so it yields an `IV || ciphertext` envelope.
pub fn encrypt_stream(key: &TransferKey, inner: ByteStream) -> ByteStream {
    transform_stream(Box::new(EncryptTransform::new(key)), inner)
}

/// Wrap an envelope stream so it yields decrypted plaintext.
///
/// Errors, including an envelope that never reaches IV length, surface as
/// an `Err` item on the returned stream.
pub fn decrypt_stream(key: &TransferKey, inner: ByteStream) -> ByteStream {
    transform_stream(Box::new(DecryptTransform::new(key)), inner)
}

fn transform_stream(transform: Box<dyn CipherTransform>, inner: ByteStream) -> ByteStream {
    struct State {
        inner: ByteStream,
        transform: Option<Box<dyn CipherTransform>>,
    }

    let state = State {
        inner,
        transform: Some(transform),
    };

    Box::pin(futures::stream::unfold(state, |mut state| async move {
        loop {
            // Transform gone means we already flushed or failed.
            state.transform.as_ref()?;

            match state.inner.next().await {
                Some(Ok(chunk)) => {
                    let transform = state.transform.as_mut()?;
                    match transform.update(&chunk) {
                        Ok(out) if out.is_empty() => continue,
                        Ok(out) => return Some((Ok(Bytes::from(out)), state)),
                        Err(e) => {
                            state.transform = None;
                            return Some((Err(e), state));
                        }
                    }
                }
                Some(Err(e)) => {
                    state.transform = None;
                    return Some((Err(e), state));
                }
                None => {
                    let transform = state.transform.take()?;
                    return match transform.finalize() {
                        Ok(out) => Some((Ok(Bytes::from(out)), state)),
                        Err(e) => Some((Err(e), state)),
                    };
                }
            }
        }
    }))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cipher::{decrypt_buffer, encrypt_buffer};
    use crate::keys::KEY_LEN;
    use futures::executor::block_on;
    use futures::stream;

    fn key(byte: u8) -> TransferKey {
        TransferKey::from_bytes([byte; KEY_LEN])
    }

    fn chunked(data: &[u8], chunk_size: usize) -> ByteStream {
        let chunks: Vec<_> = data
            .chunks(chunk_size.max(1))
            .map(|c| Ok(Bytes::copy_from_slice(c)))
            .collect();
        Box::pin(stream::iter(chunks))
    }

    fn collect(stream: ByteStream) -> Result<Vec<u8>> {
        block_on(async {
            let mut out = Vec::new();
            let mut stream = stream;
            while let Some(item) = stream.next().await {
                out.extend_from_slice(&item?);
            }
            Ok(out)
        })
    }

    fn roundtrip(data: &[u8], enc_chunk: usize, dec_chunk: usize) -> Vec<u8> {
        let k = key(5);
        let envelope = collect(encrypt_stream(&k, chunked(data, enc_chunk))).unwrap();
        collect(decrypt_stream(&k, chunked(&envelope, dec_chunk))).unwrap()
    }

    #[test]
    fn test_roundtrip_chunk_boundaries() {
        let data: Vec<u8> = (0..10_000u32).map(|i| (i % 251) as u8).collect();
        // Spec'd boundary cases: 1, 7, 4096, and the whole buffer in one shot.
        for &chunk in &[1usize, 7, 4096, usize::MAX] {
            assert_eq!(roundtrip(&data, chunk, chunk), data, "chunk={}", chunk);
        }
    }

    #[test]
    fn test_roundtrip_mismatched_chunking() {
        let data = b"mismatched chunk sizes on each side of the pipe".to_vec();
        assert_eq!(roundtrip(&data, 3, 1024), data);
        assert_eq!(roundtrip(&data, 1024, 3), data);
    }

    #[test]
    fn test_stream_encrypt_buffer_decrypt() {
        // The stream envelope and the buffer envelope are the same format.
        let k = key(5);
        let data = b"interchangeable envelopes".to_vec();
        let envelope = collect(encrypt_stream(&k, chunked(&data, 7))).unwrap();
        assert_eq!(decrypt_buffer(&k, &envelope).unwrap(), data);
    }

    #[test]
    fn test_buffer_encrypt_stream_decrypt() {
        let k = key(5);
        let data = b"and in the other direction too".to_vec();
        let envelope = encrypt_buffer(&k, &data);
        assert_eq!(
            collect(decrypt_stream(&k, chunked(&envelope, 1))).unwrap(),
            data
        );
    }

    #[test]
    fn test_empty_input_roundtrip() {
        assert_eq!(roundtrip(b"", 1, 1), b"");
    }

    #[test]
    fn test_decrypt_truncated_before_iv_fails() {
        let k = key(5);
        let err = collect(decrypt_stream(&k, chunked(&[1, 2, 3], 1))).unwrap_err();
        assert!(matches!(err, Error::Crypto(_)));
        assert!(err.to_string().contains("before IV"));
    }

    #[test]
    fn test_decrypt_iv_only_fails() {
        let k = key(5);
        let err = collect(decrypt_stream(&k, chunked(&[0u8; IV_LEN], 4))).unwrap_err();
        assert!(matches!(err, Error::Crypto(_)));
    }

    #[test]
    fn test_decrypt_mid_block_truncation_fails() {
        let k = key(5);
        let mut envelope = encrypt_buffer(&k, b"long enough for several blocks of data");
        envelope.truncate(envelope.len() - 5);
        let err = collect(decrypt_stream(&k, chunked(&envelope, 8))).unwrap_err();
        assert!(matches!(err, Error::Crypto(_)));
    }

    #[test]
    fn test_inner_stream_error_propagates() {
        let k = key(5);
        let inner: ByteStream = Box::pin(stream::iter(vec![
            Ok(Bytes::from_static(b"abc")),
            Err(Error::Storage("connection reset".to_string())),
        ]));
        let err = collect(decrypt_stream(&k, inner)).unwrap_err();
        assert!(matches!(err, Error::Storage(_)));
    }

    #[test]
    fn test_transform_update_holds_back_final_block() {
        let k = key(5);
        let envelope = encrypt_buffer(&k, &[0xAA; 64]);

        let mut transform = DecryptTransform::new(&k);
        let emitted = transform.update(&envelope).unwrap();
        // 64 bytes pad to 80; the last block stays buffered for finalize.
        assert_eq!(emitted.len(), 64);
        let tail = transform.finalize().unwrap();
        assert_eq!([emitted, tail].concat(), vec![0xAA; 64]);
    }
}
