//! Authenticated encryption for large-blob entries
//!
//! Entries on the serialized large-blob array hold a DEFLATE-compressed
//! payload sealed with AES-256-GCM. The associated data binds the original
//! (uncompressed) size, so an entry only opens for the key and size it was
//! written with.

use std::io::{Read, Write};

use aes_gcm::aead::{Aead, KeyInit, Payload};
use aes_gcm::{Aes256Gcm, Nonce};
use flate2::read::DeflateDecoder;
use flate2::write::DeflateEncoder;
use flate2::Compression;

use crate::error::{CryptoError, Result};

/// Large-blob keys are 32 bytes (the `largeBlobKey` extension output)
pub const BLOB_KEY_SIZE: usize = 32;

/// GCM nonce length used for blob entries
pub const BLOB_NONCE_SIZE: usize = 12;

fn associated_data(orig_size: u64) -> [u8; 12] {
    let mut aad = [0u8; 12];
    aad[..4].copy_from_slice(b"blob");
    aad[4..].copy_from_slice(&orig_size.to_le_bytes());
    aad
}

/// Encrypt an already-compressed payload
///
/// `orig_size` is the uncompressed length, bound as associated data.
pub fn seal(
    key: &[u8; BLOB_KEY_SIZE],
    nonce: &[u8; BLOB_NONCE_SIZE],
    compressed: &[u8],
    orig_size: u64,
) -> Result<Vec<u8>> {
    let cipher = Aes256Gcm::new(key.into());
    cipher
        .encrypt(
            Nonce::from_slice(nonce),
            Payload {
                msg: compressed,
                aad: &associated_data(orig_size),
            },
        )
        .map_err(|_| CryptoError::EncryptionFailed)
}

/// Decrypt a blob entry ciphertext, verifying the GCM tag and bound size
pub fn open(
    key: &[u8; BLOB_KEY_SIZE],
    nonce: &[u8; BLOB_NONCE_SIZE],
    ciphertext: &[u8],
    orig_size: u64,
) -> Result<Vec<u8>> {
    let cipher = Aes256Gcm::new(key.into());
    cipher
        .decrypt(
            Nonce::from_slice(nonce),
            Payload {
                msg: ciphertext,
                aad: &associated_data(orig_size),
            },
        )
        .map_err(|_| CryptoError::DecryptionFailed)
}

/// Raw DEFLATE compression, no zlib header
pub fn compress(data: &[u8]) -> Result<Vec<u8>> {
    let mut encoder = DeflateEncoder::new(Vec::new(), Compression::default());
    encoder
        .write_all(data)
        .map_err(|_| CryptoError::CompressionFailed)?;
    encoder.finish().map_err(|_| CryptoError::CompressionFailed)
}

/// Inflate a compressed payload, verifying it has the expected size
pub fn decompress(data: &[u8], expected_size: u64) -> Result<Vec<u8>> {
    let mut out = Vec::new();
    // Cap the read so a corrupt stream cannot balloon
    let mut decoder = DeflateDecoder::new(data).take(expected_size + 1);
    decoder
        .read_to_end(&mut out)
        .map_err(|_| CryptoError::DecompressionFailed)?;
    if out.len() as u64 != expected_size {
        return Err(CryptoError::DecompressionFailed);
    }
    Ok(out)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_seal_open_round_trip() {
        let key = [0x42u8; BLOB_KEY_SIZE];
        let nonce = [0x01u8; BLOB_NONCE_SIZE];
        let data = b"example credential blob";

        let compressed = compress(data).unwrap();
        let sealed = seal(&key, &nonce, &compressed, data.len() as u64).unwrap();
        let opened = open(&key, &nonce, &sealed, data.len() as u64).unwrap();
        assert_eq!(
            decompress(&opened, data.len() as u64).unwrap(),
            data.to_vec()
        );
    }

    #[test]
    fn test_wrong_key_fails() {
        let key = [0x42u8; BLOB_KEY_SIZE];
        let other = [0x43u8; BLOB_KEY_SIZE];
        let nonce = [0x01u8; BLOB_NONCE_SIZE];
        let sealed = seal(&key, &nonce, b"payload", 7).unwrap();
        assert!(open(&other, &nonce, &sealed, 7).is_err());
    }

    #[test]
    fn test_size_is_bound() {
        let key = [0x42u8; BLOB_KEY_SIZE];
        let nonce = [0x01u8; BLOB_NONCE_SIZE];
        let sealed = seal(&key, &nonce, b"payload", 7).unwrap();
        // A different claimed size changes the associated data
        assert!(open(&key, &nonce, &sealed, 8).is_err());
    }

    #[test]
    fn test_tampered_ciphertext_fails() {
        let key = [0x42u8; BLOB_KEY_SIZE];
        let nonce = [0x01u8; BLOB_NONCE_SIZE];
        let mut sealed = seal(&key, &nonce, b"payload", 7).unwrap();
        sealed[0] ^= 0x01;
        assert!(open(&key, &nonce, &sealed, 7).is_err());
    }

    #[test]
    fn test_compress_round_trip() {
        let data = vec![0x55u8; 4096];
        let compressed = compress(&data).unwrap();
        assert!(compressed.len() < data.len());
        assert_eq!(decompress(&compressed, 4096).unwrap(), data);
    }

    #[test]
    fn test_decompress_size_mismatch() {
        let compressed = compress(b"hello").unwrap();
        assert!(decompress(&compressed, 4).is_err());
        assert!(decompress(&compressed, 6).is_err());
    }

    #[test]
    fn test_decompress_garbage() {
        assert!(decompress(&[0xFF, 0xFF, 0xFF, 0xFF], 16).is_err());
    }
}
