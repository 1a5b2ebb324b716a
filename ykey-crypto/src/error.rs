//! Error types for cryptographic operations

use thiserror::Error;

/// Cryptographic operation errors
#[derive(Debug, Error)]
pub enum CryptoError {
    /// Invalid public key provided
    #[error("Invalid public key")]
    InvalidPublicKey,

    /// Invalid key length
    #[error("Invalid key length: expected {expected}, got {actual}")]
    InvalidKeyLength { expected: usize, actual: usize },

    /// Data is not aligned to the cipher block size
    #[error("Data length must be a multiple of the cipher block size")]
    UnalignedData,

    /// A witness or challenge block has the wrong width for the cipher
    #[error("Invalid block length: expected {expected}, got {actual}")]
    InvalidBlockLength { expected: usize, actual: usize },

    /// Encryption failed
    #[error("Encryption failed")]
    EncryptionFailed,

    /// Decryption failed
    #[error("Decryption failed")]
    DecryptionFailed,

    /// The key is a known weak DES key
    #[error("Weak DES key")]
    WeakKey,

    /// Compression failed
    #[error("Compression failed")]
    CompressionFailed,

    /// Decompressed data is corrupt or has an unexpected size
    #[error("Decompression failed")]
    DecompressionFailed,
}

/// Result type alias for cryptographic operations
pub type Result<T> = std::result::Result<T, CryptoError>;
