//! Cryptographic building blocks for the ykey SDK
//!
//! This crate provides the client-side cryptographic operations the session
//! layers need:
//!
//! - **PIN/UV auth protocols**: CTAP2 protocol One (AES-256-CBC + truncated
//!   HMAC) and Two (HKDF-derived keys, random IV, full HMAC)
//! - **ECDH**: ephemeral P-256 key agreement for PIN protocol encapsulation
//! - **Blob sealing**: AES-256-GCM with DEFLATE compression for large-blob
//!   entries
//! - **Management-key ciphers**: single-block 3DES/AES for the PIV
//!   witness/challenge exchange

pub mod blob;
pub mod ecdh;
pub mod error;
pub mod mgm;
pub mod pin_protocol;

// Re-export commonly used types
pub use error::{CryptoError, Result};
pub use mgm::{MgmKey, MgmKeyAlgorithm};
pub use pin_protocol::{PinProtocolOne, PinProtocolTwo, PinUvAuthProtocol};
