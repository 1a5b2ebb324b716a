//! Shared protocol primitives for the ykey SDK
//!
//! This crate holds the pieces every YubiKey application protocol builds on:
//!
//! - **APDU**: ISO 7816-4 command units and status words
//! - **TLV**: BER-TLV encoding/decoding used by PIV, OpenPGP and Management
//! - **CRC**: CRC-16/13239 used by the legacy OTP slot protocol
//! - **Version**: firmware version triples and feature gating
//! - **Key material**: private/public key value containers with zeroization
//! - **CommandState**: cooperative cancellation and keepalive reporting

pub mod apdu;
pub mod crc;
pub mod error;
pub mod keys;
pub mod state;
pub mod tlv;
pub mod version;

// Re-export commonly used types
pub use apdu::Apdu;
pub use error::{Error, Result};
pub use keys::{EllipticCurveValues, PrivateKeyValues, PublicKeyValues};
pub use state::{CommandState, KeepAliveStatus};
pub use tlv::Tlv;
pub use version::Version;
