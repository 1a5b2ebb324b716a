//! Transport drivers for YubiKey devices
//!
//! This crate implements the three framing strategies YubiKeys speak,
//! each behind a small connection capability trait supplied by the embedder:
//!
//! - **ISO 7816 smartcard** ([`SmartCardProtocol`]): APDU encoding, command
//!   chaining, `GET RESPONSE` looping and extended-length negotiation over a
//!   CCID or NFC connection
//! - **CTAPHID** ([`FidoProtocol`]): 64-byte report framing with channel
//!   allocation, keepalive handling and cancellation
//! - **OTP slot protocol** ([`OtpProtocol`]): 8-byte feature reports carrying
//!   the legacy 70-byte configuration frames
//!
//! Device discovery and the physical USB/NFC plumbing are out of scope; the
//! embedder opens a connection and hands it in as a trait object.

pub mod connection;
pub mod ctaphid;
pub mod otp;
pub mod smartcard;

// Re-export commonly used types
pub use connection::{FidoConnection, OtpConnection, SmartCardConnection, Transport};
pub use ctaphid::{CtapHidCommand, FidoProtocol};
pub use otp::OtpProtocol;
pub use smartcard::{ApduResponse, SmartCardProtocol};
