//! Connection capability traits implemented by the embedder
//!
//! Each trait models one already-open physical channel to a YubiKey. The
//! protocol drivers in this crate are generic over them, so platform USB,
//! NFC and HID backends stay outside the SDK.

use ykey_core::Result;

/// Physical transport a connection runs over
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Transport {
    Usb,
    Nfc,
}

/// An open CCID (smartcard) channel
pub trait SmartCardConnection {
    fn transport(&self) -> Transport;

    /// Whether the channel can carry extended-length APDUs
    fn supports_extended_length(&self) -> bool;

    /// Send one encoded APDU and return the raw response including the
    /// trailing status word
    fn send_and_receive(&mut self, apdu: &[u8]) -> Result<Vec<u8>>;
}

/// Report size for FIDO HID connections
pub const FIDO_REPORT_SIZE: usize = 64;

/// An open FIDO HID channel exchanging 64-byte reports
pub trait FidoConnection {
    fn send(&mut self, packet: &[u8; FIDO_REPORT_SIZE]) -> Result<()>;

    /// Blocking read of the next report from the device
    fn receive(&mut self, packet: &mut [u8; FIDO_REPORT_SIZE]) -> Result<()>;
}

/// Report size for OTP HID connections
pub const OTP_REPORT_SIZE: usize = 8;

/// An open keyboard-interface channel exchanging 8-byte feature reports
pub trait OtpConnection {
    fn receive(&mut self, report: &mut [u8; OTP_REPORT_SIZE]) -> Result<()>;

    fn send(&mut self, report: &[u8; OTP_REPORT_SIZE]) -> Result<()>;
}
