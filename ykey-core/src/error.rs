//! Error types shared across the SDK

use std::fmt;

/// Error type for device communication and session operations
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Error {
    /// Transport failure (USB I/O error, NFC tag lost, disconnect)
    Io(String),
    /// The operation timed out, including user presence not supplied in time
    Timeout,
    /// The operation was cancelled through a `CommandState`
    Cancelled,
    /// The device returned a non-success status word
    Apdu { sw: u16 },
    /// The authenticator returned a CTAP error code
    Ctap(u8),
    /// The response could not be parsed, or failed an integrity check
    BadResponse(String),
    /// The connected YubiKey does not support the requested operation
    NotSupported(String),
    /// The requested application is missing or disabled on the device
    ApplicationNotAvailable,
    /// A PIN or PUK was rejected by the device
    InvalidPin { attempts_remaining: u8 },
}

impl Error {
    /// Helper for malformed-response errors
    pub fn bad_response(msg: impl Into<String>) -> Self {
        Error::BadResponse(msg.into())
    }

    /// Status word carried by an `Apdu` error, if this is one
    pub fn status_word(&self) -> Option<u16> {
        match self {
            Error::Apdu { sw } => Some(*sw),
            _ => None,
        }
    }

    /// CTAP error code carried by a `Ctap` error, if this is one
    pub fn ctap_code(&self) -> Option<u8> {
        match self {
            Error::Ctap(code) => Some(*code),
            _ => None,
        }
    }
}

impl fmt::Display for Error {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Error::Io(msg) => write!(f, "IO error: {}", msg),
            Error::Timeout => write!(f, "Operation timed out"),
            Error::Cancelled => write!(f, "Operation cancelled"),
            Error::Apdu { sw } => write!(f, "APDU error: 0x{:04X}", sw),
            Error::Ctap(code) => write!(f, "CTAP error: 0x{:02X}", code),
            Error::BadResponse(msg) => write!(f, "Bad response: {}", msg),
            Error::NotSupported(msg) => write!(f, "Not supported: {}", msg),
            Error::ApplicationNotAvailable => {
                write!(f, "The application couldn't be selected")
            }
            Error::InvalidPin { attempts_remaining } => {
                write!(f, "Invalid PIN, {} attempts remaining", attempts_remaining)
            }
        }
    }
}

impl std::error::Error for Error {}

impl From<std::io::Error> for Error {
    fn from(error: std::io::Error) -> Self {
        Error::Io(error.to_string())
    }
}

/// Result type alias for common operations
pub type Result<T> = std::result::Result<T, Error>;
