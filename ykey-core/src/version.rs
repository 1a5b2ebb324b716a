//! YubiKey firmware versions and feature gating

use std::fmt;

use crate::error::{Error, Result};

/// A firmware version triple, e.g. `5.4.3`
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default)]
pub struct Version {
    pub major: u8,
    pub minor: u8,
    pub micro: u8,
}

impl Version {
    pub const fn new(major: u8, minor: u8, micro: u8) -> Self {
        Self {
            major,
            minor,
            micro,
        }
    }

    /// Parse from the first three bytes of a device response
    pub fn from_bytes(bytes: &[u8]) -> Result<Self> {
        if bytes.len() < 3 {
            return Err(Error::bad_response("version requires 3 bytes"));
        }
        Ok(Self::new(bytes[0], bytes[1], bytes[2]))
    }

    /// Scan free-form text for the first `major.minor.micro` triple
    ///
    /// Select responses contain strings like `"Firmware version 5.4.3"`.
    /// Returns `0.0.0` when no triple is found.
    pub fn from_text(text: &str) -> Self {
        let bytes = text.as_bytes();
        let is_word = |b: u8| b.is_ascii_alphanumeric() || b == b'_';
        let mut i = 0;
        while i < bytes.len() {
            if bytes[i].is_ascii_digit() && (i == 0 || !is_word(bytes[i - 1])) {
                if let Some((version, end)) = Self::scan_triple(bytes, i) {
                    if end == bytes.len() || !is_word(bytes[end]) {
                        return version;
                    }
                }
            }
            i += 1;
        }
        Self::default()
    }

    fn scan_triple(bytes: &[u8], start: usize) -> Option<(Version, usize)> {
        let mut pos = start;
        let mut parts = [0u8; 3];
        for (i, part) in parts.iter_mut().enumerate() {
            let digits_start = pos;
            while pos < bytes.len() && bytes[pos].is_ascii_digit() && pos - digits_start < 3 {
                pos += 1;
            }
            if pos == digits_start {
                return None;
            }
            *part = std::str::from_utf8(&bytes[digits_start..pos])
                .ok()?
                .parse()
                .ok()?;
            if i < 2 {
                if pos >= bytes.len() || bytes[pos] != b'.' {
                    return None;
                }
                pos += 1;
            }
        }
        Some((Version::new(parts[0], parts[1], parts[2]), pos))
    }

    pub fn is_at_least(&self, major: u8, minor: u8, micro: u8) -> bool {
        *self >= Version::new(major, minor, micro)
    }

    pub fn is_less_than(&self, major: u8, minor: u8, micro: u8) -> bool {
        *self < Version::new(major, minor, micro)
    }

    /// Whether a feature introduced in `required` is available
    ///
    /// A zero major version means unreleased or development firmware, which
    /// passes every gate.
    pub fn supports(&self, required: (u8, u8, u8)) -> bool {
        self.major == 0 || self.is_at_least(required.0, required.1, required.2)
    }

    /// Fail fast with `NotSupported` when `required` is not met
    ///
    /// Sessions call this before any bytes are sent for a gated operation.
    pub fn require(&self, what: &str, required: (u8, u8, u8)) -> Result<()> {
        if self.supports(required) {
            Ok(())
        } else {
            Err(Error::NotSupported(format!(
                "{} requires firmware {}.{}.{} or later, found {}",
                what, required.0, required.1, required.2, self
            )))
        }
    }
}

impl fmt::Display for Version {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}.{}.{}", self.major, self.minor, self.micro)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_ordering() {
        assert!(Version::new(5, 0, 0) > Version::new(4, 9, 9));
        assert!(Version::new(5, 2, 1) > Version::new(5, 2, 0));
        assert_eq!(Version::new(5, 2, 1), Version::new(5, 2, 1));
        assert!(Version::new(4, 2, 6).is_at_least(4, 2, 0));
        assert!(Version::new(4, 2, 6).is_less_than(4, 2, 7));
    }

    #[test]
    fn test_from_bytes() {
        let version = Version::from_bytes(&[5, 4, 3, 0xFF]).unwrap();
        assert_eq!(version, Version::new(5, 4, 3));
        assert!(Version::from_bytes(&[5, 4]).is_err());
    }

    #[test]
    fn test_from_text() {
        assert_eq!(
            Version::from_text("Firmware version 5.4.3"),
            Version::new(5, 4, 3)
        );
        assert_eq!(Version::from_text("1.0.2 something"), Version::new(1, 0, 2));
        assert_eq!(Version::from_text("no version here"), Version::new(0, 0, 0));
        // Partial triples don't match
        assert_eq!(Version::from_text("5.4"), Version::new(0, 0, 0));
        // Word-adjacent digits don't start a match
        assert_eq!(Version::from_text("a5.4.3"), Version::new(0, 0, 0));
    }

    #[test]
    fn test_gating() {
        let version = Version::new(4, 1, 0);
        assert!(version.require("readDeviceInfo", (4, 1, 0)).is_ok());
        let err = version.require("deviceConfig", (5, 0, 0)).unwrap_err();
        assert!(matches!(err, Error::NotSupported(_)));
    }

    #[test]
    fn test_zero_major_skips_gates() {
        let dev = Version::new(0, 0, 0);
        assert!(dev.supports((5, 7, 0)));
        assert!(dev.require("anything", (9, 9, 9)).is_ok());
    }

    #[test]
    fn test_display() {
        assert_eq!(Version::new(5, 4, 3).to_string(), "5.4.3");
    }
}
