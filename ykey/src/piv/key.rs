//! Key algorithms, slots and data-object identifiers for the PIV application

use ykey_core::error::{Error, Result};
use ykey_core::keys::{EllipticCurveValues, PrivateKeyValues};
use ykey_crypto::MgmKeyAlgorithm;

/// Asymmetric key algorithms storable in PIV slots
///
/// RSA-3072, RSA-4096, Ed25519 and X25519 require firmware 5.7.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum KeyType {
    Rsa1024,
    Rsa2048,
    Rsa3072,
    Rsa4096,
    EccP256,
    EccP384,
    Ed25519,
    X25519,
}

impl KeyType {
    pub const ALL: [KeyType; 8] = [
        KeyType::Rsa1024,
        KeyType::Rsa2048,
        KeyType::Rsa3072,
        KeyType::Rsa4096,
        KeyType::EccP256,
        KeyType::EccP384,
        KeyType::Ed25519,
        KeyType::X25519,
    ];

    /// The PIV algorithm identifier
    pub fn value(self) -> u8 {
        match self {
            KeyType::Rsa1024 => 0x06,
            KeyType::Rsa2048 => 0x07,
            KeyType::Rsa3072 => 0x05,
            KeyType::Rsa4096 => 0x16,
            KeyType::EccP256 => 0x11,
            KeyType::EccP384 => 0x14,
            KeyType::Ed25519 => 0xE0,
            KeyType::X25519 => 0xE1,
        }
    }

    pub fn from_value(value: u8) -> Result<Self> {
        Self::ALL
            .into_iter()
            .find(|key_type| key_type.value() == value)
            .ok_or_else(|| Error::bad_response(format!("unknown key type 0x{:02X}", value)))
    }

    pub fn bit_length(self) -> usize {
        match self {
            KeyType::Rsa1024 => 1024,
            KeyType::Rsa2048 => 2048,
            KeyType::Rsa3072 => 3072,
            KeyType::Rsa4096 => 4096,
            KeyType::EccP256 | KeyType::Ed25519 | KeyType::X25519 => 256,
            KeyType::EccP384 => 384,
        }
    }

    pub fn is_rsa(self) -> bool {
        matches!(
            self,
            KeyType::Rsa1024 | KeyType::Rsa2048 | KeyType::Rsa3072 | KeyType::Rsa4096
        )
    }

    /// Ed25519 and X25519 payloads go to the device without padding
    pub(crate) fn is_curve25519(self) -> bool {
        matches!(self, KeyType::Ed25519 | KeyType::X25519)
    }

    /// The key type matching imported private key material
    pub fn from_private_key(key: &PrivateKeyValues) -> Result<Self> {
        match key {
            PrivateKeyValues::Rsa(_) => match key.bit_length() {
                1024 => Ok(KeyType::Rsa1024),
                2048 => Ok(KeyType::Rsa2048),
                3072 => Ok(KeyType::Rsa3072),
                4096 => Ok(KeyType::Rsa4096),
                bits => Err(Error::NotSupported(format!(
                    "unsupported RSA key size of {} bits",
                    bits
                ))),
            },
            PrivateKeyValues::Ec(ec) => Self::from_curve(ec.curve()),
        }
    }

    pub fn from_curve(curve: EllipticCurveValues) -> Result<Self> {
        match curve {
            EllipticCurveValues::Secp256r1 => Ok(KeyType::EccP256),
            EllipticCurveValues::Secp384r1 => Ok(KeyType::EccP384),
            EllipticCurveValues::Ed25519 => Ok(KeyType::Ed25519),
            EllipticCurveValues::X25519 => Ok(KeyType::X25519),
            EllipticCurveValues::Secp521r1 => Err(Error::NotSupported(
                "P-521 keys cannot be stored in PIV slots".into(),
            )),
        }
    }
}

/// Private key slots of the PIV application
///
/// - `Authentication` (9A): general authentication, PIN per policy
/// - `Signature` (9C): digital signatures, PIN checked on every use
/// - `KeyManagement` (9D): encryption and key agreement
/// - `CardAuth` (9E): card authentication, PIN never checked
/// - `Retired1`-`Retired20` (82-95): rolled-over key management keys
/// - `Attestation` (F9): signs attestation statements for generated keys
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Slot {
    Authentication,
    Signature,
    KeyManagement,
    CardAuth,
    Retired1,
    Retired2,
    Retired3,
    Retired4,
    Retired5,
    Retired6,
    Retired7,
    Retired8,
    Retired9,
    Retired10,
    Retired11,
    Retired12,
    Retired13,
    Retired14,
    Retired15,
    Retired16,
    Retired17,
    Retired18,
    Retired19,
    Retired20,
    Attestation,
}

impl Slot {
    pub const ALL: [Slot; 25] = [
        Slot::Authentication,
        Slot::Signature,
        Slot::KeyManagement,
        Slot::CardAuth,
        Slot::Retired1,
        Slot::Retired2,
        Slot::Retired3,
        Slot::Retired4,
        Slot::Retired5,
        Slot::Retired6,
        Slot::Retired7,
        Slot::Retired8,
        Slot::Retired9,
        Slot::Retired10,
        Slot::Retired11,
        Slot::Retired12,
        Slot::Retired13,
        Slot::Retired14,
        Slot::Retired15,
        Slot::Retired16,
        Slot::Retired17,
        Slot::Retired18,
        Slot::Retired19,
        Slot::Retired20,
        Slot::Attestation,
    ];

    /// The slot reference as used in P2 of key operations
    pub fn value(self) -> u8 {
        match self {
            Slot::Authentication => 0x9A,
            Slot::Signature => 0x9C,
            Slot::KeyManagement => 0x9D,
            Slot::CardAuth => 0x9E,
            Slot::Attestation => 0xF9,
            retired => 0x82 + retired.retired_index(),
        }
    }

    pub fn from_value(value: u8) -> Result<Self> {
        Self::ALL
            .into_iter()
            .find(|slot| slot.value() == value)
            .ok_or_else(|| Error::bad_response(format!("unknown slot 0x{:02X}", value)))
    }

    /// The data object holding this slot's certificate
    pub fn certificate_object(self) -> u32 {
        match self {
            Slot::Authentication => object_id::AUTHENTICATION,
            Slot::Signature => object_id::SIGNATURE,
            Slot::KeyManagement => object_id::KEY_MANAGEMENT,
            Slot::CardAuth => object_id::CARD_AUTH,
            Slot::Attestation => object_id::ATTESTATION,
            retired => object_id::RETIRED1 + u32::from(retired.retired_index()),
        }
    }

    fn retired_index(self) -> u8 {
        match self {
            Slot::Retired1 => 0,
            Slot::Retired2 => 1,
            Slot::Retired3 => 2,
            Slot::Retired4 => 3,
            Slot::Retired5 => 4,
            Slot::Retired6 => 5,
            Slot::Retired7 => 6,
            Slot::Retired8 => 7,
            Slot::Retired9 => 8,
            Slot::Retired10 => 9,
            Slot::Retired11 => 10,
            Slot::Retired12 => 11,
            Slot::Retired13 => 12,
            Slot::Retired14 => 13,
            Slot::Retired15 => 14,
            Slot::Retired16 => 15,
            Slot::Retired17 => 16,
            Slot::Retired18 => 17,
            Slot::Retired19 => 18,
            Slot::Retired20 => 19,
            _ => 0,
        }
    }
}

/// When key operations require a prior PIN verification
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum PinPolicy {
    /// The device default for the slot
    #[default]
    Default,
    Never,
    Once,
    Always,
    /// Biometric match, falling back to PIN, once per session
    MatchOnce,
    /// Biometric match, falling back to PIN, on every use
    MatchAlways,
}

impl PinPolicy {
    pub fn value(self) -> u8 {
        match self {
            PinPolicy::Default => 0x0,
            PinPolicy::Never => 0x1,
            PinPolicy::Once => 0x2,
            PinPolicy::Always => 0x3,
            PinPolicy::MatchOnce => 0x4,
            PinPolicy::MatchAlways => 0x5,
        }
    }

    pub fn from_value(value: u8) -> Result<Self> {
        match value {
            0x0 => Ok(PinPolicy::Default),
            0x1 => Ok(PinPolicy::Never),
            0x2 => Ok(PinPolicy::Once),
            0x3 => Ok(PinPolicy::Always),
            0x4 => Ok(PinPolicy::MatchOnce),
            0x5 => Ok(PinPolicy::MatchAlways),
            value => Err(Error::bad_response(format!(
                "unknown PIN policy 0x{:02X}",
                value
            ))),
        }
    }
}

/// When key operations require a touch on the sensor
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum TouchPolicy {
    /// The device default for the slot
    #[default]
    Default,
    Never,
    Always,
    /// A touch stays valid for 15 seconds (requires firmware 4.3)
    Cached,
}

impl TouchPolicy {
    pub fn value(self) -> u8 {
        match self {
            TouchPolicy::Default => 0x0,
            TouchPolicy::Never => 0x1,
            TouchPolicy::Always => 0x2,
            TouchPolicy::Cached => 0x3,
        }
    }

    pub fn from_value(value: u8) -> Result<Self> {
        match value {
            0x0 => Ok(TouchPolicy::Default),
            0x1 => Ok(TouchPolicy::Never),
            0x2 => Ok(TouchPolicy::Always),
            0x3 => Ok(TouchPolicy::Cached),
            value => Err(Error::bad_response(format!(
                "unknown touch policy 0x{:02X}",
                value
            ))),
        }
    }
}

/// PIV data object identifiers
pub mod object_id {
    pub const CAPABILITY: u32 = 0x5FC107;
    pub const CHUID: u32 = 0x5FC102;
    /// Certificate for the 9A key
    pub const AUTHENTICATION: u32 = 0x5FC105;
    pub const FINGERPRINTS: u32 = 0x5FC103;
    pub const SECURITY: u32 = 0x5FC106;
    pub const FACIAL: u32 = 0x5FC108;
    pub const PRINTED: u32 = 0x5FC109;
    /// Certificate for the 9C key
    pub const SIGNATURE: u32 = 0x5FC10A;
    /// Certificate for the 9D key
    pub const KEY_MANAGEMENT: u32 = 0x5FC10B;
    /// Certificate for the 9E key
    pub const CARD_AUTH: u32 = 0x5FC101;
    pub const DISCOVERY: u32 = 0x7E;
    pub const KEY_HISTORY: u32 = 0x5FC10C;
    pub const IRIS: u32 = 0x5FC121;
    /// First retired-key certificate; the rest follow contiguously
    pub const RETIRED1: u32 = 0x5FC10D;
    pub const RETIRED20: u32 = 0x5FC120;
    pub const ATTESTATION: u32 = 0x5FFF01;
    pub const PIVMAN_DATA: u32 = 0x5FFF00;
    pub const PIVMAN_PROTECTED_DATA: u32 = PRINTED;

    /// Serialize an object identifier for the OBJ ID TLV
    ///
    /// Discovery is addressed with its one-byte short form.
    pub fn to_bytes(object_id: u32) -> Vec<u8> {
        if object_id == DISCOVERY {
            vec![DISCOVERY as u8]
        } else {
            vec![
                (object_id >> 16) as u8,
                (object_id >> 8) as u8,
                object_id as u8,
            ]
        }
    }
}

/// The PIV wire identifier for a management key algorithm
pub(crate) fn mgm_key_type_value(algorithm: MgmKeyAlgorithm) -> u8 {
    match algorithm {
        MgmKeyAlgorithm::ThreeDes => 0x03,
        MgmKeyAlgorithm::Aes128 => 0x08,
        MgmKeyAlgorithm::Aes192 => 0x0A,
        MgmKeyAlgorithm::Aes256 => 0x0C,
    }
}

pub(crate) fn mgm_key_type_from_value(value: u8) -> Result<MgmKeyAlgorithm> {
    match value {
        0x03 => Ok(MgmKeyAlgorithm::ThreeDes),
        0x08 => Ok(MgmKeyAlgorithm::Aes128),
        0x0A => Ok(MgmKeyAlgorithm::Aes192),
        0x0C => Ok(MgmKeyAlgorithm::Aes256),
        value => Err(Error::bad_response(format!(
            "unknown management key type 0x{:02X}",
            value
        ))),
    }
}
