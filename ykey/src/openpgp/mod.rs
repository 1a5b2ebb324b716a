//! OpenPGP card application
//!
//! Covers the four OpenPGP key slots with PIN management and optional PIN
//! derivation, key generation and import, and the PSO operations for
//! signing, decryption and authentication, per the OpenPGP smart card
//! specification.
//!
//! ## Example
//!
//! ```no_run
//! # use ykey::openpgp::OpenPgpSession;
//! # fn run(connection: impl ykey_transport::SmartCardConnection) -> ykey_core::Result<()> {
//! let mut session = OpenPgpSession::new(connection)?;
//! session.verify_pin("123456", false)?;
//! let signature = session.sign(&[0x17; 32])?;
//! # Ok(())
//! # }
//! ```
//!
//! Reference: <https://developers.yubico.com/PGP/>

mod kdf;

pub use kdf::{Kdf, KdfHash};

use std::collections::BTreeMap;

use tracing::debug;
use zeroize::Zeroizing;

use ykey_core::apdu::{sw, Apdu};
use ykey_core::error::{Error, Result};
use ykey_core::keys::{EllipticCurveValues, PrivateKeyValues, PublicKeyValues};
use ykey_core::tlv::{self, Tlv};
use ykey_core::version::Version;
use ykey_transport::connection::SmartCardConnection;
use ykey_transport::SmartCardProtocol;

/// Application identifier of the OpenPGP applet
pub const AID: [u8; 6] = [0xD2, 0x76, 0x00, 0x01, 0x24, 0x01];

/// Factory default User PIN (PW1)
pub const DEFAULT_USER_PIN: &str = "123456";
/// Factory default Admin PIN (PW3)
pub const DEFAULT_ADMIN_PIN: &str = "12345678";

const INS_VERIFY: u8 = 0x20;
const INS_CHANGE_PIN: u8 = 0x24;
const INS_PSO: u8 = 0x2A;
const INS_RESET_RETRY_COUNTER: u8 = 0x2C;
const INS_ACTIVATE: u8 = 0x44;
const INS_GENERATE_ASYM: u8 = 0x47;
const INS_GET_CHALLENGE: u8 = 0x84;
const INS_INTERNAL_AUTHENTICATE: u8 = 0x88;
const INS_GET_DATA: u8 = 0xCA;
const INS_PUT_DATA: u8 = 0xDA;
const INS_PUT_DATA_ODD: u8 = 0xDB;
const INS_TERMINATE: u8 = 0xE6;
const INS_GET_VERSION: u8 = 0xF1;
const INS_SET_PIN_RETRIES: u8 = 0xF2;

const P1_UNVERIFY: u8 = 0xFF;
const P1_RESET_WITH_CODE: u8 = 0x00;
const P1_RESET_ADMIN_VERIFIED: u8 = 0x02;
const P1_GENERATE: u8 = 0x80;
const P1_PSO_SIGN: u8 = 0x9E;
const P2_PSO_SIGN: u8 = 0x9A;
const P1_PSO_DECIPHER: u8 = 0x80;
const P2_PSO_DECIPHER: u8 = 0x86;
const P2_VERIFY_PW1_SIGN: u8 = 0x81;
const P2_VERIFY_PW1_OTHER: u8 = 0x82;
const P2_VERIFY_PW3: u8 = 0x83;

const TAG_DISCRETIONARY: u16 = 0x73;
const TAG_EXTENDED_CAPABILITIES: u16 = 0xC0;
const TAG_FINGERPRINTS: u16 = 0xC5;
const TAG_CA_FINGERPRINTS: u16 = 0xC6;
const TAG_GENERATION_TIMES: u16 = 0xCD;
const TAG_KEY_INFORMATION: u16 = 0xDE;
const TAG_SIGNATURE_COUNTER: u16 = 0x93;
const TAG_GENERAL_FEATURE_FLAGS: u16 = 0x81;

const TAG_PUBLIC_KEY: u16 = 0x7F49;
const TAG_PUB_MODULUS: u16 = 0x81;
const TAG_PUB_EXPONENT: u16 = 0x82;
const TAG_EC_POINT: u16 = 0x86;
const TAG_CIPHER: u16 = 0xA6;
const TAG_EXTENDED_HEADER_LIST: u16 = 0x4D;
const TAG_TEMPLATE_HEADERS: u16 = 0x7F48;
const TAG_TEMPLATE_VALUES: u16 = 0x5F48;

// Field tags inside the private key template
const FIELD_RSA_EXPONENT: u8 = 0x91;
const FIELD_RSA_PRIME_P: u8 = 0x92;
const FIELD_RSA_PRIME_Q: u8 = 0x93;
const FIELD_RSA_CRT_COEFFICIENT: u8 = 0x94;
const FIELD_RSA_EXPONENT_P: u8 = 0x95;
const FIELD_RSA_EXPONENT_Q: u8 = 0x96;
const FIELD_RSA_MODULUS: u8 = 0x97;
const FIELD_EC_SECRET: u8 = 0x92;

const ALGORITHM_RSA: u8 = 0x01;
const ALGORITHM_EC_DH: u8 = 0x12;
const ALGORITHM_EC_DSA: u8 = 0x13;
const ALGORITHM_ED_DSA: u8 = 0x16;

const RSA_E_LEN_BITS: u16 = 17;

const FEATURE_BUTTON: u8 = 0x20;

const INVALID_PIN: [u8; 8] = [0; 8];

/// Data object identifiers for [`OpenPgpSession::get_data`] and
/// [`OpenPgpSession::put_data`]
///
/// Per-key data objects (algorithm attributes, fingerprints, generation
/// times, user interaction flags) are reachable through [`KeyRef`].
pub mod data_object {
    pub const PRIVATE_USE_1: u16 = 0x0101;
    pub const PRIVATE_USE_2: u16 = 0x0102;
    pub const PRIVATE_USE_3: u16 = 0x0103;
    pub const PRIVATE_USE_4: u16 = 0x0104;
    pub const AID: u16 = 0x4F;
    pub const NAME: u16 = 0x5B;
    pub const LOGIN_DATA: u16 = 0x5E;
    pub const LANGUAGE: u16 = 0x5F2D;
    pub const SEX: u16 = 0x5F35;
    pub const URL: u16 = 0x5F50;
    pub const HISTORICAL_BYTES: u16 = 0x5F52;
    pub const CARDHOLDER_RELATED_DATA: u16 = 0x65;
    pub const APPLICATION_RELATED_DATA: u16 = 0x6E;
    pub const SECURITY_SUPPORT_TEMPLATE: u16 = 0x7A;
    pub const CARDHOLDER_CERTIFICATE: u16 = 0x7F21;
    pub const EXTENDED_LENGTH_INFO: u16 = 0x7F66;
    pub const GENERAL_FEATURE_MANAGEMENT: u16 = 0x7F74;
    pub const PW_STATUS_BYTES: u16 = 0xC4;
    pub const RESETTING_CODE: u16 = 0xD3;
    pub const KDF: u16 = 0xF9;
    pub const ALGORITHM_INFORMATION: u16 = 0xFA;
}

/// Flag bits in [`ExtendedCapabilities`]
pub mod extended_capability {
    pub const SECURE_MESSAGING: u8 = 0x80;
    pub const GET_CHALLENGE: u8 = 0x40;
    pub const KEY_IMPORT: u8 = 0x20;
    pub const PW_STATUS_CHANGEABLE: u8 = 0x10;
    pub const PRIVATE_USE: u8 = 0x08;
    pub const ALGORITHM_ATTRIBUTES_CHANGEABLE: u8 = 0x04;
    pub const PSO_DEC_ENC_AES: u8 = 0x02;
    pub const KDF: u8 = 0x01;
}

/// The three passwords of the OpenPGP application
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Pw {
    /// PW1, the User PIN
    User,
    /// The resetting code, only usable to unblock PW1
    Reset,
    /// PW3, the Admin PIN
    Admin,
}

/// Validity of a User PIN verification for signing
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PinPolicy {
    /// Every signature requires a fresh PW1 verification
    Always,
    /// One verification is valid for several signatures
    Once,
}

/// The key slots of the OpenPGP application
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum KeyRef {
    /// Signature key, used by PSO:COMPUTE DIGITAL SIGNATURE
    Sig,
    /// Decryption key, used by PSO:DECIPHER
    Dec,
    /// Authentication key, used by INTERNAL AUTHENTICATE
    Aut,
    /// Yubico attestation key
    Att,
}

impl KeyRef {
    pub fn value(self) -> u8 {
        match self {
            KeyRef::Sig => 0x01,
            KeyRef::Dec => 0x02,
            KeyRef::Aut => 0x03,
            KeyRef::Att => 0x81,
        }
    }

    fn from_value(value: u8) -> Result<Self> {
        match value {
            0x01 => Ok(KeyRef::Sig),
            0x02 => Ok(KeyRef::Dec),
            0x03 => Ok(KeyRef::Aut),
            0x81 => Ok(KeyRef::Att),
            other => Err(Error::bad_response(format!(
                "unknown key reference 0x{:02X}",
                other
            ))),
        }
    }

    fn index(self) -> usize {
        match self {
            KeyRef::Sig => 0,
            KeyRef::Dec => 1,
            KeyRef::Aut => 2,
            KeyRef::Att => 3,
        }
    }

    /// Data object holding this slot's algorithm attributes
    pub fn algorithm_attributes_do(self) -> u16 {
        match self {
            KeyRef::Sig => 0xC1,
            KeyRef::Dec => 0xC2,
            KeyRef::Aut => 0xC3,
            KeyRef::Att => 0xDA,
        }
    }

    /// Data object holding this slot's user interaction flag
    pub fn uif_do(self) -> u16 {
        match self {
            KeyRef::Sig => 0xD6,
            KeyRef::Dec => 0xD7,
            KeyRef::Aut => 0xD8,
            KeyRef::Att => 0xD9,
        }
    }

    /// Data object holding this slot's key fingerprint
    pub fn fingerprint_do(self) -> u16 {
        match self {
            KeyRef::Sig => 0xC7,
            KeyRef::Dec => 0xC8,
            KeyRef::Aut => 0xC9,
            KeyRef::Att => 0xDB,
        }
    }

    /// Data object holding this slot's generation timestamp
    pub fn generation_time_do(self) -> u16 {
        match self {
            KeyRef::Sig => 0xCE,
            KeyRef::Dec => 0xCF,
            KeyRef::Aut => 0xD0,
            KeyRef::Att => 0xDD,
        }
    }

    /// Control reference template for key generation and import
    fn crt_bytes(self) -> &'static [u8] {
        match self {
            KeyRef::Sig => &[0xB6, 0x00],
            KeyRef::Dec => &[0xB8, 0x00],
            KeyRef::Aut => &[0xA4, 0x00],
            KeyRef::Att => &[0xB6, 0x03, 0x84, 0x01, 0x81],
        }
    }
}

/// User interaction flag: whether an operation requires a touch
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Uif {
    Off,
    On,
    Fixed,
    Cached,
    CachedFixed,
}

impl Uif {
    fn value(self) -> u8 {
        match self {
            Uif::Off => 0x00,
            Uif::On => 0x01,
            Uif::Fixed => 0x02,
            Uif::Cached => 0x03,
            Uif::CachedFixed => 0x04,
        }
    }

    fn from_value(value: u8) -> Result<Self> {
        match value {
            0x00 => Ok(Uif::Off),
            0x01 => Ok(Uif::On),
            0x02 => Ok(Uif::Fixed),
            0x03 => Ok(Uif::Cached),
            0x04 => Ok(Uif::CachedFixed),
            other => Err(Error::bad_response(format!(
                "unknown user interaction flag 0x{:02X}",
                other
            ))),
        }
    }

    /// Whether the flag can no longer be changed
    pub fn is_fixed(self) -> bool {
        matches!(self, Uif::Fixed | Uif::CachedFixed)
    }

    /// Whether one touch stays valid for a short period
    pub fn is_cached(self) -> bool {
        matches!(self, Uif::Cached | Uif::CachedFixed)
    }

    fn to_bytes(self) -> [u8; 2] {
        [self.value(), FEATURE_BUTTON]
    }
}

/// How a key slot was populated
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum KeyStatus {
    None,
    Generated,
    Imported,
}

impl KeyStatus {
    fn from_value(value: u8) -> Result<Self> {
        match value {
            0 => Ok(KeyStatus::None),
            1 => Ok(KeyStatus::Generated),
            2 => Ok(KeyStatus::Imported),
            other => Err(Error::bad_response(format!(
                "unknown key status 0x{:02X}",
                other
            ))),
        }
    }
}

/// How RSA private keys are encoded for import
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RsaImportFormat {
    Standard,
    StandardWithModulus,
    Crt,
    CrtWithModulus,
}

impl RsaImportFormat {
    fn value(self) -> u8 {
        match self {
            RsaImportFormat::Standard => 0,
            RsaImportFormat::StandardWithModulus => 1,
            RsaImportFormat::Crt => 2,
            RsaImportFormat::CrtWithModulus => 3,
        }
    }

    fn from_value(value: u8) -> Result<Self> {
        match value {
            0 => Ok(RsaImportFormat::Standard),
            1 => Ok(RsaImportFormat::StandardWithModulus),
            2 => Ok(RsaImportFormat::Crt),
            3 => Ok(RsaImportFormat::CrtWithModulus),
            other => Err(Error::bad_response(format!(
                "unknown RSA import format 0x{:02X}",
                other
            ))),
        }
    }
}

/// Algorithm attributes of a key slot
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AlgorithmAttributes {
    Rsa {
        n_len: u16,
        e_len: u16,
        import_format: RsaImportFormat,
    },
    Ec {
        algorithm_id: u8,
        curve: EllipticCurveValues,
        /// Import templates must carry the public point as well
        with_public_key: bool,
    },
}

impl AlgorithmAttributes {
    /// Attributes for an RSA key with the given modulus size
    pub fn rsa(n_len: u16, import_format: RsaImportFormat) -> Self {
        AlgorithmAttributes::Rsa {
            n_len,
            e_len: RSA_E_LEN_BITS,
            import_format,
        }
    }

    /// Attributes for an EC key in the given slot
    ///
    /// The decryption slot performs ECDH and the others ECDSA, except that
    /// Ed25519 always signs.
    pub fn ec(key_ref: KeyRef, curve: EllipticCurveValues) -> Self {
        let algorithm_id = if curve == EllipticCurveValues::Ed25519 {
            ALGORITHM_ED_DSA
        } else if key_ref == KeyRef::Dec {
            ALGORITHM_EC_DH
        } else {
            ALGORITHM_EC_DSA
        };
        AlgorithmAttributes::Ec {
            algorithm_id,
            curve,
            with_public_key: false,
        }
    }

    fn parse(data: &[u8]) -> Result<Self> {
        let (algorithm_id, rest) = data
            .split_first()
            .ok_or_else(|| Error::bad_response("empty algorithm attributes"))?;
        match *algorithm_id {
            ALGORITHM_RSA => {
                if rest.len() < 5 {
                    return Err(Error::bad_response("truncated RSA algorithm attributes"));
                }
                Ok(AlgorithmAttributes::Rsa {
                    n_len: u16::from_be_bytes([rest[0], rest[1]]),
                    e_len: u16::from_be_bytes([rest[2], rest[3]]),
                    import_format: RsaImportFormat::from_value(rest[4])?,
                })
            }
            ALGORITHM_EC_DH | ALGORITHM_EC_DSA | ALGORITHM_ED_DSA => {
                let (oid, with_public_key) = match rest.split_last() {
                    Some((&0xFF, oid)) => (oid, true),
                    _ => (rest, false),
                };
                let curve = EllipticCurveValues::from_oid(oid).ok_or_else(|| {
                    Error::bad_response(format!("unsupported curve OID {:02X?}", oid))
                })?;
                Ok(AlgorithmAttributes::Ec {
                    algorithm_id: *algorithm_id,
                    curve,
                    with_public_key,
                })
            }
            other => Err(Error::bad_response(format!(
                "unsupported algorithm 0x{:02X}",
                other
            ))),
        }
    }

    /// Encode for the algorithm attributes data object
    pub fn to_bytes(&self) -> Vec<u8> {
        match self {
            AlgorithmAttributes::Rsa {
                n_len,
                e_len,
                import_format,
            } => {
                let mut out = vec![ALGORITHM_RSA];
                out.extend_from_slice(&n_len.to_be_bytes());
                out.extend_from_slice(&e_len.to_be_bytes());
                out.push(import_format.value());
                out
            }
            AlgorithmAttributes::Ec {
                algorithm_id,
                curve,
                with_public_key,
            } => {
                let mut out = vec![*algorithm_id];
                out.extend_from_slice(curve.oid());
                if *with_public_key {
                    out.push(0xFF);
                }
                out
            }
        }
    }
}

/// Decoded PW status bytes (data object `0xC4`)
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PwStatus {
    pin_policy_user: PinPolicy,
    max_len_user: u8,
    max_len_reset: u8,
    max_len_admin: u8,
    attempts_user: u8,
    attempts_reset: u8,
    attempts_admin: u8,
}

impl PwStatus {
    fn parse(data: &[u8]) -> Result<Self> {
        if data.len() < 7 {
            return Err(Error::bad_response("PW status requires 7 bytes"));
        }
        Ok(Self {
            pin_policy_user: if data[0] == 0 {
                PinPolicy::Always
            } else {
                PinPolicy::Once
            },
            max_len_user: data[1],
            max_len_reset: data[2],
            max_len_admin: data[3],
            attempts_user: data[4],
            attempts_reset: data[5],
            attempts_admin: data[6],
        })
    }

    /// Whether each signature consumes the User PIN verification
    pub fn pin_policy_user(&self) -> PinPolicy {
        self.pin_policy_user
    }

    /// Maximum password length in bytes
    pub fn max_len(&self, pw: Pw) -> u8 {
        match pw {
            Pw::User => self.max_len_user,
            Pw::Reset => self.max_len_reset,
            Pw::Admin => self.max_len_admin,
        }
    }

    /// Remaining attempts before the password blocks
    pub fn attempts(&self, pw: Pw) -> u8 {
        match pw {
            Pw::User => self.attempts_user,
            Pw::Reset => self.attempts_reset,
            Pw::Admin => self.attempts_admin,
        }
    }
}

/// What the card reports it can do (tag `0xC0` in the application related
/// data)
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ExtendedCapabilities {
    flags: u8,
    secure_messaging_algorithm: u8,
    challenge_max_length: u16,
    certificate_max_length: u16,
    special_do_max_length: u16,
    pin_block_2_format: bool,
    mse_command: bool,
}

impl ExtendedCapabilities {
    fn parse(data: &[u8]) -> Result<Self> {
        if data.len() < 10 {
            return Err(Error::bad_response("extended capabilities require 10 bytes"));
        }
        Ok(Self {
            flags: data[0],
            secure_messaging_algorithm: data[1],
            challenge_max_length: u16::from_be_bytes([data[2], data[3]]),
            certificate_max_length: u16::from_be_bytes([data[4], data[5]]),
            special_do_max_length: u16::from_be_bytes([data[6], data[7]]),
            pin_block_2_format: data[8] == 1,
            mse_command: data[9] == 1,
        })
    }

    /// Test a flag from [`extended_capability`]
    pub fn has(&self, flag: u8) -> bool {
        self.flags & flag != 0
    }

    pub fn secure_messaging_algorithm(&self) -> u8 {
        self.secure_messaging_algorithm
    }

    pub fn challenge_max_length(&self) -> u16 {
        self.challenge_max_length
    }

    pub fn certificate_max_length(&self) -> u16 {
        self.certificate_max_length
    }

    pub fn special_do_max_length(&self) -> u16 {
        self.special_do_max_length
    }

    pub fn pin_block_2_format(&self) -> bool {
        self.pin_block_2_format
    }

    pub fn mse_command(&self) -> bool {
        self.mse_command
    }
}

/// Identity fields packed into the OpenPGP application identifier
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct OpenPgpAid {
    standard_version: (u8, u8),
    manufacturer: u16,
    serial: u32,
}

impl OpenPgpAid {
    fn parse(data: &[u8]) -> Result<Self> {
        if data.len() != 16 {
            return Err(Error::bad_response("OpenPGP AID requires 16 bytes"));
        }
        let standard_version = (decode_bcd(data[6])?, decode_bcd(data[7])?);
        let manufacturer = u16::from_be_bytes([data[8], data[9]]);
        // The serial is four BCD pairs; fall back to the raw value for
        // non-conforming cards
        let serial = decode_bcd_serial(&data[10..14])
            .unwrap_or_else(|| u32::from_be_bytes([data[10], data[11], data[12], data[13]]));
        Ok(Self {
            standard_version,
            manufacturer,
            serial,
        })
    }

    /// OpenPGP card specification version, e.g. `(3, 4)`
    pub fn standard_version(&self) -> (u8, u8) {
        self.standard_version
    }

    pub fn manufacturer(&self) -> u16 {
        self.manufacturer
    }

    pub fn serial(&self) -> u32 {
        self.serial
    }
}

/// Card state nested inside the application related data
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DiscretionaryDataObjects {
    extended_capabilities: ExtendedCapabilities,
    attributes_sig: AlgorithmAttributes,
    attributes_dec: AlgorithmAttributes,
    attributes_aut: AlgorithmAttributes,
    attributes_att: Option<AlgorithmAttributes>,
    pw_status: PwStatus,
    fingerprints: Vec<[u8; 20]>,
    ca_fingerprints: Vec<[u8; 20]>,
    generation_times: Vec<u32>,
    key_information: Vec<(KeyRef, KeyStatus)>,
    uifs: [Option<Uif>; 4],
}

impl DiscretionaryDataObjects {
    fn parse(values: &BTreeMap<u16, Vec<u8>>) -> Result<Self> {
        let required = |tag: u16| {
            values.get(&tag).map(Vec::as_slice).ok_or_else(|| {
                Error::bad_response(format!("discretionary data is missing tag 0x{:02X}", tag))
            })
        };
        let mut uifs = [None; 4];
        for key_ref in [KeyRef::Sig, KeyRef::Dec, KeyRef::Aut, KeyRef::Att] {
            if let Some(data) = values.get(&key_ref.uif_do()) {
                let value = data
                    .first()
                    .ok_or_else(|| Error::bad_response("empty user interaction flag"))?;
                uifs[key_ref.index()] = Some(Uif::from_value(*value)?);
            }
        }
        Ok(Self {
            extended_capabilities: ExtendedCapabilities::parse(required(
                TAG_EXTENDED_CAPABILITIES,
            )?)?,
            attributes_sig: AlgorithmAttributes::parse(required(
                KeyRef::Sig.algorithm_attributes_do(),
            )?)?,
            attributes_dec: AlgorithmAttributes::parse(required(
                KeyRef::Dec.algorithm_attributes_do(),
            )?)?,
            attributes_aut: AlgorithmAttributes::parse(required(
                KeyRef::Aut.algorithm_attributes_do(),
            )?)?,
            attributes_att: values
                .get(&KeyRef::Att.algorithm_attributes_do())
                .map(|data| AlgorithmAttributes::parse(data))
                .transpose()?,
            pw_status: PwStatus::parse(required(data_object::PW_STATUS_BYTES)?)?,
            fingerprints: parse_chunks(values.get(&TAG_FINGERPRINTS)),
            ca_fingerprints: parse_chunks(values.get(&TAG_CA_FINGERPRINTS)),
            generation_times: parse_generation_times(values.get(&TAG_GENERATION_TIMES)),
            key_information: match values.get(&TAG_KEY_INFORMATION) {
                Some(data) => parse_key_information(data)?,
                None => Vec::new(),
            },
            uifs,
        })
    }

    pub fn extended_capabilities(&self) -> &ExtendedCapabilities {
        &self.extended_capabilities
    }

    /// Algorithm attributes of a slot, if the card reports them
    pub fn algorithm_attributes(&self, key_ref: KeyRef) -> Option<&AlgorithmAttributes> {
        match key_ref {
            KeyRef::Sig => Some(&self.attributes_sig),
            KeyRef::Dec => Some(&self.attributes_dec),
            KeyRef::Aut => Some(&self.attributes_aut),
            KeyRef::Att => self.attributes_att.as_ref(),
        }
    }

    pub fn pw_status(&self) -> PwStatus {
        self.pw_status
    }

    /// Stored key fingerprint, all zero when the slot is empty
    pub fn fingerprint(&self, key_ref: KeyRef) -> Option<&[u8; 20]> {
        self.fingerprints.get(key_ref.index())
    }

    pub fn ca_fingerprint(&self, key_ref: KeyRef) -> Option<&[u8; 20]> {
        self.ca_fingerprints.get(key_ref.index())
    }

    /// Unix timestamp of key generation, zero when unset
    pub fn generation_time(&self, key_ref: KeyRef) -> Option<u32> {
        self.generation_times.get(key_ref.index()).copied()
    }

    pub fn key_status(&self, key_ref: KeyRef) -> Option<KeyStatus> {
        self.key_information
            .iter()
            .find(|(entry, _)| *entry == key_ref)
            .map(|(_, status)| *status)
    }

    pub fn uif(&self, key_ref: KeyRef) -> Option<Uif> {
        self.uifs[key_ref.index()]
    }
}

/// Snapshot of the application related data object (`0x6E`)
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ApplicationRelatedData {
    aid: OpenPgpAid,
    historical_bytes: Vec<u8>,
    extended_length_info: Option<Vec<u8>>,
    general_feature_flags: Option<u8>,
    discretionary: DiscretionaryDataObjects,
}

impl ApplicationRelatedData {
    fn parse(encoded: &[u8]) -> Result<Self> {
        let outer = tlv::parse_map(&tlv::unpack_value(
            data_object::APPLICATION_RELATED_DATA,
            encoded,
        )?)?;
        let aid = OpenPgpAid::parse(
            outer
                .get(&data_object::AID)
                .map(Vec::as_slice)
                .ok_or_else(|| {
                    Error::bad_response("application related data is missing the AID")
                })?,
        )?;
        let general_feature_flags = match outer.get(&data_object::GENERAL_FEATURE_MANAGEMENT) {
            Some(data) => {
                let flags = tlv::unpack_value(TAG_GENERAL_FEATURE_FLAGS, data)?;
                Some(
                    *flags
                        .first()
                        .ok_or_else(|| Error::bad_response("empty general feature management"))?,
                )
            }
            None => None,
        };
        // Early cards keep the discretionary objects directly in the outer
        // template
        let discretionary = match outer
            .get(&TAG_DISCRETIONARY)
            .filter(|data| !data.is_empty())
        {
            Some(data) => DiscretionaryDataObjects::parse(&tlv::parse_map(data)?)?,
            None => DiscretionaryDataObjects::parse(&outer)?,
        };
        Ok(Self {
            aid,
            historical_bytes: outer
                .get(&data_object::HISTORICAL_BYTES)
                .cloned()
                .unwrap_or_default(),
            extended_length_info: outer.get(&data_object::EXTENDED_LENGTH_INFO).cloned(),
            general_feature_flags,
            discretionary,
        })
    }

    pub fn aid(&self) -> &OpenPgpAid {
        &self.aid
    }

    pub fn historical_bytes(&self) -> &[u8] {
        &self.historical_bytes
    }

    pub fn extended_length_info(&self) -> Option<&[u8]> {
        self.extended_length_info.as_deref()
    }

    /// Whether the device reports a physical button
    pub fn has_button(&self) -> bool {
        self.general_feature_flags
            .map(|flags| flags & FEATURE_BUTTON != 0)
            .unwrap_or(false)
    }

    pub fn discretionary(&self) -> &DiscretionaryDataObjects {
        &self.discretionary
    }
}

/// A session with the OpenPGP application over a smart card connection
#[derive(Debug)]
pub struct OpenPgpSession<C: SmartCardConnection> {
    protocol: SmartCardProtocol<C>,
    version: Version,
    application_data: ApplicationRelatedData,
}

impl<C: SmartCardConnection> OpenPgpSession<C> {
    /// Select the OpenPGP application and read the firmware version
    pub fn new(connection: C) -> Result<Self> {
        let mut protocol = SmartCardProtocol::new(connection);
        match protocol.select(&AID) {
            Ok(_) => {}
            Err(Error::Apdu { sw: status })
                if status == sw::NO_INPUT_DATA || status == sw::CONDITIONS_NOT_SATISFIED =>
            {
                // TERMINATE DF leaves the applet refusing SELECT until it
                // is activated again
                debug!("OpenPGP application terminated, activating");
                protocol.send_and_receive(&Apdu::new(0, INS_ACTIVATE, 0, 0, Vec::new()))?;
                protocol.select(&AID)?;
            }
            Err(e) => return Err(e),
        }

        let response =
            protocol.send_and_receive(&Apdu::new(0, INS_GET_VERSION, 0, 0, Vec::new()))?;
        let version = parse_bcd_version(&response)?;
        protocol.configure(version);

        let encoded = Self::fetch_data(&mut protocol, data_object::APPLICATION_RELATED_DATA)?;
        let application_data = ApplicationRelatedData::parse(&encoded)?;
        debug!(%version, "OpenPGP session established");
        Ok(Self {
            protocol,
            version,
            application_data,
        })
    }

    pub fn version(&self) -> Version {
        self.version
    }

    /// Identity of the card, decoded from its AID
    pub fn aid(&self) -> &OpenPgpAid {
        self.application_data.aid()
    }

    /// The application related data captured when the session was opened
    ///
    /// Host-changeable parts (PW status, algorithm attributes,
    /// fingerprints) can go stale; [`Self::read_application_data`] returns
    /// a fresh copy.
    pub fn application_data(&self) -> &ApplicationRelatedData {
        &self.application_data
    }

    /// Extended capabilities reported at select time
    pub fn extended_capabilities(&self) -> &ExtendedCapabilities {
        self.application_data
            .discretionary()
            .extended_capabilities()
    }

    /// Re-read the application related data from the card
    pub fn read_application_data(&mut self) -> Result<ApplicationRelatedData> {
        let encoded = self.get_data(data_object::APPLICATION_RELATED_DATA)?;
        ApplicationRelatedData::parse(&encoded)
    }

    /// Read a data object
    pub fn get_data(&mut self, do_id: u16) -> Result<Vec<u8>> {
        Self::fetch_data(&mut self.protocol, do_id)
    }

    /// Write a data object
    ///
    /// Most data objects require a verified Admin PIN.
    pub fn put_data(&mut self, do_id: u16, data: impl Into<Vec<u8>>) -> Result<()> {
        self.protocol.send_and_receive(&Apdu::new(
            0,
            INS_PUT_DATA,
            (do_id >> 8) as u8,
            do_id as u8,
            data,
        ))?;
        debug!("wrote data object 0x{:04X}", do_id);
        Ok(())
    }

    fn fetch_data(protocol: &mut SmartCardProtocol<C>, do_id: u16) -> Result<Vec<u8>> {
        debug!("reading data object 0x{:04X}", do_id);
        protocol.send_and_receive(&Apdu::new(
            0,
            INS_GET_DATA,
            (do_id >> 8) as u8,
            do_id as u8,
            Vec::new(),
        ))
    }

    /// Read the current PW status bytes
    pub fn pw_status(&mut self) -> Result<PwStatus> {
        let data = self.get_data(data_object::PW_STATUS_BYTES)?;
        PwStatus::parse(&data)
    }

    /// Read the PIN transformation the card requires
    pub fn kdf(&mut self) -> Result<Kdf> {
        if !self.extended_capabilities().has(extended_capability::KDF) {
            return Ok(Kdf::None);
        }
        let data = self.get_data(data_object::KDF)?;
        Kdf::parse(&data)
    }

    /// Replace the PIN transformation scheme
    ///
    /// Writing the KDF resets both PINs to their factory defaults and
    /// removes the resetting code. Requires a verified Admin PIN.
    pub fn set_kdf(&mut self, kdf: &Kdf) -> Result<()> {
        if !self.extended_capabilities().has(extended_capability::KDF) {
            return Err(Error::NotSupported(
                "KDF is not supported by this device".into(),
            ));
        }
        self.put_data(data_object::KDF, kdf.to_bytes())?;
        debug!("KDF configuration changed");
        Ok(())
    }

    /// Verify the User PIN (PW1)
    ///
    /// `extended` false unlocks signing; `extended` true unlocks the other
    /// PW1-guarded operations. The two verification states are
    /// independent.
    pub fn verify_pin(&mut self, pin: &str, extended: bool) -> Result<()> {
        let mode = if extended {
            P2_VERIFY_PW1_OTHER
        } else {
            P2_VERIFY_PW1_SIGN
        };
        self.verify(Pw::User, mode, pin)
    }

    /// Verify the Admin PIN (PW3)
    pub fn verify_admin(&mut self, pin: &str) -> Result<()> {
        self.verify(Pw::Admin, P2_VERIFY_PW3, pin)
    }

    fn verify(&mut self, pw: Pw, mode: u8, pin: &str) -> Result<()> {
        let encoded = self.kdf()?.process(pw, pin);
        self.protocol
            .send_and_receive(&Apdu::new(0, INS_VERIFY, 0, mode, encoded.to_vec()))
            .map_err(|e| self.pin_error(pw, e))?;
        debug!(?pw, "PIN verified");
        Ok(())
    }

    /// Clear the User PIN verification for one mode
    pub fn unverify_pin(&mut self, extended: bool) -> Result<()> {
        self.version.require("Clearing PIN verification", (5, 6, 0))?;
        let mode = if extended {
            P2_VERIFY_PW1_OTHER
        } else {
            P2_VERIFY_PW1_SIGN
        };
        self.protocol
            .send_and_receive(&Apdu::new(0, INS_VERIFY, P1_UNVERIFY, mode, Vec::new()))?;
        debug!("User PIN verification cleared");
        Ok(())
    }

    /// Clear the Admin PIN verification
    pub fn unverify_admin(&mut self) -> Result<()> {
        self.version.require("Clearing PIN verification", (5, 6, 0))?;
        self.protocol.send_and_receive(&Apdu::new(
            0,
            INS_VERIFY,
            P1_UNVERIFY,
            P2_VERIFY_PW3,
            Vec::new(),
        ))?;
        debug!("Admin PIN verification cleared");
        Ok(())
    }

    /// Change the User PIN
    pub fn change_pin(&mut self, pin: &str, new_pin: &str) -> Result<()> {
        self.change_reference(Pw::User, P2_VERIFY_PW1_SIGN, pin, new_pin)
    }

    /// Change the Admin PIN
    pub fn change_admin(&mut self, pin: &str, new_pin: &str) -> Result<()> {
        self.change_reference(Pw::Admin, P2_VERIFY_PW3, pin, new_pin)
    }

    fn change_reference(&mut self, pw: Pw, mode: u8, pin: &str, new_pin: &str) -> Result<()> {
        debug!(?pw, "changing PIN");
        let kdf = self.kdf()?;
        let mut payload = Zeroizing::new(kdf.process(pw, pin).to_vec());
        payload.extend_from_slice(&kdf.process(pw, new_pin));
        self.protocol
            .send_and_receive(&Apdu::new(0, INS_CHANGE_PIN, 0, mode, payload.to_vec()))
            .map_err(|e| self.pin_error(pw, e))?;
        debug!(?pw, "PIN changed");
        Ok(())
    }

    /// Set a new User PIN on a card whose PW1 is blocked
    ///
    /// `reset_code` authorizes the change when given; otherwise a verified
    /// Admin PIN is required.
    pub fn reset_pin(&mut self, new_pin: &str, reset_code: Option<&str>) -> Result<()> {
        debug!("resetting User PIN");
        let kdf = self.kdf()?;
        let mut payload = Zeroizing::new(Vec::new());
        let p1 = match reset_code {
            Some(code) => {
                payload.extend_from_slice(&kdf.process(Pw::Reset, code));
                P1_RESET_WITH_CODE
            }
            None => P1_RESET_ADMIN_VERIFIED,
        };
        payload.extend_from_slice(&kdf.process(Pw::User, new_pin));
        self.protocol
            .send_and_receive(&Apdu::new(
                0,
                INS_RESET_RETRY_COUNTER,
                p1,
                P2_VERIFY_PW1_SIGN,
                payload.to_vec(),
            ))
            .map_err(|e| {
                if reset_code.is_some() {
                    self.pin_error(Pw::Reset, e)
                } else {
                    e
                }
            })?;
        debug!("User PIN reset");
        Ok(())
    }

    /// Set the resetting code used by [`Self::reset_pin`]
    ///
    /// Requires a verified Admin PIN.
    pub fn set_reset_code(&mut self, reset_code: &str) -> Result<()> {
        let encoded = self.kdf()?.process(Pw::Reset, reset_code);
        self.put_data(data_object::RESETTING_CODE, encoded.to_vec())?;
        debug!("resetting code set");
        Ok(())
    }

    /// Set the attempt counters for the three passwords
    ///
    /// Requires a verified Admin PIN.
    pub fn set_pin_attempts(&mut self, user: u8, reset: u8, admin: u8) -> Result<()> {
        let supported = match self.version.major {
            0 => true,
            1 => self.version.is_at_least(1, 0, 7),
            _ => self.version.is_at_least(4, 3, 1),
        };
        if !supported {
            return Err(Error::NotSupported(format!(
                "Setting PIN attempts requires firmware 4.3.1 or later, found {}",
                self.version
            )));
        }
        self.protocol.send_and_receive(&Apdu::new(
            0,
            INS_SET_PIN_RETRIES,
            0,
            0,
            vec![user, reset, admin],
        ))?;
        debug!(
            "PIN attempt counters set to {}/{}/{}",
            user, reset, admin
        );
        Ok(())
    }

    /// Set whether each signature consumes the User PIN verification
    ///
    /// Requires a verified Admin PIN.
    pub fn set_signature_pin_policy(&mut self, policy: PinPolicy) -> Result<()> {
        debug!(?policy, "setting signature PIN policy");
        let value = match policy {
            PinPolicy::Always => 0,
            PinPolicy::Once => 1,
        };
        self.put_data(data_object::PW_STATUS_BYTES, vec![value])
    }

    /// Return the application to factory defaults
    ///
    /// Blocks both PINs, then terminates and reactivates the applet,
    /// which erases all keys and data objects and restores the default
    /// PINs.
    pub fn reset(&mut self) -> Result<()> {
        self.version.require("Reset", (1, 0, 6))?;
        debug!("resetting OpenPGP application");
        let status = self.pw_status()?;

        // TERMINATE DF is only accepted once both PINs are blocked
        for (mode, attempts) in [
            (P2_VERIFY_PW1_SIGN, status.attempts(Pw::User)),
            (P2_VERIFY_PW3, status.attempts(Pw::Admin)),
        ] {
            let apdu = Apdu::new(0, INS_VERIFY, 0, mode, INVALID_PIN);
            for _ in 0..attempts {
                match self.protocol.send_and_receive(&apdu) {
                    Ok(_) | Err(Error::Apdu { .. }) => {}
                    Err(e) => return Err(e),
                }
            }
        }

        self.protocol
            .send_and_receive(&Apdu::new(0, INS_TERMINATE, 0, 0, Vec::new()))?;
        self.protocol
            .send_and_receive(&Apdu::new(0, INS_ACTIVATE, 0, 0, Vec::new()))?;

        let encoded = Self::fetch_data(&mut self.protocol, data_object::APPLICATION_RELATED_DATA)?;
        self.application_data = ApplicationRelatedData::parse(&encoded)?;
        debug!("OpenPGP application reset");
        Ok(())
    }

    /// Read the user interaction flag of a key slot
    pub fn uif(&mut self, key_ref: KeyRef) -> Result<Uif> {
        match self.get_data(key_ref.uif_do()) {
            Ok(data) => Uif::from_value(
                *data
                    .first()
                    .ok_or_else(|| Error::bad_response("empty user interaction flag"))?,
            ),
            // Firmware without touch support rejects the data object
            Err(Error::Apdu { sw: status }) if status == sw::WRONG_PARAMETERS_P1P2 => Ok(Uif::Off),
            Err(e) => Err(e),
        }
    }

    /// Set the user interaction flag of a key slot
    ///
    /// Requires a verified Admin PIN. Fails once the flag was set to a
    /// fixed value.
    pub fn set_uif(&mut self, key_ref: KeyRef, uif: Uif) -> Result<()> {
        self.version.require("User interaction flag", (4, 2, 0))?;
        if key_ref == KeyRef::Att {
            self.version
                .require("Attestation key user interaction flag", (5, 2, 1))?;
        }
        if uif.is_cached() {
            self.version
                .require("Cached user interaction flag", (5, 2, 1))?;
        }
        if self.uif(key_ref)?.is_fixed() {
            return Err(Error::NotSupported(
                "the user interaction flag is fixed and cannot be changed".into(),
            ));
        }
        self.put_data(key_ref.uif_do(), uif.to_bytes())?;
        debug!(?key_ref, ?uif, "user interaction flag set");
        Ok(())
    }

    /// Number of signatures made with the signature key
    pub fn signature_counter(&mut self) -> Result<u32> {
        let data = self.get_data(data_object::SECURITY_SUPPORT_TEMPLATE)?;
        let counter = tlv::unpack_value(TAG_SIGNATURE_COUNTER, &data)?;
        if counter.len() != 3 {
            return Err(Error::bad_response("signature counter requires 3 bytes"));
        }
        Ok(u32::from_be_bytes([0, counter[0], counter[1], counter[2]]))
    }

    /// Read random bytes from the on-card generator
    pub fn get_challenge(&mut self, length: u16) -> Result<Vec<u8>> {
        let capabilities = self.extended_capabilities();
        if !capabilities.has(extended_capability::GET_CHALLENGE) {
            return Err(Error::NotSupported(
                "GET CHALLENGE is not supported by this device".into(),
            ));
        }
        if length > capabilities.challenge_max_length() {
            return Err(Error::NotSupported(format!(
                "challenge length is limited to {} bytes",
                capabilities.challenge_max_length()
            )));
        }
        self.protocol.send_and_receive(
            &Apdu::new(0, INS_GET_CHALLENGE, 0, 0, Vec::new()).with_le(length as u32),
        )
    }

    /// Sign a message with the signature key (PSO:COMPUTE DIGITAL
    /// SIGNATURE)
    ///
    /// The message must be pre-formatted for the slot's algorithm: a full
    /// DigestInfo for RSA, the plain digest for ECDSA, the raw message for
    /// Ed25519. Requires PW1 verified in signature mode.
    pub fn sign(&mut self, message: &[u8]) -> Result<Vec<u8>> {
        debug!("signing with the SIG key");
        self.protocol
            .send_and_receive(&Apdu::new(0, INS_PSO, P1_PSO_SIGN, P2_PSO_SIGN, message))
    }

    /// Decrypt an RSA ciphertext with the decryption key (PSO:DECIPHER)
    ///
    /// Requires PW1 verified in extended mode.
    pub fn decrypt(&mut self, ciphertext: &[u8]) -> Result<Zeroizing<Vec<u8>>> {
        debug!("decrypting with the DEC key");
        // The leading zero is the padding indicator byte for RSA
        let mut payload = Vec::with_capacity(ciphertext.len() + 1);
        payload.push(0x00);
        payload.extend_from_slice(ciphertext);
        let response = self.protocol.send_and_receive(&Apdu::new(
            0,
            INS_PSO,
            P1_PSO_DECIPHER,
            P2_PSO_DECIPHER,
            payload,
        ))?;
        Ok(Zeroizing::new(response))
    }

    /// Derive a shared secret from the decryption key and a peer public
    /// key (PSO:DECIPHER with a cipher template)
    ///
    /// Requires PW1 verified in extended mode.
    pub fn key_agreement(
        &mut self,
        peer_public_key: &PublicKeyValues,
    ) -> Result<Zeroizing<Vec<u8>>> {
        let point = match peer_public_key {
            PublicKeyValues::Ec { point, .. } => point.as_slice(),
            PublicKeyValues::Cv25519 {
                curve: EllipticCurveValues::X25519,
                raw,
            } => raw.as_slice(),
            _ => {
                return Err(Error::NotSupported(
                    "key agreement requires an EC or X25519 public key".into(),
                ))
            }
        };
        debug!("performing key agreement with the DEC key");
        let payload = Tlv::new(
            TAG_CIPHER,
            Tlv::new(
                TAG_PUBLIC_KEY,
                Tlv::new(TAG_EC_POINT, point.to_vec()).to_bytes(),
            )
            .to_bytes(),
        )
        .to_bytes();
        let response = self.protocol.send_and_receive(&Apdu::new(
            0,
            INS_PSO,
            P1_PSO_DECIPHER,
            P2_PSO_DECIPHER,
            payload,
        ))?;
        Ok(Zeroizing::new(response))
    }

    /// Sign a challenge with the authentication key (INTERNAL
    /// AUTHENTICATE)
    ///
    /// Requires PW1 verified in extended mode.
    pub fn authenticate(&mut self, message: &[u8]) -> Result<Vec<u8>> {
        debug!("signing with the AUT key");
        self.protocol
            .send_and_receive(&Apdu::new(0, INS_INTERNAL_AUTHENTICATE, 0, 0, message))
    }

    /// Read the algorithm attributes currently configured for a slot
    pub fn algorithm_attributes(&mut self, key_ref: KeyRef) -> Result<AlgorithmAttributes> {
        let data = self.get_data(key_ref.algorithm_attributes_do())?;
        AlgorithmAttributes::parse(&data)
    }

    /// Configure the algorithm attributes of a slot
    ///
    /// Requires changeable attributes and a verified Admin PIN.
    pub fn set_algorithm_attributes(
        &mut self,
        key_ref: KeyRef,
        attributes: &AlgorithmAttributes,
    ) -> Result<()> {
        if !self
            .extended_capabilities()
            .has(extended_capability::ALGORITHM_ATTRIBUTES_CHANGEABLE)
        {
            return Err(Error::NotSupported(
                "algorithm attributes are fixed on this device".into(),
            ));
        }
        self.put_data(key_ref.algorithm_attributes_do(), attributes.to_bytes())?;
        debug!(?key_ref, "algorithm attributes set");
        Ok(())
    }

    /// Generate a new RSA key in a slot and return its public half
    ///
    /// Requires a verified Admin PIN.
    pub fn generate_rsa_key(&mut self, key_ref: KeyRef, key_size: u16) -> Result<PublicKeyValues> {
        let supported = self.version.major == 0
            || self.version.is_less_than(4, 2, 6)
            || self.version.is_at_least(4, 3, 5);
        if !supported {
            return Err(Error::NotSupported(
                "RSA key generation is not available on firmware 4.2.6 through 4.3.4".into(),
            ));
        }
        debug!(?key_ref, "generating a {}-bit RSA key", key_size);
        if self
            .extended_capabilities()
            .has(extended_capability::ALGORITHM_ATTRIBUTES_CHANGEABLE)
        {
            self.set_algorithm_attributes(
                key_ref,
                &AlgorithmAttributes::rsa(key_size, RsaImportFormat::Standard),
            )?;
        } else if key_size != 2048 {
            return Err(Error::NotSupported(
                "this device only supports RSA 2048".into(),
            ));
        }
        let response = self.protocol.send_and_receive(&Apdu::new(
            0,
            INS_GENERATE_ASYM,
            P1_GENERATE,
            0,
            key_ref.crt_bytes(),
        ))?;
        debug!(?key_ref, "RSA key generated");
        parse_rsa_public_key(&response)
    }

    /// Generate a new EC key in a slot and return its public half
    ///
    /// Requires a verified Admin PIN.
    pub fn generate_ec_key(
        &mut self,
        key_ref: KeyRef,
        curve: EllipticCurveValues,
    ) -> Result<PublicKeyValues> {
        self.version.require("EC keys", (5, 2, 0))?;
        debug!(?key_ref, ?curve, "generating an EC key");
        self.set_algorithm_attributes(key_ref, &AlgorithmAttributes::ec(key_ref, curve))?;
        let response = self.protocol.send_and_receive(&Apdu::new(
            0,
            INS_GENERATE_ASYM,
            P1_GENERATE,
            0,
            key_ref.crt_bytes(),
        ))?;
        debug!(?key_ref, "EC key generated");
        parse_ec_public_key(curve, &response)
    }

    /// Import a private key into a slot
    ///
    /// Requires a verified Admin PIN.
    pub fn put_key(&mut self, key_ref: KeyRef, key: &PrivateKeyValues) -> Result<()> {
        debug!(?key_ref, "importing a private key");
        let attributes = match key {
            PrivateKeyValues::Rsa(_) => {
                // NEO-era firmware stores RSA keys in CRT form
                let import_format = if self.version.is_less_than(4, 0, 0) {
                    RsaImportFormat::CrtWithModulus
                } else {
                    RsaImportFormat::Standard
                };
                AlgorithmAttributes::rsa(key.bit_length() as u16, import_format)
            }
            PrivateKeyValues::Ec(ec) => {
                self.version.require("EC keys", (5, 2, 0))?;
                AlgorithmAttributes::ec(key_ref, ec.curve())
            }
        };
        if self
            .extended_capabilities()
            .has(extended_capability::ALGORITHM_ATTRIBUTES_CHANGEABLE)
        {
            self.set_algorithm_attributes(key_ref, &attributes)?;
        } else if !matches!(attributes, AlgorithmAttributes::Rsa { n_len: 2048, .. }) {
            return Err(Error::NotSupported(
                "this device only supports RSA 2048".into(),
            ));
        }

        let template = private_key_template(key_ref, key, self.version.is_less_than(4, 0, 0))?;
        self.protocol.send_and_receive(&Apdu::new(
            0,
            INS_PUT_DATA_ODD,
            0x3F,
            0xFF,
            template.to_vec(),
        ))?;
        debug!(?key_ref, "private key imported");
        Ok(())
    }

    fn pin_error(&mut self, pw: Pw, error: Error) -> Error {
        match error {
            Error::Apdu { sw: status }
                if status == sw::SECURITY_CONDITION_NOT_SATISFIED
                    || status == sw::AUTH_METHOD_BLOCKED =>
            {
                match self.pw_status() {
                    Ok(pw_status) => Error::InvalidPin {
                        attempts_remaining: pw_status.attempts(pw),
                    },
                    Err(e) => e,
                }
            }
            other => other,
        }
    }
}

/// Decode a packed BCD byte
fn decode_bcd(byte: u8) -> Result<u8> {
    let high = byte >> 4;
    let low = byte & 0x0F;
    if high > 9 || low > 9 {
        return Err(Error::bad_response(format!(
            "invalid BCD byte 0x{:02X}",
            byte
        )));
    }
    Ok(high * 10 + low)
}

fn decode_bcd_serial(bytes: &[u8]) -> Option<u32> {
    let mut serial = 0u32;
    for byte in bytes {
        serial = serial * 100 + u32::from(decode_bcd(*byte).ok()?);
    }
    Some(serial)
}

/// Firmware versions are reported as three BCD bytes
fn parse_bcd_version(data: &[u8]) -> Result<Version> {
    if data.len() < 3 {
        return Err(Error::bad_response("version requires 3 bytes"));
    }
    Ok(Version::new(
        decode_bcd(data[0])?,
        decode_bcd(data[1])?,
        decode_bcd(data[2])?,
    ))
}

fn parse_rsa_public_key(encoded: &[u8]) -> Result<PublicKeyValues> {
    let fields = tlv::parse_map(&tlv::unpack_value(TAG_PUBLIC_KEY, encoded)?)?;
    let field = |tag: u16| {
        fields.get(&tag).cloned().ok_or_else(|| {
            Error::bad_response(format!("generated key is missing tag 0x{:02X}", tag))
        })
    };
    Ok(PublicKeyValues::Rsa {
        modulus: field(TAG_PUB_MODULUS)?,
        public_exponent: field(TAG_PUB_EXPONENT)?,
    })
}

fn parse_ec_public_key(curve: EllipticCurveValues, encoded: &[u8]) -> Result<PublicKeyValues> {
    let fields = tlv::parse_map(&tlv::unpack_value(TAG_PUBLIC_KEY, encoded)?)?;
    let point = fields
        .get(&TAG_EC_POINT)
        .cloned()
        .ok_or_else(|| Error::bad_response("generated key is missing the public point"))?;
    Ok(match curve {
        EllipticCurveValues::Ed25519 | EllipticCurveValues::X25519 => {
            PublicKeyValues::Cv25519 { curve, raw: point }
        }
        _ => PublicKeyValues::Ec { curve, point },
    })
}

fn private_key_template(
    key_ref: KeyRef,
    key: &PrivateKeyValues,
    use_crt: bool,
) -> Result<Zeroizing<Vec<u8>>> {
    match key {
        PrivateKeyValues::Rsa(rsa) => {
            let mut fields: Vec<(u8, &[u8])> = vec![
                (FIELD_RSA_EXPONENT, rsa.public_exponent()),
                (FIELD_RSA_PRIME_P, rsa.prime_p()),
                (FIELD_RSA_PRIME_Q, rsa.prime_q()),
            ];
            if use_crt {
                match (
                    rsa.crt_coefficient(),
                    rsa.prime_exponent_p(),
                    rsa.prime_exponent_q(),
                ) {
                    (Some(qinv), Some(dp), Some(dq)) => {
                        fields.push((FIELD_RSA_CRT_COEFFICIENT, qinv));
                        fields.push((FIELD_RSA_EXPONENT_P, dp));
                        fields.push((FIELD_RSA_EXPONENT_Q, dq));
                        fields.push((FIELD_RSA_MODULUS, rsa.modulus()));
                    }
                    _ => {
                        return Err(Error::NotSupported(
                            "RSA import on this firmware requires a key with CRT parameters".into(),
                        ))
                    }
                }
            }
            Ok(extended_header_list(key_ref.crt_bytes(), &fields))
        }
        PrivateKeyValues::Ec(ec) => {
            let mut secret = Zeroizing::new(ec.secret().to_vec());
            if ec.curve() == EllipticCurveValues::X25519 {
                // X25519 scalars are stored little-endian; the card
                // expects big-endian
                secret.reverse();
            }
            Ok(extended_header_list(
                key_ref.crt_bytes(),
                &[(FIELD_EC_SECRET, secret.as_slice())],
            ))
        }
    }
}

/// Build the extended header list (`0x4D`): the control reference
/// template, the field headers under `0x7F48` and the concatenated field
/// values under `0x5F48`
fn extended_header_list(crt: &[u8], fields: &[(u8, &[u8])]) -> Zeroizing<Vec<u8>> {
    let mut headers = Vec::new();
    let mut values = Zeroizing::new(Vec::new());
    for (tag, value) in fields {
        push_tlv_header(&mut headers, *tag, value.len());
        values.extend_from_slice(value);
    }
    let mut body = Zeroizing::new(crt.to_vec());
    body.extend_from_slice(&Tlv::new(TAG_TEMPLATE_HEADERS, headers).to_bytes());
    body.extend_from_slice(&Tlv::new(TAG_TEMPLATE_VALUES, values.to_vec()).to_bytes());
    Zeroizing::new(Tlv::new(TAG_EXTENDED_HEADER_LIST, body.to_vec()).to_bytes())
}

fn push_tlv_header(out: &mut Vec<u8>, tag: u8, length: usize) {
    out.push(tag);
    if length < 0x80 {
        out.push(length as u8);
    } else if length <= 0xFF {
        out.push(0x81);
        out.push(length as u8);
    } else {
        out.push(0x82);
        out.extend_from_slice(&(length as u16).to_be_bytes());
    }
}

fn parse_chunks(data: Option<&Vec<u8>>) -> Vec<[u8; 20]> {
    data.map(|data| {
        data.chunks_exact(20)
            .map(|chunk| {
                let mut out = [0u8; 20];
                out.copy_from_slice(chunk);
                out
            })
            .collect()
    })
    .unwrap_or_default()
}

fn parse_generation_times(data: Option<&Vec<u8>>) -> Vec<u32> {
    data.map(|data| {
        data.chunks_exact(4)
            .map(|chunk| u32::from_be_bytes([chunk[0], chunk[1], chunk[2], chunk[3]]))
            .collect()
    })
    .unwrap_or_default()
}

fn parse_key_information(data: &[u8]) -> Result<Vec<(KeyRef, KeyStatus)>> {
    data.chunks_exact(2)
        .map(|pair| Ok((KeyRef::from_value(pair[0])?, KeyStatus::from_value(pair[1])?)))
        .collect()
}
