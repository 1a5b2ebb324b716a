//! Slot configuration structures and builders
//!
//! A slot configuration is a 52-byte structure holding the fixed, private-id
//! and key fields together with three flag bytes, terminated by a CRC over
//! the first 50 bytes. Flag constants come from the YubiKey personalization
//! reference: <https://github.com/Yubico/yubikey-personalization/blob/master/ykcore/ykdef.h>

use zeroize::Zeroizing;

use ykey_core::crc;
use ykey_core::error::{Error, Result};
use ykey_core::version::Version;

/// Max size of the fixed field
pub const FIXED_SIZE: usize = 16;
/// Size of the private id field
pub const UID_SIZE: usize = 6;
/// Size of the AES key field
pub const KEY_SIZE: usize = 16;
/// Size of the slot access code
pub const ACC_CODE_SIZE: usize = 6;
/// Size of the configuration structure, excluding the current access code
pub const CONFIG_SIZE: usize = 52;

const SCAN_CODES_SIZE: usize = FIXED_SIZE + UID_SIZE + KEY_SIZE;
const HMAC_KEY_SIZE: usize = 20;
const NDEF_DATA_SIZE: usize = 54;

// Ticket flags
pub const TKTFLAG_TAB_FIRST: u8 = 0x01;
pub const TKTFLAG_APPEND_TAB1: u8 = 0x02;
pub const TKTFLAG_APPEND_TAB2: u8 = 0x04;
pub const TKTFLAG_APPEND_DELAY1: u8 = 0x08;
pub const TKTFLAG_APPEND_DELAY2: u8 = 0x10;
pub const TKTFLAG_APPEND_CR: u8 = 0x20;
pub const TKTFLAG_OATH_HOTP: u8 = 0x40;
/// Challenge-response enabled, combined with `CFGFLAG_CHAL_*`
pub const TKTFLAG_CHAL_RESP: u8 = 0x40;
pub const TKTFLAG_PROTECT_CFG2: u8 = 0x80;

// Configuration flags
pub const CFGFLAG_SEND_REF: u8 = 0x01;
pub const CFGFLAG_SHORT_TICKET: u8 = 0x02;
pub const CFGFLAG_PACING_10MS: u8 = 0x04;
pub const CFGFLAG_PACING_20MS: u8 = 0x08;
pub const CFGFLAG_STRONG_PW1: u8 = 0x10;
pub const CFGFLAG_STATIC_TICKET: u8 = 0x20;
pub const CFGFLAG_STRONG_PW2: u8 = 0x40;
pub const CFGFLAG_MAN_UPDATE: u8 = 0x80;
/// Challenge-response in Yubico OTP mode
pub const CFGFLAG_CHAL_YUBICO: u8 = 0x20;
/// Challenge-response in HMAC-SHA1 mode
pub const CFGFLAG_CHAL_HMAC: u8 = 0x22;
/// HMAC challenges may be shorter than 64 bytes
pub const CFGFLAG_HMAC_LT64: u8 = 0x04;
/// Challenge-response requires touch
pub const CFGFLAG_CHAL_BTN_TRIG: u8 = 0x08;

// Extended flags
pub const EXTFLAG_SERIAL_BTN_VISIBLE: u8 = 0x01;
pub const EXTFLAG_SERIAL_USB_VISIBLE: u8 = 0x02;
pub const EXTFLAG_SERIAL_API_VISIBLE: u8 = 0x04;
pub const EXTFLAG_USE_NUMERIC_KEYPAD: u8 = 0x08;
pub const EXTFLAG_FAST_TRIG: u8 = 0x10;
pub const EXTFLAG_ALLOW_UPDATE: u8 = 0x20;
pub const EXTFLAG_DORMANT: u8 = 0x40;
pub const EXTFLAG_LED_INV: u8 = 0x80;

/// A credential that can be programmed into an OTP slot
pub trait SlotConfiguration {
    /// Whether this configuration can be programmed on the given firmware
    fn is_supported_by(&self, version: Version) -> bool;

    /// Serialize into the configuration structure written to the device
    fn to_config(&self, acc_code: Option<&[u8; ACC_CODE_SIZE]>) -> Zeroizing<Vec<u8>>;
}

/// The three flag bytes shared by every slot configuration
#[derive(Debug, Clone, Copy)]
struct SlotFlags {
    ext: u8,
    tkt: u8,
    cfg: u8,
}

impl SlotFlags {
    fn base() -> Self {
        Self {
            ext: EXTFLAG_SERIAL_API_VISIBLE | EXTFLAG_ALLOW_UPDATE,
            tkt: 0,
            cfg: 0,
        }
    }

    /// Base flags plus keyboard-output defaults, ignored by firmware where
    /// not supported
    fn keyboard() -> Self {
        let mut flags = Self::base();
        flags.tkt |= TKTFLAG_APPEND_CR;
        flags.ext |= EXTFLAG_FAST_TRIG;
        flags
    }

    fn set(field: &mut u8, bit: u8, value: bool) {
        if value {
            *field |= bit;
        } else {
            *field &= !bit;
        }
    }

    fn set_ext(&mut self, bit: u8, value: bool) {
        Self::set(&mut self.ext, bit, value);
    }

    fn set_tkt(&mut self, bit: u8, value: bool) {
        Self::set(&mut self.tkt, bit, value);
    }

    fn set_cfg(&mut self, bit: u8, value: bool) {
        Self::set(&mut self.cfg, bit, value);
    }
}

/// Assemble the 52-byte configuration structure
///
/// `fixed` must be at most 16 bytes; its actual length is recorded in the
/// structure. The trailing checksum is the complemented CRC over the first
/// 50 bytes, little-endian.
fn build_config(
    fixed: &[u8],
    uid: &[u8; UID_SIZE],
    key: &[u8; KEY_SIZE],
    flags: SlotFlags,
    acc_code: Option<&[u8; ACC_CODE_SIZE]>,
) -> Zeroizing<Vec<u8>> {
    debug_assert!(fixed.len() <= FIXED_SIZE);
    let mut config = Zeroizing::new(vec![0u8; CONFIG_SIZE]);
    config[..fixed.len()].copy_from_slice(fixed);
    config[FIXED_SIZE..FIXED_SIZE + UID_SIZE].copy_from_slice(uid);
    config[22..22 + KEY_SIZE].copy_from_slice(key);
    if let Some(code) = acc_code {
        config[38..38 + ACC_CODE_SIZE].copy_from_slice(code);
    }
    config[44] = fixed.len() as u8;
    config[45] = flags.ext;
    config[46] = flags.tkt;
    config[47] = flags.cfg;
    // Two reserved bytes stay zero; then the complemented CRC
    let checksum = !crc::calculate(&config[..CONFIG_SIZE - 2]);
    config[CONFIG_SIZE - 2..].copy_from_slice(&checksum.to_le_bytes());
    config
}

// From nfcforum-ts-rtd-uri-1.0.pdf
const NDEF_URL_PREFIXES: [&str; 35] = [
    "http://www.",
    "https://www.",
    "http://",
    "https://",
    "tel:",
    "mailto:",
    "ftp://anonymous:anonymous@",
    "ftp://ftp.",
    "ftps://",
    "sftp://",
    "smb://",
    "nfs://",
    "ftp://",
    "dav://",
    "news:",
    "telnet://",
    "imap:",
    "rtsp://",
    "urn:",
    "pop:",
    "sip:",
    "sips:",
    "tftp:",
    "btspp://",
    "btl2cap://",
    "btgoep://",
    "tcpobex://",
    "irdaobex://",
    "file://",
    "urn:epc:id:",
    "urn:epc:tag:",
    "urn:epc:pat:",
    "urn:epc:raw:",
    "urn:epc:",
    "urn:nfc:",
];

pub(crate) const DEFAULT_NDEF_URI: &str = "https://my.yubico.com/yk/#";

/// Build the NDEF URI record payload for the NDEF slot commands
///
/// A recognized URI prefix is replaced by its one-byte identifier code.
pub(crate) fn build_ndef_config(uri: Option<&str>) -> Result<Vec<u8>> {
    let uri = uri.unwrap_or(DEFAULT_NDEF_URI);
    let (id_code, remainder) = NDEF_URL_PREFIXES
        .iter()
        .position(|prefix| uri.starts_with(prefix))
        .map(|i| (i as u8 + 1, &uri[NDEF_URL_PREFIXES[i].len()..]))
        .unwrap_or((0, uri));
    let data_length = 1 + remainder.len();
    if data_length > NDEF_DATA_SIZE {
        return Err(Error::NotSupported("NDEF URI payload too large".into()));
    }
    let mut config = vec![0u8; 2 + NDEF_DATA_SIZE];
    config[0] = data_length as u8;
    config[1] = b'U';
    config[2] = id_code;
    config[3..3 + remainder.len()].copy_from_slice(remainder.as_bytes());
    Ok(config)
}

/// Yubico OTP credential: emits a one-time password on touch
#[derive(Debug)]
pub struct YubiOtpSlotConfiguration {
    fixed: Zeroizing<Vec<u8>>,
    uid: Zeroizing<[u8; UID_SIZE]>,
    key: Zeroizing<[u8; KEY_SIZE]>,
    flags: SlotFlags,
}

impl YubiOtpSlotConfiguration {
    /// Create a Yubico OTP configuration with default settings
    ///
    /// `public_id` is the fixed modhex prefix of up to 16 bytes.
    pub fn new(public_id: &[u8], private_id: &[u8; UID_SIZE], key: &[u8; KEY_SIZE]) -> Result<Self> {
        if public_id.len() > FIXED_SIZE {
            return Err(Error::NotSupported(
                "public id must be at most 16 bytes".into(),
            ));
        }
        Ok(Self {
            fixed: Zeroizing::new(public_id.to_vec()),
            uid: Zeroizing::new(*private_id),
            key: Zeroizing::new(*key),
            flags: SlotFlags::keyboard(),
        })
    }

    /// Append a carriage return after the OTP (default: true)
    pub fn append_cr(mut self, value: bool) -> Self {
        self.flags.set_tkt(TKTFLAG_APPEND_CR, value);
        self
    }

    /// Insert tabs before the output, after the fixed part, and after the OTP
    pub fn tabs(mut self, before: bool, after_first: bool, after_second: bool) -> Self {
        self.flags.set_tkt(TKTFLAG_TAB_FIRST, before);
        self.flags.set_tkt(TKTFLAG_APPEND_TAB1, after_first);
        self.flags.set_tkt(TKTFLAG_APPEND_TAB2, after_second);
        self
    }

    /// Insert half-second delays after the fixed part and after the OTP
    pub fn delay(mut self, after_first: bool, after_second: bool) -> Self {
        self.flags.set_tkt(TKTFLAG_APPEND_DELAY1, after_first);
        self.flags.set_tkt(TKTFLAG_APPEND_DELAY2, after_second);
        self
    }

    /// Send a modhex reference string before the OTP (default: false)
    pub fn send_reference(mut self, value: bool) -> Self {
        self.flags.set_cfg(CFGFLAG_SEND_REF, value);
        self
    }

    /// Expose the serial number over the API (default: true)
    pub fn serial_api_visible(mut self, value: bool) -> Self {
        self.flags.set_ext(EXTFLAG_SERIAL_API_VISIBLE, value);
        self
    }

    /// Allow later in-place updates of this configuration (default: true)
    pub fn allow_update(mut self, value: bool) -> Self {
        self.flags.set_ext(EXTFLAG_ALLOW_UPDATE, value);
        self
    }

    /// Program the slot in a dormant, unusable state (default: false)
    pub fn dormant(mut self, value: bool) -> Self {
        self.flags.set_ext(EXTFLAG_DORMANT, value);
        self
    }

    /// When set on slot 1, modification of slot 2 is blocked
    pub fn protect_slot2(mut self, value: bool) -> Self {
        self.flags.set_tkt(TKTFLAG_PROTECT_CFG2, value);
        self
    }
}

impl SlotConfiguration for YubiOtpSlotConfiguration {
    fn is_supported_by(&self, _version: Version) -> bool {
        true
    }

    fn to_config(&self, acc_code: Option<&[u8; ACC_CODE_SIZE]>) -> Zeroizing<Vec<u8>> {
        build_config(&self.fixed, &self.uid, &self.key, self.flags, acc_code)
    }
}

/// Static password credential: types a fixed sequence of keyboard scan codes
pub struct StaticPasswordSlotConfiguration {
    scan_codes: Zeroizing<[u8; SCAN_CODES_SIZE]>,
    flags: SlotFlags,
}

impl StaticPasswordSlotConfiguration {
    /// Create a static password configuration from up to 38 scan codes
    pub fn new(scan_codes: &[u8]) -> Result<Self> {
        if scan_codes.len() > SCAN_CODES_SIZE {
            return Err(Error::NotSupported("password is too long".into()));
        }
        // Scan codes are packed across the fixed, uid and key fields
        let mut packed = Zeroizing::new([0u8; SCAN_CODES_SIZE]);
        packed[..scan_codes.len()].copy_from_slice(scan_codes);
        let mut flags = SlotFlags::keyboard();
        flags.set_cfg(CFGFLAG_SHORT_TICKET, true);
        Ok(Self {
            scan_codes: packed,
            flags,
        })
    }

    /// Append a carriage return after the password (default: true)
    pub fn append_cr(mut self, value: bool) -> Self {
        self.flags.set_tkt(TKTFLAG_APPEND_CR, value);
        self
    }

    /// Allow later in-place updates of this configuration (default: true)
    pub fn allow_update(mut self, value: bool) -> Self {
        self.flags.set_ext(EXTFLAG_ALLOW_UPDATE, value);
        self
    }

    /// Expose the serial number over the API (default: true)
    pub fn serial_api_visible(mut self, value: bool) -> Self {
        self.flags.set_ext(EXTFLAG_SERIAL_API_VISIBLE, value);
        self
    }
}

impl SlotConfiguration for StaticPasswordSlotConfiguration {
    fn is_supported_by(&self, version: Version) -> bool {
        version.supports((2, 2, 0))
    }

    fn to_config(&self, acc_code: Option<&[u8; ACC_CODE_SIZE]>) -> Zeroizing<Vec<u8>> {
        let mut uid = Zeroizing::new([0u8; UID_SIZE]);
        let mut key = Zeroizing::new([0u8; KEY_SIZE]);
        uid.copy_from_slice(&self.scan_codes[FIXED_SIZE..FIXED_SIZE + UID_SIZE]);
        key.copy_from_slice(&self.scan_codes[FIXED_SIZE + UID_SIZE..]);
        build_config(
            &self.scan_codes[..FIXED_SIZE],
            &uid,
            &key,
            self.flags,
            acc_code,
        )
    }
}

/// HMAC-SHA1 challenge-response credential, used with
/// [`YubiOtpSession::calculate_hmac_sha1`](super::YubiOtpSession::calculate_hmac_sha1)
pub struct HmacSha1SlotConfiguration {
    uid: Zeroizing<[u8; UID_SIZE]>,
    key: Zeroizing<[u8; KEY_SIZE]>,
    flags: SlotFlags,
}

impl HmacSha1SlotConfiguration {
    /// Create a challenge-response configuration from an HMAC key of up to
    /// 20 bytes
    pub fn new(secret: &[u8]) -> Result<Self> {
        if secret.len() > HMAC_KEY_SIZE {
            return Err(Error::NotSupported(
                "key lengths over 20 bytes are not supported".into(),
            ));
        }
        // The secret spans the key field and the first four uid bytes
        let mut padded = Zeroizing::new([0u8; KEY_SIZE + UID_SIZE]);
        padded[..secret.len()].copy_from_slice(secret);
        let mut uid = Zeroizing::new([0u8; UID_SIZE]);
        let mut key = Zeroizing::new([0u8; KEY_SIZE]);
        key.copy_from_slice(&padded[..KEY_SIZE]);
        uid.copy_from_slice(&padded[KEY_SIZE..]);
        let mut flags = SlotFlags::base();
        flags.set_tkt(TKTFLAG_CHAL_RESP, true);
        flags.set_cfg(CFGFLAG_CHAL_HMAC, true);
        flags.set_cfg(CFGFLAG_HMAC_LT64, true);
        Ok(Self { uid, key, flags })
    }

    /// Require touch for every response calculation (default: false)
    pub fn require_touch(mut self, value: bool) -> Self {
        self.flags.set_cfg(CFGFLAG_CHAL_BTN_TRIG, value);
        self
    }

    /// Accept challenges shorter than 64 bytes (default: true)
    ///
    /// When disabled, every challenge must be exactly 64 bytes long.
    pub fn lt64(mut self, value: bool) -> Self {
        self.flags.set_cfg(CFGFLAG_HMAC_LT64, value);
        self
    }

    /// Allow later in-place updates of this configuration (default: true)
    pub fn allow_update(mut self, value: bool) -> Self {
        self.flags.set_ext(EXTFLAG_ALLOW_UPDATE, value);
        self
    }

    /// Expose the serial number over the API (default: true)
    pub fn serial_api_visible(mut self, value: bool) -> Self {
        self.flags.set_ext(EXTFLAG_SERIAL_API_VISIBLE, value);
        self
    }
}

impl SlotConfiguration for HmacSha1SlotConfiguration {
    fn is_supported_by(&self, version: Version) -> bool {
        version.supports((2, 2, 0))
    }

    fn to_config(&self, acc_code: Option<&[u8; ACC_CODE_SIZE]>) -> Zeroizing<Vec<u8>> {
        build_config(&[], &self.uid, &self.key, self.flags, acc_code)
    }
}

/// Flag-only update for a previously programmed slot
///
/// Only flags that are safe to change in place can be set here; the slot
/// must have been written with `allow_update` for the device to accept it.
pub struct UpdateConfiguration {
    flags: SlotFlags,
}

impl Default for UpdateConfiguration {
    fn default() -> Self {
        Self::new()
    }
}

impl UpdateConfiguration {
    pub fn new() -> Self {
        Self {
            flags: SlotFlags::keyboard(),
        }
    }

    /// Append a carriage return after the output (default: true)
    pub fn append_cr(mut self, value: bool) -> Self {
        self.flags.set_tkt(TKTFLAG_APPEND_CR, value);
        self
    }

    /// Insert tabs before the output, after the fixed part, and after the OTP
    pub fn tabs(mut self, before: bool, after_first: bool, after_second: bool) -> Self {
        self.flags.set_tkt(TKTFLAG_TAB_FIRST, before);
        self.flags.set_tkt(TKTFLAG_APPEND_TAB1, after_first);
        self.flags.set_tkt(TKTFLAG_APPEND_TAB2, after_second);
        self
    }

    /// Insert half-second delays after the fixed part and after the OTP
    pub fn delay(mut self, after_first: bool, after_second: bool) -> Self {
        self.flags.set_tkt(TKTFLAG_APPEND_DELAY1, after_first);
        self.flags.set_tkt(TKTFLAG_APPEND_DELAY2, after_second);
        self
    }

    /// Add ~10ms and/or ~20ms pacing between keystrokes
    pub fn pacing(mut self, pacing_10ms: bool, pacing_20ms: bool) -> Self {
        self.flags.set_cfg(CFGFLAG_PACING_10MS, pacing_10ms);
        self.flags.set_cfg(CFGFLAG_PACING_20MS, pacing_20ms);
        self
    }

    /// Send digits using the numeric keypad scan codes (default: false)
    pub fn use_numeric(mut self, value: bool) -> Self {
        self.flags.set_ext(EXTFLAG_USE_NUMERIC_KEYPAD, value);
        self
    }

    /// Faster triggering when only slot 1 is configured (default: true)
    pub fn fast_trigger(mut self, value: bool) -> Self {
        self.flags.set_ext(EXTFLAG_FAST_TRIG, value);
        self
    }

    /// Keep the configuration updatable (default: true)
    pub fn allow_update(mut self, value: bool) -> Self {
        self.flags.set_ext(EXTFLAG_ALLOW_UPDATE, value);
        self
    }

    /// Set or clear the dormant state (default: false)
    pub fn dormant(mut self, value: bool) -> Self {
        self.flags.set_ext(EXTFLAG_DORMANT, value);
        self
    }

    /// Invert the idle LED state (default: false)
    pub fn invert_led(mut self, value: bool) -> Self {
        self.flags.set_ext(EXTFLAG_LED_INV, value);
        self
    }

    /// Expose the serial number over the API (default: true)
    pub fn serial_api_visible(mut self, value: bool) -> Self {
        self.flags.set_ext(EXTFLAG_SERIAL_API_VISIBLE, value);
        self
    }

    /// Expose the serial number in the USB descriptor (default: false)
    pub fn serial_usb_visible(mut self, value: bool) -> Self {
        self.flags.set_ext(EXTFLAG_SERIAL_USB_VISIBLE, value);
        self
    }
}

impl SlotConfiguration for UpdateConfiguration {
    fn is_supported_by(&self, version: Version) -> bool {
        version.supports((2, 2, 0))
    }

    fn to_config(&self, acc_code: Option<&[u8; ACC_CODE_SIZE]>) -> Zeroizing<Vec<u8>> {
        build_config(&[], &[0; UID_SIZE], &[0; KEY_SIZE], self.flags, acc_code)
    }
}
