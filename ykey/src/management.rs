//! Device management: read device information and configure which
//! applications are enabled over USB and NFC.
//!
//! The management application is reachable over all three transports:
//!
//! - **CCID**: SELECT of the management AID, configuration APDUs
//! - **OTP HID**: slot commands carrying the same configuration frames
//! - **FIDO HID**: CTAPHID vendor commands
//!
//! ## Example
//!
//! ```no_run
//! # use ykey::management::ManagementSession;
//! # fn run(connection: impl ykey_transport::SmartCardConnection) -> ykey_core::Result<()> {
//! let mut session = ManagementSession::from_smart_card(connection)?;
//! let info = session.read_device_info()?;
//! println!("serial: {:?}", info.serial);
//! # Ok(())
//! # }
//! ```
//!
//! Reference: <https://developers.yubico.com/yubikey-manager/Config_Reference.html>

use tracing::debug;

use ykey_core::apdu::Apdu;
use ykey_core::error::{Error, Result};
use ykey_core::tlv::Tlv;
use ykey_core::version::Version;
use ykey_core::{crc, tlv};
use ykey_transport::connection::{FidoConnection, OtpConnection, SmartCardConnection, Transport};
use ykey_transport::ctaphid::{CtapHidCommand, CTAP_VENDOR_FIRST};
use ykey_transport::{FidoProtocol, OtpProtocol, SmartCardProtocol};

/// Management application AID
pub const AID: [u8; 8] = [0xA0, 0x00, 0x00, 0x05, 0x27, 0x47, 0x11, 0x17];

const INS_READ_CONFIG: u8 = 0x1D;
const INS_WRITE_CONFIG: u8 = 0x1C;
const INS_SET_MODE: u8 = 0x16;
const P1_DEVICE_CONFIG: u8 = 0x11;

const CMD_DEVICE_CONFIG: u8 = 0x11;
const CMD_YK4_CAPABILITIES: u8 = 0x13;
const CMD_YK4_SET_DEVICE_INFO: u8 = 0x15;

const CTAP_YUBIKEY_DEVICE_CONFIG: u8 = CTAP_VENDOR_FIRST;
const CTAP_READ_CONFIG: u8 = CTAP_VENDOR_FIRST + 2;
const CTAP_WRITE_CONFIG: u8 = CTAP_VENDOR_FIRST + 3;

const TAG_USB_SUPPORTED: u16 = 0x01;
const TAG_SERIAL: u16 = 0x02;
const TAG_USB_ENABLED: u16 = 0x03;
const TAG_FORM_FACTOR: u16 = 0x04;
const TAG_FIRMWARE_VERSION: u16 = 0x05;
const TAG_AUTO_EJECT_TIMEOUT: u16 = 0x06;
const TAG_CHALLENGE_RESPONSE_TIMEOUT: u16 = 0x07;
const TAG_DEVICE_FLAGS: u16 = 0x08;
const TAG_CONFIG_LOCK: u16 = 0x0A;
const TAG_UNLOCK: u16 = 0x0B;
const TAG_REBOOT: u16 = 0x0C;
const TAG_NFC_SUPPORTED: u16 = 0x0D;
const TAG_NFC_ENABLED: u16 = 0x0E;

const FORM_FACTOR_FIPS_FLAG: u8 = 0x80;
const FORM_FACTOR_SKY_FLAG: u8 = 0x40;

/// Application capability bits, as used in [`DeviceInfo`] and [`DeviceConfig`]
pub mod capability {
    pub const OTP: u16 = 0x001;
    pub const U2F: u16 = 0x002;
    pub const OPENPGP: u16 = 0x008;
    pub const PIV: u16 = 0x010;
    pub const OATH: u16 = 0x020;
    pub const HSMAUTH: u16 = 0x100;
    pub const FIDO2: u16 = 0x200;
}

/// USB interface bits for pre-5.0 mode switching
pub mod usb_interface {
    pub const OTP: u8 = 0x01;
    pub const FIDO: u8 = 0x02;
    pub const CCID: u8 = 0x04;
}

/// USB transport mode for YubiKey NEO and YubiKey 4
///
/// Replaced by [`DeviceConfig`] starting with the YubiKey 5 series;
/// [`ManagementSession::set_mode`] translates automatically on such devices.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Mode {
    Otp,
    Ccid,
    OtpCcid,
    Fido,
    OtpFido,
    FidoCcid,
    OtpFidoCcid,
}

impl Mode {
    /// The mode code as written to the device
    pub fn code(self) -> u8 {
        match self {
            Mode::Otp => 0x00,
            Mode::Ccid => 0x01,
            Mode::OtpCcid => 0x02,
            Mode::Fido => 0x03,
            Mode::OtpFido => 0x04,
            Mode::FidoCcid => 0x05,
            Mode::OtpFidoCcid => 0x06,
        }
    }

    /// The [`usb_interface`] bits enabled in this mode
    pub fn interfaces(self) -> u8 {
        match self {
            Mode::Otp => usb_interface::OTP,
            Mode::Ccid => usb_interface::CCID,
            Mode::OtpCcid => usb_interface::OTP | usb_interface::CCID,
            Mode::Fido => usb_interface::FIDO,
            Mode::OtpFido => usb_interface::OTP | usb_interface::FIDO,
            Mode::FidoCcid => usb_interface::FIDO | usb_interface::CCID,
            Mode::OtpFidoCcid => {
                usb_interface::OTP | usb_interface::FIDO | usb_interface::CCID
            }
        }
    }

    /// The mode enabling exactly the given [`usb_interface`] bits
    pub fn from_interfaces(interfaces: u8) -> Option<Self> {
        [
            Mode::Otp,
            Mode::Ccid,
            Mode::OtpCcid,
            Mode::Fido,
            Mode::OtpFido,
            Mode::FidoCcid,
            Mode::OtpFidoCcid,
        ]
        .into_iter()
        .find(|mode| mode.interfaces() == interfaces)
    }
}

/// The physical form factor of a YubiKey
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum FormFactor {
    /// Form factor information is unavailable
    #[default]
    Unknown,
    UsbAKeychain,
    UsbANano,
    UsbCKeychain,
    UsbCNano,
    UsbCLightning,
    UsbABio,
    UsbCBio,
}

impl FormFactor {
    /// Decode the low nibble of the form factor byte
    pub fn from_code(code: u8) -> Self {
        match code & 0x0F {
            0x01 => FormFactor::UsbAKeychain,
            0x02 => FormFactor::UsbANano,
            0x03 => FormFactor::UsbCKeychain,
            0x04 => FormFactor::UsbCNano,
            0x05 => FormFactor::UsbCLightning,
            0x06 => FormFactor::UsbABio,
            0x07 => FormFactor::UsbCBio,
            _ => FormFactor::Unknown,
        }
    }
}

/// Mutable device settings, written with
/// [`ManagementSession::write_device_config`]
///
/// Fields left as `None` are not touched by a write.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct DeviceConfig {
    /// Enabled [`capability`] bits on the USB transport
    pub usb_enabled: Option<u16>,
    /// Enabled [`capability`] bits on the NFC transport
    pub nfc_enabled: Option<u16>,
    /// CCID auto-eject timeout in 10s of seconds, 0 disables
    pub auto_eject_timeout: Option<u16>,
    /// Timeout in seconds for challenge-response operations requiring touch
    pub challenge_response_timeout: Option<u8>,
    /// Device flag bits
    pub device_flags: Option<u8>,
}

impl DeviceConfig {
    /// Enabled capabilities for a transport, when known
    pub fn enabled_capabilities(&self, transport: Transport) -> Option<u16> {
        match transport {
            Transport::Usb => self.usb_enabled,
            Transport::Nfc => self.nfc_enabled,
        }
    }

    /// Serialize into the length-prefixed TLV write frame
    fn to_bytes(
        &self,
        reboot: bool,
        current_lock_code: Option<&[u8]>,
        new_lock_code: Option<&[u8]>,
    ) -> Result<Vec<u8>> {
        let mut tlvs = Vec::new();
        if reboot {
            tlvs.push(Tlv::new(TAG_REBOOT, Vec::new()));
        }
        if let Some(code) = current_lock_code {
            tlvs.push(Tlv::new(TAG_UNLOCK, code));
        }
        if let Some(usb) = self.usb_enabled {
            tlvs.push(Tlv::new(TAG_USB_ENABLED, usb.to_be_bytes()));
        }
        if let Some(nfc) = self.nfc_enabled {
            tlvs.push(Tlv::new(TAG_NFC_ENABLED, nfc.to_be_bytes()));
        }
        if let Some(timeout) = self.auto_eject_timeout {
            tlvs.push(Tlv::new(TAG_AUTO_EJECT_TIMEOUT, timeout.to_be_bytes()));
        }
        if let Some(timeout) = self.challenge_response_timeout {
            tlvs.push(Tlv::new(TAG_CHALLENGE_RESPONSE_TIMEOUT, [timeout]));
        }
        if let Some(flags) = self.device_flags {
            tlvs.push(Tlv::new(TAG_DEVICE_FLAGS, [flags]));
        }
        if let Some(code) = new_lock_code {
            tlvs.push(Tlv::new(TAG_CONFIG_LOCK, code));
        }
        let data = tlv::pack_list(&tlvs);
        if data.len() > 0xFF {
            return Err(Error::NotSupported(
                "device configuration too large".into(),
            ));
        }
        let mut frame = Vec::with_capacity(data.len() + 1);
        frame.push(data.len() as u8);
        frame.extend_from_slice(&data);
        Ok(frame)
    }
}

/// Device information read with [`ManagementSession::read_device_info`]
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DeviceInfo {
    /// The current device configuration
    pub config: DeviceConfig,
    /// Serial number, when set and API-visible
    pub serial: Option<u32>,
    /// Firmware version, preferring the value reported in the info blob
    pub version: Version,
    pub form_factor: FormFactor,
    /// FIPS variant of the device
    pub is_fips: bool,
    /// Security Key series device
    pub is_sky: bool,
    /// A configuration lock code is set
    pub is_locked: bool,
    /// Supported [`capability`] bits on the USB transport
    pub usb_supported: u16,
    /// Supported [`capability`] bits on the NFC transport, if NFC is present
    pub nfc_supported: Option<u16>,
}

impl DeviceInfo {
    /// Whether the device has the given physical transport
    pub fn has_transport(&self, transport: Transport) -> bool {
        match transport {
            Transport::Usb => true,
            Transport::Nfc => self.nfc_supported.is_some(),
        }
    }

    /// Supported capabilities for a transport, zero when absent
    pub fn supported_capabilities(&self, transport: Transport) -> u16 {
        match transport {
            Transport::Usb => self.usb_supported,
            Transport::Nfc => self.nfc_supported.unwrap_or(0),
        }
    }

    fn parse(response: &[u8], default_version: Version) -> Result<Self> {
        let length = *response
            .first()
            .ok_or_else(|| Error::bad_response("empty device info"))?
            as usize;
        if length != response.len() - 1 {
            return Err(Error::bad_response("device info length mismatch"));
        }
        let data = tlv::parse_map(&response[1..])?;
        let get_int = |tag: u16| data.get(&tag).map(|value| be_int(value)).unwrap_or(0);

        let version = match data.get(&TAG_FIRMWARE_VERSION) {
            Some(value) => Version::from_bytes(value)?,
            None => default_version,
        };
        let form_factor_byte = get_int(TAG_FORM_FACTOR) as u8;

        // 4.2.4 reports an incorrect supported-capabilities mask
        let usb_supported = if version == Version::new(4, 2, 4) {
            0x3F
        } else {
            get_int(TAG_USB_SUPPORTED) as u16
        };
        let nfc_supported = data
            .get(&TAG_NFC_SUPPORTED)
            .map(|value| be_int(value) as u16);

        Ok(DeviceInfo {
            config: DeviceConfig {
                usb_enabled: data.get(&TAG_USB_ENABLED).map(|value| be_int(value) as u16),
                nfc_enabled: nfc_supported
                    .is_some()
                    .then(|| get_int(TAG_NFC_ENABLED) as u16),
                auto_eject_timeout: Some(get_int(TAG_AUTO_EJECT_TIMEOUT) as u16),
                challenge_response_timeout: Some(get_int(TAG_CHALLENGE_RESPONSE_TIMEOUT) as u8),
                device_flags: Some(get_int(TAG_DEVICE_FLAGS) as u8),
            },
            serial: match get_int(TAG_SERIAL) {
                0 => None,
                serial => Some(serial),
            },
            version,
            form_factor: FormFactor::from_code(form_factor_byte),
            is_fips: form_factor_byte & FORM_FACTOR_FIPS_FLAG != 0,
            is_sky: form_factor_byte & FORM_FACTOR_SKY_FLAG != 0,
            is_locked: data.get(&TAG_CONFIG_LOCK).map(Vec::as_slice) == Some(&[0x01]),
            usb_supported,
            nfc_supported,
        })
    }
}

/// Big-endian integer of up to four bytes, high bytes beyond that dropped
fn be_int(bytes: &[u8]) -> u32 {
    bytes
        .iter()
        .fold(0, |value, byte| value << 8 | u32::from(*byte))
}

/// Validate and strip the CRC trailer on an OTP-backend config read
fn checked_config_frame(response: &[u8]) -> Result<Vec<u8>> {
    let length = *response
        .first()
        .ok_or_else(|| Error::bad_response("empty config response"))? as usize;
    if response.len() < length + 3 || !crc::check(&response[..length + 3]) {
        return Err(Error::bad_response("config checksum mismatch"));
    }
    Ok(response[..length + 1].to_vec())
}

/// Raw configuration transfer, implemented per transport
pub trait ManagementBackend {
    fn read_config(&mut self) -> Result<Vec<u8>>;
    fn write_config(&mut self, config: &[u8]) -> Result<()>;
    fn set_mode(&mut self, data: &[u8]) -> Result<()>;
}

/// Management over a CCID or NFC smartcard connection
pub struct CcidBackend<C: SmartCardConnection> {
    protocol: SmartCardProtocol<C>,
}

impl<C: SmartCardConnection> ManagementBackend for CcidBackend<C> {
    fn read_config(&mut self) -> Result<Vec<u8>> {
        self.protocol
            .send_and_receive(&Apdu::new(0, INS_READ_CONFIG, 0, 0, Vec::new()))
    }

    fn write_config(&mut self, config: &[u8]) -> Result<()> {
        self.protocol
            .send_and_receive(&Apdu::new(0, INS_WRITE_CONFIG, 0, 0, config.to_vec()))?;
        Ok(())
    }

    fn set_mode(&mut self, data: &[u8]) -> Result<()> {
        self.protocol.send_and_receive(&Apdu::new(
            0,
            INS_SET_MODE,
            P1_DEVICE_CONFIG,
            0,
            data.to_vec(),
        ))?;
        Ok(())
    }
}

/// Management over the OTP HID interface
pub struct OtpBackend<C: OtpConnection> {
    protocol: OtpProtocol<C>,
}

impl<C: OtpConnection> ManagementBackend for OtpBackend<C> {
    fn read_config(&mut self) -> Result<Vec<u8>> {
        let response = self
            .protocol
            .send_and_receive(CMD_YK4_CAPABILITIES, &[], None)?;
        checked_config_frame(&response)
    }

    fn write_config(&mut self, config: &[u8]) -> Result<()> {
        self.protocol
            .send_and_receive(CMD_YK4_SET_DEVICE_INFO, config, None)?;
        Ok(())
    }

    fn set_mode(&mut self, data: &[u8]) -> Result<()> {
        self.protocol.send_and_receive(CMD_DEVICE_CONFIG, data, None)?;
        Ok(())
    }
}

/// Management over the FIDO HID interface, using vendor commands
pub struct FidoBackend<C: FidoConnection> {
    protocol: FidoProtocol<C>,
}

impl<C: FidoConnection> ManagementBackend for FidoBackend<C> {
    fn read_config(&mut self) -> Result<Vec<u8>> {
        self.protocol
            .send_and_receive(CtapHidCommand::Vendor(CTAP_READ_CONFIG), &[], None)
    }

    fn write_config(&mut self, config: &[u8]) -> Result<()> {
        self.protocol
            .send_and_receive(CtapHidCommand::Vendor(CTAP_WRITE_CONFIG), config, None)?;
        Ok(())
    }

    fn set_mode(&mut self, data: &[u8]) -> Result<()> {
        self.protocol.send_and_receive(
            CtapHidCommand::Vendor(CTAP_YUBIKEY_DEVICE_CONFIG),
            data,
            None,
        )?;
        Ok(())
    }
}

/// Session with the YubiKey management application
pub struct ManagementSession<B: ManagementBackend> {
    backend: B,
    version: Version,
}

impl<C: SmartCardConnection> ManagementSession<CcidBackend<C>> {
    /// Select the management application over CCID or NFC
    ///
    /// The firmware version is parsed out of the select response text.
    pub fn from_smart_card(connection: C) -> Result<Self> {
        let mut protocol = SmartCardProtocol::new(connection);
        let select = protocol.select(&AID)?;
        let version = Version::from_text(&String::from_utf8_lossy(&select));
        protocol.configure(version);
        debug!(%version, "management application selected");
        Ok(Self {
            backend: CcidBackend { protocol },
            version,
        })
    }
}

impl<C: OtpConnection> ManagementSession<OtpBackend<C>> {
    /// Open the management application over the OTP HID interface
    pub fn from_otp(connection: C) -> Result<Self> {
        let protocol = OtpProtocol::new(connection)?;
        let version = protocol.version();
        if version.is_less_than(3, 0, 0) && version.major != 0 {
            return Err(Error::ApplicationNotAvailable);
        }
        Ok(Self {
            backend: OtpBackend { protocol },
            version,
        })
    }
}

impl<C: FidoConnection> ManagementSession<FidoBackend<C>> {
    /// Open the management application over the FIDO HID interface
    pub fn from_fido(connection: C) -> Result<Self> {
        let protocol = FidoProtocol::new(connection)?;
        let version = protocol.version();
        Ok(Self {
            backend: FidoBackend { protocol },
            version,
        })
    }
}

impl<B: ManagementBackend> ManagementSession<B> {
    pub fn version(&self) -> Version {
        self.version
    }

    /// Read device information, supported on firmware 4.1 and later
    pub fn read_device_info(&mut self) -> Result<DeviceInfo> {
        self.version.require("Device info", (4, 1, 0))?;
        debug!("reading device info");
        DeviceInfo::parse(&self.backend.read_config()?, self.version)
    }

    /// Write a device configuration, supported on firmware 5.0 and later
    ///
    /// `current_lock_code` is required when a configuration lock is set;
    /// `new_lock_code` changes it, or removes it when 16 zero bytes. With
    /// `reboot` the new configuration takes effect immediately.
    pub fn write_device_config(
        &mut self,
        config: &DeviceConfig,
        reboot: bool,
        current_lock_code: Option<&[u8]>,
        new_lock_code: Option<&[u8]>,
    ) -> Result<()> {
        self.version.require("Device config", (5, 0, 0))?;
        debug!(reboot, "writing device config");
        self.backend
            .write_config(&config.to_bytes(reboot, current_lock_code, new_lock_code)?)
    }

    /// Set the USB transport mode
    ///
    /// On firmware 5.0 and later the mode is translated into an equivalent
    /// [`DeviceConfig`] write; earlier firmware uses the dedicated mode
    /// command. `auto_eject_timeout` only applies to CCID-only modes.
    pub fn set_mode(
        &mut self,
        mode: Mode,
        challenge_response_timeout: u8,
        auto_eject_timeout: u16,
    ) -> Result<()> {
        debug!(?mode, "setting USB mode");
        if self.version.is_at_least(5, 0, 0) {
            let interfaces = mode.interfaces();
            let mut usb_enabled = 0;
            if interfaces & usb_interface::OTP != 0 {
                usb_enabled |= capability::OTP;
            }
            if interfaces & usb_interface::CCID != 0 {
                usb_enabled |= capability::OATH | capability::PIV | capability::OPENPGP;
            }
            if interfaces & usb_interface::FIDO != 0 {
                usb_enabled |= capability::U2F | capability::FIDO2;
            }
            let config = DeviceConfig {
                usb_enabled: Some(usb_enabled),
                auto_eject_timeout: Some(auto_eject_timeout),
                challenge_response_timeout: Some(challenge_response_timeout),
                ..DeviceConfig::default()
            };
            self.write_device_config(&config, false, None, None)
        } else {
            self.version.require("Mode switching", (3, 0, 0))?;
            let mut data = vec![mode.code(), challenge_response_timeout];
            data.extend_from_slice(&auto_eject_timeout.to_be_bytes());
            self.backend.set_mode(&data)
        }
    }
}
