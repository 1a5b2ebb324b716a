//! YubiKey OTP application: program and use the two OTP slots
//!
//! Each slot holds one credential, triggered by a short or long touch:
//!
//! - **Yubico OTP**: a one-time password emitted as keystrokes
//! - **Static password**: a fixed sequence of keyboard scan codes
//! - **HMAC-SHA1**: a challenge-response key driven through
//!   [`YubiOtpSession::calculate_hmac_sha1`]
//!
//! On NFC-enabled devices one slot can additionally back an NDEF URI
//! payload. The application is reachable both over the OTP HID interface
//! and over CCID/NFC; over USB the CCID route may be blocked by the device
//! configuration.

use tracing::debug;
use zeroize::Zeroizing;

use ykey_core::apdu::Apdu;
use ykey_core::crc;
use ykey_core::error::{Error, Result};
use ykey_core::state::CommandState;
use ykey_core::version::Version;
use ykey_transport::connection::{OtpConnection, SmartCardConnection, Transport};
use ykey_transport::{OtpProtocol, SmartCardProtocol};

use crate::management;

pub mod config;

pub use config::{
    HmacSha1SlotConfiguration, SlotConfiguration, StaticPasswordSlotConfiguration,
    UpdateConfiguration, YubiOtpSlotConfiguration,
};

use config::{build_ndef_config, ACC_CODE_SIZE, CONFIG_SIZE};

/// OTP application AID
pub const AID: [u8; 8] = [0xA0, 0x00, 0x00, 0x05, 0x27, 0x20, 0x01, 0x01];

const INS_CONFIG: u8 = 0x01;

const CMD_CONFIG_1: u8 = 0x01;
const CMD_CONFIG_2: u8 = 0x03;
const CMD_UPDATE_1: u8 = 0x04;
const CMD_UPDATE_2: u8 = 0x05;
const CMD_SWAP: u8 = 0x06;
const CMD_NDEF_1: u8 = 0x08;
const CMD_NDEF_2: u8 = 0x09;
const CMD_DEVICE_SERIAL: u8 = 0x10;
const CMD_CHALLENGE_HMAC_1: u8 = 0x30;
const CMD_CHALLENGE_HMAC_2: u8 = 0x38;

const HMAC_CHALLENGE_SIZE: usize = 64;
const HMAC_RESPONSE_SIZE: usize = 20;
const SERIAL_SIZE: usize = 4;

// Slot state bits in the low byte of the status touch level
const CONFIG1_VALID: u8 = 0x01;
const CONFIG2_VALID: u8 = 0x02;
const CONFIG1_TOUCH: u8 = 0x04;
const CONFIG2_TOUCH: u8 = 0x08;
const CONFIG_LED_INV: u8 = 0x10;
const FLAGS_MASK: u16 = 0x1F;

const ZERO_ACC_CODE: [u8; ACC_CODE_SIZE] = [0; ACC_CODE_SIZE];

/// One of the two programmable OTP slots
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Slot {
    One,
    Two,
}

impl Slot {
    fn map(self, one: u8, two: u8) -> u8 {
        match self {
            Slot::One => one,
            Slot::Two => two,
        }
    }
}

/// Slot state reported by the device, refreshed after every write
#[derive(Debug, Clone, Copy)]
pub struct ConfigState {
    version: Version,
    flags: u8,
}

impl ConfigState {
    fn new(version: Version, touch_level: u16) -> Self {
        Self {
            version,
            flags: (touch_level & FLAGS_MASK) as u8,
        }
    }

    fn from_status(version: Version, status: &[u8]) -> Result<Self> {
        if status.len() < 6 {
            return Err(Error::bad_response("status struct too short"));
        }
        Ok(Self::new(
            version,
            u16::from_le_bytes([status[4], status[5]]),
        ))
    }

    /// Whether the slot holds a configuration, reported by firmware 2.1 and
    /// later
    pub fn slot_is_configured(&self, slot: Slot) -> Result<bool> {
        self.version.require("Configuration state", (2, 1, 0))?;
        Ok(self.flags & slot.map(CONFIG1_VALID, CONFIG2_VALID) != 0)
    }

    /// Whether triggering the slot requires touch, reported by firmware 3.0
    /// and later
    pub fn slot_requires_touch(&self, slot: Slot) -> Result<bool> {
        self.version.require("Touch state", (3, 0, 0))?;
        Ok(self.flags & slot.map(CONFIG1_TOUCH, CONFIG2_TOUCH) != 0)
    }

    /// Whether the slot LED behavior is inverted
    ///
    /// Reported by firmware 2.4 and later, excluding the 3.0.x series;
    /// `false` when the device cannot report it.
    pub fn is_led_inverted(&self) -> bool {
        let reported = self.version.major == 0
            || (self.version.is_at_least(2, 4, 0)
                && !(self.version.major == 3 && self.version.minor == 0));
        reported && self.flags & CONFIG_LED_INV != 0
    }
}

/// Raw slot command transfer, implemented per transport
pub trait SlotBackend {
    /// Send a configuration write and return the raw status bytes
    fn write_config(&mut self, command: u8, data: &[u8]) -> Result<Vec<u8>>;

    /// Send a slot command and read back exactly `expected_len` bytes
    fn send_and_receive(
        &mut self,
        command: u8,
        data: &[u8],
        expected_len: usize,
        state: Option<&CommandState>,
    ) -> Result<Vec<u8>>;
}

/// Slot commands over a CCID or NFC smartcard connection
pub struct CcidBackend<C: SmartCardConnection> {
    protocol: SmartCardProtocol<C>,
}

impl<C: SmartCardConnection> CcidBackend<C> {
    fn transceive(&mut self, command: u8, data: &[u8]) -> Result<Vec<u8>> {
        self.protocol
            .send_and_receive(&Apdu::new(0, INS_CONFIG, command, 0, data.to_vec()))
    }
}

impl<C: SmartCardConnection> SlotBackend for CcidBackend<C> {
    fn write_config(&mut self, command: u8, data: &[u8]) -> Result<Vec<u8>> {
        self.transceive(command, data)
    }

    fn send_and_receive(
        &mut self,
        command: u8,
        data: &[u8],
        expected_len: usize,
        _state: Option<&CommandState>,
    ) -> Result<Vec<u8>> {
        let response = self.transceive(command, data)?;
        if response.len() != expected_len {
            return Err(Error::bad_response("unexpected response length"));
        }
        Ok(response)
    }
}

/// Slot commands over the OTP HID interface
pub struct HidBackend<C: OtpConnection> {
    protocol: OtpProtocol<C>,
}

impl<C: OtpConnection> SlotBackend for HidBackend<C> {
    fn write_config(&mut self, command: u8, data: &[u8]) -> Result<Vec<u8>> {
        self.protocol.send_and_receive(command, data, None)
    }

    fn send_and_receive(
        &mut self,
        command: u8,
        data: &[u8],
        expected_len: usize,
        state: Option<&CommandState>,
    ) -> Result<Vec<u8>> {
        let response = self.protocol.send_and_receive(command, data, state)?;
        checked_response(response, expected_len)
    }
}

/// Validate the CRC trailer on a HID slot response and strip the padding
fn checked_response(mut response: Vec<u8>, expected_len: usize) -> Result<Vec<u8>> {
    if response.len() < expected_len + 2 || !crc::check(&response[..expected_len + 2]) {
        return Err(Error::bad_response("response checksum mismatch"));
    }
    response.truncate(expected_len);
    Ok(response)
}

/// Session with the YubiKey OTP application
pub struct YubiOtpSession<B: SlotBackend> {
    backend: B,
    version: Version,
    config_state: ConfigState,
    // Firmware 5.0.0-5.2.4 cannot report slot status over NFC
    dummy_status: bool,
}

impl<C: SmartCardConnection> YubiOtpSession<CcidBackend<C>> {
    /// Select the OTP application over CCID or NFC
    ///
    /// The version in the select response is unreliable over NFC, so the
    /// management application is probed for it first when present.
    pub fn from_smart_card(connection: C) -> Result<Self> {
        let mut protocol = SmartCardProtocol::new(connection);
        let nfc = protocol.transport() == Transport::Nfc;
        let mut version = None;
        if nfc {
            match protocol.select(&management::AID) {
                Ok(response) => {
                    version = Some(Version::from_text(&String::from_utf8_lossy(&response)));
                }
                // NEO: take the version from the status bytes below
                Err(Error::ApplicationNotAvailable) => {}
                Err(e) => return Err(e),
            }
        }
        let status = protocol.select(&AID)?;
        let version = match version {
            Some(version) => version,
            None => Version::from_bytes(&status)?,
        };
        protocol.configure(version);
        debug!(%version, "OTP application selected");

        let dummy_status =
            nfc && version.is_at_least(5, 0, 0) && version.is_less_than(5, 2, 5);
        let config_state = if dummy_status {
            // Assume both slots are programmed
            ConfigState::new(version, (CONFIG1_VALID | CONFIG2_VALID) as u16)
        } else {
            ConfigState::from_status(version, &status)?
        };
        Ok(Self {
            backend: CcidBackend { protocol },
            version,
            config_state,
            dummy_status,
        })
    }
}

impl<C: OtpConnection> YubiOtpSession<HidBackend<C>> {
    /// Open the OTP application over the HID interface
    pub fn from_otp(connection: C) -> Result<Self> {
        let mut protocol = OtpProtocol::new(connection)?;
        let version = protocol.version();
        let status = protocol.read_status()?;
        Ok(Self {
            backend: HidBackend { protocol },
            version,
            config_state: ConfigState::from_status(version, &status)?,
            dummy_status: false,
        })
    }
}

impl<B: SlotBackend> YubiOtpSession<B> {
    pub fn version(&self) -> Version {
        self.version
    }

    /// State of the two slots as of the last operation
    pub fn config_state(&self) -> ConfigState {
        self.config_state
    }

    /// Read the device serial number
    ///
    /// Requires the slot configuration to leave `serial_api_visible` set,
    /// which is the default.
    pub fn read_serial_number(&mut self) -> Result<u32> {
        let response = self
            .backend
            .send_and_receive(CMD_DEVICE_SERIAL, &[], SERIAL_SIZE, None)?;
        let mut serial = [0u8; SERIAL_SIZE];
        serial.copy_from_slice(&response);
        Ok(u32::from_be_bytes(serial))
    }

    /// Exchange the configurations of the two slots, requires firmware 2.3
    pub fn swap_slots(&mut self) -> Result<()> {
        self.version.require("Slot swapping", (2, 3, 0))?;
        debug!("swapping slot configurations");
        self.write_config(CMD_SWAP, &[], None)
    }

    /// Erase the configuration in a slot
    pub fn delete_slot(
        &mut self,
        slot: Slot,
        cur_acc_code: Option<&[u8; ACC_CODE_SIZE]>,
    ) -> Result<()> {
        debug!(?slot, "deleting slot configuration");
        self.write_config(
            slot.map(CMD_CONFIG_1, CMD_CONFIG_2),
            &[0; CONFIG_SIZE],
            cur_acc_code,
        )
    }

    /// Program a slot, overwriting any previous configuration
    ///
    /// `acc_code` protects the new configuration against later modification;
    /// `cur_acc_code` must match the access code currently set on the slot,
    /// if any.
    pub fn put_configuration(
        &mut self,
        slot: Slot,
        configuration: &impl SlotConfiguration,
        acc_code: Option<&[u8; ACC_CODE_SIZE]>,
        cur_acc_code: Option<&[u8; ACC_CODE_SIZE]>,
    ) -> Result<()> {
        if !configuration.is_supported_by(self.version) {
            return Err(Error::NotSupported(
                "configuration type not supported on this firmware".into(),
            ));
        }
        debug!(?slot, "writing slot configuration");
        let config = configuration.to_config(acc_code);
        self.write_config(slot.map(CMD_CONFIG_1, CMD_CONFIG_2), &config, cur_acc_code)
    }

    /// Update the flags of an already programmed slot, requires firmware 2.2
    ///
    /// The slot must have been written with `allow_update`, and stays
    /// updatable only if the new flags set it again.
    pub fn update_configuration(
        &mut self,
        slot: Slot,
        configuration: &UpdateConfiguration,
        acc_code: Option<&[u8; ACC_CODE_SIZE]>,
        cur_acc_code: Option<&[u8; ACC_CODE_SIZE]>,
    ) -> Result<()> {
        if !configuration.is_supported_by(self.version) {
            return Err(Error::NotSupported(
                "configuration updates require firmware 2.2".into(),
            ));
        }
        debug!(?slot, "updating slot configuration");
        let config = configuration.to_config(acc_code);
        self.write_config(slot.map(CMD_UPDATE_1, CMD_UPDATE_2), &config, cur_acc_code)
    }

    /// Set the NDEF payload emitted over NFC, requires firmware 3.0
    ///
    /// The OTP output of `slot` is appended to `uri`, or to
    /// `https://my.yubico.com/yk/#` when none is given.
    pub fn set_ndef_configuration(
        &mut self,
        slot: Slot,
        uri: Option<&str>,
        cur_acc_code: Option<&[u8; ACC_CODE_SIZE]>,
    ) -> Result<()> {
        self.version.require("NDEF configuration", (3, 0, 0))?;
        debug!(?slot, "writing NDEF configuration");
        self.write_config(
            slot.map(CMD_NDEF_1, CMD_NDEF_2),
            &build_ndef_config(uri)?,
            cur_acc_code,
        )
    }

    /// Run HMAC-SHA1 challenge-response against a slot, requires firmware 2.2
    ///
    /// The slot must hold an [`HmacSha1SlotConfiguration`]. Challenges are at
    /// most 64 bytes; `state` can observe touch prompts and cancel the wait.
    pub fn calculate_hmac_sha1(
        &mut self,
        slot: Slot,
        challenge: &[u8],
        state: Option<&CommandState>,
    ) -> Result<[u8; HMAC_RESPONSE_SIZE]> {
        self.version.require("Challenge-response", (2, 2, 0))?;
        if challenge.len() > HMAC_CHALLENGE_SIZE {
            return Err(Error::NotSupported(
                "challenge must be at most 64 bytes".into(),
            ));
        }
        // Pad with a byte that differs from the final challenge byte, so
        // the device can find the true challenge length
        let fill = match challenge.last().copied() {
            Some(0) => 1u8,
            _ => 0,
        };
        let mut padded = Zeroizing::new([fill; HMAC_CHALLENGE_SIZE]);
        padded[..challenge.len()].copy_from_slice(challenge);
        debug!(?slot, "calculating HMAC-SHA1 response");
        let response = self.backend.send_and_receive(
            slot.map(CMD_CHALLENGE_HMAC_1, CMD_CHALLENGE_HMAC_2),
            &padded[..],
            HMAC_RESPONSE_SIZE,
            state,
        )?;
        let mut out = [0u8; HMAC_RESPONSE_SIZE];
        out.copy_from_slice(&response);
        Ok(out)
    }

    /// Write a configuration command with the current access code appended,
    /// then refresh the slot state from the response
    fn write_config(
        &mut self,
        command: u8,
        config: &[u8],
        cur_acc_code: Option<&[u8; ACC_CODE_SIZE]>,
    ) -> Result<()> {
        let mut data = Zeroizing::new(Vec::with_capacity(config.len() + ACC_CODE_SIZE));
        data.extend_from_slice(config);
        data.extend_from_slice(cur_acc_code.unwrap_or(&ZERO_ACC_CODE));
        let status = self.backend.write_config(command, &data)?;
        self.config_state = if self.dummy_status {
            ConfigState::new(self.version, (CONFIG1_VALID | CONFIG2_VALID) as u16)
        } else {
            ConfigState::from_status(self.version, &status)?
        };
        Ok(())
    }
}
