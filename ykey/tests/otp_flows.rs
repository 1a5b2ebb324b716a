//! YubiOTP slot flows against a virtual key
//!
//! The device below implements the CCID side of the slot protocol: it
//! unpacks the 52-byte configuration structure, tracks the programming
//! sequence counter and answers challenges with the HMAC key it was
//! programmed with. That exercises the whole path from configuration
//! packing through APDU framing to response handling, with the key
//! material cross-checked against a software HMAC-SHA1.

use std::cell::RefCell;
use std::rc::Rc;

use hmac::{Hmac, Mac};
use sha1::Sha1;
use ykey::yubiotp::{CcidBackend, HmacSha1SlotConfiguration, Slot, YubiOtpSession};
use ykey_core::{crc, Error, Result, Version};
use ykey_transport::{SmartCardConnection, Transport};

const FIRMWARE: [u8; 3] = [5, 4, 3];
const SERIAL_NUMBER: u32 = 9_876_543;
const ACCESS_CODE: [u8; 6] = [0x4B, 0x4C, 0x4D, 0x4E, 0x4F, 0x50];
const OTP_AID: [u8; 8] = [0xA0, 0x00, 0x00, 0x05, 0x27, 0x20, 0x01, 0x01];

const SW_CONDITIONS_NOT_SATISFIED: u16 = 0x6985;

struct SlotState {
    key: [u8; 20],
    acc_code: [u8; 6],
}

/// Device-side state, shared with the test through an `Rc` so the slots
/// stay inspectable after the connection moves into the session
struct VirtualKey {
    pgm_seq: u8,
    slots: [Option<SlotState>; 2],
}

impl VirtualKey {
    fn new() -> Self {
        Self {
            pgm_seq: 0,
            slots: [None, None],
        }
    }

    fn status(&self) -> Vec<u8> {
        let mut touch_level = 0u16;
        if self.slots[0].is_some() {
            touch_level |= 0x01;
        }
        if self.slots[1].is_some() {
            touch_level |= 0x02;
        }
        let mut out = FIRMWARE.to_vec();
        out.push(self.pgm_seq);
        out.extend_from_slice(&touch_level.to_le_bytes());
        out
    }

    fn apdu(&mut self, apdu: &[u8]) -> Vec<u8> {
        if apdu.get(1) == Some(&0xA4) {
            assert_eq!(&apdu[..5], &[0x00, 0xA4, 0x04, 0x00, 0x08]);
            assert_eq!(&apdu[5..], OTP_AID);
            return ok(self.status());
        }
        assert_eq!(&apdu[..2], &[0x00, 0x01], "not a slot command APDU");
        let command = apdu[2];
        assert_eq!(apdu[3], 0x00);
        let data = if apdu.len() > 4 {
            let length = apdu[4] as usize;
            assert_eq!(apdu[5..].len(), length, "Lc does not match the body");
            apdu[5..].to_vec()
        } else {
            Vec::new()
        };
        let result = match command {
            0x01 => self.write_slot(0, &data).map(|()| self.status()),
            0x03 => self.write_slot(1, &data).map(|()| self.status()),
            0x06 => {
                self.slots.swap(0, 1);
                self.pgm_seq += 1;
                Ok(self.status())
            }
            0x10 => Ok(SERIAL_NUMBER.to_be_bytes().to_vec()),
            0x30 => self.challenge(0, &data),
            0x38 => self.challenge(1, &data),
            other => panic!("unexpected slot command {other:#04x}"),
        };
        match result {
            Ok(response) => ok(response),
            Err(sw) => sw.to_be_bytes().to_vec(),
        }
    }

    fn write_slot(&mut self, index: usize, data: &[u8]) -> std::result::Result<(), u16> {
        assert_eq!(data.len(), 58, "configuration plus access code expected");
        let (config, supplied_code) = data.split_at(52);
        let current_code = self.slots[index]
            .as_ref()
            .map(|slot| slot.acc_code)
            .unwrap_or([0; 6]);
        if supplied_code != current_code {
            return Err(SW_CONDITIONS_NOT_SATISFIED);
        }

        if config.iter().all(|&byte| byte == 0) {
            self.slots[index] = None;
            if self.slots.iter().all(Option::is_none) {
                // Wiping the last configuration resets the counter
                self.pgm_seq = 0;
            } else {
                self.pgm_seq += 1;
            }
            return Ok(());
        }

        assert!(crc::check(config), "configuration checksum mismatch");
        // TKTFLAG_CHAL_RESP and CFGFLAG_CHAL_HMAC mark an HMAC-SHA1 slot
        assert_ne!(config[46] & 0x40, 0);
        assert_eq!(config[47] & 0x22, 0x22);
        // The 20-byte secret spans the key field and the first four uid
        // bytes
        let mut key = [0u8; 20];
        key[..16].copy_from_slice(&config[22..38]);
        key[16..].copy_from_slice(&config[16..20]);
        let mut acc_code = [0u8; 6];
        acc_code.copy_from_slice(&config[38..44]);
        self.slots[index] = Some(SlotState { key, acc_code });
        self.pgm_seq += 1;
        Ok(())
    }

    fn challenge(&mut self, index: usize, data: &[u8]) -> std::result::Result<Vec<u8>, u16> {
        let slot = self.slots[index]
            .as_ref()
            .ok_or(SW_CONDITIONS_NOT_SATISFIED)?;
        assert_eq!(data.len(), 64, "challenges arrive padded to 64 bytes");
        // Trailing bytes equal to the final byte are padding
        let pad = data[63];
        let mut length = data.len();
        while length > 0 && data[length - 1] == pad {
            length -= 1;
        }
        Ok(software_hmac(&slot.key, &data[..length]))
    }
}

struct VirtualConnection {
    state: Rc<RefCell<VirtualKey>>,
}

impl SmartCardConnection for VirtualConnection {
    fn transport(&self) -> Transport {
        Transport::Usb
    }

    fn supports_extended_length(&self) -> bool {
        false
    }

    fn send_and_receive(&mut self, apdu: &[u8]) -> Result<Vec<u8>> {
        Ok(self.state.borrow_mut().apdu(apdu))
    }
}

fn ok(mut response: Vec<u8>) -> Vec<u8> {
    response.extend_from_slice(&[0x90, 0x00]);
    response
}

fn software_hmac(key: &[u8], message: &[u8]) -> Vec<u8> {
    let mut mac = Hmac::<Sha1>::new_from_slice(key).unwrap();
    mac.update(message);
    mac.finalize().into_bytes().to_vec()
}

fn session(state: &Rc<RefCell<VirtualKey>>) -> YubiOtpSession<CcidBackend<VirtualConnection>> {
    let connection = VirtualConnection {
        state: Rc::clone(state),
    };
    YubiOtpSession::from_smart_card(connection).unwrap()
}

#[test]
fn programmed_slot_answers_hmac_challenges() {
    let state = Rc::new(RefCell::new(VirtualKey::new()));
    let mut session = session(&state);
    assert_eq!(session.version(), Version::new(5, 4, 3));
    assert!(!session.config_state().slot_is_configured(Slot::One).unwrap());

    let secret = b"0123456789abcdefghij";
    session
        .put_configuration(
            Slot::One,
            &HmacSha1SlotConfiguration::new(secret).unwrap(),
            None,
            None,
        )
        .unwrap();
    assert!(session.config_state().slot_is_configured(Slot::One).unwrap());
    assert!(!session.config_state().slot_is_configured(Slot::Two).unwrap());

    let response = session
        .calculate_hmac_sha1(Slot::One, b"login challenge", None)
        .unwrap();
    assert_eq!(response.to_vec(), software_hmac(secret, b"login challenge"));

    // A challenge ending in zero switches the padding byte
    let response = session
        .calculate_hmac_sha1(Slot::One, &[0x01, 0x02, 0x00], None)
        .unwrap();
    assert_eq!(response.to_vec(), software_hmac(secret, &[0x01, 0x02, 0x00]));
}

#[test]
fn short_secrets_are_zero_padded() {
    let state = Rc::new(RefCell::new(VirtualKey::new()));
    let mut session = session(&state);
    session
        .put_configuration(
            Slot::Two,
            &HmacSha1SlotConfiguration::new(b"abc").unwrap(),
            None,
            None,
        )
        .unwrap();

    // HMAC zero pads short keys to the block size, so the padded slot key
    // and the original secret produce the same MAC
    let response = session
        .calculate_hmac_sha1(Slot::Two, b"sample #2", None)
        .unwrap();
    assert_eq!(response.to_vec(), software_hmac(b"abc", b"sample #2"));
}

#[test]
fn swapping_moves_the_key_to_the_other_slot() {
    let state = Rc::new(RefCell::new(VirtualKey::new()));
    let mut session = session(&state);
    let secret = b"swap me around, kid!";
    session
        .put_configuration(
            Slot::Two,
            &HmacSha1SlotConfiguration::new(secret).unwrap(),
            None,
            None,
        )
        .unwrap();

    session.swap_slots().unwrap();
    assert!(session.config_state().slot_is_configured(Slot::One).unwrap());
    assert!(!session.config_state().slot_is_configured(Slot::Two).unwrap());

    let response = session
        .calculate_hmac_sha1(Slot::One, b"after the swap", None)
        .unwrap();
    assert_eq!(response.to_vec(), software_hmac(secret, b"after the swap"));

    let error = session
        .calculate_hmac_sha1(Slot::Two, b"after the swap", None)
        .unwrap_err();
    assert!(matches!(
        error,
        Error::Apdu {
            sw: SW_CONDITIONS_NOT_SATISFIED
        }
    ));
}

#[test]
fn access_code_guards_reprogramming() {
    let state = Rc::new(RefCell::new(VirtualKey::new()));
    let mut session = session(&state);
    session
        .put_configuration(
            Slot::One,
            &HmacSha1SlotConfiguration::new(b"guarded slot secret!").unwrap(),
            Some(&ACCESS_CODE),
            None,
        )
        .unwrap();

    // Deleting without the access code is rejected and leaves the slot
    // untouched
    let error = session.delete_slot(Slot::One, None).unwrap_err();
    assert!(matches!(
        error,
        Error::Apdu {
            sw: SW_CONDITIONS_NOT_SATISFIED
        }
    ));
    assert!(session.config_state().slot_is_configured(Slot::One).unwrap());

    session.delete_slot(Slot::One, Some(&ACCESS_CODE)).unwrap();
    assert!(!session.config_state().slot_is_configured(Slot::One).unwrap());
    assert_eq!(state.borrow().pgm_seq, 0);
}

#[test]
fn serial_number_reads_back() {
    let state = Rc::new(RefCell::new(VirtualKey::new()));
    let mut session = session(&state);
    assert_eq!(session.read_serial_number().unwrap(), SERIAL_NUMBER);
}
