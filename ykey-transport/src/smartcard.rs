//! ISO 7816-4 smartcard protocol driver
//!
//! Wraps a [`SmartCardConnection`] and takes care of APDU encoding, command
//! chaining for oversized payloads, `GET RESPONSE` looping and the firmware
//! 4.2.x touch workaround. Sessions hand in [`Apdu`]s and get back complete
//! response payloads; every non-success status word becomes
//! [`Error::Apdu`].

use std::time::{Duration, Instant};

use tracing::debug;

use ykey_core::apdu::{sw, Apdu};
use ykey_core::error::{Error, Result};
use ykey_core::version::Version;

use crate::connection::{SmartCardConnection, Transport};

const INS_SELECT: u8 = 0xA4;
const P1_SELECT: u8 = 0x04;
const P2_SELECT: u8 = 0x00;
const INS_SEND_REMAINING: u8 = 0xC0;

const SHORT_APDU_MAX_CHUNK: usize = 0xFF;
const EXTENDED_APDU_MAX_DATA: usize = 0xFFFF;

// Firmware 4.2.0-4.2.6 over USB drops the next command after a long
// response while the touch timer is armed
const TOUCH_WORKAROUND_WINDOW: Duration = Duration::from_millis(2000);
const LONG_RESPONSE_THRESHOLD: usize = 54;

/// A raw card response split into payload and status word
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ApduResponse {
    raw: Vec<u8>,
}

impl ApduResponse {
    pub fn new(raw: Vec<u8>) -> Result<Self> {
        if raw.len() < 2 {
            return Err(Error::bad_response("APDU response shorter than 2 bytes"));
        }
        Ok(Self { raw })
    }

    pub fn sw(&self) -> u16 {
        u16::from_be_bytes([self.raw[self.raw.len() - 2], self.raw[self.raw.len() - 1]])
    }

    pub fn data(&self) -> &[u8] {
        &self.raw[..self.raw.len() - 2]
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum ApduFormat {
    Short,
    Extended,
}

/// Protocol driver for one open smartcard channel
#[derive(Debug)]
pub struct SmartCardProtocol<C: SmartCardConnection> {
    connection: C,
    apdu_format: ApduFormat,
    touch_workaround: bool,
    last_long_response: Option<Instant>,
}

impl<C: SmartCardConnection> SmartCardProtocol<C> {
    pub fn new(connection: C) -> Self {
        Self {
            connection,
            apdu_format: ApduFormat::Short,
            touch_workaround: false,
            last_long_response: None,
        }
    }

    pub fn transport(&self) -> Transport {
        self.connection.transport()
    }

    /// Enable firmware-specific behavior once the version is known
    ///
    /// Switches to extended APDUs when both the connection and the firmware
    /// allow it, and arms the 4.2.0-4.2.6 USB touch workaround.
    pub fn configure(&mut self, version: Version) {
        if self.connection.transport() == Transport::Usb
            && version.is_at_least(4, 2, 0)
            && version.is_less_than(4, 2, 7)
        {
            self.touch_workaround = true;
        }
        if self.connection.supports_extended_length() && version.is_at_least(4, 0, 0) {
            self.apdu_format = ApduFormat::Extended;
        }
    }

    /// Select an application by AID
    pub fn select(&mut self, aid: &[u8]) -> Result<Vec<u8>> {
        match self.send_and_receive(&Apdu::new(0, INS_SELECT, P1_SELECT, P2_SELECT, aid)) {
            Ok(response) => Ok(response),
            // NEO-era firmware answers 0x6D00 for missing applets
            Err(Error::Apdu { sw: status })
                if status == sw::FILE_NOT_FOUND
                    || status == sw::APPLET_SELECT_FAILED
                    || status == sw::INVALID_INSTRUCTION =>
            {
                Err(Error::ApplicationNotAvailable)
            }
            Err(e) => Err(e),
        }
    }

    /// Send a command, transparently chaining and collecting the full
    /// response
    pub fn send_and_receive(&mut self, apdu: &Apdu) -> Result<Vec<u8>> {
        if self.touch_workaround {
            if let Some(at) = self.last_long_response.take() {
                if at.elapsed() < TOUCH_WORKAROUND_WINDOW {
                    debug!("sending dummy command to prod the touch-wait firmware");
                    // Any status word is fine here
                    self.connection
                        .send_and_receive(&encode_short(0, 0, 0, 0, &[], 0))?;
                }
            }
        }

        let mut response = self.transceive(apdu)?;

        // Wrong Le: the card tells us the length to ask for
        if response.sw() >> 8 == sw::SW1_WRONG_LENGTH_LE as u16 {
            let le = match response.sw() & 0xFF {
                0 => 256,
                value => value as u32,
            };
            debug!(le, "resending with corrected response length");
            response = self.transceive(&apdu.clone().with_le(le))?;
        }

        let mut payload = Vec::new();
        let get_response = encode_short(0, INS_SEND_REMAINING, 0, 0, &[], 0);
        while response.sw() >> 8 == sw::SW1_HAS_MORE_DATA as u16 {
            payload.extend_from_slice(response.data());
            response = ApduResponse::new(self.connection.send_and_receive(&get_response)?)?;
        }
        if response.sw() != sw::OK {
            return Err(Error::Apdu { sw: response.sw() });
        }
        payload.extend_from_slice(response.data());

        self.last_long_response = if self.touch_workaround && payload.len() > LONG_RESPONSE_THRESHOLD
        {
            Some(Instant::now())
        } else {
            None
        };
        Ok(payload)
    }

    fn transceive(&mut self, apdu: &Apdu) -> Result<ApduResponse> {
        match self.apdu_format {
            ApduFormat::Short => {
                let data = apdu.data();
                let mut offset = 0;
                while data.len() - offset > SHORT_APDU_MAX_CHUNK {
                    let chunk = &data[offset..offset + SHORT_APDU_MAX_CHUNK];
                    let encoded = encode_short(
                        apdu.cla() | 0x10,
                        apdu.ins(),
                        apdu.p1(),
                        apdu.p2(),
                        chunk,
                        0,
                    );
                    let response = ApduResponse::new(self.connection.send_and_receive(&encoded)?)?;
                    if response.sw() != sw::OK {
                        return Err(Error::Apdu {
                            sw: response.sw(),
                        });
                    }
                    offset += SHORT_APDU_MAX_CHUNK;
                }
                let encoded = encode_short(
                    apdu.cla(),
                    apdu.ins(),
                    apdu.p1(),
                    apdu.p2(),
                    &data[offset..],
                    apdu.le(),
                );
                ApduResponse::new(self.connection.send_and_receive(&encoded)?)
            }
            ApduFormat::Extended => {
                let encoded = encode_extended(apdu)?;
                ApduResponse::new(self.connection.send_and_receive(&encoded)?)
            }
        }
    }
}

fn encode_short(cla: u8, ins: u8, p1: u8, p2: u8, data: &[u8], le: u32) -> Vec<u8> {
    let mut out = Vec::with_capacity(4 + 1 + data.len() + 1);
    out.push(cla);
    out.push(ins);
    out.push(p1);
    out.push(p2);
    if !data.is_empty() {
        out.push(data.len() as u8);
        out.extend_from_slice(data);
    }
    if le > 0 {
        // 256 encodes as 0x00
        out.push(le as u8);
    }
    out
}

fn encode_extended(apdu: &Apdu) -> Result<Vec<u8>> {
    let data = apdu.data();
    if data.len() > EXTENDED_APDU_MAX_DATA {
        return Err(Error::NotSupported(
            "command payload exceeds extended APDU limit".into(),
        ));
    }
    let mut out = Vec::with_capacity(4 + 3 + data.len() + 2);
    out.push(apdu.cla());
    out.push(apdu.ins());
    out.push(apdu.p1());
    out.push(apdu.p2());
    if !data.is_empty() {
        out.push(0x00);
        out.extend_from_slice(&(data.len() as u16).to_be_bytes());
        out.extend_from_slice(data);
        if apdu.le() > 0 {
            // 65536 encodes as 0x0000
            out.extend_from_slice(&(apdu.le() as u16).to_be_bytes());
        }
    } else if apdu.le() > 0 {
        out.push(0x00);
        out.extend_from_slice(&(apdu.le() as u16).to_be_bytes());
    }
    Ok(out)
}
