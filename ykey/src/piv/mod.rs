//! Personal Identity Verification (PIV): smart-card key slots for signing,
//! decryption and key agreement, per NIST SP 800-73-4 with Yubico
//! extensions for attestation, metadata and key management.
//!
//! ## Example
//!
//! ```no_run
//! # use ykey::piv::{KeyType, PivSession, SignatureAlgorithm, Slot};
//! # fn run(connection: impl ykey_transport::SmartCardConnection) -> ykey_core::Result<()> {
//! let mut session = PivSession::new(connection)?;
//! session.verify_pin(b"123456")?;
//! let signature = session
//!     .signer(Slot::Authentication, KeyType::EccP256)
//!     .sign(SignatureAlgorithm::EcdsaSha256, b"message")?;
//! # Ok(())
//! # }
//! ```
//!
//! Reference: <https://developers.yubico.com/PIV/>

mod key;
mod signer;

pub use key::{object_id, KeyType, PinPolicy, Slot, TouchPolicy};
pub use signer::{PivSigner, SignatureAlgorithm};

use std::collections::BTreeMap;
use std::io::{Read, Write};

use flate2::read::GzDecoder;
use flate2::write::GzEncoder;
use flate2::Compression;
use rand::Rng;
use tracing::debug;
use zeroize::Zeroizing;

use ykey_core::apdu::{sw, Apdu};
use ykey_core::error::{Error, Result};
use ykey_core::keys::{EllipticCurveValues, PrivateKeyValues, PublicKeyValues};
use ykey_core::tlv::{self, Tlv};
use ykey_core::version::Version;
use ykey_crypto::{MgmKey, MgmKeyAlgorithm};
use ykey_transport::connection::SmartCardConnection;
use ykey_transport::SmartCardProtocol;

use key::{mgm_key_type_from_value, mgm_key_type_value};

/// PIV application AID
pub const AID: [u8; 5] = [0xA0, 0x00, 0x00, 0x03, 0x08];

/// Maximum length of a PIN or PUK in bytes
pub const PIN_LEN: usize = 8;
/// Length of a biometric temporary PIN
pub const TEMPORARY_PIN_LEN: usize = 16;

const INS_VERIFY: u8 = 0x20;
const INS_CHANGE_REFERENCE: u8 = 0x24;
const INS_RESET_RETRY: u8 = 0x2C;
const INS_GENERATE_ASYMMETRIC: u8 = 0x47;
const INS_AUTHENTICATE: u8 = 0x87;
const INS_GET_DATA: u8 = 0xCB;
const INS_PUT_DATA: u8 = 0xDB;
const INS_MOVE_KEY: u8 = 0xF6;
const INS_GET_METADATA: u8 = 0xF7;
const INS_GET_SERIAL: u8 = 0xF8;
const INS_ATTEST: u8 = 0xF9;
const INS_SET_PIN_RETRIES: u8 = 0xFA;
const INS_RESET: u8 = 0xFB;
const INS_GET_VERSION: u8 = 0xFD;
const INS_IMPORT_KEY: u8 = 0xFE;
const INS_SET_MGMKEY: u8 = 0xFF;

const P2_PIN: u8 = 0x80;
const P2_PUK: u8 = 0x81;
const P2_SLOT_CARD_MANAGEMENT: u8 = 0x9B;
const P2_SLOT_OCC_AUTH: u8 = 0x96;

const TAG_DYN_AUTH: u16 = 0x7C;
const TAG_AUTH_WITNESS: u16 = 0x80;
const TAG_AUTH_CHALLENGE: u16 = 0x81;
const TAG_AUTH_RESPONSE: u16 = 0x82;
const TAG_AUTH_EXPONENTIATION: u16 = 0x85;

const TAG_GEN_ALGORITHM: u16 = 0x80;
const TAG_GEN_TEMPLATE: u16 = 0xAC;
const TAG_PIN_POLICY: u16 = 0xAA;
const TAG_TOUCH_POLICY: u16 = 0xAB;

const TAG_OBJ_ID: u16 = 0x5C;
const TAG_OBJ_DATA: u16 = 0x53;
const TAG_CERTIFICATE: u16 = 0x70;
const TAG_CERT_INFO: u16 = 0x71;
const TAG_LRC: u16 = 0xFE;

const TAG_PUBLIC_KEY: u16 = 0x7F49;
const TAG_RSA_MODULUS: u16 = 0x81;
const TAG_RSA_EXPONENT: u16 = 0x82;
const TAG_EC_POINT: u16 = 0x86;

const TAG_METADATA_ALGORITHM: u16 = 0x01;
const TAG_METADATA_POLICY: u16 = 0x02;
const TAG_METADATA_ORIGIN: u16 = 0x03;
const TAG_METADATA_PUBLIC_KEY: u16 = 0x04;
const TAG_METADATA_IS_DEFAULT: u16 = 0x05;
const TAG_METADATA_RETRIES: u16 = 0x06;
const TAG_METADATA_BIO_CONFIGURED: u16 = 0x07;
const TAG_METADATA_TEMPORARY_PIN: u16 = 0x08;

const INDEX_PIN_POLICY: usize = 0;
const INDEX_TOUCH_POLICY: usize = 1;
const INDEX_RETRIES_TOTAL: usize = 0;
const INDEX_RETRIES_REMAINING: usize = 1;

const ORIGIN_GENERATED: u8 = 1;

const TAG_VERIFY_TEMPORARY_PIN: u16 = 0x01;
const TAG_GET_TEMPORARY_PIN: u16 = 0x02;
const TAG_VERIFY_UV: u16 = 0x03;

/// Status of the PIN or PUK, from GET METADATA
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PinMetadata {
    /// True if the factory default value has not been changed
    pub is_default: bool,
    pub total_attempts: u8,
    pub attempts_remaining: u8,
}

/// Status of the management key, from GET METADATA
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ManagementKeyMetadata {
    pub key_type: MgmKeyAlgorithm,
    /// True if the factory default key has not been changed
    pub is_default: bool,
    pub touch_policy: TouchPolicy,
}

/// Contents of a private key slot, from GET METADATA
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SlotMetadata {
    pub key_type: KeyType,
    pub pin_policy: PinPolicy,
    pub touch_policy: TouchPolicy,
    /// True if the key was generated on the device rather than imported
    pub generated: bool,
    pub public_key: PublicKeyValues,
}

/// Status of the fingerprint sensor, from GET METADATA on the OCC slot
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BioMetadata {
    /// True if fingerprints are enrolled
    pub is_configured: bool,
    pub attempts_remaining: u8,
    /// True if a temporary PIN has been generated
    pub has_temporary_pin: bool,
}

/// A session with the PIV application over a smart card connection
pub struct PivSession<C: SmartCardConnection> {
    protocol: SmartCardProtocol<C>,
    version: Version,
    management_key_type: MgmKeyAlgorithm,
    current_pin_attempts: u8,
    max_pin_attempts: u8,
}

impl<C: SmartCardConnection> PivSession<C> {
    /// Select the PIV application and read the firmware version
    pub fn new(connection: C) -> Result<Self> {
        let mut protocol = SmartCardProtocol::new(connection);
        protocol.select(&AID)?;
        let response =
            protocol.send_and_receive(&Apdu::new(0, INS_GET_VERSION, 0, 0, Vec::new()))?;
        let version = Version::from_bytes(&response)?;
        protocol.configure(version);
        let mut session = PivSession {
            protocol,
            version,
            management_key_type: MgmKeyAlgorithm::ThreeDes,
            current_pin_attempts: 3,
            max_pin_attempts: 3,
        };
        session.management_key_type = session.detect_management_key_type()?;
        debug!(%version, "PIV session established");
        Ok(session)
    }

    pub fn version(&self) -> Version {
        self.version
    }

    /// The algorithm of the currently set management key
    pub fn management_key_type(&self) -> MgmKeyAlgorithm {
        self.management_key_type
    }

    fn detect_management_key_type(&mut self) -> Result<MgmKeyAlgorithm> {
        match self.management_key_metadata() {
            Ok(metadata) => Ok(metadata.key_type),
            // Firmware without metadata always uses 3DES
            Err(Error::NotSupported(_)) => Ok(MgmKeyAlgorithm::ThreeDes),
            Err(err) => Err(err),
        }
    }

    /// Read the device serial number
    pub fn read_serial_number(&mut self) -> Result<u32> {
        self.version.require("Serial number", (5, 0, 0))?;
        let response = self
            .protocol
            .send_and_receive(&Apdu::new(0, INS_GET_SERIAL, 0, 0, Vec::new()))?;
        let serial: [u8; 4] = response
            .as_slice()
            .try_into()
            .map_err(|_| Error::bad_response("serial number must be 4 bytes"))?;
        Ok(u32::from_be_bytes(serial))
    }

    /// Wipe all PIV data and return the application to factory state
    ///
    /// Blocks the PIN and PUK first, as the device requires both to be
    /// blocked before it accepts the reset instruction.
    pub fn reset(&mut self) -> Result<()> {
        match self.bio_metadata() {
            Ok(bio) if bio.is_configured => {
                return Err(Error::NotSupported(
                    "reset is blocked while fingerprints are enrolled".into(),
                ))
            }
            Ok(_) | Err(Error::NotSupported(_)) => {}
            Err(err) => return Err(err),
        }
        debug!("resetting PIV application");
        self.block_pin()?;
        self.block_puk()?;
        self.protocol
            .send_and_receive(&Apdu::new(0, INS_RESET, 0, 0, Vec::new()))?;
        self.current_pin_attempts = 3;
        self.max_pin_attempts = 3;
        self.management_key_type = self.detect_management_key_type()?;
        Ok(())
    }

    fn block_pin(&mut self) -> Result<()> {
        debug!("blocking PIN");
        let mut counter = self.get_pin_attempts()?;
        while counter > 0 {
            match self.verify_pin(b"") {
                Ok(()) => return Err(Error::bad_response("empty PIN was accepted")),
                Err(Error::InvalidPin { attempts_remaining }) => counter = attempts_remaining,
                Err(err) => return Err(err),
            }
        }
        Ok(())
    }

    fn block_puk(&mut self) -> Result<()> {
        debug!("blocking PUK");
        let mut counter = 1;
        while counter > 0 {
            match self.change_reference(INS_RESET_RETRY, P2_PIN, b"", b"") {
                Ok(()) => return Err(Error::bad_response("empty PUK was accepted")),
                Err(Error::InvalidPin { attempts_remaining }) => counter = attempts_remaining,
                Err(err) => return Err(err),
            }
        }
        Ok(())
    }

    /// Authenticate to the device with the management key
    ///
    /// Uses mutual challenge-response: the device proves possession via a
    /// witness, the host via a challenge. Required before key management
    /// operations such as generating or importing keys.
    pub fn authenticate(&mut self, key: &MgmKey) -> Result<()> {
        let mut challenge = vec![0u8; key.algorithm().challenge_len()];
        rand::thread_rng().fill(challenge.as_mut_slice());
        self.authenticate_with_challenge(key, &challenge)
    }

    fn authenticate_with_challenge(&mut self, key: &MgmKey, challenge: &[u8]) -> Result<()> {
        if key.algorithm() != self.management_key_type {
            return Err(Error::NotSupported(format!(
                "device expects a {:?} management key, not {:?}",
                self.management_key_type,
                key.algorithm()
            )));
        }
        debug!(algorithm = ?key.algorithm(), "authenticating management key");

        let request = Tlv::new(
            TAG_DYN_AUTH,
            Tlv::new(TAG_AUTH_WITNESS, Vec::new()).to_bytes(),
        );
        let response = self.protocol.send_and_receive(&Apdu::new(
            0,
            INS_AUTHENTICATE,
            mgm_key_type_value(key.algorithm()),
            P2_SLOT_CARD_MANAGEMENT,
            request.to_bytes(),
        ))?;
        let witness = tlv::unpack_value(
            TAG_AUTH_WITNESS,
            &tlv::unpack_value(TAG_DYN_AUTH, &response)?,
        )?;
        let decrypted = key
            .decrypt_block(&witness)
            .map_err(|_| Error::bad_response("witness has the wrong length for the key type"))?;

        let request = Tlv::new(
            TAG_DYN_AUTH,
            tlv::pack_map(&[
                (TAG_AUTH_WITNESS, decrypted),
                (TAG_AUTH_CHALLENGE, challenge.to_vec()),
            ]),
        );
        let response = self.protocol.send_and_receive(&Apdu::new(
            0,
            INS_AUTHENTICATE,
            mgm_key_type_value(key.algorithm()),
            P2_SLOT_CARD_MANAGEMENT,
            request.to_bytes(),
        ))?;
        let device_response = tlv::unpack_value(
            TAG_AUTH_RESPONSE,
            &tlv::unpack_value(TAG_DYN_AUTH, &response)?,
        )?;
        let verified = key
            .verify_challenge(challenge, &device_response)
            .map_err(|_| Error::bad_response("challenge has the wrong length for the key type"))?;
        if !verified {
            return Err(Error::bad_response(
                "calculated response for challenge is incorrect",
            ));
        }
        Ok(())
    }

    /// Replace the management key
    ///
    /// Requires a prior [`authenticate`](Self::authenticate). With
    /// `require_touch` the device demands a touch on every subsequent
    /// management key authentication.
    pub fn set_management_key(
        &mut self,
        key_type: MgmKeyAlgorithm,
        management_key: &[u8],
        require_touch: bool,
    ) -> Result<()> {
        if key_type != MgmKeyAlgorithm::ThreeDes {
            self.version.require("AES management keys", (5, 4, 0))?;
        }
        if require_touch {
            self.version.require("PIN and touch policies", (4, 0, 0))?;
        }
        if management_key.len() != key_type.key_len() {
            return Err(Error::NotSupported(format!(
                "a {:?} management key must be {} bytes",
                key_type,
                key_type.key_len()
            )));
        }
        debug!(?key_type, require_touch, "setting management key");

        let mut data = Zeroizing::new(Vec::with_capacity(3 + management_key.len()));
        data.push(mgm_key_type_value(key_type));
        data.push(P2_SLOT_CARD_MANAGEMENT);
        data.push(management_key.len() as u8);
        data.extend_from_slice(management_key);
        self.protocol.send_and_receive(&Apdu::new(
            0,
            INS_SET_MGMKEY,
            0xFF,
            if require_touch { 0xFE } else { 0xFF },
            data.as_slice(),
        ))?;
        self.management_key_type = key_type;
        Ok(())
    }

    /// Verify the PIN for the rest of the session
    ///
    /// How long a verification stays valid depends on the PIN policy of the
    /// keys being used.
    pub fn verify_pin(&mut self, pin: &[u8]) -> Result<()> {
        let data = pin_bytes(pin)?;
        let result =
            self.protocol
                .send_and_receive(&Apdu::new(0, INS_VERIFY, 0, P2_PIN, data.as_slice()));
        match result {
            Ok(_) => {
                self.current_pin_attempts = self.max_pin_attempts;
                Ok(())
            }
            Err(Error::Apdu { sw }) => match retries_from_sw(self.version, sw) {
                Some(attempts_remaining) => {
                    self.current_pin_attempts = attempts_remaining;
                    Err(Error::InvalidPin { attempts_remaining })
                }
                None => Err(Error::Apdu { sw }),
            },
            Err(err) => Err(err),
        }
    }

    /// The number of PIN attempts left before the PIN is blocked
    pub fn get_pin_attempts(&mut self) -> Result<u8> {
        if self.version.supports((5, 3, 0)) {
            return Ok(self.pin_metadata()?.attempts_remaining);
        }
        debug!("probing PIN attempts with an empty VERIFY");
        let probe = self
            .protocol
            .send_and_receive(&Apdu::new(0, INS_VERIFY, 0, P2_PIN, Vec::new()));
        match probe {
            // Accepted: PIN already verified, the true count is not readable
            Ok(_) => Ok(self.current_pin_attempts),
            Err(Error::Apdu { sw }) => match retries_from_sw(self.version, sw) {
                Some(attempts) => {
                    self.current_pin_attempts = attempts;
                    Ok(attempts)
                }
                None => Err(Error::Apdu { sw }),
            },
            Err(err) => Err(err),
        }
    }

    pub fn change_pin(&mut self, current_pin: &[u8], new_pin: &[u8]) -> Result<()> {
        debug!("changing PIN");
        self.change_reference(INS_CHANGE_REFERENCE, P2_PIN, current_pin, new_pin)
    }

    pub fn change_puk(&mut self, current_puk: &[u8], new_puk: &[u8]) -> Result<()> {
        debug!("changing PUK");
        self.change_reference(INS_CHANGE_REFERENCE, P2_PUK, current_puk, new_puk)
    }

    /// Set a new PIN using the PUK, consuming a PUK attempt on failure
    pub fn unblock_pin(&mut self, puk: &[u8], new_pin: &[u8]) -> Result<()> {
        debug!("unblocking PIN");
        self.change_reference(INS_RESET_RETRY, P2_PIN, puk, new_pin)
    }

    fn change_reference(
        &mut self,
        ins: u8,
        p2: u8,
        current_value: &[u8],
        new_value: &[u8],
    ) -> Result<()> {
        let mut data = Zeroizing::new(Vec::with_capacity(2 * PIN_LEN));
        data.extend_from_slice(&pin_bytes(current_value)?);
        data.extend_from_slice(&pin_bytes(new_value)?);
        let result = self
            .protocol
            .send_and_receive(&Apdu::new(0, ins, 0, p2, data.as_slice()));
        match result {
            Ok(_) => Ok(()),
            Err(Error::Apdu { sw }) => match retries_from_sw(self.version, sw) {
                Some(attempts_remaining) => {
                    if p2 == P2_PIN {
                        self.current_pin_attempts = attempts_remaining;
                    }
                    Err(Error::InvalidPin { attempts_remaining })
                }
                None => Err(Error::Apdu { sw }),
            },
            Err(err) => Err(err),
        }
    }

    /// Set how many attempts the PIN and PUK allow before blocking
    ///
    /// Requires management key authentication and PIN verification. Also
    /// resets both counters to their new maximum.
    pub fn set_pin_attempts(&mut self, pin_attempts: u8, puk_attempts: u8) -> Result<()> {
        debug!(pin_attempts, puk_attempts, "setting PIN retry counts");
        self.protocol.send_and_receive(&Apdu::new(
            0,
            INS_SET_PIN_RETRIES,
            pin_attempts,
            puk_attempts,
            Vec::new(),
        ))?;
        self.max_pin_attempts = pin_attempts;
        self.current_pin_attempts = pin_attempts;
        Ok(())
    }

    pub fn pin_metadata(&mut self) -> Result<PinMetadata> {
        self.read_pin_metadata(P2_PIN)
    }

    pub fn puk_metadata(&mut self) -> Result<PinMetadata> {
        self.read_pin_metadata(P2_PUK)
    }

    fn read_pin_metadata(&mut self, p2: u8) -> Result<PinMetadata> {
        self.version.require("Key metadata", (5, 3, 0))?;
        let response = self
            .protocol
            .send_and_receive(&Apdu::new(0, INS_GET_METADATA, 0, p2, Vec::new()))?;
        let data = tlv::parse_map(&response)?;
        Ok(PinMetadata {
            is_default: metadata_byte(&data, TAG_METADATA_IS_DEFAULT, 0)? != 0,
            total_attempts: metadata_byte(&data, TAG_METADATA_RETRIES, INDEX_RETRIES_TOTAL)?,
            attempts_remaining: metadata_byte(
                &data,
                TAG_METADATA_RETRIES,
                INDEX_RETRIES_REMAINING,
            )?,
        })
    }

    pub fn management_key_metadata(&mut self) -> Result<ManagementKeyMetadata> {
        self.version.require("Key metadata", (5, 3, 0))?;
        let response = self.protocol.send_and_receive(&Apdu::new(
            0,
            INS_GET_METADATA,
            0,
            P2_SLOT_CARD_MANAGEMENT,
            Vec::new(),
        ))?;
        let data = tlv::parse_map(&response)?;
        // Firmware 5.3 predates AES keys and omits the algorithm field
        let key_type = match data.get(&TAG_METADATA_ALGORITHM) {
            Some(value) => mgm_key_type_from_value(
                *value
                    .first()
                    .ok_or_else(|| Error::bad_response("empty management key algorithm"))?,
            )?,
            None => MgmKeyAlgorithm::ThreeDes,
        };
        Ok(ManagementKeyMetadata {
            key_type,
            is_default: metadata_byte(&data, TAG_METADATA_IS_DEFAULT, 0)? != 0,
            touch_policy: TouchPolicy::from_value(metadata_byte(
                &data,
                TAG_METADATA_POLICY,
                INDEX_TOUCH_POLICY,
            )?)?,
        })
    }

    /// Read algorithm, policies, origin and public key of a slot
    pub fn slot_metadata(&mut self, slot: Slot) -> Result<SlotMetadata> {
        self.version.require("Key metadata", (5, 3, 0))?;
        debug!(?slot, "reading slot metadata");
        let response = self.protocol.send_and_receive(&Apdu::new(
            0,
            INS_GET_METADATA,
            0,
            slot.value(),
            Vec::new(),
        ))?;
        let data = tlv::parse_map(&response)?;
        let key_type = KeyType::from_value(metadata_byte(&data, TAG_METADATA_ALGORITHM, 0)?)?;
        let encoded = data
            .get(&TAG_METADATA_PUBLIC_KEY)
            .ok_or_else(|| Error::bad_response("slot metadata has no public key"))?;
        Ok(SlotMetadata {
            key_type,
            pin_policy: PinPolicy::from_value(metadata_byte(
                &data,
                TAG_METADATA_POLICY,
                INDEX_PIN_POLICY,
            )?)?,
            touch_policy: TouchPolicy::from_value(metadata_byte(
                &data,
                TAG_METADATA_POLICY,
                INDEX_TOUCH_POLICY,
            )?)?,
            generated: metadata_byte(&data, TAG_METADATA_ORIGIN, 0)? == ORIGIN_GENERATED,
            public_key: parse_public_key(key_type, encoded)?,
        })
    }

    /// Read fingerprint sensor state on bio multi-protocol devices
    pub fn bio_metadata(&mut self) -> Result<BioMetadata> {
        let result = self.protocol.send_and_receive(&Apdu::new(
            0,
            INS_GET_METADATA,
            0,
            P2_SLOT_OCC_AUTH,
            Vec::new(),
        ));
        let response = match result {
            Ok(response) => response,
            Err(Error::Apdu {
                sw: sw::REFERENCE_DATA_NOT_FOUND,
            }) => {
                return Err(Error::NotSupported(
                    "biometric verification is not supported by this device".into(),
                ))
            }
            Err(err) => return Err(err),
        };
        let data = tlv::parse_map(&response)?;
        Ok(BioMetadata {
            is_configured: metadata_byte(&data, TAG_METADATA_BIO_CONFIGURED, 0)? == 1,
            attempts_remaining: metadata_byte(&data, TAG_METADATA_RETRIES, 0)?,
            has_temporary_pin: metadata_byte(&data, TAG_METADATA_TEMPORARY_PIN, 0)? == 1,
        })
    }

    /// Authenticate with a fingerprint match
    ///
    /// With `request_temporary_pin` a successful match returns a temporary
    /// PIN for later use with [`verify_temporary_pin`](Self::verify_temporary_pin).
    /// With `check_only` the match state is probed without consuming an
    /// attempt. A failed match reports the remaining attempts as
    /// [`Error::InvalidPin`].
    pub fn verify_uv(
        &mut self,
        request_temporary_pin: bool,
        check_only: bool,
    ) -> Result<Option<Zeroizing<Vec<u8>>>> {
        if request_temporary_pin && check_only {
            return Err(Error::NotSupported(
                "cannot request a temporary PIN from a check-only verification".into(),
            ));
        }
        let data = if check_only {
            Vec::new()
        } else if request_temporary_pin {
            Tlv::new(TAG_GET_TEMPORARY_PIN, Vec::new()).to_bytes()
        } else {
            Tlv::new(TAG_VERIFY_UV, Vec::new()).to_bytes()
        };
        debug!(request_temporary_pin, check_only, "verifying fingerprint");
        let result = self
            .protocol
            .send_and_receive(&Apdu::new(0, INS_VERIFY, 0, P2_SLOT_OCC_AUTH, data));
        match result {
            Ok(response) => Ok(request_temporary_pin.then(|| Zeroizing::new(response))),
            Err(Error::Apdu {
                sw: sw::REFERENCE_DATA_NOT_FOUND,
            }) => Err(Error::NotSupported(
                "biometric verification is not supported by this device".into(),
            )),
            Err(Error::Apdu { sw }) => match retries_from_sw(self.version, sw) {
                Some(attempts_remaining) => Err(Error::InvalidPin { attempts_remaining }),
                None => Err(Error::Apdu { sw }),
            },
            Err(err) => Err(err),
        }
    }

    /// Authenticate with a temporary PIN from an earlier fingerprint match
    pub fn verify_temporary_pin(&mut self, pin: &[u8]) -> Result<()> {
        if pin.len() != TEMPORARY_PIN_LEN {
            return Err(Error::NotSupported(format!(
                "temporary PIN must be exactly {} bytes",
                TEMPORARY_PIN_LEN
            )));
        }
        let mut data = Zeroizing::new(Vec::with_capacity(2 + pin.len()));
        data.push(TAG_VERIFY_TEMPORARY_PIN as u8);
        data.push(pin.len() as u8);
        data.extend_from_slice(pin);
        let result = self.protocol.send_and_receive(&Apdu::new(
            0,
            INS_VERIFY,
            0,
            P2_SLOT_OCC_AUTH,
            data.as_slice(),
        ));
        match result {
            Ok(_) => Ok(()),
            Err(Error::Apdu {
                sw: sw::REFERENCE_DATA_NOT_FOUND,
            }) => Err(Error::NotSupported(
                "biometric verification is not supported by this device".into(),
            )),
            Err(Error::Apdu { sw }) => match retries_from_sw(self.version, sw) {
                Some(attempts_remaining) => Err(Error::InvalidPin { attempts_remaining }),
                None => Err(Error::Apdu { sw }),
            },
            Err(err) => Err(err),
        }
    }

    /// Check whether a key configuration works on this device
    ///
    /// Covers firmware gates per algorithm and policy, the RSA generation
    /// ban on ROCA-affected firmware, and FIPS restrictions.
    pub fn check_key_support(
        &self,
        key_type: KeyType,
        pin_policy: PinPolicy,
        touch_policy: TouchPolicy,
        generate: bool,
    ) -> Result<()> {
        if self.version.major == 0 {
            return Ok(());
        }
        if key_type.is_curve25519() {
            self.version.require("Curve25519 keys", (5, 7, 0))?;
        }
        if key_type == KeyType::EccP384 {
            self.version.require("P-384 keys", (4, 0, 0))?;
        }
        if matches!(key_type, KeyType::Rsa3072 | KeyType::Rsa4096) {
            self.version.require("RSA-3072 and RSA-4096 keys", (5, 7, 0))?;
        }
        if pin_policy != PinPolicy::Default || touch_policy != TouchPolicy::Default {
            self.version.require("PIN and touch policies", (4, 0, 0))?;
            if touch_policy == TouchPolicy::Cached {
                self.version.require("Cached touch policy", (4, 3, 0))?;
            }
        }
        // ROCA-affected firmware range
        if generate
            && key_type.is_rsa()
            && self.version.is_at_least(4, 2, 6)
            && self.version.is_less_than(4, 3, 5)
        {
            return Err(Error::NotSupported(
                "RSA key generation is not available on firmware 4.2.6 through 4.3.4".into(),
            ));
        }
        if self.version.is_at_least(4, 4, 0) && self.version.is_less_than(4, 5, 0) {
            // FIPS devices
            if key_type == KeyType::Rsa1024 {
                return Err(Error::NotSupported(
                    "RSA-1024 keys are not supported on FIPS devices".into(),
                ));
            }
            if pin_policy == PinPolicy::Never {
                return Err(Error::NotSupported(
                    "a PIN policy of never is not supported on FIPS devices".into(),
                ));
            }
        }
        Ok(())
    }

    /// Generate an asymmetric key in a slot, returning its public half
    ///
    /// Requires management key authentication. The previous key in the
    /// slot, if any, is overwritten.
    pub fn generate_key(
        &mut self,
        slot: Slot,
        key_type: KeyType,
        pin_policy: PinPolicy,
        touch_policy: TouchPolicy,
    ) -> Result<PublicKeyValues> {
        self.check_key_support(key_type, pin_policy, touch_policy, true)?;
        let mut entries = vec![(TAG_GEN_ALGORITHM, vec![key_type.value()])];
        if pin_policy != PinPolicy::Default {
            entries.push((TAG_PIN_POLICY, vec![pin_policy.value()]));
        }
        if touch_policy != TouchPolicy::Default {
            entries.push((TAG_TOUCH_POLICY, vec![touch_policy.value()]));
        }
        debug!(?slot, ?key_type, "generating key");
        let response = self.protocol.send_and_receive(&Apdu::new(
            0,
            INS_GENERATE_ASYMMETRIC,
            0,
            slot.value(),
            Tlv::new(TAG_GEN_TEMPLATE, tlv::pack_map(&entries)).to_bytes(),
        ))?;
        parse_public_key(key_type, &tlv::unpack_value(TAG_PUBLIC_KEY, &response)?)
    }

    /// Import a private key into a slot
    ///
    /// Requires management key authentication. RSA keys must carry their
    /// CRT parameters.
    pub fn put_key(
        &mut self,
        slot: Slot,
        key: &PrivateKeyValues,
        pin_policy: PinPolicy,
        touch_policy: TouchPolicy,
    ) -> Result<KeyType> {
        let key_type = KeyType::from_private_key(key)?;
        self.check_key_support(key_type, pin_policy, touch_policy, false)?;
        let mut data = Zeroizing::new(Vec::new());
        match key {
            PrivateKeyValues::Rsa(rsa) => {
                let length = key_type.bit_length() / 8 / 2;
                let (exponent_p, exponent_q, coefficient) = match (
                    rsa.prime_exponent_p(),
                    rsa.prime_exponent_q(),
                    rsa.crt_coefficient(),
                ) {
                    (Some(dp), Some(dq), Some(qinv)) => (dp, dq, qinv),
                    _ => {
                        return Err(Error::NotSupported(
                            "RSA import requires a key with CRT parameters".into(),
                        ))
                    }
                };
                push_int_tlv(&mut data, 0x01, rsa.prime_p(), length)?;
                push_int_tlv(&mut data, 0x02, rsa.prime_q(), length)?;
                push_int_tlv(&mut data, 0x03, exponent_p, length)?;
                push_int_tlv(&mut data, 0x04, exponent_q, length)?;
                push_int_tlv(&mut data, 0x05, coefficient, length)?;
            }
            PrivateKeyValues::Ec(ec) => {
                let tag = match ec.curve() {
                    EllipticCurveValues::Ed25519 => 0x07,
                    EllipticCurveValues::X25519 => 0x08,
                    _ => 0x06,
                };
                data.push(tag);
                data.push(ec.secret().len() as u8);
                data.extend_from_slice(ec.secret());
            }
        }
        if pin_policy != PinPolicy::Default {
            data.extend_from_slice(&[TAG_PIN_POLICY as u8, 1, pin_policy.value()]);
        }
        if touch_policy != TouchPolicy::Default {
            data.extend_from_slice(&[TAG_TOUCH_POLICY as u8, 1, touch_policy.value()]);
        }
        debug!(?slot, ?key_type, "importing key");
        self.protocol.send_and_receive(&Apdu::new(
            0,
            INS_IMPORT_KEY,
            key_type.value(),
            slot.value(),
            data.as_slice(),
        ))?;
        Ok(key_type)
    }

    /// Move a key between slots, leaving the source slot empty
    pub fn move_key(&mut self, source: Slot, destination: Slot) -> Result<()> {
        self.version.require("Moving or deleting keys", (5, 7, 0))?;
        if source == Slot::Attestation {
            return Err(Error::NotSupported(
                "the attestation key cannot be moved".into(),
            ));
        }
        debug!(?source, ?destination, "moving key");
        self.protocol.send_and_receive(&Apdu::new(
            0,
            INS_MOVE_KEY,
            destination.value(),
            source.value(),
            Vec::new(),
        ))?;
        Ok(())
    }

    pub fn delete_key(&mut self, slot: Slot) -> Result<()> {
        self.version.require("Moving or deleting keys", (5, 7, 0))?;
        debug!(?slot, "deleting key");
        self.protocol
            .send_and_receive(&Apdu::new(0, INS_MOVE_KEY, 0xFF, slot.value(), Vec::new()))?;
        Ok(())
    }

    /// Perform a raw signature or RSA decryption with a slot's key
    ///
    /// The payload is adjusted to the key size: ECDSA digests are truncated
    /// or zero-padded on the left, RSA payloads must fit exactly. Curve25519
    /// payloads pass through unchanged. The caller is responsible for any
    /// message padding scheme; see [`PivSigner`] for the common ones.
    pub fn raw_sign_or_decrypt(
        &mut self,
        slot: Slot,
        key_type: KeyType,
        payload: &[u8],
    ) -> Result<Vec<u8>> {
        let byte_length = key_type.bit_length() / 8;
        if key_type.is_curve25519() || payload.len() == byte_length {
            return self.use_private_key(slot, key_type, payload, false);
        }
        if payload.len() > byte_length {
            if key_type.is_rsa() {
                return Err(Error::NotSupported("payload too large for the key".into()));
            }
            // ECDSA uses the leftmost curve-size bytes of the digest
            return self.use_private_key(slot, key_type, &payload[..byte_length], false);
        }
        let mut padded = Zeroizing::new(vec![0u8; byte_length]);
        padded[byte_length - payload.len()..].copy_from_slice(payload);
        self.use_private_key(slot, key_type, &padded, false)
    }

    /// Perform an ECDH or X25519 key agreement with a slot's key
    pub fn calculate_secret(
        &mut self,
        slot: Slot,
        peer_public_key: &PublicKeyValues,
    ) -> Result<Zeroizing<Vec<u8>>> {
        let (key_type, encoded_point) = match peer_public_key {
            PublicKeyValues::Cv25519 {
                curve: EllipticCurveValues::X25519,
                raw,
            } => (KeyType::X25519, raw.as_slice()),
            PublicKeyValues::Ec { curve, point } => {
                (KeyType::from_curve(*curve)?, point.as_slice())
            }
            _ => {
                return Err(Error::NotSupported(
                    "key agreement requires an EC or X25519 public key".into(),
                ))
            }
        };
        debug!(?slot, ?key_type, "calculating shared secret");
        self.use_private_key(slot, key_type, encoded_point, true)
            .map(Zeroizing::new)
    }

    fn use_private_key(
        &mut self,
        slot: Slot,
        key_type: KeyType,
        message: &[u8],
        exponentiation: bool,
    ) -> Result<Vec<u8>> {
        let message_tag = if exponentiation {
            TAG_AUTH_EXPONENTIATION
        } else {
            TAG_AUTH_CHALLENGE
        };
        let request = Tlv::new(
            TAG_DYN_AUTH,
            tlv::pack_map(&[
                (TAG_AUTH_RESPONSE, Vec::new()),
                (message_tag, message.to_vec()),
            ]),
        );
        let result = self.protocol.send_and_receive(&Apdu::new(
            0,
            INS_AUTHENTICATE,
            key_type.value(),
            slot.value(),
            request.to_bytes(),
        ));
        match result {
            Ok(response) => tlv::unpack_value(
                TAG_AUTH_RESPONSE,
                &tlv::unpack_value(TAG_DYN_AUTH, &response)?,
            ),
            Err(Error::Apdu {
                sw: sw::INCORRECT_PARAMETERS,
            }) => {
                debug!(
                    ?slot,
                    ?key_type,
                    "wrong parameters, the slot may hold a different key type"
                );
                Err(Error::Apdu {
                    sw: sw::INCORRECT_PARAMETERS,
                })
            }
            Err(err) => Err(err),
        }
    }

    /// A signing and decryption handle bound to one slot
    pub fn signer(&mut self, slot: Slot, key_type: KeyType) -> PivSigner<'_, C> {
        PivSigner::new(self, slot, key_type)
    }

    /// Read a stored data object
    pub fn get_object(&mut self, object_id: u32) -> Result<Vec<u8>> {
        debug!("reading object 0x{:06X}", object_id);
        let request = Tlv::new(TAG_OBJ_ID, object_id::to_bytes(object_id));
        let response = self.protocol.send_and_receive(&Apdu::new(
            0,
            INS_GET_DATA,
            0x3F,
            0xFF,
            request.to_bytes(),
        ))?;
        tlv::unpack_value(TAG_OBJ_DATA, &response)
    }

    /// Write a data object, or erase it by passing `None`
    ///
    /// Requires management key authentication.
    pub fn put_object(&mut self, object_id: u32, data: Option<&[u8]>) -> Result<()> {
        debug!("writing object 0x{:06X}", object_id);
        let request = tlv::pack_map(&[
            (TAG_OBJ_ID, object_id::to_bytes(object_id)),
            (TAG_OBJ_DATA, data.unwrap_or_default().to_vec()),
        ]);
        self.protocol
            .send_and_receive(&Apdu::new(0, INS_PUT_DATA, 0x3F, 0xFF, request))?;
        Ok(())
    }

    /// Read the certificate stored for a slot, as DER
    pub fn get_certificate(&mut self, slot: Slot) -> Result<Vec<u8>> {
        debug!(?slot, "reading certificate");
        let object_data = self.get_object(slot.certificate_object())?;
        let data = tlv::parse_map(&object_data)?;
        let certificate = data
            .get(&TAG_CERTIFICATE)
            .ok_or_else(|| Error::bad_response("object has no certificate field"))?;
        let compressed = data
            .get(&TAG_CERT_INFO)
            .is_some_and(|info| info.first().is_some_and(|&byte| byte != 0));
        if compressed {
            gunzip(certificate).map_err(|_| Error::bad_response("failed to decompress certificate"))
        } else {
            Ok(certificate.clone())
        }
    }

    /// Store a DER certificate for a slot
    ///
    /// Requires management key authentication. Compression helps large
    /// certificates fit the object size limit.
    pub fn put_certificate(&mut self, slot: Slot, certificate: &[u8], compress: bool) -> Result<()> {
        debug!(?slot, compress, "storing certificate");
        let (cert_bytes, cert_info) = if compress {
            (gzip(certificate)?, 1)
        } else {
            (certificate.to_vec(), 0)
        };
        let object_data = tlv::pack_map(&[
            (TAG_CERTIFICATE, cert_bytes),
            (TAG_CERT_INFO, vec![cert_info]),
            (TAG_LRC, Vec::new()),
        ]);
        self.put_object(slot.certificate_object(), Some(&object_data))
    }

    pub fn delete_certificate(&mut self, slot: Slot) -> Result<()> {
        debug!(?slot, "deleting certificate");
        self.put_object(slot.certificate_object(), None)
    }

    /// Create an attestation statement for a generated key, as DER
    ///
    /// The returned certificate is signed by the key in the attestation
    /// slot and covers the public key, slot and policies.
    pub fn attest_key(&mut self, slot: Slot) -> Result<Vec<u8>> {
        self.version.require("Attestation", (4, 3, 0))?;
        debug!(?slot, "attesting key");
        let result = self
            .protocol
            .send_and_receive(&Apdu::new(0, INS_ATTEST, slot.value(), 0, Vec::new()));
        match result {
            Ok(response) => Ok(response),
            Err(Error::Apdu {
                sw: sw::INCORRECT_PARAMETERS,
            }) => Err(Error::bad_response(
                "attestation requires a key generated on the device",
            )),
            Err(err) => Err(err),
        }
    }
}

fn pin_bytes(pin: &[u8]) -> Result<Zeroizing<Vec<u8>>> {
    if pin.len() > PIN_LEN {
        return Err(Error::NotSupported(format!(
            "PIN or PUK must be no longer than {} bytes",
            PIN_LEN
        )));
    }
    let mut padded = Zeroizing::new(vec![0xFF; PIN_LEN]);
    padded[..pin.len()].copy_from_slice(pin);
    Ok(padded)
}

/// Remaining attempts encoded in a verification error, if any
fn retries_from_sw(version: Version, sw: u16) -> Option<u8> {
    if sw == sw::AUTH_METHOD_BLOCKED {
        return Some(0);
    }
    if version.is_less_than(1, 0, 4) {
        if (0x6300..=0x63FF).contains(&sw) {
            return Some((sw & 0xFF) as u8);
        }
    } else if (0x63C0..=0x63CF).contains(&sw) {
        return Some((sw & 0xF) as u8);
    }
    None
}

fn metadata_byte(data: &BTreeMap<u16, Vec<u8>>, tag: u16, index: usize) -> Result<u8> {
    data.get(&tag)
        .and_then(|value| value.get(index))
        .copied()
        .ok_or_else(|| Error::bad_response(format!("metadata tag 0x{:02X} missing or short", tag)))
}

fn parse_public_key(key_type: KeyType, encoded: &[u8]) -> Result<PublicKeyValues> {
    let data = tlv::parse_map(encoded)?;
    let field = |tag: u16| {
        data.get(&tag)
            .cloned()
            .ok_or_else(|| Error::bad_response(format!("public key is missing tag 0x{:02X}", tag)))
    };
    match key_type {
        KeyType::Rsa1024 | KeyType::Rsa2048 | KeyType::Rsa3072 | KeyType::Rsa4096 => {
            Ok(PublicKeyValues::Rsa {
                modulus: field(TAG_RSA_MODULUS)?,
                public_exponent: field(TAG_RSA_EXPONENT)?,
            })
        }
        KeyType::EccP256 => Ok(PublicKeyValues::Ec {
            curve: EllipticCurveValues::Secp256r1,
            point: field(TAG_EC_POINT)?,
        }),
        KeyType::EccP384 => Ok(PublicKeyValues::Ec {
            curve: EllipticCurveValues::Secp384r1,
            point: field(TAG_EC_POINT)?,
        }),
        KeyType::Ed25519 => Ok(PublicKeyValues::Cv25519 {
            curve: EllipticCurveValues::Ed25519,
            raw: field(TAG_EC_POINT)?,
        }),
        KeyType::X25519 => Ok(PublicKeyValues::Cv25519 {
            curve: EllipticCurveValues::X25519,
            raw: field(TAG_EC_POINT)?,
        }),
    }
}

/// Append a TLV holding `value` normalized to exactly `length` bytes
fn push_int_tlv(buffer: &mut Vec<u8>, tag: u8, value: &[u8], length: usize) -> Result<()> {
    let start = value.iter().position(|&byte| byte != 0).unwrap_or(value.len());
    let significant = &value[start..];
    if significant.len() > length {
        return Err(Error::NotSupported(
            "RSA component longer than the key size allows".into(),
        ));
    }
    buffer.push(tag);
    if length < 0x80 {
        buffer.push(length as u8);
    } else if length < 0x100 {
        buffer.push(0x81);
        buffer.push(length as u8);
    } else {
        buffer.push(0x82);
        buffer.push((length >> 8) as u8);
        buffer.push(length as u8);
    }
    buffer.resize(buffer.len() + (length - significant.len()), 0);
    buffer.extend_from_slice(significant);
    Ok(())
}

fn gzip(data: &[u8]) -> Result<Vec<u8>> {
    let mut encoder = GzEncoder::new(Vec::new(), Compression::default());
    encoder.write_all(data)?;
    Ok(encoder.finish()?)
}

fn gunzip(data: &[u8]) -> Result<Vec<u8>> {
    let mut decoder = GzDecoder::new(data);
    let mut decompressed = Vec::new();
    decoder.read_to_end(&mut decompressed)?;
    Ok(decompressed)
}

#[cfg(test)]
mod tests {
    use std::collections::VecDeque;

    use sha2::{Digest, Sha256};

    use super::*;
    use ykey_core::keys::{EcPrivateKeyValues, RsaPrivateKeyValues};
    use ykey_transport::connection::Transport;

    struct MockConnection {
        exchanges: VecDeque<(Vec<u8>, Vec<u8>)>,
    }

    impl MockConnection {
        fn new(exchanges: Vec<(Vec<u8>, Vec<u8>)>) -> Self {
            Self {
                exchanges: exchanges.into(),
            }
        }
    }

    impl SmartCardConnection for MockConnection {
        fn transport(&self) -> Transport {
            Transport::Usb
        }

        fn supports_extended_length(&self) -> bool {
            false
        }

        fn send_and_receive(&mut self, apdu: &[u8]) -> Result<Vec<u8>> {
            let (expected, response) = self
                .exchanges
                .pop_front()
                .unwrap_or_else(|| panic!("unexpected APDU: {:02x?}", apdu));
            assert_eq!(apdu, expected.as_slice(), "unexpected APDU bytes");
            Ok(response)
        }
    }

    fn ok(data: &[u8]) -> Vec<u8> {
        let mut out = data.to_vec();
        out.extend_from_slice(&[0x90, 0x00]);
        out
    }

    fn select_exchange() -> (Vec<u8>, Vec<u8>) {
        (
            vec![0x00, 0xA4, 0x04, 0x00, 0x05, 0xA0, 0x00, 0x00, 0x03, 0x08],
            ok(&[]),
        )
    }

    fn mgm_metadata_exchange(algorithm: u8) -> (Vec<u8>, Vec<u8>) {
        (
            vec![0x00, 0xF7, 0x00, 0x9B],
            ok(&[0x01, 0x01, algorithm, 0x02, 0x02, 0x00, 0x01, 0x05, 0x01, 0x01]),
        )
    }

    /// Session fixture; the constructor probes key metadata on 5.3 and later
    fn session(version: [u8; 3], exchanges: Vec<(Vec<u8>, Vec<u8>)>) -> PivSession<MockConnection> {
        let mut all = vec![
            select_exchange(),
            (vec![0x00, 0xFD, 0x00, 0x00], ok(&version)),
        ];
        if Version::from_bytes(&version).unwrap().supports((5, 3, 0)) {
            all.push(mgm_metadata_exchange(0x03));
        }
        all.extend(exchanges);
        PivSession::new(MockConnection::new(all)).unwrap()
    }

    #[test]
    fn test_session_reads_version() {
        let s = session([5, 4, 3], vec![]);
        assert_eq!(s.version(), Version::new(5, 4, 3));
        assert_eq!(s.management_key_type(), MgmKeyAlgorithm::ThreeDes);
    }

    #[test]
    fn test_session_pre_metadata_defaults_to_tdes() {
        // No metadata probe before 5.3
        let s = session([4, 3, 7], vec![]);
        assert_eq!(s.management_key_type(), MgmKeyAlgorithm::ThreeDes);
    }

    #[test]
    fn test_read_serial_number() {
        let mut s = session(
            [5, 4, 3],
            vec![(
                vec![0x00, 0xF8, 0x00, 0x00],
                ok(&[0x00, 0xBC, 0x61, 0x4E]),
            )],
        );
        assert_eq!(s.read_serial_number().unwrap(), 12345678);
    }

    #[test]
    fn test_read_serial_number_version_gate() {
        let mut s = session([4, 3, 7], vec![]);
        let err = s.read_serial_number().unwrap_err();
        assert!(matches!(err, Error::NotSupported(_)));
    }

    #[test]
    fn test_verify_pin() {
        let mut s = session(
            [5, 4, 3],
            vec![(
                vec![0x00, 0x20, 0x00, 0x80, 0x08, 0x31, 0x32, 0x33, 0x34, 0x35, 0x36, 0xFF, 0xFF],
                ok(&[]),
            )],
        );
        s.verify_pin(b"123456").unwrap();
    }

    #[test]
    fn test_verify_pin_invalid() {
        let mut s = session(
            [5, 4, 3],
            vec![(
                vec![0x00, 0x20, 0x00, 0x80, 0x08, 0x36, 0x35, 0x34, 0x33, 0x32, 0x31, 0xFF, 0xFF],
                vec![0x63, 0xC2],
            )],
        );
        let err = s.verify_pin(b"654321").unwrap_err();
        assert!(matches!(
            err,
            Error::InvalidPin {
                attempts_remaining: 2
            }
        ));
    }

    #[test]
    fn test_verify_pin_blocked() {
        let mut s = session(
            [5, 4, 3],
            vec![(
                vec![0x00, 0x20, 0x00, 0x80, 0x08, 0x31, 0x32, 0x33, 0x34, 0x35, 0x36, 0xFF, 0xFF],
                vec![0x69, 0x83],
            )],
        );
        let err = s.verify_pin(b"123456").unwrap_err();
        assert!(matches!(
            err,
            Error::InvalidPin {
                attempts_remaining: 0
            }
        ));
    }

    #[test]
    fn test_verify_pin_too_long() {
        let mut s = session([4, 3, 7], vec![]);
        let err = s.verify_pin(b"123456789").unwrap_err();
        assert!(matches!(err, Error::NotSupported(_)));
    }

    #[test]
    fn test_change_pin() {
        let mut expected = vec![0x00, 0x24, 0x00, 0x80, 0x10];
        expected.extend_from_slice(&[0x31, 0x32, 0x33, 0x34, 0x35, 0x36, 0xFF, 0xFF]);
        expected.extend_from_slice(&[0x61, 0x62, 0x63, 0x64, 0x65, 0x66, 0xFF, 0xFF]);
        let mut s = session(
            [5, 4, 3],
            vec![(expected.clone(), ok(&[])), (expected, vec![0x63, 0xC1])],
        );
        s.change_pin(b"123456", b"abcdef").unwrap();
        let err = s.change_pin(b"123456", b"abcdef").unwrap_err();
        assert!(matches!(
            err,
            Error::InvalidPin {
                attempts_remaining: 1
            }
        ));
    }

    #[test]
    fn test_change_puk() {
        let mut expected = vec![0x00, 0x24, 0x00, 0x81, 0x10];
        expected.extend_from_slice(&[0x31, 0x32, 0x33, 0x34, 0x35, 0x36, 0x37, 0x38]);
        expected.extend_from_slice(&[0x38, 0x37, 0x36, 0x35, 0x34, 0x33, 0x32, 0x31]);
        let mut s = session([5, 4, 3], vec![(expected, ok(&[]))]);
        s.change_puk(b"12345678", b"87654321").unwrap();
    }

    #[test]
    fn test_unblock_pin() {
        let mut expected = vec![0x00, 0x2C, 0x00, 0x80, 0x10];
        expected.extend_from_slice(&[0x31, 0x32, 0x33, 0x34, 0x35, 0x36, 0x37, 0x38]);
        expected.extend_from_slice(&[0x31, 0x32, 0x33, 0x34, 0x35, 0x36, 0xFF, 0xFF]);
        let mut s = session([5, 4, 3], vec![(expected, ok(&[]))]);
        s.unblock_pin(b"12345678", b"123456").unwrap();
    }

    #[test]
    fn test_set_pin_attempts() {
        let mut s = session([5, 4, 3], vec![(vec![0x00, 0xFA, 0x05, 0x03], ok(&[]))]);
        s.set_pin_attempts(5, 3).unwrap();
    }

    #[test]
    fn test_get_pin_attempts_from_metadata() {
        let mut s = session(
            [5, 4, 3],
            vec![(
                vec![0x00, 0xF7, 0x00, 0x80],
                ok(&[0x05, 0x01, 0x01, 0x06, 0x02, 0x08, 0x05]),
            )],
        );
        assert_eq!(s.get_pin_attempts().unwrap(), 5);
    }

    #[test]
    fn test_get_pin_attempts_legacy_probe() {
        let mut s = session(
            [4, 3, 7],
            vec![
                (vec![0x00, 0x20, 0x00, 0x80], vec![0x63, 0xC3]),
                (vec![0x00, 0x20, 0x00, 0x80], ok(&[])),
            ],
        );
        assert_eq!(s.get_pin_attempts().unwrap(), 3);
        // An accepted probe falls back to the cached count
        assert_eq!(s.get_pin_attempts().unwrap(), 3);
    }

    #[test]
    fn test_pin_and_puk_metadata() {
        let mut s = session(
            [5, 4, 3],
            vec![
                (
                    vec![0x00, 0xF7, 0x00, 0x80],
                    ok(&[0x05, 0x01, 0x01, 0x06, 0x02, 0x08, 0x05]),
                ),
                (
                    vec![0x00, 0xF7, 0x00, 0x81],
                    ok(&[0x05, 0x01, 0x00, 0x06, 0x02, 0x03, 0x02]),
                ),
            ],
        );
        assert_eq!(
            s.pin_metadata().unwrap(),
            PinMetadata {
                is_default: true,
                total_attempts: 8,
                attempts_remaining: 5,
            }
        );
        assert_eq!(
            s.puk_metadata().unwrap(),
            PinMetadata {
                is_default: false,
                total_attempts: 3,
                attempts_remaining: 2,
            }
        );
    }

    #[test]
    fn test_metadata_version_gate() {
        let mut s = session([5, 2, 4], vec![]);
        assert!(matches!(s.pin_metadata(), Err(Error::NotSupported(_))));
        assert!(matches!(
            s.slot_metadata(Slot::Authentication),
            Err(Error::NotSupported(_))
        ));
    }

    #[test]
    fn test_management_key_metadata_without_algorithm() {
        // 5.3.0 omits the algorithm tag; 3DES is implied
        let response = ok(&[0x02, 0x02, 0x00, 0x01, 0x05, 0x01, 0x01]);
        let mut s = PivSession::new(MockConnection::new(vec![
            select_exchange(),
            (vec![0x00, 0xFD, 0x00, 0x00], ok(&[5, 3, 0])),
            (vec![0x00, 0xF7, 0x00, 0x9B], response.clone()),
            (vec![0x00, 0xF7, 0x00, 0x9B], response),
        ]))
        .unwrap();
        let metadata = s.management_key_metadata().unwrap();
        assert_eq!(metadata.key_type, MgmKeyAlgorithm::ThreeDes);
        assert!(metadata.is_default);
        assert_eq!(metadata.touch_policy, TouchPolicy::Never);
    }

    #[test]
    fn test_session_detects_aes_management_key() {
        let s = PivSession::new(MockConnection::new(vec![
            select_exchange(),
            (vec![0x00, 0xFD, 0x00, 0x00], ok(&[5, 7, 2])),
            mgm_metadata_exchange(0x0C),
        ]))
        .unwrap();
        assert_eq!(s.management_key_type(), MgmKeyAlgorithm::Aes256);
    }

    #[test]
    fn test_slot_metadata() {
        let mut point = vec![0x04];
        point.extend_from_slice(&[0x11; 32]);
        point.extend_from_slice(&[0x22; 32]);
        let mut response = vec![0x01, 0x01, 0x11, 0x02, 0x02, 0x02, 0x01, 0x03, 0x01, 0x01];
        response.extend_from_slice(&[0x04, 0x43, 0x86, 0x41]);
        response.extend_from_slice(&point);
        let mut s = session(
            [5, 4, 3],
            vec![(vec![0x00, 0xF7, 0x00, 0x9A], ok(&response))],
        );
        let metadata = s.slot_metadata(Slot::Authentication).unwrap();
        assert_eq!(metadata.key_type, KeyType::EccP256);
        assert_eq!(metadata.pin_policy, PinPolicy::Once);
        assert_eq!(metadata.touch_policy, TouchPolicy::Never);
        assert!(metadata.generated);
        assert_eq!(
            metadata.public_key,
            PublicKeyValues::Ec {
                curve: EllipticCurveValues::Secp256r1,
                point,
            }
        );
    }

    #[test]
    fn test_bio_metadata() {
        let mut s = session(
            [5, 4, 3],
            vec![(
                vec![0x00, 0xF7, 0x00, 0x96],
                ok(&[0x07, 0x01, 0x01, 0x06, 0x01, 0x03, 0x08, 0x01, 0x00]),
            )],
        );
        assert_eq!(
            s.bio_metadata().unwrap(),
            BioMetadata {
                is_configured: true,
                attempts_remaining: 3,
                has_temporary_pin: false,
            }
        );
    }

    #[test]
    fn test_bio_metadata_not_supported() {
        let mut s = session(
            [5, 4, 3],
            vec![(vec![0x00, 0xF7, 0x00, 0x96], vec![0x6A, 0x88])],
        );
        assert!(matches!(s.bio_metadata(), Err(Error::NotSupported(_))));
    }

    #[test]
    fn test_verify_uv() {
        let mut s = session(
            [5, 4, 3],
            vec![
                (vec![0x00, 0x20, 0x00, 0x96], ok(&[])),
                (vec![0x00, 0x20, 0x00, 0x96, 0x02, 0x03, 0x00], ok(&[])),
                (
                    vec![0x00, 0x20, 0x00, 0x96, 0x02, 0x02, 0x00],
                    ok(&[0xAB; 16]),
                ),
            ],
        );
        assert!(matches!(
            s.verify_uv(true, true),
            Err(Error::NotSupported(_))
        ));
        assert!(s.verify_uv(false, true).unwrap().is_none());
        assert!(s.verify_uv(false, false).unwrap().is_none());
        let pin = s.verify_uv(true, false).unwrap().unwrap();
        assert_eq!(pin.as_slice(), &[0xAB; 16]);
    }

    #[test]
    fn test_verify_uv_errors() {
        let mut s = session(
            [5, 4, 3],
            vec![(
                vec![0x00, 0x20, 0x00, 0x96, 0x02, 0x03, 0x00],
                vec![0x6A, 0x88],
            )],
        );
        assert!(matches!(
            s.verify_uv(false, false),
            Err(Error::NotSupported(_))
        ));

        let mut s = session(
            [5, 4, 3],
            vec![(
                vec![0x00, 0x20, 0x00, 0x96, 0x02, 0x03, 0x00],
                vec![0x63, 0xC1],
            )],
        );
        assert!(matches!(
            s.verify_uv(false, false),
            Err(Error::InvalidPin {
                attempts_remaining: 1
            })
        ));
    }

    #[test]
    fn test_verify_temporary_pin() {
        let mut expected = vec![0x00, 0x20, 0x00, 0x96, 0x12, 0x01, 0x10];
        expected.extend_from_slice(&[0xAB; 16]);
        let mut s = session([5, 4, 3], vec![(expected, ok(&[]))]);
        s.verify_temporary_pin(&[0xAB; 16]).unwrap();

        let err = s.verify_temporary_pin(&[0xAB; 8]).unwrap_err();
        assert!(matches!(err, Error::NotSupported(_)));
    }

    #[test]
    fn test_authenticate() {
        let key = MgmKey::default();
        let witness_plain = [0x2A; 8];
        let witness_encrypted = key.encrypt_block(&witness_plain).unwrap();
        let challenge = [0x17; 8];
        let device_response = key.encrypt_block(&challenge).unwrap();

        let first_request = vec![0x00, 0x87, 0x03, 0x9B, 0x04, 0x7C, 0x02, 0x80, 0x00];
        let mut first_response = vec![0x7C, 0x0A, 0x80, 0x08];
        first_response.extend_from_slice(&witness_encrypted);

        let mut second_request = vec![0x00, 0x87, 0x03, 0x9B, 0x16, 0x7C, 0x14, 0x80, 0x08];
        second_request.extend_from_slice(&witness_plain);
        second_request.extend_from_slice(&[0x81, 0x08]);
        second_request.extend_from_slice(&challenge);
        let mut second_response = vec![0x7C, 0x0A, 0x82, 0x08];
        second_response.extend_from_slice(&device_response);

        let mut s = session(
            [5, 4, 3],
            vec![
                (first_request, ok(&first_response)),
                (second_request, ok(&second_response)),
            ],
        );
        s.authenticate_with_challenge(&key, &challenge).unwrap();
    }

    #[test]
    fn test_authenticate_rejects_bad_device_response() {
        let key = MgmKey::default();
        let witness_plain = [0x2A; 8];
        let witness_encrypted = key.encrypt_block(&witness_plain).unwrap();
        let challenge = [0x17; 8];
        let mut bad_response = key.encrypt_block(&challenge).unwrap();
        bad_response[7] ^= 0x01;

        let first_request = vec![0x00, 0x87, 0x03, 0x9B, 0x04, 0x7C, 0x02, 0x80, 0x00];
        let mut first_response = vec![0x7C, 0x0A, 0x80, 0x08];
        first_response.extend_from_slice(&witness_encrypted);

        let mut second_request = vec![0x00, 0x87, 0x03, 0x9B, 0x16, 0x7C, 0x14, 0x80, 0x08];
        second_request.extend_from_slice(&witness_plain);
        second_request.extend_from_slice(&[0x81, 0x08]);
        second_request.extend_from_slice(&challenge);
        let mut second_response = vec![0x7C, 0x0A, 0x82, 0x08];
        second_response.extend_from_slice(&bad_response);

        let mut s = session(
            [5, 4, 3],
            vec![
                (first_request, ok(&first_response)),
                (second_request, ok(&second_response)),
            ],
        );
        let err = s
            .authenticate_with_challenge(&key, &challenge)
            .unwrap_err();
        assert!(matches!(err, Error::BadResponse(_)));
    }

    #[test]
    fn test_authenticate_checks_key_type() {
        let mut s = PivSession::new(MockConnection::new(vec![
            select_exchange(),
            (vec![0x00, 0xFD, 0x00, 0x00], ok(&[5, 7, 2])),
            mgm_metadata_exchange(0x0C),
        ]))
        .unwrap();
        let err = s.authenticate(&MgmKey::default()).unwrap_err();
        assert!(matches!(err, Error::NotSupported(_)));
    }

    #[test]
    fn test_set_management_key() {
        let mut expected = vec![0x00, 0xFF, 0xFF, 0xFF, 0x1B, 0x0A, 0x9B, 0x18];
        expected.extend_from_slice(&[0x07; 24]);
        let mut s = session([5, 4, 3], vec![(expected, ok(&[]))]);
        s.set_management_key(MgmKeyAlgorithm::Aes192, &[0x07; 24], false)
            .unwrap();
        assert_eq!(s.management_key_type(), MgmKeyAlgorithm::Aes192);
    }

    #[test]
    fn test_set_management_key_require_touch() {
        let mut expected = vec![0x00, 0xFF, 0xFF, 0xFE, 0x1B, 0x03, 0x9B, 0x18];
        expected.extend_from_slice(&[0x05; 24]);
        let mut s = session([5, 4, 3], vec![(expected, ok(&[]))]);
        s.set_management_key(MgmKeyAlgorithm::ThreeDes, &[0x05; 24], true)
            .unwrap();
    }

    #[test]
    fn test_set_management_key_guards() {
        let mut s = session([5, 2, 4], vec![]);
        assert!(matches!(
            s.set_management_key(MgmKeyAlgorithm::Aes128, &[0; 16], false),
            Err(Error::NotSupported(_))
        ));

        let mut s = session([5, 4, 3], vec![]);
        assert!(matches!(
            s.set_management_key(MgmKeyAlgorithm::Aes256, &[0; 16], false),
            Err(Error::NotSupported(_))
        ));
    }

    #[test]
    fn test_reset() {
        let mut block_puk = vec![0x00, 0x2C, 0x00, 0x80, 0x10];
        block_puk.extend_from_slice(&[0xFF; 16]);
        let mut s = session(
            [5, 4, 3],
            vec![
                // Bio probe says no bio support
                (vec![0x00, 0xF7, 0x00, 0x96], vec![0x6A, 0x88]),
                // One PIN attempt left
                (
                    vec![0x00, 0xF7, 0x00, 0x80],
                    ok(&[0x05, 0x01, 0x00, 0x06, 0x02, 0x03, 0x01]),
                ),
                (
                    vec![
                        0x00, 0x20, 0x00, 0x80, 0x08, 0xFF, 0xFF, 0xFF, 0xFF, 0xFF, 0xFF, 0xFF,
                        0xFF,
                    ],
                    vec![0x63, 0xC0],
                ),
                (block_puk, vec![0x63, 0xC0]),
                (vec![0x00, 0xFB, 0x00, 0x00], ok(&[])),
                mgm_metadata_exchange(0x03),
            ],
        );
        s.reset().unwrap();
        assert_eq!(s.management_key_type(), MgmKeyAlgorithm::ThreeDes);
    }

    #[test]
    fn test_reset_rejects_enrolled_fingerprints() {
        let mut s = session(
            [5, 4, 3],
            vec![(
                vec![0x00, 0xF7, 0x00, 0x96],
                ok(&[0x07, 0x01, 0x01, 0x06, 0x01, 0x03, 0x08, 0x01, 0x00]),
            )],
        );
        assert!(matches!(s.reset(), Err(Error::NotSupported(_))));
    }

    #[test]
    fn test_generate_key() {
        let mut point = vec![0x04];
        point.extend_from_slice(&[0x33; 64]);
        let mut response = vec![0x7F, 0x49, 0x43, 0x86, 0x41];
        response.extend_from_slice(&point);
        let mut s = session(
            [5, 4, 3],
            vec![(
                vec![
                    0x00, 0x47, 0x00, 0x9A, 0x0B, 0xAC, 0x09, 0x80, 0x01, 0x11, 0xAA, 0x01, 0x02,
                    0xAB, 0x01, 0x02,
                ],
                ok(&response),
            )],
        );
        let public_key = s
            .generate_key(
                Slot::Authentication,
                KeyType::EccP256,
                PinPolicy::Once,
                TouchPolicy::Always,
            )
            .unwrap();
        assert_eq!(
            public_key,
            PublicKeyValues::Ec {
                curve: EllipticCurveValues::Secp256r1,
                point,
            }
        );
    }

    #[test]
    fn test_generate_rsa_key_default_policies() {
        let modulus = vec![0xC5; 128];
        let mut response = vec![0x7F, 0x49, 0x81, 0x88, 0x81, 0x81, 0x80];
        response.extend_from_slice(&modulus);
        response.extend_from_slice(&[0x82, 0x03, 0x01, 0x00, 0x01]);
        let mut s = session(
            [5, 4, 3],
            vec![(
                vec![0x00, 0x47, 0x00, 0x9C, 0x05, 0xAC, 0x03, 0x80, 0x01, 0x06],
                ok(&response),
            )],
        );
        let public_key = s
            .generate_key(
                Slot::Signature,
                KeyType::Rsa1024,
                PinPolicy::Default,
                TouchPolicy::Default,
            )
            .unwrap();
        assert_eq!(
            public_key,
            PublicKeyValues::Rsa {
                modulus,
                public_exponent: vec![0x01, 0x00, 0x01],
            }
        );
    }

    #[test]
    fn test_check_key_support_gates() {
        let s = session([4, 3, 0], vec![]);
        // ROCA range blocks generation but not import
        assert!(matches!(
            s.check_key_support(KeyType::Rsa2048, PinPolicy::Default, TouchPolicy::Default, true),
            Err(Error::NotSupported(_))
        ));
        assert!(s
            .check_key_support(KeyType::Rsa2048, PinPolicy::Default, TouchPolicy::Default, false)
            .is_ok());
        assert!(matches!(
            s.check_key_support(KeyType::Ed25519, PinPolicy::Default, TouchPolicy::Default, false),
            Err(Error::NotSupported(_))
        ));

        let s = session([4, 0, 0], vec![]);
        assert!(s
            .check_key_support(KeyType::EccP384, PinPolicy::Once, TouchPolicy::Always, false)
            .is_ok());
        assert!(matches!(
            s.check_key_support(KeyType::EccP256, PinPolicy::Default, TouchPolicy::Cached, false),
            Err(Error::NotSupported(_))
        ));

        let s = session([3, 5, 1], vec![]);
        assert!(matches!(
            s.check_key_support(KeyType::EccP384, PinPolicy::Default, TouchPolicy::Default, false),
            Err(Error::NotSupported(_))
        ));
        assert!(matches!(
            s.check_key_support(KeyType::EccP256, PinPolicy::Always, TouchPolicy::Default, false),
            Err(Error::NotSupported(_))
        ));

        let s = session([5, 4, 3], vec![]);
        assert!(matches!(
            s.check_key_support(KeyType::Rsa4096, PinPolicy::Default, TouchPolicy::Default, false),
            Err(Error::NotSupported(_))
        ));

        let s = session([5, 7, 2], vec![]);
        assert!(s
            .check_key_support(KeyType::X25519, PinPolicy::Default, TouchPolicy::Default, false)
            .is_ok());
    }

    #[test]
    fn test_check_key_support_fips() {
        let s = session([4, 4, 3], vec![]);
        assert!(matches!(
            s.check_key_support(KeyType::Rsa1024, PinPolicy::Default, TouchPolicy::Default, false),
            Err(Error::NotSupported(_))
        ));
        assert!(matches!(
            s.check_key_support(KeyType::EccP256, PinPolicy::Never, TouchPolicy::Default, false),
            Err(Error::NotSupported(_))
        ));
        assert!(s
            .check_key_support(KeyType::Rsa2048, PinPolicy::Default, TouchPolicy::Default, true)
            .is_ok());
    }

    #[test]
    fn test_check_key_support_dev_firmware() {
        // Development builds report 0.x and bypass all gates
        let s = session([0, 3, 1], vec![]);
        assert!(s
            .check_key_support(KeyType::X25519, PinPolicy::MatchAlways, TouchPolicy::Cached, true)
            .is_ok());
    }

    #[test]
    fn test_put_key_ec() {
        let secret = [0x44u8; 32];
        let key = PrivateKeyValues::Ec(EcPrivateKeyValues::new(
            EllipticCurveValues::Secp256r1,
            secret.to_vec(),
        ));
        let mut expected = vec![0x00, 0xFE, 0x11, 0x9C, 0x22, 0x06, 0x20];
        expected.extend_from_slice(&secret);
        let mut s = session([5, 4, 3], vec![(expected, ok(&[]))]);
        let key_type = s
            .put_key(Slot::Signature, &key, PinPolicy::Default, TouchPolicy::Default)
            .unwrap();
        assert_eq!(key_type, KeyType::EccP256);
    }

    #[test]
    fn test_put_key_with_policies() {
        let secret = [0x44u8; 32];
        let key = PrivateKeyValues::Ec(EcPrivateKeyValues::new(
            EllipticCurveValues::Secp256r1,
            secret.to_vec(),
        ));
        let mut expected = vec![0x00, 0xFE, 0x11, 0x9C, 0x28, 0x06, 0x20];
        expected.extend_from_slice(&secret);
        expected.extend_from_slice(&[0xAA, 0x01, 0x03, 0xAB, 0x01, 0x03]);
        let mut s = session([5, 4, 3], vec![(expected, ok(&[]))]);
        s.put_key(Slot::Signature, &key, PinPolicy::Always, TouchPolicy::Cached)
            .unwrap();
    }

    #[test]
    fn test_put_key_rsa_requires_crt() {
        let key = PrivateKeyValues::Rsa(RsaPrivateKeyValues::new(
            vec![0x80; 128],
            vec![0x01, 0x00, 0x01],
            vec![0xAA; 64],
            vec![0xBB; 64],
            None,
            None,
            None,
        ));
        let mut s = session([5, 4, 3], vec![]);
        let err = s
            .put_key(
                Slot::KeyManagement,
                &key,
                PinPolicy::Default,
                TouchPolicy::Default,
            )
            .unwrap_err();
        assert!(matches!(err, Error::NotSupported(_)));
    }

    #[test]
    fn test_push_int_tlv_normalizes_length() {
        let mut buffer = Vec::new();
        push_int_tlv(&mut buffer, 0x01, &[0x00, 0x00, 0xAB, 0xCD], 3).unwrap();
        assert_eq!(buffer, vec![0x01, 0x03, 0x00, 0xAB, 0xCD]);

        let mut buffer = Vec::new();
        push_int_tlv(&mut buffer, 0x02, &[0x12; 128], 128).unwrap();
        assert_eq!(&buffer[..3], &[0x02, 0x81, 0x80]);
        assert_eq!(buffer.len(), 3 + 128);

        let mut buffer = Vec::new();
        push_int_tlv(&mut buffer, 0x03, &[0x34; 256], 256).unwrap();
        assert_eq!(&buffer[..4], &[0x03, 0x82, 0x01, 0x00]);

        let mut buffer = Vec::new();
        assert!(push_int_tlv(&mut buffer, 0x01, &[0x01, 0x02, 0x03], 2).is_err());
    }

    #[test]
    fn test_move_and_delete_key() {
        let mut s = session(
            [5, 7, 2],
            vec![
                (vec![0x00, 0xF6, 0x9D, 0x9A], ok(&[])),
                (vec![0x00, 0xF6, 0xFF, 0x9C], ok(&[])),
            ],
        );
        s.move_key(Slot::Authentication, Slot::KeyManagement).unwrap();
        s.delete_key(Slot::Signature).unwrap();
    }

    #[test]
    fn test_move_key_guards() {
        let mut s = session([5, 4, 3], vec![]);
        assert!(matches!(
            s.move_key(Slot::Authentication, Slot::KeyManagement),
            Err(Error::NotSupported(_))
        ));

        let mut s = session([5, 7, 2], vec![]);
        assert!(matches!(
            s.move_key(Slot::Attestation, Slot::Authentication),
            Err(Error::NotSupported(_))
        ));
    }

    #[test]
    fn test_raw_sign_truncates_long_ec_payload() {
        let payload = [0x99u8; 64];
        let mut expected = vec![0x00, 0x87, 0x11, 0x9A, 0x26, 0x7C, 0x24, 0x82, 0x00, 0x81, 0x20];
        expected.extend_from_slice(&payload[..32]);
        let mut response = vec![0x7C, 0x12, 0x82, 0x10];
        response.extend_from_slice(&[0x5A; 16]);
        let mut s = session([5, 4, 3], vec![(expected, ok(&response))]);
        let signature = s
            .raw_sign_or_decrypt(Slot::Authentication, KeyType::EccP256, &payload)
            .unwrap();
        assert_eq!(signature, vec![0x5A; 16]);
    }

    #[test]
    fn test_raw_sign_pads_short_payload() {
        let payload = [0x77u8; 30];
        let mut expected = vec![
            0x00, 0x87, 0x11, 0x9A, 0x26, 0x7C, 0x24, 0x82, 0x00, 0x81, 0x20, 0x00, 0x00,
        ];
        expected.extend_from_slice(&payload);
        let mut response = vec![0x7C, 0x12, 0x82, 0x10];
        response.extend_from_slice(&[0x5A; 16]);
        let mut s = session([5, 4, 3], vec![(expected, ok(&response))]);
        s.raw_sign_or_decrypt(Slot::Authentication, KeyType::EccP256, &payload)
            .unwrap();
    }

    #[test]
    fn test_raw_decrypt_rejects_oversized_rsa_payload() {
        let mut s = session([5, 4, 3], vec![]);
        let err = s
            .raw_sign_or_decrypt(Slot::KeyManagement, KeyType::Rsa1024, &[0x00; 129])
            .unwrap_err();
        assert!(matches!(err, Error::NotSupported(_)));
    }

    #[test]
    fn test_calculate_secret_ecdh() {
        let mut point = vec![0x04];
        point.extend_from_slice(&[0x66; 64]);
        let peer = PublicKeyValues::Ec {
            curve: EllipticCurveValues::Secp256r1,
            point: point.clone(),
        };
        let mut expected = vec![0x00, 0x87, 0x11, 0x9D, 0x47, 0x7C, 0x45, 0x82, 0x00, 0x85, 0x41];
        expected.extend_from_slice(&point);
        let mut response = vec![0x7C, 0x22, 0x82, 0x20];
        response.extend_from_slice(&[0x88; 32]);
        let mut s = session([5, 4, 3], vec![(expected, ok(&response))]);
        let secret = s.calculate_secret(Slot::KeyManagement, &peer).unwrap();
        assert_eq!(secret.as_slice(), &[0x88; 32]);
    }

    #[test]
    fn test_calculate_secret_x25519() {
        let raw = vec![0x13; 32];
        let peer = PublicKeyValues::Cv25519 {
            curve: EllipticCurveValues::X25519,
            raw: raw.clone(),
        };
        let mut expected = vec![0x00, 0x87, 0xE1, 0x9D, 0x26, 0x7C, 0x24, 0x82, 0x00, 0x85, 0x20];
        expected.extend_from_slice(&raw);
        let mut response = vec![0x7C, 0x22, 0x82, 0x20];
        response.extend_from_slice(&[0x99; 32]);
        let mut s = session([5, 7, 2], vec![(expected, ok(&response))]);
        let secret = s.calculate_secret(Slot::KeyManagement, &peer).unwrap();
        assert_eq!(secret.as_slice(), &[0x99; 32]);
    }

    #[test]
    fn test_calculate_secret_rejects_rsa_peer() {
        let peer = PublicKeyValues::Rsa {
            modulus: vec![0x80; 128],
            public_exponent: vec![0x01, 0x00, 0x01],
        };
        let mut s = session([5, 4, 3], vec![]);
        assert!(matches!(
            s.calculate_secret(Slot::KeyManagement, &peer),
            Err(Error::NotSupported(_))
        ));
    }

    #[test]
    fn test_get_object() {
        let mut s = session(
            [5, 4, 3],
            vec![
                (
                    vec![0x00, 0xCB, 0x3F, 0xFF, 0x05, 0x5C, 0x03, 0x5F, 0xC1, 0x02],
                    ok(&[0x53, 0x04, 0xAA, 0xBB, 0xCC, 0xDD]),
                ),
                (
                    vec![0x00, 0xCB, 0x3F, 0xFF, 0x03, 0x5C, 0x01, 0x7E],
                    ok(&[0x53, 0x00]),
                ),
            ],
        );
        assert_eq!(
            s.get_object(object_id::CHUID).unwrap(),
            vec![0xAA, 0xBB, 0xCC, 0xDD]
        );
        // Discovery uses the one-byte object identifier
        assert_eq!(s.get_object(object_id::DISCOVERY).unwrap(), Vec::<u8>::new());
    }

    #[test]
    fn test_put_object() {
        let mut s = session(
            [5, 4, 3],
            vec![(
                vec![
                    0x00, 0xDB, 0x3F, 0xFF, 0x0B, 0x5C, 0x03, 0x5F, 0xC1, 0x02, 0x53, 0x04, 0xAA,
                    0xBB, 0xCC, 0xDD,
                ],
                ok(&[]),
            )],
        );
        s.put_object(object_id::CHUID, Some(&[0xAA, 0xBB, 0xCC, 0xDD]))
            .unwrap();
    }

    #[test]
    fn test_get_certificate() {
        let der = vec![0x30, 0x03, 0x02, 0x01, 0x05];
        let inner = tlv::pack_map(&[
            (TAG_CERTIFICATE, der.clone()),
            (TAG_CERT_INFO, vec![0x00]),
            (TAG_LRC, Vec::new()),
        ]);
        let response = Tlv::new(TAG_OBJ_DATA, inner).to_bytes();
        let mut s = session(
            [5, 4, 3],
            vec![(
                vec![0x00, 0xCB, 0x3F, 0xFF, 0x05, 0x5C, 0x03, 0x5F, 0xC1, 0x05],
                ok(&response),
            )],
        );
        assert_eq!(s.get_certificate(Slot::Authentication).unwrap(), der);
    }

    #[test]
    fn test_get_certificate_compressed() {
        let der = vec![0x30, 0x03, 0x02, 0x01, 0x05];
        let inner = tlv::pack_map(&[
            (TAG_CERTIFICATE, gzip(&der).unwrap()),
            (TAG_CERT_INFO, vec![0x01]),
        ]);
        let response = Tlv::new(TAG_OBJ_DATA, inner).to_bytes();
        let mut s = session(
            [5, 4, 3],
            vec![(
                vec![0x00, 0xCB, 0x3F, 0xFF, 0x05, 0x5C, 0x03, 0x5F, 0xC1, 0x05],
                ok(&response),
            )],
        );
        assert_eq!(s.get_certificate(Slot::Authentication).unwrap(), der);
    }

    #[test]
    fn test_get_certificate_bad_compression() {
        let inner = tlv::pack_map(&[
            (TAG_CERTIFICATE, vec![0x1F, 0x8B, 0x00]),
            (TAG_CERT_INFO, vec![0x01]),
        ]);
        let response = Tlv::new(TAG_OBJ_DATA, inner).to_bytes();
        let mut s = session(
            [5, 4, 3],
            vec![(
                vec![0x00, 0xCB, 0x3F, 0xFF, 0x05, 0x5C, 0x03, 0x5F, 0xC1, 0x05],
                ok(&response),
            )],
        );
        assert!(matches!(
            s.get_certificate(Slot::Authentication),
            Err(Error::BadResponse(_))
        ));
    }

    #[test]
    fn test_put_certificate() {
        let der = vec![0x30, 0x03, 0x02, 0x01, 0x05];
        let object_data = tlv::pack_map(&[
            (TAG_CERTIFICATE, der.clone()),
            (TAG_CERT_INFO, vec![0x00]),
            (TAG_LRC, Vec::new()),
        ]);
        let request = tlv::pack_map(&[
            (TAG_OBJ_ID, object_id::to_bytes(object_id::AUTHENTICATION)),
            (TAG_OBJ_DATA, object_data),
        ]);
        let mut expected = vec![0x00, 0xDB, 0x3F, 0xFF, request.len() as u8];
        expected.extend_from_slice(&request);
        let mut s = session([5, 4, 3], vec![(expected, ok(&[]))]);
        s.put_certificate(Slot::Authentication, &der, false).unwrap();
    }

    #[test]
    fn test_delete_certificate() {
        let mut s = session(
            [5, 4, 3],
            vec![(
                vec![0x00, 0xDB, 0x3F, 0xFF, 0x0A, 0x5C, 0x03, 0x5F, 0xC1, 0x0A, 0x53, 0x00],
                ok(&[]),
            )],
        );
        s.delete_certificate(Slot::Signature).unwrap();
    }

    #[test]
    fn test_attest_key() {
        let der = vec![0x30, 0x03, 0x02, 0x01, 0x05];
        let mut s = session([5, 4, 3], vec![(vec![0x00, 0xF9, 0x9A, 0x00], ok(&der))]);
        assert_eq!(s.attest_key(Slot::Authentication).unwrap(), der);
    }

    #[test]
    fn test_attest_key_errors() {
        let mut s = session([4, 2, 0], vec![]);
        assert!(matches!(
            s.attest_key(Slot::Authentication),
            Err(Error::NotSupported(_))
        ));

        let mut s = session(
            [5, 4, 3],
            vec![(vec![0x00, 0xF9, 0x9A, 0x00], vec![0x6A, 0x80])],
        );
        assert!(matches!(
            s.attest_key(Slot::Authentication),
            Err(Error::BadResponse(_))
        ));
    }

    #[test]
    fn test_signer_sign_ecdsa() {
        let digest = Sha256::digest(b"hello signing");
        let mut expected = vec![0x00, 0x87, 0x11, 0x9A, 0x26, 0x7C, 0x24, 0x82, 0x00, 0x81, 0x20];
        expected.extend_from_slice(&digest);
        let mut response = vec![0x7C, 0x12, 0x82, 0x10];
        response.extend_from_slice(&[0x6B; 16]);
        let mut s = session([5, 4, 3], vec![(expected, ok(&response))]);
        let signature = s
            .signer(Slot::Authentication, KeyType::EccP256)
            .sign(SignatureAlgorithm::EcdsaSha256, b"hello signing")
            .unwrap();
        assert_eq!(signature, vec![0x6B; 16]);
    }

    #[test]
    fn test_signer_decrypt_rsa() {
        let ciphertext = vec![0xC7; 128];
        let request = Tlv::new(
            TAG_DYN_AUTH,
            tlv::pack_map(&[
                (TAG_AUTH_RESPONSE, Vec::new()),
                (TAG_AUTH_CHALLENGE, ciphertext.clone()),
            ]),
        )
        .to_bytes();
        let mut expected = vec![0x00, 0x87, 0x06, 0x9D, request.len() as u8];
        expected.extend_from_slice(&request);

        let mut padded = vec![0x00, 0x02];
        padded.extend_from_slice(&[0x55; 119]);
        padded.push(0x00);
        padded.extend_from_slice(b"secret");
        let response = Tlv::new(
            TAG_DYN_AUTH,
            Tlv::new(TAG_AUTH_RESPONSE, padded).to_bytes(),
        )
        .to_bytes();

        let mut s = session([5, 4, 3], vec![(expected, ok(&response))]);
        let plaintext = s
            .signer(Slot::KeyManagement, KeyType::Rsa1024)
            .decrypt(&ciphertext)
            .unwrap();
        assert_eq!(plaintext.as_slice(), b"secret");
    }

    #[test]
    fn test_signer_rejects_mismatched_scheme() {
        let mut s = session([5, 4, 3], vec![]);
        assert!(matches!(
            s.signer(Slot::Authentication, KeyType::EccP256)
                .sign(SignatureAlgorithm::Ed25519, b"hello"),
            Err(Error::NotSupported(_))
        ));
        assert!(matches!(
            s.signer(Slot::Authentication, KeyType::EccP256)
                .decrypt(&[0x00; 32]),
            Err(Error::NotSupported(_))
        ));
    }
}
