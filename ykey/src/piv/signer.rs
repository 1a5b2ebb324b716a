//! High-level signing and decryption on a PIV key slot
//!
//! [`PivSession::raw_sign_or_decrypt`](super::PivSession::raw_sign_or_decrypt)
//! operates on pre-padded payloads; this module supplies the message digest
//! and padding schemes the device itself does not implement.

use sha2::{Digest, Sha256, Sha384, Sha512};
use zeroize::Zeroizing;

use ykey_core::error::{Error, Result};
use ykey_transport::connection::SmartCardConnection;

use super::{KeyType, PivSession, Slot};

/// Signature schemes supported by [`PivSigner`]
///
/// RSA uses PKCS#1 v1.5; ECDSA signs the hash of the message with the
/// digest truncated to the curve size where needed. Ed25519 signs the raw
/// message as the device hashes internally.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SignatureAlgorithm {
    EcdsaSha256,
    EcdsaSha384,
    EcdsaSha512,
    Ed25519,
    RsaPkcs1v15Sha256,
    RsaPkcs1v15Sha384,
    RsaPkcs1v15Sha512,
}

const DIGEST_INFO_SHA256: [u8; 19] = [
    0x30, 0x31, 0x30, 0x0D, 0x06, 0x09, 0x60, 0x86, 0x48, 0x01, 0x65, 0x03, 0x04, 0x02, 0x01,
    0x05, 0x00, 0x04, 0x20,
];
const DIGEST_INFO_SHA384: [u8; 19] = [
    0x30, 0x41, 0x30, 0x0D, 0x06, 0x09, 0x60, 0x86, 0x48, 0x01, 0x65, 0x03, 0x04, 0x02, 0x02,
    0x05, 0x00, 0x04, 0x30,
];
const DIGEST_INFO_SHA512: [u8; 19] = [
    0x30, 0x51, 0x30, 0x0D, 0x06, 0x09, 0x60, 0x86, 0x48, 0x01, 0x65, 0x03, 0x04, 0x02, 0x03,
    0x05, 0x00, 0x04, 0x40,
];

/// Signing and decryption handle bound to one slot and key type
///
/// Created with [`PivSession::signer`](super::PivSession::signer). The key
/// type must match the key actually stored in the slot; use
/// [`slot_metadata`](super::PivSession::slot_metadata) to discover it on
/// firmware 5.3 and later.
pub struct PivSigner<'a, C: SmartCardConnection> {
    session: &'a mut PivSession<C>,
    slot: Slot,
    key_type: KeyType,
}

impl<'a, C: SmartCardConnection> PivSigner<'a, C> {
    pub(crate) fn new(session: &'a mut PivSession<C>, slot: Slot, key_type: KeyType) -> Self {
        Self {
            session,
            slot,
            key_type,
        }
    }

    pub fn slot(&self) -> Slot {
        self.slot
    }

    pub fn key_type(&self) -> KeyType {
        self.key_type
    }

    /// Sign a message, padding it as the scheme requires
    ///
    /// The PIN must be verified first unless the slot's PIN policy waives
    /// it, and a touch may be required depending on the touch policy.
    pub fn sign(&mut self, algorithm: SignatureAlgorithm, message: &[u8]) -> Result<Vec<u8>> {
        let payload = pad_message(self.key_type, algorithm, message)?;
        self.session
            .raw_sign_or_decrypt(self.slot, self.key_type, &payload)
    }

    /// Decrypt an RSA PKCS#1 v1.5 ciphertext
    pub fn decrypt(&mut self, ciphertext: &[u8]) -> Result<Zeroizing<Vec<u8>>> {
        if !self.key_type.is_rsa() {
            return Err(Error::NotSupported(
                "decryption requires an RSA key".into(),
            ));
        }
        let padded = Zeroizing::new(self.session.raw_sign_or_decrypt(
            self.slot,
            self.key_type,
            ciphertext,
        )?);
        unpad_pkcs1(&padded).map(Zeroizing::new)
    }
}

fn pad_message(
    key_type: KeyType,
    algorithm: SignatureAlgorithm,
    message: &[u8],
) -> Result<Vec<u8>> {
    match algorithm {
        SignatureAlgorithm::Ed25519 if key_type == KeyType::Ed25519 => Ok(message.to_vec()),
        SignatureAlgorithm::EcdsaSha256 if is_ecdsa_key(key_type) => {
            Ok(Sha256::digest(message).to_vec())
        }
        SignatureAlgorithm::EcdsaSha384 if is_ecdsa_key(key_type) => {
            Ok(Sha384::digest(message).to_vec())
        }
        SignatureAlgorithm::EcdsaSha512 if is_ecdsa_key(key_type) => {
            Ok(Sha512::digest(message).to_vec())
        }
        SignatureAlgorithm::RsaPkcs1v15Sha256 if key_type.is_rsa() => emsa_pkcs1_v1_5(
            &Sha256::digest(message),
            &DIGEST_INFO_SHA256,
            key_type.bit_length() / 8,
        ),
        SignatureAlgorithm::RsaPkcs1v15Sha384 if key_type.is_rsa() => emsa_pkcs1_v1_5(
            &Sha384::digest(message),
            &DIGEST_INFO_SHA384,
            key_type.bit_length() / 8,
        ),
        SignatureAlgorithm::RsaPkcs1v15Sha512 if key_type.is_rsa() => emsa_pkcs1_v1_5(
            &Sha512::digest(message),
            &DIGEST_INFO_SHA512,
            key_type.bit_length() / 8,
        ),
        _ => Err(Error::NotSupported(format!(
            "{:?} cannot sign with a {:?} key",
            algorithm, key_type
        ))),
    }
}

fn is_ecdsa_key(key_type: KeyType) -> bool {
    matches!(key_type, KeyType::EccP256 | KeyType::EccP384)
}

/// EMSA-PKCS1-v1_5 encoding per RFC 8017 section 9.2
fn emsa_pkcs1_v1_5(digest: &[u8], digest_info: &[u8], em_len: usize) -> Result<Vec<u8>> {
    let t_len = digest_info.len() + digest.len();
    if em_len < t_len + 11 {
        return Err(Error::NotSupported(
            "message digest too large for the key size".into(),
        ));
    }
    let mut em = vec![0xFF; em_len];
    em[0] = 0x00;
    em[1] = 0x01;
    em[em_len - t_len - 1] = 0x00;
    em[em_len - t_len..em_len - digest.len()].copy_from_slice(digest_info);
    em[em_len - digest.len()..].copy_from_slice(digest);
    Ok(em)
}

fn unpad_pkcs1(padded: &[u8]) -> Result<Vec<u8>> {
    if padded.len() < 11 || padded[0] != 0x00 || padded[1] != 0x02 {
        return Err(Error::bad_response("invalid PKCS#1 v1.5 padding"));
    }
    let separator = padded[2..]
        .iter()
        .position(|&byte| byte == 0)
        .ok_or_else(|| Error::bad_response("invalid PKCS#1 v1.5 padding"))?;
    // The padding string must be at least 8 bytes
    if separator < 8 {
        return Err(Error::bad_response("invalid PKCS#1 v1.5 padding"));
    }
    Ok(padded[separator + 3..].to_vec())
}
