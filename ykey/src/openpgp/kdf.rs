//! PIN transformation via the KDF data object
//!
//! OpenPGP cards can demand that the host derive PINs before sending them
//! (data object `0xF9`). Factory devices use no derivation; a provisioned
//! card may require iterated and salted S2K from RFC 4880, in which case
//! every PIN-carrying command gets the derived bytes instead of the UTF-8
//! text.

use rand::Rng;
use sha2::{Digest, Sha256, Sha512};
use zeroize::Zeroizing;

use ykey_core::error::{Error, Result};
use ykey_core::tlv::{self, Tlv};

use super::{Pw, DEFAULT_ADMIN_PIN, DEFAULT_USER_PIN};

const TAG_ALGORITHM: u16 = 0x81;
const TAG_HASH: u16 = 0x82;
const TAG_ITERATIONS: u16 = 0x83;
const TAG_SALT_USER: u16 = 0x84;
const TAG_SALT_RESET: u16 = 0x85;
const TAG_SALT_ADMIN: u16 = 0x86;
const TAG_INITIAL_HASH_USER: u16 = 0x87;
const TAG_INITIAL_HASH_ADMIN: u16 = 0x88;

const ALGORITHM_NONE: u8 = 0x00;
const ALGORITHM_ITER_SALTED_S2K: u8 = 0x03;

const SALT_LEN: usize = 8;

/// Hash algorithms usable with iterated and salted S2K
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum KdfHash {
    Sha256,
    Sha512,
}

impl KdfHash {
    fn value(self) -> u8 {
        match self {
            KdfHash::Sha256 => 0x08,
            KdfHash::Sha512 => 0x0A,
        }
    }

    fn from_value(value: u8) -> Result<Self> {
        match value {
            0x08 => Ok(KdfHash::Sha256),
            0x0A => Ok(KdfHash::Sha512),
            other => Err(Error::bad_response(format!(
                "unsupported KDF hash algorithm 0x{:02X}",
                other
            ))),
        }
    }
}

/// How PINs are transformed before they go to the card
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Kdf {
    /// PINs are sent as their plain UTF-8 bytes
    None,
    /// Iterated and salted S2K (RFC 4880, section 3.7.1.3)
    IterSaltedS2k {
        hash: KdfHash,
        /// Total number of bytes fed to the digest, not a round count
        iterations: u32,
        salt_user: Vec<u8>,
        salt_reset: Option<Vec<u8>>,
        salt_admin: Option<Vec<u8>>,
        initial_hash_user: Option<Vec<u8>>,
        initial_hash_admin: Option<Vec<u8>>,
    },
}

impl Kdf {
    /// Decode the KDF data object
    ///
    /// Anything other than iterated+salted S2K means no derivation.
    pub fn parse(data: &[u8]) -> Result<Self> {
        let values = tlv::parse_map(data)?;
        let algorithm = values
            .get(&TAG_ALGORITHM)
            .and_then(|value| value.first().copied())
            .unwrap_or(ALGORITHM_NONE);
        if algorithm != ALGORITHM_ITER_SALTED_S2K {
            return Ok(Kdf::None);
        }

        let hash = values
            .get(&TAG_HASH)
            .and_then(|value| value.first().copied())
            .ok_or_else(|| Error::bad_response("KDF data object is missing the hash algorithm"))?;
        let iterations = values
            .get(&TAG_ITERATIONS)
            .filter(|value| value.len() == 4)
            .map(|value| u32::from_be_bytes([value[0], value[1], value[2], value[3]]))
            .ok_or_else(|| Error::bad_response("KDF data object is missing the iteration count"))?;
        let salt_user = values
            .get(&TAG_SALT_USER)
            .cloned()
            .ok_or_else(|| Error::bad_response("KDF data object is missing the salt"))?;

        Ok(Kdf::IterSaltedS2k {
            hash: KdfHash::from_value(hash)?,
            iterations,
            salt_user,
            salt_reset: values.get(&TAG_SALT_RESET).cloned(),
            salt_admin: values.get(&TAG_SALT_ADMIN).cloned(),
            initial_hash_user: values.get(&TAG_INITIAL_HASH_USER).cloned(),
            initial_hash_admin: values.get(&TAG_INITIAL_HASH_ADMIN).cloned(),
        })
    }

    /// Create a fresh iterated+salted S2K scheme with random salts
    ///
    /// The initial hashes are derived from the default PINs, so writing
    /// the result to a freshly reset card keeps the defaults working.
    pub fn iter_salted_s2k(hash: KdfHash, iterations: u32) -> Self {
        let mut rng = rand::thread_rng();
        let mut salt_user = vec![0u8; SALT_LEN];
        let mut salt_reset = vec![0u8; SALT_LEN];
        let mut salt_admin = vec![0u8; SALT_LEN];
        rng.fill(salt_user.as_mut_slice());
        rng.fill(salt_reset.as_mut_slice());
        rng.fill(salt_admin.as_mut_slice());

        let initial_hash_user = derive(hash, iterations, &salt_user, DEFAULT_USER_PIN).to_vec();
        let initial_hash_admin = derive(hash, iterations, &salt_admin, DEFAULT_ADMIN_PIN).to_vec();
        Kdf::IterSaltedS2k {
            hash,
            iterations,
            salt_user,
            salt_reset: Some(salt_reset),
            salt_admin: Some(salt_admin),
            initial_hash_user: Some(initial_hash_user),
            initial_hash_admin: Some(initial_hash_admin),
        }
    }

    /// Encode for writing to the KDF data object
    pub fn to_bytes(&self) -> Vec<u8> {
        match self {
            Kdf::None => Tlv::new(TAG_ALGORITHM, vec![ALGORITHM_NONE]).to_bytes(),
            Kdf::IterSaltedS2k {
                hash,
                iterations,
                salt_user,
                salt_reset,
                salt_admin,
                initial_hash_user,
                initial_hash_admin,
            } => {
                let mut tlvs = vec![
                    Tlv::new(TAG_ALGORITHM, vec![ALGORITHM_ITER_SALTED_S2K]),
                    Tlv::new(TAG_HASH, vec![hash.value()]),
                    Tlv::new(TAG_ITERATIONS, iterations.to_be_bytes().to_vec()),
                    Tlv::new(TAG_SALT_USER, salt_user.clone()),
                ];
                for (tag, value) in [
                    (TAG_SALT_RESET, salt_reset),
                    (TAG_SALT_ADMIN, salt_admin),
                    (TAG_INITIAL_HASH_USER, initial_hash_user),
                    (TAG_INITIAL_HASH_ADMIN, initial_hash_admin),
                ] {
                    if let Some(value) = value {
                        tlvs.push(Tlv::new(tag, value.clone()));
                    }
                }
                tlv::pack_list(&tlvs)
            }
        }
    }

    /// Transform a PIN into the bytes the card expects
    pub fn process(&self, pw: Pw, pin: &str) -> Zeroizing<Vec<u8>> {
        match self {
            Kdf::None => Zeroizing::new(pin.as_bytes().to_vec()),
            Kdf::IterSaltedS2k {
                hash,
                iterations,
                salt_user,
                salt_reset,
                salt_admin,
                ..
            } => {
                // The resetting code and Admin PIN fall back to the User
                // salt when the card reports no dedicated one
                let salt = match pw {
                    Pw::User => salt_user.as_slice(),
                    Pw::Reset => salt_reset.as_deref().unwrap_or(salt_user),
                    Pw::Admin => salt_admin.as_deref().unwrap_or(salt_user),
                };
                derive(*hash, *iterations, salt, pin)
            }
        }
    }
}

fn derive(hash: KdfHash, iterations: u32, salt: &[u8], pin: &str) -> Zeroizing<Vec<u8>> {
    let mut data = Zeroizing::new(salt.to_vec());
    data.extend_from_slice(pin.as_bytes());
    match hash {
        KdfHash::Sha256 => s2k_digest::<Sha256>(iterations, &data),
        KdfHash::Sha512 => s2k_digest::<Sha512>(iterations, &data),
    }
}

/// `iterations` counts bytes, not rounds: `salt || pin` is fed repeatedly
/// into a single digest until that many bytes went in
fn s2k_digest<D: Digest>(iterations: u32, data: &[u8]) -> Zeroizing<Vec<u8>> {
    let mut digest = D::new();
    if data.is_empty() {
        return Zeroizing::new(digest.finalize().to_vec());
    }
    for _ in 0..iterations as usize / data.len() {
        digest.update(data);
    }
    digest.update(&data[..iterations as usize % data.len()]);
    Zeroizing::new(digest.finalize().to_vec())
}
