//! Management-key block ciphers for the PIV witness/challenge exchange
//!
//! Mutual authentication against the PIV management key exchanges single
//! cipher blocks: the device proves knowledge by encrypting a witness, the
//! host by encrypting a challenge. Firmware 5.4 and later also accept AES
//! management keys; earlier devices use 3DES only.

use aes::cipher::consts::U16;
use aes::cipher::{BlockDecrypt, BlockEncrypt, BlockSizeUser, KeyInit};
use aes::{Aes128, Aes192, Aes256};
use des::TdesEde3;
use subtle::ConstantTimeEq;
use zeroize::Zeroize;

use crate::error::{CryptoError, Result};

/// Weak and semi-weak DES keys, with odd parity
const WEAK_DES_KEYS: [[u8; 8]; 16] = [
    [0x01, 0x01, 0x01, 0x01, 0x01, 0x01, 0x01, 0x01],
    [0xFE, 0xFE, 0xFE, 0xFE, 0xFE, 0xFE, 0xFE, 0xFE],
    [0xE0, 0xE0, 0xE0, 0xE0, 0xF1, 0xF1, 0xF1, 0xF1],
    [0x1F, 0x1F, 0x1F, 0x1F, 0x0E, 0x0E, 0x0E, 0x0E],
    [0x01, 0x1F, 0x01, 0x1F, 0x01, 0x0E, 0x01, 0x0E],
    [0x1F, 0x01, 0x1F, 0x01, 0x0E, 0x01, 0x0E, 0x01],
    [0x01, 0xE0, 0x01, 0xE0, 0x01, 0xF1, 0x01, 0xF1],
    [0xE0, 0x01, 0xE0, 0x01, 0xF1, 0x01, 0xF1, 0x01],
    [0x01, 0xFE, 0x01, 0xFE, 0x01, 0xFE, 0x01, 0xFE],
    [0xFE, 0x01, 0xFE, 0x01, 0xFE, 0x01, 0xFE, 0x01],
    [0x1F, 0xE0, 0x1F, 0xE0, 0x0E, 0xF1, 0x0E, 0xF1],
    [0xE0, 0x1F, 0xE0, 0x1F, 0xF1, 0x0E, 0xF1, 0x0E],
    [0x1F, 0xFE, 0x1F, 0xFE, 0x0E, 0xFE, 0x0E, 0xFE],
    [0xFE, 0x1F, 0xFE, 0x1F, 0xFE, 0x0E, 0xFE, 0x0E],
    [0xE0, 0xFE, 0xE0, 0xFE, 0xF1, 0xFE, 0xF1, 0xFE],
    [0xFE, 0xE0, 0xFE, 0xE0, 0xFE, 0xF1, 0xFE, 0xF1],
];

/// Cipher used by a PIV management key
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MgmKeyAlgorithm {
    ThreeDes,
    Aes128,
    Aes192,
    Aes256,
}

impl MgmKeyAlgorithm {
    pub fn key_len(self) -> usize {
        match self {
            MgmKeyAlgorithm::ThreeDes | MgmKeyAlgorithm::Aes192 => 24,
            MgmKeyAlgorithm::Aes128 => 16,
            MgmKeyAlgorithm::Aes256 => 32,
        }
    }

    /// Width of a witness or challenge block
    pub fn challenge_len(self) -> usize {
        match self {
            MgmKeyAlgorithm::ThreeDes => 8,
            _ => 16,
        }
    }
}

enum MgmKeyInner {
    ThreeDes([u8; 24]),
    Aes128([u8; 16]),
    Aes192([u8; 24]),
    Aes256([u8; 32]),
}

/// A PIV management key
pub struct MgmKey(MgmKeyInner);

impl MgmKey {
    /// Build a management key, validating length and rejecting weak 3DES keys
    pub fn new(algorithm: MgmKeyAlgorithm, bytes: &[u8]) -> Result<Self> {
        if bytes.len() != algorithm.key_len() {
            return Err(CryptoError::InvalidKeyLength {
                expected: algorithm.key_len(),
                actual: bytes.len(),
            });
        }
        let inner = match algorithm {
            MgmKeyAlgorithm::ThreeDes => {
                let mut key = [0u8; 24];
                key.copy_from_slice(bytes);
                if is_weak_key(&key) {
                    return Err(CryptoError::WeakKey);
                }
                MgmKeyInner::ThreeDes(key)
            }
            MgmKeyAlgorithm::Aes128 => {
                let mut key = [0u8; 16];
                key.copy_from_slice(bytes);
                MgmKeyInner::Aes128(key)
            }
            MgmKeyAlgorithm::Aes192 => {
                let mut key = [0u8; 24];
                key.copy_from_slice(bytes);
                MgmKeyInner::Aes192(key)
            }
            MgmKeyAlgorithm::Aes256 => {
                let mut key = [0u8; 32];
                key.copy_from_slice(bytes);
                MgmKeyInner::Aes256(key)
            }
        };
        Ok(Self(inner))
    }

    pub fn algorithm(&self) -> MgmKeyAlgorithm {
        match self.0 {
            MgmKeyInner::ThreeDes(_) => MgmKeyAlgorithm::ThreeDes,
            MgmKeyInner::Aes128(_) => MgmKeyAlgorithm::Aes128,
            MgmKeyInner::Aes192(_) => MgmKeyAlgorithm::Aes192,
            MgmKeyInner::Aes256(_) => MgmKeyAlgorithm::Aes256,
        }
    }

    /// Encrypt one challenge block
    pub fn encrypt_block(&self, block: &[u8]) -> Result<Vec<u8>> {
        self.cipher_block(block, true)
    }

    /// Decrypt one witness block
    pub fn decrypt_block(&self, block: &[u8]) -> Result<Vec<u8>> {
        self.cipher_block(block, false)
    }

    /// Encrypt `challenge` and compare it to a device response in constant time
    pub fn verify_challenge(&self, challenge: &[u8], response: &[u8]) -> Result<bool> {
        let expected = self.encrypt_block(challenge)?;
        Ok(bool::from(expected.as_slice().ct_eq(response)))
    }

    fn cipher_block(&self, block: &[u8], encrypt: bool) -> Result<Vec<u8>> {
        let expected = self.algorithm().challenge_len();
        if block.len() != expected {
            return Err(CryptoError::InvalidBlockLength {
                expected,
                actual: block.len(),
            });
        }
        match &self.0 {
            MgmKeyInner::ThreeDes(key) => {
                let mut output = [0u8; 8];
                output.copy_from_slice(block);
                let cipher = TdesEde3::new(key.into());
                if encrypt {
                    cipher.encrypt_block((&mut output).into());
                } else {
                    cipher.decrypt_block((&mut output).into());
                }
                Ok(output.to_vec())
            }
            MgmKeyInner::Aes128(key) => {
                Ok(aes_block(&Aes128::new(key.into()), block, encrypt))
            }
            MgmKeyInner::Aes192(key) => {
                Ok(aes_block(&Aes192::new(key.into()), block, encrypt))
            }
            MgmKeyInner::Aes256(key) => {
                Ok(aes_block(&Aes256::new(key.into()), block, encrypt))
            }
        }
    }
}

fn aes_block<C: BlockEncrypt + BlockDecrypt + BlockSizeUser<BlockSize = U16>>(
    cipher: &C,
    block: &[u8],
    encrypt: bool,
) -> Vec<u8> {
    let mut output = [0u8; 16];
    output.copy_from_slice(block);
    if encrypt {
        cipher.encrypt_block((&mut output).into());
    } else {
        cipher.decrypt_block((&mut output).into());
    }
    output.to_vec()
}

impl Drop for MgmKey {
    fn drop(&mut self) {
        match &mut self.0 {
            MgmKeyInner::ThreeDes(key) | MgmKeyInner::Aes192(key) => key.zeroize(),
            MgmKeyInner::Aes128(key) => key.zeroize(),
            MgmKeyInner::Aes256(key) => key.zeroize(),
        }
    }
}

/// Default 3DES management key configured on YubiKeys out of the box
impl Default for MgmKey {
    fn default() -> Self {
        MgmKey(MgmKeyInner::ThreeDes([
            1, 2, 3, 4, 5, 6, 7, 8, 1, 2, 3, 4, 5, 6, 7, 8, 1, 2, 3, 4, 5, 6, 7, 8,
        ]))
    }
}

/// Check each DES subkey against the weak-key table, after setting odd parity
fn is_weak_key(key: &[u8; 24]) -> bool {
    let mut adjusted = [0u8; 24];
    for (out, byte) in adjusted.iter_mut().zip(key.iter()) {
        let masked = byte & 0xFE;
        *out = if masked.count_ones() % 2 == 0 {
            masked | 1
        } else {
            masked
        };
    }
    adjusted
        .chunks(8)
        .any(|subkey| WEAK_DES_KEYS.iter().any(|weak| weak == subkey))
}
