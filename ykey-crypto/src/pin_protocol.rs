//! PIN/UV authentication protocols One and Two
//!
//! Protocol One derives a single 32-byte secret (SHA-256 of the ECDH
//! x-coordinate), encrypts with AES-256-CBC under a zero IV and
//! authenticates with HMAC-SHA-256 truncated to 16 bytes.
//!
//! Protocol Two derives separate HMAC and AES keys with HKDF-SHA-256,
//! prepends a random IV to every ciphertext and uses the full 32-byte HMAC.
//!
//! Neither protocol pads: callers supply block-aligned plaintext (PINs are
//! padded to 64 bytes before encryption).

use aes::Aes256;
use cbc::cipher::{block_padding::NoPadding, BlockDecryptMut, BlockEncryptMut, KeyIvInit};
use cbc::{Decryptor, Encryptor};
use hkdf::Hkdf;
use hmac::{Hmac, Mac};
use rand::Rng;
use sha2::{Digest, Sha256};
use zeroize::Zeroizing;

use crate::ecdh::KeyPair;
use crate::error::{CryptoError, Result};

type HmacSha256 = Hmac<Sha256>;
type Aes256CbcEnc = Encryptor<Aes256>;
type Aes256CbcDec = Decryptor<Aes256>;

const BLOCK_SIZE: usize = 16;

/// One side of a PIN/UV auth protocol session
///
/// The session secret produced by [`kdf`](Self::kdf) (or
/// [`encapsulate`](Self::encapsulate)) is passed back into the other
/// methods as `key`.
pub trait PinUvAuthProtocol: Send + Sync {
    /// Protocol version number as used on the wire
    fn version(&self) -> u64;

    /// Derive the session secret from the ECDH x-coordinate
    fn kdf(&self, z: &[u8; 32]) -> Zeroizing<Vec<u8>>;

    /// Encrypt block-aligned plaintext under the session secret
    fn encrypt(&self, key: &[u8], plaintext: &[u8]) -> Result<Vec<u8>>;

    /// Decrypt a ciphertext produced by [`encrypt`](Self::encrypt)
    fn decrypt(&self, key: &[u8], ciphertext: &[u8]) -> Result<Vec<u8>>;

    /// Compute the pinUvAuthParam over a message
    fn authenticate(&self, key: &[u8], message: &[u8]) -> Result<Vec<u8>>;

    /// Run key agreement against the authenticator's public key
    ///
    /// Generates an ephemeral platform key pair, returns its coordinates
    /// for the request's keyAgreement map together with the derived session
    /// secret.
    fn encapsulate(
        &self,
        peer_x: &[u8; 32],
        peer_y: &[u8; 32],
    ) -> Result<(([u8; 32], [u8; 32]), Zeroizing<Vec<u8>>)> {
        let keypair = KeyPair::generate();
        let z = Zeroizing::new(keypair.shared_secret_from_coordinates(peer_x, peer_y)?);
        let secret = self.kdf(&z);
        Ok((keypair.public_key_coordinates(), secret))
    }
}

/// PIN/UV auth protocol One
pub struct PinProtocolOne;

impl PinUvAuthProtocol for PinProtocolOne {
    fn version(&self) -> u64 {
        1
    }

    fn kdf(&self, z: &[u8; 32]) -> Zeroizing<Vec<u8>> {
        Zeroizing::new(Sha256::digest(z).to_vec())
    }

    fn encrypt(&self, key: &[u8], plaintext: &[u8]) -> Result<Vec<u8>> {
        aes256_cbc_encrypt(expect_len(key, 32)?, &[0u8; BLOCK_SIZE], plaintext)
    }

    fn decrypt(&self, key: &[u8], ciphertext: &[u8]) -> Result<Vec<u8>> {
        aes256_cbc_decrypt(expect_len(key, 32)?, &[0u8; BLOCK_SIZE], ciphertext)
    }

    fn authenticate(&self, key: &[u8], message: &[u8]) -> Result<Vec<u8>> {
        Ok(hmac_sha256(key, message)[..16].to_vec())
    }
}

/// PIN/UV auth protocol Two
///
/// The 64-byte session secret is the HMAC key followed by the AES key.
pub struct PinProtocolTwo;

impl PinUvAuthProtocol for PinProtocolTwo {
    fn version(&self) -> u64 {
        2
    }

    fn kdf(&self, z: &[u8; 32]) -> Zeroizing<Vec<u8>> {
        let mut secret = Zeroizing::new(vec![0u8; 64]);
        let hkdf = Hkdf::<Sha256>::new(Some(&[0u8; 32]), z);
        hkdf.expand(b"CTAP2 HMAC key", &mut secret[..32])
            .expect("32 bytes is a valid HKDF-SHA-256 output length");
        hkdf.expand(b"CTAP2 AES key", &mut secret[32..])
            .expect("32 bytes is a valid HKDF-SHA-256 output length");
        secret
    }

    fn encrypt(&self, key: &[u8], plaintext: &[u8]) -> Result<Vec<u8>> {
        let key = expect_len(key, 64)?;
        let mut iv = [0u8; BLOCK_SIZE];
        rand::thread_rng().fill(&mut iv);
        let mut out = iv.to_vec();
        out.extend_from_slice(&aes256_cbc_encrypt(&key[32..], &iv, plaintext)?);
        Ok(out)
    }

    fn decrypt(&self, key: &[u8], ciphertext: &[u8]) -> Result<Vec<u8>> {
        let key = expect_len(key, 64)?;
        if ciphertext.len() < BLOCK_SIZE {
            return Err(CryptoError::DecryptionFailed);
        }
        let mut iv = [0u8; BLOCK_SIZE];
        iv.copy_from_slice(&ciphertext[..BLOCK_SIZE]);
        aes256_cbc_decrypt(&key[32..], &iv, &ciphertext[BLOCK_SIZE..])
    }

    fn authenticate(&self, key: &[u8], message: &[u8]) -> Result<Vec<u8>> {
        let key = expect_len(key, 64)?;
        Ok(hmac_sha256(&key[..32], message).to_vec())
    }
}

fn expect_len(key: &[u8], expected: usize) -> Result<&[u8]> {
    if key.len() == expected {
        Ok(key)
    } else {
        Err(CryptoError::InvalidKeyLength {
            expected,
            actual: key.len(),
        })
    }
}

fn aes256_cbc_encrypt(key: &[u8], iv: &[u8; BLOCK_SIZE], plaintext: &[u8]) -> Result<Vec<u8>> {
    if plaintext.len() % BLOCK_SIZE != 0 {
        return Err(CryptoError::UnalignedData);
    }
    let mut buffer = plaintext.to_vec();
    Aes256CbcEnc::new_from_slices(key, iv)
        .map_err(|_| CryptoError::InvalidKeyLength {
            expected: 32,
            actual: key.len(),
        })?
        .encrypt_padded_mut::<NoPadding>(&mut buffer, plaintext.len())
        .map_err(|_| CryptoError::EncryptionFailed)?;
    Ok(buffer)
}

fn aes256_cbc_decrypt(key: &[u8], iv: &[u8; BLOCK_SIZE], ciphertext: &[u8]) -> Result<Vec<u8>> {
    if ciphertext.len() % BLOCK_SIZE != 0 {
        return Err(CryptoError::UnalignedData);
    }
    let mut buffer = ciphertext.to_vec();
    Aes256CbcDec::new_from_slices(key, iv)
        .map_err(|_| CryptoError::InvalidKeyLength {
            expected: 32,
            actual: key.len(),
        })?
        .decrypt_padded_mut::<NoPadding>(&mut buffer)
        .map_err(|_| CryptoError::DecryptionFailed)?;
    Ok(buffer)
}

fn hmac_sha256(key: &[u8], message: &[u8]) -> [u8; 32] {
    let mut mac = HmacSha256::new_from_slice(key).expect("HMAC accepts any key size");
    mac.update(message);
    mac.finalize().into_bytes().into()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_one_kdf_known_value() {
        // SHA-256 of 32 zero bytes
        let secret = PinProtocolOne.kdf(&[0u8; 32]);
        assert_eq!(
            secret.to_vec(),
            hex::decode("66687aadf862bd776c8fc18b8e9f8e20089714856ee233b3902a591d0d5f2925")
                .unwrap()
        );
    }

    #[test]
    fn test_one_encrypt_known_value() {
        // NIST SP 800-38A F.1.5 ECB-AES256 block 1; CBC with a zero IV
        // matches ECB for the first block
        let key = hex::decode("603deb1015ca71be2b73aef0857d77811f352c073b6108d72d9810a30914dff4")
            .unwrap();
        let plaintext = hex::decode("6bc1bee22e409f96e93d7e117393172a").unwrap();
        let ciphertext = PinProtocolOne.encrypt(&key, &plaintext).unwrap();
        assert_eq!(
            ciphertext,
            hex::decode("f3eed1bdb5d2a03c064b5a7e3db181f8").unwrap()
        );
    }

    #[test]
    fn test_one_authenticate_known_value() {
        // RFC 4231 test case 2, truncated to 16 bytes
        let mac = PinProtocolOne
            .authenticate(b"Jefe", b"what do ya want for nothing?")
            .unwrap();
        assert_eq!(
            mac,
            hex::decode("5bdcc146bf60754e6a042426089575c7").unwrap()
        );
    }

    #[test]
    fn test_one_round_trip() {
        let key = [0x42u8; 32];
        let plaintext = [0x11u8; 64];
        let ciphertext = PinProtocolOne.encrypt(&key, &plaintext).unwrap();
        assert_eq!(ciphertext.len(), 64);
        let decrypted = PinProtocolOne.decrypt(&key, &ciphertext).unwrap();
        assert_eq!(decrypted, plaintext);
    }

    #[test]
    fn test_one_rejects_unaligned() {
        let key = [0x42u8; 32];
        assert!(matches!(
            PinProtocolOne.encrypt(&key, &[0u8; 15]),
            Err(CryptoError::UnalignedData)
        ));
        assert!(matches!(
            PinProtocolOne.decrypt(&key, &[0u8; 17]),
            Err(CryptoError::UnalignedData)
        ));
    }

    #[test]
    fn test_one_rejects_wrong_key_length() {
        assert!(matches!(
            PinProtocolOne.encrypt(&[0u8; 16], &[0u8; 16]),
            Err(CryptoError::InvalidKeyLength {
                expected: 32,
                actual: 16
            })
        ));
    }

    #[test]
    fn test_two_kdf_splits_keys() {
        let secret = PinProtocolTwo.kdf(&[0x55u8; 32]);
        assert_eq!(secret.len(), 64);
        // HMAC and AES halves must differ
        assert_ne!(secret[..32], secret[32..]);
        // Deterministic
        assert_eq!(secret.to_vec(), PinProtocolTwo.kdf(&[0x55u8; 32]).to_vec());
    }

    #[test]
    fn test_two_round_trip() {
        let key = PinProtocolTwo.kdf(&[0x55u8; 32]);
        let plaintext = [0x11u8; 64];
        let ciphertext = PinProtocolTwo.encrypt(&key, &plaintext).unwrap();
        assert_eq!(ciphertext.len(), 16 + 64);
        let decrypted = PinProtocolTwo.decrypt(&key, &ciphertext).unwrap();
        assert_eq!(decrypted, plaintext);
    }

    #[test]
    fn test_two_uses_random_iv() {
        let key = PinProtocolTwo.kdf(&[0x55u8; 32]);
        let a = PinProtocolTwo.encrypt(&key, &[0u8; 16]).unwrap();
        let b = PinProtocolTwo.encrypt(&key, &[0u8; 16]).unwrap();
        assert_ne!(a[..16], b[..16]);
    }

    #[test]
    fn test_two_authenticate_full_length() {
        let key = PinProtocolTwo.kdf(&[0x55u8; 32]);
        let mac = PinProtocolTwo.authenticate(&key, b"message").unwrap();
        assert_eq!(mac.len(), 32);
    }

    #[test]
    fn test_two_rejects_short_ciphertext() {
        let key = PinProtocolTwo.kdf(&[0x55u8; 32]);
        assert!(PinProtocolTwo.decrypt(&key, &[0u8; 8]).is_err());
    }

    #[test]
    fn test_encapsulate_agrees_with_peer() {
        for protocol in [
            &PinProtocolOne as &dyn PinUvAuthProtocol,
            &PinProtocolTwo as &dyn PinUvAuthProtocol,
        ] {
            let device = KeyPair::generate();
            let (dx, dy) = device.public_key_coordinates();
            let ((px, py), platform_secret) = protocol.encapsulate(&dx, &dy).unwrap();

            let z = device.shared_secret_from_coordinates(&px, &py).unwrap();
            let device_secret = protocol.kdf(&z);
            assert_eq!(platform_secret.to_vec(), device_secret.to_vec());
        }
    }
}
