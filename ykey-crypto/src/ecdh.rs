//! P-256 ECDH for PIN/UV auth protocol key agreement
//!
//! The platform generates an ephemeral key pair per encapsulation, exchanges
//! public keys with the authenticator as COSE coordinate pairs, and the
//! shared secret fed to the protocol KDF is the x-coordinate of the ECDH
//! result.

use p256::{elliptic_curve::sec1::ToEncodedPoint, PublicKey, SecretKey};
use rand::rngs::OsRng;

use crate::error::{CryptoError, Result};

/// Ephemeral P-256 key pair for ECDH key agreement
pub struct KeyPair {
    secret: SecretKey,
    public: PublicKey,
}

impl KeyPair {
    /// Generate a new random key pair
    pub fn generate() -> Self {
        let secret = SecretKey::random(&mut OsRng);
        let public = secret.public_key();
        Self { secret, public }
    }

    /// Public key as affine coordinates, as carried in a COSE_Key map
    ///
    /// # Examples
    ///
    /// ```
    /// use ykey_crypto::ecdh::KeyPair;
    ///
    /// let keypair = KeyPair::generate();
    /// let (x, y) = keypair.public_key_coordinates();
    /// assert_eq!(x.len(), 32);
    /// assert_eq!(y.len(), 32);
    /// ```
    pub fn public_key_coordinates(&self) -> ([u8; 32], [u8; 32]) {
        let point = self.public.to_encoded_point(false);
        let mut x = [0u8; 32];
        let mut y = [0u8; 32];
        // An uncompressed point always carries both coordinates
        if let (Some(px), Some(py)) = (point.x(), point.y()) {
            x.copy_from_slice(px);
            y.copy_from_slice(py);
        }
        (x, y)
    }

    /// Compute the shared secret with a peer public key
    ///
    /// The peer key is given in uncompressed SEC1 form (`0x04 || x || y`).
    /// Returns the x-coordinate of the ECDH result.
    pub fn shared_secret(&self, peer_sec1: &[u8]) -> Result<[u8; 32]> {
        let peer =
            PublicKey::from_sec1_bytes(peer_sec1).map_err(|_| CryptoError::InvalidPublicKey)?;
        let shared = p256::ecdh::diffie_hellman(self.secret.to_nonzero_scalar(), peer.as_affine());
        let mut z = [0u8; 32];
        z.copy_from_slice(shared.raw_secret_bytes());
        Ok(z)
    }

    /// Compute the shared secret with a peer given as COSE coordinates
    pub fn shared_secret_from_coordinates(
        &self,
        peer_x: &[u8; 32],
        peer_y: &[u8; 32],
    ) -> Result<[u8; 32]> {
        let mut sec1 = [0u8; 65];
        sec1[0] = 0x04;
        sec1[1..33].copy_from_slice(peer_x);
        sec1[33..].copy_from_slice(peer_y);
        self.shared_secret(&sec1)
    }

    /// Build a key pair from an existing secret scalar
    pub fn from_bytes(secret_bytes: &[u8; 32]) -> Result<Self> {
        let secret = SecretKey::from_bytes(secret_bytes.into())
            .map_err(|_| CryptoError::InvalidPublicKey)?;
        let public = secret.public_key();
        Ok(Self { secret, public })
    }
}
