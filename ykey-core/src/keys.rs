//! Raw key material passed to and from YubiKey applications
//!
//! Private values hold secrets that are zeroed on `destroy()` and on drop.
//! Zeroization on every exit path is a hard requirement for this SDK, not
//! cleanup.

use zeroize::Zeroize;

/// Elliptic curves supported across the PIV and OpenPGP applications
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EllipticCurveValues {
    Secp256r1,
    Secp384r1,
    Secp521r1,
    Ed25519,
    X25519,
}

impl EllipticCurveValues {
    pub fn bit_length(&self) -> usize {
        match self {
            EllipticCurveValues::Secp256r1 => 256,
            EllipticCurveValues::Secp384r1 => 384,
            EllipticCurveValues::Secp521r1 => 521,
            EllipticCurveValues::Ed25519 => 256,
            EllipticCurveValues::X25519 => 256,
        }
    }

    /// DER-encoded object identifier, without tag and length
    ///
    /// OpenPGP algorithm attributes carry curves in this form.
    pub fn oid(&self) -> &'static [u8] {
        match self {
            EllipticCurveValues::Secp256r1 => &[0x2A, 0x86, 0x48, 0xCE, 0x3D, 0x03, 0x01, 0x07],
            EllipticCurveValues::Secp384r1 => &[0x2B, 0x81, 0x04, 0x00, 0x22],
            EllipticCurveValues::Secp521r1 => &[0x2B, 0x81, 0x04, 0x00, 0x23],
            EllipticCurveValues::Ed25519 => {
                &[0x2B, 0x06, 0x01, 0x04, 0x01, 0xDA, 0x47, 0x0F, 0x01]
            }
            EllipticCurveValues::X25519 => {
                &[0x2B, 0x06, 0x01, 0x04, 0x01, 0x97, 0x55, 0x01, 0x05, 0x01]
            }
        }
    }

    pub fn from_oid(oid: &[u8]) -> Option<Self> {
        [
            EllipticCurveValues::Secp256r1,
            EllipticCurveValues::Secp384r1,
            EllipticCurveValues::Secp521r1,
            EllipticCurveValues::Ed25519,
            EllipticCurveValues::X25519,
        ]
        .into_iter()
        .find(|curve| curve.oid() == oid)
    }
}

fn bit_length_of(bytes: &[u8]) -> usize {
    for (i, byte) in bytes.iter().enumerate() {
        if *byte != 0 {
            return (bytes.len() - i - 1) * 8 + (8 - byte.leading_zeros() as usize);
        }
    }
    0
}

/// An EC or Curve25519 private scalar
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EcPrivateKeyValues {
    curve: EllipticCurveValues,
    secret: Vec<u8>,
    destroyed: bool,
}

impl EcPrivateKeyValues {
    pub fn new(curve: EllipticCurveValues, secret: Vec<u8>) -> Self {
        Self {
            curve,
            secret,
            destroyed: false,
        }
    }

    pub fn curve(&self) -> EllipticCurveValues {
        self.curve
    }

    pub fn secret(&self) -> &[u8] {
        &self.secret
    }
}

impl Drop for EcPrivateKeyValues {
    fn drop(&mut self) {
        self.secret.zeroize();
    }
}

/// RSA private key components, CRT form optional
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RsaPrivateKeyValues {
    modulus: Vec<u8>,
    public_exponent: Vec<u8>,
    prime_p: Vec<u8>,
    prime_q: Vec<u8>,
    prime_exponent_p: Option<Vec<u8>>,
    prime_exponent_q: Option<Vec<u8>>,
    crt_coefficient: Option<Vec<u8>>,
    destroyed: bool,
}

impl RsaPrivateKeyValues {
    pub fn new(
        modulus: Vec<u8>,
        public_exponent: Vec<u8>,
        prime_p: Vec<u8>,
        prime_q: Vec<u8>,
        prime_exponent_p: Option<Vec<u8>>,
        prime_exponent_q: Option<Vec<u8>>,
        crt_coefficient: Option<Vec<u8>>,
    ) -> Self {
        Self {
            modulus,
            public_exponent,
            prime_p,
            prime_q,
            prime_exponent_p,
            prime_exponent_q,
            crt_coefficient,
            destroyed: false,
        }
    }

    pub fn modulus(&self) -> &[u8] {
        &self.modulus
    }

    pub fn public_exponent(&self) -> &[u8] {
        &self.public_exponent
    }

    pub fn prime_p(&self) -> &[u8] {
        &self.prime_p
    }

    pub fn prime_q(&self) -> &[u8] {
        &self.prime_q
    }

    pub fn prime_exponent_p(&self) -> Option<&[u8]> {
        self.prime_exponent_p.as_deref()
    }

    pub fn prime_exponent_q(&self) -> Option<&[u8]> {
        self.prime_exponent_q.as_deref()
    }

    pub fn crt_coefficient(&self) -> Option<&[u8]> {
        self.crt_coefficient.as_deref()
    }

    /// Whether all five CRT components are present
    pub fn has_crt_values(&self) -> bool {
        self.prime_exponent_p.is_some()
            && self.prime_exponent_q.is_some()
            && self.crt_coefficient.is_some()
    }
}

impl Drop for RsaPrivateKeyValues {
    fn drop(&mut self) {
        self.prime_p.zeroize();
        self.prime_q.zeroize();
        if let Some(v) = self.prime_exponent_p.as_mut() {
            v.zeroize();
        }
        if let Some(v) = self.prime_exponent_q.as_mut() {
            v.zeroize();
        }
        if let Some(v) = self.crt_coefficient.as_mut() {
            v.zeroize();
        }
    }
}

/// Private key material for import into a device slot
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PrivateKeyValues {
    Rsa(RsaPrivateKeyValues),
    Ec(EcPrivateKeyValues),
}

impl PrivateKeyValues {
    pub fn bit_length(&self) -> usize {
        match self {
            PrivateKeyValues::Rsa(rsa) => bit_length_of(&rsa.modulus),
            PrivateKeyValues::Ec(ec) => ec.curve.bit_length(),
        }
    }

    /// Zero all secret components
    ///
    /// Also happens on drop; call explicitly when the value must die before
    /// it goes out of scope.
    pub fn destroy(&mut self) {
        match self {
            PrivateKeyValues::Rsa(rsa) => {
                rsa.prime_p.zeroize();
                rsa.prime_q.zeroize();
                if let Some(v) = rsa.prime_exponent_p.as_mut() {
                    v.zeroize();
                }
                if let Some(v) = rsa.prime_exponent_q.as_mut() {
                    v.zeroize();
                }
                if let Some(v) = rsa.crt_coefficient.as_mut() {
                    v.zeroize();
                }
                rsa.destroyed = true;
            }
            PrivateKeyValues::Ec(ec) => {
                ec.secret.zeroize();
                ec.destroyed = true;
            }
        }
    }

    pub fn is_destroyed(&self) -> bool {
        match self {
            PrivateKeyValues::Rsa(rsa) => rsa.destroyed,
            PrivateKeyValues::Ec(ec) => ec.destroyed,
        }
    }
}

/// Public key material read back from a device
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PublicKeyValues {
    Rsa {
        modulus: Vec<u8>,
        public_exponent: Vec<u8>,
    },
    /// Weierstrass curves, SEC1 uncompressed point (`0x04 || x || y`)
    Ec {
        curve: EllipticCurveValues,
        point: Vec<u8>,
    },
    /// Ed25519/X25519, raw 32-byte point
    Cv25519 {
        curve: EllipticCurveValues,
        raw: Vec<u8>,
    },
}

impl PublicKeyValues {
    pub fn bit_length(&self) -> usize {
        match self {
            PublicKeyValues::Rsa { modulus, .. } => bit_length_of(modulus),
            PublicKeyValues::Ec { curve, .. } => curve.bit_length(),
            PublicKeyValues::Cv25519 { curve, .. } => curve.bit_length(),
        }
    }
}
