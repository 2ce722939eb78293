//! ECDSA keys on the NIST curves
//!
//! The requested strength picks the curve: up to 256 bits is P-256, up to 384
//! is P-384, anything larger is P-521. Material is PKCS#8 DER and signatures
//! are DER `ECDSA-Sig-Value` over a SHA-256 prehash.

use crate::error::{CoreError, Result};
use p256::ecdsa::signature::hazmat::{PrehashSigner, PrehashVerifier};
use p256::pkcs8::{DecodePrivateKey, EncodePrivateKey};
use rand::rngs::OsRng;
use zeroize::Zeroizing;

/// P-521 field elements are 66 bytes; shorter prehashes are left-padded
const P521_FIELD_LEN: usize = 66;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Curve {
    P256,
    P384,
    P521,
}

impl Curve {
    pub fn for_strength(bits: u32) -> Self {
        if bits <= 256 {
            Curve::P256
        } else if bits <= 384 {
            Curve::P384
        } else {
            Curve::P521
        }
    }

    pub fn bits(&self) -> u32 {
        match self {
            Curve::P256 => 256,
            Curve::P384 => 384,
            Curve::P521 => 521,
        }
    }

    /// Upper bound of a DER signature on this curve
    pub fn max_signature_len(&self) -> usize {
        match self {
            Curve::P256 => 72,
            Curve::P384 => 104,
            Curve::P521 => 139,
        }
    }
}

enum EcSecret {
    P256(p256::SecretKey),
    P384(p384::SecretKey),
    P521(p521::SecretKey),
}

impl EcSecret {
    fn from_der(der: &[u8]) -> Result<Self> {
        if let Ok(key) = p256::SecretKey::from_pkcs8_der(der) {
            return Ok(EcSecret::P256(key));
        }
        if let Ok(key) = p384::SecretKey::from_pkcs8_der(der) {
            return Ok(EcSecret::P384(key));
        }
        if let Ok(key) = p521::SecretKey::from_pkcs8_der(der) {
            return Ok(EcSecret::P521(key));
        }
        Err(CoreError::CryptoFailure(
            "EC key material is not a P-256, P-384 or P-521 PKCS#8 key".into(),
        ))
    }

    fn curve(&self) -> Curve {
        match self {
            EcSecret::P256(_) => Curve::P256,
            EcSecret::P384(_) => Curve::P384,
            EcSecret::P521(_) => Curve::P521,
        }
    }
}

fn crypto_err(context: &str, e: impl std::fmt::Display) -> CoreError {
    CoreError::CryptoFailure(format!("{}: {}", context, e))
}

pub fn generate(curve: Curve) -> Result<Zeroizing<Vec<u8>>> {
    let der = match curve {
        Curve::P256 => p256::SecretKey::random(&mut OsRng).to_pkcs8_der(),
        Curve::P384 => p384::SecretKey::random(&mut OsRng).to_pkcs8_der(),
        Curve::P521 => p521::SecretKey::random(&mut OsRng).to_pkcs8_der(),
    }
    .map_err(|e| crypto_err("EC encode", e))?;
    Ok(Zeroizing::new(der.as_bytes().to_vec()))
}

pub fn curve_of(der: &[u8]) -> Result<Curve> {
    Ok(EcSecret::from_der(der)?.curve())
}

fn p521_prehash(digest: &[u8; 32]) -> [u8; P521_FIELD_LEN] {
    let mut wide = [0u8; P521_FIELD_LEN];
    wide[P521_FIELD_LEN - digest.len()..].copy_from_slice(digest);
    wide
}

pub fn sign(der: &[u8], digest: &[u8; 32]) -> Result<Vec<u8>> {
    match EcSecret::from_der(der)? {
        EcSecret::P256(secret) => {
            let signer = p256::ecdsa::SigningKey::from(&secret);
            let sig: p256::ecdsa::Signature = signer
                .sign_prehash(digest)
                .map_err(|e| crypto_err("P-256 sign", e))?;
            Ok(sig.to_der().as_bytes().to_vec())
        }
        EcSecret::P384(secret) => {
            let signer = p384::ecdsa::SigningKey::from(&secret);
            let sig: p384::ecdsa::Signature = signer
                .sign_prehash(digest)
                .map_err(|e| crypto_err("P-384 sign", e))?;
            Ok(sig.to_der().as_bytes().to_vec())
        }
        EcSecret::P521(secret) => {
            let signer = p521::ecdsa::SigningKey::from_slice(&secret.to_bytes())
                .map_err(|e| crypto_err("P-521 key", e))?;
            let sig: p521::ecdsa::Signature = signer
                .sign_prehash(&p521_prehash(digest))
                .map_err(|e| crypto_err("P-521 sign", e))?;
            Ok(sig.to_der().as_bytes().to_vec())
        }
    }
}

/// Malformed or mismatched signatures verify as `false`
pub fn verify(der: &[u8], digest: &[u8; 32], signature: &[u8]) -> Result<bool> {
    let secret = EcSecret::from_der(der)?;
    if signature.len() > secret.curve().max_signature_len() {
        return Ok(false);
    }
    let valid = match secret {
        EcSecret::P256(secret) => {
            let signer = p256::ecdsa::SigningKey::from(&secret);
            match p256::ecdsa::Signature::from_der(signature) {
                Ok(sig) => signer.verifying_key().verify_prehash(digest, &sig).is_ok(),
                Err(_) => false,
            }
        }
        EcSecret::P384(secret) => {
            let signer = p384::ecdsa::SigningKey::from(&secret);
            match p384::ecdsa::Signature::from_der(signature) {
                Ok(sig) => signer.verifying_key().verify_prehash(digest, &sig).is_ok(),
                Err(_) => false,
            }
        }
        EcSecret::P521(secret) => {
            let signer = p521::ecdsa::SigningKey::from_slice(&secret.to_bytes())
                .map_err(|e| crypto_err("P-521 key", e))?;
            match p521::ecdsa::Signature::from_der(signature) {
                Ok(sig) => p521::ecdsa::VerifyingKey::from(&signer)
                    .verify_prehash(&p521_prehash(digest), &sig)
                    .is_ok(),
                Err(_) => false,
            }
        }
    };
    Ok(valid)
}
