//! RSA keys: OAEP(SHA-256) encryption, PKCS#1 v1.5 signatures over SHA-256
//!
//! Material is the PKCS#8 DER encoding of the private key.

use crate::error::{CoreError, Result};
use ::rsa::pkcs8::{DecodePrivateKey, EncodePrivateKey};
use ::rsa::traits::PublicKeyParts;
use ::rsa::{Oaep, Pkcs1v15Sign, RsaPrivateKey, RsaPublicKey};
use rand::rngs::OsRng;
use sha2::Sha256;
use zeroize::Zeroizing;

pub const MIN_BITS: u32 = 1024;
pub const MAX_BITS: u32 = 16384;

/// OAEP with SHA-256 spends 2 * 32 + 2 bytes of each block on padding
const OAEP_OVERHEAD: usize = 66;

pub fn validate_bits(bits: u32) -> Result<()> {
    if !(MIN_BITS..=MAX_BITS).contains(&bits) || bits % 8 != 0 {
        return Err(CoreError::InvalidInput(format!(
            "RSA key size must be a multiple of 8 in {}..={}, got {}",
            MIN_BITS, MAX_BITS, bits
        )));
    }
    Ok(())
}

pub fn generate(bits: u32) -> Result<Zeroizing<Vec<u8>>> {
    let key = RsaPrivateKey::new(&mut OsRng, bits as usize)
        .map_err(|e| CoreError::CryptoFailure(format!("RSA keygen: {}", e)))?;
    let der = key
        .to_pkcs8_der()
        .map_err(|e| CoreError::CryptoFailure(format!("RSA encode: {}", e)))?;
    Ok(Zeroizing::new(der.as_bytes().to_vec()))
}

fn load(der: &[u8]) -> Result<RsaPrivateKey> {
    RsaPrivateKey::from_pkcs8_der(der)
        .map_err(|e| CoreError::CryptoFailure(format!("RSA key decode: {}", e)))
}

pub fn encrypt(der: &[u8], plaintext: &[u8]) -> Result<Vec<u8>> {
    let key = load(der)?;
    let public = RsaPublicKey::from(&key);
    let limit = public.size().saturating_sub(OAEP_OVERHEAD);
    if plaintext.len() > limit {
        return Err(CoreError::InvalidInput(format!(
            "plaintext of {} bytes exceeds RSA-OAEP limit of {}",
            plaintext.len(),
            limit
        )));
    }
    public
        .encrypt(&mut OsRng, Oaep::new::<Sha256>(), plaintext)
        .map_err(|e| CoreError::CryptoFailure(format!("RSA encrypt: {}", e)))
}

pub fn decrypt(der: &[u8], ciphertext: &[u8]) -> Result<Vec<u8>> {
    let key = load(der)?;
    if ciphertext.len() != key.size() {
        return Err(CoreError::InvalidInput(format!(
            "RSA ciphertext must be {} bytes, got {}",
            key.size(),
            ciphertext.len()
        )));
    }
    key.decrypt(Oaep::new::<Sha256>(), ciphertext)
        .map_err(|e| CoreError::CryptoFailure(format!("RSA decrypt: {}", e)))
}

pub fn sign(der: &[u8], digest: &[u8; 32]) -> Result<Vec<u8>> {
    let key = load(der)?;
    key.sign(Pkcs1v15Sign::new::<Sha256>(), digest)
        .map_err(|e| CoreError::CryptoFailure(format!("RSA sign: {}", e)))
}

pub fn verify(der: &[u8], digest: &[u8; 32], signature: &[u8]) -> Result<bool> {
    let key = load(der)?;
    let public = RsaPublicKey::from(&key);
    Ok(public
        .verify(Pkcs1v15Sign::new::<Sha256>(), digest, signature)
        .is_ok())
}

/// Modulus size in bits of a stored key
pub fn modulus_bits(der: &[u8]) -> Result<u32> {
    Ok((load(der)?.size() * 8) as u32)
}

#[cfg(test)]
mod tests {
    use super::*;
    use sha2::Digest;

    #[test]
    fn test_rsa_encrypt_sign() {
        let der = generate(1024).unwrap();
        assert_eq!(modulus_bits(&der).unwrap(), 1024);

        let ct = encrypt(&der, b"secret").unwrap();
        assert_eq!(ct.len(), 128);
        assert_eq!(decrypt(&der, &ct).unwrap(), b"secret");

        let digest: [u8; 32] = Sha256::digest(b"message").into();
        let sig = sign(&der, &digest).unwrap();
        assert!(verify(&der, &digest, &sig).unwrap());

        let other: [u8; 32] = Sha256::digest(b"other").into();
        assert!(!verify(&der, &other, &sig).unwrap());
        assert!(!verify(&der, &digest, b"garbage").unwrap());

        // 128 - 66 = 62 byte limit
        assert!(matches!(encrypt(&der, &[0u8; 63]), Err(CoreError::InvalidInput(_))));
        assert!(matches!(decrypt(&der, &[0u8; 10]), Err(CoreError::InvalidInput(_))));
    }

    #[test]
    fn test_bit_validation() {
        assert!(validate_bits(1024).is_ok());
        assert!(validate_bits(2048).is_ok());
        assert!(validate_bits(16384).is_ok());
        assert!(validate_bits(512).is_err());
        assert!(validate_bits(2049).is_err());
        assert!(validate_bits(16392).is_err());
    }
}
