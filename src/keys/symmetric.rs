//! AES-GCM for symmetric keys
//!
//! Ciphertext layout: `nonce (12) || ciphertext || tag (16)`.

use crate::error::{CoreError, Result};
use aes_gcm::aead::{Aead, KeyInit};
use aes_gcm::{Aes128Gcm, Aes256Gcm, Nonce};

pub const NONCE_LEN: usize = 12;
pub const TAG_LEN: usize = 16;

pub fn validate_bits(bits: u32) -> Result<()> {
    match bits {
        128 | 256 => Ok(()),
        _ => Err(CoreError::InvalidInput(format!(
            "symmetric key size must be 128 or 256 bits, got {}",
            bits
        ))),
    }
}

pub fn encrypt(key: &[u8], nonce: &[u8], plaintext: &[u8]) -> Result<Vec<u8>> {
    if nonce.len() != NONCE_LEN {
        return Err(CoreError::CryptoFailure(format!(
            "nonce must be {} bytes",
            NONCE_LEN
        )));
    }
    let nonce_ref = Nonce::from_slice(nonce);
    let sealed = match key.len() {
        16 => Aes128Gcm::new_from_slice(key)
            .map_err(|e| CoreError::CryptoFailure(e.to_string()))?
            .encrypt(nonce_ref, plaintext),
        32 => Aes256Gcm::new_from_slice(key)
            .map_err(|e| CoreError::CryptoFailure(e.to_string()))?
            .encrypt(nonce_ref, plaintext),
        n => return Err(CoreError::CryptoFailure(format!("bad AES key length {}", n))),
    }
    .map_err(|_| CoreError::CryptoFailure("AES-GCM encryption failed".into()))?;

    let mut out = Vec::with_capacity(NONCE_LEN + sealed.len());
    out.extend_from_slice(nonce);
    out.extend_from_slice(&sealed);
    Ok(out)
}

pub fn decrypt(key: &[u8], data: &[u8]) -> Result<Vec<u8>> {
    if data.len() < NONCE_LEN + TAG_LEN {
        return Err(CoreError::InvalidInput(format!(
            "ciphertext too short: {} bytes",
            data.len()
        )));
    }
    let (nonce, body) = data.split_at(NONCE_LEN);
    let nonce_ref = Nonce::from_slice(nonce);
    match key.len() {
        16 => Aes128Gcm::new_from_slice(key)
            .map_err(|e| CoreError::CryptoFailure(e.to_string()))?
            .decrypt(nonce_ref, body),
        32 => Aes256Gcm::new_from_slice(key)
            .map_err(|e| CoreError::CryptoFailure(e.to_string()))?
            .decrypt(nonce_ref, body),
        n => return Err(CoreError::CryptoFailure(format!("bad AES key length {}", n))),
    }
    .map_err(|_| CoreError::CryptoFailure("AES-GCM authentication failed".into()))
}
