//! TEE Enclave: software implementation of the sealing primitive
//!
//! Provides a unified interface for TEE operations across different backends:
//! - Intel SGX (probed, sealing simulated)
//! - ARM TrustZone (probed, sealing simulated)
//! - Software-simulated enclave (always available, for dev/test)
//!
//! Sealed blob layout:
//!
//! ```text
//! [u32 BE len(wrapped_key)][wrapped_key][iv: 12][ciphertext][tag: 16]
//! ```
//!
//! Every value gets a fresh AES-256-GCM key. That key is wrapped for the
//! enclave's long-term P-256 root key (ephemeral ECDH, SHA-256 KDF,
//! AES-256-GCM): `[point: 65][nonce: 12][encrypted key: 32][tag: 16]`.

use super::primitive::SealingPrimitive;
use aes_gcm::{
    aead::{Aead, KeyInit},
    Aes256Gcm, Nonce,
};
use chrono::{DateTime, Utc};
use p256::ecdsa::signature::{Signer, Verifier};
use p256::elliptic_curve::sec1::ToEncodedPoint;
use rand::rngs::OsRng;
use rand::RngCore;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::sync::atomic::{AtomicU64, Ordering};
use zeroize::{Zeroize, Zeroizing};

pub const IV_LEN: usize = 12;
pub const TAG_LEN: usize = 16;
pub const DATA_KEY_LEN: usize = 32;
const LEN_PREFIX: usize = 4;
const POINT_LEN: usize = 65;
const WRAPPED_KEY_LEN: usize = POINT_LEN + IV_LEN + DATA_KEY_LEN + TAG_LEN;

/// Supported TEE backend types
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum TeeBackend {
    /// Intel SGX enclave
    IntelSgx,
    /// ARM TrustZone
    ArmTrustZone,
    /// Software-simulated (always available, NOT hardware-secured)
    Simulated,
}

impl TeeBackend {
    pub fn name(&self) -> &str {
        match self {
            TeeBackend::IntelSgx => "Intel SGX",
            TeeBackend::ArmTrustZone => "ARM TrustZone",
            TeeBackend::Simulated => "Simulated (software)",
        }
    }

    pub fn is_hardware(&self) -> bool {
        !matches!(self, TeeBackend::Simulated)
    }

    /// Parse the short names used in config files and the CLI
    pub fn parse(name: &str) -> Option<Self> {
        match name.to_ascii_lowercase().as_str() {
            "sgx" | "intel-sgx" => Some(TeeBackend::IntelSgx),
            "trustzone" | "arm-trustzone" => Some(TeeBackend::ArmTrustZone),
            "sim" | "simulated" => Some(TeeBackend::Simulated),
            _ => None,
        }
    }
}

/// TEE enclave security level
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum SecurityLevel {
    /// Hardware-backed (SGX/TrustZone available and verified)
    Hardware,
    /// Software simulation (no hardware TEE, development only)
    Software,
    /// Degraded (hardware TEE detected but health check failed)
    Degraded,
}

/// Status of a running enclave
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EnclaveStatus {
    pub enclave_id: String,
    pub backend: TeeBackend,
    pub security_level: SecurityLevel,
    pub created_at: DateTime<Utc>,
    pub seal_operations: u64,
    pub unseal_operations: u64,
    pub failed_unseals: u64,
    /// Hex SEC1 encoding of the root public key
    pub root_public_key: String,
    pub is_healthy: bool,
}

/// A TEE enclave instance holding the long-term root key
pub struct TeeEnclave {
    /// Unique identifier
    pub id: String,
    /// Which backend is in use
    pub backend: TeeBackend,
    root_key: p256::SecretKey,
    created_at: DateTime<Utc>,
    security_level: SecurityLevel,
    seals: AtomicU64,
    unseals: AtomicU64,
    failed_unseals: AtomicU64,
}

impl TeeEnclave {
    /// Create an enclave with a fresh random root key.
    ///
    /// Data sealed by this instance cannot be recovered after it is dropped.
    pub fn new(backend: TeeBackend) -> Result<Self, TeeError> {
        let root_key = p256::SecretKey::random(&mut OsRng);
        Ok(Self::with_root_key(backend, root_key))
    }

    /// Create an enclave whose root key is derived from a persistent seed,
    /// so blobs sealed in an earlier run can be unsealed again.
    pub fn from_seed(backend: TeeBackend, seed: &[u8]) -> Result<Self, TeeError> {
        if seed.len() < 16 {
            return Err(TeeError::SealingError("Root seed too short".into()));
        }
        let root_key = Self::derive_root_key(seed)?;
        Ok(Self::with_root_key(backend, root_key))
    }

    fn with_root_key(backend: TeeBackend, root_key: p256::SecretKey) -> Self {
        let security_level = match backend {
            TeeBackend::IntelSgx => {
                if Self::probe_sgx() {
                    SecurityLevel::Hardware
                } else {
                    log::warn!("Intel SGX not available, falling back to simulated enclave");
                    SecurityLevel::Software
                }
            }
            TeeBackend::ArmTrustZone => {
                if Self::probe_trustzone() {
                    SecurityLevel::Hardware
                } else {
                    log::warn!("ARM TrustZone not available, falling back to simulated enclave");
                    SecurityLevel::Software
                }
            }
            TeeBackend::Simulated => SecurityLevel::Software,
        };

        let id = uuid::Uuid::new_v4().to_string();

        log::info!(
            "TEE enclave initialized: backend={}, security={:?}, id={}",
            backend.name(),
            security_level,
            &id[..8]
        );

        Self {
            id,
            backend,
            root_key,
            created_at: Utc::now(),
            security_level,
            seals: AtomicU64::new(0),
            unseals: AtomicU64::new(0),
            failed_unseals: AtomicU64::new(0),
        }
    }

    /// Get enclave status
    pub fn status(&self) -> EnclaveStatus {
        EnclaveStatus {
            enclave_id: self.id.clone(),
            backend: self.backend,
            security_level: self.security_level,
            created_at: self.created_at,
            seal_operations: self.seals.load(Ordering::Relaxed),
            unseal_operations: self.unseals.load(Ordering::Relaxed),
            failed_unseals: self.failed_unseals.load(Ordering::Relaxed),
            root_public_key: hex::encode(
                self.root_key.public_key().to_encoded_point(false).as_bytes(),
            ),
            is_healthy: self.security_level != SecurityLevel::Degraded,
        }
    }

    /// Get the security level
    pub fn security_level(&self) -> SecurityLevel {
        self.security_level
    }

    // --- Internal helpers ---

    /// Encrypt a data key for the root public key
    fn wrap_data_key(&self, data_key: &[u8]) -> Result<Vec<u8>, TeeError> {
        let ephemeral = p256::ecdh::EphemeralSecret::random(&mut OsRng);
        let point = ephemeral.public_key().to_encoded_point(false);
        let shared = ephemeral.diffie_hellman(&self.root_key.public_key());
        let kek = Self::derive_kek(shared.raw_secret_bytes().as_slice(), point.as_bytes());

        let nonce = Self::fresh_nonce()?;
        let encrypted = aes_encrypt(&kek[..], &nonce, data_key)?;

        let mut wrapped = Vec::with_capacity(WRAPPED_KEY_LEN);
        wrapped.extend_from_slice(point.as_bytes());
        wrapped.extend_from_slice(&nonce);
        wrapped.extend_from_slice(&encrypted);
        Ok(wrapped)
    }

    fn unwrap_data_key(&self, wrapped: &[u8]) -> Result<Zeroizing<Vec<u8>>, TeeError> {
        if wrapped.len() != WRAPPED_KEY_LEN {
            return Err(TeeError::SealingError(format!(
                "Wrapped key has length {}, expected {}",
                wrapped.len(),
                WRAPPED_KEY_LEN
            )));
        }
        let point = &wrapped[..POINT_LEN];
        let nonce = &wrapped[POINT_LEN..POINT_LEN + IV_LEN];
        let encrypted = &wrapped[POINT_LEN + IV_LEN..];

        let ephemeral_public = p256::PublicKey::from_sec1_bytes(point)
            .map_err(|_| TeeError::IntegrityError("Invalid ephemeral point".into()))?;
        let shared = p256::ecdh::diffie_hellman(
            self.root_key.to_nonzero_scalar(),
            ephemeral_public.as_affine(),
        );
        let kek = Self::derive_kek(shared.raw_secret_bytes().as_slice(), point);

        let data_key = aes_decrypt(&kek[..], nonce, encrypted)?;
        if data_key.len() != DATA_KEY_LEN {
            return Err(TeeError::IntegrityError("Unwrapped key has wrong length".into()));
        }
        Ok(data_key)
    }

    fn derive_kek(shared: &[u8], point: &[u8]) -> Zeroizing<[u8; 32]> {
        let mut h = Sha256::new();
        h.update(shared);
        h.update(point);
        h.update(b"tee-seal-kek-v1");
        Zeroizing::new(h.finalize().into())
    }

    fn fresh_nonce() -> Result<[u8; IV_LEN], TeeError> {
        let mut nonce = [0u8; IV_LEN];
        OsRng
            .try_fill_bytes(&mut nonce)
            .map_err(|e| TeeError::EntropyError(e.to_string()))?;
        Ok(nonce)
    }

    fn derive_root_key(seed: &[u8]) -> Result<p256::SecretKey, TeeError> {
        // A digest is a valid scalar unless it is zero or >= n; retry with a counter.
        for counter in 0u32..16 {
            let mut h = Sha256::new();
            h.update(seed);
            h.update(counter.to_be_bytes());
            h.update(b"tee-root-key-v1");
            let mut candidate: [u8; 32] = h.finalize().into();
            let key = p256::SecretKey::from_slice(&candidate);
            candidate.zeroize();
            if let Ok(key) = key {
                return Ok(key);
            }
        }
        Err(TeeError::SealingError("Could not derive root key from seed".into()))
    }

    fn probe_sgx() -> bool {
        #[cfg(target_arch = "x86_64")]
        {
            std::path::Path::new("/dev/sgx_enclave").exists()
                || std::path::Path::new("/dev/isgx").exists()
        }
        #[cfg(not(target_arch = "x86_64"))]
        {
            false
        }
    }

    fn probe_trustzone() -> bool {
        #[cfg(target_arch = "aarch64")]
        {
            std::path::Path::new("/dev/tee0").exists()
                || std::path::Path::new("/dev/opteearmtz00").exists()
        }
        #[cfg(not(target_arch = "aarch64"))]
        {
            false
        }
    }
}

impl SealingPrimitive for TeeEnclave {
    fn seal(&self, plaintext: &[u8]) -> Result<Vec<u8>, TeeError> {
        let mut data_key = Zeroizing::new([0u8; DATA_KEY_LEN]);
        OsRng
            .try_fill_bytes(&mut data_key[..])
            .map_err(|e| TeeError::EntropyError(e.to_string()))?;
        let iv = Self::fresh_nonce()?;

        let ciphertext = aes_encrypt(&data_key[..], &iv, plaintext)?;
        let wrapped = self.wrap_data_key(&data_key[..])?;

        let mut sealed =
            Vec::with_capacity(LEN_PREFIX + wrapped.len() + IV_LEN + ciphertext.len());
        sealed.extend_from_slice(&(wrapped.len() as u32).to_be_bytes());
        sealed.extend_from_slice(&wrapped);
        sealed.extend_from_slice(&iv);
        sealed.extend_from_slice(&ciphertext);

        self.seals.fetch_add(1, Ordering::Relaxed);
        Ok(sealed)
    }

    fn unseal(&self, sealed: &[u8]) -> Result<Zeroizing<Vec<u8>>, TeeError> {
        self.unseals.fetch_add(1, Ordering::Relaxed);
        let result = self.unseal_frame(sealed);
        if result.is_err() {
            self.failed_unseals.fetch_add(1, Ordering::Relaxed);
        }
        result
    }

    fn sign_with_root_key(&self, data: &[u8]) -> Result<Vec<u8>, TeeError> {
        let signing_key = p256::ecdsa::SigningKey::from(&self.root_key);
        let signature: p256::ecdsa::Signature = signing_key
            .try_sign(data)
            .map_err(|e| TeeError::SigningError(e.to_string()))?;
        Ok(signature.to_bytes().to_vec())
    }

    fn verify_with_root_key(&self, data: &[u8], signature: &[u8]) -> bool {
        let Ok(signature) = p256::ecdsa::Signature::from_slice(signature) else {
            return false;
        };
        let verifying_key = p256::ecdsa::VerifyingKey::from(&self.root_key.public_key());
        verifying_key.verify(data, &signature).is_ok()
    }

    fn random_bytes(&self, n: usize) -> Result<Vec<u8>, TeeError> {
        let mut out = vec![0u8; n];
        OsRng
            .try_fill_bytes(&mut out)
            .map_err(|e| TeeError::EntropyError(e.to_string()))?;
        Ok(out)
    }

    fn sha256(&self, data: &[u8]) -> [u8; 32] {
        Sha256::digest(data).into()
    }
}

impl TeeEnclave {
    fn unseal_frame(&self, sealed: &[u8]) -> Result<Zeroizing<Vec<u8>>, TeeError> {
        if sealed.len() < LEN_PREFIX {
            return Err(TeeError::SealingError("Data too short".into()));
        }
        let mut prefix = [0u8; LEN_PREFIX];
        prefix.copy_from_slice(&sealed[..LEN_PREFIX]);
        let key_len = u32::from_be_bytes(prefix) as usize;

        let body = &sealed[LEN_PREFIX..];
        if key_len > body.len() || body.len() - key_len < IV_LEN + TAG_LEN {
            return Err(TeeError::SealingError(format!(
                "Sealed blob of {} bytes cannot hold a {}-byte wrapped key",
                sealed.len(),
                key_len
            )));
        }

        let (wrapped, rest) = body.split_at(key_len);
        let (iv, ciphertext) = rest.split_at(IV_LEN);

        let data_key = self.unwrap_data_key(wrapped)?;
        aes_decrypt(data_key.as_slice(), iv, ciphertext)
    }
}

fn aes_encrypt(key: &[u8], nonce: &[u8], plaintext: &[u8]) -> Result<Vec<u8>, TeeError> {
    let cipher = Aes256Gcm::new_from_slice(key)
        .map_err(|e| TeeError::SealingError(format!("Invalid key: {}", e)))?;
    cipher
        .encrypt(Nonce::from_slice(nonce), plaintext)
        .map_err(|e| TeeError::SealingError(format!("Encryption failed: {}", e)))
}

fn aes_decrypt(key: &[u8], nonce: &[u8], ciphertext: &[u8]) -> Result<Zeroizing<Vec<u8>>, TeeError> {
    let cipher = Aes256Gcm::new_from_slice(key)
        .map_err(|e| TeeError::SealingError(format!("Invalid key: {}", e)))?;
    cipher
        .decrypt(Nonce::from_slice(nonce), ciphertext)
        .map(Zeroizing::new)
        .map_err(|_| TeeError::IntegrityError("Authentication tag mismatch".into()))
}

/// TEE-related errors
#[derive(Debug, thiserror::Error)]
pub enum TeeError {
    #[error("Sealing error: {0}")]
    SealingError(String),

    #[error("Integrity verification failed: {0}")]
    IntegrityError(String),

    #[error("Signing error: {0}")]
    SigningError(String),

    #[error("Entropy source failed: {0}")]
    EntropyError(String),
}
