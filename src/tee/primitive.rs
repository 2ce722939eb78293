//! Sealing primitive: the narrow interface the core consumes from the TEE
//!
//! Hardware-bound authenticated encryption, root-key signing and entropy.
//! Implementations fail closed: an operation either succeeds completely or
//! returns an error, never partial output.

use super::enclave::TeeError;
use zeroize::Zeroizing;

pub trait SealingPrimitive: Send + Sync {
    /// Authenticated-encrypt `plaintext` so only this enclave can recover it
    fn seal(&self, plaintext: &[u8]) -> Result<Vec<u8>, TeeError>;

    /// Reverse `seal`; fails on any framing, length or tag mismatch.
    /// The plaintext is zeroed when dropped.
    fn unseal(&self, sealed: &[u8]) -> Result<Zeroizing<Vec<u8>>, TeeError>;

    /// Sign with the enclave's long-term root key
    fn sign_with_root_key(&self, data: &[u8]) -> Result<Vec<u8>, TeeError>;

    fn verify_with_root_key(&self, data: &[u8], signature: &[u8]) -> bool;

    /// Fill `n` bytes from the trusted entropy source
    fn random_bytes(&self, n: usize) -> Result<Vec<u8>, TeeError>;

    fn sha256(&self, data: &[u8]) -> [u8; 32];
}
