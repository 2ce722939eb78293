//! TEE Vault: key management, sealed storage and secret vault
//!
//! The trusted core of a secure function-execution platform. Plaintext key
//! material and secrets stay behind the enclave boundary; everything written
//! to the host is sealed first.

pub mod config;
pub mod error;
pub mod keys;
pub mod runtime;
pub mod secrets;
pub mod storage;
pub mod tee;

pub use config::EnclaveConfig;
pub use error::{CoreError, Result};
pub use keys::{ExpirationPolicy, KeyInfo, KeyRecord, KeyStore, KeyType};
pub use runtime::EnclaveRuntime;
pub use secrets::SecretVault;
pub use storage::{FileBackend, MemoryBackend, SealedStore, StorageBackend};
pub use tee::{SealingPrimitive, TeeBackend, TeeEnclave, TeeError};
