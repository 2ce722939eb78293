//! Error taxonomy shared by the key store, sealed store and secret vault.
//!
//! Every failure is local and recoverable: operations hand a `CoreError`
//! back to their caller and never abort the enclave.

use crate::tee::TeeError;

#[derive(Debug, thiserror::Error)]
pub enum CoreError {
    /// Key id, secret or storage record is absent
    #[error("not found: {0}")]
    NotFound(String),

    /// Empty identifiers, wrong key type for the operation, malformed input
    #[error("invalid input: {0}")]
    InvalidInput(String),

    /// Key generation, encryption, decryption or signing failed
    #[error("crypto failure: {0}")]
    CryptoFailure(String),

    /// I/O error, seal/unseal failure or corrupt persisted state
    #[error("storage failure: {0}")]
    StorageFailure(String),

    /// Operation not allowed in the current state
    #[error("state conflict: {0}")]
    StateConflict(String),
}

impl CoreError {
    pub fn is_not_found(&self) -> bool {
        matches!(self, CoreError::NotFound(_))
    }
}

impl From<TeeError> for CoreError {
    fn from(e: TeeError) -> Self {
        CoreError::CryptoFailure(e.to_string())
    }
}

impl From<std::io::Error> for CoreError {
    fn from(e: std::io::Error) -> Self {
        CoreError::StorageFailure(e.to_string())
    }
}

impl From<serde_json::Error> for CoreError {
    fn from(e: serde_json::Error) -> Self {
        CoreError::StorageFailure(format!("serialization: {}", e))
    }
}

pub type Result<T> = std::result::Result<T, CoreError>;

/// Reject empty identifiers before they reach storage
pub(crate) fn require_non_empty(field: &str, value: &str) -> Result<()> {
    if value.is_empty() {
        return Err(CoreError::InvalidInput(format!("{} must not be empty", field)));
    }
    Ok(())
}
