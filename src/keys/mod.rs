//! Key management
//!
//! - **Record**: key records, the persisted key table, display metadata
//! - **Manager**: the `KeyStore` that generates, rotates and uses keys
//! - **Algorithms**: AES-GCM, RSA and NIST-curve ECDSA backends

pub mod ec_key;
pub mod manager;
pub mod record;
pub mod rsa_key;
pub mod symmetric;

pub use manager::{ExpirationPolicy, KeyStore, KEY_NAMESPACE, KEY_TABLE_RECORD};
pub use record::{KeyInfo, KeyRecord, KeyTable, KeyType};
