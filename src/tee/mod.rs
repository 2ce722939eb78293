//! TEE (Trusted Execution Environment): the trust boundary the core runs behind
//!
//! - **Primitive**: the sealing / root-signing / entropy interface the core consumes
//! - **Enclave**: software implementation of that interface, with backend probing

pub mod enclave;
pub mod primitive;

pub use enclave::{EnclaveStatus, SecurityLevel, TeeBackend, TeeEnclave, TeeError};
pub use primitive::SealingPrimitive;
