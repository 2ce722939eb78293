//! Component wiring
//!
//! Builds the enclave, storage backend, sealed store, key store and secret
//! vault exactly once and hands out shared handles.

use crate::config::EnclaveConfig;
use crate::error::Result;
use crate::keys::KeyStore;
use crate::secrets::SecretVault;
use crate::storage::{FileBackend, MemoryBackend, SealedStore, StorageBackend};
use crate::tee::{SealingPrimitive, TeeEnclave};
use std::sync::Arc;

pub struct EnclaveRuntime {
    pub enclave: Arc<TeeEnclave>,
    pub storage: Arc<SealedStore>,
    pub keys: Arc<KeyStore>,
    pub secrets: Arc<SecretVault>,
    config: EnclaveConfig,
}

impl EnclaveRuntime {
    pub fn start(config: &EnclaveConfig) -> Result<Self> {
        config.validate()?;

        let (enclave, backend) = if config.ephemeral {
            let backend: Arc<dyn StorageBackend> = Arc::new(MemoryBackend::new());
            (TeeEnclave::new(config.backend)?, backend)
        } else {
            let seed = config.load_or_create_root_seed()?;
            let backend: Arc<dyn StorageBackend> = Arc::new(FileBackend::open(config.sealed_dir())?);
            (TeeEnclave::from_seed(config.backend, &seed)?, backend)
        };

        let enclave = Arc::new(enclave);
        let sealer: Arc<dyn SealingPrimitive> = enclave.clone();
        let storage = Arc::new(SealedStore::new(sealer.clone(), backend));
        let keys = Arc::new(KeyStore::open(
            sealer.clone(),
            storage.clone(),
            config.expiration_policy,
        )?);
        if config.provision_default_keys {
            keys.ensure_default_keys(&config.default_keys(), config.expiration_days)?;
        }
        let secrets = Arc::new(SecretVault::open(sealer, storage.clone(), keys.clone())?);

        log::info!(
            "Enclave runtime started: {} ({}, {} keys)",
            &enclave.id[..8],
            if config.ephemeral { "ephemeral" } else { "persistent" },
            keys.list_keys().len()
        );

        Ok(Self {
            enclave,
            storage,
            keys,
            secrets,
            config: config.clone(),
        })
    }

    /// In-memory runtime with a per-process root key and no default keys
    pub fn ephemeral() -> Result<Self> {
        Self::start(&EnclaveConfig {
            ephemeral: true,
            provision_default_keys: false,
            ..Default::default()
        })
    }

    pub fn config(&self) -> &EnclaveConfig {
        &self.config
    }
}
