//! Per-user secret vault
//!
//! Each secret value is sealed individually by the enclave. The whole
//! `user -> name -> sealed value` table is persisted as one JSON record through
//! the sealed store after every mutation.

use crate::error::{require_non_empty, CoreError, Result};
use crate::keys::KeyStore;
use crate::storage::SealedStore;
use crate::tee::SealingPrimitive;
use base64::{engine::general_purpose::STANDARD, Engine};
use parking_lot::Mutex;
use serde::{Deserialize, Deserializer, Serialize, Serializer};
use std::collections::BTreeMap;
use std::sync::Arc;
use zeroize::{Zeroize, Zeroizing};

pub const SECRET_NAMESPACE: &str = "secrets";
pub const SECRET_TABLE_RECORD: &str = "user_secrets";

/// Sealed secret bytes, zero-filled on drop
pub struct SealedSecret(Vec<u8>);

impl Drop for SealedSecret {
    fn drop(&mut self) {
        self.0.zeroize();
    }
}

impl Serialize for SealedSecret {
    fn serialize<S: Serializer>(&self, serializer: S) -> std::result::Result<S::Ok, S::Error> {
        serializer.serialize_str(&STANDARD.encode(&self.0))
    }
}

impl<'de> Deserialize<'de> for SealedSecret {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> std::result::Result<Self, D::Error> {
        let encoded = String::deserialize(deserializer)?;
        STANDARD
            .decode(&encoded)
            .map(SealedSecret)
            .map_err(serde::de::Error::custom)
    }
}

type SecretTable = BTreeMap<String, BTreeMap<String, SealedSecret>>;

pub struct SecretVault {
    sealer: Arc<dyn SealingPrimitive>,
    storage: Arc<SealedStore>,
    // Held so the key store outlives the vault
    _key_store: Arc<KeyStore>,
    table: Mutex<SecretTable>,
}

impl SecretVault {
    /// Open the vault and load the persisted secret table once
    pub fn open(
        sealer: Arc<dyn SealingPrimitive>,
        storage: Arc<SealedStore>,
        key_store: Arc<KeyStore>,
    ) -> Result<Self> {
        let vault = Self {
            sealer,
            storage,
            _key_store: key_store,
            table: Mutex::new(SecretTable::new()),
        };
        vault.load()?;
        Ok(vault)
    }

    pub fn store_secret(&self, user_id: &str, name: &str, value: &[u8]) -> Result<()> {
        check_names(user_id, name)?;
        let sealed = self
            .sealer
            .seal(value)
            .map_err(|e| CoreError::StorageFailure(format!("seal secret: {}", e)))?;

        let mut table = self.table.lock();
        let previous = table
            .entry(user_id.to_string())
            .or_default()
            .insert(name.to_string(), SealedSecret(sealed));

        if let Err(e) = self.persist(&table) {
            if let Some(row) = table.get_mut(user_id) {
                match previous {
                    Some(old) => {
                        row.insert(name.to_string(), old);
                    }
                    None => {
                        row.remove(name);
                    }
                }
                if row.is_empty() {
                    table.remove(user_id);
                }
            }
            log::error!("Failed to persist secret table: {}", e);
            return Err(e);
        }

        log::debug!("Stored secret '{}' for user {}", name, user_id);
        Ok(())
    }

    pub fn get_secret(&self, user_id: &str, name: &str) -> Result<Zeroizing<Vec<u8>>> {
        check_names(user_id, name)?;
        let table = self.table.lock();
        let sealed = table
            .get(user_id)
            .and_then(|row| row.get(name))
            .ok_or_else(|| not_found(user_id, name))?;
        self.unseal(sealed)
    }

    pub fn delete_secret(&self, user_id: &str, name: &str) -> Result<()> {
        check_names(user_id, name)?;
        let mut table = self.table.lock();
        let removed = table
            .get_mut(user_id)
            .and_then(|row| row.remove(name))
            .ok_or_else(|| not_found(user_id, name))?;
        if table.get(user_id).is_some_and(|row| row.is_empty()) {
            table.remove(user_id);
        }

        if let Err(e) = self.persist(&table) {
            table
                .entry(user_id.to_string())
                .or_default()
                .insert(name.to_string(), removed);
            log::error!("Failed to persist secret table: {}", e);
            return Err(e);
        }

        log::debug!("Deleted secret '{}' for user {}", name, user_id);
        Ok(())
    }

    /// Secret names for a user, sorted; empty for an unknown user
    pub fn list_secrets(&self, user_id: &str) -> Result<Vec<String>> {
        require_non_empty("user id", user_id)?;
        Ok(self
            .table
            .lock()
            .get(user_id)
            .map(|row| row.keys().cloned().collect())
            .unwrap_or_default())
    }

    /// All of a user's secrets decrypted into one JSON object `{name: value}`
    pub fn user_secrets_json(&self, user_id: &str) -> Result<Zeroizing<String>> {
        require_non_empty("user id", user_id)?;
        let table = self.table.lock();
        let Some(row) = table.get(user_id) else {
            return Ok(Zeroizing::new("{}".to_string()));
        };

        let mut plain = Vec::with_capacity(row.len());
        for (name, sealed) in row {
            plain.push((name.as_str(), self.unseal(sealed)?));
        }

        let mut view = BTreeMap::new();
        for (name, value) in &plain {
            let text = std::str::from_utf8(value).map_err(|_| {
                CoreError::InvalidInput(format!("secret '{}' is not valid UTF-8", name))
            })?;
            view.insert(*name, text);
        }
        Ok(Zeroizing::new(serde_json::to_string(&view)?))
    }

    /// Write the secret table through the sealed store
    pub fn save(&self) -> Result<()> {
        let table = self.table.lock();
        self.persist(&table)
    }

    /// Replace the in-memory table with the persisted one
    pub fn load(&self) -> Result<()> {
        let loaded: SecretTable = match self.storage.retrieve(SECRET_NAMESPACE, SECRET_TABLE_RECORD) {
            Ok(data) => serde_json::from_slice(&data)?,
            Err(e) if e.is_not_found() => SecretTable::new(),
            Err(e) => return Err(e),
        };
        log::debug!("Loaded secrets for {} users", loaded.len());
        *self.table.lock() = loaded;
        Ok(())
    }

    fn unseal(&self, sealed: &SealedSecret) -> Result<Zeroizing<Vec<u8>>> {
        self.sealer
            .unseal(&sealed.0)
            .map_err(|e| CoreError::StorageFailure(format!("unseal secret: {}", e)))
    }

    fn persist(&self, table: &SecretTable) -> Result<()> {
        let json = serde_json::to_vec(table)?;
        self.storage.store(SECRET_NAMESPACE, SECRET_TABLE_RECORD, &json)
    }
}

fn check_names(user_id: &str, name: &str) -> Result<()> {
    require_non_empty("user id", user_id)?;
    require_non_empty("secret name", name)
}

fn not_found(user_id: &str, name: &str) -> CoreError {
    CoreError::NotFound(format!("secret '{}' for user {}", name, user_id))
}
