//! Key store: generation, rotation, lookup and crypto dispatch
//!
//! The whole key table lives behind one lock and is persisted as a single
//! sealed JSON record. Every mutation is persisted before it returns; if the
//! write fails the in-memory change is reverted.

use crate::error::{require_non_empty, CoreError, Result};
use crate::keys::record::{KeyInfo, KeyRecord, KeyTable, KeyType, SECONDS_PER_DAY};
use crate::keys::{ec_key, rsa_key, symmetric};
use crate::storage::SealedStore;
use crate::tee::SealingPrimitive;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::sync::Arc;

pub const KEY_NAMESPACE: &str = "keys";
pub const KEY_TABLE_RECORD: &str = "key_manager";

const KEY_ID_BYTES: usize = 16;

/// Whether `expires_at` gates encrypt / sign
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ExpirationPolicy {
    /// Expiry is metadata only
    #[default]
    Advisory,
    /// Expired keys refuse encrypt and sign; decrypt and verify still work
    Enforce,
}

pub struct KeyStore {
    sealer: Arc<dyn SealingPrimitive>,
    storage: Arc<SealedStore>,
    policy: ExpirationPolicy,
    table: Mutex<KeyTable>,
}

impl KeyStore {
    /// Open the key store and load any persisted key table
    pub fn open(
        sealer: Arc<dyn SealingPrimitive>,
        storage: Arc<SealedStore>,
        policy: ExpirationPolicy,
    ) -> Result<Self> {
        let store = Self {
            sealer,
            storage,
            policy,
            table: Mutex::new(KeyTable::default()),
        };
        store.load()?;
        Ok(store)
    }

    pub fn policy(&self) -> ExpirationPolicy {
        self.policy
    }

    /// Generate a key and make it the active key for its type
    pub fn generate_key(&self, key_type: KeyType, bits: u32, expiration_days: u32) -> Result<String> {
        let mut table = self.table.lock();
        self.generate_locked(&mut table, key_type, bits, expiration_days)
    }

    /// Deactivate the current key for a type and generate its replacement
    pub fn rotate_key(&self, key_type: KeyType, bits: u32, expiration_days: u32) -> Result<String> {
        let mut table = self.table.lock();
        let previous = table.active_id(key_type).map(str::to_string);

        if let Some(prev) = &previous {
            if let Some(record) = table.keys.get_mut(prev) {
                record.active = false;
            }
        }

        match self.generate_locked(&mut table, key_type, bits, expiration_days) {
            Ok(id) => {
                match &previous {
                    Some(prev) => log::info!(
                        "Rotated {} key {} -> {}",
                        key_type.name(),
                        short_id(prev),
                        short_id(&id)
                    ),
                    None => log::info!(
                        "Rotated {} key (no previous) -> {}",
                        key_type.name(),
                        short_id(&id)
                    ),
                }
                Ok(id)
            }
            Err(e) => {
                if let Some(prev) = &previous {
                    if let Some(record) = table.keys.get_mut(prev) {
                        record.active = true;
                    }
                }
                Err(e)
            }
        }
    }

    /// Generate a key for every listed type that has no active key yet
    pub fn ensure_default_keys(
        &self,
        defaults: &[(KeyType, u32)],
        expiration_days: u32,
    ) -> Result<Vec<String>> {
        let mut table = self.table.lock();
        let mut created = Vec::new();
        for &(key_type, bits) in defaults {
            if table.active_id(key_type).is_none() {
                created.push(self.generate_locked(&mut table, key_type, bits, expiration_days)?);
            }
        }
        if !created.is_empty() {
            log::info!("Provisioned {} default keys", created.len());
        }
        Ok(created)
    }

    /// Copy of a key record, material included
    pub fn get_key(&self, id: &str) -> Result<KeyRecord> {
        let table = self.table.lock();
        Ok(lookup(&table, id)?.clone())
    }

    pub fn get_active_key(&self, key_type: KeyType) -> Result<KeyRecord> {
        let table = self.table.lock();
        let id = table.active_id(key_type).ok_or_else(|| {
            CoreError::NotFound(format!("no active {} key", key_type.name()))
        })?;
        Ok(lookup(&table, id)?.clone())
    }

    pub fn key_info(&self, id: &str) -> Result<KeyInfo> {
        let table = self.table.lock();
        let record = lookup(&table, id)?;
        Ok(table.info(record))
    }

    pub fn list_key_info(&self) -> Vec<KeyInfo> {
        let table = self.table.lock();
        table.keys.values().map(|record| table.info(record)).collect()
    }

    /// All key ids, sorted
    pub fn list_keys(&self) -> Vec<String> {
        self.table.lock().keys.keys().cloned().collect()
    }

    pub fn encrypt(&self, id: &str, plaintext: &[u8]) -> Result<Vec<u8>> {
        let table = self.table.lock();
        let record = lookup(&table, id)?;
        self.check_expiry(record, "encrypt")?;

        match record.key_type {
            KeyType::Symmetric => {
                let nonce = self.sealer.random_bytes(symmetric::NONCE_LEN)?;
                symmetric::encrypt(record.material(), &nonce, plaintext)
            }
            KeyType::RsaAsymmetric => rsa_key::encrypt(record.material(), plaintext),
            KeyType::EcAsymmetric => Err(unsupported(record, "encrypt")),
        }
    }

    pub fn decrypt(&self, id: &str, ciphertext: &[u8]) -> Result<Vec<u8>> {
        let table = self.table.lock();
        let record = lookup(&table, id)?;

        match record.key_type {
            KeyType::Symmetric => symmetric::decrypt(record.material(), ciphertext),
            KeyType::RsaAsymmetric => rsa_key::decrypt(record.material(), ciphertext),
            KeyType::EcAsymmetric => Err(unsupported(record, "decrypt")),
        }
    }

    /// Sign the SHA-256 digest of `data`
    pub fn sign(&self, id: &str, data: &[u8]) -> Result<Vec<u8>> {
        let table = self.table.lock();
        let record = lookup(&table, id)?;
        self.check_expiry(record, "sign")?;

        let digest = self.sealer.sha256(data);
        match record.key_type {
            KeyType::RsaAsymmetric => rsa_key::sign(record.material(), &digest),
            KeyType::EcAsymmetric => ec_key::sign(record.material(), &digest),
            KeyType::Symmetric => Err(unsupported(record, "sign")),
        }
    }

    /// `Ok(false)` for a wrong or malformed signature
    pub fn verify(&self, id: &str, data: &[u8], signature: &[u8]) -> Result<bool> {
        let table = self.table.lock();
        let record = lookup(&table, id)?;

        let digest = self.sealer.sha256(data);
        match record.key_type {
            KeyType::RsaAsymmetric => rsa_key::verify(record.material(), &digest, signature),
            KeyType::EcAsymmetric => ec_key::verify(record.material(), &digest, signature),
            KeyType::Symmetric => Err(unsupported(record, "verify")),
        }
    }

    /// Delete a key. The active key for a type cannot be deleted.
    pub fn delete_key(&self, id: &str) -> Result<()> {
        let mut table = self.table.lock();
        let key_type = lookup(&table, id)?.key_type;
        if table.active_id(key_type) == Some(id) {
            return Err(CoreError::StateConflict(format!(
                "key {} is the active {} key",
                id,
                key_type.name()
            )));
        }

        let Some(removed) = table.keys.remove(id) else {
            return Err(not_found(id));
        };
        if let Err(e) = self.persist(&table) {
            table.keys.insert(removed.id.clone(), removed);
            return Err(e);
        }
        log::info!("Deleted {} key {}", key_type.name(), short_id(id));
        Ok(())
    }

    /// Persist the current key table
    pub fn save(&self) -> Result<()> {
        let table = self.table.lock();
        self.persist(&table)
    }

    /// Replace the in-memory table with the persisted one; an absent record loads as empty.
    ///
    /// Each record's key size is checked against its material. Tables written
    /// before sizes were recorded get the size filled in.
    pub fn load(&self) -> Result<()> {
        let mut loaded = match self.storage.retrieve(KEY_NAMESPACE, KEY_TABLE_RECORD) {
            Ok(data) => KeyTable::from_json(&data)?,
            Err(e) if e.is_not_found() => KeyTable::default(),
            Err(e) => return Err(e),
        };
        for record in loaded.keys.values_mut() {
            let actual = material_bits(record).map_err(|e| {
                CoreError::StorageFailure(format!("key {} material: {}", record.id, e))
            })?;
            if record.bits == 0 {
                record.bits = actual;
            } else if record.bits != actual {
                return Err(CoreError::StorageFailure(format!(
                    "key {} claims {} bits but its material has {}",
                    record.id, record.bits, actual
                )));
            }
        }
        log::debug!("Loaded key table with {} keys", loaded.keys.len());
        *self.table.lock() = loaded;
        Ok(())
    }

    fn generate_locked(
        &self,
        table: &mut KeyTable,
        key_type: KeyType,
        bits: u32,
        expiration_days: u32,
    ) -> Result<String> {
        let (mut material, bits) = match key_type {
            KeyType::Symmetric => {
                symmetric::validate_bits(bits)?;
                (
                    zeroize::Zeroizing::new(self.sealer.random_bytes(bits as usize / 8)?),
                    bits,
                )
            }
            KeyType::RsaAsymmetric => {
                rsa_key::validate_bits(bits)?;
                (rsa_key::generate(bits)?, bits)
            }
            KeyType::EcAsymmetric => {
                if bits == 0 {
                    return Err(CoreError::InvalidInput("EC key size must be positive".into()));
                }
                let curve = ec_key::Curve::for_strength(bits);
                (ec_key::generate(curve)?, curve.bits())
            }
        };

        let id = self.new_key_id(table)?;
        let now = now_secs();
        let expires_at = now.saturating_add(expiration_days as u64 * SECONDS_PER_DAY);
        let record = KeyRecord::new(
            id.clone(),
            key_type,
            bits,
            std::mem::take(&mut *material),
            now,
            expires_at,
        );

        let previous_active = table.active.insert(key_type, id.clone());
        table.keys.insert(id.clone(), record);

        if let Err(e) = self.persist(table) {
            table.keys.remove(&id);
            match previous_active {
                Some(prev) => table.active.insert(key_type, prev),
                None => table.active.remove(&key_type),
            };
            log::error!("Failed to persist new {} key: {}", key_type.name(), e);
            return Err(e);
        }

        log::info!(
            "Generated {} key {} ({} bits, expires in {} days)",
            key_type.name(),
            short_id(&id),
            bits,
            expiration_days
        );
        Ok(id)
    }

    fn new_key_id(&self, table: &KeyTable) -> Result<String> {
        loop {
            let id = hex::encode(self.sealer.random_bytes(KEY_ID_BYTES)?);
            if !table.keys.contains_key(&id) {
                return Ok(id);
            }
        }
    }

    fn check_expiry(&self, record: &KeyRecord, operation: &str) -> Result<()> {
        if self.policy == ExpirationPolicy::Enforce && record.is_expired(now_secs()) {
            log::warn!("Refusing {} with expired key {}", operation, record.id);
            return Err(CoreError::StateConflict(format!(
                "key {} expired at {}",
                record.id, record.expires_at
            )));
        }
        Ok(())
    }

    fn persist(&self, table: &KeyTable) -> Result<()> {
        let json = table.to_json()?;
        self.storage.store(KEY_NAMESPACE, KEY_TABLE_RECORD, &json)
    }
}

fn lookup<'a>(table: &'a KeyTable, id: &str) -> Result<&'a KeyRecord> {
    require_non_empty("key id", id)?;
    table.keys.get(id).ok_or_else(|| not_found(id))
}

/// Size of the key actually held in a record's material
fn material_bits(record: &KeyRecord) -> Result<u32> {
    match record.key_type {
        KeyType::Symmetric => Ok((record.material().len() * 8) as u32),
        KeyType::RsaAsymmetric => rsa_key::modulus_bits(record.material()),
        KeyType::EcAsymmetric => Ok(ec_key::curve_of(record.material())?.bits()),
    }
}

/// First eight characters of an id, for logs
fn short_id(id: &str) -> &str {
    id.char_indices().nth(8).map_or(id, |(end, _)| &id[..end])
}

fn not_found(id: &str) -> CoreError {
    CoreError::NotFound(format!("key {}", id))
}

fn unsupported(record: &KeyRecord, operation: &str) -> CoreError {
    CoreError::InvalidInput(format!(
        "{} keys do not support {}",
        record.key_type.name(),
        operation
    ))
}

fn now_secs() -> u64 {
    chrono::Utc::now().timestamp().max(0) as u64
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::{FileBackend, MemoryBackend, StorageBackend};
    use crate::tee::{TeeBackend, TeeEnclave};

    fn setup(policy: ExpirationPolicy) -> (KeyStore, Arc<SealedStore>) {
        let enclave = Arc::new(TeeEnclave::new(TeeBackend::Simulated).unwrap());
        let storage = Arc::new(SealedStore::new(enclave.clone(), Arc::new(MemoryBackend::new())));
        let keys = KeyStore::open(enclave, storage.clone(), policy).unwrap();
        (keys, storage)
    }

    /// Backend whose writes can be switched off
    struct FlakyBackend {
        inner: MemoryBackend,
        fail_writes: std::sync::atomic::AtomicBool,
    }

    impl StorageBackend for FlakyBackend {
        fn read(&self, namespace: &str, key: &str) -> Result<Option<Vec<u8>>> {
            self.inner.read(namespace, key)
        }
        fn write(&self, namespace: &str, key: &str, data: &[u8]) -> Result<()> {
            if self.fail_writes.load(std::sync::atomic::Ordering::SeqCst) {
                return Err(CoreError::StorageFailure("disk full".into()));
            }
            self.inner.write(namespace, key, data)
        }
        fn delete(&self, namespace: &str, key: &str) -> Result<bool> {
            self.inner.delete(namespace, key)
        }
        fn contains(&self, namespace: &str, key: &str) -> Result<bool> {
            self.inner.contains(namespace, key)
        }
        fn keys(&self, namespace: &str) -> Result<Vec<String>> {
            self.inner.keys(namespace)
        }
    }

    #[test]
    fn test_generate_and_get() {
        let (keys, _) = setup(ExpirationPolicy::Advisory);
        let id = keys.generate_key(KeyType::Symmetric, 256, 30).unwrap();
        assert_eq!(id.len(), 32);

        let record = keys.get_key(&id).unwrap();
        assert_eq!(record.key_type, KeyType::Symmetric);
        assert_eq!(record.material().len(), 32);
        assert!(record.active);
        assert_eq!(record.expires_at - record.created_at, 30 * SECONDS_PER_DAY);

        assert_eq!(keys.get_active_key(KeyType::Symmetric).unwrap().id, id);
        assert!(keys.key_info(&id).unwrap().current);
    }

    #[test]
    fn test_symmetric_roundtrip_and_rotation() {
        let (keys, _) = setup(ExpirationPolicy::Advisory);
        let first = keys.generate_key(KeyType::Symmetric, 256, 30).unwrap();

        let ct = keys.encrypt(&first, b"hello").unwrap();
        assert_eq!(ct.len(), 12 + 5 + 16);
        assert_eq!(keys.decrypt(&first, &ct).unwrap(), b"hello");

        let second = keys.rotate_key(KeyType::Symmetric, 256, 30).unwrap();
        assert_ne!(first, second);
        assert!(!keys.get_key(&first).unwrap().active);
        assert!(keys.get_key(&second).unwrap().active);
        assert_eq!(keys.get_active_key(KeyType::Symmetric).unwrap().id, second);

        // Rotated-out keys still decrypt what they encrypted
        assert_eq!(keys.decrypt(&first, &ct).unwrap(), b"hello");
    }

    #[test]
    fn test_generate_does_not_deactivate_previous() {
        let (keys, _) = setup(ExpirationPolicy::Advisory);
        let first = keys.generate_key(KeyType::Symmetric, 128, 1).unwrap();
        let second = keys.generate_key(KeyType::Symmetric, 128, 1).unwrap();

        assert!(keys.get_key(&first).unwrap().active);
        assert_eq!(keys.get_active_key(KeyType::Symmetric).unwrap().id, second);
        assert!(!keys.key_info(&first).unwrap().current);
    }

    #[test]
    fn test_ec_sign_verify() {
        let (keys, _) = setup(ExpirationPolicy::Advisory);
        let id = keys.generate_key(KeyType::EcAsymmetric, 256, 30).unwrap();

        let sig = keys.sign(&id, b"message").unwrap();
        assert!(keys.verify(&id, b"message", &sig).unwrap());
        assert!(!keys.verify(&id, b"tampered", &sig).unwrap());
        assert!(!keys.verify(&id, b"message", b"short").unwrap());

        assert!(matches!(keys.encrypt(&id, b"x"), Err(CoreError::InvalidInput(_))));
        assert_eq!(keys.key_info(&id).unwrap().algorithm, "ECDSA-P256");
    }

    #[test]
    fn test_ec_signatures_are_der() {
        let (keys, _) = setup(ExpirationPolicy::Advisory);
        for bits in [256, 384, 521] {
            let id = keys.generate_key(KeyType::EcAsymmetric, bits, 30).unwrap();
            let sig = keys.sign(&id, b"message").unwrap();
            assert_eq!(sig[0], 0x30, "P-{} signature is not a DER sequence", bits);
            assert!(keys.verify(&id, b"message", &sig).unwrap());
            assert!(!keys.verify(&id, b"other", &sig).unwrap());
        }
    }

    #[test]
    fn test_loaded_table_sizes_checked() {
        let (keys, storage) = setup(ExpirationPolicy::Advisory);
        let now = now_secs();

        // Short ids and a missing key size, as older tables were written
        let mut table = KeyTable::default();
        table.keys.insert(
            "k1".into(),
            KeyRecord::new("k1".into(), KeyType::Symmetric, 0, vec![7; 32], now, now + 60),
        );
        table.active.insert(KeyType::Symmetric, "k1".into());
        storage
            .store(KEY_NAMESPACE, KEY_TABLE_RECORD, &table.to_json().unwrap())
            .unwrap();

        keys.load().unwrap();
        assert_eq!(keys.key_info("k1").unwrap().bits, 256);
        let next = keys.rotate_key(KeyType::Symmetric, 128, 30).unwrap();
        assert!(!keys.get_key("k1").unwrap().active);
        assert_eq!(keys.get_active_key(KeyType::Symmetric).unwrap().id, next);
        keys.delete_key("k1").unwrap();

        // A size that disagrees with the material is corruption
        let mut table = KeyTable::default();
        table.keys.insert(
            "k2".into(),
            KeyRecord::new("k2".into(), KeyType::Symmetric, 128, vec![7; 32], now, now + 60),
        );
        storage
            .store(KEY_NAMESPACE, KEY_TABLE_RECORD, &table.to_json().unwrap())
            .unwrap();
        assert!(matches!(keys.load(), Err(CoreError::StorageFailure(_))));
        assert_eq!(short_id("abcdefghijkl"), "abcdefgh");
        assert_eq!(short_id("k1"), "k1");
    }

    #[test]
    fn test_rsa_encrypt_and_sign() {
        let (keys, _) = setup(ExpirationPolicy::Advisory);
        let id = keys.generate_key(KeyType::RsaAsymmetric, 1024, 30).unwrap();

        let ct = keys.encrypt(&id, b"wrapped").unwrap();
        assert_eq!(keys.decrypt(&id, &ct).unwrap(), b"wrapped");

        let sig = keys.sign(&id, b"doc").unwrap();
        assert!(keys.verify(&id, b"doc", &sig).unwrap());
        assert!(!keys.verify(&id, b"doc2", &sig).unwrap());
    }

    #[test]
    fn test_symmetric_key_cannot_sign() {
        let (keys, _) = setup(ExpirationPolicy::Advisory);
        let id = keys.generate_key(KeyType::Symmetric, 256, 30).unwrap();
        assert!(matches!(keys.sign(&id, b"x"), Err(CoreError::InvalidInput(_))));
        assert!(matches!(keys.verify(&id, b"x", b"y"), Err(CoreError::InvalidInput(_))));
    }

    #[test]
    fn test_invalid_sizes() {
        let (keys, _) = setup(ExpirationPolicy::Advisory);
        assert!(matches!(
            keys.generate_key(KeyType::Symmetric, 192, 30),
            Err(CoreError::InvalidInput(_))
        ));
        assert!(matches!(
            keys.generate_key(KeyType::RsaAsymmetric, 100, 30),
            Err(CoreError::InvalidInput(_))
        ));
        assert!(matches!(
            keys.generate_key(KeyType::EcAsymmetric, 0, 30),
            Err(CoreError::InvalidInput(_))
        ));
        assert!(keys.list_keys().is_empty());
    }

    #[test]
    fn test_unknown_key() {
        let (keys, _) = setup(ExpirationPolicy::Advisory);
        assert!(keys.get_key("missing").unwrap_err().is_not_found());
        assert!(keys.encrypt("missing", b"x").unwrap_err().is_not_found());
        assert!(keys.delete_key("missing").unwrap_err().is_not_found());
        assert!(keys.get_active_key(KeyType::EcAsymmetric).unwrap_err().is_not_found());
        assert!(matches!(keys.get_key(""), Err(CoreError::InvalidInput(_))));
    }

    #[test]
    fn test_delete_rules() {
        let (keys, _) = setup(ExpirationPolicy::Advisory);
        let old = keys.generate_key(KeyType::Symmetric, 256, 30).unwrap();
        let current = keys.rotate_key(KeyType::Symmetric, 256, 30).unwrap();

        assert!(matches!(keys.delete_key(&current), Err(CoreError::StateConflict(_))));
        keys.delete_key(&old).unwrap();
        assert_eq!(keys.list_keys(), vec![current]);
    }

    #[test]
    fn test_expiration_enforced() {
        let (keys, _) = setup(ExpirationPolicy::Enforce);
        let sym = keys.generate_key(KeyType::Symmetric, 256, 0).unwrap();
        let ec = keys.generate_key(KeyType::EcAsymmetric, 256, 0).unwrap();

        assert!(matches!(keys.encrypt(&sym, b"x"), Err(CoreError::StateConflict(_))));
        assert!(matches!(keys.sign(&ec, b"x"), Err(CoreError::StateConflict(_))));
        // Verification of old signatures stays available
        assert!(!keys.verify(&ec, b"x", &[0u8; 64]).unwrap());

        let fresh = keys.rotate_key(KeyType::Symmetric, 256, 30).unwrap();
        assert!(keys.encrypt(&fresh, b"x").is_ok());
    }

    #[test]
    fn test_expiration_advisory() {
        let (keys, _) = setup(ExpirationPolicy::Advisory);
        let id = keys.generate_key(KeyType::Symmetric, 256, 0).unwrap();
        let ct = keys.encrypt(&id, b"still works").unwrap();
        assert_eq!(keys.decrypt(&id, &ct).unwrap(), b"still works");
    }

    #[test]
    fn test_table_persisted_sealed() {
        let (keys, storage) = setup(ExpirationPolicy::Advisory);
        let id = keys.generate_key(KeyType::Symmetric, 256, 30).unwrap();

        let raw = storage.retrieve(KEY_NAMESPACE, KEY_TABLE_RECORD).unwrap();
        let table = KeyTable::from_json(&raw).unwrap();
        assert!(table.keys.contains_key(&id));
        assert_eq!(table.active_id(KeyType::Symmetric), Some(id.as_str()));
    }

    #[test]
    fn test_reload_after_restart() {
        let dir = std::env::temp_dir().join(format!("tee-keys-test-{}", uuid::Uuid::new_v4()));
        let seed = [42u8; 32];

        let (id, ct) = {
            let enclave = Arc::new(TeeEnclave::from_seed(TeeBackend::Simulated, &seed).unwrap());
            let storage = Arc::new(SealedStore::new(
                enclave.clone(),
                Arc::new(FileBackend::open(&dir).unwrap()),
            ));
            let keys = KeyStore::open(enclave, storage, ExpirationPolicy::Advisory).unwrap();
            let id = keys.generate_key(KeyType::Symmetric, 256, 30).unwrap();
            let ct = keys.encrypt(&id, b"persisted").unwrap();
            (id, ct)
        };

        let enclave = Arc::new(TeeEnclave::from_seed(TeeBackend::Simulated, &seed).unwrap());
        let storage = Arc::new(SealedStore::new(
            enclave.clone(),
            Arc::new(FileBackend::open(&dir).unwrap()),
        ));
        let keys = KeyStore::open(enclave, storage, ExpirationPolicy::Advisory).unwrap();
        assert_eq!(keys.get_active_key(KeyType::Symmetric).unwrap().id, id);
        assert_eq!(keys.decrypt(&id, &ct).unwrap(), b"persisted");

        let _ = std::fs::remove_dir_all(&dir);
    }

    #[test]
    fn test_failed_persist_reverts() {
        let enclave = Arc::new(TeeEnclave::new(TeeBackend::Simulated).unwrap());
        let backend = Arc::new(FlakyBackend {
            inner: MemoryBackend::new(),
            fail_writes: std::sync::atomic::AtomicBool::new(false),
        });
        let storage = Arc::new(SealedStore::new(enclave.clone(), backend.clone()));
        let keys = KeyStore::open(enclave, storage, ExpirationPolicy::Advisory).unwrap();

        let first = keys.generate_key(KeyType::Symmetric, 256, 30).unwrap();
        let old = keys.rotate_key(KeyType::Symmetric, 256, 30).unwrap();
        let _ = keys.rotate_key(KeyType::Symmetric, 256, 30).unwrap();

        backend.fail_writes.store(true, std::sync::atomic::Ordering::SeqCst);
        let active_before = keys.get_active_key(KeyType::Symmetric).unwrap().id.clone();

        assert!(matches!(
            keys.rotate_key(KeyType::Symmetric, 256, 30),
            Err(CoreError::StorageFailure(_))
        ));
        assert_eq!(keys.list_keys().len(), 3);
        assert_eq!(keys.get_active_key(KeyType::Symmetric).unwrap().id, active_before);
        assert!(keys.get_key(&active_before).unwrap().active);

        assert!(keys.delete_key(&first).is_err());
        assert!(keys.get_key(&first).is_ok());
        assert!(keys.get_key(&old).is_ok());
    }

    #[test]
    fn test_rotation_lifecycle_scenario() {
        let (keys, _) = setup(ExpirationPolicy::Advisory);
        let k1 = keys.generate_key(KeyType::Symmetric, 256, 30).unwrap();
        let ct = keys.encrypt(&k1, b"hello").unwrap();
        assert_eq!(keys.decrypt(&k1, &ct).unwrap(), b"hello");

        assert!(matches!(keys.delete_key(&k1), Err(CoreError::StateConflict(_))));

        let k2 = keys.rotate_key(KeyType::Symmetric, 256, 30).unwrap();
        assert_eq!(keys.get_active_key(KeyType::Symmetric).unwrap().id, k2);
        keys.delete_key(&k1).unwrap();
        assert!(keys.decrypt(&k1, &ct).unwrap_err().is_not_found());
    }

    #[test]
    fn test_symmetric_payload_sizes() {
        let (keys, _) = setup(ExpirationPolicy::Advisory);
        let id = keys.generate_key(KeyType::Symmetric, 128, 30).unwrap();

        for len in [0usize, 1, 4096, 1 << 20] {
            let data: Vec<u8> = (0..len).map(|i| (i % 251) as u8).collect();
            let mut ct = keys.encrypt(&id, &data).unwrap();
            assert_eq!(keys.decrypt(&id, &ct).unwrap(), data);

            ct[12] ^= 0x80;
            assert!(keys.decrypt(&id, &ct).is_err());
        }
    }

    #[test]
    fn test_default_keys_provisioned_once() {
        let (keys, _) = setup(ExpirationPolicy::Advisory);
        let defaults = [(KeyType::Symmetric, 256), (KeyType::EcAsymmetric, 384)];

        let created = keys.ensure_default_keys(&defaults, 365).unwrap();
        assert_eq!(created.len(), 2);
        assert_eq!(keys.get_active_key(KeyType::EcAsymmetric).unwrap().bits, 384);

        assert!(keys.ensure_default_keys(&defaults, 365).unwrap().is_empty());
        assert_eq!(keys.list_keys().len(), 2);
    }

    #[test]
    fn test_concurrent_generation() {
        let (keys, _) = setup(ExpirationPolicy::Advisory);
        let keys = Arc::new(keys);

        let handles: Vec<_> = (0..8)
            .map(|_| {
                let keys = keys.clone();
                std::thread::spawn(move || keys.generate_key(KeyType::Symmetric, 128, 1).unwrap())
            })
            .collect();
        let ids: Vec<String> = handles.into_iter().map(|h| h.join().unwrap()).collect();

        assert_eq!(keys.list_keys().len(), 8);
        let active = keys.get_active_key(KeyType::Symmetric).unwrap().id.clone();
        assert!(ids.contains(&active));
    }
}
