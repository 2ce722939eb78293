//! Sealed storage: namespaced key→bytes store over an untrusted medium
//!
//! Every byte written to the backend has passed through the enclave's `seal`,
//! every byte read back passes through `unseal` before it is returned.
//! A single transaction may be open at a time; while it is open, writes and
//! deletes are buffered and shadow the on-disk state for every caller.

pub mod backend;
pub mod transaction;

pub use backend::{FileBackend, MemoryBackend, StorageBackend};
pub use transaction::Transaction;

use crate::error::{require_non_empty, CoreError, Result};
use crate::tee::SealingPrimitive;
use parking_lot::Mutex;
use std::sync::Arc;
use transaction::Shadow;
use zeroize::Zeroizing;

struct StoreState {
    txn: Option<Transaction>,
    next_txn_id: u64,
}

pub struct SealedStore {
    sealer: Arc<dyn SealingPrimitive>,
    backend: Arc<dyn StorageBackend>,
    state: Mutex<StoreState>,
}

impl SealedStore {
    pub fn new(sealer: Arc<dyn SealingPrimitive>, backend: Arc<dyn StorageBackend>) -> Self {
        Self {
            sealer,
            backend,
            state: Mutex::new(StoreState {
                txn: None,
                next_txn_id: 1,
            }),
        }
    }

    /// Seal and write `data`, or buffer it when a transaction is open
    pub fn store(&self, namespace: &str, key: &str, data: &[u8]) -> Result<()> {
        check_address(namespace, key)?;
        let mut state = self.state.lock();

        if let Some(txn) = state.txn.as_mut() {
            txn.stage_write(namespace, key, data.to_vec());
            log::debug!("Buffered write {}/{} in txn {}", namespace, key, txn.id);
            return Ok(());
        }

        self.write_sealed(namespace, key, data)
    }

    /// Read and unseal, honoring the open transaction's buffer.
    /// The returned plaintext is zeroed when dropped.
    pub fn retrieve(&self, namespace: &str, key: &str) -> Result<Zeroizing<Vec<u8>>> {
        check_address(namespace, key)?;
        let state = self.state.lock();

        if let Some(txn) = state.txn.as_ref() {
            match txn.shadow(namespace, key) {
                Shadow::Written(data) => return Ok(Zeroizing::new(data.to_vec())),
                Shadow::Deleted => return Err(not_found(namespace, key)),
                Shadow::Untouched => {}
            }
        }

        self.read_unsealed(namespace, key)
    }

    /// Read durable state only, ignoring anything buffered in a transaction
    pub fn retrieve_committed(&self, namespace: &str, key: &str) -> Result<Zeroizing<Vec<u8>>> {
        check_address(namespace, key)?;
        let _state = self.state.lock();
        self.read_unsealed(namespace, key)
    }

    /// Remove an address; returns whether it was visible before the call
    pub fn remove(&self, namespace: &str, key: &str) -> Result<bool> {
        check_address(namespace, key)?;
        let mut state = self.state.lock();

        if let Some(txn) = state.txn.as_mut() {
            let visible = match txn.shadow(namespace, key) {
                Shadow::Written(_) => true,
                Shadow::Deleted => false,
                Shadow::Untouched => self.backend.contains(namespace, key)?,
            };
            txn.stage_delete(namespace, key);
            log::debug!("Buffered delete {}/{} in txn {}", namespace, key, txn.id);
            return Ok(visible);
        }

        self.backend.delete(namespace, key)
    }

    pub fn exists(&self, namespace: &str, key: &str) -> Result<bool> {
        check_address(namespace, key)?;
        let state = self.state.lock();

        if let Some(txn) = state.txn.as_ref() {
            match txn.shadow(namespace, key) {
                Shadow::Written(_) => return Ok(true),
                Shadow::Deleted => return Ok(false),
                Shadow::Untouched => {}
            }
        }

        self.backend.contains(namespace, key)
    }

    /// Keys in a namespace, with pending writes added and pending deletes removed
    pub fn list_keys(&self, namespace: &str) -> Result<Vec<String>> {
        require_non_empty("namespace", namespace)?;
        let state = self.state.lock();

        let on_disk = self.backend.keys(namespace)?;
        match state.txn.as_ref() {
            Some(txn) => Ok(txn.overlay_keys(namespace, on_disk)),
            None => Ok(on_disk),
        }
    }

    /// Open the single transaction buffer, returning its id
    pub fn begin_transaction(&self) -> Result<u64> {
        let mut state = self.state.lock();
        if let Some(txn) = state.txn.as_ref() {
            return Err(CoreError::StateConflict(format!(
                "transaction {} is already open",
                txn.id
            )));
        }

        let id = state.next_txn_id;
        state.next_txn_id += 1;
        state.txn = Some(Transaction::new(id));
        log::debug!("Began transaction {}", id);
        Ok(id)
    }

    /// Seal and persist every buffered write, apply every buffered delete.
    ///
    /// Stops at the first failing record; records applied before it remain on
    /// disk. The buffer is cleared whatever the outcome.
    pub fn commit_transaction(&self) -> Result<()> {
        let mut state = self.state.lock();
        let txn = state
            .txn
            .take()
            .ok_or_else(|| CoreError::StateConflict("no transaction is open".into()))?;

        let id = txn.id;
        let (writes, deletes) = txn.into_parts();
        let total = writes.len() + deletes.len();

        for ((namespace, key), data) in &writes {
            if let Err(e) = self.write_sealed(namespace, key, data) {
                log::warn!("Commit of txn {} failed at {}/{}: {}", id, namespace, key, e);
                return Err(e);
            }
        }
        for (namespace, key) in &deletes {
            if let Err(e) = self.backend.delete(namespace, key) {
                log::warn!("Commit of txn {} failed deleting {}/{}: {}", id, namespace, key, e);
                return Err(e);
            }
        }

        log::info!("Committed transaction {} ({} changes)", id, total);
        Ok(())
    }

    /// Discard the buffer without touching the backend
    pub fn rollback_transaction(&self) -> Result<()> {
        let mut state = self.state.lock();
        let txn = state
            .txn
            .take()
            .ok_or_else(|| CoreError::StateConflict("no transaction is open".into()))?;
        log::info!("Rolled back transaction {} ({} changes discarded)", txn.id, txn.len());
        Ok(())
    }

    pub fn in_transaction(&self) -> bool {
        self.state.lock().txn.is_some()
    }

    // --- Sealing ---

    fn write_sealed(&self, namespace: &str, key: &str, data: &[u8]) -> Result<()> {
        let sealed = self
            .sealer
            .seal(data)
            .map_err(|e| CoreError::StorageFailure(format!("seal {}/{}: {}", namespace, key, e)))?;
        self.backend.write(namespace, key, &sealed)
    }

    fn read_unsealed(&self, namespace: &str, key: &str) -> Result<Zeroizing<Vec<u8>>> {
        let sealed = self
            .backend
            .read(namespace, key)?
            .ok_or_else(|| not_found(namespace, key))?;
        self.sealer.unseal(&sealed).map_err(|e| {
            log::warn!("Unseal of {}/{} failed: {}", namespace, key, e);
            CoreError::StorageFailure(format!("unseal {}/{}: {}", namespace, key, e))
        })
    }
}

fn check_address(namespace: &str, key: &str) -> Result<()> {
    require_non_empty("namespace", namespace)?;
    require_non_empty("key", key)
}

fn not_found(namespace: &str, key: &str) -> CoreError {
    CoreError::NotFound(format!("record {}/{}", namespace, key))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::tee::{TeeBackend, TeeEnclave};

    fn memory_store() -> (SealedStore, Arc<MemoryBackend>) {
        let enclave = Arc::new(TeeEnclave::new(TeeBackend::Simulated).unwrap());
        let backend = Arc::new(MemoryBackend::new());
        let store = SealedStore::new(enclave, backend.clone());
        (store, backend)
    }

    #[test]
    fn test_store_and_retrieve() {
        let (store, backend) = memory_store();
        store.store("ns", "k", b"value").unwrap();
        assert_eq!(store.retrieve("ns", "k").unwrap().as_slice(), b"value");
        assert!(store.exists("ns", "k").unwrap());

        // Only sealed bytes reach the backend
        let raw = backend.read("ns", "k").unwrap().unwrap();
        assert!(!raw.windows(5).any(|w| w == b"value"));
    }

    #[test]
    fn test_missing_record_is_not_found() {
        let (store, _) = memory_store();
        let err = store.retrieve("ns", "absent").unwrap_err();
        assert!(err.is_not_found());
        assert!(!store.exists("ns", "absent").unwrap());
        assert!(!store.remove("ns", "absent").unwrap());
    }

    #[test]
    fn test_tampered_record_is_storage_failure() {
        let (store, backend) = memory_store();
        store.store("ns", "k", b"value").unwrap();

        let mut raw = backend.read("ns", "k").unwrap().unwrap();
        let last = raw.len() - 1;
        raw[last] ^= 0x80;
        backend.write("ns", "k", &raw).unwrap();

        let err = store.retrieve("ns", "k").unwrap_err();
        assert!(matches!(err, CoreError::StorageFailure(_)));
    }

    #[test]
    fn test_empty_address_rejected() {
        let (store, _) = memory_store();
        assert!(matches!(store.store("", "k", b"v"), Err(CoreError::InvalidInput(_))));
        assert!(matches!(store.retrieve("ns", ""), Err(CoreError::InvalidInput(_))));
        assert!(matches!(store.list_keys(""), Err(CoreError::InvalidInput(_))));
    }

    #[test]
    fn test_empty_value_roundtrip() {
        let (store, _) = memory_store();
        store.store("ns", "empty", b"").unwrap();
        assert!(store.retrieve("ns", "empty").unwrap().is_empty());
    }

    #[test]
    fn test_transaction_visibility_and_commit() {
        let (store, backend) = memory_store();
        store.store("ns", "k", b"v0").unwrap();

        store.begin_transaction().unwrap();
        store.store("ns", "k", b"v1").unwrap();
        store.store("ns", "fresh", b"f").unwrap();

        assert_eq!(store.retrieve("ns", "k").unwrap().as_slice(), b"v1");
        assert_eq!(store.retrieve_committed("ns", "k").unwrap().as_slice(), b"v0");
        assert!(store.retrieve_committed("ns", "fresh").unwrap_err().is_not_found());
        assert!(!backend.contains("ns", "fresh").unwrap());

        store.commit_transaction().unwrap();
        assert!(!store.in_transaction());
        assert_eq!(store.retrieve("ns", "k").unwrap().as_slice(), b"v1");
        assert_eq!(store.retrieve_committed("ns", "fresh").unwrap().as_slice(), b"f");
    }

    #[test]
    fn test_rollback_leaves_disk_unchanged() {
        let (store, backend) = memory_store();
        store.store("ns", "k", b"v0").unwrap();
        let before = backend.read("ns", "k").unwrap();

        store.begin_transaction().unwrap();
        store.store("ns", "k", b"v1").unwrap();
        store.remove("ns", "k").unwrap();
        store.store("ns", "other", b"x").unwrap();
        store.rollback_transaction().unwrap();

        assert_eq!(backend.read("ns", "k").unwrap(), before);
        assert!(!backend.contains("ns", "other").unwrap());
        assert_eq!(store.retrieve("ns", "k").unwrap().as_slice(), b"v0");
    }

    #[test]
    fn test_pending_delete_shadows_disk() {
        let (store, _) = memory_store();
        store.store("ns", "a", b"1").unwrap();
        store.store("ns", "b", b"2").unwrap();

        store.begin_transaction().unwrap();
        assert!(store.remove("ns", "a").unwrap());
        assert!(!store.remove("ns", "a").unwrap());
        store.store("ns", "c", b"3").unwrap();

        assert!(store.retrieve("ns", "a").unwrap_err().is_not_found());
        assert!(!store.exists("ns", "a").unwrap());
        assert_eq!(store.list_keys("ns").unwrap(), vec!["b", "c"]);

        // A later write in the same transaction clears the pending delete
        store.store("ns", "a", b"again").unwrap();
        assert_eq!(store.retrieve("ns", "a").unwrap().as_slice(), b"again");

        store.commit_transaction().unwrap();
        assert_eq!(store.list_keys("ns").unwrap(), vec!["a", "b", "c"]);
        assert_eq!(store.retrieve("ns", "a").unwrap().as_slice(), b"again");
    }

    #[test]
    fn test_commit_applies_deletes() {
        let (store, backend) = memory_store();
        store.store("ns", "gone", b"1").unwrap();

        store.begin_transaction().unwrap();
        store.remove("ns", "gone").unwrap();
        assert!(backend.contains("ns", "gone").unwrap());
        store.commit_transaction().unwrap();

        assert!(!backend.contains("ns", "gone").unwrap());
    }

    /// Memory backend that refuses writes to one key
    struct RejectingBackend {
        inner: MemoryBackend,
        reject: &'static str,
    }

    impl StorageBackend for RejectingBackend {
        fn read(&self, namespace: &str, key: &str) -> Result<Option<Vec<u8>>> {
            self.inner.read(namespace, key)
        }
        fn write(&self, namespace: &str, key: &str, data: &[u8]) -> Result<()> {
            if key == self.reject {
                return Err(CoreError::StorageFailure(format!("write {} refused", key)));
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
    fn test_commit_stops_at_first_failed_write() {
        let enclave = Arc::new(TeeEnclave::new(TeeBackend::Simulated).unwrap());
        let backend = Arc::new(RejectingBackend {
            inner: MemoryBackend::new(),
            reject: "b",
        });
        let store = SealedStore::new(enclave, backend.clone());
        store.store("ns", "d", b"old").unwrap();

        store.begin_transaction().unwrap();
        store.store("ns", "a", b"1").unwrap();
        store.store("ns", "b", b"2").unwrap();
        store.store("ns", "c", b"3").unwrap();
        store.remove("ns", "d").unwrap();

        let err = store.commit_transaction().unwrap_err();
        assert!(matches!(err, CoreError::StorageFailure(_)));

        // Applied before the failure: kept. At and after it: never applied.
        assert_eq!(store.retrieve("ns", "a").unwrap().as_slice(), b"1");
        assert!(!backend.contains("ns", "b").unwrap());
        assert!(store.retrieve("ns", "c").unwrap_err().is_not_found());
        assert_eq!(store.retrieve("ns", "d").unwrap().as_slice(), b"old");

        // The buffer is gone either way
        assert!(!store.in_transaction());
        assert!(matches!(store.commit_transaction(), Err(CoreError::StateConflict(_))));
        assert!(matches!(store.rollback_transaction(), Err(CoreError::StateConflict(_))));
        assert_eq!(store.list_keys("ns").unwrap(), vec!["a", "d"]);
    }

    #[test]
    fn test_retrieved_plaintext_is_zeroizing() {
        let (store, _) = memory_store();
        store.store("ns", "k", b"secret").unwrap();

        store.begin_transaction().unwrap();
        store.store("ns", "pending", b"buffered").unwrap();
        let pending: Zeroizing<Vec<u8>> = store.retrieve("ns", "pending").unwrap();
        let committed: Zeroizing<Vec<u8>> = store.retrieve_committed("ns", "k").unwrap();
        assert_eq!(pending.as_slice(), b"buffered");
        assert_eq!(committed.as_slice(), b"secret");
        store.rollback_transaction().unwrap();
    }

    #[test]
    fn test_single_outstanding_transaction() {
        let (store, _) = memory_store();
        let first = store.begin_transaction().unwrap();
        assert!(matches!(store.begin_transaction(), Err(CoreError::StateConflict(_))));
        store.rollback_transaction().unwrap();

        let second = store.begin_transaction().unwrap();
        assert!(second > first);
        store.commit_transaction().unwrap();

        assert!(matches!(store.commit_transaction(), Err(CoreError::StateConflict(_))));
        assert!(matches!(store.rollback_transaction(), Err(CoreError::StateConflict(_))));
    }

    #[test]
    fn test_file_backed_store_survives_reopen() {
        let dir = std::env::temp_dir().join(format!("tee-sealed-test-{}", uuid::Uuid::new_v4()));
        let seed = [3u8; 32];

        {
            let enclave = Arc::new(TeeEnclave::from_seed(TeeBackend::Simulated, &seed).unwrap());
            let backend = Arc::new(FileBackend::open(&dir).unwrap());
            let store = SealedStore::new(enclave, backend);
            store.store("keys", "key_manager", b"{\"keys\":{}}").unwrap();
        }

        let enclave = Arc::new(TeeEnclave::from_seed(TeeBackend::Simulated, &seed).unwrap());
        let backend = Arc::new(FileBackend::open(&dir).unwrap());
        let store = SealedStore::new(enclave, backend);
        assert_eq!(store.retrieve("keys", "key_manager").unwrap().as_slice(), b"{\"keys\":{}}");
        assert_eq!(store.list_keys("keys").unwrap(), vec!["key_manager"]);

        let _ = std::fs::remove_dir_all(&dir);
    }
}
