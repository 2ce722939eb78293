//! Raw persistence backends for sealed records
//!
//! A backend only ever sees sealed bytes. `FileBackend` maps each namespace to
//! a directory and each key to a file; names are percent-encoded so any
//! caller-chosen string becomes a safe, reversible path component.

use crate::error::{CoreError, Result};
use parking_lot::RwLock;
use std::collections::{BTreeMap, BTreeSet};
use std::io::Write;
use std::path::{Path, PathBuf};

pub trait StorageBackend: Send + Sync {
    /// Read the raw bytes at an address, `None` when absent
    fn read(&self, namespace: &str, key: &str) -> Result<Option<Vec<u8>>>;

    /// Create or replace the bytes at an address
    fn write(&self, namespace: &str, key: &str, data: &[u8]) -> Result<()>;

    /// Delete an address, returning whether it existed
    fn delete(&self, namespace: &str, key: &str) -> Result<bool>;

    fn contains(&self, namespace: &str, key: &str) -> Result<bool>;

    /// All keys stored in a namespace, sorted
    fn keys(&self, namespace: &str) -> Result<Vec<String>>;
}

/// One directory per namespace, one file per key
pub struct FileBackend {
    root: PathBuf,
}

impl FileBackend {
    /// Open (and create if needed) a storage root directory
    pub fn open(root: impl AsRef<Path>) -> Result<Self> {
        let root = root.as_ref().to_path_buf();
        std::fs::create_dir_all(&root).map_err(|e| {
            CoreError::StorageFailure(format!("create {}: {}", root.display(), e))
        })?;
        log::debug!("File backend rooted at {}", root.display());
        Ok(Self { root })
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    fn namespace_dir(&self, namespace: &str) -> PathBuf {
        self.root.join(encode_component(namespace))
    }

    fn file_path(&self, namespace: &str, key: &str) -> PathBuf {
        self.namespace_dir(namespace).join(encode_component(key))
    }
}

impl StorageBackend for FileBackend {
    fn read(&self, namespace: &str, key: &str) -> Result<Option<Vec<u8>>> {
        let path = self.file_path(namespace, key);
        match std::fs::read(&path) {
            Ok(data) => Ok(Some(data)),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
            Err(e) => Err(CoreError::StorageFailure(format!(
                "read {}: {}",
                path.display(),
                e
            ))),
        }
    }

    fn write(&self, namespace: &str, key: &str, data: &[u8]) -> Result<()> {
        let dir = self.namespace_dir(namespace);
        std::fs::create_dir_all(&dir)
            .map_err(|e| CoreError::StorageFailure(format!("create {}: {}", dir.display(), e)))?;

        // Write to a hidden temp file and rename so readers never see a torn record
        let tmp = dir.join(format!(".{}.tmp", uuid::Uuid::new_v4()));
        let target = self.file_path(namespace, key);
        let result = (|| -> std::io::Result<()> {
            let mut file = std::fs::File::create(&tmp)?;
            file.write_all(data)?;
            file.sync_all()?;
            std::fs::rename(&tmp, &target)
        })();

        if let Err(e) = result {
            let _ = std::fs::remove_file(&tmp);
            return Err(CoreError::StorageFailure(format!(
                "write {}: {}",
                target.display(),
                e
            )));
        }
        Ok(())
    }

    fn delete(&self, namespace: &str, key: &str) -> Result<bool> {
        let path = self.file_path(namespace, key);
        match std::fs::remove_file(&path) {
            Ok(()) => Ok(true),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(false),
            Err(e) => Err(CoreError::StorageFailure(format!(
                "delete {}: {}",
                path.display(),
                e
            ))),
        }
    }

    fn contains(&self, namespace: &str, key: &str) -> Result<bool> {
        let path = self.file_path(namespace, key);
        match std::fs::metadata(&path) {
            Ok(meta) => Ok(meta.is_file()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(false),
            Err(e) => Err(CoreError::StorageFailure(format!(
                "stat {}: {}",
                path.display(),
                e
            ))),
        }
    }

    fn keys(&self, namespace: &str) -> Result<Vec<String>> {
        let dir = self.namespace_dir(namespace);
        let entries = match std::fs::read_dir(&dir) {
            Ok(entries) => entries,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
            Err(e) => {
                return Err(CoreError::StorageFailure(format!(
                    "list {}: {}",
                    dir.display(),
                    e
                )))
            }
        };

        let mut keys = BTreeSet::new();
        for entry in entries {
            let entry = entry?;
            let name = entry.file_name();
            let Some(name) = name.to_str() else {
                continue;
            };
            // Temp files start with '.', which the encoder never emits
            if name.starts_with('.') {
                continue;
            }
            match decode_component(name) {
                Some(key) => {
                    keys.insert(key);
                }
                None => log::warn!("Skipping foreign file in {}: {}", dir.display(), name),
            }
        }
        Ok(keys.into_iter().collect())
    }
}

/// Ephemeral backend, contents vanish with the process
#[derive(Default)]
pub struct MemoryBackend {
    records: RwLock<BTreeMap<(String, String), Vec<u8>>>,
}

impl MemoryBackend {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.records.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.records.read().is_empty()
    }
}

impl StorageBackend for MemoryBackend {
    fn read(&self, namespace: &str, key: &str) -> Result<Option<Vec<u8>>> {
        Ok(self
            .records
            .read()
            .get(&(namespace.to_string(), key.to_string()))
            .cloned())
    }

    fn write(&self, namespace: &str, key: &str, data: &[u8]) -> Result<()> {
        self.records
            .write()
            .insert((namespace.to_string(), key.to_string()), data.to_vec());
        Ok(())
    }

    fn delete(&self, namespace: &str, key: &str) -> Result<bool> {
        Ok(self
            .records
            .write()
            .remove(&(namespace.to_string(), key.to_string()))
            .is_some())
    }

    fn contains(&self, namespace: &str, key: &str) -> Result<bool> {
        Ok(self
            .records
            .read()
            .contains_key(&(namespace.to_string(), key.to_string())))
    }

    fn keys(&self, namespace: &str) -> Result<Vec<String>> {
        Ok(self
            .records
            .read()
            .keys()
            .filter(|(ns, _)| ns == namespace)
            .map(|(_, key)| key.clone())
            .collect())
    }
}

/// Percent-encode everything outside `[A-Za-z0-9_.~-]`, plus a leading '.'
pub fn encode_component(name: &str) -> String {
    let encoded = urlencoding::encode(name);
    match encoded.strip_prefix('.') {
        Some(rest) => format!("%2E{}", rest),
        None => encoded.into_owned(),
    }
}

/// Inverse of [`encode_component`]; `None` for names it could not have produced
pub fn decode_component(encoded: &str) -> Option<String> {
    let decoded = urlencoding::decode(encoded).ok()?.into_owned();
    if encode_component(&decoded) != encoded {
        return None;
    }
    Some(decoded)
}
