//! Pending-write buffer for the sealed store's single open transaction
//!
//! Buffered values are plaintext and are zeroed when dropped.

use std::collections::{BTreeMap, BTreeSet};
use zeroize::Zeroizing;

/// A `(namespace, key)` address in the sealed store
pub type Address = (String, String);

/// What the open transaction says about one address
#[derive(Debug, PartialEq, Eq)]
pub enum Shadow<'a> {
    /// Buffered write shadows whatever is on disk
    Written(&'a [u8]),
    /// Buffered delete hides whatever is on disk
    Deleted,
    /// Untouched, fall through to disk
    Untouched,
}

#[derive(Debug, Default)]
pub struct Transaction {
    pub id: u64,
    pending_writes: BTreeMap<Address, Zeroizing<Vec<u8>>>,
    pending_deletes: BTreeSet<Address>,
}

impl Transaction {
    pub fn new(id: u64) -> Self {
        Self {
            id,
            ..Default::default()
        }
    }

    pub fn stage_write(&mut self, namespace: &str, key: &str, data: Vec<u8>) {
        let address = (namespace.to_string(), key.to_string());
        self.pending_deletes.remove(&address);
        self.pending_writes.insert(address, Zeroizing::new(data));
    }

    pub fn stage_delete(&mut self, namespace: &str, key: &str) {
        let address = (namespace.to_string(), key.to_string());
        self.pending_writes.remove(&address);
        self.pending_deletes.insert(address);
    }

    pub fn shadow(&self, namespace: &str, key: &str) -> Shadow<'_> {
        let address = (namespace.to_string(), key.to_string());
        if let Some(data) = self.pending_writes.get(&address) {
            Shadow::Written(data.as_slice())
        } else if self.pending_deletes.contains(&address) {
            Shadow::Deleted
        } else {
            Shadow::Untouched
        }
    }

    /// Overlay the buffer on a namespace's on-disk key listing
    pub fn overlay_keys(&self, namespace: &str, on_disk: Vec<String>) -> Vec<String> {
        let mut keys: BTreeSet<String> = on_disk.into_iter().collect();
        for (ns, key) in self.pending_writes.keys() {
            if ns == namespace {
                keys.insert(key.clone());
            }
        }
        for (ns, key) in &self.pending_deletes {
            if ns == namespace {
                keys.remove(key);
            }
        }
        keys.into_iter().collect()
    }

    pub fn len(&self) -> usize {
        self.pending_writes.len() + self.pending_deletes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Split into writes and deletes for commit
    pub fn into_parts(self) -> (BTreeMap<Address, Zeroizing<Vec<u8>>>, BTreeSet<Address>) {
        (self.pending_writes, self.pending_deletes)
    }
}
