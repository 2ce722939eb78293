//! Key records and the key table persisted by the key store

use crate::error::{CoreError, Result};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use zeroize::{Zeroize, Zeroizing};

pub const SECONDS_PER_DAY: u64 = 86_400;

/// Key families the store can generate and dispatch on
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub enum KeyType {
    /// AES-GCM
    Symmetric,
    /// RSA-OAEP encryption, PKCS#1 v1.5 signatures
    RsaAsymmetric,
    /// ECDSA on NIST P-256 / P-384 / P-521
    EcAsymmetric,
}

impl KeyType {
    pub fn name(&self) -> &str {
        match self {
            KeyType::Symmetric => "symmetric",
            KeyType::RsaAsymmetric => "rsa",
            KeyType::EcAsymmetric => "ec",
        }
    }

    pub fn parse(name: &str) -> Option<Self> {
        match name.to_ascii_lowercase().as_str() {
            "symmetric" | "aes" => Some(KeyType::Symmetric),
            "rsa" | "rsaasymmetric" => Some(KeyType::RsaAsymmetric),
            "ec" | "ecdsa" | "ecasymmetric" => Some(KeyType::EcAsymmetric),
            _ => None,
        }
    }
}

/// One key in the table. Material is zeroed when the record is dropped.
#[derive(Clone, Serialize, Deserialize)]
pub struct KeyRecord {
    pub id: String,
    #[serde(rename = "type")]
    pub key_type: KeyType,
    /// Raw symmetric key, or PKCS#8 DER private key
    #[serde(with = "material_b64")]
    material: Vec<u8>,
    /// Key size, or curve size for EC keys
    #[serde(default)]
    pub bits: u32,
    pub created_at: u64,
    /// Advisory unless the store enforces expiration
    pub expires_at: u64,
    pub active: bool,
}

impl KeyRecord {
    pub fn new(
        id: String,
        key_type: KeyType,
        bits: u32,
        material: Vec<u8>,
        created_at: u64,
        expires_at: u64,
    ) -> Self {
        Self {
            id,
            key_type,
            material,
            bits,
            created_at,
            expires_at,
            active: true,
        }
    }

    pub fn material(&self) -> &[u8] {
        &self.material
    }

    pub fn is_expired(&self, now: u64) -> bool {
        now >= self.expires_at
    }

    /// Human-readable algorithm label, e.g. `AES-256-GCM` or `ECDSA-P384`
    pub fn algorithm(&self) -> String {
        match self.key_type {
            KeyType::Symmetric => format!("AES-{}-GCM", self.bits),
            KeyType::RsaAsymmetric => format!("RSA-{}", self.bits),
            KeyType::EcAsymmetric => format!("ECDSA-P{}", self.bits),
        }
    }
}

impl Drop for KeyRecord {
    fn drop(&mut self) {
        self.material.zeroize();
    }
}

impl std::fmt::Debug for KeyRecord {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("KeyRecord")
            .field("id", &self.id)
            .field("key_type", &self.key_type)
            .field("material", &"<redacted>")
            .field("bits", &self.bits)
            .field("created_at", &self.created_at)
            .field("expires_at", &self.expires_at)
            .field("active", &self.active)
            .finish()
    }
}

/// Key metadata without material, safe to display
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct KeyInfo {
    pub id: String,
    pub key_type: KeyType,
    pub algorithm: String,
    pub bits: u32,
    pub created_at: u64,
    pub expires_at: u64,
    pub active: bool,
    /// Whether this key is the active-key-for-type target
    pub current: bool,
}

/// All keys plus the "active key for type" index
#[derive(Debug, Default, Serialize, Deserialize)]
pub struct KeyTable {
    pub keys: BTreeMap<String, KeyRecord>,
    pub active: BTreeMap<KeyType, String>,
}

impl KeyTable {
    pub fn active_id(&self, key_type: KeyType) -> Option<&str> {
        self.active.get(&key_type).map(String::as_str)
    }

    pub fn is_active_target(&self, id: &str) -> bool {
        self.active.values().any(|active| active == id)
    }

    pub fn info(&self, record: &KeyRecord) -> KeyInfo {
        KeyInfo {
            id: record.id.clone(),
            key_type: record.key_type,
            algorithm: record.algorithm(),
            bits: record.bits,
            created_at: record.created_at,
            expires_at: record.expires_at,
            active: record.active,
            current: self.active_id(record.key_type) == Some(record.id.as_str()),
        }
    }

    /// Serialize to JSON; the buffer is zeroed when dropped
    pub fn to_json(&self) -> Result<Zeroizing<Vec<u8>>> {
        Ok(Zeroizing::new(serde_json::to_vec(self)?))
    }

    /// Parse a persisted table and check its invariants
    pub fn from_json(data: &[u8]) -> Result<Self> {
        let table: KeyTable = serde_json::from_slice(data)?;

        for (id, record) in &table.keys {
            if *id != record.id {
                return Err(CoreError::StorageFailure(format!(
                    "key table entry {} holds record {}",
                    id, record.id
                )));
            }
        }
        for (key_type, id) in &table.active {
            match table.keys.get(id) {
                Some(record) if record.key_type == *key_type => {}
                _ => {
                    return Err(CoreError::StorageFailure(format!(
                        "active {} key {} is missing or has the wrong type",
                        key_type.name(),
                        id
                    )))
                }
            }
        }
        Ok(table)
    }
}

mod material_b64 {
    use base64::{engine::general_purpose::STANDARD, Engine};
    use serde::{Deserialize, Deserializer, Serializer};
    use zeroize::Zeroize;

    pub fn serialize<S: Serializer>(bytes: &[u8], serializer: S) -> Result<S::Ok, S::Error> {
        let mut encoded = STANDARD.encode(bytes);
        let result = serializer.serialize_str(&encoded);
        encoded.zeroize();
        result
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Vec<u8>, D::Error> {
        let mut encoded = String::deserialize(deserializer)?;
        let decoded = STANDARD.decode(&encoded).map_err(serde::de::Error::custom);
        encoded.zeroize();
        decoded
    }
}
