//! Enclave configuration
//!
//! Defaults, then an optional JSON file, then `TEE_VAULT_*` environment
//! overrides.

use crate::error::{CoreError, Result};
use crate::keys::{rsa_key, symmetric, ExpirationPolicy, KeyType};
use crate::tee::TeeBackend;
use rand::RngCore;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use zeroize::Zeroizing;

pub const ENV_DATA_DIR: &str = "TEE_VAULT_DATA_DIR";
pub const ENV_BACKEND: &str = "TEE_VAULT_BACKEND";
pub const ENV_ROOT_SEED_FILE: &str = "TEE_VAULT_ROOT_SEED_FILE";
pub const ENV_ENFORCE_EXPIRATION: &str = "TEE_VAULT_ENFORCE_EXPIRATION";
pub const ENV_EPHEMERAL: &str = "TEE_VAULT_EPHEMERAL";

const DEFAULT_DATA_DIR: &str = "tee-vault-data";
const ROOT_SEED_NAME: &str = "root.seed";
const ROOT_SEED_LEN: usize = 32;
const MIN_ROOT_SEED_LEN: usize = 16;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct EnclaveConfig {
    pub backend: TeeBackend,
    /// Root of the file backend and default home of the root seed
    pub data_dir: PathBuf,
    /// Hex root seed; `<data_dir>/root.seed` when unset
    pub root_seed_file: Option<PathBuf>,
    pub expiration_policy: ExpirationPolicy,
    /// Memory backend and a per-process root key
    pub ephemeral: bool,
    /// Generate one key per type on first start
    pub provision_default_keys: bool,
    pub symmetric_bits: u32,
    pub rsa_bits: u32,
    pub ec_bits: u32,
    pub expiration_days: u32,
}

impl Default for EnclaveConfig {
    fn default() -> Self {
        Self {
            backend: TeeBackend::Simulated,
            data_dir: PathBuf::from(DEFAULT_DATA_DIR),
            root_seed_file: None,
            expiration_policy: ExpirationPolicy::Advisory,
            ephemeral: false,
            provision_default_keys: true,
            symmetric_bits: 256,
            rsa_bits: 2048,
            ec_bits: 256,
            expiration_days: 365,
        }
    }
}

impl EnclaveConfig {
    /// Read a JSON config file and apply environment overrides
    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let text = std::fs::read_to_string(path).map_err(|e| {
            CoreError::StorageFailure(format!("read config {}: {}", path.display(), e))
        })?;
        let mut config: EnclaveConfig = serde_json::from_str(&text)
            .map_err(|e| CoreError::InvalidInput(format!("config {}: {}", path.display(), e)))?;
        config.apply_env()?;
        config.validate()?;
        Ok(config)
    }

    /// Defaults plus environment overrides
    pub fn from_env() -> Result<Self> {
        let mut config = Self::default();
        config.apply_env()?;
        config.validate()?;
        Ok(config)
    }

    pub fn save(&self, path: impl AsRef<Path>) -> Result<()> {
        let json = serde_json::to_string_pretty(self)?;
        std::fs::write(path.as_ref(), json)?;
        Ok(())
    }

    pub fn apply_env(&mut self) -> Result<()> {
        self.apply_overrides(|name| std::env::var(name).ok())
    }

    /// Apply overrides from any variable source
    pub fn apply_overrides<F>(&mut self, lookup: F) -> Result<()>
    where
        F: Fn(&str) -> Option<String>,
    {
        if let Some(dir) = lookup(ENV_DATA_DIR) {
            self.data_dir = PathBuf::from(dir);
        }
        if let Some(name) = lookup(ENV_BACKEND) {
            self.backend = TeeBackend::parse(&name).ok_or_else(|| {
                CoreError::InvalidInput(format!("{}: unknown backend '{}'", ENV_BACKEND, name))
            })?;
        }
        if let Some(file) = lookup(ENV_ROOT_SEED_FILE) {
            self.root_seed_file = Some(PathBuf::from(file));
        }
        if let Some(flag) = lookup(ENV_ENFORCE_EXPIRATION) {
            self.expiration_policy = if parse_flag(ENV_ENFORCE_EXPIRATION, &flag)? {
                ExpirationPolicy::Enforce
            } else {
                ExpirationPolicy::Advisory
            };
        }
        if let Some(flag) = lookup(ENV_EPHEMERAL) {
            self.ephemeral = parse_flag(ENV_EPHEMERAL, &flag)?;
        }
        Ok(())
    }

    pub fn validate(&self) -> Result<()> {
        symmetric::validate_bits(self.symmetric_bits)?;
        rsa_key::validate_bits(self.rsa_bits)?;
        if self.ec_bits == 0 {
            return Err(CoreError::InvalidInput("ec_bits must be positive".into()));
        }
        if !self.ephemeral && self.data_dir.as_os_str().is_empty() {
            return Err(CoreError::InvalidInput("data_dir must not be empty".into()));
        }
        Ok(())
    }

    /// Key type and size pairs for default provisioning
    pub fn default_keys(&self) -> [(KeyType, u32); 3] {
        [
            (KeyType::Symmetric, self.symmetric_bits),
            (KeyType::RsaAsymmetric, self.rsa_bits),
            (KeyType::EcAsymmetric, self.ec_bits),
        ]
    }

    pub fn sealed_dir(&self) -> PathBuf {
        self.data_dir.join("sealed")
    }

    pub fn root_seed_path(&self) -> PathBuf {
        self.root_seed_file
            .clone()
            .unwrap_or_else(|| self.data_dir.join(ROOT_SEED_NAME))
    }

    /// Read the hex root seed, creating a random one on first start
    pub fn load_or_create_root_seed(&self) -> Result<Zeroizing<Vec<u8>>> {
        let path = self.root_seed_path();
        match std::fs::read_to_string(&path) {
            Ok(text) => {
                let text = Zeroizing::new(text);
                let seed = Zeroizing::new(hex::decode(text.trim()).map_err(|e| {
                    CoreError::InvalidInput(format!("root seed {}: {}", path.display(), e))
                })?);
                if seed.len() < MIN_ROOT_SEED_LEN {
                    return Err(CoreError::InvalidInput(format!(
                        "root seed {} is shorter than {} bytes",
                        path.display(),
                        MIN_ROOT_SEED_LEN
                    )));
                }
                Ok(seed)
            }
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                let mut seed = Zeroizing::new(vec![0u8; ROOT_SEED_LEN]);
                rand::rngs::OsRng.fill_bytes(&mut seed);
                write_seed_file(&path, &Zeroizing::new(hex::encode(&*seed)))?;
                log::info!("Created root seed at {}", path.display());
                Ok(seed)
            }
            Err(e) => Err(CoreError::StorageFailure(format!(
                "read root seed {}: {}",
                path.display(),
                e
            ))),
        }
    }
}

fn write_seed_file(path: &Path, hex_seed: &str) -> Result<()> {
    if let Some(parent) = path.parent() {
        if !parent.as_os_str().is_empty() {
            std::fs::create_dir_all(parent)?;
        }
    }
    std::fs::write(path, hex_seed)?;
    #[cfg(unix)]
    {
        use std::os::unix::fs::PermissionsExt;
        std::fs::set_permissions(path, std::fs::Permissions::from_mode(0o600))?;
    }
    Ok(())
}

fn parse_flag(name: &str, value: &str) -> Result<bool> {
    match value.trim().to_ascii_lowercase().as_str() {
        "1" | "true" | "yes" | "on" => Ok(true),
        "0" | "false" | "no" | "off" | "" => Ok(false),
        other => Err(CoreError::InvalidInput(format!(
            "{}: expected a boolean, got '{}'",
            name, other
        ))),
    }
}
