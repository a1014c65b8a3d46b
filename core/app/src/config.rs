//! Application configuration.

use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use lockbox_common::{AccountId, DeviceId, Error, Result};
use lockbox_crypto::KdfParams;
use lockbox_storage::{FileSecretBackend, RemoteRegistry, RemoteStore, SecretBackend};
use lockbox_sync::SyncConfig;
use lockbox_vault::DEFAULT_SESSION_TIMEOUT;

/// Directory under the home directory holding all Lockbox state.
pub const DEFAULT_DIR_NAME: &str = ".lockbox";

/// What a mutation does when the remote push fails.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RemotePolicy {
    /// Keep the local change and report the failure.
    #[default]
    BestEffort,
    /// Fail the operation. The local replica has already been written.
    Required,
}

/// Where device secrets live.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SecretStoreKind {
    #[default]
    File,
    /// OS keyring; requires the `keyring-store` feature.
    Keyring,
}

/// Remote backend selection, resolved through a [`RemoteRegistry`].
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RemoteSpec {
    /// Registered backend name, e.g. "directory".
    pub backend: String,
    /// Backend-specific settings.
    #[serde(default)]
    pub config: serde_json::Value,
}

impl RemoteSpec {
    /// A shared-directory remote rooted at `root`.
    pub fn directory(root: impl AsRef<Path>) -> Self {
        Self {
            backend: "directory".to_string(),
            config: serde_json::json!({ "root": root.as_ref().to_string_lossy() }),
        }
    }
}

/// Configuration for a [`crate::VaultService`].
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AppConfig {
    /// Local replica file.
    pub vault_path: PathBuf,
    /// Session cache file.
    pub session_path: PathBuf,
    /// Directory for file-backed device secrets.
    pub secrets_dir: PathBuf,
    #[serde(default)]
    pub secret_store: SecretStoreKind,
    /// Caller-supplied account identifier used as the remote key.
    pub account: String,
    /// Device identifier written into remote records. Defaults to host and pid.
    #[serde(default)]
    pub device: Option<String>,
    #[serde(default = "default_session_timeout_secs")]
    pub session_timeout_secs: u64,
    /// KDF parameters for new vaults and rotations.
    #[serde(default)]
    pub kdf: KdfParams,
    /// Remote backend; `None` keeps the vault local-only.
    #[serde(default)]
    pub remote: Option<RemoteSpec>,
    #[serde(default)]
    pub remote_policy: RemotePolicy,
    #[serde(default)]
    pub sync: SyncConfig,
}

fn default_session_timeout_secs() -> u64 {
    DEFAULT_SESSION_TIMEOUT.as_secs()
}

impl AppConfig {
    /// Configuration with every path under `dir`.
    pub fn in_dir(dir: impl AsRef<Path>) -> Self {
        let dir = dir.as_ref();
        Self {
            vault_path: dir.join("vault.json"),
            session_path: dir.join("session.json"),
            secrets_dir: dir.join("secrets"),
            secret_store: SecretStoreKind::default(),
            account: "default".to_string(),
            device: None,
            session_timeout_secs: default_session_timeout_secs(),
            kdf: KdfParams::default(),
            remote: None,
            remote_policy: RemotePolicy::default(),
            sync: SyncConfig::default(),
        }
    }

    /// Configuration rooted at `~/.lockbox`.
    ///
    /// # Errors
    /// - `NotFound` if the home directory cannot be determined
    pub fn default_paths() -> Result<Self> {
        let home = dirs::home_dir()
            .ok_or_else(|| Error::NotFound("Home directory not found".to_string()))?;
        Ok(Self::in_dir(home.join(DEFAULT_DIR_NAME)))
    }

    /// Parse a JSON configuration.
    pub fn from_json(json: &str) -> Result<Self> {
        let config: Self = serde_json::from_str(json)?;
        config.validate()?;
        Ok(config)
    }

    /// Pretty-printed JSON, as read by `from_json`.
    pub fn to_json(&self) -> Result<String> {
        Ok(serde_json::to_string_pretty(self)?)
    }

    /// Check values that serde cannot.
    pub fn validate(&self) -> Result<()> {
        AccountId::new(self.account.as_str())?;
        self.kdf.validate()?;
        if self.session_timeout_secs == 0 {
            return Err(Error::InvalidInput(
                "Session timeout must be non-zero".to_string(),
            ));
        }
        Ok(())
    }

    /// Validated account identifier.
    pub fn account_id(&self) -> Result<AccountId> {
        AccountId::new(self.account.as_str())
    }

    /// Configured device name, else `<hostname>-<pid>`.
    pub fn device_id(&self) -> DeviceId {
        match &self.device {
            Some(device) => DeviceId::new(device.as_str()),
            None => DeviceId::current(),
        }
    }

    /// Lifetime of a saved session.
    pub fn session_timeout(&self) -> Duration {
        Duration::from_secs(self.session_timeout_secs)
    }

    /// Build the configured secret backend.
    ///
    /// # Errors
    /// - `InvalidInput` if the keyring is selected but not compiled in
    pub fn secret_backend(&self) -> Result<Arc<dyn SecretBackend>> {
        match self.secret_store {
            SecretStoreKind::File => Ok(Arc::new(FileSecretBackend::new(&self.secrets_dir))),
            #[cfg(feature = "keyring-store")]
            SecretStoreKind::Keyring => Ok(Arc::new(lockbox_storage::KeyringSecretBackend::new(
                "lockbox",
            ))),
            #[cfg(not(feature = "keyring-store"))]
            SecretStoreKind::Keyring => Err(Error::InvalidInput(
                "Built without keyring support".to_string(),
            )),
        }
    }

    /// Resolve the configured remote, if any.
    pub fn remote_store(&self, registry: &RemoteRegistry) -> Result<Option<Arc<dyn RemoteStore>>> {
        self.remote
            .as_ref()
            .map(|spec| registry.resolve(&spec.backend, spec.config.clone()))
            .transpose()
    }
}
