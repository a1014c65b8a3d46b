//! Device-local named secrets.
//!
//! A named secret is 32 random bytes that are created on first use and
//! then never change. The session cache uses one to encrypt the session
//! key it writes to disk.
//!
//! Backends:
//! - [`FileSecretBackend`]: an owner-only file per secret
//! - [`MemorySecretBackend`]: process-local, for tests
//! - `KeyringSecretBackend` (feature `keyring-store`): the OS credential store

use async_trait::async_trait;
use base64::{engine::general_purpose::STANDARD, Engine};
use rand::rngs::OsRng;
use rand::RngCore;
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};
use tracing::{debug, warn};

use crate::fs::{escape_file_name, remove_if_exists, write_new_atomic};
use lockbox_common::{Error, Result, SensitiveBytes};

/// Length of generated secrets in bytes.
pub const SECRET_LENGTH: usize = 32;

fn random_secret() -> SensitiveBytes {
    let mut bytes = vec![0u8; SECRET_LENGTH];
    OsRng.fill_bytes(&mut bytes);
    SensitiveBytes::new(bytes)
}

fn check_name(name: &str) -> Result<()> {
    if name.is_empty() {
        return Err(Error::InvalidInput("Secret name cannot be empty".to_string()));
    }
    Ok(())
}

/// Decode a stored secret. Anything but exactly [`SECRET_LENGTH`] bytes is
/// corrupt, including an empty value left by an interrupted write.
fn decode_secret(encoded: &str) -> Result<SensitiveBytes> {
    let bytes = STANDARD
        .decode(encoded.trim())
        .map(SensitiveBytes::new)
        .map_err(|e| Error::Serialization(format!("Stored secret is not valid base64: {}", e)))?;
    if bytes.len() != SECRET_LENGTH {
        return Err(Error::Serialization(format!(
            "Stored secret has {} bytes, expected {}",
            bytes.len(),
            SECRET_LENGTH
        )));
    }
    Ok(bytes)
}

/// Source of device-local named secrets.
#[async_trait]
pub trait SecretBackend: Send + Sync {
    /// Backend name for diagnostics.
    fn name(&self) -> &str;

    /// Return the secret stored under `name`, creating it on first use.
    ///
    /// # Postconditions
    /// - Repeated calls with the same name return the same bytes
    /// - The result is always [`SECRET_LENGTH`] bytes; a corrupt stored
    ///   value is replaced with a fresh secret
    ///
    /// # Errors
    /// - `InvalidInput` if `name` is empty
    /// - Backend I/O errors
    async fn get_or_create_named_secret(&self, name: &str) -> Result<SensitiveBytes>;
}

/// Secrets stored as base64 in owner-only files under a directory.
pub struct FileSecretBackend {
    dir: PathBuf,
}

impl FileSecretBackend {
    /// Create a backend storing secrets under `dir`.
    pub fn new(dir: impl AsRef<Path>) -> Self {
        Self {
            dir: dir.as_ref().to_path_buf(),
        }
    }

    fn secret_path(&self, name: &str) -> PathBuf {
        self.dir.join(format!("{}.key", escape_file_name(name)))
    }
}

#[async_trait]
impl SecretBackend for FileSecretBackend {
    fn name(&self) -> &str {
        "file"
    }

    async fn get_or_create_named_secret(&self, name: &str) -> Result<SensitiveBytes> {
        check_name(name)?;
        let path = self.secret_path(name);

        match tokio::fs::read_to_string(&path).await {
            Ok(encoded) => match decode_secret(&encoded) {
                Ok(secret) => return Ok(secret),
                Err(e) => {
                    warn!(secret = name, error = %e, "Stored device secret is corrupt; replacing");
                    remove_if_exists(&path).await?;
                }
            },
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
            Err(e) => return Err(Error::Io(e)),
        }

        let secret = random_secret();
        let encoded = STANDARD.encode(secret.as_bytes());
        if write_new_atomic(&path, encoded.as_bytes()).await? {
            debug!(secret = name, "Created device secret");
            return Ok(secret);
        }

        // Another process created it first; use theirs.
        decode_secret(&tokio::fs::read_to_string(&path).await?)
    }
}

/// Process-local secrets. Clones share the same map.
#[derive(Clone, Default)]
pub struct MemorySecretBackend {
    secrets: Arc<Mutex<HashMap<String, SensitiveBytes>>>,
}

impl MemorySecretBackend {
    /// Create an empty backend.
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl SecretBackend for MemorySecretBackend {
    fn name(&self) -> &str {
        "memory"
    }

    async fn get_or_create_named_secret(&self, name: &str) -> Result<SensitiveBytes> {
        check_name(name)?;
        let mut secrets = self
            .secrets
            .lock()
            .map_err(|_| Error::Storage("Secret map lock poisoned".to_string()))?;
        Ok(secrets
            .entry(name.to_string())
            .or_insert_with(random_secret)
            .clone())
    }
}

/// Secrets stored in the OS keyring as base64 strings.
#[cfg(feature = "keyring-store")]
pub struct KeyringSecretBackend {
    service: String,
}

#[cfg(feature = "keyring-store")]
impl KeyringSecretBackend {
    /// Create a backend storing entries under `service`.
    pub fn new(service: impl Into<String>) -> Self {
        Self {
            service: service.into(),
        }
    }

    fn entry(&self, name: &str) -> Result<keyring::Entry> {
        keyring::Entry::new(&self.service, name)
            .map_err(|e| Error::Storage(format!("failed to create keyring entry: {e}")))
    }
}

#[cfg(feature = "keyring-store")]
#[async_trait]
impl SecretBackend for KeyringSecretBackend {
    fn name(&self) -> &str {
        "keyring"
    }

    async fn get_or_create_named_secret(&self, name: &str) -> Result<SensitiveBytes> {
        check_name(name)?;
        let entry = self.entry(name)?;

        let existing = match entry.get_password() {
            Ok(encoded) => Some(encoded),
            Err(keyring::Error::NoEntry) => None,
            Err(e) => return Err(Error::Storage(format!("failed to read from keyring: {e}"))),
        };

        match existing.as_deref().map(decode_secret) {
            Some(Ok(secret)) => Ok(secret),
            stale => {
                if let Some(Err(e)) = stale {
                    warn!(secret = name, error = %e, "Keyring secret is corrupt; replacing");
                }
                let secret = random_secret();
                entry
                    .set_password(&STANDARD.encode(secret.as_bytes()))
                    .map_err(|e| {
                        Error::Storage(format!("failed to store secret in keyring: {e}"))
                    })?;
                debug!(secret = name, "Created keyring secret");
                Ok(secret)
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::fs::PRIVATE_FILE_MODE;
    use tempfile::TempDir;

    #[tokio::test]
    async fn test_file_secret_is_stable() {
        let temp = TempDir::new().unwrap();
        let backend = FileSecretBackend::new(temp.path());

        let first = backend.get_or_create_named_secret("session").await.unwrap();
        let second = backend.get_or_create_named_secret("session").await.unwrap();

        assert_eq!(first.len(), SECRET_LENGTH);
        assert_eq!(first.as_bytes(), second.as_bytes());
    }

    #[tokio::test]
    async fn test_file_secret_survives_new_backend() {
        let temp = TempDir::new().unwrap();
        let first = FileSecretBackend::new(temp.path())
            .get_or_create_named_secret("session")
            .await
            .unwrap();
        let second = FileSecretBackend::new(temp.path())
            .get_or_create_named_secret("session")
            .await
            .unwrap();

        assert_eq!(first.as_bytes(), second.as_bytes());
    }

    #[tokio::test]
    async fn test_corrupt_secret_file_is_replaced() {
        let temp = TempDir::new().unwrap();
        let backend = FileSecretBackend::new(temp.path());
        let path = backend.secret_path("session");

        for stored in ["", "c2hvcnQ=", "not base64!"] {
            std::fs::write(&path, stored).unwrap();

            let first = backend.get_or_create_named_secret("session").await.unwrap();
            let second = backend.get_or_create_named_secret("session").await.unwrap();
            let third = backend.get_or_create_named_secret("session").await.unwrap();

            assert_eq!(first.len(), SECRET_LENGTH);
            assert_eq!(first.as_bytes(), second.as_bytes());
            assert_eq!(first.as_bytes(), third.as_bytes());
        }
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_concurrent_creation_agrees() {
        let temp = TempDir::new().unwrap();
        let backend = Arc::new(FileSecretBackend::new(temp.path()));

        let tasks: Vec<_> = (0..8)
            .map(|_| {
                let backend = backend.clone();
                tokio::spawn(async move {
                    backend.get_or_create_named_secret("session").await.unwrap()
                })
            })
            .collect();
        let mut secrets = Vec::new();
        for task in tasks {
            secrets.push(task.await.unwrap());
        }

        assert!(secrets.iter().all(|s| s.len() == SECRET_LENGTH));
        assert!(secrets.windows(2).all(|w| w[0] == w[1]));
    }

    #[tokio::test]
    async fn test_names_are_independent() {
        let backend = MemorySecretBackend::new();
        let a = backend.get_or_create_named_secret("a").await.unwrap();
        let b = backend.get_or_create_named_secret("b").await.unwrap();

        assert_ne!(a.as_bytes(), b.as_bytes());
    }

    #[tokio::test]
    async fn test_empty_name_rejected() {
        let backend = MemorySecretBackend::new();
        assert!(matches!(
            backend.get_or_create_named_secret("").await,
            Err(Error::InvalidInput(_))
        ));
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_file_secret_is_owner_only() {
        use std::os::unix::fs::PermissionsExt;

        let temp = TempDir::new().unwrap();
        let backend = FileSecretBackend::new(temp.path().join("secrets"));
        backend.get_or_create_named_secret("session").await.unwrap();

        let mode = std::fs::metadata(backend.secret_path("session"))
            .unwrap()
            .permissions()
            .mode();
        assert_eq!(mode & 0o777, PRIVATE_FILE_MODE);
    }
}
