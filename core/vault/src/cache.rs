//! Time-boxed session cache.
//!
//! Lets later invocations skip passphrase derivation while a session is
//! live. The vault key is wrapped under a random session key, and the
//! session key is wrapped under a device secret from a [`SecretBackend`].
//! Both wrapped keys are written to an owner-only session file together
//! with an expiry time.

use base64::{engine::general_purpose::STANDARD, Engine};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Mutex;
use tracing::{debug, info, warn};

use lockbox_common::{Error, Result};
use lockbox_crypto::{unwrap_key, wrap_key, DeviceSecret, SessionKey, SymmetricKey, VaultKey};
use lockbox_storage::fs::{read_existing, remove_if_exists, write_atomic};
use lockbox_storage::{FileLock, SecretBackend};

/// Default session lifetime.
pub const DEFAULT_SESSION_TIMEOUT: Duration = Duration::from_secs(30 * 60);

/// Name of the device secret protecting session keys.
pub const DEFAULT_SECRET_NAME: &str = "lockbox-session";

/// On-disk session record.
#[derive(Debug, Clone, Serialize, Deserialize)]
struct SessionRecord {
    /// Vault key wrapped under the session key.
    encrypted_vault_key: String,
    nonce: String,
    /// Session key wrapped under the device secret.
    session_key: String,
    session_key_nonce: String,
    created_at: DateTime<Utc>,
    expires_at: DateTime<Utc>,
}

impl SessionRecord {
    fn decode(field: &str) -> Result<Vec<u8>> {
        STANDARD
            .decode(field)
            .map_err(|e| Error::Serialization(format!("Invalid session field: {}", e)))
    }

    fn unwrap_session_key(&self, device: &DeviceSecret) -> Result<SessionKey> {
        unwrap_key(
            device,
            &Self::decode(&self.session_key_nonce)?,
            &Self::decode(&self.session_key)?,
        )
    }

    fn unwrap_vault_key(&self, session_key: &SessionKey) -> Result<VaultKey> {
        unwrap_key(
            session_key,
            &Self::decode(&self.nonce)?,
            &Self::decode(&self.encrypted_vault_key)?,
        )
    }
}

/// Session cache bound to one session file.
pub struct SessionCache {
    path: PathBuf,
    lock: FileLock,
    timeout: Duration,
    secrets: Arc<dyn SecretBackend>,
    secret_name: String,
    session_key: Mutex<Option<SessionKey>>,
}

impl SessionCache {
    /// Create a cache writing to `path` with the default timeout and secret name.
    pub fn new(path: impl AsRef<Path>, secrets: Arc<dyn SecretBackend>) -> Self {
        let path = path.as_ref().to_path_buf();
        let lock = FileLock::for_file(&path);
        Self {
            path,
            lock,
            timeout: DEFAULT_SESSION_TIMEOUT,
            secrets,
            secret_name: DEFAULT_SECRET_NAME.to_string(),
            session_key: Mutex::new(None),
        }
    }

    /// Set the session lifetime.
    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    /// Set the name of the device secret.
    pub fn with_secret_name(mut self, name: impl Into<String>) -> Self {
        self.secret_name = name.into();
        self
    }

    /// Location of the session file.
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Lifetime given to newly saved sessions.
    pub fn timeout(&self) -> Duration {
        self.timeout
    }

    async fn device_secret(&self) -> Result<DeviceSecret> {
        let bytes = self
            .secrets
            .get_or_create_named_secret(&self.secret_name)
            .await?;
        DeviceSecret::from_slice(bytes.as_bytes())
    }

    async fn read_record(&self) -> Result<SessionRecord> {
        let bytes = match read_existing(&self.path, "Session").await {
            Ok(bytes) => bytes,
            Err(e) if e.is_not_found() => return Err(Error::NoActiveSession),
            Err(e) => return Err(e),
        };
        Ok(serde_json::from_slice(&bytes)?)
    }

    /// Session key to reuse: the in-process one, else the one in an
    /// existing session file, else a new one.
    async fn current_session_key(&self, device: &DeviceSecret) -> SessionKey {
        if let Some(key) = self.session_key.lock().await.as_ref() {
            return key.clone();
        }
        match self.read_record().await {
            Ok(record) => match record.unwrap_session_key(device) {
                Ok(key) => return key,
                Err(e) => debug!(error = %e, "Existing session key unusable"),
            },
            Err(e) => debug!(error = %e, "No reusable session file"),
        }
        SessionKey::generate()
    }

    /// Cache `vault_key` until now + timeout.
    pub async fn save_session(&self, vault_key: &VaultKey) -> Result<()> {
        let _guard = self.lock.acquire().await?;

        let device = self.device_secret().await?;
        let session_key = self.current_session_key(&device).await;

        let wrapped_vault_key = wrap_key(&session_key, vault_key)?;
        let wrapped_session_key = wrap_key(&device, &session_key)?;

        let created_at = Utc::now();
        let lifetime = chrono::Duration::from_std(self.timeout)
            .map_err(|e| Error::InvalidInput(format!("Invalid session timeout: {}", e)))?;
        let record = SessionRecord {
            encrypted_vault_key: STANDARD.encode(&wrapped_vault_key.ciphertext),
            nonce: STANDARD.encode(wrapped_vault_key.nonce),
            session_key: STANDARD.encode(&wrapped_session_key.ciphertext),
            session_key_nonce: STANDARD.encode(wrapped_session_key.nonce),
            created_at,
            expires_at: created_at + lifetime,
        };

        write_atomic(&self.path, &serde_json::to_vec(&record)?).await?;
        *self.session_key.lock().await = Some(session_key);

        info!(expires_at = %record.expires_at, "Session saved");
        Ok(())
    }

    /// Recover the cached vault key.
    ///
    /// # Errors
    /// - `NoActiveSession` if there is no session, or it cannot be decrypted
    ///   or parsed (the session is cleared in that case)
    /// - `SessionExpired` if the session is past its expiry (the file is removed)
    pub async fn load_session(&self) -> Result<VaultKey> {
        let _guard = self.lock.acquire().await?;

        let record = match self.read_record().await {
            Ok(record) => record,
            Err(Error::Serialization(e)) => {
                warn!(error = %e, "Malformed session file; clearing");
                self.clear_locked().await?;
                return Err(Error::NoActiveSession);
            }
            Err(e) => return Err(e),
        };

        if Utc::now() > record.expires_at {
            self.clear_locked().await?;
            info!("Session expired");
            return Err(Error::SessionExpired);
        }

        let device = self.device_secret().await?;
        let unwrapped = record
            .unwrap_session_key(&device)
            .and_then(|session_key| {
                record
                    .unwrap_vault_key(&session_key)
                    .map(|vault_key| (session_key, vault_key))
            });

        match unwrapped {
            Ok((session_key, vault_key)) => {
                *self.session_key.lock().await = Some(session_key);
                debug!("Session loaded");
                Ok(vault_key)
            }
            Err(e) => {
                warn!(error = %e, "Session could not be decrypted; clearing");
                self.clear_locked().await?;
                Err(Error::NoActiveSession)
            }
        }
    }

    /// Remove the session file and forget the in-process session key.
    /// Clearing an absent session is not an error.
    pub async fn clear_session(&self) -> Result<()> {
        let _guard = self.lock.acquire().await?;
        self.clear_locked().await
    }

    async fn clear_locked(&self) -> Result<()> {
        *self.session_key.lock().await = None;
        if remove_if_exists(&self.path).await? {
            debug!(path = %self.path.display(), "Session cleared");
        }
        Ok(())
    }

    /// Whether a well-formed, unexpired session file is present.
    ///
    /// Read-only: the device secret is never touched, so a session written
    /// on another device can still report as active here and then fail in
    /// [`load_session`](Self::load_session).
    pub async fn has_active_session(&self) -> bool {
        match self.read_record().await {
            Ok(record) => Utc::now() <= record.expires_at,
            Err(_) => false,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use lockbox_storage::{FileSecretBackend, MemorySecretBackend};
    use tempfile::TempDir;

    fn cache(dir: &TempDir, secrets: &MemorySecretBackend) -> SessionCache {
        SessionCache::new(dir.path().join("session.json"), Arc::new(secrets.clone()))
    }

    #[tokio::test]
    async fn test_save_then_load() {
        let temp = TempDir::new().unwrap();
        let secrets = MemorySecretBackend::new();
        let cache = cache(&temp, &secrets);
        let key = VaultKey::generate();

        cache.save_session(&key).await.unwrap();
        let loaded = cache.load_session().await.unwrap();

        assert_eq!(loaded.as_bytes(), key.as_bytes());
        assert!(cache.has_active_session().await);
    }

    #[tokio::test]
    async fn test_load_from_fresh_process_state() {
        let temp = TempDir::new().unwrap();
        let secrets = MemorySecretBackend::new();
        let key = VaultKey::generate();

        cache(&temp, &secrets).save_session(&key).await.unwrap();

        let later = cache(&temp, &secrets);
        assert_eq!(later.load_session().await.unwrap().as_bytes(), key.as_bytes());
    }

    #[tokio::test]
    async fn test_session_key_reused_across_saves() {
        let temp = TempDir::new().unwrap();
        let secrets = MemorySecretBackend::new();
        let device = DeviceSecret::from_slice(
            secrets
                .get_or_create_named_secret(DEFAULT_SECRET_NAME)
                .await
                .unwrap()
                .as_bytes(),
        )
        .unwrap();

        cache(&temp, &secrets)
            .save_session(&VaultKey::generate())
            .await
            .unwrap();
        let first = cache(&temp, &secrets).read_record().await.unwrap();

        cache(&temp, &secrets)
            .save_session(&VaultKey::generate())
            .await
            .unwrap();
        let second = cache(&temp, &secrets).read_record().await.unwrap();

        assert_eq!(
            first.unwrap_session_key(&device).unwrap().as_bytes(),
            second.unwrap_session_key(&device).unwrap().as_bytes()
        );
    }

    #[tokio::test]
    async fn test_missing_session() {
        let temp = TempDir::new().unwrap();
        let cache = cache(&temp, &MemorySecretBackend::new());

        assert!(matches!(
            cache.load_session().await,
            Err(Error::NoActiveSession)
        ));
        assert!(!cache.has_active_session().await);
    }

    #[tokio::test]
    async fn test_expired_session_is_removed() {
        let temp = TempDir::new().unwrap();
        let cache = cache(&temp, &MemorySecretBackend::new())
            .with_timeout(Duration::from_millis(1));

        cache.save_session(&VaultKey::generate()).await.unwrap();
        tokio::time::sleep(Duration::from_millis(20)).await;

        assert!(matches!(
            cache.load_session().await,
            Err(Error::SessionExpired)
        ));
        assert!(!cache.path().exists());
        assert!(matches!(
            cache.load_session().await,
            Err(Error::NoActiveSession)
        ));
    }

    #[tokio::test]
    async fn test_status_check_has_no_side_effects() {
        let temp = TempDir::new().unwrap();
        let secrets_dir = temp.path().join("secrets");
        let cache = SessionCache::new(
            temp.path().join("session.json"),
            Arc::new(FileSecretBackend::new(&secrets_dir)),
        )
        .with_timeout(Duration::from_millis(1));

        assert!(!cache.has_active_session().await);
        assert!(!secrets_dir.exists());
        assert!(!cache.path().with_extension("json.lock").exists());

        cache.save_session(&VaultKey::generate()).await.unwrap();
        tokio::time::sleep(Duration::from_millis(20)).await;

        assert!(!cache.has_active_session().await);
        assert!(cache.path().exists());

        std::fs::write(cache.path(), b"{garbage").unwrap();
        assert!(!cache.has_active_session().await);
        assert!(cache.path().exists());
    }

    #[tokio::test]
    async fn test_immediate_load_within_window() {
        let temp = TempDir::new().unwrap();
        let cache = cache(&temp, &MemorySecretBackend::new())
            .with_timeout(Duration::from_secs(5));
        let key = VaultKey::generate();

        cache.save_session(&key).await.unwrap();
        assert_eq!(cache.load_session().await.unwrap().as_bytes(), key.as_bytes());
    }

    #[tokio::test]
    async fn test_foreign_device_secret_clears_session() {
        let temp = TempDir::new().unwrap();
        cache(&temp, &MemorySecretBackend::new())
            .save_session(&VaultKey::generate())
            .await
            .unwrap();

        let other_device = cache(&temp, &MemorySecretBackend::new());
        assert!(matches!(
            other_device.load_session().await,
            Err(Error::NoActiveSession)
        ));
        assert!(!other_device.path().exists());
    }

    #[tokio::test]
    async fn test_malformed_file_clears_session() {
        let temp = TempDir::new().unwrap();
        let cache = cache(&temp, &MemorySecretBackend::new());
        std::fs::write(cache.path(), b"{garbage").unwrap();

        assert!(matches!(
            cache.load_session().await,
            Err(Error::NoActiveSession)
        ));
        assert!(!cache.path().exists());
    }

    #[tokio::test]
    async fn test_clear_is_idempotent() {
        let temp = TempDir::new().unwrap();
        let cache = cache(&temp, &MemorySecretBackend::new());

        cache.save_session(&VaultKey::generate()).await.unwrap();
        cache.clear_session().await.unwrap();
        cache.clear_session().await.unwrap();

        assert!(!cache.path().exists());
        assert!(matches!(
            cache.load_session().await,
            Err(Error::NoActiveSession)
        ));
    }

    #[tokio::test]
    async fn test_session_file_fields() {
        let temp = TempDir::new().unwrap();
        let cache = cache(&temp, &MemorySecretBackend::new());
        cache.save_session(&VaultKey::generate()).await.unwrap();

        let json: serde_json::Value =
            serde_json::from_slice(&std::fs::read(cache.path()).unwrap()).unwrap();
        for field in [
            "encrypted_vault_key",
            "nonce",
            "session_key",
            "session_key_nonce",
            "created_at",
            "expires_at",
        ] {
            assert!(json.get(field).is_some(), "missing field {}", field);
        }
    }
}
