//! Vault service wiring the vault engine to its collaborators.

use std::path::Path;
use std::sync::Arc;

use tracing::{debug, info, warn};

use lockbox_common::{Error, Result, VaultId};
use lockbox_crypto::{KdfParams, VaultKey};
use lockbox_storage::fs::write_atomic;
use lockbox_storage::{
    create_default_registry, ExpectedVersion, FileReplica, RemoteRegistry, ReplicaStore,
};
use lockbox_sync::{SyncEngine, SyncOutcome};
use lockbox_vault::{
    Entry, EntryPatch, Envelope, NewEntry, PendingChange, SessionCache, UnlockedVault,
    VaultRecords,
};

use crate::config::{AppConfig, RemotePolicy};
use crate::passphrase::PassphraseSource;

/// What happened to the remote copy during a write.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RemoteStatus {
    /// The remote now holds the new envelope.
    Pushed,
    /// No remote is configured.
    Skipped,
    /// The push failed and the change is local-only.
    Failed(String),
}

/// Result of a persisted write.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MutationReport {
    /// Version now held by the local replica.
    pub version: u64,
    pub remote: RemoteStatus,
}

/// Snapshot of the local vault for display.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct VaultStatus {
    pub location: String,
    pub initialized: bool,
    pub vault_id: Option<VaultId>,
    pub version: Option<u64>,
    pub modified_at: Option<String>,
    pub fingerprint: Option<String>,
    pub session_active: bool,
    pub remote: Option<String>,
}

/// Entry point for every vault operation.
///
/// Holds no decrypted state; callers own the [`UnlockedVault`] returned by
/// `init`/`unlock` and pass it back for each mutation.
pub struct VaultService {
    replica: Arc<dyn ReplicaStore>,
    sessions: SessionCache,
    remote: Option<SyncEngine>,
    remote_policy: RemotePolicy,
    kdf_params: KdfParams,
}

impl VaultService {
    /// Create a local-only service.
    pub fn new(
        replica: Arc<dyn ReplicaStore>,
        sessions: SessionCache,
        kdf_params: KdfParams,
    ) -> Self {
        Self {
            replica,
            sessions,
            remote: None,
            remote_policy: RemotePolicy::default(),
            kdf_params,
        }
    }

    /// Attach a remote through its sync engine.
    pub fn with_remote(mut self, engine: SyncEngine) -> Self {
        self.remote = Some(engine);
        self
    }

    /// Choose whether a failed push fails the write.
    pub fn with_remote_policy(mut self, policy: RemotePolicy) -> Self {
        self.remote_policy = policy;
        self
    }

    /// Build a service from configuration using the built-in remotes.
    pub fn from_config(config: &AppConfig) -> Result<Self> {
        Self::from_config_with_registry(config, &create_default_registry())
    }

    /// Build a service from configuration, resolving the remote in `registry`.
    ///
    /// # Errors
    /// - `InvalidInput` for invalid configuration values
    /// - `NotFound` if the remote backend is not registered
    pub fn from_config_with_registry(
        config: &AppConfig,
        registry: &RemoteRegistry,
    ) -> Result<Self> {
        config.validate()?;

        let replica = Arc::new(FileReplica::new(&config.vault_path));
        let sessions = SessionCache::new(&config.session_path, config.secret_backend()?)
            .with_timeout(config.session_timeout());
        let mut service = Self::new(replica, sessions, config.kdf.clone())
            .with_remote_policy(config.remote_policy);

        if let Some(remote) = config.remote_store(registry)? {
            debug!(backend = remote.name(), "Using remote");
            service = service.with_remote(SyncEngine::new(
                remote,
                config.account_id()?,
                config.device_id(),
                config.sync.clone(),
            ));
        }

        Ok(service)
    }

    /// Session cache used by `open` and `unlock_from_session`.
    pub fn sessions(&self) -> &SessionCache {
        &self.sessions
    }

    async fn load_local(&self) -> Result<Envelope> {
        Envelope::from_bytes(&self.replica.load().await?)
    }

    /// Create a new vault and return it unlocked.
    ///
    /// # Errors
    /// - `AlreadyExists` if a local replica exists
    /// - `InvalidInput` if the passphrases differ
    pub async fn init(
        &self,
        passphrase: &[u8],
        confirmation: &[u8],
    ) -> Result<(UnlockedVault, MutationReport)> {
        let _guard = self.replica.lock().await?;
        if self.replica.exists().await? {
            return Err(Error::AlreadyExists(format!(
                "Vault already initialized at {}",
                self.replica.location()
            )));
        }

        let vault = UnlockedVault::create(passphrase, confirmation, self.kdf_params.clone())?;
        self.replica.save(&vault.envelope().to_bytes()?).await?;
        let remote = self.push(vault.envelope(), ExpectedVersion::Absent).await?;

        info!(
            vault_id = %vault.vault_id(),
            location = %self.replica.location(),
            "Initialized vault"
        );
        Ok((
            vault,
            MutationReport {
                version: 1,
                remote,
            },
        ))
    }

    /// Unlock with a passphrase.
    ///
    /// Falls back to the remote when there is no local replica and seeds
    /// the replica with the fetched envelope.
    ///
    /// # Errors
    /// - `Authentication` on a wrong passphrase or corrupted envelope
    /// - `NotFound` if no vault exists locally or remotely
    pub async fn unlock(&self, passphrase: &[u8]) -> Result<UnlockedVault> {
        match self.load_local().await {
            Ok(envelope) => UnlockedVault::open(envelope, passphrase),
            Err(e) if e.is_not_found() => self.unlock_from_remote(passphrase).await,
            Err(e) => Err(e),
        }
    }

    async fn unlock_from_remote(&self, passphrase: &[u8]) -> Result<UnlockedVault> {
        let engine = self.remote.as_ref().ok_or_else(|| {
            Error::NotFound(format!("No vault at {}", self.replica.location()))
        })?;
        let envelope = engine.fetch().await?.ok_or_else(|| {
            Error::NotFound("No vault found locally or remotely".to_string())
        })?;

        let vault = UnlockedVault::open(envelope, passphrase)?;

        let _guard = self.replica.lock().await?;
        if !self.replica.exists().await? {
            self.replica.save(&vault.envelope().to_bytes()?).await?;
            info!(
                version = vault.version(),
                location = %self.replica.location(),
                "Restored local replica from remote"
            );
        }
        Ok(vault)
    }

    /// Unlock with the cached session key.
    ///
    /// # Errors
    /// - `NoActiveSession` / `SessionExpired` when the caller must prompt
    pub async fn unlock_from_session(&self) -> Result<UnlockedVault> {
        let vault_key = self.sessions.load_session().await?;
        let envelope = self.load_local().await?;
        match UnlockedVault::with_key(envelope, vault_key) {
            Err(Error::Authentication) => {
                warn!("Cached session key does not open the vault; clearing session");
                self.sessions.clear_session().await?;
                Err(Error::NoActiveSession)
            }
            other => other,
        }
    }

    /// Unlock from the session if possible, otherwise ask `source` and
    /// start a new session.
    pub async fn open(&self, source: &dyn PassphraseSource) -> Result<UnlockedVault> {
        match self.unlock_from_session().await {
            Ok(vault) => return Ok(vault),
            Err(Error::NoActiveSession) | Err(Error::SessionExpired) => {}
            Err(e) => return Err(e),
        }

        let passphrase = source.passphrase("Master passphrase: ")?;
        let vault = self.unlock(&passphrase).await?;
        self.save_session(&vault).await?;
        Ok(vault)
    }

    /// Drop the decrypted state and end the session.
    pub async fn lock(&self, vault: UnlockedVault) -> Result<()> {
        let vault_id = vault.vault_id().clone();
        drop(vault);
        self.sessions.clear_session().await?;
        info!(vault_id = %vault_id, "Locked vault");
        Ok(())
    }

    /// Add an entry. Returns the new entry's id.
    pub async fn add_entry(
        &self,
        vault: &mut UnlockedVault,
        entry: NewEntry,
    ) -> Result<(String, MutationReport)> {
        self.mutate(vault, |records| records.add_entry(entry).map(|e| e.id.clone()))
            .await
    }

    /// Apply `patch` to the entry matching `identifier` (id or exact name).
    pub async fn update_entry(
        &self,
        vault: &mut UnlockedVault,
        identifier: &str,
        patch: EntryPatch,
    ) -> Result<MutationReport> {
        let (_, report) = self
            .mutate(vault, |records| records.update_entry(identifier, patch).map(|_| ()))
            .await?;
        Ok(report)
    }

    /// Remove an entry, returning it.
    pub async fn remove_entry(
        &self,
        vault: &mut UnlockedVault,
        identifier: &str,
    ) -> Result<(Entry, MutationReport)> {
        self.mutate(vault, |records| records.remove_entry(identifier))
            .await
    }

    /// Re-wrap the vault key under a new passphrase.
    ///
    /// The cached session stays valid since the vault key is unchanged.
    ///
    /// # Errors
    /// - `Authentication` if `current` is wrong
    /// - `InvalidInput` if `new` and `confirmation` differ
    pub async fn rotate_master(
        &self,
        vault: &mut UnlockedVault,
        current: &[u8],
        new: &[u8],
        confirmation: &[u8],
    ) -> Result<MutationReport> {
        let _guard = self.replica.lock().await?;
        self.ensure_current(vault).await?;

        let change = vault.stage_rotation(current, new, confirmation, self.kdf_params.clone())?;
        let report = self.persist(vault, change).await?;
        info!(
            vault_id = %vault.vault_id(),
            version = report.version,
            "Rotated master passphrase"
        );
        Ok(report)
    }

    async fn mutate<T, F>(
        &self,
        vault: &mut UnlockedVault,
        change: F,
    ) -> Result<(T, MutationReport)>
    where
        F: FnOnce(&mut VaultRecords) -> Result<T>,
    {
        let _guard = self.replica.lock().await?;
        self.ensure_current(vault).await?;

        let (pending, output) = vault.stage(change)?;
        let report = self.persist(vault, pending).await?;
        debug!(version = report.version, "Committed vault change");
        Ok((output, report))
    }

    /// The replica must still hold the version `vault` was unlocked at.
    async fn ensure_current(&self, vault: &UnlockedVault) -> Result<()> {
        let stored = self.load_local().await?;
        if stored.version != vault.version() || stored.vault_id != *vault.vault_id() {
            return Err(Error::VersionConflict {
                expected: vault.version().to_string(),
                actual: stored.version.to_string(),
            });
        }
        Ok(())
    }

    /// Write locally, push, then commit into the context.
    async fn persist(
        &self,
        vault: &mut UnlockedVault,
        change: PendingChange,
    ) -> Result<MutationReport> {
        let previous = vault.version();
        self.replica.save(&change.envelope().to_bytes()?).await?;
        let remote = self
            .push(change.envelope(), ExpectedVersion::Version(previous))
            .await?;
        let version = change.version();
        vault.commit(change)?;
        Ok(MutationReport { version, remote })
    }

    async fn push(&self, envelope: &Envelope, expected: ExpectedVersion) -> Result<RemoteStatus> {
        let Some(engine) = &self.remote else {
            return Ok(RemoteStatus::Skipped);
        };

        match engine.push(envelope, expected).await {
            Ok(()) => Ok(RemoteStatus::Pushed),
            Err(e) => match self.remote_policy {
                RemotePolicy::BestEffort => {
                    warn!(
                        version = envelope.version,
                        "Remote push failed, kept local change: {}",
                        e
                    );
                    Ok(RemoteStatus::Failed(e.to_string()))
                }
                RemotePolicy::Required => Err(e),
            },
        }
    }

    /// Reconcile the local replica with the remote.
    ///
    /// On [`SyncOutcome::RemoteNewer`] the local replica is replaced; any
    /// open [`UnlockedVault`] is stale and must be re-unlocked.
    ///
    /// # Errors
    /// - `NotPermitted` if no remote is configured
    /// - `Sync` once retries are exhausted or the remote holds another vault
    /// - `Storage` if the remote is unreachable
    pub async fn sync(&self) -> Result<SyncOutcome> {
        let engine = self
            .remote
            .as_ref()
            .ok_or_else(|| Error::NotPermitted("No remote configured".to_string()))?;

        let _guard = self.replica.lock().await?;
        let local = self.load_local().await?;
        let outcome = engine.sync(&local).await?;

        if let SyncOutcome::RemoteNewer(remote) = &outcome {
            self.replica.save(&remote.to_bytes()?).await?;
            info!(
                from = local.version,
                to = remote.version,
                "Replaced local replica with newer remote"
            );
        }
        Ok(outcome)
    }

    /// Cache the vault key of `vault` for later invocations.
    pub async fn save_session(&self, vault: &UnlockedVault) -> Result<()> {
        self.sessions.save_session(vault.vault_key()).await
    }

    /// Cached vault key, if a live session exists.
    pub async fn load_session(&self) -> Result<VaultKey> {
        self.sessions.load_session().await
    }

    /// Forget the cached session.
    pub async fn clear_session(&self) -> Result<()> {
        self.sessions.clear_session().await
    }

    /// Copy the local envelope byte-for-byte to `dest`.
    pub async fn backup(&self, dest: &Path) -> Result<u64> {
        let _guard = self.replica.lock().await?;
        let bytes = self.replica.load().await?;
        let envelope = Envelope::from_bytes(&bytes)?;
        write_atomic(dest, &bytes).await?;
        info!(version = envelope.version, dest = %dest.display(), "Wrote backup");
        Ok(envelope.version)
    }

    /// Replace the local replica with a backup file.
    ///
    /// The file must parse as a valid envelope. Open contexts become stale.
    pub async fn restore(&self, src: &Path) -> Result<u64> {
        let bytes = tokio::fs::read(src).await?;
        let envelope = Envelope::from_bytes(&bytes)?;

        let _guard = self.replica.lock().await?;
        self.replica.save(&bytes).await?;
        info!(version = envelope.version, src = %src.display(), "Restored backup");
        Ok(envelope.version)
    }

    /// Describe the local vault without unlocking it.
    pub async fn status(&self) -> Result<VaultStatus> {
        let mut status = VaultStatus {
            location: self.replica.location(),
            initialized: false,
            vault_id: None,
            version: None,
            modified_at: None,
            fingerprint: None,
            session_active: self.sessions.has_active_session().await,
            remote: self.remote.as_ref().map(|e| e.account().to_string()),
        };

        match self.load_local().await {
            Ok(envelope) => {
                status.initialized = true;
                status.modified_at = Some(envelope.modified_at_string());
                status.fingerprint = Some(envelope.fingerprint());
                status.version = Some(envelope.version);
                status.vault_id = Some(envelope.vault_id);
            }
            Err(e) if e.is_not_found() => {}
            Err(e) => return Err(e),
        }
        Ok(status)
    }
}
