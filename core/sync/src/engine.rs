//! Sync engine reconciling a local envelope with the remote store.

use serde::{Deserialize, Serialize};
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info, warn};

use lockbox_common::{AccountId, DeviceId, Error, Result};
use lockbox_storage::{ExpectedVersion, RemoteRecord, RemoteStore};
use lockbox_vault::Envelope;

use crate::conflict::{diverged_at_same_version, reconcile, SyncDecision};
use crate::retry::ConflictRetry;

/// Configuration for the sync engine.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct SyncConfig {
    /// Maximum number of extra rounds after a lost conditional write.
    pub max_retries: u32,
    /// Delay before the first retry; doubles per attempt.
    pub initial_backoff_ms: u64,
    /// Upper bound on a single remote call.
    pub remote_timeout_secs: u64,
}

impl SyncConfig {
    /// Bound applied to each remote `get` and `put`.
    pub fn remote_timeout(&self) -> Duration {
        Duration::from_secs(self.remote_timeout_secs)
    }

    fn conflict_retry(&self) -> ConflictRetry {
        ConflictRetry::new(
            self.max_retries,
            Duration::from_millis(self.initial_backoff_ms),
        )
    }
}

impl Default for SyncConfig {
    fn default() -> Self {
        Self {
            max_retries: 3,
            initial_backoff_ms: 200,
            remote_timeout_secs: 30,
        }
    }
}

/// Result of a sync round.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SyncOutcome {
    /// The local envelope is now the remote record.
    Pushed {
        version: u64,
        /// Whether the remote record was created by this push.
        created: bool,
    },
    /// The remote holds a newer envelope. Nothing was pushed; the caller
    /// should replace its local replica with this envelope and re-unlock.
    RemoteNewer(Envelope),
}

/// Sync engine for one account on one remote.
pub struct SyncEngine {
    remote: Arc<dyn RemoteStore>,
    account: AccountId,
    device: DeviceId,
    config: SyncConfig,
    retry: ConflictRetry,
}

impl SyncEngine {
    /// Create a new sync engine.
    pub fn new(
        remote: Arc<dyn RemoteStore>,
        account: AccountId,
        device: DeviceId,
        config: SyncConfig,
    ) -> Self {
        let retry = config.conflict_retry();
        Self {
            remote,
            account,
            device,
            config,
            retry,
        }
    }

    /// Account whose remote record this engine reads and writes.
    pub fn account(&self) -> &AccountId {
        &self.account
    }

    /// Settings the engine was built with.
    pub fn config(&self) -> &SyncConfig {
        &self.config
    }

    /// Run a remote call under the configured timeout.
    async fn bounded<T>(&self, what: &str, call: impl Future<Output = Result<T>>) -> Result<T> {
        let limit = self.config.remote_timeout();
        match tokio::time::timeout(limit, call).await {
            Ok(result) => result,
            Err(_) => Err(Error::Storage(format!(
                "Remote {} timed out after {:?}",
                what, limit
            ))),
        }
    }

    /// Fetch the account's envelope from the remote.
    ///
    /// Returns `Ok(None)` if the account has no remote record.
    pub async fn fetch(&self) -> Result<Option<Envelope>> {
        let record = match self.bounded("get", self.remote.get(&self.account)).await {
            Ok(record) => record,
            Err(e) if e.is_not_found() => return Ok(None),
            Err(e) => return Err(e),
        };

        let envelope = Envelope::from_bytes(record.vault_blob.as_bytes())?;
        if envelope.version != record.version {
            warn!(
                record_version = record.version,
                envelope_version = envelope.version,
                "Remote record version disagrees with its envelope"
            );
        }
        Ok(Some(envelope))
    }

    /// Write `envelope` to the remote if the stored version matches `expected`.
    ///
    /// # Errors
    /// - `VersionConflict` if another writer got there first
    /// - `Storage` on transport failure or timeout
    pub async fn push(&self, envelope: &Envelope, expected: ExpectedVersion) -> Result<()> {
        let record = RemoteRecord::new(
            &self.account,
            envelope.vault_id.as_str(),
            serde_json::to_string(envelope)?,
            envelope.version,
            envelope.modified_at,
            self.device.clone(),
        );

        self.bounded("put", self.remote.put(&self.account, record, expected))
            .await?;

        info!(
            account = %self.account,
            version = envelope.version,
            expected = %expected,
            "Pushed envelope to remote"
        );
        Ok(())
    }

    /// Reconcile `local` with the remote.
    ///
    /// 1. No remote record: create it from `local`.
    /// 2. Local version >= remote version: push `local` conditioned on the
    ///    remote version; a lost race re-runs from step 1.
    /// 3. Remote is newer: return it without pushing.
    ///
    /// # Errors
    /// - `Sync` once every retry lost the conditional write, or if the remote
    ///   record belongs to a different vault
    /// - `Storage`/`Io` from the remote, unchanged and without retrying
    /// - `Serialization` for a malformed remote envelope
    pub async fn sync(&self, local: &Envelope) -> Result<SyncOutcome> {
        self.retry.run(|| self.sync_once(local)).await
    }

    async fn sync_once(&self, local: &Envelope) -> Result<SyncOutcome> {
        let remote = self.fetch().await?;
        if let Some(remote) = &remote {
            if remote.vault_id != local.vault_id {
                warn!(
                    account = %self.account,
                    local = %local.vault_id,
                    remote = %remote.vault_id,
                    "Remote record belongs to another vault; refusing to sync"
                );
                return Err(Error::Sync(format!(
                    "remote holds vault {} but local vault is {}",
                    remote.vault_id, local.vault_id
                )));
            }
        }
        let decision = reconcile(local.version, remote.as_ref().map(|r| r.version));
        debug!(
            local_version = local.version,
            remote_version = ?remote.as_ref().map(|r| r.version),
            ?decision,
            "Reconciling"
        );

        match (decision, remote) {
            (SyncDecision::Create, _) => {
                self.push(local, ExpectedVersion::Absent).await?;
                Ok(SyncOutcome::Pushed {
                    version: local.version,
                    created: true,
                })
            }
            (SyncDecision::Push { expected }, remote) => {
                if let Some(remote) = &remote {
                    if diverged_at_same_version(local, remote) {
                        warn!(
                            version = local.version,
                            local = %local.fingerprint(),
                            remote = %remote.fingerprint(),
                            "Local and remote differ at the same version; local wins"
                        );
                    }
                }
                self.push(local, ExpectedVersion::Version(expected)).await?;
                Ok(SyncOutcome::Pushed {
                    version: local.version,
                    created: false,
                })
            }
            (SyncDecision::TakeRemote, Some(remote)) => {
                info!(
                    local_version = local.version,
                    remote_version = remote.version,
                    "Remote is newer"
                );
                Ok(SyncOutcome::RemoteNewer(remote))
            }
            (SyncDecision::TakeRemote, None) => Err(Error::Sync(
                "Remote disappeared during reconciliation".to_string(),
            )),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use lockbox_crypto::KdfParams;
    use lockbox_storage::MemoryRemote;
    use lockbox_vault::{NewEntry, UnlockedVault};

    fn account() -> AccountId {
        AccountId::new("alice").unwrap()
    }

    fn fast_config() -> SyncConfig {
        SyncConfig {
            max_retries: 2,
            initial_backoff_ms: 1,
            remote_timeout_secs: 5,
        }
    }

    fn engine(remote: Arc<dyn RemoteStore>) -> SyncEngine {
        SyncEngine::new(remote, account(), DeviceId::new("test-device"), fast_config())
    }

    fn vault() -> UnlockedVault {
        UnlockedVault::create(b"pw", b"pw", KdfParams::new(1024, 1, 1)).unwrap()
    }

    fn at_version(vault: &UnlockedVault, version: u64) -> Envelope {
        let mut envelope = vault.envelope().clone();
        envelope.version = version;
        envelope
    }

    #[tokio::test]
    async fn test_sync_creates_missing_remote() {
        let remote = MemoryRemote::new();
        let engine = engine(Arc::new(remote.clone()));
        let local = vault().envelope().clone();

        let outcome = engine.sync(&local).await.unwrap();

        assert_eq!(
            outcome,
            SyncOutcome::Pushed {
                version: 1,
                created: true
            }
        );
        assert_eq!(engine.fetch().await.unwrap(), Some(local));
    }

    #[tokio::test]
    async fn test_remote_newer_is_returned_without_push() {
        let remote = MemoryRemote::new();
        let engine = engine(Arc::new(remote.clone()));
        let vault = vault();

        let remote_env = at_version(&vault, 7);
        engine.push(&remote_env, ExpectedVersion::Absent).await.unwrap();
        let puts_before = remote.put_count();

        let outcome = engine.sync(&at_version(&vault, 5)).await.unwrap();

        assert_eq!(outcome, SyncOutcome::RemoteNewer(remote_env));
        assert_eq!(remote.put_count(), puts_before);
        assert_eq!(remote.version_of(&account()), Some(7));
    }

    #[tokio::test]
    async fn test_local_newer_is_pushed() {
        let remote = MemoryRemote::new();
        let engine = engine(Arc::new(remote.clone()));
        let vault = vault();

        engine
            .push(&at_version(&vault, 5), ExpectedVersion::Absent)
            .await
            .unwrap();

        let local = at_version(&vault, 7);
        let outcome = engine.sync(&local).await.unwrap();

        assert_eq!(
            outcome,
            SyncOutcome::Pushed {
                version: 7,
                created: false
            }
        );
        assert_eq!(engine.fetch().await.unwrap(), Some(local));
    }

    #[tokio::test]
    async fn test_equal_versions_with_different_content_push_local() {
        let remote = MemoryRemote::new();
        let engine = engine(Arc::new(remote.clone()));
        let vault = vault();

        let (theirs, _) = vault
            .stage(|r| r.add_entry(NewEntry::new("theirs", b"1".as_slice())).map(|_| ()))
            .unwrap();
        let (ours, _) = vault
            .stage(|r| r.add_entry(NewEntry::new("ours", b"2".as_slice())).map(|_| ()))
            .unwrap();
        engine
            .push(theirs.envelope(), ExpectedVersion::Absent)
            .await
            .unwrap();

        engine.sync(ours.envelope()).await.unwrap();

        let stored = engine.fetch().await.unwrap().unwrap();
        assert_eq!(stored.fingerprint(), ours.envelope().fingerprint());
    }

    #[tokio::test]
    async fn test_concurrent_pushes_one_wins() {
        let remote: Arc<dyn RemoteStore> = Arc::new(MemoryRemote::new());
        let vault = vault();
        let first = engine(remote.clone());
        let second = engine(remote.clone());

        first
            .push(&at_version(&vault, 1), ExpectedVersion::Absent)
            .await
            .unwrap();

        let a = at_version(&vault, 2);
        let b = at_version(&vault, 2);
        let (ra, rb) = tokio::join!(
            first.push(&a, ExpectedVersion::Version(1)),
            second.push(&b, ExpectedVersion::Version(1))
        );

        assert!(ra.is_ok() != rb.is_ok());
        let loser = if ra.is_err() { ra } else { rb };
        assert!(matches!(loser, Err(Error::VersionConflict { .. })));
    }

    /// Remote whose conditional write always loses.
    struct AlwaysRaced(MemoryRemote);

    #[async_trait]
    impl RemoteStore for AlwaysRaced {
        fn name(&self) -> &str {
            "always-raced"
        }

        async fn get(&self, account: &AccountId) -> Result<RemoteRecord> {
            self.0.get(account).await
        }

        async fn put(
            &self,
            _: &AccountId,
            _: RemoteRecord,
            expected: ExpectedVersion,
        ) -> Result<()> {
            Err(Error::VersionConflict {
                expected: expected.to_string(),
                actual: "newer".to_string(),
            })
        }
    }

    #[tokio::test]
    async fn test_exhausted_retries_is_sync_error() {
        let engine = engine(Arc::new(AlwaysRaced(MemoryRemote::new())));
        let result = engine.sync(vault().envelope()).await;
        assert!(matches!(result, Err(Error::Sync(_))));
    }

    /// Remote that never answers.
    struct Unresponsive;

    #[async_trait]
    impl RemoteStore for Unresponsive {
        fn name(&self) -> &str {
            "unresponsive"
        }

        async fn get(&self, _: &AccountId) -> Result<RemoteRecord> {
            std::future::pending().await
        }

        async fn put(&self, _: &AccountId, _: RemoteRecord, _: ExpectedVersion) -> Result<()> {
            std::future::pending().await
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_remote_calls_time_out() {
        let engine = engine(Arc::new(Unresponsive));

        let fetch = engine.fetch().await;
        assert!(matches!(fetch, Err(Error::Storage(_))));

        let push = engine
            .push(vault().envelope(), ExpectedVersion::Absent)
            .await;
        assert!(matches!(push, Err(Error::Storage(_))));
    }

    #[tokio::test]
    async fn test_storage_failure_is_returned_unchanged() {
        let remote = MemoryRemote::new();
        remote.set_offline(true);
        let engine = engine(Arc::new(remote.clone()));

        let result = engine.sync(vault().envelope()).await;

        assert!(matches!(result, Err(Error::Storage(_))));
        assert_eq!(remote.put_count(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_timeout_is_not_retried() {
        let engine = engine(Arc::new(Unresponsive));
        let started = tokio::time::Instant::now();

        let result = engine.sync(vault().envelope()).await;

        assert!(matches!(result, Err(Error::Storage(_))));
        assert!(started.elapsed() < fast_config().remote_timeout() * 2);
    }

    #[tokio::test]
    async fn test_foreign_vault_is_refused() {
        let remote = MemoryRemote::new();
        let engine = engine(Arc::new(remote.clone()));

        let theirs = at_version(&vault(), 9);
        engine.push(&theirs, ExpectedVersion::Absent).await.unwrap();
        let puts_before = remote.put_count();

        // Independently created vault with a newer version than the remote.
        let ours = at_version(&vault(), 12);
        let result = engine.sync(&ours).await;

        assert!(matches!(result, Err(Error::Sync(_))));
        assert_eq!(remote.put_count(), puts_before);
        assert_eq!(engine.fetch().await.unwrap(), Some(theirs));
    }
}
