//! In-memory backends for testing.

use async_trait::async_trait;
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, RwLock};

use crate::remote::{ExpectedVersion, RemoteRecord, RemoteStore};
use crate::replica::{ReplicaGuard, ReplicaStore};
use lockbox_common::{AccountId, Error, Result};

fn poisoned<T>(_: T) -> Error {
    Error::Storage("In-memory store lock poisoned".to_string())
}

/// In-memory local replica.
///
/// Clones share the same slot, so a test can hand one clone to a service
/// and inspect the bytes through another.
#[derive(Clone, Default)]
pub struct MemoryReplica {
    data: Arc<RwLock<Option<Vec<u8>>>>,
}

impl MemoryReplica {
    /// Create an empty replica.
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl ReplicaStore for MemoryReplica {
    fn location(&self) -> String {
        "memory".to_string()
    }

    async fn exists(&self) -> Result<bool> {
        Ok(self.data.read().map_err(poisoned)?.is_some())
    }

    async fn load(&self) -> Result<Vec<u8>> {
        self.data
            .read()
            .map_err(poisoned)?
            .clone()
            .ok_or_else(|| Error::NotFound("Vault not found in memory replica".to_string()))
    }

    async fn save(&self, data: &[u8]) -> Result<()> {
        *self.data.write().map_err(poisoned)? = Some(data.to_vec());
        Ok(())
    }

    async fn lock(&self) -> Result<ReplicaGuard> {
        Ok(ReplicaGuard::unlocked())
    }
}

/// In-memory remote store.
///
/// The compare-and-set runs under one mutex, so concurrent writers with
/// the same expectation are serialized and only the first succeeds.
/// Clones share state, which lets two simulated devices talk to one
/// remote. `set_offline` makes every call fail with a storage error.
#[derive(Clone, Default)]
pub struct MemoryRemote {
    records: Arc<Mutex<HashMap<String, RemoteRecord>>>,
    offline: Arc<AtomicBool>,
    puts: Arc<AtomicUsize>,
}

impl MemoryRemote {
    /// Create an empty remote.
    pub fn new() -> Self {
        Self::default()
    }

    /// Simulate the remote becoming unreachable (or reachable again).
    pub fn set_offline(&self, offline: bool) {
        self.offline.store(offline, Ordering::SeqCst);
    }

    /// Number of successful puts so far.
    pub fn put_count(&self) -> usize {
        self.puts.load(Ordering::SeqCst)
    }

    /// Stored version for `account`, bypassing the offline switch.
    pub fn version_of(&self, account: &AccountId) -> Option<u64> {
        self.records
            .lock()
            .ok()
            .and_then(|records| records.get(&account.partition_key()).map(|r| r.version))
    }

    fn check_online(&self) -> Result<()> {
        if self.offline.load(Ordering::SeqCst) {
            return Err(Error::Storage("Remote unreachable".to_string()));
        }
        Ok(())
    }
}

#[async_trait]
impl RemoteStore for MemoryRemote {
    fn name(&self) -> &str {
        "memory"
    }

    async fn get(&self, account: &AccountId) -> Result<RemoteRecord> {
        self.check_online()?;
        self.records
            .lock()
            .map_err(poisoned)?
            .get(&account.partition_key())
            .cloned()
            .ok_or_else(|| Error::NotFound(format!("No remote vault for account {}", account)))
    }

    async fn put(
        &self,
        account: &AccountId,
        record: RemoteRecord,
        expected: ExpectedVersion,
    ) -> Result<()> {
        self.check_online()?;
        record.check_owner(account)?;

        let mut records = self.records.lock().map_err(poisoned)?;
        let key = account.partition_key();
        expected.check(records.get(&key).map(|r| r.version))?;
        records.insert(key, record);
        self.puts.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;
    use lockbox_common::DeviceId;

    fn record(account: &AccountId, version: u64) -> RemoteRecord {
        RemoteRecord::new(
            account,
            "vault-1",
            format!("blob-{}", version),
            version,
            Utc::now(),
            DeviceId::new("test-device"),
        )
    }

    #[tokio::test]
    async fn test_replica_roundtrip() {
        let replica = MemoryReplica::new();
        assert!(!replica.exists().await.unwrap());
        assert!(replica.load().await.unwrap_err().is_not_found());

        replica.save(b"envelope").await.unwrap();
        assert_eq!(replica.load().await.unwrap(), b"envelope");
    }

    #[tokio::test]
    async fn test_create_then_update() {
        let remote = MemoryRemote::new();
        let account = AccountId::new("alice").unwrap();

        assert!(remote.get(&account).await.unwrap_err().is_not_found());

        remote
            .put(&account, record(&account, 1), ExpectedVersion::Absent)
            .await
            .unwrap();
        remote
            .put(&account, record(&account, 2), ExpectedVersion::Version(1))
            .await
            .unwrap();

        let stored = remote.get(&account).await.unwrap();
        assert_eq!(stored.version, 2);
        assert_eq!(stored.vault_blob, "blob-2");
        assert_eq!(remote.put_count(), 2);
    }

    #[tokio::test]
    async fn test_stale_expectation_is_rejected() {
        let remote = MemoryRemote::new();
        let account = AccountId::new("alice").unwrap();
        remote
            .put(&account, record(&account, 3), ExpectedVersion::Absent)
            .await
            .unwrap();

        let result = remote
            .put(&account, record(&account, 3), ExpectedVersion::Version(2))
            .await;
        assert!(matches!(result, Err(Error::VersionConflict { .. })));

        let result = remote
            .put(&account, record(&account, 1), ExpectedVersion::Absent)
            .await;
        assert!(matches!(result, Err(Error::VersionConflict { .. })));

        assert_eq!(remote.get(&account).await.unwrap().version, 3);
    }

    #[tokio::test]
    async fn test_concurrent_writers_one_wins() {
        let remote = MemoryRemote::new();
        let account = AccountId::new("alice").unwrap();
        remote
            .put(&account, record(&account, 4), ExpectedVersion::Absent)
            .await
            .unwrap();

        let mut handles = Vec::new();
        for _ in 0..8 {
            let remote = remote.clone();
            let account = account.clone();
            handles.push(tokio::spawn(async move {
                remote
                    .put(&account, record(&account, 5), ExpectedVersion::Version(4))
                    .await
            }));
        }

        let mut wins = 0;
        for handle in handles {
            match handle.await.unwrap() {
                Ok(()) => wins += 1,
                Err(Error::VersionConflict { .. }) => {}
                Err(e) => panic!("unexpected error: {}", e),
            }
        }
        assert_eq!(wins, 1);
        assert_eq!(remote.version_of(&account), Some(5));
    }

    #[tokio::test]
    async fn test_offline_remote_fails_with_storage_error() {
        let remote = MemoryRemote::new();
        let account = AccountId::new("alice").unwrap();
        remote.set_offline(true);

        assert!(matches!(remote.get(&account).await, Err(Error::Storage(_))));
        let result = remote
            .put(&account, record(&account, 1), ExpectedVersion::Absent)
            .await;
        assert!(matches!(result, Err(Error::Storage(_))));
        assert_eq!(remote.put_count(), 0);
    }

    #[tokio::test]
    async fn test_put_rejects_foreign_record() {
        let remote = MemoryRemote::new();
        let alice = AccountId::new("alice").unwrap();
        let bob = AccountId::new("bob").unwrap();

        let result = remote
            .put(&alice, record(&bob, 1), ExpectedVersion::Absent)
            .await;
        assert!(matches!(result, Err(Error::InvalidInput(_))));
    }
}
