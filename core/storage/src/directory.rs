//! Remote store backed by a shared directory.
//!
//! Each account's record is a JSON file. The compare-and-set is made
//! atomic across processes by holding the record's sidecar lock while the
//! current version is read and the replacement is renamed into place.
//! Suitable for a network mount or a synced folder shared between devices.

use async_trait::async_trait;
use std::path::{Path, PathBuf};
use tracing::debug;

use crate::fs::{ensure_private_dir, escape_file_name, read_existing, write_atomic};
use crate::lock::FileLock;
use crate::remote::{ExpectedVersion, RemoteRecord, RemoteStore};
use lockbox_common::{AccountId, Result};

/// Directory-backed remote store.
pub struct DirectoryRemote {
    root: PathBuf,
}

impl DirectoryRemote {
    /// Create a remote rooted at `root`. The directory is created on first write.
    pub fn new(root: impl AsRef<Path>) -> Self {
        Self {
            root: root.as_ref().to_path_buf(),
        }
    }

    /// Root directory of the store.
    pub fn root(&self) -> &Path {
        &self.root
    }

    /// File holding `account`'s record.
    fn record_path(&self, account: &AccountId) -> PathBuf {
        self.root
            .join(format!("{}.json", escape_file_name(account.as_str())))
    }

    async fn read_record(path: &Path) -> Result<RemoteRecord> {
        let bytes = read_existing(path, "Remote vault").await?;
        Ok(serde_json::from_slice(&bytes)?)
    }
}

#[async_trait]
impl RemoteStore for DirectoryRemote {
    fn name(&self) -> &str {
        "directory"
    }

    async fn get(&self, account: &AccountId) -> Result<RemoteRecord> {
        Self::read_record(&self.record_path(account)).await
    }

    async fn put(
        &self,
        account: &AccountId,
        record: RemoteRecord,
        expected: ExpectedVersion,
    ) -> Result<()> {
        record.check_owner(account)?;
        ensure_private_dir(&self.root).await?;

        let path = self.record_path(account);
        let _guard = FileLock::for_file(&path).acquire().await?;

        let current = match Self::read_record(&path).await {
            Ok(existing) => Some(existing.version),
            Err(e) if e.is_not_found() => None,
            Err(e) => return Err(e),
        };
        expected.check(current)?;

        let data = serde_json::to_vec_pretty(&record)?;
        write_atomic(&path, &data).await?;

        debug!(
            account = %account,
            version = record.version,
            "Wrote remote record"
        );
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;
    use lockbox_common::{DeviceId, Error};
    use std::sync::Arc;
    use tempfile::TempDir;

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
    async fn test_missing_record_is_not_found() {
        let temp = TempDir::new().unwrap();
        let remote = DirectoryRemote::new(temp.path());
        let account = AccountId::new("alice").unwrap();

        assert!(remote.get(&account).await.unwrap_err().is_not_found());
    }

    #[tokio::test]
    async fn test_conditional_put_sequence() {
        let temp = TempDir::new().unwrap();
        let remote = DirectoryRemote::new(temp.path().join("remote"));
        let account = AccountId::new("alice@example.com").unwrap();

        remote
            .put(&account, record(&account, 1), ExpectedVersion::Absent)
            .await
            .unwrap();
        remote
            .put(&account, record(&account, 2), ExpectedVersion::Version(1))
            .await
            .unwrap();

        let stale = remote
            .put(&account, record(&account, 2), ExpectedVersion::Version(1))
            .await;
        assert!(matches!(stale, Err(Error::VersionConflict { .. })));

        let stored = remote.get(&account).await.unwrap();
        assert_eq!(stored.version, 2);
        assert_eq!(stored.vault_blob, "blob-2");
    }

    #[tokio::test]
    async fn test_accounts_do_not_collide() {
        let temp = TempDir::new().unwrap();
        let remote = DirectoryRemote::new(temp.path());
        let a = AccountId::new("a/b").unwrap();
        let b = AccountId::new("a_b").unwrap();

        remote.put(&a, record(&a, 1), ExpectedVersion::Absent).await.unwrap();
        remote.put(&b, record(&b, 7), ExpectedVersion::Absent).await.unwrap();

        assert_eq!(remote.get(&a).await.unwrap().version, 1);
        assert_eq!(remote.get(&b).await.unwrap().version, 7);
    }

    #[cfg(unix)]
    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_concurrent_writers_one_wins() {
        let temp = TempDir::new().unwrap();
        let remote = Arc::new(DirectoryRemote::new(temp.path()));
        let account = AccountId::new("alice").unwrap();
        remote
            .put(&account, record(&account, 4), ExpectedVersion::Absent)
            .await
            .unwrap();

        let mut handles = Vec::new();
        for _ in 0..6 {
            let remote = Arc::clone(&remote);
            let account = account.clone();
            handles.push(tokio::spawn(async move {
                remote
                    .put(&account, record(&account, 5), ExpectedVersion::Version(4))
                    .await
            }));
        }

        let mut wins = 0;
        for handle in handles {
            if handle.await.unwrap().is_ok() {
                wins += 1;
            }
        }
        assert_eq!(wins, 1);
        assert_eq!(remote.get(&account).await.unwrap().version, 5);
    }
}
