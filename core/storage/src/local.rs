//! File-backed local replica.

use async_trait::async_trait;
use std::path::{Path, PathBuf};
use tracing::debug;

use crate::fs::{read_existing, write_atomic};
use crate::lock::FileLock;
use crate::replica::{ReplicaGuard, ReplicaStore};
use lockbox_common::Result;

/// Local replica stored as a single owner-only file.
///
/// Writes go through temp-file-and-rename; mutations are serialized by a
/// sidecar `flock`.
pub struct FileReplica {
    path: PathBuf,
    lock: FileLock,
}

impl FileReplica {
    /// Create a replica at `path`. Nothing is touched on disk until the
    /// first save.
    pub fn new(path: impl AsRef<Path>) -> Self {
        let path = path.as_ref().to_path_buf();
        let lock = FileLock::for_file(&path);
        Self { path, lock }
    }

    /// Path of the replica file.
    pub fn path(&self) -> &Path {
        &self.path
    }
}

#[async_trait]
impl ReplicaStore for FileReplica {
    fn location(&self) -> String {
        self.path.display().to_string()
    }

    async fn exists(&self) -> Result<bool> {
        Ok(tokio::fs::try_exists(&self.path).await?)
    }

    async fn load(&self) -> Result<Vec<u8>> {
        read_existing(&self.path, "Vault").await
    }

    async fn save(&self, data: &[u8]) -> Result<()> {
        write_atomic(&self.path, data).await?;
        debug!(path = %self.path.display(), "Saved local replica");
        Ok(())
    }

    async fn lock(&self) -> Result<ReplicaGuard> {
        Ok(ReplicaGuard::file(self.lock.acquire().await?))
    }
}
