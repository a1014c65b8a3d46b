//! Local replica trait definition.

use async_trait::async_trait;

use crate::lock::FileLockGuard;
use lockbox_common::Result;

/// Held for the duration of a read-modify-write on a replica.
///
/// Backends without cross-process contention hand out an empty guard.
#[derive(Debug)]
pub struct ReplicaGuard {
    /// Released on drop.
    _lock: Option<FileLockGuard>,
}

impl ReplicaGuard {
    /// A guard that holds nothing.
    pub fn unlocked() -> Self {
        Self { _lock: None }
    }

    /// A guard backed by a file lock.
    pub fn file(guard: FileLockGuard) -> Self {
        Self { _lock: Some(guard) }
    }
}

/// Durable on-device copy of the serialized envelope.
///
/// The replica stores opaque bytes; parsing belongs to the vault layer.
#[async_trait]
pub trait ReplicaStore: Send + Sync {
    /// Human-readable location (path or backend name) for diagnostics.
    fn location(&self) -> String;

    /// Whether a replica has been written.
    async fn exists(&self) -> Result<bool>;

    /// Read the stored envelope bytes.
    ///
    /// # Errors
    /// - `NotFound` if nothing has been written
    /// - I/O errors
    async fn load(&self) -> Result<Vec<u8>>;

    /// Replace the stored envelope bytes.
    ///
    /// # Postconditions
    /// - A concurrent reader observes either the old or the new bytes
    async fn save(&self, data: &[u8]) -> Result<()>;

    /// Serialize mutations against other writers of this replica.
    async fn lock(&self) -> Result<ReplicaGuard>;
}
