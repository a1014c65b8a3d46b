//! Storage abstraction for Lockbox.
//!
//! This module provides trait-based interfaces for the three places vault
//! state lives outside the process, and the backends that implement them:
//! - [`ReplicaStore`]: the durable on-device copy of the envelope
//! - [`RemoteStore`]: one envelope per account behind a conditional write
//! - [`SecretBackend`]: device-local named secrets protecting cached sessions
//!
//! # Design Principles
//! - Storage never sees plaintext: replicas and remotes carry serialized envelopes
//! - Async operations: all I/O operations are async
//! - Unified error semantics: consistent error types across backends
//! - Writes to disk are atomic and owner-only

pub mod directory;
pub mod fs;
pub mod local;
pub mod lock;
pub mod memory;
pub mod registry;
pub mod remote;
pub mod replica;
pub mod secret;

pub use directory::DirectoryRemote;
pub use local::FileReplica;
pub use lock::{FileLock, FileLockGuard};
pub use memory::{MemoryRemote, MemoryReplica};
pub use registry::{create_default_registry, RemoteFactory, RemoteRegistry};
pub use remote::{ExpectedVersion, RemoteRecord, RemoteStore, VAULT_SORT_KEY};
pub use replica::{ReplicaGuard, ReplicaStore};
pub use secret::{FileSecretBackend, MemorySecretBackend, SecretBackend};

#[cfg(feature = "keyring-store")]
pub use secret::KeyringSecretBackend;
