//! Lockbox application layer.
//!
//! [`VaultService`] exposes the vault operations to front-ends, wiring the
//! vault engine to a local replica, an optional remote, and the session
//! cache. Prompting and argument parsing stay with the caller, which
//! supplies passphrase bytes directly or through a [`PassphraseSource`].

pub mod config;
pub mod passphrase;
pub mod service;

pub use config::{AppConfig, RemotePolicy, RemoteSpec, SecretStoreKind, DEFAULT_DIR_NAME};
pub use passphrase::{FixedPassphrase, PassphraseSource};
pub use service::{MutationReport, RemoteStatus, VaultService, VaultStatus};

pub use lockbox_sync::SyncOutcome;
pub use lockbox_vault::{Entry, EntryPatch, EntrySummary, NewEntry, UnlockedVault};
