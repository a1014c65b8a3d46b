//! Vault engine for Lockbox.
//!
//! This module provides:
//! - The plaintext record model and its entry operations
//! - The persisted envelope format and the key hierarchy around it
//! - The unlocked vault context passed to every operation
//! - The time-boxed session cache
//!
//! # Architecture
//! The vault module sits between the application service and storage,
//! handling all encryption and decryption. Storage only ever sees
//! serialized envelopes.

pub mod cache;
pub mod envelope;
pub mod model;
pub mod session;

pub use cache::{SessionCache, DEFAULT_SECRET_NAME, DEFAULT_SESSION_TIMEOUT};
pub use envelope::{Envelope, ENVELOPE_SCHEMA_VERSION};
pub use model::{Entry, EntryPatch, EntrySummary, NewEntry, VaultRecords, RECORD_SCHEMA_VERSION};
pub use session::{PendingChange, UnlockedVault};
