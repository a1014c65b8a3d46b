//! Lockbox sync engine
//!
//! Reconciles the local vault envelope with the remote record:
//! - Version-based, whole-envelope conflict resolution
//! - Conditional writes so concurrent pushes cannot silently overwrite
//! - Exponential backoff when a conditional write loses a race

pub mod conflict;
pub mod engine;
pub mod retry;

pub use conflict::{diverged_at_same_version, reconcile, SyncDecision};
pub use engine::{SyncConfig, SyncEngine, SyncOutcome};
pub use retry::ConflictRetry;
