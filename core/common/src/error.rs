//! Common error types for Lockbox.

use thiserror::Error;

/// Top-level error type for Lockbox operations.
#[derive(Debug, Error)]
pub enum Error {
    /// Cryptographic operation failed for a reason other than authentication.
    #[error("Cryptographic error: {0}")]
    Crypto(String),

    /// AEAD verification failed.
    ///
    /// Wrong key and tampered ciphertext are reported identically.
    #[error("Invalid passphrase or corrupted data")]
    Authentication,

    /// Storage backend failed (disk or network).
    #[error("Storage error: {0}")]
    Storage(String),

    /// I/O operation failed.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// Serialization or deserialization failed.
    #[error("Serialization error: {0}")]
    Serialization(String),

    /// Invalid input provided.
    #[error("Invalid input: {0}")]
    InvalidInput(String),

    /// Operation not permitted.
    #[error("Not permitted: {0}")]
    NotPermitted(String),

    /// Resource not found.
    #[error("Not found: {0}")]
    NotFound(String),

    /// Resource already exists.
    #[error("Already exists: {0}")]
    AlreadyExists(String),

    /// A conditional write observed a different version than expected.
    #[error("Version conflict: expected {expected}, found {actual}")]
    VersionConflict {
        /// Version the writer expected to replace.
        expected: String,
        /// Version actually held by the store.
        actual: String,
    },

    /// No cached session is available.
    #[error("No active session")]
    NoActiveSession,

    /// The cached session is past its expiry time.
    #[error("Session expired")]
    SessionExpired,

    /// Synchronization gave up.
    #[error("Sync failed: {0}")]
    Sync(String),
}

impl Error {
    /// Whether a fresh fetch/compare/push round can succeed: only a lost
    /// conditional write qualifies. Transport failures are reported, not
    /// retried.
    pub fn is_retryable(&self) -> bool {
        matches!(self, Error::VersionConflict { .. })
    }

    /// Whether this is a "nothing there" condition.
    pub fn is_not_found(&self) -> bool {
        matches!(self, Error::NotFound(_))
    }
}

impl From<serde_json::Error> for Error {
    fn from(err: serde_json::Error) -> Self {
        Error::Serialization(err.to_string())
    }
}

/// Result type alias using the common Error.
pub type Result<T> = std::result::Result<T, Error>;
