//! Version reconciliation between the local replica and the remote.
//!
//! Resolution is whole-envelope and version based: the higher version
//! wins, and there is no field-level merge.

use lockbox_vault::Envelope;

/// What a sync round should do given both versions.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SyncDecision {
    /// The remote has no record; create it.
    Create,
    /// Local is at least as new; replace the remote record at `expected`.
    Push { expected: u64 },
    /// Remote is newer; adopt it without pushing.
    TakeRemote,
}

/// Decide how to reconcile a local envelope at `local_version` with the
/// remote record's version, if any.
pub fn reconcile(local_version: u64, remote_version: Option<u64>) -> SyncDecision {
    match remote_version {
        None => SyncDecision::Create,
        Some(remote) if local_version >= remote => SyncDecision::Push { expected: remote },
        Some(_) => SyncDecision::TakeRemote,
    }
}

/// Whether two envelopes claim the same version but carry different payloads.
///
/// This happens when two devices each made one change from the same base
/// and only one push has landed. Version comparison alone cannot tell
/// them apart.
pub fn diverged_at_same_version(local: &Envelope, remote: &Envelope) -> bool {
    local.version == remote.version && local.fingerprint() != remote.fingerprint()
}
