//! Content fingerprints for logs and sync reports.

use blake2::digest::consts::U32;
use blake2::{Blake2b, Digest};

/// BLAKE2b-256 of `data`, lowercase hex.
///
/// Labels ciphertext so two replicas can be compared in logs. Not an
/// integrity check; the AEAD tag is.
pub fn fingerprint(data: &[u8]) -> String {
    let mut hasher = Blake2b::<U32>::new();
    hasher.update(data);
    hasher
        .finalize()
        .iter()
        .map(|b| format!("{:02x}", b))
        .collect()
}
