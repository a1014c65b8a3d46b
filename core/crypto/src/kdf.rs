//! Key derivation using Argon2id.
//!
//! Argon2id is a memory-hard password hashing function that provides
//! resistance to both GPU and time-memory trade-off attacks.

use argon2::{Algorithm, Argon2, Params, Version};
use serde::{Deserialize, Serialize};
use tracing::debug;
use zeroize::Zeroize;

use crate::keys::{MasterKey, Salt, SymmetricKey, KEY_LENGTH};
use lockbox_common::{Error, Result};

/// Algorithm tag stored alongside the parameters.
pub const ARGON2ID: &str = "argon2id";

/// Parameters for Argon2id key derivation.
///
/// Field names are part of the persisted envelope format.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct KdfParams {
    /// Algorithm tag; only "argon2id" is accepted.
    pub algo: String,
    /// Memory cost in KiB (e.g., 65536 = 64 MiB).
    pub memory: u32,
    /// Number of iterations.
    pub iterations: u32,
    /// Degree of parallelism.
    pub parallelism: u8,
}

impl KdfParams {
    /// Create Argon2id parameters with explicit costs.
    pub fn new(memory: u32, iterations: u32, parallelism: u8) -> Self {
        Self {
            algo: ARGON2ID.to_string(),
            memory,
            iterations,
            parallelism,
        }
    }

    /// Create parameters suitable for interactive use.
    ///
    /// 64 MiB, 3 passes, single lane. This is the default for new vaults.
    pub fn interactive() -> Self {
        Self::new(64 * 1024, 3, 1)
    }

    /// Create parameters suitable for sensitive data.
    ///
    /// Higher security parameters that may take several seconds.
    pub fn sensitive() -> Self {
        Self::new(256 * 1024, 4, 1)
    }

    /// Check the tag and costs before handing them to Argon2.
    pub fn validate(&self) -> Result<()> {
        if self.algo != ARGON2ID {
            return Err(Error::InvalidInput(format!(
                "Unsupported KDF algorithm: {}",
                self.algo
            )));
        }
        if self.iterations == 0 || self.parallelism == 0 {
            return Err(Error::InvalidInput(
                "KDF iterations and parallelism must be non-zero".to_string(),
            ));
        }
        Ok(())
    }
}

impl Default for KdfParams {
    fn default() -> Self {
        Self::interactive()
    }
}

/// Derive a master key from a passphrase and salt using Argon2id.
///
/// # Preconditions
/// - `passphrase` must not be empty
/// - `params` must carry the argon2id tag and valid costs
///
/// # Postconditions
/// - Returns a MasterKey derived from the passphrase
/// - The derived key is deterministic given the same inputs
///
/// # Errors
/// - Returns error if passphrase is empty
/// - Returns error if Argon2id parameters are invalid
///
/// # Security
/// - Passphrase is not stored or logged
/// - The intermediate output buffer is zeroized after derivation
pub fn derive_master_key(passphrase: &[u8], salt: &Salt, params: &KdfParams) -> Result<MasterKey> {
    if passphrase.is_empty() {
        return Err(Error::InvalidInput("Passphrase cannot be empty".to_string()));
    }
    params.validate()?;

    let argon2_params = Params::new(
        params.memory,
        params.iterations,
        u32::from(params.parallelism),
        Some(KEY_LENGTH),
    )
    .map_err(|e| Error::InvalidInput(format!("Invalid KDF parameters: {}", e)))?;

    let argon2 = Argon2::new(Algorithm::Argon2id, Version::V0x13, argon2_params);

    debug!(
        memory_kib = params.memory,
        iterations = params.iterations,
        parallelism = params.parallelism,
        "Deriving master key"
    );

    let mut key_bytes = [0u8; KEY_LENGTH];
    let outcome = argon2.hash_password_into(passphrase, salt.as_bytes(), &mut key_bytes);
    if let Err(e) = outcome {
        key_bytes.zeroize();
        return Err(Error::Crypto(format!("Key derivation failed: {}", e)));
    }

    let key = MasterKey::from_bytes(key_bytes);
    key_bytes.zeroize();
    Ok(key)
}
