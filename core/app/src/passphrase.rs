//! Passphrase sources.

use zeroize::Zeroizing;

use lockbox_common::{Error, Result};

/// Supplies passphrase bytes on demand.
///
/// Interactive adapters (terminal prompts) live with the caller; the
/// service only asks for bytes.
pub trait PassphraseSource {
    /// Return the passphrase for `prompt`.
    ///
    /// # Errors
    /// - `InvalidInput` if no passphrase could be obtained
    fn passphrase(&self, prompt: &str) -> Result<Zeroizing<Vec<u8>>>;
}

/// A passphrase known up front, e.g. from an environment variable.
pub struct FixedPassphrase(Zeroizing<Vec<u8>>);

impl FixedPassphrase {
    /// Wrap `passphrase`; an empty one is rejected when asked for.
    pub fn new(passphrase: impl Into<Vec<u8>>) -> Self {
        Self(Zeroizing::new(passphrase.into()))
    }
}

impl PassphraseSource for FixedPassphrase {
    fn passphrase(&self, _prompt: &str) -> Result<Zeroizing<Vec<u8>>> {
        if self.0.is_empty() {
            return Err(Error::InvalidInput("Empty passphrase".to_string()));
        }
        Ok(self.0.clone())
    }
}

impl std::fmt::Debug for FixedPassphrase {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str("FixedPassphrase([REDACTED])")
    }
}
