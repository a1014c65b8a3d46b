//! Key types with secure memory handling.
//!
//! All key types automatically zeroize their memory on drop to prevent
//! sensitive data from persisting in memory.

use rand::rngs::OsRng;
use rand::RngCore;
use std::fmt;
use subtle::ConstantTimeEq;
use zeroize::{Zeroize, ZeroizeOnDrop};

use lockbox_common::{Error, Result};

/// Length of encryption keys in bytes (256-bit).
pub const KEY_LENGTH: usize = 32;

/// Length of KDF salts in bytes.
pub const SALT_LENGTH: usize = 32;

/// Common surface of every 256-bit symmetric key in the hierarchy.
pub trait SymmetricKey: Sized {
    /// Wrap raw bytes. The caller's copy should be zeroized afterwards.
    fn from_bytes(key: [u8; KEY_LENGTH]) -> Self;

    /// Get the key bytes.
    ///
    /// # Security
    /// The returned slice should be used immediately and not stored.
    fn as_bytes(&self) -> &[u8; KEY_LENGTH];

    /// Build a key from a slice of exactly KEY_LENGTH bytes.
    fn from_slice(bytes: &[u8]) -> Result<Self> {
        if bytes.len() != KEY_LENGTH {
            return Err(Error::InvalidInput(format!(
                "Invalid key length: expected {}, got {}",
                KEY_LENGTH,
                bytes.len()
            )));
        }
        let mut key = [0u8; KEY_LENGTH];
        key.copy_from_slice(bytes);
        let result = Self::from_bytes(key);
        key.zeroize();
        Ok(result)
    }

    /// Generate a random key from the OS CSPRNG.
    fn generate() -> Self {
        let mut key = [0u8; KEY_LENGTH];
        OsRng.fill_bytes(&mut key);
        let result = Self::from_bytes(key);
        key.zeroize();
        result
    }
}

macro_rules! symmetric_key {
    ($(#[$meta:meta])* $name:ident) => {
        $(#[$meta])*
        #[derive(Clone, Zeroize, ZeroizeOnDrop)]
        pub struct $name {
            key: [u8; KEY_LENGTH],
        }

        impl SymmetricKey for $name {
            fn from_bytes(key: [u8; KEY_LENGTH]) -> Self {
                Self { key }
            }

            fn as_bytes(&self) -> &[u8; KEY_LENGTH] {
                &self.key
            }
        }

        impl fmt::Debug for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                write!(f, concat!(stringify!($name), "([REDACTED])"))
            }
        }
    };
}

symmetric_key!(
    /// Key derived from the passphrase. Never persisted; only wraps the vault key.
    MasterKey
);

symmetric_key!(
    /// Random key that encrypts the record model. Persisted only wrapped.
    VaultKey
);

symmetric_key!(
    /// Ephemeral key that lets a vault key be cached between invocations.
    SessionKey
);

symmetric_key!(
    /// Device-local secret protecting the session key at rest.
    DeviceSecret
);

/// Salt for key derivation.
#[derive(Clone, PartialEq, Eq)]
pub struct Salt([u8; SALT_LENGTH]);

impl Salt {
    /// Generate a random salt.
    pub fn generate() -> Self {
        let mut salt = [0u8; SALT_LENGTH];
        OsRng.fill_bytes(&mut salt);
        Self(salt)
    }

    /// Create from bytes.
    pub fn from_bytes(bytes: [u8; SALT_LENGTH]) -> Self {
        Self(bytes)
    }

    /// Create from a decoded slice.
    pub fn from_slice(bytes: &[u8]) -> Result<Self> {
        let salt: [u8; SALT_LENGTH] = bytes.try_into().map_err(|_| {
            Error::InvalidInput(format!(
                "Invalid salt length: expected {}, got {}",
                SALT_LENGTH,
                bytes.len()
            ))
        })?;
        Ok(Self(salt))
    }

    /// Get the salt bytes.
    pub fn as_bytes(&self) -> &[u8; SALT_LENGTH] {
        &self.0
    }
}

impl fmt::Debug for Salt {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Salt({} bytes)", SALT_LENGTH)
    }
}

/// Compare two secrets without leaking where they differ.
///
/// Slices of different length compare unequal.
pub fn constant_time_eq(a: &[u8], b: &[u8]) -> bool {
    a.ct_eq(b).into()
}
