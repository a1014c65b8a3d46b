//! Identifiers and secret buffers shared by every Lockbox crate.

use serde::{Deserialize, Serialize};
use std::fmt;
use zeroize::Zeroize;

use crate::{Error, Result};

/// String identifiers that are validated on construction and on
/// deserialization alike.
macro_rules! checked_id {
    ($(#[$meta:meta])* $name:ident, $check:path) => {
        $(#[$meta])*
        #[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
        #[serde(try_from = "String", into = "String")]
        pub struct $name(String);

        impl $name {
            pub fn new(id: impl Into<String>) -> Result<Self> {
                let id = id.into();
                $check(&id)?;
                Ok(Self(id))
            }

            pub fn as_str(&self) -> &str {
                &self.0
            }
        }

        impl TryFrom<String> for $name {
            type Error = Error;

            fn try_from(id: String) -> Result<Self> {
                Self::new(id)
            }
        }

        impl From<$name> for String {
            fn from(id: $name) -> String {
                id.0
            }
        }

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                f.write_str(&self.0)
            }
        }
    };
}

fn check_vault_id(id: &str) -> Result<()> {
    if id.is_empty() {
        return Err(Error::InvalidInput("Vault id is empty".to_string()));
    }
    Ok(())
}

/// Account ids become part of the `USER#<account>` partition key, so the
/// separator is reserved.
fn check_account_id(id: &str) -> Result<()> {
    match id {
        "" => Err(Error::InvalidInput("Account id is empty".to_string())),
        _ if id.contains('#') => Err(Error::InvalidInput(format!(
            "Account id '{}' contains the reserved '#'",
            id
        ))),
        _ => Ok(()),
    }
}

checked_id!(
    /// Identifier carried inside an envelope and its record model.
    VaultId,
    check_vault_id
);

checked_id!(
    /// Caller-supplied account that owns exactly one remote vault.
    AccountId,
    check_account_id
);

impl VaultId {
    /// Random UUID v4 identifier for a new vault.
    pub fn generate() -> Self {
        Self(uuid::Uuid::new_v4().to_string())
    }
}

impl AccountId {
    /// Key under which the account's remote record is stored.
    pub fn partition_key(&self) -> String {
        format!("USER#{}", self.0)
    }
}

/// Writer of a remote record. Informational only; never validated.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct DeviceId(String);

impl DeviceId {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    /// `<hostname>-<pid>` of the running process.
    pub fn current() -> Self {
        let host = ["HOSTNAME", "COMPUTERNAME"]
            .iter()
            .find_map(|var| std::env::var(var).ok())
            .or_else(|| std::fs::read_to_string("/etc/hostname").ok())
            .map(|h| h.trim().to_string())
            .filter(|h| !h.is_empty())
            .unwrap_or_else(|| "unknown".to_string());
        Self(format!("{}-{}", host, std::process::id()))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for DeviceId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Secret bytes (entry passwords, device secrets) wiped on drop.
///
/// Equality is plain byte equality; use `constant_time_eq` from the crypto
/// crate where timing matters.
#[derive(Clone, Zeroize)]
#[zeroize(drop)]
pub struct SensitiveBytes(Vec<u8>);

impl SensitiveBytes {
    pub fn new(data: Vec<u8>) -> Self {
        Self(data)
    }

    pub fn as_bytes(&self) -> &[u8] {
        &self.0
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }
}

impl PartialEq for SensitiveBytes {
    fn eq(&self, other: &Self) -> bool {
        self.as_bytes() == other.as_bytes()
    }
}

impl Eq for SensitiveBytes {}

impl From<Vec<u8>> for SensitiveBytes {
    fn from(bytes: Vec<u8>) -> Self {
        Self::new(bytes)
    }
}

impl From<&[u8]> for SensitiveBytes {
    fn from(bytes: &[u8]) -> Self {
        Self::new(bytes.to_vec())
    }
}

impl fmt::Debug for SensitiveBytes {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "SensitiveBytes([REDACTED; {} bytes])", self.len())
    }
}
