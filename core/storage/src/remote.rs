//! Remote store trait definition.
//!
//! A remote holds at most one record per account. Every write is
//! conditional on the version the writer last observed, which is the only
//! concurrency control between devices.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;

use lockbox_common::{AccountId, DeviceId, Error, Result};

/// Sort key of the single vault record under an account.
pub const VAULT_SORT_KEY: &str = "VAULT";

/// The stored form of an account's vault.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RemoteRecord {
    /// `USER#<account>`.
    #[serde(rename = "PK")]
    pub partition_key: String,
    /// Always [`VAULT_SORT_KEY`].
    #[serde(rename = "SK")]
    pub sort_key: String,
    /// Identifier of the vault carried in the blob.
    pub vault_id: String,
    /// Serialized envelope.
    pub vault_blob: String,
    /// Envelope version, duplicated here so stores can compare without parsing the blob.
    pub version: u64,
    /// Envelope modification time.
    pub modified_at: DateTime<Utc>,
    /// Device that performed the write.
    pub device_id: DeviceId,
}

impl RemoteRecord {
    /// Build a record for `account`, filling in the key attributes.
    pub fn new(
        account: &AccountId,
        vault_id: impl Into<String>,
        vault_blob: impl Into<String>,
        version: u64,
        modified_at: DateTime<Utc>,
        device_id: DeviceId,
    ) -> Self {
        Self {
            partition_key: account.partition_key(),
            sort_key: VAULT_SORT_KEY.to_string(),
            vault_id: vault_id.into(),
            vault_blob: vault_blob.into(),
            version,
            modified_at,
            device_id,
        }
    }

    /// Check the key attributes address `account`.
    pub fn check_owner(&self, account: &AccountId) -> Result<()> {
        if self.partition_key != account.partition_key() || self.sort_key != VAULT_SORT_KEY {
            return Err(Error::InvalidInput(format!(
                "Record keys {}/{} do not belong to account {}",
                self.partition_key, self.sort_key, account
            )));
        }
        Ok(())
    }
}

/// Precondition on the version currently held by the remote.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExpectedVersion {
    /// No record may exist yet.
    Absent,
    /// The stored record must carry exactly this version.
    Version(u64),
}

impl ExpectedVersion {
    /// Evaluate the precondition against the version currently stored.
    ///
    /// # Errors
    /// - `VersionConflict` carrying both sides when the precondition fails
    pub fn check(self, current: Option<u64>) -> Result<()> {
        let satisfied = match (self, current) {
            (ExpectedVersion::Absent, None) => true,
            (ExpectedVersion::Version(expected), Some(actual)) => expected == actual,
            _ => false,
        };
        if satisfied {
            Ok(())
        } else {
            Err(Error::VersionConflict {
                expected: self.to_string(),
                actual: current.map_or_else(|| "none".to_string(), |v| v.to_string()),
            })
        }
    }
}

impl fmt::Display for ExpectedVersion {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ExpectedVersion::Absent => write!(f, "none"),
            ExpectedVersion::Version(v) => write!(f, "{}", v),
        }
    }
}

/// Remote backend holding one envelope per account.
///
/// Implementations must make `put` a single atomic compare-and-set: two
/// writers presenting the same expected version cannot both succeed.
#[async_trait]
pub trait RemoteStore: Send + Sync {
    /// Get the backend name (e.g., "memory", "directory").
    fn name(&self) -> &str;

    /// Fetch the account's record.
    ///
    /// # Errors
    /// - `NotFound` if the account has no record
    /// - `Storage`/`Io` on transport failure
    async fn get(&self, account: &AccountId) -> Result<RemoteRecord>;

    /// Write the account's record if `expected` holds.
    ///
    /// # Preconditions
    /// - `record` keys address `account`
    ///
    /// # Errors
    /// - `VersionConflict` if the stored version does not match `expected`
    /// - `Storage`/`Io` on transport failure
    async fn put(
        &self,
        account: &AccountId,
        record: RemoteRecord,
        expected: ExpectedVersion,
    ) -> Result<()>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_expected_version_check() {
        assert!(ExpectedVersion::Absent.check(None).is_ok());
        assert!(ExpectedVersion::Version(4).check(Some(4)).is_ok());

        assert!(matches!(
            ExpectedVersion::Absent.check(Some(1)),
            Err(Error::VersionConflict { .. })
        ));
        assert!(matches!(
            ExpectedVersion::Version(4).check(None),
            Err(Error::VersionConflict { .. })
        ));
    }

    #[test]
    fn test_conflict_reports_both_sides() {
        match ExpectedVersion::Version(3).check(Some(5)) {
            Err(Error::VersionConflict { expected, actual }) => {
                assert_eq!(expected, "3");
                assert_eq!(actual, "5");
            }
            other => panic!("unexpected: {:?}", other),
        }
    }

    #[test]
    fn test_record_keys() {
        let account = AccountId::new("alice").unwrap();
        let record = RemoteRecord::new(
            &account,
            "vault-1",
            "{}",
            1,
            Utc::now(),
            DeviceId::new("laptop-1"),
        );

        assert_eq!(record.partition_key, "USER#alice");
        assert_eq!(record.sort_key, "VAULT");
        assert!(record.check_owner(&account).is_ok());
        assert!(record
            .check_owner(&AccountId::new("bob").unwrap())
            .is_err());

        let json = serde_json::to_value(&record).unwrap();
        assert_eq!(json["PK"], "USER#alice");
        assert_eq!(json["SK"], "VAULT");
        assert_eq!(json["device_id"], "laptop-1");
    }
}
