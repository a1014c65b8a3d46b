//! Unlocked vault context.
//!
//! An [`UnlockedVault`] holds the decrypted vault key and record model for
//! one envelope. It is owned by the caller and passed to each operation;
//! dropping it zeroizes the key. Locking is dropping.

use tracing::{debug, info};

use lockbox_common::{Error, Result, VaultId};
use lockbox_crypto::{constant_time_eq, KdfParams, VaultKey};

use crate::envelope::Envelope;
use crate::model::{Entry, EntrySummary, VaultRecords};

/// A mutation prepared against an unlocked vault but not yet committed.
///
/// Holds the successor envelope (version + 1) and the record model it
/// encrypts. Persist the envelope first, then [`UnlockedVault::commit`].
#[derive(Debug, Clone)]
pub struct PendingChange {
    envelope: Envelope,
    records: VaultRecords,
}

impl PendingChange {
    /// Successor envelope to persist.
    pub fn envelope(&self) -> &Envelope {
        &self.envelope
    }

    /// Version the change will carry once committed.
    pub fn version(&self) -> u64 {
        self.envelope.version
    }
}

/// Decrypted vault state.
pub struct UnlockedVault {
    envelope: Envelope,
    vault_key: VaultKey,
    records: VaultRecords,
}

impl UnlockedVault {
    /// Create a fresh vault around an empty record model.
    ///
    /// # Errors
    /// - `InvalidInput` if the passphrase and confirmation differ or are empty
    pub fn create(passphrase: &[u8], confirmation: &[u8], kdf_params: KdfParams) -> Result<Self> {
        if !constant_time_eq(passphrase, confirmation) {
            return Err(Error::InvalidInput("Passphrases do not match".to_string()));
        }
        let records = VaultRecords::new(VaultId::generate());
        let (envelope, vault_key) = Envelope::create(passphrase, kdf_params, &records)?;
        info!(vault_id = %envelope.vault_id, "Created vault");
        Ok(Self {
            envelope,
            vault_key,
            records,
        })
    }

    /// Unlock `envelope` with a passphrase.
    ///
    /// # Errors
    /// - `Authentication` if the passphrase is wrong or the envelope is corrupted
    pub fn open(envelope: Envelope, passphrase: &[u8]) -> Result<Self> {
        let vault_key = envelope.open_key(passphrase)?;
        Self::with_key(envelope, vault_key)
    }

    /// Unlock `envelope` with a vault key recovered elsewhere (e.g. a session).
    ///
    /// # Errors
    /// - `Authentication` if the key does not open the payload
    pub fn with_key(envelope: Envelope, vault_key: VaultKey) -> Result<Self> {
        let records = envelope.open_records(&vault_key)?;
        debug!(
            vault_id = %envelope.vault_id,
            version = envelope.version,
            entries = records.len(),
            "Unlocked vault"
        );
        Ok(Self {
            envelope,
            vault_key,
            records,
        })
    }

    /// Identifier of the unlocked vault.
    pub fn vault_id(&self) -> &VaultId {
        &self.envelope.vault_id
    }

    /// Version of the envelope this context was unlocked at.
    pub fn version(&self) -> u64 {
        self.envelope.version
    }

    /// Envelope this context was unlocked from or last committed.
    pub fn envelope(&self) -> &Envelope {
        &self.envelope
    }

    /// The unwrapped vault key, for caching in a session.
    pub fn vault_key(&self) -> &VaultKey {
        &self.vault_key
    }

    /// Decrypted record model.
    pub fn records(&self) -> &VaultRecords {
        &self.records
    }

    /// Summaries of all entries, in insertion order.
    pub fn list(&self) -> Vec<EntrySummary> {
        self.records.list_entries()
    }

    /// Look up an entry by id or name.
    ///
    /// # Errors
    /// - `NotFound` if no entry matches
    pub fn get(&self, identifier: &str) -> Result<&Entry> {
        self.records
            .get_entry(identifier)
            .ok_or_else(|| Error::NotFound(format!("Entry '{}' not found", identifier)))
    }

    /// Apply `change` to a copy of the record model and seal the result.
    ///
    /// The context itself is unchanged until the returned change is committed.
    pub fn stage<T, F>(&self, change: F) -> Result<(PendingChange, T)>
    where
        F: FnOnce(&mut VaultRecords) -> Result<T>,
    {
        let mut records = self.records.clone();
        let output = change(&mut records)?;
        let envelope = self.envelope.reseal(&self.vault_key, &records)?;
        Ok((PendingChange { envelope, records }, output))
    }

    /// Re-wrap the vault key under a new passphrase.
    ///
    /// The current passphrase must unwrap the stored key; the payload is not
    /// re-encrypted.
    ///
    /// # Errors
    /// - `Authentication` if `current` is wrong
    /// - `InvalidInput` if `new` and `confirmation` differ or are empty
    pub fn stage_rotation(
        &self,
        current: &[u8],
        new: &[u8],
        confirmation: &[u8],
        kdf_params: KdfParams,
    ) -> Result<PendingChange> {
        self.envelope.open_key(current)?;
        if !constant_time_eq(new, confirmation) {
            return Err(Error::InvalidInput(
                "New passphrases do not match".to_string(),
            ));
        }
        let envelope = self.envelope.rewrap(&self.vault_key, new, kdf_params)?;
        Ok(PendingChange {
            envelope,
            records: self.records.clone(),
        })
    }

    /// Adopt a persisted change.
    ///
    /// # Errors
    /// - `VersionConflict` if the change was not staged from this context's version
    pub fn commit(&mut self, change: PendingChange) -> Result<()> {
        if change.envelope.version != self.envelope.version + 1 {
            return Err(Error::VersionConflict {
                expected: (self.envelope.version + 1).to_string(),
                actual: change.envelope.version.to_string(),
            });
        }
        self.envelope = change.envelope;
        self.records = change.records;
        Ok(())
    }
}

impl std::fmt::Debug for UnlockedVault {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("UnlockedVault")
            .field("vault_id", &self.envelope.vault_id)
            .field("version", &self.envelope.version)
            .field("entries", &self.records.len())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::{EntryPatch, NewEntry};
    use lockbox_common::SensitiveBytes;
    use lockbox_crypto::SymmetricKey;

    fn fast() -> KdfParams {
        KdfParams::new(1024, 1, 1)
    }

    #[test]
    fn test_create_requires_matching_confirmation() {
        assert!(matches!(
            UnlockedVault::create(b"one", b"two", fast()),
            Err(Error::InvalidInput(_))
        ));
        let vault = UnlockedVault::create(b"same", b"same", fast()).unwrap();
        assert_eq!(vault.version(), 1);
        assert!(vault.list().is_empty());
    }

    #[test]
    fn test_stage_does_not_touch_context_until_commit() {
        let mut vault = UnlockedVault::create(b"pw", b"pw", fast()).unwrap();

        let (change, id) = vault
            .stage(|records| {
                records
                    .add_entry(NewEntry::new("github", b"token".as_slice()))
                    .map(|e| e.id.clone())
            })
            .unwrap();

        assert_eq!(change.version(), 2);
        assert!(vault.get("github").is_err());

        vault.commit(change).unwrap();
        assert_eq!(vault.version(), 2);
        assert_eq!(vault.get(&id).unwrap().name, "github");
    }

    #[test]
    fn test_failed_change_is_not_staged() {
        let vault = UnlockedVault::create(b"pw", b"pw", fast()).unwrap();
        let result = vault.stage(|records| records.remove_entry("missing").map(|_| ()));
        assert!(matches!(result, Err(Error::NotFound(_))));
        assert_eq!(vault.version(), 1);
    }

    #[test]
    fn test_commit_rejects_change_from_other_version() {
        let mut vault = UnlockedVault::create(b"pw", b"pw", fast()).unwrap();
        let (first, _) = vault
            .stage(|r| r.add_entry(NewEntry::new("a", b"1".as_slice())).map(|_| ()))
            .unwrap();
        let (second, _) = vault
            .stage(|r| r.add_entry(NewEntry::new("b", b"2".as_slice())).map(|_| ()))
            .unwrap();

        vault.commit(first).unwrap();
        assert!(matches!(
            vault.commit(second),
            Err(Error::VersionConflict { .. })
        ));
    }

    #[test]
    fn test_reopen_with_passphrase_and_key() {
        let mut vault = UnlockedVault::create(b"pw", b"pw", fast()).unwrap();
        let (change, _) = vault
            .stage(|r| {
                r.add_entry(NewEntry::new("x", b"secret".as_slice()))?;
                r.update_entry(
                    "x",
                    EntryPatch {
                        username: Some("me".to_string()),
                        ..Default::default()
                    },
                )
                .map(|_| ())
            })
            .unwrap();
        vault.commit(change).unwrap();

        let envelope = vault.envelope().clone();
        let by_pass = UnlockedVault::open(envelope.clone(), b"pw").unwrap();
        let by_key = UnlockedVault::with_key(envelope, vault.vault_key().clone()).unwrap();

        assert_eq!(by_pass.records(), vault.records());
        assert_eq!(by_key.get("x").unwrap().username, "me");
        assert_eq!(
            by_key.get("x").unwrap().password,
            SensitiveBytes::from(b"secret".as_slice())
        );
    }

    #[test]
    fn test_rotation() {
        let mut vault = UnlockedVault::create(b"old", b"old", fast()).unwrap();
        let original_salt = vault.envelope().salt_master.clone();

        assert!(matches!(
            vault.stage_rotation(b"wrong", b"new", b"new", fast()),
            Err(Error::Authentication)
        ));
        assert!(matches!(
            vault.stage_rotation(b"old", b"new", b"newer", fast()),
            Err(Error::InvalidInput(_))
        ));

        let change = vault.stage_rotation(b"old", b"new", b"new", fast()).unwrap();
        vault.commit(change).unwrap();

        assert_eq!(vault.version(), 2);
        assert_ne!(vault.envelope().salt_master, original_salt);

        let reopened = UnlockedVault::open(vault.envelope().clone(), b"new").unwrap();
        assert_eq!(reopened.vault_key().as_bytes(), vault.vault_key().as_bytes());
    }

    #[test]
    fn test_debug_hides_key() {
        let vault = UnlockedVault::create(b"pw", b"pw", fast()).unwrap();
        let debug = format!("{:?}", vault);
        assert!(debug.contains("UnlockedVault"));
        assert!(!debug.contains("vault_key"));
    }
}
