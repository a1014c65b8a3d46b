//! Plaintext record model.
//!
//! The model exists decrypted only inside an unlocked context. It is
//! serialized to JSON before encryption and never written in the clear.

use base64::{engine::general_purpose::STANDARD, Engine};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Deserializer, Serialize, Serializer};
use uuid::Uuid;

use lockbox_common::{Error, Result, SensitiveBytes, VaultId};

/// Current record model format version.
pub const RECORD_SCHEMA_VERSION: u32 = 1;

/// Secret value as it may appear in stored JSON.
///
/// Current writers emit a base64 string. Older writers stored the secret
/// as its plain text, and some encoders emit a byte array. Decoding is
/// normalized to bytes immediately; a string that is valid base64 is
/// taken as base64.
#[derive(Deserialize)]
#[serde(untagged)]
enum StoredSecret {
    Text(String),
    Bytes(Vec<u8>),
}

impl StoredSecret {
    fn into_bytes(self) -> Vec<u8> {
        match self {
            StoredSecret::Text(text) => match STANDARD.decode(&text) {
                Ok(decoded) => decoded,
                Err(_) => text.into_bytes(),
            },
            StoredSecret::Bytes(bytes) => bytes,
        }
    }
}

fn serialize_secret<S>(secret: &SensitiveBytes, serializer: S) -> std::result::Result<S::Ok, S::Error>
where
    S: Serializer,
{
    serializer.serialize_str(&STANDARD.encode(secret.as_bytes()))
}

fn deserialize_secret<'de, D>(deserializer: D) -> std::result::Result<SensitiveBytes, D::Error>
where
    D: Deserializer<'de>,
{
    let stored = Option::<StoredSecret>::deserialize(deserializer)?;
    Ok(SensitiveBytes::new(
        stored.map(StoredSecret::into_bytes).unwrap_or_default(),
    ))
}

/// A single credential record.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Entry {
    /// Immutable identifier (UUID v4).
    pub id: String,
    /// Display name; unique within the vault and usable as a lookup key.
    pub name: String,
    #[serde(default)]
    pub username: String,
    /// Secret value as opaque bytes.
    #[serde(
        serialize_with = "serialize_secret",
        deserialize_with = "deserialize_secret",
        default = "empty_secret"
    )]
    pub password: SensitiveBytes,
    #[serde(default)]
    pub url: String,
    #[serde(default)]
    pub notes: String,
    /// One-time 2FA backup codes, in order.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub backup_codes: Vec<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

fn empty_secret() -> SensitiveBytes {
    SensitiveBytes::new(Vec::new())
}

impl Entry {
    /// Whether `identifier` names this entry by id or by name.
    pub fn matches(&self, identifier: &str) -> bool {
        self.id == identifier || self.name == identifier
    }

    /// Listing view of this entry.
    pub fn summary(&self) -> EntrySummary {
        EntrySummary {
            id: self.id.clone(),
            name: self.name.clone(),
            username: self.username.clone(),
            url: self.url.clone(),
            created_at: self.created_at,
            updated_at: self.updated_at,
        }
    }
}

/// Entry without its secret, for listings.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EntrySummary {
    pub id: String,
    pub name: String,
    pub username: String,
    pub url: String,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

/// Fields of a new entry.
#[derive(Debug, Clone)]
pub struct NewEntry {
    pub name: String,
    pub username: String,
    pub password: SensitiveBytes,
    pub url: String,
    pub notes: String,
    pub backup_codes: Vec<String>,
}

impl NewEntry {
    /// Entry with only a name and secret set.
    pub fn new(name: impl Into<String>, password: impl Into<SensitiveBytes>) -> Self {
        Self {
            name: name.into(),
            username: String::new(),
            password: password.into(),
            url: String::new(),
            notes: String::new(),
            backup_codes: Vec::new(),
        }
    }

    pub fn username(mut self, username: impl Into<String>) -> Self {
        self.username = username.into();
        self
    }

    pub fn url(mut self, url: impl Into<String>) -> Self {
        self.url = url.into();
        self
    }

    pub fn notes(mut self, notes: impl Into<String>) -> Self {
        self.notes = notes.into();
        self
    }

    pub fn backup_codes(mut self, codes: Vec<String>) -> Self {
        self.backup_codes = codes;
        self
    }
}

/// Partial update of an entry.
///
/// `None` leaves a field unchanged, and so do an empty string and an
/// empty secret. `backup_codes: Some(vec![])` clears the codes.
#[derive(Debug, Clone, Default)]
pub struct EntryPatch {
    pub name: Option<String>,
    pub username: Option<String>,
    pub password: Option<SensitiveBytes>,
    pub url: Option<String>,
    pub notes: Option<String>,
    pub backup_codes: Option<Vec<String>>,
}

impl EntryPatch {
    /// Whether applying the patch would change nothing but `updated_at`.
    pub fn is_empty(&self) -> bool {
        non_empty(&self.name).is_none()
            && non_empty(&self.username).is_none()
            && self.password.as_ref().map_or(true, |p| p.is_empty())
            && non_empty(&self.url).is_none()
            && non_empty(&self.notes).is_none()
            && self.backup_codes.is_none()
    }
}

fn non_empty(field: &Option<String>) -> Option<&str> {
    field.as_deref().filter(|s| !s.is_empty())
}

/// The decrypted vault: an ordered collection of entries.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct VaultRecords {
    pub schema_version: u32,
    pub vault_id: VaultId,
    #[serde(default)]
    entries: Vec<Entry>,
}

impl VaultRecords {
    /// Create an empty model for `vault_id`.
    pub fn new(vault_id: VaultId) -> Self {
        Self {
            schema_version: RECORD_SCHEMA_VERSION,
            vault_id,
            entries: Vec::new(),
        }
    }

    /// Entries in insertion order.
    pub fn entries(&self) -> &[Entry] {
        &self.entries
    }

    /// Number of entries.
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// Whether the vault holds no entries.
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Find an entry by id or name.
    pub fn get_entry(&self, identifier: &str) -> Option<&Entry> {
        self.entries.iter().find(|e| e.matches(identifier))
    }

    /// Summaries of all entries, without secrets, in insertion order.
    pub fn list_entries(&self) -> Vec<EntrySummary> {
        self.entries.iter().map(Entry::summary).collect()
    }

    fn name_taken(&self, name: &str, except_id: Option<&str>) -> bool {
        self.entries
            .iter()
            .any(|e| e.name == name && Some(e.id.as_str()) != except_id)
    }

    /// Append a new entry.
    ///
    /// # Errors
    /// - `InvalidInput` if the name is empty or already used
    pub fn add_entry(&mut self, new: NewEntry) -> Result<&Entry> {
        if new.name.is_empty() {
            return Err(Error::InvalidInput("Entry name is required".to_string()));
        }
        if self.name_taken(&new.name, None) {
            return Err(Error::InvalidInput(format!(
                "An entry named '{}' already exists",
                new.name
            )));
        }

        let now = Utc::now();
        self.entries.push(Entry {
            id: Uuid::new_v4().to_string(),
            name: new.name,
            username: new.username,
            password: new.password,
            url: new.url,
            notes: new.notes,
            backup_codes: new.backup_codes,
            created_at: now,
            updated_at: now,
        });
        let index = self.entries.len() - 1;
        Ok(&self.entries[index])
    }

    /// Apply `patch` to the entry matching `identifier`.
    ///
    /// # Errors
    /// - `NotFound` if no entry matches
    /// - `InvalidInput` if the new name belongs to another entry
    pub fn update_entry(&mut self, identifier: &str, patch: EntryPatch) -> Result<&Entry> {
        let index = self
            .entries
            .iter()
            .position(|e| e.matches(identifier))
            .ok_or_else(|| Error::NotFound(format!("Entry '{}' not found", identifier)))?;

        if let Some(name) = non_empty(&patch.name) {
            if self.name_taken(name, Some(&self.entries[index].id)) {
                return Err(Error::InvalidInput(format!(
                    "An entry named '{}' already exists",
                    name
                )));
            }
        }

        let entry = &mut self.entries[index];
        if let Some(name) = non_empty(&patch.name) {
            entry.name = name.to_string();
        }
        if let Some(username) = non_empty(&patch.username) {
            entry.username = username.to_string();
        }
        if let Some(password) = patch.password.filter(|p| !p.is_empty()) {
            entry.password = password;
        }
        if let Some(url) = non_empty(&patch.url) {
            entry.url = url.to_string();
        }
        if let Some(notes) = non_empty(&patch.notes) {
            entry.notes = notes.to_string();
        }
        if let Some(codes) = patch.backup_codes {
            entry.backup_codes = codes;
        }
        entry.updated_at = Utc::now();

        Ok(&self.entries[index])
    }

    /// Remove the entry matching `identifier`, preserving the order of the rest.
    ///
    /// # Errors
    /// - `NotFound` if no entry matches
    pub fn remove_entry(&mut self, identifier: &str) -> Result<Entry> {
        let index = self
            .entries
            .iter()
            .position(|e| e.matches(identifier))
            .ok_or_else(|| Error::NotFound(format!("Entry '{}' not found", identifier)))?;
        Ok(self.entries.remove(index))
    }

    /// Serialize for encryption.
    pub fn to_json(&self) -> Result<Vec<u8>> {
        Ok(serde_json::to_vec(self)?)
    }

    /// Deserialize decrypted bytes.
    ///
    /// # Errors
    /// - `Serialization` on malformed JSON
    /// - `InvalidInput` on an unsupported schema version
    pub fn from_json(bytes: &[u8]) -> Result<Self> {
        let records: Self = serde_json::from_slice(bytes)?;
        if records.schema_version != RECORD_SCHEMA_VERSION {
            return Err(Error::InvalidInput(format!(
                "Unsupported record schema version: {}",
                records.schema_version
            )));
        }
        Ok(records)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    fn records() -> VaultRecords {
        VaultRecords::new(VaultId::new("vault-1").unwrap())
    }

    #[test]
    fn test_add_and_lookup_by_id_or_name() {
        let mut vault = records();
        let id = vault
            .add_entry(NewEntry::new("github", b"hunter2".as_slice()).username("octocat"))
            .unwrap()
            .id
            .clone();

        assert_eq!(vault.get_entry(&id).unwrap().name, "github");
        assert_eq!(vault.get_entry("github").unwrap().id, id);
        assert!(vault.get_entry("gitlab").is_none());
    }

    #[test]
    fn test_add_rejects_duplicate_and_empty_names() {
        let mut vault = records();
        vault.add_entry(NewEntry::new("email", b"a".as_slice())).unwrap();

        assert!(matches!(
            vault.add_entry(NewEntry::new("email", b"b".as_slice())),
            Err(Error::InvalidInput(_))
        ));
        assert!(matches!(
            vault.add_entry(NewEntry::new("", b"b".as_slice())),
            Err(Error::InvalidInput(_))
        ));
        assert_eq!(vault.len(), 1);
    }

    #[test]
    fn test_update_changes_only_provided_fields() {
        let mut vault = records();
        let created = vault
            .add_entry(
                NewEntry::new("bank", b"old".as_slice())
                    .username("me")
                    .url("https://bank.example")
                    .notes("checking"),
            )
            .unwrap()
            .clone();

        let patch = EntryPatch {
            password: Some(SensitiveBytes::from(b"new".as_slice())),
            notes: Some(String::new()),
            ..Default::default()
        };
        let updated = vault.update_entry("bank", patch).unwrap();

        assert_eq!(updated.password.as_bytes(), b"new");
        assert_eq!(updated.username, "me");
        assert_eq!(updated.url, "https://bank.example");
        assert_eq!(updated.notes, "checking");
        assert_eq!(updated.created_at, created.created_at);
        assert!(updated.updated_at >= created.updated_at);
    }

    #[test]
    fn test_update_rejects_rename_onto_other_entry() {
        let mut vault = records();
        vault.add_entry(NewEntry::new("a", b"1".as_slice())).unwrap();
        vault.add_entry(NewEntry::new("b", b"2".as_slice())).unwrap();

        let rename = EntryPatch {
            name: Some("a".to_string()),
            ..Default::default()
        };
        assert!(matches!(
            vault.update_entry("b", rename),
            Err(Error::InvalidInput(_))
        ));

        let keep = EntryPatch {
            name: Some("b".to_string()),
            ..Default::default()
        };
        assert!(vault.update_entry("b", keep).is_ok());
    }

    #[test]
    fn test_update_and_remove_missing_are_not_found() {
        let mut vault = records();
        assert!(matches!(
            vault.update_entry("ghost", EntryPatch::default()),
            Err(Error::NotFound(_))
        ));
        assert!(matches!(
            vault.remove_entry("ghost"),
            Err(Error::NotFound(_))
        ));
    }

    #[test]
    fn test_remove_preserves_order() {
        let mut vault = records();
        for name in ["one", "two", "three"] {
            vault.add_entry(NewEntry::new(name, b"x".as_slice())).unwrap();
        }

        let removed = vault.remove_entry("two").unwrap();
        assert_eq!(removed.name, "two");

        let names: Vec<_> = vault.entries().iter().map(|e| e.name.as_str()).collect();
        assert_eq!(names, vec!["one", "three"]);
    }

    #[test]
    fn test_listing_omits_secrets() {
        let mut vault = records();
        vault
            .add_entry(NewEntry::new("api", b"s3cr3t-token".as_slice()))
            .unwrap();

        let json = serde_json::to_string(&vault.list_entries()).unwrap();
        assert!(json.contains("\"name\":\"api\""));
        assert!(!json.contains("password"));
    }

    #[test]
    fn test_secret_written_as_base64() {
        let mut vault = records();
        vault
            .add_entry(NewEntry::new("bin", vec![0u8, 159, 146, 150]))
            .unwrap();

        let value: serde_json::Value = serde_json::from_slice(&vault.to_json().unwrap()).unwrap();
        assert_eq!(value["entries"][0]["password"], "AJ+Slg==");
    }

    #[test]
    fn test_legacy_plain_text_secret_decodes() {
        let json = r#"{
            "schema_version": 1,
            "vault_id": "v",
            "entries": [{
                "id": "e1",
                "name": "legacy",
                "username": "u",
                "password": "not base64!",
                "url": "",
                "notes": "",
                "created_at": "2024-01-01T00:00:00Z",
                "updated_at": "2024-01-01T00:00:00Z"
            }]
        }"#;

        let vault = VaultRecords::from_json(json.as_bytes()).unwrap();
        assert_eq!(vault.entries()[0].password.as_bytes(), b"not base64!");
    }

    #[test]
    fn test_byte_array_secret_decodes() {
        let json = r#"{
            "schema_version": 1,
            "vault_id": "v",
            "entries": [{
                "id": "e1",
                "name": "array",
                "password": [104, 105],
                "created_at": "2024-01-01T00:00:00Z",
                "updated_at": "2024-01-01T00:00:00Z"
            }]
        }"#;

        let vault = VaultRecords::from_json(json.as_bytes()).unwrap();
        assert_eq!(vault.entries()[0].password.as_bytes(), b"hi");
        assert!(vault.entries()[0].backup_codes.is_empty());
    }

    #[test]
    fn test_unknown_schema_rejected() {
        let json = r#"{"schema_version": 2, "vault_id": "v", "entries": []}"#;
        assert!(matches!(
            VaultRecords::from_json(json.as_bytes()),
            Err(Error::InvalidInput(_))
        ));
    }

    proptest! {
        #[test]
        fn prop_entries_survive_serialization_in_order(
            secrets in proptest::collection::vec(proptest::collection::vec(any::<u8>(), 0..48), 1..12)
        ) {
            let mut vault = records();
            for (i, secret) in secrets.iter().enumerate() {
                let new = NewEntry::new(format!("entry-{}", i), secret.clone())
                    .backup_codes(vec![format!("code-{}", i)]);
                vault.add_entry(new).unwrap();
            }

            let restored = VaultRecords::from_json(&vault.to_json().unwrap()).unwrap();
            prop_assert_eq!(&restored, &vault);
            for (entry, secret) in restored.entries().iter().zip(&secrets) {
                prop_assert_eq!(entry.password.as_bytes(), secret.as_slice());
            }
        }
    }
}
