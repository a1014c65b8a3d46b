//! Persisted encrypted vault format.
//!
//! The envelope carries everything needed to unlock the vault given only
//! the passphrase: the KDF salt and parameters, the vault key wrapped under
//! the master key, and the record model encrypted under the vault key.
//! Field names are a compatibility contract shared with existing replicas
//! and remote records.

use chrono::{DateTime, SecondsFormat, SubsecRound, Utc};
use serde::{Deserialize, Serialize};
use tracing::debug;
use zeroize::Zeroizing;

use lockbox_common::{Error, Result, VaultId};
use lockbox_crypto::{
    decrypt, derive_master_key, encrypt, fingerprint, unwrap_key, wrap_key, KdfParams, Salt,
    SymmetricKey, VaultKey, CIPHER_ID, NONCE_SIZE,
};

use crate::model::VaultRecords;

/// Current envelope format version.
pub const ENVELOPE_SCHEMA_VERSION: u32 = 1;

/// Standard base64 for binary fields. An empty string decodes to no bytes.
mod b64 {
    use base64::{engine::general_purpose::STANDARD, Engine};
    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(bytes: &[u8], serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&STANDARD.encode(bytes))
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Vec<u8>, D::Error> {
        let encoded = Option::<String>::deserialize(deserializer)?.unwrap_or_default();
        STANDARD
            .decode(encoded.as_bytes())
            .map_err(serde::de::Error::custom)
    }
}

/// RFC 3339 with whole seconds, as existing replicas store it.
mod rfc3339 {
    use chrono::{DateTime, SecondsFormat, Utc};
    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(at: &DateTime<Utc>, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&at.to_rfc3339_opts(SecondsFormat::Secs, true))
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(
        deserializer: D,
    ) -> Result<DateTime<Utc>, D::Error> {
        let raw = String::deserialize(deserializer)?;
        DateTime::parse_from_rfc3339(&raw)
            .map(|at| at.with_timezone(&Utc))
            .map_err(serde::de::Error::custom)
    }
}

fn now() -> DateTime<Utc> {
    Utc::now().trunc_subsecs(0)
}

/// Encrypted vault as stored locally and remotely.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Envelope {
    pub schema_version: u32,
    pub vault_id: VaultId,
    /// Salt for master key derivation.
    #[serde(with = "b64")]
    pub salt_master: Vec<u8>,
    /// Vault key wrapped under the master key.
    #[serde(with = "b64")]
    pub enc_vault_key: Vec<u8>,
    /// Nonce of the wrapped vault key. Empty in legacy envelopes, which
    /// wrapped the key under the payload nonce.
    #[serde(with = "b64", default)]
    pub vault_key_nonce: Vec<u8>,
    pub kdf_params: KdfParams,
    pub cipher: String,
    /// Record model encrypted under the vault key.
    #[serde(with = "b64")]
    pub ciphertext: Vec<u8>,
    /// Nonce of the payload.
    #[serde(with = "b64")]
    pub nonce: Vec<u8>,
    #[serde(with = "rfc3339")]
    pub modified_at: DateTime<Utc>,
    /// Incremented by one on every persisted change.
    pub version: u64,
}

impl Envelope {
    /// Build a version 1 envelope around `records` under a fresh salt and vault key.
    ///
    /// # Postconditions
    /// - The vault key is random and returned for the caller's unlocked context
    /// - The wrapped key and payload have independent random nonces
    ///
    /// # Errors
    /// - `InvalidInput` for an empty passphrase or unusable KDF parameters
    pub fn create(
        passphrase: &[u8],
        kdf_params: KdfParams,
        records: &VaultRecords,
    ) -> Result<(Self, VaultKey)> {
        let salt = Salt::generate();
        let vault_key = VaultKey::generate();
        let master_key = derive_master_key(passphrase, &salt, &kdf_params)?;

        let wrapped = wrap_key(&master_key, &vault_key)?;
        let plaintext = Zeroizing::new(records.to_json()?);
        let payload = encrypt(vault_key.as_bytes(), &plaintext)?;

        let envelope = Self {
            schema_version: ENVELOPE_SCHEMA_VERSION,
            vault_id: records.vault_id.clone(),
            salt_master: salt.as_bytes().to_vec(),
            enc_vault_key: wrapped.ciphertext,
            vault_key_nonce: wrapped.nonce.to_vec(),
            kdf_params,
            cipher: CIPHER_ID.to_string(),
            ciphertext: payload.ciphertext,
            nonce: payload.nonce.to_vec(),
            modified_at: now(),
            version: 1,
        };

        debug!(vault_id = %envelope.vault_id, "Created envelope");
        Ok((envelope, vault_key))
    }

    /// Check the format tags before any key material is touched.
    ///
    /// # Errors
    /// - `InvalidInput` on an unknown schema version, cipher, KDF tag, or a
    ///   malformed salt or nonce
    pub fn validate(&self) -> Result<()> {
        if self.schema_version != ENVELOPE_SCHEMA_VERSION {
            return Err(Error::InvalidInput(format!(
                "Unsupported envelope schema version: {}",
                self.schema_version
            )));
        }
        if self.cipher != CIPHER_ID {
            return Err(Error::InvalidInput(format!(
                "Unsupported cipher: {}",
                self.cipher
            )));
        }
        self.kdf_params.validate()?;
        Salt::from_slice(&self.salt_master)?;
        if self.nonce.len() != NONCE_SIZE {
            return Err(Error::InvalidInput(format!(
                "Invalid payload nonce length: {}",
                self.nonce.len()
            )));
        }
        Ok(())
    }

    /// Nonce the vault key was wrapped under.
    ///
    /// Legacy envelopes have no dedicated field and reused the payload nonce.
    pub fn wrap_nonce(&self) -> &[u8] {
        if self.vault_key_nonce.is_empty() {
            &self.nonce
        } else {
            &self.vault_key_nonce
        }
    }

    /// Derive the master key from `passphrase` and unwrap the vault key.
    ///
    /// # Errors
    /// - `Authentication` for a wrong passphrase or a tampered wrapped key
    pub fn open_key(&self, passphrase: &[u8]) -> Result<VaultKey> {
        self.validate()?;
        let salt = Salt::from_slice(&self.salt_master)?;
        let master_key = derive_master_key(passphrase, &salt, &self.kdf_params)?;
        unwrap_key(&master_key, self.wrap_nonce(), &self.enc_vault_key)
    }

    /// Decrypt the record model with an already unwrapped vault key.
    ///
    /// # Errors
    /// - `Authentication` if the key does not open the payload
    /// - `Serialization`/`InvalidInput` if the plaintext is not a record model
    pub fn open_records(&self, vault_key: &VaultKey) -> Result<VaultRecords> {
        self.validate()?;
        let plaintext = decrypt(vault_key.as_bytes(), &self.nonce, &self.ciphertext)?;
        VaultRecords::from_json(&plaintext)
    }

    /// Successor envelope carrying `records` re-encrypted under the same
    /// vault key with a fresh nonce.
    pub fn reseal(&self, vault_key: &VaultKey, records: &VaultRecords) -> Result<Self> {
        let plaintext = Zeroizing::new(records.to_json()?);
        let payload = encrypt(vault_key.as_bytes(), &plaintext)?;
        let mut next = self.clone();
        next.ciphertext = payload.ciphertext;
        next.nonce = payload.nonce.to_vec();
        next.vault_key_nonce = self.wrap_nonce().to_vec();
        next.modified_at = now();
        next.version = self.version + 1;
        Ok(next)
    }

    /// Successor envelope with the same vault key wrapped under a master key
    /// derived from `new_passphrase` and a new salt. The payload is untouched.
    pub fn rewrap(
        &self,
        vault_key: &VaultKey,
        new_passphrase: &[u8],
        kdf_params: KdfParams,
    ) -> Result<Self> {
        let salt = Salt::generate();
        let master_key = derive_master_key(new_passphrase, &salt, &kdf_params)?;
        let wrapped = wrap_key(&master_key, vault_key)?;

        let mut next = self.clone();
        next.salt_master = salt.as_bytes().to_vec();
        next.enc_vault_key = wrapped.ciphertext;
        next.vault_key_nonce = wrapped.nonce.to_vec();
        next.kdf_params = kdf_params;
        next.modified_at = now();
        next.version = self.version + 1;
        Ok(next)
    }

    /// Label of the encrypted payload for logs and sync diagnostics.
    pub fn fingerprint(&self) -> String {
        fingerprint(&self.ciphertext)
    }

    /// Compact JSON serialization.
    pub fn to_bytes(&self) -> Result<Vec<u8>> {
        Ok(serde_json::to_vec(self)?)
    }

    /// Parse and validate a serialized envelope.
    ///
    /// # Errors
    /// - `Serialization` on malformed JSON
    /// - `InvalidInput` on unsupported format tags
    pub fn from_bytes(bytes: &[u8]) -> Result<Self> {
        let envelope: Self = serde_json::from_slice(bytes)?;
        envelope.validate()?;
        Ok(envelope)
    }

    /// `modified_at` in the stored textual form.
    pub fn modified_at_string(&self) -> String {
        self.modified_at.to_rfc3339_opts(SecondsFormat::Secs, true)
    }
}
