//! Cryptographic primitives for Lockbox.
//!
//! This module provides:
//! - Key derivation using Argon2id
//! - Authenticated encryption using XChaCha20-Poly1305
//! - Key wrapping for the envelope hierarchy (master → vault, device → session → vault)
//! - Secure key management with automatic zeroization
//!
//! # Security Guarantees
//! - All key material is automatically zeroized on drop
//! - No plaintext or key material is ever logged
//! - Constant-time operations for sensitive comparisons

pub mod aead;
pub mod digest;
pub mod kdf;
pub mod keys;

pub use aead::{decrypt, encrypt, unwrap_key, wrap_key, Sealed, CIPHER_ID, NONCE_SIZE};
pub use digest::fingerprint;
pub use kdf::{derive_master_key, KdfParams, ARGON2ID};
pub use keys::{
    constant_time_eq, DeviceSecret, MasterKey, Salt, SessionKey, SymmetricKey, VaultKey,
    KEY_LENGTH, SALT_LENGTH,
};
pub use zeroize::{Zeroize, Zeroizing};
