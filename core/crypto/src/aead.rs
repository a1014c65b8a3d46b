//! Authenticated encryption using XChaCha20-Poly1305.
//!
//! XChaCha20-Poly1305 provides both confidentiality and authenticity,
//! with a 24-byte nonce that is safe for random generation: nonces are
//! drawn independently per call and no counter is kept anywhere.

use chacha20poly1305::{
    aead::{generic_array::GenericArray, Aead, AeadCore, KeyInit, OsRng},
    XChaCha20Poly1305,
};
use zeroize::Zeroizing;

use crate::keys::{SymmetricKey, KEY_LENGTH};
use lockbox_common::{Error, Result};

/// Nonce size for XChaCha20-Poly1305 (24 bytes).
pub const NONCE_SIZE: usize = 24;

/// Authentication tag size (16 bytes).
pub const TAG_SIZE: usize = 16;

/// Cipher identifier recorded in envelopes.
pub const CIPHER_ID: &str = "xchacha20poly1305";

/// Ciphertext together with the nonce it was sealed under.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Sealed {
    /// Encrypted data followed by the Poly1305 tag.
    pub ciphertext: Vec<u8>,
    /// Random nonce used for this ciphertext.
    pub nonce: [u8; NONCE_SIZE],
}

fn cipher_for(key: &[u8]) -> Result<XChaCha20Poly1305> {
    if key.len() != KEY_LENGTH {
        return Err(Error::InvalidInput(format!(
            "Invalid key length: expected {}, got {}",
            KEY_LENGTH,
            key.len()
        )));
    }
    Ok(XChaCha20Poly1305::new(GenericArray::from_slice(key)))
}

/// Encrypt plaintext using XChaCha20-Poly1305 under a fresh random nonce.
///
/// # Preconditions
/// - `key` must be exactly KEY_LENGTH bytes
///
/// # Postconditions
/// - `ciphertext.len() == plaintext.len() + TAG_SIZE`
/// - The nonce is freshly drawn from the OS CSPRNG
///
/// # Errors
/// - Returns error if key length is incorrect
pub fn encrypt(key: &[u8], plaintext: &[u8]) -> Result<Sealed> {
    let cipher = cipher_for(key)?;
    let nonce = XChaCha20Poly1305::generate_nonce(&mut OsRng);

    let ciphertext = cipher
        .encrypt(&nonce, plaintext)
        .map_err(|e| Error::Crypto(format!("Encryption failed: {}", e)))?;

    let mut nonce_bytes = [0u8; NONCE_SIZE];
    nonce_bytes.copy_from_slice(&nonce);

    Ok(Sealed {
        ciphertext,
        nonce: nonce_bytes,
    })
}

/// Decrypt ciphertext using XChaCha20-Poly1305.
///
/// # Errors
/// - `InvalidInput` if the key or nonce has the wrong length
/// - `Authentication` on any tag mismatch; a wrong key and tampered data
///   are not distinguished
pub fn decrypt(key: &[u8], nonce: &[u8], ciphertext: &[u8]) -> Result<Zeroizing<Vec<u8>>> {
    let cipher = cipher_for(key)?;

    if nonce.len() != NONCE_SIZE {
        return Err(Error::InvalidInput(format!(
            "Invalid nonce length: expected {}, got {}",
            NONCE_SIZE,
            nonce.len()
        )));
    }

    if ciphertext.len() < TAG_SIZE {
        return Err(Error::Authentication);
    }

    cipher
        .decrypt(GenericArray::from_slice(nonce), ciphertext)
        .map(Zeroizing::new)
        .map_err(|_| Error::Authentication)
}

/// Encrypt one key under another.
pub fn wrap_key<W: SymmetricKey, K: SymmetricKey>(wrapping: &W, key: &K) -> Result<Sealed> {
    encrypt(wrapping.as_bytes(), key.as_bytes())
}

/// Recover a key wrapped by [`wrap_key`].
///
/// A payload that authenticates but is not a full key is treated as an
/// authentication failure.
pub fn unwrap_key<W: SymmetricKey, K: SymmetricKey>(
    wrapping: &W,
    nonce: &[u8],
    wrapped: &[u8],
) -> Result<K> {
    let plaintext = decrypt(wrapping.as_bytes(), nonce, wrapped)?;
    if plaintext.len() != KEY_LENGTH {
        return Err(Error::Authentication);
    }
    K::from_slice(&plaintext)
}
