//! # Cryptographic Primitives
//!
//! **Authenticated at-rest encryption under password-derived keys**
//!
//! Everything persisted by this crate goes through the envelope produced
//! here: AES-256-GCM ciphertext under a key derived with
//! PBKDF2-HMAC-SHA256, or under a raw 256-bit key for the session-key
//! layer of the vault.
//!
//! ## Envelope format
//!
//! A persisted blob is the JSON record
//! `{algorithm, iv, salt?, ciphertext}` with base64 fields. The algorithm
//! name is stored inside the envelope so a future cipher migration can
//! dispatch on it. The salt is present only on the password path; raw-key
//! envelopes omit it.
//!
//! ## Security Model
//!
//! - Decryption failure does not distinguish a wrong password from a
//!   tampered ciphertext. Callers MUST treat [`CryptoError::DecryptionFailed`]
//!   as non-recoverable for that blob.
//! - The IV is 96 bits and freshly random per encrypt call; salts are
//!   random and at least 16 bytes.
//! - Derived keys live in [`Zeroizing`] buffers and are wiped when the
//!   scope ends, including on error paths.
//! - Passwords are NFC-normalized before derivation so the same password
//!   typed on different platforms derives the same key.

use aes_gcm::aead::Aead;
use aes_gcm::{Aes256Gcm, Key, KeyInit, Nonce};
use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine as _;
use rand::rngs::OsRng;
use rand::RngCore;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use subtle::ConstantTimeEq;
use thiserror::Error;
use unicode_normalization::UnicodeNormalization;
use uuid::Uuid;
use zeroize::Zeroizing;

// ============================================================================
// CONSTANTS
// ============================================================================

/// Cipher recorded in every envelope this crate writes
pub const CIPHER_ALGORITHM: &str = "AES-256-GCM";

/// Key derivation function recorded in every `UserKey`
pub const KDF_ALGORITHM: &str = "PBKDF2-HMAC-SHA256";

/// Default PBKDF2 iteration count
pub const DEFAULT_KDF_ITERATIONS: u32 = 210_000;

/// Hard floor for PBKDF2 iterations; derivation refuses anything below
pub const MIN_KDF_ITERATIONS: u32 = 100_000;

/// AES-256 key size in bytes
pub const KEY_LEN: usize = 32;

/// GCM nonce size in bytes (96 bits)
pub const IV_LEN: usize = 12;

/// Minimum salt size in bytes
pub const SALT_LEN: usize = 16;

// ============================================================================
// ERROR TYPES
// ============================================================================

#[derive(Debug, Error)]
pub enum CryptoError {
    /// AEAD tag mismatch. Wrong password and corrupt ciphertext are
    /// indistinguishable here by design.
    #[error("decryption failed: authentication tag mismatch")]
    DecryptionFailed,

    #[error("encryption failed")]
    EncryptionFailed,

    #[error("unsupported cipher algorithm in envelope: {0}")]
    UnsupportedAlgorithm(String),

    #[error("KDF iteration count {got} below enforced minimum {min}")]
    WeakIterations { got: u32, min: u32 },

    #[error("salt must be at least {SALT_LEN} bytes, got {0}")]
    SaltTooShort(usize),

    #[error("envelope parsing failed: {0}")]
    InvalidEnvelope(String),
}

pub type Result<T> = std::result::Result<T, CryptoError>;

// ============================================================================
// ENVELOPE
// ============================================================================

/// Persisted encrypted blob.
///
/// Field order is fixed by this struct, which keeps the serialized record
/// byte-stable across writes of the same content.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Envelope {
    /// Cipher name, e.g. `"AES-256-GCM"`
    pub algorithm: String,

    /// Base64 nonce, 12 bytes decoded
    pub iv: String,

    /// Base64 KDF salt; absent for raw-key envelopes
    #[serde(skip_serializing_if = "Option::is_none")]
    pub salt: Option<String>,

    /// Base64 ciphertext including the GCM tag
    pub ciphertext: String,
}

impl Envelope {
    /// Parse an envelope from its persisted JSON bytes
    pub fn from_bytes(bytes: &[u8]) -> Result<Self> {
        serde_json::from_slice(bytes).map_err(|e| CryptoError::InvalidEnvelope(e.to_string()))
    }

    /// Serialize to the persisted JSON record
    pub fn to_bytes(&self) -> Vec<u8> {
        // Flat struct of strings; serialization cannot fail
        serde_json::to_vec(self).unwrap_or_default()
    }

    fn decoded_iv(&self) -> Result<Vec<u8>> {
        let iv = BASE64
            .decode(&self.iv)
            .map_err(|e| CryptoError::InvalidEnvelope(format!("iv: {e}")))?;
        if iv.len() != IV_LEN {
            return Err(CryptoError::InvalidEnvelope(format!(
                "iv must be {IV_LEN} bytes, got {}",
                iv.len()
            )));
        }
        Ok(iv)
    }

    fn decoded_salt(&self) -> Result<Vec<u8>> {
        let salt = self
            .salt
            .as_ref()
            .ok_or_else(|| CryptoError::InvalidEnvelope("missing salt".to_string()))?;
        BASE64
            .decode(salt)
            .map_err(|e| CryptoError::InvalidEnvelope(format!("salt: {e}")))
    }

    fn decoded_ciphertext(&self) -> Result<Vec<u8>> {
        BASE64
            .decode(&self.ciphertext)
            .map_err(|e| CryptoError::InvalidEnvelope(format!("ciphertext: {e}")))
    }

    fn check_algorithm(&self) -> Result<()> {
        if self.algorithm != CIPHER_ALGORITHM {
            return Err(CryptoError::UnsupportedAlgorithm(self.algorithm.clone()));
        }
        Ok(())
    }
}

// ============================================================================
// KEY DERIVATION
// ============================================================================

/// Derive a 256-bit key from a password with PBKDF2-HMAC-SHA256.
///
/// The password is NFC-normalized first. The returned buffer zeroes itself
/// when dropped.
///
/// # Errors
/// - [`CryptoError::WeakIterations`] below [`MIN_KDF_ITERATIONS`]
/// - [`CryptoError::SaltTooShort`] below [`SALT_LEN`] bytes
pub fn derive_key(
    password: &str,
    salt: &[u8],
    iterations: u32,
) -> Result<Zeroizing<[u8; KEY_LEN]>> {
    if iterations < MIN_KDF_ITERATIONS {
        return Err(CryptoError::WeakIterations {
            got: iterations,
            min: MIN_KDF_ITERATIONS,
        });
    }
    if salt.len() < SALT_LEN {
        return Err(CryptoError::SaltTooShort(salt.len()));
    }

    let normalized: Zeroizing<String> = Zeroizing::new(password.nfc().collect());
    let mut key = Zeroizing::new([0u8; KEY_LEN]);
    pbkdf2::pbkdf2_hmac::<Sha256>(normalized.as_bytes(), salt, iterations, &mut key[..]);
    Ok(key)
}

// ============================================================================
// ENCRYPT / DECRYPT (password path)
// ============================================================================

/// Encrypt plaintext under a password-derived key.
///
/// A fresh random IV is always generated; the salt is generated when not
/// supplied. Two calls with identical inputs therefore produce different
/// envelopes.
pub fn encrypt(
    plaintext: &[u8],
    password: &str,
    salt: Option<&[u8]>,
    iterations: u32,
) -> Result<Envelope> {
    let owned_salt;
    let salt = match salt {
        Some(s) => s,
        None => {
            owned_salt = random_bytes(SALT_LEN);
            &owned_salt
        }
    };

    let key = derive_key(password, salt, iterations)?;
    let mut envelope = encrypt_with_key(plaintext, &key)?;
    envelope.salt = Some(BASE64.encode(salt));
    Ok(envelope)
}

/// Decrypt an envelope produced by [`encrypt`].
///
/// The iteration count must match the one used at encryption time; callers
/// keep it alongside the envelope (the vault stores it on the `UserKey`
/// row).
pub fn decrypt(envelope: &Envelope, password: &str, iterations: u32) -> Result<Zeroizing<Vec<u8>>> {
    envelope.check_algorithm()?;
    let salt = envelope.decoded_salt()?;
    let key = derive_key(password, &salt, iterations)?;
    decrypt_with_key(envelope, &key)
}

// ============================================================================
// ENCRYPT / DECRYPT (raw-key path)
// ============================================================================

/// Encrypt plaintext under a raw 256-bit key. Used by the vault once a
/// session key has been unwrapped.
pub fn encrypt_with_key(plaintext: &[u8], key: &[u8; KEY_LEN]) -> Result<Envelope> {
    let iv = random_bytes(IV_LEN);
    let cipher = Aes256Gcm::new(Key::<Aes256Gcm>::from_slice(key));
    let ciphertext = cipher
        .encrypt(Nonce::from_slice(&iv), plaintext)
        .map_err(|_| CryptoError::EncryptionFailed)?;

    Ok(Envelope {
        algorithm: CIPHER_ALGORITHM.to_string(),
        iv: BASE64.encode(&iv),
        salt: None,
        ciphertext: BASE64.encode(&ciphertext),
    })
}

/// Decrypt an envelope under a raw 256-bit key.
pub fn decrypt_with_key(envelope: &Envelope, key: &[u8; KEY_LEN]) -> Result<Zeroizing<Vec<u8>>> {
    envelope.check_algorithm()?;
    let iv = envelope.decoded_iv()?;
    let ciphertext = envelope.decoded_ciphertext()?;

    let cipher = Aes256Gcm::new(Key::<Aes256Gcm>::from_slice(key));
    let plaintext = cipher
        .decrypt(Nonce::from_slice(&iv), ciphertext.as_ref())
        .map_err(|_| CryptoError::DecryptionFailed)?;

    Ok(Zeroizing::new(plaintext))
}

// ============================================================================
// HASHING & RANDOMNESS
// ============================================================================

/// SHA-256 of `data` as lower-case hex
pub fn hash(data: &[u8]) -> String {
    let mut hasher = Sha256::new();
    hasher.update(data);
    hex::encode(hasher.finalize())
}

/// Constant-time comparison of `data` against an expected hex digest.
///
/// Malformed expected digests compare unequal rather than erroring.
pub fn verify_hash(data: &[u8], expected_hex: &str) -> bool {
    let expected = match hex::decode(expected_hex.to_ascii_lowercase()) {
        Ok(bytes) => bytes,
        Err(_) => return false,
    };
    let mut hasher = Sha256::new();
    hasher.update(data);
    let actual = hasher.finalize();
    if expected.len() != actual.len() {
        return false;
    }
    actual.ct_eq(expected.as_slice()).into()
}

/// `n` bytes from the OS CSPRNG
pub fn random_bytes(n: usize) -> Vec<u8> {
    let mut buf = vec![0u8; n];
    OsRng.fill_bytes(&mut buf);
    buf
}

/// Opaque globally-unique identifier, optionally prefixed: `"key_<uuid>"`
pub fn random_id(prefix: Option<&str>) -> String {
    let id = Uuid::new_v4();
    match prefix {
        Some(p) => format!("{p}_{id}"),
        None => id.to_string(),
    }
}

/// Generate a fresh random 256-bit session key
pub fn generate_session_key() -> Zeroizing<[u8; KEY_LEN]> {
    let mut key = Zeroizing::new([0u8; KEY_LEN]);
    OsRng.fill_bytes(&mut key[..]);
    key
}

// ============================================================================
// TESTS
// ============================================================================
