//! # Key Vault
//!
//! User-scoped encryption identities with the two-layer wrap discipline:
//! a password never encrypts workspace data directly. Creating a key
//! generates a random 256-bit **session key**; the session key is wrapped
//! under a **master key** derived from the password and the stored salt.
//! Only the wrapped form is persisted — proving a password means
//! unwrapping the session key, and every data operation goes through the
//! unwrapped session key in a request-scoped, self-zeroing buffer.
//!
//! ## Lifecycle
//!
//! Keys are created after a password-policy check, mutated only by
//! "record last use", "deactivate", and "rotate", and hard-deleted only by
//! the cleanup pass once the grace period has passed and no live session
//! or checkpoint references them.
//!
//! Validation aggregates findings: a caller always sees the complete list
//! of errors and warnings for a key, not just the first.

use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::BTreeMap;
use std::time::Instant;
use thiserror::Error;
use tracing::{debug, info, warn};
use zeroize::Zeroizing;

use crate::context::CoreContext;
use crate::crypto::{self, CryptoError, Envelope, KEY_LEN};
use crate::password::{self, PasswordError, Strength};
use crate::store::{
    CheckpointFilter, SessionFilter, StoreError, UserKey, UserKeyPatch,
};

// ============================================================================
// CONSTANTS
// ============================================================================

/// Window before expiry in which validation warns
const NEAR_EXPIRY_DAYS: i64 = 7;

/// Key age at which the security audit starts penalizing
const AUDIT_OLD_KEY_DAYS: i64 = 60;

/// Active-key count above which the audit penalizes
const AUDIT_ACTIVE_KEY_SOFT_CAP: usize = 5;

// ============================================================================
// ERROR TYPES
// ============================================================================

#[derive(Debug, Error)]
pub enum KeyVaultError {
    #[error(transparent)]
    Policy(#[from] PasswordError),

    #[error(transparent)]
    Crypto(#[from] CryptoError),

    #[error(transparent)]
    Store(#[from] StoreError),

    #[error("key name already in use: {0}")]
    DuplicateKeyName(String),

    #[error("active key limit reached ({0})")]
    KeyLimitExceeded(usize),

    #[error("key not found: {0}")]
    KeyNotFound(String),

    #[error("key is deactivated: {0}")]
    KeyInactive(String),

    #[error("key is only {age_days} days old; rotation requires {min_days} (use force to override)")]
    RotationTooSoon { age_days: i64, min_days: i64 },
}

pub type Result<T> = std::result::Result<T, KeyVaultError>;

// ============================================================================
// REPORT TYPES
// ============================================================================

/// Outcome of proving a password against a key
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct KeyValidation {
    pub is_valid: bool,
    pub is_expired: bool,
    /// Expires within the next 7 days
    pub is_near_expiry: bool,
    pub strength: Strength,
    pub warnings: Vec<String>,
    pub errors: Vec<String>,
}

/// Options for [`KeyVault::rotate_user_key`]
#[derive(Debug, Clone, Default)]
pub struct RotateOptions {
    /// Skip the minimum-age check
    pub force: bool,
    /// Leave the old key active so existing data stays readable
    pub preserve_old_key: bool,
    pub rotation_reason: Option<String>,
}

/// Ids produced by a rotation, consumed by the re-encryption pass
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RotationOutcome {
    pub old_key_id: String,
    pub new_key_id: String,
}

/// Security audit over one user's keys
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SecurityAuditReport {
    pub score: u8,
    pub active_keys: usize,
    pub expired_keys: usize,
    pub issues: Vec<String>,
    pub metrics: crate::metrics::UserMetrics,
}

/// Result of an expired-key cleanup pass
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct CleanupReport {
    pub deleted: Vec<String>,
    /// Keys past expiry but still referenced by live data
    pub preserved: Vec<String>,
}

// ============================================================================
// KEY VAULT
// ============================================================================

pub struct KeyVault {
    context: CoreContext,
}

impl KeyVault {
    pub fn new(context: CoreContext) -> Self {
        KeyVault { context }
    }

    // ------------------------------------------------------------------
    // Creation
    // ------------------------------------------------------------------

    /// Create a new encryption identity for `user_id`.
    ///
    /// Runs the password policy, enforces name uniqueness among the
    /// user's active keys and the active-key cap, then wraps a fresh
    /// session key under the password-derived master key.
    ///
    /// The returned record is exactly what was persisted; it never
    /// contains unwrapped key material.
    pub fn create_user_key(
        &self,
        user_id: &str,
        key_name: &str,
        password: &str,
        description: Option<String>,
        expires_at: Option<DateTime<Utc>>,
        metadata: Option<BTreeMap<String, Value>>,
    ) -> Result<UserKey> {
        password::validate_policy(password, &self.context.config.password_policy)?;

        let active = self.context.store.list_user_keys(user_id, false)?;
        if active.iter().any(|k| k.key_name == key_name) {
            return Err(KeyVaultError::DuplicateKeyName(key_name.to_string()));
        }
        if active.len() >= self.context.config.max_active_keys_per_user {
            return Err(KeyVaultError::KeyLimitExceeded(
                self.context.config.max_active_keys_per_user,
            ));
        }

        let now = Utc::now();
        let expires_at = expires_at
            .unwrap_or_else(|| now + Duration::days(self.context.config.rotation_interval_days));

        let iterations = self.context.config.kdf_iterations;
        let salt = crypto::random_bytes(crypto::SALT_LEN);
        let session_key = crypto::generate_session_key();
        let wrapped = crypto::encrypt(&session_key[..], password, Some(&salt), iterations)?;

        let key = UserKey {
            user_id: user_id.to_string(),
            key_id: crypto::random_id(Some("key")),
            key_name: key_name.to_string(),
            description,
            salt: wrapped.salt.clone().unwrap_or_default(),
            wrapped_session_key: wrapped,
            kdf_algorithm: crypto::KDF_ALGORITHM.to_string(),
            kdf_iterations: iterations,
            cipher_algorithm: crypto::CIPHER_ALGORITHM.to_string(),
            is_active: true,
            created_at: now,
            last_used_at: None,
            expires_at,
            deactivated_at: None,
            deactivation_reason: None,
            previous_key_id: None,
            rotation_reason: None,
            metadata: metadata.unwrap_or_default(),
        };

        self.context.store.put_user_key(key.clone())?;
        info!(user_id, key_id = %key.key_id, "created user key");
        Ok(key)
    }

    // ------------------------------------------------------------------
    // Validation
    // ------------------------------------------------------------------

    /// Prove `password` against a key and report everything found.
    ///
    /// Findings are aggregated: an expired key with a wrong password
    /// reports both. `last_used_at` is updated only when the password
    /// actually unwraps the session key.
    pub fn validate_user_key(
        &self,
        user_id: &str,
        key_id: &str,
        password: &str,
    ) -> Result<KeyValidation> {
        let key = self.load_key(user_id, key_id)?;
        let now = Utc::now();

        let mut warnings = Vec::new();
        let mut errors = Vec::new();

        let is_expired = key.is_expired(now);
        if is_expired {
            errors.push("key has expired".to_string());
        }
        let remaining = key.expires_at.signed_duration_since(now);
        let is_near_expiry =
            !is_expired && remaining <= Duration::days(NEAR_EXPIRY_DAYS);
        if is_near_expiry {
            warnings.push(format!(
                "key expires in {} day(s)",
                remaining.num_days().max(0)
            ));
        }
        if !key.is_active {
            errors.push("key is deactivated".to_string());
        }
        if key.kdf_iterations < self.context.config.kdf_iterations {
            warnings.push(format!(
                "key derives with {} iterations, below the configured {}",
                key.kdf_iterations, self.context.config.kdf_iterations
            ));
        }

        let is_valid = match self.unwrap_session_key(&key, password) {
            Ok(_) => true,
            Err(KeyVaultError::Crypto(CryptoError::DecryptionFailed)) => {
                errors.push("password does not unwrap the session key".to_string());
                false
            }
            Err(other) => return Err(other),
        };

        if is_valid {
            self.context.store.update_user_key(
                key_id,
                UserKeyPatch {
                    last_used_at: Some(now),
                    ..UserKeyPatch::default()
                },
            )?;
        }

        Ok(KeyValidation {
            is_valid,
            is_expired,
            is_near_expiry,
            strength: password::analyze(password).strength,
            warnings,
            errors,
        })
    }

    // ------------------------------------------------------------------
    // Data operations
    // ------------------------------------------------------------------

    /// Encrypt `plaintext` under the key's session key.
    pub fn encrypt_with_user_key(
        &self,
        user_id: &str,
        key_id: &str,
        password: &str,
        plaintext: &[u8],
    ) -> Result<Envelope> {
        let started = Instant::now();
        let key = self.load_active_key(user_id, key_id)?;
        let session_key = self.unwrap_session_key(&key, password)?;
        let envelope = crypto::encrypt_with_key(plaintext, &session_key)?;

        self.touch(key_id)?;
        self.context
            .metrics
            .record_encryption(user_id, started.elapsed().as_secs_f64() * 1000.0);
        Ok(envelope)
    }

    /// Decrypt an envelope under the key's session key.
    ///
    /// A wrong password and a corrupted ciphertext both surface as
    /// [`CryptoError::DecryptionFailed`]; the vault does not tell them
    /// apart.
    pub fn decrypt_with_user_key(
        &self,
        user_id: &str,
        key_id: &str,
        password: &str,
        envelope: &Envelope,
    ) -> Result<Zeroizing<Vec<u8>>> {
        let key = self.load_key(user_id, key_id)?;
        let session_key = self.unwrap_session_key(&key, password)?;
        let plaintext = crypto::decrypt_with_key(envelope, &session_key)?;

        self.touch(key_id)?;
        self.context.metrics.record_decryption(user_id);
        Ok(plaintext)
    }

    // ------------------------------------------------------------------
    // Rotation & deactivation
    // ------------------------------------------------------------------

    /// Replace a key with a fresh one named `"<old_name> (rotated)"`.
    ///
    /// The new key carries a brand-new session key wrapped under
    /// `new_password`; re-encrypting dependent rows is the rotation
    /// engine's job. The old key is deactivated unless
    /// `preserve_old_key` is set.
    pub fn rotate_user_key(
        &self,
        user_id: &str,
        old_key_id: &str,
        new_password: &str,
        options: &RotateOptions,
    ) -> Result<RotationOutcome> {
        let old_key = self.load_key(user_id, old_key_id)?;
        let now = Utc::now();

        let age_days = old_key.age_days(now);
        let min_days = self.context.config.min_rotation_age_days;
        if !options.force && age_days < min_days {
            return Err(KeyVaultError::RotationTooSoon { age_days, min_days });
        }

        let rotated_name = format!("{} (rotated)", old_key.key_name);
        let new_key = self.create_user_key(
            user_id,
            &rotated_name,
            new_password,
            old_key.description.clone(),
            None,
            None,
        )?;

        // Stamp provenance on the new key
        let mut provenance = BTreeMap::new();
        provenance.insert(
            "previous_key_id".to_string(),
            Value::String(old_key_id.to_string()),
        );
        if let Some(reason) = &options.rotation_reason {
            provenance.insert("rotation_reason".to_string(), Value::String(reason.clone()));
        }
        self.context.store.update_user_key(
            &new_key.key_id,
            UserKeyPatch {
                previous_key_id: Some(old_key_id.to_string()),
                rotation_reason: options.rotation_reason.clone(),
                metadata: Some(provenance),
                ..UserKeyPatch::default()
            },
        )?;

        if !options.preserve_old_key {
            self.deactivate_key(user_id, old_key_id, "rotated")?;
        }

        info!(
            user_id,
            old_key_id,
            new_key_id = %new_key.key_id,
            preserve_old = options.preserve_old_key,
            "rotated user key"
        );
        Ok(RotationOutcome {
            old_key_id: old_key_id.to_string(),
            new_key_id: new_key.key_id,
        })
    }

    /// Deactivate a key. Deactivated keys still decrypt (their wrapped
    /// session key remains) but refuse new encryptions.
    pub fn deactivate_key(&self, user_id: &str, key_id: &str, reason: &str) -> Result<UserKey> {
        // Ownership check before mutating
        self.load_key(user_id, key_id)?;
        let updated = self.context.store.update_user_key(
            key_id,
            UserKeyPatch {
                is_active: Some(false),
                deactivated_at: Some(Some(Utc::now())),
                deactivation_reason: Some(Some(reason.to_string())),
                ..UserKeyPatch::default()
            },
        )?;
        debug!(user_id, key_id, reason, "deactivated user key");
        Ok(updated)
    }

    /// All keys belonging to `user_id`, active only unless asked.
    pub fn list_user_keys(&self, user_id: &str, include_inactive: bool) -> Result<Vec<UserKey>> {
        Ok(self.context.store.list_user_keys(user_id, include_inactive)?)
    }

    // ------------------------------------------------------------------
    // Audit & cleanup
    // ------------------------------------------------------------------

    /// Score a user's key hygiene from 0 (bad) to 100 (clean).
    ///
    /// Penalties: expired key -20 each, weak-iteration key -15 each, key
    /// older than 60 days -10 each, more than 5 active keys -10.
    pub fn security_audit(&self, user_id: &str) -> Result<SecurityAuditReport> {
        let keys = self.context.store.list_user_keys(user_id, true)?;
        let now = Utc::now();

        let mut score: i32 = 100;
        let mut issues = Vec::new();
        let mut expired_keys = 0;

        for key in &keys {
            if key.is_expired(now) {
                expired_keys += 1;
                score -= 20;
                issues.push(format!("key '{}' has expired", key.key_name));
            }
            if key.kdf_iterations < self.context.config.kdf_iterations {
                score -= 15;
                issues.push(format!(
                    "key '{}' uses a weak iteration count ({})",
                    key.key_name, key.kdf_iterations
                ));
            }
            if key.age_days(now) > AUDIT_OLD_KEY_DAYS {
                score -= 10;
                issues.push(format!(
                    "key '{}' is {} days old; consider rotating",
                    key.key_name,
                    key.age_days(now)
                ));
            }
        }

        let active_keys = keys.iter().filter(|k| k.is_active).count();
        if active_keys > AUDIT_ACTIVE_KEY_SOFT_CAP {
            score -= 10;
            issues.push(format!(
                "{active_keys} active keys; fewer than {AUDIT_ACTIVE_KEY_SOFT_CAP} is easier to manage"
            ));
        }

        Ok(SecurityAuditReport {
            score: score.clamp(0, 100) as u8,
            active_keys,
            expired_keys,
            issues,
            metrics: self.context.metrics.user_snapshot(user_id),
        })
    }

    /// Hard-delete keys whose expiry plus grace period has passed and
    /// that no live session or checkpoint still references. Referenced
    /// keys are marked preserved instead.
    pub fn cleanup_expired(&self, user_id: &str, grace_days: i64) -> Result<CleanupReport> {
        let keys = self.context.store.list_user_keys(user_id, true)?;
        let now = Utc::now();
        let mut report = CleanupReport::default();

        for key in keys {
            if key.expires_at + Duration::days(grace_days) >= now {
                continue;
            }

            let session_refs = self.context.store.count_sessions(&SessionFilter {
                key_ref: Some(key.key_id.clone()),
                ..SessionFilter::default()
            })?;
            let checkpoint_refs = self.context.store.count_checkpoints(&CheckpointFilter {
                key_ref: Some(key.key_id.clone()),
                ..CheckpointFilter::default()
            })?;

            if session_refs == 0 && checkpoint_refs == 0 {
                self.context.store.delete_user_key(&key.key_id)?;
                info!(user_id, key_id = %key.key_id, "deleted expired key");
                report.deleted.push(key.key_id);
            } else {
                let mut annotations = BTreeMap::new();
                annotations.insert(
                    "preserved_reason".to_string(),
                    Value::String(format!(
                        "referenced by {session_refs} session(s) and {checkpoint_refs} checkpoint(s)"
                    )),
                );
                annotations.insert(
                    "preserve_extended_at".to_string(),
                    Value::String(now.to_rfc3339()),
                );
                self.context.store.update_user_key(
                    &key.key_id,
                    UserKeyPatch {
                        metadata: Some(annotations),
                        ..UserKeyPatch::default()
                    },
                )?;
                warn!(user_id, key_id = %key.key_id, "expired key still referenced; preserved");
                report.preserved.push(key.key_id);
            }
        }

        Ok(report)
    }

    /// Unwrap a key's session key for a bulk operation (codec
    /// encryption, recovery, rotation). The buffer zeroes itself on
    /// drop; callers must not copy it out of request scope.
    pub fn session_key(
        &self,
        user_id: &str,
        key_id: &str,
        password: &str,
    ) -> Result<Zeroizing<[u8; KEY_LEN]>> {
        let key = self.load_key(user_id, key_id)?;
        self.unwrap_session_key(&key, password)
    }

    // ------------------------------------------------------------------
    // Internals
    // ------------------------------------------------------------------

    fn load_key(&self, user_id: &str, key_id: &str) -> Result<UserKey> {
        self.context
            .store
            .get_user_key(user_id, key_id)?
            .ok_or_else(|| KeyVaultError::KeyNotFound(key_id.to_string()))
    }

    fn load_active_key(&self, user_id: &str, key_id: &str) -> Result<UserKey> {
        let key = self.load_key(user_id, key_id)?;
        if !key.is_active {
            return Err(KeyVaultError::KeyInactive(key_id.to_string()));
        }
        Ok(key)
    }

    /// Unwrap the session key with the password-derived master key.
    /// The result zeroes itself on drop.
    fn unwrap_session_key(
        &self,
        key: &UserKey,
        password: &str,
    ) -> Result<Zeroizing<[u8; KEY_LEN]>> {
        let unwrapped =
            crypto::decrypt(&key.wrapped_session_key, password, key.kdf_iterations)?;
        if unwrapped.len() != KEY_LEN {
            return Err(KeyVaultError::Crypto(CryptoError::DecryptionFailed));
        }
        let mut session_key = Zeroizing::new([0u8; KEY_LEN]);
        session_key.copy_from_slice(&unwrapped);
        Ok(session_key)
    }

    fn touch(&self, key_id: &str) -> Result<()> {
        self.context.store.update_user_key(
            key_id,
            UserKeyPatch {
                last_used_at: Some(Utc::now()),
                ..UserKeyPatch::default()
            },
        )?;
        Ok(())
    }
}

// ============================================================================
// TESTS
// ============================================================================
