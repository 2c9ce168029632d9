//! # Core Configuration
//!
//! Every tunable the core reads, in one explicit struct. Components take
//! the configuration through [`crate::context::CoreContext`]; nothing
//! reads environment state or globals.

use serde::{Deserialize, Serialize};

use crate::crypto::DEFAULT_KDF_ITERATIONS;
use crate::password::PasswordPolicy;

/// Crate-wide configuration with the documented defaults.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CoreConfig {
    /// PBKDF2 iteration count for new keys (minimum 100_000 enforced by
    /// the crypto layer)
    pub kdf_iterations: u32,

    /// Serialized-state size cap before compression (50 MiB)
    pub max_session_size_bytes: usize,

    /// Active-key cap per user
    pub max_active_keys_per_user: usize,

    pub rotation_interval_days: i64,
    pub warning_days_before: i64,
    pub max_key_age_days: i64,
    pub grace_period_days: i64,
    pub auto_rotate_enabled: bool,

    /// Minimum key age before a non-forced rotation is allowed
    pub min_rotation_age_days: i64,

    pub compression_enabled: bool,
    pub encryption_enabled: bool,

    pub password_policy: PasswordPolicy,

    /// Sync engine drain cadence
    pub sync_drain_interval_ms: u64,
    /// Subscriptions idle longer than this are garbage-collected
    pub subscription_inactive_timeout_minutes: i64,
}

impl Default for CoreConfig {
    fn default() -> Self {
        CoreConfig {
            kdf_iterations: DEFAULT_KDF_ITERATIONS,
            max_session_size_bytes: 52_428_800,
            max_active_keys_per_user: 10,
            rotation_interval_days: 90,
            warning_days_before: 7,
            max_key_age_days: 180,
            grace_period_days: 14,
            auto_rotate_enabled: false,
            min_rotation_age_days: 1,
            compression_enabled: true,
            encryption_enabled: true,
            password_policy: PasswordPolicy::default(),
            sync_drain_interval_ms: 100,
            subscription_inactive_timeout_minutes: 30,
        }
    }
}
