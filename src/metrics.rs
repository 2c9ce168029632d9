//! # Metrics
//!
//! Per-user operation counters and latency tracking for the crypto and
//! rotation paths. Latencies use an exponential moving average so a
//! single slow operation cannot dominate the report.
//!
//! The registry is shared by the vault and the rotation engine through
//! [`crate::context::CoreContext`]; reads return snapshots, never live
//! references.

use chrono::{DateTime, Utc};
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;

/// EMA smoothing factor for encryption latency
pub const ENCRYPTION_EMA_ALPHA: f64 = 0.1;

/// EMA smoothing factor for rotation duration
pub const ROTATION_EMA_ALPHA: f64 = 0.2;

/// Counters and averages for one user
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct UserMetrics {
    pub encryption_count: u64,
    pub decryption_count: u64,
    pub rotations_succeeded: u64,
    pub rotations_failed: u64,
    pub sessions_migrated: u64,
    pub checkpoints_migrated: u64,
    pub last_rotation_at: Option<DateTime<Utc>>,
    /// EMA, milliseconds, alpha = 0.1
    pub average_encryption_ms: Option<f64>,
    /// EMA, milliseconds, alpha = 0.2
    pub average_rotation_ms: Option<f64>,
}

fn ema(current: Option<f64>, sample: f64, alpha: f64) -> f64 {
    match current {
        Some(value) => alpha * sample + (1.0 - alpha) * value,
        None => sample,
    }
}

/// Thread-safe per-user metrics registry
#[derive(Default)]
pub struct MetricsRegistry {
    users: RwLock<HashMap<String, UserMetrics>>,
}

impl MetricsRegistry {
    pub fn new() -> Self {
        MetricsRegistry::default()
    }

    fn update(&self, user_id: &str, op: impl FnOnce(&mut UserMetrics)) {
        let mut users = self.users.write();
        op(users.entry(user_id.to_string()).or_default());
    }

    pub fn record_encryption(&self, user_id: &str, elapsed_ms: f64) {
        self.update(user_id, |m| {
            m.encryption_count += 1;
            m.average_encryption_ms = Some(ema(
                m.average_encryption_ms,
                elapsed_ms,
                ENCRYPTION_EMA_ALPHA,
            ));
        });
    }

    pub fn record_decryption(&self, user_id: &str) {
        self.update(user_id, |m| m.decryption_count += 1);
    }

    pub fn record_rotation(
        &self,
        user_id: &str,
        succeeded: bool,
        elapsed_ms: f64,
        sessions_migrated: u64,
        checkpoints_migrated: u64,
    ) {
        self.update(user_id, |m| {
            if succeeded {
                m.rotations_succeeded += 1;
            } else {
                m.rotations_failed += 1;
            }
            m.sessions_migrated += sessions_migrated;
            m.checkpoints_migrated += checkpoints_migrated;
            m.last_rotation_at = Some(Utc::now());
            m.average_rotation_ms =
                Some(ema(m.average_rotation_ms, elapsed_ms, ROTATION_EMA_ALPHA));
        });
    }

    /// Snapshot for one user; zeroed metrics when the user is unknown
    pub fn user_snapshot(&self, user_id: &str) -> UserMetrics {
        self.users.read().get(user_id).cloned().unwrap_or_default()
    }

    /// Snapshot of every tracked user
    pub fn all_users(&self) -> HashMap<String, UserMetrics> {
        self.users.read().clone()
    }
}

// ============================================================================
// TESTS
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_counters_accumulate() {
        let registry = MetricsRegistry::new();
        registry.record_encryption("u1", 5.0);
        registry.record_encryption("u1", 5.0);
        registry.record_decryption("u1");

        let snapshot = registry.user_snapshot("u1");
        assert_eq!(snapshot.encryption_count, 2);
        assert_eq!(snapshot.decryption_count, 1);
    }

    #[test]
    fn test_unknown_user_snapshot_is_zeroed() {
        let registry = MetricsRegistry::new();
        let snapshot = registry.user_snapshot("ghost");
        assert_eq!(snapshot.encryption_count, 0);
        assert!(snapshot.average_encryption_ms.is_none());
    }

    #[test]
    fn test_encryption_ema_alpha() {
        let registry = MetricsRegistry::new();
        registry.record_encryption("u1", 100.0);
        registry.record_encryption("u1", 200.0);

        let snapshot = registry.user_snapshot("u1");
        // First sample seeds the average, second blends with alpha 0.1
        let expected = 0.1 * 200.0 + 0.9 * 100.0;
        assert!((snapshot.average_encryption_ms.unwrap() - expected).abs() < 1e-9);
    }

    #[test]
    fn test_rotation_ema_alpha_and_counts() {
        let registry = MetricsRegistry::new();
        registry.record_rotation("u1", true, 1000.0, 3, 2);
        registry.record_rotation("u1", false, 2000.0, 0, 0);

        let snapshot = registry.user_snapshot("u1");
        assert_eq!(snapshot.rotations_succeeded, 1);
        assert_eq!(snapshot.rotations_failed, 1);
        assert_eq!(snapshot.sessions_migrated, 3);
        assert_eq!(snapshot.checkpoints_migrated, 2);
        assert!(snapshot.last_rotation_at.is_some());

        let expected = 0.2 * 2000.0 + 0.8 * 1000.0;
        assert!((snapshot.average_rotation_ms.unwrap() - expected).abs() < 1e-9);
    }

    #[test]
    fn test_users_are_isolated() {
        let registry = MetricsRegistry::new();
        registry.record_encryption("u1", 1.0);
        registry.record_encryption("u2", 1.0);

        assert_eq!(registry.user_snapshot("u1").encryption_count, 1);
        assert_eq!(registry.user_snapshot("u2").encryption_count, 1);
        assert_eq!(registry.all_users().len(), 2);
    }
}
