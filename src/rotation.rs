//! # Rotation Engine
//!
//! Policy evaluation and orchestrated re-encryption when a user rotates a
//! key. Rotation itself only re-wraps: the vault mints a new key with a
//! fresh session key, and this engine walks every session and checkpoint
//! wrapped under the old key, decrypting with the old session key and
//! re-encrypting under the new one, row by row.
//!
//! Each row update stands alone — a failure is appended to the task's
//! error list and the walk continues, leaving every row either fully
//! migrated or untouched under the old key. When the walk finishes
//! cleanly — or the rotation was forced — the old key is deactivated
//! unless the caller preserves it; an unforced walk that accumulated
//! errors leaves the old key active so unmigrated rows stay readable.
//!
//! Tasks are observable while they run: progress counters live behind a
//! shared registry, so `get_task_status` sees live numbers from another
//! thread. Only pending tasks can be cancelled.

use chrono::{DateTime, Utc};
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Instant;
use thiserror::Error;
use tracing::{debug, info, warn};

use crate::config::CoreConfig;
use crate::context::CoreContext;
use crate::crypto::Envelope;
use crate::key_vault::{KeyVault, KeyVaultError, RotateOptions};
use crate::store::{
    CheckpointFilter, SessionFilter, SessionPatch, StoreError, UserKey,
};

// ============================================================================
// ERROR TYPES
// ============================================================================

#[derive(Debug, Error)]
pub enum RotationError {
    #[error("current password failed validation for key {0}")]
    InvalidPassword(String),

    #[error("rotation task not found: {0}")]
    TaskNotFound(String),

    #[error("task {id} is {state:?}; only pending tasks can be cancelled")]
    TaskNotCancellable { id: String, state: TaskState },

    #[error("task {id} is {state:?}; only pending tasks can be run")]
    TaskNotRunnable { id: String, state: TaskState },

    #[error(transparent)]
    Vault(#[from] KeyVaultError),

    #[error(transparent)]
    Store(#[from] StoreError),
}

pub type Result<T> = std::result::Result<T, RotationError>;

// ============================================================================
// POLICY
// ============================================================================

/// Rotation policy knobs; defaults follow the crate configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RotationPolicy {
    pub rotation_interval_days: i64,
    pub warning_days_before: i64,
    pub max_key_age_days: i64,
    pub grace_period_days: i64,
    pub auto_rotate_enabled: bool,
    pub notify_before_rotation: bool,
}

impl Default for RotationPolicy {
    fn default() -> Self {
        RotationPolicy {
            rotation_interval_days: 90,
            warning_days_before: 7,
            max_key_age_days: 180,
            grace_period_days: 14,
            auto_rotate_enabled: false,
            notify_before_rotation: true,
        }
    }
}

impl RotationPolicy {
    pub fn from_config(config: &CoreConfig) -> Self {
        RotationPolicy {
            rotation_interval_days: config.rotation_interval_days,
            warning_days_before: config.warning_days_before,
            max_key_age_days: config.max_key_age_days,
            grace_period_days: config.grace_period_days,
            auto_rotate_enabled: config.auto_rotate_enabled,
            notify_before_rotation: true,
        }
    }
}

/// Keys bucketed by how urgently they need attention.
///
/// The buckets are independent predicates, not a priority ladder: a key
/// appears in every bucket whose condition it satisfies, so a key that
/// is both expiring soon and past the maximum age shows up in both
/// lists.
#[derive(Debug, Clone)]
pub struct RotationCheck {
    /// `expires_at` already passed
    pub expired: Vec<UserKey>,
    /// Expires within the warning window
    pub expiring_soon: Vec<UserKey>,
    /// Older than the policy's maximum key age
    pub needs_rotation: Vec<UserKey>,
    pub policy: RotationPolicy,
}

// ============================================================================
// TASKS
// ============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TaskState {
    Pending,
    Running,
    Completed,
    Failed,
    Cancelled,
}

#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize)]
pub struct TaskProgress {
    pub sessions_total: u64,
    pub sessions_done: u64,
    pub checkpoints_total: u64,
    pub checkpoints_done: u64,
}

/// Tracked state of one rotation's re-encryption pass
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RotationTask {
    pub id: String,
    pub user_id: String,
    pub old_key_id: String,
    pub new_key_id: String,
    pub state: TaskState,
    pub progress: TaskProgress,
    pub scheduled_at: DateTime<Utc>,
    pub started_at: Option<DateTime<Utc>>,
    pub completed_at: Option<DateTime<Utc>>,
    pub errors: Vec<String>,
    /// Deactivate the old key once migration finishes
    pub deactivate_old_key: bool,
    /// Forced rotation: deactivation happens even when the walk
    /// accumulated row errors
    pub force: bool,
}

/// Everything needed to start a rotation
#[derive(Clone)]
pub struct RotationRequest {
    pub user_id: String,
    pub key_id: String,
    pub new_password: String,
    pub force: bool,
    pub preserve_old_key: bool,
    /// Walk dependent rows and re-encrypt them under the new key
    pub re_encrypt_data: bool,
    pub reason: Option<String>,
}

impl std::fmt::Debug for RotationRequest {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RotationRequest")
            .field("user_id", &self.user_id)
            .field("key_id", &self.key_id)
            .field("new_password", &"<redacted>")
            .field("force", &self.force)
            .field("preserve_old_key", &self.preserve_old_key)
            .field("re_encrypt_data", &self.re_encrypt_data)
            .field("reason", &self.reason)
            .finish()
    }
}

// ============================================================================
// ROTATION ENGINE
// ============================================================================

pub struct RotationEngine {
    context: CoreContext,
    vault: KeyVault,
    tasks: Arc<RwLock<HashMap<String, RotationTask>>>,
}

impl RotationEngine {
    pub fn new(context: CoreContext) -> Self {
        let vault = KeyVault::new(context.clone());
        RotationEngine {
            context,
            vault,
            tasks: Arc::new(RwLock::new(HashMap::new())),
        }
    }

    // ------------------------------------------------------------------
    // Policy evaluation
    // ------------------------------------------------------------------

    /// Bucket a user's active keys by rotation urgency.
    pub fn check_keys_needing_rotation(
        &self,
        user_id: &str,
        policy: Option<RotationPolicy>,
    ) -> Result<RotationCheck> {
        let policy = policy.unwrap_or_else(|| RotationPolicy::from_config(&self.context.config));
        let keys = self.context.store.list_user_keys(user_id, false)?;
        let now = Utc::now();

        let mut check = RotationCheck {
            expired: Vec::new(),
            expiring_soon: Vec::new(),
            needs_rotation: Vec::new(),
            policy: policy.clone(),
        };

        let warning_window = now + chrono::Duration::days(policy.warning_days_before);
        for key in keys {
            // Independent predicates: one key can land in several buckets
            if key.expires_at < now {
                check.expired.push(key.clone());
            }
            if key.expires_at >= now && key.expires_at <= warning_window {
                check.expiring_soon.push(key.clone());
            }
            if key.age_days(now) > policy.max_key_age_days {
                check.needs_rotation.push(key.clone());
            }
        }

        Ok(check)
    }

    // ------------------------------------------------------------------
    // Task lifecycle
    // ------------------------------------------------------------------

    /// Validate the current password, mint the replacement key, and
    /// register a pending migration task.
    ///
    /// The returned snapshot carries the task id to pass to
    /// [`RotationEngine::run_task`]; the caller decides which thread
    /// drives the migration.
    pub fn initiate_rotation(
        &self,
        request: &RotationRequest,
        current_password: &str,
    ) -> Result<RotationTask> {
        // Fail fast before touching anything
        let validation =
            self.vault
                .validate_user_key(&request.user_id, &request.key_id, current_password)?;
        if !validation.is_valid {
            return Err(RotationError::InvalidPassword(request.key_id.clone()));
        }

        // The old key must stay usable while rows migrate; deactivation
        // happens at task completion
        let outcome = self.vault.rotate_user_key(
            &request.user_id,
            &request.key_id,
            &request.new_password,
            &RotateOptions {
                force: request.force,
                preserve_old_key: true,
                rotation_reason: request.reason.clone(),
            },
        )?;

        let task = RotationTask {
            id: crate::crypto::random_id(Some("rot")),
            user_id: request.user_id.clone(),
            old_key_id: outcome.old_key_id,
            new_key_id: outcome.new_key_id,
            state: TaskState::Pending,
            progress: TaskProgress::default(),
            scheduled_at: Utc::now(),
            started_at: None,
            completed_at: None,
            errors: Vec::new(),
            deactivate_old_key: !request.preserve_old_key,
            force: request.force,
        };
        self.tasks.write().insert(task.id.clone(), task.clone());

        info!(
            user_id = %request.user_id,
            task_id = %task.id,
            re_encrypt = request.re_encrypt_data,
            "rotation initiated"
        );

        // Without a data walk the task completes immediately
        if !request.re_encrypt_data {
            self.finish_task(&task.id, Instant::now(), 0, 0)?;
            return self
                .get_task_status(&task.id)
                .ok_or_else(|| RotationError::TaskNotFound(task.id.clone()));
        }

        Ok(task)
    }

    /// Drive a pending task's re-encryption pass to completion.
    ///
    /// Passwords are request-scoped: they are used for the duration of
    /// the walk and never stored on the task.
    pub fn run_task(
        &self,
        task_id: &str,
        old_password: &str,
        new_password: &str,
    ) -> Result<RotationTask> {
        let started = Instant::now();
        let (user_id, old_key_id, new_key_id) = {
            let mut tasks = self.tasks.write();
            let task = tasks
                .get_mut(task_id)
                .ok_or_else(|| RotationError::TaskNotFound(task_id.to_string()))?;
            if task.state != TaskState::Pending {
                return Err(RotationError::TaskNotRunnable {
                    id: task_id.to_string(),
                    state: task.state,
                });
            }
            task.state = TaskState::Running;
            task.started_at = Some(Utc::now());
            (
                task.user_id.clone(),
                task.old_key_id.clone(),
                task.new_key_id.clone(),
            )
        };

        let sessions = self
            .context
            .store
            .list_sessions(&SessionFilter {
                key_ref: Some(old_key_id.clone()),
                ..SessionFilter::default()
            })?
            .items;
        let checkpoints = self
            .context
            .store
            .list_checkpoints(&CheckpointFilter {
                key_ref: Some(old_key_id.clone()),
                ..CheckpointFilter::default()
            })?
            .items;

        {
            let mut tasks = self.tasks.write();
            if let Some(task) = tasks.get_mut(task_id) {
                task.progress.sessions_total = sessions.len() as u64;
                task.progress.checkpoints_total = checkpoints.len() as u64;
            }
        }

        let mut sessions_migrated = 0u64;
        let mut checkpoints_migrated = 0u64;

        for session in sessions {
            match self.migrate_session(
                &session,
                &user_id,
                &old_key_id,
                &new_key_id,
                old_password,
                new_password,
            ) {
                Ok(()) => {
                    sessions_migrated += 1;
                    self.bump_progress(task_id, |p| p.sessions_done += 1);
                }
                Err(e) => {
                    warn!(session_id = %session.id, error = %e, "session migration failed");
                    self.push_error(task_id, format!("session {}: {e}", session.id));
                }
            }
        }

        for checkpoint in checkpoints {
            match self.migrate_checkpoint(
                &checkpoint,
                &user_id,
                &old_key_id,
                &new_key_id,
                old_password,
                new_password,
            ) {
                Ok(()) => {
                    checkpoints_migrated += 1;
                    self.bump_progress(task_id, |p| p.checkpoints_done += 1);
                }
                Err(e) => {
                    warn!(checkpoint_id = %checkpoint.id, error = %e, "checkpoint migration failed");
                    self.push_error(task_id, format!("checkpoint {}: {e}", checkpoint.id));
                }
            }
        }

        self.finish_task(task_id, started, sessions_migrated, checkpoints_migrated)?;
        self.get_task_status(task_id)
            .ok_or_else(|| RotationError::TaskNotFound(task_id.to_string()))
    }

    /// Snapshot of one task, live progress included.
    pub fn get_task_status(&self, task_id: &str) -> Option<RotationTask> {
        self.tasks.read().get(task_id).cloned()
    }

    /// All tasks belonging to a user, newest first.
    pub fn list_user_tasks(&self, user_id: &str) -> Vec<RotationTask> {
        let mut tasks: Vec<RotationTask> = self
            .tasks
            .read()
            .values()
            .filter(|t| t.user_id == user_id)
            .cloned()
            .collect();
        tasks.sort_by(|a, b| b.scheduled_at.cmp(&a.scheduled_at));
        tasks
    }

    /// Cancel a task that has not started yet.
    pub fn cancel_task(&self, task_id: &str) -> Result<RotationTask> {
        let mut tasks = self.tasks.write();
        let task = tasks
            .get_mut(task_id)
            .ok_or_else(|| RotationError::TaskNotFound(task_id.to_string()))?;
        if task.state != TaskState::Pending {
            return Err(RotationError::TaskNotCancellable {
                id: task_id.to_string(),
                state: task.state,
            });
        }
        task.state = TaskState::Cancelled;
        task.completed_at = Some(Utc::now());
        task.errors.push("cancelled by user".to_string());
        info!(task_id, "rotation task cancelled");
        Ok(task.clone())
    }

    // ------------------------------------------------------------------
    // Internals
    // ------------------------------------------------------------------

    fn migrate_session(
        &self,
        session: &crate::store::Session,
        user_id: &str,
        old_key_id: &str,
        new_key_id: &str,
        old_password: &str,
        new_password: &str,
    ) -> Result<()> {
        let envelope = Envelope::from_bytes(&session.workspace_state)
            .map_err(KeyVaultError::Crypto)?;
        let plaintext =
            self.vault
                .decrypt_with_user_key(user_id, old_key_id, old_password, &envelope)?;
        let rewrapped =
            self.vault
                .encrypt_with_user_key(user_id, new_key_id, new_password, &plaintext)?;
        let bytes = rewrapped.to_bytes();
        let checksum = crate::crypto::hash(&bytes);

        self.context.store.update_session(
            &session.id,
            SessionPatch {
                workspace_state: Some(bytes),
                state_checksum: Some(checksum),
                version: Some(session.version + 1),
                last_saved_at: Some(Utc::now()),
                encrypted_key_ref: Some(Some(new_key_id.to_string())),
                expected_version: Some(session.version),
                ..SessionPatch::default()
            },
        )?;
        debug!(session_id = %session.id, "session re-wrapped");
        Ok(())
    }

    fn migrate_checkpoint(
        &self,
        checkpoint: &crate::store::Checkpoint,
        user_id: &str,
        old_key_id: &str,
        new_key_id: &str,
        old_password: &str,
        new_password: &str,
    ) -> Result<()> {
        let envelope = Envelope::from_bytes(&checkpoint.workspace_state)
            .map_err(KeyVaultError::Crypto)?;
        let plaintext =
            self.vault
                .decrypt_with_user_key(user_id, old_key_id, old_password, &envelope)?;
        let rewrapped =
            self.vault
                .encrypt_with_user_key(user_id, new_key_id, new_password, &plaintext)?;
        let bytes = rewrapped.to_bytes();
        let checksum = crate::crypto::hash(&bytes);

        // The checkpoint store surface has no in-place update; replace
        // the row under the same identity
        let mut migrated = checkpoint.clone();
        migrated.workspace_state = bytes;
        migrated.state_checksum = checksum;
        migrated.encrypted_key_ref = Some(new_key_id.to_string());
        self.context.store.delete_checkpoint(&checkpoint.id)?;
        self.context.store.put_checkpoint(migrated)?;
        debug!(checkpoint_id = %checkpoint.id, "checkpoint re-wrapped");
        Ok(())
    }

    fn bump_progress(&self, task_id: &str, op: impl FnOnce(&mut TaskProgress)) {
        if let Some(task) = self.tasks.write().get_mut(task_id) {
            op(&mut task.progress);
        }
    }

    fn push_error(&self, task_id: &str, error: String) {
        if let Some(task) = self.tasks.write().get_mut(task_id) {
            task.errors.push(error);
        }
    }

    fn finish_task(
        &self,
        task_id: &str,
        started: Instant,
        sessions_migrated: u64,
        checkpoints_migrated: u64,
    ) -> Result<()> {
        let (user_id, old_key_id, deactivate, force, failed) = {
            let mut tasks = self.tasks.write();
            let task = tasks
                .get_mut(task_id)
                .ok_or_else(|| RotationError::TaskNotFound(task_id.to_string()))?;
            let failed = !task.errors.is_empty();
            task.state = if failed {
                TaskState::Failed
            } else {
                TaskState::Completed
            };
            task.completed_at = Some(Utc::now());
            (
                task.user_id.clone(),
                task.old_key_id.clone(),
                task.deactivate_old_key,
                task.force,
                failed,
            )
        };

        // A clean migration (or a forced rotation) retires the old key.
        // An unforced walk with errors keeps it active: rows still
        // wrapped under it must stay readable.
        if deactivate && (!failed || force) {
            self.vault
                .deactivate_key(&user_id, &old_key_id, "rotated")?;
        }

        self.context.metrics.record_rotation(
            &user_id,
            !failed,
            started.elapsed().as_secs_f64() * 1000.0,
            sessions_migrated,
            checkpoints_migrated,
        );
        info!(task_id, failed, "rotation task finished");
        Ok(())
    }
}

// ============================================================================
// TESTS
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use crate::key_vault::tests::test_context;
    use crate::store::Session;
    use chrono::Duration;

    const PASSWORD: &str = "MyStr0ng!P@ssw0rd123";
    const NEW_PASSWORD: &str = "An0ther!Str0ng#Pass9";

    struct Fixture {
        context: CoreContext,
        engine: RotationEngine,
        vault: KeyVault,
        key_id: String,
    }

    fn fixture() -> Fixture {
        let mut context = test_context();
        // Fresh fixture keys may rotate without forcing
        context.config.min_rotation_age_days = 0;
        let engine = RotationEngine::new(context.clone());
        let vault = KeyVault::new(context.clone());
        let key = vault
            .create_user_key("u1", "main", PASSWORD, None, None, None)
            .unwrap();
        Fixture {
            context,
            engine,
            vault,
            key_id: key.key_id,
        }
    }

    fn put_wrapped_session(fx: &Fixture, id: &str, payload: &[u8]) {
        let envelope = fx
            .vault
            .encrypt_with_user_key("u1", &fx.key_id, PASSWORD, payload)
            .unwrap();
        let bytes = envelope.to_bytes();
        fx.context
            .store
            .put_session(Session {
                id: id.to_string(),
                user_id: "u1".to_string(),
                workspace_id: "ws".to_string(),
                name: id.to_string(),
                state_checksum: crate::crypto::hash(&bytes),
                workspace_state: bytes,
                version: 1,
                last_saved_at: Utc::now(),
                expires_at: Utc::now() + Duration::days(30),
                encrypted_key_ref: Some(fx.key_id.clone()),
                is_active: true,
            })
            .unwrap();
    }

    fn request(fx: &Fixture) -> RotationRequest {
        RotationRequest {
            user_id: "u1".to_string(),
            key_id: fx.key_id.clone(),
            new_password: NEW_PASSWORD.to_string(),
            force: false,
            preserve_old_key: false,
            re_encrypt_data: true,
            reason: Some("test".to_string()),
        }
    }

    /// A row that claims the fixture key but holds undecryptable bytes
    fn put_garbage_session(fx: &Fixture, id: &str) {
        fx.context
            .store
            .put_session(Session {
                id: id.to_string(),
                user_id: "u1".to_string(),
                workspace_id: "ws".to_string(),
                name: id.to_string(),
                workspace_state: b"not an envelope".to_vec(),
                state_checksum: crate::crypto::hash(b"not an envelope"),
                version: 1,
                last_saved_at: Utc::now(),
                expires_at: Utc::now() + Duration::days(30),
                encrypted_key_ref: Some(fx.key_id.clone()),
                is_active: true,
            })
            .unwrap();
    }

    #[test]
    fn test_check_buckets_keys() {
        let context = test_context();
        let engine = RotationEngine::new(context.clone());

        let mut expired = crate::key_vault::tests::key_fixture("u1", "k-exp", "expired");
        expired.expires_at = Utc::now() - Duration::days(1);
        let mut soon = crate::key_vault::tests::key_fixture("u1", "k-soon", "soon");
        soon.expires_at = Utc::now() + Duration::days(3);
        let mut old = crate::key_vault::tests::key_fixture("u1", "k-old", "old");
        old.created_at = Utc::now() - Duration::days(200);
        old.expires_at = Utc::now() + Duration::days(30);
        // Satisfies two predicates at once: near expiry AND past max age
        let mut both = crate::key_vault::tests::key_fixture("u1", "k-both", "both");
        both.created_at = Utc::now() - Duration::days(200);
        both.expires_at = Utc::now() + Duration::days(5);
        for key in [expired, soon, old, both] {
            context.store.put_user_key(key).unwrap();
        }

        let check = engine.check_keys_needing_rotation("u1", None).unwrap();
        let ids = |keys: &[crate::store::UserKey]| -> Vec<String> {
            keys.iter().map(|k| k.key_id.clone()).collect()
        };

        assert_eq!(ids(&check.expired), vec!["k-exp".to_string()]);

        let mut expiring = ids(&check.expiring_soon);
        expiring.sort();
        assert_eq!(expiring, vec!["k-both".to_string(), "k-soon".to_string()]);

        // The overlapping key is NOT swallowed by the expiry bucket
        let mut needing = ids(&check.needs_rotation);
        needing.sort();
        assert_eq!(needing, vec!["k-both".to_string(), "k-old".to_string()]);
    }

    #[test]
    fn test_initiate_rejects_wrong_password() {
        let fx = fixture();
        let result = fx.engine.initiate_rotation(&request(&fx), "Wr0ng!Pass123$x");
        assert!(matches!(result, Err(RotationError::InvalidPassword(_))));
        // No replacement key was minted
        assert_eq!(fx.vault.list_user_keys("u1", true).unwrap().len(), 1);
    }

    #[test]
    fn test_full_rotation_re_encrypts_rows() {
        let fx = fixture();
        put_wrapped_session(&fx, "s1", b"alpha");
        put_wrapped_session(&fx, "s2", b"beta");

        let task = fx.engine.initiate_rotation(&request(&fx), PASSWORD).unwrap();
        assert_eq!(task.state, TaskState::Pending);

        let finished = fx
            .engine
            .run_task(&task.id, PASSWORD, NEW_PASSWORD)
            .unwrap();
        assert_eq!(finished.state, TaskState::Completed);
        assert_eq!(finished.progress.sessions_total, 2);
        assert_eq!(finished.progress.sessions_done, 2);
        assert!(finished.errors.is_empty());

        // Rows decrypt under the new key, not the old
        for (id, expected) in [("s1", b"alpha".as_slice()), ("s2", b"beta".as_slice())] {
            let row = fx.context.store.get_session(id).unwrap().unwrap();
            assert_eq!(row.encrypted_key_ref.as_deref(), Some(finished.new_key_id.as_str()));
            assert_eq!(row.version, 2);
            let envelope = Envelope::from_bytes(&row.workspace_state).unwrap();

            let plaintext = fx
                .vault
                .decrypt_with_user_key("u1", &finished.new_key_id, NEW_PASSWORD, &envelope)
                .unwrap();
            assert_eq!(plaintext.as_slice(), expected);

            let old_attempt =
                fx.vault
                    .decrypt_with_user_key("u1", &finished.old_key_id, PASSWORD, &envelope);
            assert!(old_attempt.is_err());
        }

        // Old key deactivated after the clean walk
        let keys = fx.vault.list_user_keys("u1", true).unwrap();
        let old = keys.iter().find(|k| k.key_id == finished.old_key_id).unwrap();
        assert!(!old.is_active);
    }

    #[test]
    fn test_rotation_migrates_checkpoints() {
        let fx = fixture();
        let envelope = fx
            .vault
            .encrypt_with_user_key("u1", &fx.key_id, PASSWORD, b"snapshot")
            .unwrap();
        let bytes = envelope.to_bytes();
        let mut checkpoint = crate::store::tests::checkpoint_fixture("c1", "s1", "snap");
        checkpoint.state_checksum = crate::crypto::hash(&bytes);
        checkpoint.workspace_state = bytes;
        checkpoint.encrypted_key_ref = Some(fx.key_id.clone());
        fx.context.store.put_checkpoint(checkpoint).unwrap();

        let task = fx.engine.initiate_rotation(&request(&fx), PASSWORD).unwrap();
        let finished = fx
            .engine
            .run_task(&task.id, PASSWORD, NEW_PASSWORD)
            .unwrap();
        assert_eq!(finished.progress.checkpoints_done, 1);

        let row = fx.context.store.get_checkpoint("c1").unwrap().unwrap();
        assert_eq!(
            row.encrypted_key_ref.as_deref(),
            Some(finished.new_key_id.as_str())
        );
        let envelope = Envelope::from_bytes(&row.workspace_state).unwrap();
        let plaintext = fx
            .vault
            .decrypt_with_user_key("u1", &finished.new_key_id, NEW_PASSWORD, &envelope)
            .unwrap();
        assert_eq!(plaintext.as_slice(), b"snapshot");
    }

    #[test]
    fn test_row_failure_accumulates_and_continues() {
        let fx = fixture();
        put_wrapped_session(&fx, "s1", b"good");
        put_garbage_session(&fx, "s-bad");

        let task = fx.engine.initiate_rotation(&request(&fx), PASSWORD).unwrap();
        let finished = fx
            .engine
            .run_task(&task.id, PASSWORD, NEW_PASSWORD)
            .unwrap();

        // The good row migrated; the bad one is recorded and the task failed
        assert_eq!(finished.state, TaskState::Failed);
        assert_eq!(finished.progress.sessions_done, 1);
        assert_eq!(finished.errors.len(), 1);
        assert!(finished.errors[0].contains("s-bad"));

        // An unforced dirty walk keeps the old key active so the
        // unmigrated row stays readable
        let keys = fx.vault.list_user_keys("u1", true).unwrap();
        let old = keys.iter().find(|k| k.key_id == finished.old_key_id).unwrap();
        assert!(old.is_active);
    }

    #[test]
    fn test_force_deactivates_old_key_despite_row_failure() {
        let fx = fixture();
        put_wrapped_session(&fx, "s1", b"good");
        put_garbage_session(&fx, "s-bad");

        let mut req = request(&fx);
        req.force = true;
        let task = fx.engine.initiate_rotation(&req, PASSWORD).unwrap();
        let finished = fx
            .engine
            .run_task(&task.id, PASSWORD, NEW_PASSWORD)
            .unwrap();
        assert_eq!(finished.state, TaskState::Failed);
        assert!(!finished.errors.is_empty());

        // Forced rotation retires the old key even after a dirty walk
        let keys = fx.vault.list_user_keys("u1", true).unwrap();
        let old = keys.iter().find(|k| k.key_id == finished.old_key_id).unwrap();
        assert!(!old.is_active);
        // Deactivated keys still decrypt, so the failed row is not lost
        let row = fx.context.store.get_session("s-bad").unwrap().unwrap();
        assert_eq!(row.encrypted_key_ref.as_deref(), Some(finished.old_key_id.as_str()));
    }

    #[test]
    fn test_cancel_only_pending() {
        let fx = fixture();
        let task = fx.engine.initiate_rotation(&request(&fx), PASSWORD).unwrap();

        let cancelled = fx.engine.cancel_task(&task.id).unwrap();
        assert_eq!(cancelled.state, TaskState::Cancelled);

        // Cancelled tasks cannot run or be cancelled again
        assert!(matches!(
            fx.engine.run_task(&task.id, PASSWORD, NEW_PASSWORD),
            Err(RotationError::TaskNotRunnable { .. })
        ));
        assert!(matches!(
            fx.engine.cancel_task(&task.id),
            Err(RotationError::TaskNotCancellable { .. })
        ));
    }

    #[test]
    fn test_no_data_walk_completes_immediately() {
        let fx = fixture();
        let mut req = request(&fx);
        req.re_encrypt_data = false;

        let task = fx.engine.initiate_rotation(&req, PASSWORD).unwrap();
        assert_eq!(task.state, TaskState::Completed);

        let metrics = fx.context.metrics.user_snapshot("u1");
        assert_eq!(metrics.rotations_succeeded, 1);
    }

    #[test]
    fn test_list_user_tasks() {
        let fx = fixture();
        let task = fx.engine.initiate_rotation(&request(&fx), PASSWORD).unwrap();
        let tasks = fx.engine.list_user_tasks("u1");
        assert_eq!(tasks.len(), 1);
        assert_eq!(tasks[0].id, task.id);
        assert!(fx.engine.list_user_tasks("u2").is_empty());
    }
}
