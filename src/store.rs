//! # Store Adapter
//!
//! The narrow durable-store interface the core depends on, plus the row
//! types it persists. Everything above this module talks to storage
//! exclusively through [`StoreAdapter`]; no component owns an ambient
//! client.
//!
//! Two backends ship with the crate:
//!
//! - **MemoryStore**: lock-guarded maps. Reference behavior, unit tests,
//!   and short-lived processes.
//! - **JsonFileStore**: whole-store JSON persistence. Loads on open,
//!   flushes after every mutation.
//!
//! Every operation is atomic per row; the core never requires cross-row
//! transactions. Session rows carry an optimistic version: a patch with
//! `expected_version` set fails with [`StoreError::VersionMismatch`] when
//! the row has moved on.

use chrono::{DateTime, Utc};
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::{BTreeMap, HashMap};
use std::fs::{File, OpenOptions};
use std::io::{BufReader, BufWriter};
use std::path::{Path, PathBuf};
use thiserror::Error;

use crate::crypto::Envelope;

// ============================================================================
// ERROR TYPES
// ============================================================================

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("{kind} not found: {id}")]
    NotFound { kind: &'static str, id: String },

    #[error("duplicate {kind}: {id}")]
    Duplicate { kind: &'static str, id: String },

    #[error("version mismatch for session {id}: expected {expected}, found {found}")]
    VersionMismatch { id: String, expected: u64, found: u64 },

    #[error("storage backend error: {0}")]
    Backend(String),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

pub type Result<T> = std::result::Result<T, StoreError>;

// ============================================================================
// ROW TYPES
// ============================================================================

/// Persisted session container. One row per session id.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Session {
    pub id: String,
    pub user_id: String,
    pub workspace_id: String,
    pub name: String,
    /// Workspace state exactly as persisted (envelope or plain codec bytes)
    pub workspace_state: Vec<u8>,
    /// Lower-case hex SHA-256 over `workspace_state`
    pub state_checksum: String,
    /// Strictly increasing per session id, starts at 1
    pub version: u64,
    pub last_saved_at: DateTime<Utc>,
    pub expires_at: DateTime<Utc>,
    /// Key the state is wrapped under, by opaque id
    pub encrypted_key_ref: Option<String>,
    pub is_active: bool,
}

/// Checkpoint priority used for retention decisions
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CheckpointPriority {
    Low,
    Medium,
    High,
}

/// Immutable named snapshot of a session's workspace state.
/// Never mutated after creation.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Checkpoint {
    pub id: String,
    pub session_id: String,
    /// Unique per `(session_id, name)`
    pub name: String,
    pub description: Option<String>,
    pub workspace_state: Vec<u8>,
    pub state_checksum: String,
    pub compressed_size: u64,
    pub uncompressed_size: u64,
    pub priority: CheckpointPriority,
    pub tags: Vec<String>,
    pub is_auto_generated: bool,
    pub created_at: DateTime<Utc>,
    pub encrypted_key_ref: Option<String>,
    pub metadata: BTreeMap<String, Value>,
}

/// One encryption identity belonging to a user.
///
/// The wrapped session key decrypts only with the master key derived from
/// the owner's password and the stored salt; the master key itself is
/// never persisted.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct UserKey {
    pub user_id: String,
    /// Opaque, globally unique
    pub key_id: String,
    /// User-facing, unique among the user's active keys
    pub key_name: String,
    pub description: Option<String>,

    pub wrapped_session_key: Envelope,
    /// Base64 KDF salt, at least 16 bytes decoded
    pub salt: String,
    pub kdf_algorithm: String,
    pub kdf_iterations: u32,
    pub cipher_algorithm: String,

    pub is_active: bool,
    pub created_at: DateTime<Utc>,
    pub last_used_at: Option<DateTime<Utc>>,
    pub expires_at: DateTime<Utc>,
    pub deactivated_at: Option<DateTime<Utc>>,
    pub deactivation_reason: Option<String>,

    pub previous_key_id: Option<String>,
    pub rotation_reason: Option<String>,
    pub metadata: BTreeMap<String, Value>,
}

impl UserKey {
    pub fn is_expired(&self, now: DateTime<Utc>) -> bool {
        self.expires_at < now
    }

    pub fn age_days(&self, now: DateTime<Utc>) -> i64 {
        now.signed_duration_since(self.created_at).num_days()
    }
}

// ============================================================================
// FILTERS & PATCHES
// ============================================================================

/// Session listing filter; all fields are conjunctive
#[derive(Debug, Clone, Default)]
pub struct SessionFilter {
    pub user_id: Option<String>,
    pub workspace_id: Option<String>,
    pub active_only: bool,
    pub key_ref: Option<String>,
    pub limit: Option<usize>,
    pub offset: usize,
}

impl SessionFilter {
    fn matches(&self, session: &Session) -> bool {
        if let Some(user_id) = &self.user_id {
            if &session.user_id != user_id {
                return false;
            }
        }
        if let Some(workspace_id) = &self.workspace_id {
            if &session.workspace_id != workspace_id {
                return false;
            }
        }
        if self.active_only && !session.is_active {
            return false;
        }
        if let Some(key_ref) = &self.key_ref {
            if session.encrypted_key_ref.as_ref() != Some(key_ref) {
                return false;
            }
        }
        true
    }
}

/// Checkpoint listing filter
#[derive(Debug, Clone, Default)]
pub struct CheckpointFilter {
    pub session_id: Option<String>,
    pub tag: Option<String>,
    pub auto_generated: Option<bool>,
    pub key_ref: Option<String>,
    pub limit: Option<usize>,
    pub offset: usize,
}

impl CheckpointFilter {
    fn matches(&self, checkpoint: &Checkpoint) -> bool {
        if let Some(session_id) = &self.session_id {
            if &checkpoint.session_id != session_id {
                return false;
            }
        }
        if let Some(tag) = &self.tag {
            if !checkpoint.tags.contains(tag) {
                return false;
            }
        }
        if let Some(auto) = self.auto_generated {
            if checkpoint.is_auto_generated != auto {
                return false;
            }
        }
        if let Some(key_ref) = &self.key_ref {
            if checkpoint.encrypted_key_ref.as_ref() != Some(key_ref) {
                return false;
            }
        }
        true
    }
}

/// One page of a filtered listing
#[derive(Debug, Clone)]
pub struct Page<T> {
    pub items: Vec<T>,
    /// Matching rows before limit/offset were applied
    pub total: usize,
}

/// Partial session update. `None` fields are untouched.
#[derive(Debug, Clone, Default)]
pub struct SessionPatch {
    pub workspace_state: Option<Vec<u8>>,
    pub state_checksum: Option<String>,
    pub version: Option<u64>,
    pub last_saved_at: Option<DateTime<Utc>>,
    pub expires_at: Option<DateTime<Utc>>,
    pub encrypted_key_ref: Option<Option<String>>,
    pub is_active: Option<bool>,
    /// Optimistic concurrency guard: fail unless the row is at this version
    pub expected_version: Option<u64>,
}

/// Partial user-key update. `None` fields are untouched.
#[derive(Debug, Clone, Default)]
pub struct UserKeyPatch {
    pub is_active: Option<bool>,
    pub last_used_at: Option<DateTime<Utc>>,
    pub expires_at: Option<DateTime<Utc>>,
    pub deactivated_at: Option<Option<DateTime<Utc>>>,
    pub deactivation_reason: Option<Option<String>>,
    pub previous_key_id: Option<String>,
    pub rotation_reason: Option<String>,
    /// Merged key-by-key into the row's metadata map
    pub metadata: Option<BTreeMap<String, Value>>,
}

// ============================================================================
// TRAIT: StoreAdapter
// ============================================================================

/// Durable-store capability set required by the core.
///
/// Implementations must guarantee:
/// 1. Per-row atomicity for every operation
/// 2. `put_*` rejects duplicate identities rather than overwriting
/// 3. `update_session` honors `expected_version` when present
pub trait StoreAdapter: Send + Sync {
    fn get_session(&self, id: &str) -> Result<Option<Session>>;
    fn put_session(&self, session: Session) -> Result<()>;
    fn update_session(&self, id: &str, patch: SessionPatch) -> Result<Session>;
    fn delete_session(&self, id: &str) -> Result<()>;
    fn list_sessions(&self, filter: &SessionFilter) -> Result<Page<Session>>;
    fn count_sessions(&self, filter: &SessionFilter) -> Result<usize>;

    fn get_checkpoint(&self, id: &str) -> Result<Option<Checkpoint>>;
    fn put_checkpoint(&self, checkpoint: Checkpoint) -> Result<()>;
    fn delete_checkpoint(&self, id: &str) -> Result<()>;
    fn list_checkpoints(&self, filter: &CheckpointFilter) -> Result<Page<Checkpoint>>;
    fn count_checkpoints(&self, filter: &CheckpointFilter) -> Result<usize>;

    fn get_user_key(&self, user_id: &str, key_id: &str) -> Result<Option<UserKey>>;
    fn list_user_keys(&self, user_id: &str, include_inactive: bool) -> Result<Vec<UserKey>>;
    fn put_user_key(&self, key: UserKey) -> Result<()>;
    fn update_user_key(&self, key_id: &str, patch: UserKeyPatch) -> Result<UserKey>;
    fn delete_user_key(&self, key_id: &str) -> Result<()>;

    /// Current version of a session row, 0 when the row is absent.
    /// The sync engine assigns event versions from this.
    fn get_session_version(&self, id: &str) -> Result<u64> {
        Ok(self.get_session(id)?.map(|s| s.version).unwrap_or(0))
    }
}

// ============================================================================
// SHARED ROW LOGIC
// ============================================================================

/// Plain-data portion shared by both backends
#[derive(Debug, Default, Serialize, Deserialize)]
struct StoreData {
    sessions: HashMap<String, Session>,
    checkpoints: HashMap<String, Checkpoint>,
    user_keys: HashMap<String, UserKey>,
}

impl StoreData {
    fn apply_session_patch(&mut self, id: &str, patch: SessionPatch) -> Result<Session> {
        let session = self
            .sessions
            .get_mut(id)
            .ok_or_else(|| StoreError::NotFound {
                kind: "session",
                id: id.to_string(),
            })?;

        if let Some(expected) = patch.expected_version {
            if session.version != expected {
                return Err(StoreError::VersionMismatch {
                    id: id.to_string(),
                    expected,
                    found: session.version,
                });
            }
        }

        if let Some(state) = patch.workspace_state {
            session.workspace_state = state;
        }
        if let Some(checksum) = patch.state_checksum {
            session.state_checksum = checksum;
        }
        if let Some(version) = patch.version {
            session.version = version;
        }
        if let Some(saved) = patch.last_saved_at {
            session.last_saved_at = saved;
        }
        if let Some(expires) = patch.expires_at {
            session.expires_at = expires;
        }
        if let Some(key_ref) = patch.encrypted_key_ref {
            session.encrypted_key_ref = key_ref;
        }
        if let Some(active) = patch.is_active {
            session.is_active = active;
        }

        Ok(session.clone())
    }

    fn apply_user_key_patch(&mut self, key_id: &str, patch: UserKeyPatch) -> Result<UserKey> {
        let key = self
            .user_keys
            .get_mut(key_id)
            .ok_or_else(|| StoreError::NotFound {
                kind: "user key",
                id: key_id.to_string(),
            })?;

        if let Some(active) = patch.is_active {
            key.is_active = active;
        }
        if let Some(used) = patch.last_used_at {
            key.last_used_at = Some(used);
        }
        if let Some(expires) = patch.expires_at {
            key.expires_at = expires;
        }
        if let Some(deactivated) = patch.deactivated_at {
            key.deactivated_at = deactivated;
        }
        if let Some(reason) = patch.deactivation_reason {
            key.deactivation_reason = reason;
        }
        if let Some(previous) = patch.previous_key_id {
            key.previous_key_id = Some(previous);
        }
        if let Some(reason) = patch.rotation_reason {
            key.rotation_reason = Some(reason);
        }
        if let Some(metadata) = patch.metadata {
            for (k, v) in metadata {
                key.metadata.insert(k, v);
            }
        }

        Ok(key.clone())
    }

    fn insert_session(&mut self, session: Session) -> Result<()> {
        if self.sessions.contains_key(&session.id) {
            return Err(StoreError::Duplicate {
                kind: "session",
                id: session.id,
            });
        }
        self.sessions.insert(session.id.clone(), session);
        Ok(())
    }

    fn insert_checkpoint(&mut self, checkpoint: Checkpoint) -> Result<()> {
        if self.checkpoints.contains_key(&checkpoint.id) {
            return Err(StoreError::Duplicate {
                kind: "checkpoint",
                id: checkpoint.id,
            });
        }
        // (session_id, name) is the logical identity of a snapshot
        let clash = self
            .checkpoints
            .values()
            .any(|c| c.session_id == checkpoint.session_id && c.name == checkpoint.name);
        if clash {
            return Err(StoreError::Duplicate {
                kind: "checkpoint name",
                id: format!("{}/{}", checkpoint.session_id, checkpoint.name),
            });
        }
        self.checkpoints.insert(checkpoint.id.clone(), checkpoint);
        Ok(())
    }

    fn insert_user_key(&mut self, key: UserKey) -> Result<()> {
        if self.user_keys.contains_key(&key.key_id) {
            return Err(StoreError::Duplicate {
                kind: "user key",
                id: key.key_id,
            });
        }
        self.user_keys.insert(key.key_id.clone(), key);
        Ok(())
    }

    fn sessions_page(&self, filter: &SessionFilter) -> Page<Session> {
        let mut matching: Vec<Session> = self
            .sessions
            .values()
            .filter(|s| filter.matches(s))
            .cloned()
            .collect();
        matching.sort_by(|a, b| b.last_saved_at.cmp(&a.last_saved_at));
        paginate(matching, filter.offset, filter.limit)
    }

    fn checkpoints_page(&self, filter: &CheckpointFilter) -> Page<Checkpoint> {
        let mut matching: Vec<Checkpoint> = self
            .checkpoints
            .values()
            .filter(|c| filter.matches(c))
            .cloned()
            .collect();
        matching.sort_by(|a, b| b.created_at.cmp(&a.created_at));
        paginate(matching, filter.offset, filter.limit)
    }
}

fn paginate<T>(items: Vec<T>, offset: usize, limit: Option<usize>) -> Page<T> {
    let total = items.len();
    let items: Vec<T> = items
        .into_iter()
        .skip(offset)
        .take(limit.unwrap_or(usize::MAX))
        .collect();
    Page { items, total }
}

// ============================================================================
// MEMORY STORE
// ============================================================================

/// In-memory store. Reference behavior for tests and embedded use;
/// contents are lost on process exit.
#[derive(Default)]
pub struct MemoryStore {
    data: RwLock<StoreData>,
}

impl MemoryStore {
    pub fn new() -> Self {
        MemoryStore::default()
    }
}

impl StoreAdapter for MemoryStore {
    fn get_session(&self, id: &str) -> Result<Option<Session>> {
        Ok(self.data.read().sessions.get(id).cloned())
    }

    fn put_session(&self, session: Session) -> Result<()> {
        self.data.write().insert_session(session)
    }

    fn update_session(&self, id: &str, patch: SessionPatch) -> Result<Session> {
        self.data.write().apply_session_patch(id, patch)
    }

    fn delete_session(&self, id: &str) -> Result<()> {
        self.data
            .write()
            .sessions
            .remove(id)
            .map(|_| ())
            .ok_or_else(|| StoreError::NotFound {
                kind: "session",
                id: id.to_string(),
            })
    }

    fn list_sessions(&self, filter: &SessionFilter) -> Result<Page<Session>> {
        Ok(self.data.read().sessions_page(filter))
    }

    fn count_sessions(&self, filter: &SessionFilter) -> Result<usize> {
        Ok(self
            .data
            .read()
            .sessions
            .values()
            .filter(|s| filter.matches(s))
            .count())
    }

    fn get_checkpoint(&self, id: &str) -> Result<Option<Checkpoint>> {
        Ok(self.data.read().checkpoints.get(id).cloned())
    }

    fn put_checkpoint(&self, checkpoint: Checkpoint) -> Result<()> {
        self.data.write().insert_checkpoint(checkpoint)
    }

    fn delete_checkpoint(&self, id: &str) -> Result<()> {
        self.data
            .write()
            .checkpoints
            .remove(id)
            .map(|_| ())
            .ok_or_else(|| StoreError::NotFound {
                kind: "checkpoint",
                id: id.to_string(),
            })
    }

    fn list_checkpoints(&self, filter: &CheckpointFilter) -> Result<Page<Checkpoint>> {
        Ok(self.data.read().checkpoints_page(filter))
    }

    fn count_checkpoints(&self, filter: &CheckpointFilter) -> Result<usize> {
        Ok(self
            .data
            .read()
            .checkpoints
            .values()
            .filter(|c| filter.matches(c))
            .count())
    }

    fn get_user_key(&self, user_id: &str, key_id: &str) -> Result<Option<UserKey>> {
        Ok(self
            .data
            .read()
            .user_keys
            .get(key_id)
            .filter(|k| k.user_id == user_id)
            .cloned())
    }

    fn list_user_keys(&self, user_id: &str, include_inactive: bool) -> Result<Vec<UserKey>> {
        let data = self.data.read();
        let mut keys: Vec<UserKey> = data
            .user_keys
            .values()
            .filter(|k| k.user_id == user_id && (include_inactive || k.is_active))
            .cloned()
            .collect();
        keys.sort_by(|a, b| a.created_at.cmp(&b.created_at));
        Ok(keys)
    }

    fn put_user_key(&self, key: UserKey) -> Result<()> {
        self.data.write().insert_user_key(key)
    }

    fn update_user_key(&self, key_id: &str, patch: UserKeyPatch) -> Result<UserKey> {
        self.data.write().apply_user_key_patch(key_id, patch)
    }

    fn delete_user_key(&self, key_id: &str) -> Result<()> {
        self.data
            .write()
            .user_keys
            .remove(key_id)
            .map(|_| ())
            .ok_or_else(|| StoreError::NotFound {
                kind: "user key",
                id: key_id.to_string(),
            })
    }
}

// ============================================================================
// JSON FILE STORE
// ============================================================================

/// Whole-store JSON persistence.
///
/// The entire store is loaded on open and rewritten after every mutation.
/// Suited to single-process deployments with modest row counts; larger
/// installations should implement [`StoreAdapter`] over a real database.
pub struct JsonFileStore {
    path: PathBuf,
    data: RwLock<StoreData>,
}

impl JsonFileStore {
    /// Open or create a store file at `path`.
    pub fn open<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref().to_path_buf();
        let data = if path.exists() {
            let file = File::open(&path)?;
            serde_json::from_reader(BufReader::new(file))?
        } else {
            StoreData::default()
        };
        Ok(JsonFileStore {
            path,
            data: RwLock::new(data),
        })
    }

    fn flush(&self, data: &StoreData) -> Result<()> {
        let file = OpenOptions::new()
            .write(true)
            .create(true)
            .truncate(true)
            .open(&self.path)?;
        serde_json::to_writer(BufWriter::new(file), data)?;
        Ok(())
    }

    fn mutate<T>(&self, op: impl FnOnce(&mut StoreData) -> Result<T>) -> Result<T> {
        let mut data = self.data.write();
        let result = op(&mut data)?;
        self.flush(&data)?;
        Ok(result)
    }
}

impl StoreAdapter for JsonFileStore {
    fn get_session(&self, id: &str) -> Result<Option<Session>> {
        Ok(self.data.read().sessions.get(id).cloned())
    }

    fn put_session(&self, session: Session) -> Result<()> {
        self.mutate(|data| data.insert_session(session))
    }

    fn update_session(&self, id: &str, patch: SessionPatch) -> Result<Session> {
        self.mutate(|data| data.apply_session_patch(id, patch))
    }

    fn delete_session(&self, id: &str) -> Result<()> {
        self.mutate(|data| {
            data.sessions
                .remove(id)
                .map(|_| ())
                .ok_or_else(|| StoreError::NotFound {
                    kind: "session",
                    id: id.to_string(),
                })
        })
    }

    fn list_sessions(&self, filter: &SessionFilter) -> Result<Page<Session>> {
        Ok(self.data.read().sessions_page(filter))
    }

    fn count_sessions(&self, filter: &SessionFilter) -> Result<usize> {
        Ok(self
            .data
            .read()
            .sessions
            .values()
            .filter(|s| filter.matches(s))
            .count())
    }

    fn get_checkpoint(&self, id: &str) -> Result<Option<Checkpoint>> {
        Ok(self.data.read().checkpoints.get(id).cloned())
    }

    fn put_checkpoint(&self, checkpoint: Checkpoint) -> Result<()> {
        self.mutate(|data| data.insert_checkpoint(checkpoint))
    }

    fn delete_checkpoint(&self, id: &str) -> Result<()> {
        self.mutate(|data| {
            data.checkpoints
                .remove(id)
                .map(|_| ())
                .ok_or_else(|| StoreError::NotFound {
                    kind: "checkpoint",
                    id: id.to_string(),
                })
        })
    }

    fn list_checkpoints(&self, filter: &CheckpointFilter) -> Result<Page<Checkpoint>> {
        Ok(self.data.read().checkpoints_page(filter))
    }

    fn count_checkpoints(&self, filter: &CheckpointFilter) -> Result<usize> {
        Ok(self
            .data
            .read()
            .checkpoints
            .values()
            .filter(|c| filter.matches(c))
            .count())
    }

    fn get_user_key(&self, user_id: &str, key_id: &str) -> Result<Option<UserKey>> {
        Ok(self
            .data
            .read()
            .user_keys
            .get(key_id)
            .filter(|k| k.user_id == user_id)
            .cloned())
    }

    fn list_user_keys(&self, user_id: &str, include_inactive: bool) -> Result<Vec<UserKey>> {
        let data = self.data.read();
        let mut keys: Vec<UserKey> = data
            .user_keys
            .values()
            .filter(|k| k.user_id == user_id && (include_inactive || k.is_active))
            .cloned()
            .collect();
        keys.sort_by(|a, b| a.created_at.cmp(&b.created_at));
        Ok(keys)
    }

    fn put_user_key(&self, key: UserKey) -> Result<()> {
        self.mutate(|data| data.insert_user_key(key))
    }

    fn update_user_key(&self, key_id: &str, patch: UserKeyPatch) -> Result<UserKey> {
        self.mutate(|data| data.apply_user_key_patch(key_id, patch))
    }

    fn delete_user_key(&self, key_id: &str) -> Result<()> {
        self.mutate(|data| {
            data.user_keys
                .remove(key_id)
                .map(|_| ())
                .ok_or_else(|| StoreError::NotFound {
                    kind: "user key",
                    id: key_id.to_string(),
                })
        })
    }
}

// ============================================================================
// TESTS
// ============================================================================
