//! # Session Manager
//!
//! The write and read paths over persisted sessions: serialize a
//! workspace state, bind its checksum, wrap it under the user's key, and
//! persist — then the inverse, verifying before decoding. Checkpoint
//! lifecycle and the session expiry sweep live here too.
//!
//! Every mutation is announced through the sync engine when one is
//! attached; a manager without a sync engine is silent but otherwise
//! identical.
//!
//! Read failures are NOT handled here: `load_session_state` surfaces the
//! codec error and the caller decides whether to enter the recovery
//! ladder.

use chrono::{Duration, Utc};
use serde_json::Value;
use std::collections::BTreeMap;
use thiserror::Error;
use tracing::{debug, info};

use crate::codec::{CodecError, StateCodec};
use crate::context::CoreContext;
use crate::crypto::{self, KEY_LEN};
use crate::key_vault::{KeyVault, KeyVaultError};
use crate::store::{
    Checkpoint, CheckpointFilter, CheckpointPriority, Session, SessionFilter, SessionPatch,
    StoreError,
};
use crate::sync::{PublishRequest, SyncEngine, SyncError, SyncEventType};
use crate::workspace::WorkspaceState;
use zeroize::Zeroizing;

// ============================================================================
// CONSTANTS
// ============================================================================

/// Default lifetime of a new session row
const DEFAULT_SESSION_TTL_DAYS: i64 = 30;

// ============================================================================
// ERROR TYPES
// ============================================================================

#[derive(Debug, Error)]
pub enum SessionError {
    #[error("session not found: {0}")]
    SessionNotFound(String),

    #[error("checkpoint not found: {0}")]
    CheckpointNotFound(String),

    #[error("session {0} is encrypted; a password is required")]
    PasswordRequired(String),

    #[error(transparent)]
    Codec(#[from] CodecError),

    #[error(transparent)]
    Vault(#[from] KeyVaultError),

    #[error(transparent)]
    Store(#[from] StoreError),

    #[error(transparent)]
    Sync(#[from] SyncError),
}

pub type Result<T> = std::result::Result<T, SessionError>;

// ============================================================================
// REQUEST TYPES
// ============================================================================

/// Credentials for the user's encryption key
#[derive(Clone)]
pub struct KeyCredentials {
    pub key_id: String,
    pub password: String,
}

impl std::fmt::Debug for KeyCredentials {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("KeyCredentials")
            .field("key_id", &self.key_id)
            .field("password", &"<redacted>")
            .finish()
    }
}

/// Options for [`SessionManager::create_checkpoint`]
#[derive(Debug, Clone)]
pub struct CheckpointOptions {
    pub description: Option<String>,
    pub priority: CheckpointPriority,
    pub tags: Vec<String>,
    pub is_auto_generated: bool,
}

impl Default for CheckpointOptions {
    fn default() -> Self {
        CheckpointOptions {
            description: None,
            priority: CheckpointPriority::Medium,
            tags: Vec::new(),
            is_auto_generated: false,
        }
    }
}

// ============================================================================
// SESSION MANAGER
// ============================================================================

pub struct SessionManager {
    context: CoreContext,
    codec: StateCodec,
    vault: KeyVault,
    sync: Option<SyncEngine>,
}

impl SessionManager {
    pub fn new(context: CoreContext) -> Self {
        let codec = StateCodec::from_config(&context.config);
        let vault = KeyVault::new(context.clone());
        SessionManager {
            context,
            codec,
            vault,
            sync: None,
        }
    }

    /// Attach a sync engine; subsequent mutations publish events.
    pub fn with_sync(mut self, sync: SyncEngine) -> Self {
        self.sync = Some(sync);
        self
    }

    // ------------------------------------------------------------------
    // Write path
    // ------------------------------------------------------------------

    /// Persist a new session at version 1.
    pub fn create_session(
        &self,
        user_id: &str,
        workspace_id: &str,
        name: &str,
        state: &WorkspaceState,
        credentials: Option<&KeyCredentials>,
    ) -> Result<Session> {
        let (bytes, checksum, key_ref) = self.encode_state(user_id, state, credentials)?;
        let now = Utc::now();

        let session = Session {
            id: crypto::random_id(Some("sess")),
            user_id: user_id.to_string(),
            workspace_id: workspace_id.to_string(),
            name: name.to_string(),
            workspace_state: bytes,
            state_checksum: checksum,
            version: 1,
            last_saved_at: now,
            expires_at: now + Duration::days(DEFAULT_SESSION_TTL_DAYS),
            encrypted_key_ref: key_ref,
            is_active: true,
        };
        self.context.store.put_session(session.clone())?;
        info!(session_id = %session.id, user_id, "session created");

        self.announce(
            SyncEventType::SessionCreated,
            &session.id,
            user_id,
            Some(workspace_id),
            serde_json::json!({"name": name}),
        )?;
        Ok(session)
    }

    /// Persist a new state over an existing session, bumping the
    /// version under an optimistic guard.
    pub fn save_session_state(
        &self,
        session_id: &str,
        state: &WorkspaceState,
        credentials: Option<&KeyCredentials>,
    ) -> Result<Session> {
        let session = self.load_session(session_id)?;
        let (bytes, checksum, key_ref) =
            self.encode_state(&session.user_id, state, credentials)?;

        let updated = self.context.store.update_session(
            session_id,
            SessionPatch {
                workspace_state: Some(bytes),
                state_checksum: Some(checksum),
                version: Some(session.version + 1),
                last_saved_at: Some(Utc::now()),
                encrypted_key_ref: Some(key_ref),
                expected_version: Some(session.version),
                ..SessionPatch::default()
            },
        )?;
        debug!(session_id, version = updated.version, "session state saved");

        self.announce(
            SyncEventType::SessionUpdated,
            session_id,
            &updated.user_id,
            Some(&updated.workspace_id),
            serde_json::json!({"version": updated.version}),
        )?;
        Ok(updated)
    }

    // ------------------------------------------------------------------
    // Read path
    // ------------------------------------------------------------------

    /// Decode a session's persisted state, verifying the checksum first.
    ///
    /// On any codec failure the error is returned untouched so the
    /// caller can hand the session to the recovery engine.
    pub fn load_session_state(
        &self,
        session_id: &str,
        password: Option<&str>,
    ) -> Result<WorkspaceState> {
        let session = self.load_session(session_id)?;
        let key = self.resolve_key(&session, password)?;
        let key_ref = key.as_ref().map(|k| &**k);
        Ok(self
            .codec
            .deserialize(&session.workspace_state, &session.state_checksum, key_ref)?)
    }

    /// Fetch the raw session row.
    pub fn load_session(&self, session_id: &str) -> Result<Session> {
        self.context
            .store
            .get_session(session_id)?
            .ok_or_else(|| SessionError::SessionNotFound(session_id.to_string()))
    }

    // ------------------------------------------------------------------
    // Checkpoints
    // ------------------------------------------------------------------

    /// Snapshot a session's current persisted bytes as an immutable
    /// checkpoint. `(session_id, name)` must be unique.
    pub fn create_checkpoint(
        &self,
        session_id: &str,
        name: &str,
        options: &CheckpointOptions,
        password: Option<&str>,
    ) -> Result<Checkpoint> {
        let session = self.load_session(session_id)?;

        // Best-effort uncompressed size; falls back to the stored size
        // when the payload cannot be opened here
        let key = self.resolve_key(&session, password).ok().flatten();
        let key_ref = key.as_ref().map(|k| &**k);
        let uncompressed_size = self
            .codec
            .plaintext_bytes(&session.workspace_state, key_ref)
            .map(|plain| plain.len() as u64)
            .unwrap_or(session.workspace_state.len() as u64);

        let checkpoint = Checkpoint {
            id: crypto::random_id(Some("ckpt")),
            session_id: session_id.to_string(),
            name: name.to_string(),
            description: options.description.clone(),
            compressed_size: session.workspace_state.len() as u64,
            uncompressed_size,
            state_checksum: session.state_checksum.clone(),
            workspace_state: session.workspace_state.clone(),
            priority: options.priority,
            tags: options.tags.clone(),
            is_auto_generated: options.is_auto_generated,
            created_at: Utc::now(),
            encrypted_key_ref: session.encrypted_key_ref.clone(),
            metadata: BTreeMap::new(),
        };
        self.context.store.put_checkpoint(checkpoint.clone())?;
        info!(checkpoint_id = %checkpoint.id, session_id, "checkpoint created");

        self.announce(
            SyncEventType::CheckpointCreated,
            session_id,
            &session.user_id,
            Some(&session.workspace_id),
            serde_json::json!({"checkpoint_id": checkpoint.id, "name": name}),
        )?;
        Ok(checkpoint)
    }

    /// Delete a checkpoint and announce it.
    pub fn delete_checkpoint(&self, checkpoint_id: &str) -> Result<()> {
        let checkpoint = self
            .context
            .store
            .get_checkpoint(checkpoint_id)?
            .ok_or_else(|| SessionError::CheckpointNotFound(checkpoint_id.to_string()))?;
        let session = self.load_session(&checkpoint.session_id)?;

        self.context.store.delete_checkpoint(checkpoint_id)?;
        self.announce(
            SyncEventType::CheckpointDeleted,
            &checkpoint.session_id,
            &session.user_id,
            Some(&session.workspace_id),
            serde_json::json!({"checkpoint_id": checkpoint_id}),
        )?;
        Ok(())
    }

    /// Keep only the newest `keep` auto-generated checkpoints of a
    /// session; returns how many were pruned. Named (manual)
    /// checkpoints are never touched.
    pub fn prune_auto_checkpoints(&self, session_id: &str, keep: usize) -> Result<usize> {
        let page = self.context.store.list_checkpoints(&CheckpointFilter {
            session_id: Some(session_id.to_string()),
            auto_generated: Some(true),
            ..CheckpointFilter::default()
        })?;

        // Listing is newest-first; everything past `keep` goes
        let mut pruned = 0usize;
        for stale in page.items.iter().skip(keep) {
            self.delete_checkpoint(&stale.id)?;
            pruned += 1;
        }
        if pruned > 0 {
            debug!(session_id, pruned, "pruned auto checkpoints");
        }
        Ok(pruned)
    }

    // ------------------------------------------------------------------
    // Expiry sweep
    // ------------------------------------------------------------------

    /// Delete sessions whose `expires_at` has passed; returns the ids
    /// removed. Each deletion is announced.
    pub fn cleanup_expired_sessions(&self) -> Result<Vec<String>> {
        let now = Utc::now();
        let page = self
            .context
            .store
            .list_sessions(&SessionFilter::default())?;

        let mut removed = Vec::new();
        for session in page.items {
            if session.expires_at >= now {
                continue;
            }
            self.context.store.delete_session(&session.id)?;
            self.announce(
                SyncEventType::SessionDeleted,
                &session.id,
                &session.user_id,
                Some(&session.workspace_id),
                serde_json::json!({"reason": "expired"}),
            )?;
            removed.push(session.id);
        }
        if !removed.is_empty() {
            info!(count = removed.len(), "expired sessions removed");
        }
        Ok(removed)
    }

    // ------------------------------------------------------------------
    // Internals
    // ------------------------------------------------------------------

    fn encode_state(
        &self,
        user_id: &str,
        state: &WorkspaceState,
        credentials: Option<&KeyCredentials>,
    ) -> Result<(Vec<u8>, String, Option<String>)> {
        match credentials {
            Some(credentials) if self.context.config.encryption_enabled => {
                let key =
                    self.vault
                        .session_key(user_id, &credentials.key_id, &credentials.password)?;
                let serialized = self.codec.serialize(state, Some(&key))?;
                Ok((
                    serialized.bytes,
                    serialized.checksum,
                    Some(credentials.key_id.clone()),
                ))
            }
            _ => {
                let serialized = self.codec.serialize(state, None)?;
                Ok((serialized.bytes, serialized.checksum, None))
            }
        }
    }

    fn resolve_key(
        &self,
        session: &Session,
        password: Option<&str>,
    ) -> Result<Option<Zeroizing<[u8; KEY_LEN]>>> {
        match &session.encrypted_key_ref {
            None => Ok(None),
            Some(key_id) => {
                let password = password
                    .ok_or_else(|| SessionError::PasswordRequired(session.id.clone()))?;
                Ok(Some(self.vault.session_key(
                    &session.user_id,
                    key_id,
                    password,
                )?))
            }
        }
    }

    fn announce(
        &self,
        event_type: SyncEventType,
        session_id: &str,
        user_id: &str,
        workspace_id: Option<&str>,
        data: Value,
    ) -> Result<()> {
        if let Some(sync) = &self.sync {
            sync.publish_event(PublishRequest {
                event_type,
                session_id: session_id.to_string(),
                user_id: user_id.to_string(),
                workspace_id: workspace_id.map(str::to_string),
                data,
            })?;
        }
        Ok(())
    }
}

// ============================================================================
// TESTS
// ============================================================================
