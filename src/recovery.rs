//! # Recovery Engine
//!
//! Layered restoration for sessions whose persisted state no longer
//! validates. The ladder is evaluated strictly in order:
//!
//! 1. **Direct** — the session row validates and decodes; return `full`.
//! 2. **Checkpoint** — an explicitly named checkpoint (or the newest one
//!    when preferred) validates; its bytes are written back over the
//!    session row with a version bump; return `checkpoint`.
//! 3. **Partial** — the corrupt payload is scanned for a balanced JSON
//!    object that looks workspace-shaped, items missing their identity
//!    field are dropped, missing sequences are filled empty, and the
//!    repaired state is written back; return `partial` with warnings.
//! 4. `failed` with every error accumulated along the way.
//!
//! Recoverable failures (checksum, structure, parsing) never
//! short-circuit the ladder; only a validation that says the data cannot
//! be recovered fails fast.
//!
//! The same module owns merge-conflict resolution across divergent
//! copies of a session state, used when concurrent writers or recovery
//! itself produce competing candidates.

use chrono::{DateTime, Duration, Utc};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::time::Instant;
use thiserror::Error;
use tracing::{debug, info, warn};
use zeroize::Zeroizing;

use crate::codec::{CodecError, StateCodec};
use crate::context::CoreContext;
use crate::crypto::{self, KEY_LEN};
use crate::key_vault::{KeyVault, KeyVaultError};
use crate::store::{CheckpointFilter, SessionFilter, SessionPatch, StoreError};
use crate::workspace::{deep_merge_preserving, WorkspaceState};

// ============================================================================
// CONSTANTS
// ============================================================================

/// Sessions unsaved for longer than this are counted as likely corrupted
/// in the statistics estimate
const STALE_SESSION_DAYS: i64 = 7;

/// Error-message keywords that mark a failure as recoverable
const RECOVERABLE_KEYWORDS: &[&str] = &[
    "checksum",
    "deserialization",
    "decryption",
    "parsing",
    "structure",
    "corrupted",
];

/// Timestamp skew beyond which two items with the same key conflict
const CONFLICT_TIMESTAMP_SKEW_SECS: i64 = 60;

// ============================================================================
// ERROR TYPES
// ============================================================================

#[derive(Debug, Error)]
pub enum RecoveryError {
    #[error("session not found: {0}")]
    SessionNotFound(String),

    #[error("no candidate states supplied")]
    NoCandidates,

    #[error(transparent)]
    Store(#[from] StoreError),

    #[error(transparent)]
    Codec(#[from] CodecError),

    #[error(transparent)]
    Vault(#[from] KeyVaultError),
}

pub type Result<T> = std::result::Result<T, RecoveryError>;

// ============================================================================
// REPORT TYPES
// ============================================================================

/// Which rung of the ladder produced the result
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RecoveryMethod {
    Full,
    Checkpoint,
    Partial,
    Failed,
}

/// Options steering the ladder
#[derive(Debug, Clone)]
pub struct RestoreOptions {
    /// Keep the original metadata map on repaired states
    pub preserve_metadata: bool,
    /// Checkpoint id to fall back to
    pub fallback_to_checkpoint: Option<String>,
    /// Drop undecodable items instead of failing the repair
    pub skip_corrupted_data: bool,
    /// Consult the newest checkpoint even without an explicit id
    pub prefer_latest_checkpoint: bool,
    /// Partial repair fails when it would drop more than this share of items
    pub max_data_loss_threshold_percent: u8,
    /// Allow the partial rung at all
    pub fallback_to_partial: bool,
}

impl Default for RestoreOptions {
    fn default() -> Self {
        RestoreOptions {
            preserve_metadata: true,
            fallback_to_checkpoint: None,
            skip_corrupted_data: true,
            prefer_latest_checkpoint: false,
            max_data_loss_threshold_percent: 10,
            fallback_to_partial: true,
        }
    }
}

/// Outcome of validating persisted bytes against their checksum
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ValidationReport {
    pub is_valid: bool,
    pub checksum_match: bool,
    /// Whether the ladder is worth continuing
    pub can_recover: bool,
    pub errors: Vec<String>,
    pub warnings: Vec<String>,
}

/// Result of a [`RecoveryEngine::restore`] call
#[derive(Debug, Clone)]
pub struct RestoreReport {
    pub success: bool,
    pub state: Option<WorkspaceState>,
    pub session: Option<crate::store::Session>,
    pub method: RecoveryMethod,
    pub validation: ValidationReport,
    pub errors: Vec<String>,
    pub warnings: Vec<String>,
}

/// Aggregate health estimate across the store
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RecoveryStatistics {
    pub total_sessions: usize,
    pub corrupted_sessions: usize,
    pub recoverable_sessions: usize,
    pub unrecoverable_sessions: usize,
    pub available_checkpoints: usize,
    pub avg_recovery_time_ms: Option<f64>,
}

// ============================================================================
// MERGE TYPES
// ============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MergeStrategy {
    Latest,
    MostComplete,
    Manual,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CandidateSource {
    Primary,
    Checkpoint,
    Recovered,
}

/// One divergent copy of a session state
#[derive(Debug, Clone)]
pub struct MergeCandidate {
    pub workspace_state: WorkspaceState,
    pub last_saved_at: DateTime<Utc>,
    pub source: CandidateSource,
}

/// A divergence kept for external resolution; the base value wins in the
/// merged output
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MergeConflict {
    /// Sequence-qualified key, e.g. `terminalState.1`
    pub field: String,
    pub base_value: Value,
    pub other_value: Value,
}

/// Result of [`RecoveryEngine::resolve_merge_conflicts`]
#[derive(Debug, Clone)]
pub struct MergeReport {
    pub resolved_state: WorkspaceState,
    pub conflicts: Vec<MergeConflict>,
    pub warnings: Vec<String>,
}

// ============================================================================
// RECOVERY ENGINE
// ============================================================================

pub struct RecoveryEngine {
    context: CoreContext,
    codec: StateCodec,
    vault: KeyVault,
    /// (restore count, total milliseconds) for the statistics average
    timing: Mutex<(u64, f64)>,
}

impl RecoveryEngine {
    pub fn new(context: CoreContext) -> Self {
        let codec = StateCodec::from_config(&context.config);
        let vault = KeyVault::new(context.clone());
        RecoveryEngine {
            context,
            codec,
            vault,
            timing: Mutex::new((0, 0.0)),
        }
    }

    // ------------------------------------------------------------------
    // The ladder
    // ------------------------------------------------------------------

    /// Restore a session through the ladder.
    pub fn restore(
        &self,
        session_id: &str,
        password: Option<&str>,
        options: &RestoreOptions,
    ) -> Result<RestoreReport> {
        let started = Instant::now();
        let report = self.restore_inner(session_id, password, options);
        if report.is_ok() {
            let mut timing = self.timing.lock();
            timing.0 += 1;
            timing.1 += started.elapsed().as_secs_f64() * 1000.0;
        }
        report
    }

    fn restore_inner(
        &self,
        session_id: &str,
        password: Option<&str>,
        options: &RestoreOptions,
    ) -> Result<RestoreReport> {
        let session = self
            .context
            .store
            .get_session(session_id)?
            .ok_or_else(|| RecoveryError::SessionNotFound(session_id.to_string()))?;

        let mut errors = Vec::new();
        let mut warnings = Vec::new();

        // Resolve the session key once; a failed unwrap is itself a
        // recoverable condition for the ladder
        let key = match self.resolve_key(&session, password) {
            Ok(key) => key,
            Err(e) => {
                errors.push(e.to_string());
                None
            }
        };
        let key_ref = key.as_ref().map(|k| &**k);

        // Rung 1: direct
        let validation = self.validate(&session.workspace_state, &session.state_checksum, key_ref);
        if validation.is_valid {
            let state = self
                .codec
                .deserialize(&session.workspace_state, &session.state_checksum, key_ref)?;
            debug!(session_id, "restored directly");
            return Ok(RestoreReport {
                success: true,
                state: Some(state),
                session: Some(session),
                method: RecoveryMethod::Full,
                validation,
                errors,
                warnings,
            });
        }
        errors.extend(validation.errors.iter().cloned());
        if !validation.can_recover {
            warn!(session_id, "validation marked session unrecoverable");
            return Ok(RestoreReport {
                success: false,
                state: None,
                session: Some(session),
                method: RecoveryMethod::Failed,
                validation,
                errors,
                warnings,
            });
        }

        // Rung 2: checkpoint
        match self.try_checkpoint_rung(&session, key_ref, options, &mut errors, &mut warnings)? {
            Some((state, updated)) => {
                info!(session_id, "restored from checkpoint");
                return Ok(RestoreReport {
                    success: true,
                    state: Some(state),
                    session: Some(updated),
                    method: RecoveryMethod::Checkpoint,
                    validation,
                    errors,
                    warnings,
                });
            }
            None => {}
        }

        // Rung 3: partial
        if options.fallback_to_partial {
            match self.try_partial_rung(&session, key_ref, options, &mut errors, &mut warnings)? {
                Some((state, updated)) => {
                    info!(session_id, "restored partially");
                    return Ok(RestoreReport {
                        success: true,
                        state: Some(state),
                        session: Some(updated),
                        method: RecoveryMethod::Partial,
                        validation,
                        errors,
                        warnings,
                    });
                }
                None => {}
            }
        }

        warn!(session_id, ?errors, "all recovery rungs exhausted");
        Ok(RestoreReport {
            success: false,
            state: None,
            session: Some(session),
            method: RecoveryMethod::Failed,
            validation,
            errors,
            warnings,
        })
    }

    fn try_checkpoint_rung(
        &self,
        session: &crate::store::Session,
        key: Option<&[u8; KEY_LEN]>,
        options: &RestoreOptions,
        errors: &mut Vec<String>,
        warnings: &mut Vec<String>,
    ) -> Result<Option<(WorkspaceState, crate::store::Session)>> {
        let checkpoint = if let Some(checkpoint_id) = &options.fallback_to_checkpoint {
            self.context.store.get_checkpoint(checkpoint_id)?
        } else if options.prefer_latest_checkpoint {
            let page = self.context.store.list_checkpoints(&CheckpointFilter {
                session_id: Some(session.id.clone()),
                limit: Some(1),
                ..CheckpointFilter::default()
            })?;
            page.items.into_iter().next()
        } else {
            None
        };

        let checkpoint = match checkpoint {
            Some(c) => c,
            None => {
                if options.fallback_to_checkpoint.is_some() {
                    errors.push("requested fallback checkpoint not found".to_string());
                }
                return Ok(None);
            }
        };

        let validation =
            self.validate(&checkpoint.workspace_state, &checkpoint.state_checksum, key);
        if !validation.is_valid {
            errors.push(format!(
                "checkpoint '{}' failed validation: {}",
                checkpoint.name,
                validation.errors.join("; ")
            ));
            return Ok(None);
        }

        let state = self.codec.deserialize(
            &checkpoint.workspace_state,
            &checkpoint.state_checksum,
            key,
        )?;

        // Write the checkpoint bytes back over the broken session row
        let updated = self.context.store.update_session(
            &session.id,
            SessionPatch {
                workspace_state: Some(checkpoint.workspace_state.clone()),
                state_checksum: Some(checkpoint.state_checksum.clone()),
                version: Some(session.version + 1),
                last_saved_at: Some(Utc::now()),
                ..SessionPatch::default()
            },
        )?;
        self.codec.forget_base(&session.id);
        warnings.push(format!(
            "session restored from checkpoint '{}'",
            checkpoint.name
        ));
        Ok(Some((state, updated)))
    }

    fn try_partial_rung(
        &self,
        session: &crate::store::Session,
        key: Option<&[u8; KEY_LEN]>,
        options: &RestoreOptions,
        errors: &mut Vec<String>,
        warnings: &mut Vec<String>,
    ) -> Result<Option<(WorkspaceState, crate::store::Session)>> {
        // Best-effort plaintext: decryption or decompression may fail on
        // corrupt bytes, in which case the raw payload is scanned as-is
        let plaintext = self
            .codec
            .plaintext_bytes(&session.workspace_state, key)
            .unwrap_or_else(|_| session.workspace_state.clone());

        let candidate = match extract_state_candidate(&plaintext) {
            Some(value) => value,
            None => {
                errors.push("no workspace-shaped object found in corrupt payload".to_string());
                return Ok(None);
            }
        };

        let (mut state, dropped, total) = repair_state(candidate, options.skip_corrupted_data);

        if total > 0 {
            let loss_percent = dropped * 100 / total;
            if loss_percent > options.max_data_loss_threshold_percent as usize {
                errors.push(format!(
                    "partial repair would lose {loss_percent}% of items, above the {}% threshold",
                    options.max_data_loss_threshold_percent
                ));
                return Ok(None);
            }
            if dropped > 0 {
                warnings.push(format!(
                    "dropped {dropped} of {total} items lacking identity fields"
                ));
            }
        }

        if !options.preserve_metadata {
            state.metadata.clear();
        }
        state.touch(Utc::now());
        warnings.push("session repaired from corrupt payload; some data may be missing".to_string());

        // Re-persist the repaired state under the same key when available
        let serialized = self.codec.serialize(&state, key)?;
        let updated = self.context.store.update_session(
            &session.id,
            SessionPatch {
                workspace_state: Some(serialized.bytes),
                state_checksum: Some(serialized.checksum),
                version: Some(session.version + 1),
                last_saved_at: Some(Utc::now()),
                ..SessionPatch::default()
            },
        )?;
        self.codec.forget_base(&session.id);
        Ok(Some((state, updated)))
    }

    // ------------------------------------------------------------------
    // Validation
    // ------------------------------------------------------------------

    /// Validate persisted bytes against their checksum and decode-ability.
    ///
    /// `can_recover` is decided by the failure's wording: corruption-class
    /// failures (checksum, parsing, structure, decryption) keep the
    /// ladder alive; anything else — store faults, permissions — does not.
    pub fn validate(
        &self,
        bytes: &[u8],
        expected_checksum: &str,
        key: Option<&[u8; KEY_LEN]>,
    ) -> ValidationReport {
        let mut report = ValidationReport::default();

        report.checksum_match = crypto::verify_hash(bytes, expected_checksum);
        if !report.checksum_match {
            report
                .errors
                .push("checksum mismatch between stored digest and payload".to_string());
        }

        match self.codec.decode_unverified(bytes, key) {
            Ok(_) if report.checksum_match => {
                report.is_valid = true;
                report.can_recover = true;
            }
            Ok(_) => {
                // Decodes cleanly but the digest disagrees; recoverable
                report.can_recover = true;
            }
            Err(e) => {
                report.errors.push(e.to_string());
                report.can_recover = report
                    .errors
                    .iter()
                    .any(|message| is_recoverable_message(message));
            }
        }

        report
    }

    // ------------------------------------------------------------------
    // Merge resolution
    // ------------------------------------------------------------------

    /// Reconcile divergent copies of a session state.
    pub fn resolve_merge_conflicts(
        &self,
        mut candidates: Vec<MergeCandidate>,
        strategy: MergeStrategy,
    ) -> Result<MergeReport> {
        if candidates.is_empty() {
            return Err(RecoveryError::NoCandidates);
        }
        if candidates.len() == 1 {
            return Ok(MergeReport {
                resolved_state: candidates.remove(0).workspace_state,
                conflicts: Vec::new(),
                warnings: vec!["single candidate; nothing to merge".to_string()],
            });
        }

        match strategy {
            MergeStrategy::Latest => {
                candidates.sort_by(|a, b| b.last_saved_at.cmp(&a.last_saved_at));
            }
            MergeStrategy::MostComplete => {
                candidates.sort_by(|a, b| {
                    completeness_score(&b.workspace_state, b.last_saved_at)
                        .cmp(&completeness_score(&a.workspace_state, a.last_saved_at))
                });
            }
            MergeStrategy::Manual => {
                candidates.sort_by(|a, b| b.last_saved_at.cmp(&a.last_saved_at));
            }
        }

        let base = candidates.remove(0);
        let mut resolved = base.workspace_state.clone();
        let mut conflicts = Vec::new();
        let mut warnings = Vec::new();

        for other in &candidates {
            if strategy == MergeStrategy::Manual {
                record_all_diffs(&resolved, &other.workspace_state, &mut conflicts);
                continue;
            }
            merge_states(
                &mut resolved,
                &other.workspace_state,
                &mut conflicts,
                &mut warnings,
            );
        }

        if strategy == MergeStrategy::Manual && !conflicts.is_empty() {
            warnings.push(format!(
                "{} difference(s) recorded for manual resolution",
                conflicts.len()
            ));
        }

        debug!(
            strategy = ?strategy,
            conflicts = conflicts.len(),
            "merge resolution complete"
        );
        Ok(MergeReport {
            resolved_state: resolved,
            conflicts,
            warnings,
        })
    }

    // ------------------------------------------------------------------
    // Statistics
    // ------------------------------------------------------------------

    /// Health estimate over the whole store. "Corrupted" is estimated
    /// from sessions unsaved for more than 7 days.
    pub fn get_recovery_statistics(&self) -> Result<RecoveryStatistics> {
        let sessions = self
            .context
            .store
            .list_sessions(&SessionFilter::default())?;
        let now = Utc::now();

        let mut corrupted = 0;
        let mut recoverable = 0;
        for session in &sessions.items {
            let stale = now.signed_duration_since(session.last_saved_at)
                > Duration::days(STALE_SESSION_DAYS);
            if !stale {
                continue;
            }
            corrupted += 1;
            let checkpoints = self.context.store.count_checkpoints(&CheckpointFilter {
                session_id: Some(session.id.clone()),
                ..CheckpointFilter::default()
            })?;
            if checkpoints > 0 {
                recoverable += 1;
            }
        }

        let available_checkpoints = self
            .context
            .store
            .count_checkpoints(&CheckpointFilter::default())?;

        let timing = self.timing.lock();
        let avg_recovery_time_ms = if timing.0 > 0 {
            Some(timing.1 / timing.0 as f64)
        } else {
            None
        };

        Ok(RecoveryStatistics {
            total_sessions: sessions.total,
            corrupted_sessions: corrupted,
            recoverable_sessions: recoverable,
            unrecoverable_sessions: corrupted - recoverable,
            available_checkpoints,
            avg_recovery_time_ms,
        })
    }

    // ------------------------------------------------------------------
    // Internals
    // ------------------------------------------------------------------

    fn resolve_key(
        &self,
        session: &crate::store::Session,
        password: Option<&str>,
    ) -> Result<Option<Zeroizing<[u8; KEY_LEN]>>> {
        match (&session.encrypted_key_ref, password) {
            (Some(key_id), Some(password)) => {
                let key = self
                    .vault
                    .session_key(&session.user_id, key_id, password)?;
                Ok(Some(key))
            }
            _ => Ok(None),
        }
    }
}

fn is_recoverable_message(message: &str) -> bool {
    let lower = message.to_lowercase();
    RECOVERABLE_KEYWORDS
        .iter()
        .any(|keyword| lower.contains(keyword))
}

// ============================================================================
// PARTIAL EXTRACTION
// ============================================================================

/// Scan corrupt bytes for balanced `{...}` candidates and return the
/// first that decodes to a workspace-shaped object.
fn extract_state_candidate(bytes: &[u8]) -> Option<Value> {
    let text = String::from_utf8_lossy(bytes);
    let chars: Vec<char> = text.chars().collect();

    let mut index = 0;
    while index < chars.len() {
        if chars[index] != '{' {
            index += 1;
            continue;
        }
        if let Some(end) = balanced_object_end(&chars, index) {
            let candidate: String = chars[index..=end].iter().collect();
            if let Ok(value) = serde_json::from_str::<Value>(&candidate) {
                if is_workspace_shaped(&value) {
                    return Some(value);
                }
            }
        }
        index += 1;
    }
    None
}

/// Index of the `}` closing the object that opens at `start`, honoring
/// string literals and escapes
fn balanced_object_end(chars: &[char], start: usize) -> Option<usize> {
    let mut depth = 0usize;
    let mut in_string = false;
    let mut escaped = false;

    for (offset, &c) in chars[start..].iter().enumerate() {
        if escaped {
            escaped = false;
            continue;
        }
        match c {
            '\\' if in_string => escaped = true,
            '"' => in_string = !in_string,
            '{' if !in_string => depth += 1,
            '}' if !in_string => {
                depth = depth.saturating_sub(1);
                if depth == 0 {
                    return Some(start + offset);
                }
            }
            _ => {}
        }
    }
    None
}

/// The four required sequences mark an object as a workspace state
fn is_workspace_shaped(value: &Value) -> bool {
    let object = match value.as_object() {
        Some(o) => o,
        None => return false,
    };
    ["terminalState", "browserTabs", "aiConversations", "openFiles"]
        .iter()
        .all(|key| object.get(*key).map(Value::is_array).unwrap_or(false))
}

/// Rebuild a typed state from a scavenged JSON object, dropping items
/// that lack their identity field. Returns (state, dropped, total).
fn repair_state(value: Value, skip_corrupted: bool) -> (WorkspaceState, usize, usize) {
    let mut state = WorkspaceState::default();
    let mut dropped = 0usize;
    let mut total = 0usize;

    let object = match value {
        Value::Object(o) => o,
        _ => return (state, 0, 0),
    };

    for (sequence, identity) in [
        ("terminalState", "id"),
        ("browserTabs", "url"),
        ("aiConversations", "id"),
        ("openFiles", "id"),
    ] {
        let items = object
            .get(sequence)
            .and_then(Value::as_array)
            .cloned()
            .unwrap_or_default();
        total += items.len();

        let kept: Vec<Value> = items
            .into_iter()
            .filter(|item| {
                let has_identity = item
                    .get(identity)
                    .map(|v| v.is_string() && !v.as_str().unwrap_or("").is_empty())
                    .unwrap_or(false);
                if !has_identity && skip_corrupted {
                    dropped += 1;
                }
                has_identity || !skip_corrupted
            })
            .collect();

        // Items that still fail typed decoding are dropped individually
        match sequence {
            "terminalState" => {
                for item in kept {
                    match serde_json::from_value(item) {
                        Ok(entry) => state.terminal_state.push(entry),
                        Err(_) => dropped += 1,
                    }
                }
            }
            "browserTabs" => {
                for item in kept {
                    match serde_json::from_value(item) {
                        Ok(tab) => state.browser_tabs.push(tab),
                        Err(_) => dropped += 1,
                    }
                }
            }
            "aiConversations" => {
                for item in kept {
                    match serde_json::from_value(item) {
                        Ok(conversation) => state.ai_conversations.push(conversation),
                        Err(_) => dropped += 1,
                    }
                }
            }
            _ => {
                for item in kept {
                    match serde_json::from_value(item) {
                        Ok(file) => state.open_files.push(file),
                        Err(_) => dropped += 1,
                    }
                }
            }
        }
    }

    if let Some(Value::Object(config)) = object.get("config") {
        state.config = config.clone().into_iter().collect();
    }
    if let Some(Value::Object(metadata)) = object.get("metadata") {
        state.metadata = metadata.clone().into_iter().collect();
    }

    (state, dropped, total)
}

// ============================================================================
// MERGE INTERNALS
// ============================================================================

/// Completeness weighting used by the `most_complete` strategy
fn completeness_score(state: &WorkspaceState, _saved_at: DateTime<Utc>) -> i64 {
    let now = Utc::now();
    let mut score = 0i64;

    score += 10 * state.terminal_state.len() as i64;
    if state.terminal_state.iter().any(|t| t.is_active) {
        score += 50;
    }
    score += 5 * state.browser_tabs.len() as i64;
    if state.browser_tabs.iter().any(|t| t.is_active) {
        score += 30;
    }
    score += 15 * state.ai_conversations.len() as i64;
    if state.ai_conversations.iter().any(|c| c.is_recent(now)) {
        score += 10;
    }
    score += 8 * state.open_files.len() as i64;
    if state.open_files.iter().any(|f| f.has_unsaved_changes) {
        score += 25;
    }
    score += 3 * state.config.len() as i64;
    score += 2 * state.metadata.len() as i64;

    score
}

/// Whether two same-keyed items diverge enough to conflict
fn items_conflict(
    base_ts: Option<DateTime<Utc>>,
    other_ts: Option<DateTime<Utc>>,
    base_active: bool,
    other_active: bool,
    content_differs: bool,
) -> bool {
    if base_active != other_active {
        return true;
    }
    if content_differs {
        return true;
    }
    match (base_ts, other_ts) {
        (Some(a), Some(b)) => {
            (a - b).num_seconds().abs() > CONFLICT_TIMESTAMP_SKEW_SECS
        }
        _ => false,
    }
}

fn merge_states(
    base: &mut WorkspaceState,
    other: &WorkspaceState,
    conflicts: &mut Vec<MergeConflict>,
    warnings: &mut Vec<String>,
) {
    // Terminals, keyed by id
    for entry in &other.terminal_state {
        match base.terminal_state.iter().find(|t| t.id == entry.id) {
            None => base.terminal_state.push(entry.clone()),
            Some(existing) => {
                let content_differs =
                    existing.command != entry.command || existing.output != entry.output;
                if items_conflict(
                    existing.timestamp,
                    entry.timestamp,
                    existing.is_active,
                    entry.is_active,
                    content_differs,
                ) {
                    conflicts.push(MergeConflict {
                        field: format!("terminalState.{}", entry.id),
                        base_value: serde_json::to_value(existing).unwrap_or(Value::Null),
                        other_value: serde_json::to_value(entry).unwrap_or(Value::Null),
                    });
                    warnings.push(format!(
                        "terminal '{}' diverged; kept the base copy",
                        entry.id
                    ));
                }
            }
        }
    }

    // Browser tabs, keyed by (url, title)
    for tab in &other.browser_tabs {
        match base
            .browser_tabs
            .iter()
            .find(|t| t.identity() == tab.identity())
        {
            None => base.browser_tabs.push(tab.clone()),
            Some(existing) => {
                let content_differs = existing.pinned != tab.pinned;
                if items_conflict(
                    existing.timestamp,
                    tab.timestamp,
                    existing.is_active,
                    tab.is_active,
                    content_differs,
                ) {
                    conflicts.push(MergeConflict {
                        field: format!("browserTabs.{}", tab.url),
                        base_value: serde_json::to_value(existing).unwrap_or(Value::Null),
                        other_value: serde_json::to_value(tab).unwrap_or(Value::Null),
                    });
                    warnings.push(format!("tab '{}' diverged; kept the base copy", tab.url));
                }
            }
        }
    }

    // AI conversations, keyed by id
    for conversation in &other.ai_conversations {
        match base
            .ai_conversations
            .iter()
            .find(|c| c.id == conversation.id)
        {
            None => base.ai_conversations.push(conversation.clone()),
            Some(existing) => {
                let content_differs = existing.title != conversation.title
                    || existing.message_count != conversation.message_count;
                if items_conflict(
                    existing.last_message_at,
                    conversation.last_message_at,
                    existing.is_active,
                    conversation.is_active,
                    content_differs,
                ) {
                    conflicts.push(MergeConflict {
                        field: format!("aiConversations.{}", conversation.id),
                        base_value: serde_json::to_value(existing).unwrap_or(Value::Null),
                        other_value: serde_json::to_value(conversation).unwrap_or(Value::Null),
                    });
                    warnings.push(format!(
                        "conversation '{}' diverged; kept the base copy",
                        conversation.id
                    ));
                }
            }
        }
    }

    // Open files, keyed by id
    for file in &other.open_files {
        match base.open_files.iter().find(|f| f.id == file.id) {
            None => base.open_files.push(file.clone()),
            Some(existing) => {
                let content_differs = existing.path != file.path
                    || existing.has_unsaved_changes != file.has_unsaved_changes
                    || existing.cursor_line != file.cursor_line;
                if items_conflict(
                    None,
                    None,
                    existing.is_active,
                    file.is_active,
                    content_differs,
                ) {
                    conflicts.push(MergeConflict {
                        field: format!("openFiles.{}", file.id),
                        base_value: serde_json::to_value(existing).unwrap_or(Value::Null),
                        other_value: serde_json::to_value(file).unwrap_or(Value::Null),
                    });
                    warnings.push(format!("file '{}' diverged; kept the base copy", file.id));
                }
            }
        }
    }

    // Config: recursive deep merge, base wins on scalar collisions
    let base_config = Value::Object(base.config.clone().into_iter().collect());
    let other_config = Value::Object(other.config.clone().into_iter().collect());
    if let Value::Object(merged) = deep_merge_preserving(&base_config, &other_config) {
        base.config = merged.into_iter().collect();
    }

    // Metadata: keep base, add missing keys
    for (key, value) in &other.metadata {
        base.metadata.entry(key.clone()).or_insert(value.clone());
    }
}

/// Manual strategy: record every divergence, change nothing
fn record_all_diffs(
    base: &WorkspaceState,
    other: &WorkspaceState,
    conflicts: &mut Vec<MergeConflict>,
) {
    let base_value = serde_json::to_value(base).unwrap_or(Value::Null);
    let other_value = serde_json::to_value(other).unwrap_or(Value::Null);
    let (base_map, other_map) = match (base_value.as_object(), other_value.as_object()) {
        (Some(a), Some(b)) => (a.clone(), b.clone()),
        _ => return,
    };

    for (field, other_field_value) in other_map {
        let base_field_value = base_map.get(&field).cloned().unwrap_or(Value::Null);
        if base_field_value != other_field_value {
            conflicts.push(MergeConflict {
                field,
                base_value: base_field_value,
                other_value: other_field_value,
            });
        }
    }
}

// ============================================================================
// TESTS
// ============================================================================
