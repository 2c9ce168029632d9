//! End-to-end scenarios across the vault, codec, recovery ladder, and
//! sync engine, driven through the public API the way an embedding
//! service would use it.

use std::collections::BTreeMap;
use std::sync::Arc;

use chrono::{Duration, Utc};
use serde_json::json;

use workspace_vault::codec::StateCodec;
use workspace_vault::config::CoreConfig;
use workspace_vault::context::CoreContext;
use workspace_vault::crypto::{self, CryptoError, MIN_KDF_ITERATIONS};
use workspace_vault::key_vault::{KeyVault, KeyVaultError};
use workspace_vault::password::Strength;
use workspace_vault::recovery::{
    CandidateSource, MergeCandidate, MergeStrategy, RecoveryEngine, RecoveryMethod,
    RestoreOptions,
};
use workspace_vault::rotation::{RotationEngine, RotationRequest, TaskState};
use workspace_vault::sessions::{KeyCredentials, SessionManager};
use workspace_vault::store::{MemoryStore, SessionPatch, StoreAdapter};
use workspace_vault::sync::{PublishRequest, SubscribeRequest, SyncEngine, SyncEventType};
use workspace_vault::workspace::{TerminalEntry, WorkspaceState};
use workspace_vault::analyze_password_strength;

const PASSWORD: &str = "MyStr0ng!P@ssw0rd123";
const WRONG_PASSWORD: &str = "Wr0ngP@ssw0rd123!";

/// Context with the enforced-minimum KDF cost so the suite stays fast
/// while running the production code path.
fn test_context() -> CoreContext {
    let mut config = CoreConfig::default();
    config.kdf_iterations = MIN_KDF_ITERATIONS;
    CoreContext::new(Arc::new(MemoryStore::new()), config)
}

fn terminal(id: &str, command: &str) -> TerminalEntry {
    TerminalEntry {
        id: id.to_string(),
        command: command.to_string(),
        output: None,
        working_directory: None,
        timestamp: None,
        is_active: false,
        extra: BTreeMap::new(),
    }
}

fn sample_state() -> WorkspaceState {
    let mut state = WorkspaceState::new(Utc::now());
    state.terminal_state.push(terminal("t1", "cargo build"));
    state
        .config
        .insert("theme".to_string(), json!("dark"));
    state
}

// ============================================================================
// S1 / S2: key round trip and wrong password
// ============================================================================

#[test]
fn round_trip_under_user_key() {
    let vault = KeyVault::new(test_context());
    let key = vault
        .create_user_key("u1", "laptop", PASSWORD, None, None, None)
        .unwrap();

    let envelope = vault
        .encrypt_with_user_key("u1", &key.key_id, PASSWORD, b"hello")
        .unwrap();
    let plaintext = vault
        .decrypt_with_user_key("u1", &key.key_id, PASSWORD, &envelope)
        .unwrap();
    assert_eq!(plaintext.as_slice(), b"hello");

    let analysis = analyze_password_strength(PASSWORD);
    assert!(analysis.score >= 60, "score was {}", analysis.score);
    assert!(matches!(
        analysis.strength,
        Strength::Good | Strength::Strong | Strength::VeryStrong
    ));
}

#[test]
fn wrong_password_fails_and_leaves_last_used_untouched() {
    let context = test_context();
    let vault = KeyVault::new(context.clone());
    let key = vault
        .create_user_key("u1", "laptop", PASSWORD, None, None, None)
        .unwrap();
    let envelope = vault
        .encrypt_with_user_key("u1", &key.key_id, PASSWORD, b"hello")
        .unwrap();
    let last_used_before = context
        .store
        .get_user_key("u1", &key.key_id)
        .unwrap()
        .unwrap()
        .last_used_at;

    let result = vault.decrypt_with_user_key("u1", &key.key_id, WRONG_PASSWORD, &envelope);
    assert!(matches!(
        result,
        Err(KeyVaultError::Crypto(CryptoError::DecryptionFailed))
    ));

    // The failed attempt must not count as a use
    let last_used_after = context
        .store
        .get_user_key("u1", &key.key_id)
        .unwrap()
        .unwrap()
        .last_used_at;
    assert_eq!(last_used_before, last_used_after);
}

// ============================================================================
// S3: version monotonicity
// ============================================================================

#[test]
fn published_versions_are_gapless() {
    let context = test_context();
    let manager = SessionManager::new(context.clone());
    let session = manager
        .create_session("writer", "ws", "dev", &sample_state(), None)
        .unwrap();
    assert_eq!(session.version, 1);

    let sync = SyncEngine::new(context);
    let versions: Vec<u64> = (0..5)
        .map(|_| {
            sync.publish_event(PublishRequest {
                event_type: SyncEventType::SessionUpdated,
                session_id: session.id.clone(),
                user_id: "writer".to_string(),
                workspace_id: None,
                data: json!({}),
            })
            .unwrap()
            .version
        })
        .collect();
    assert_eq!(versions, vec![2, 3, 4, 5, 6]);
}

// ============================================================================
// S4: partial recovery of a mangled payload
// ============================================================================

#[test]
fn partial_recovery_from_garbage_wrapped_payload() {
    // Compression off so the persisted bytes are scannable JSON
    let mut config = CoreConfig::default();
    config.kdf_iterations = MIN_KDF_ITERATIONS;
    config.compression_enabled = false;
    let context = CoreContext::new(Arc::new(MemoryStore::new()), config);

    let manager = SessionManager::new(context.clone());
    let mut state = sample_state();
    for i in 2..12 {
        state
            .terminal_state
            .push(terminal(&format!("t{i}"), "make"));
    }
    let session = manager
        .create_session("u1", "ws", "dev", &state, None)
        .unwrap();

    // Simulated corruption: random bytes before and after the payload
    let mut mangled = crypto::random_bytes(24);
    mangled.extend_from_slice(&session.workspace_state);
    mangled.extend_from_slice(&crypto::random_bytes(24));
    context
        .store
        .update_session(
            &session.id,
            SessionPatch {
                workspace_state: Some(mangled),
                ..SessionPatch::default()
            },
        )
        .unwrap();

    let engine = RecoveryEngine::new(context.clone());
    let report = engine
        .restore(&session.id, None, &RestoreOptions::default())
        .unwrap();

    assert!(report.success);
    assert_eq!(report.method, RecoveryMethod::Partial);
    assert!(!report.warnings.is_empty());

    let recovered = report.state.unwrap();
    assert_eq!(recovered.terminal_state.len(), 11);

    let row = context.store.get_session(&session.id).unwrap().unwrap();
    assert_eq!(row.version, 2);
}

// ============================================================================
// S5 / S6: merge scenarios
// ============================================================================

#[test]
fn merge_by_latest_unions_disjoint_sequences() {
    let engine = RecoveryEngine::new(test_context());

    let mut a = WorkspaceState::default();
    a.terminal_state.push(terminal("1", "ls"));
    let mut b = WorkspaceState::default();
    b.terminal_state.push(terminal("2", "pwd"));

    let report = engine
        .resolve_merge_conflicts(
            vec![
                MergeCandidate {
                    workspace_state: a,
                    last_saved_at: "2025-01-01T00:00:00Z".parse().unwrap(),
                    source: CandidateSource::Primary,
                },
                MergeCandidate {
                    workspace_state: b,
                    last_saved_at: "2025-01-02T00:00:00Z".parse().unwrap(),
                    source: CandidateSource::Checkpoint,
                },
            ],
            MergeStrategy::Latest,
        )
        .unwrap();

    let ids: Vec<&str> = report
        .resolved_state
        .terminal_state
        .iter()
        .map(|t| t.id.as_str())
        .collect();
    assert_eq!(ids.len(), 2);
    assert!(ids.contains(&"1"));
    assert!(ids.contains(&"2"));
    assert!(report.conflicts.is_empty());
    assert!(report.warnings.is_empty());
}

#[test]
fn merge_detects_diverged_terminal() {
    let engine = RecoveryEngine::new(test_context());

    let mut a_entry = terminal("1", "ls");
    a_entry.is_active = true;
    a_entry.timestamp = Some("2025-01-01T10:00:00Z".parse().unwrap());
    let mut b_entry = terminal("1", "ls -la");
    b_entry.is_active = false;
    b_entry.timestamp = Some("2025-01-01T11:00:00Z".parse().unwrap());

    let mut a = WorkspaceState::default();
    a.terminal_state.push(a_entry);
    let mut b = WorkspaceState::default();
    b.terminal_state.push(b_entry);

    let report = engine
        .resolve_merge_conflicts(
            vec![
                MergeCandidate {
                    workspace_state: a,
                    last_saved_at: "2025-01-02T00:00:00Z".parse().unwrap(),
                    source: CandidateSource::Primary,
                },
                MergeCandidate {
                    workspace_state: b,
                    last_saved_at: "2025-01-01T00:00:00Z".parse().unwrap(),
                    source: CandidateSource::Recovered,
                },
            ],
            MergeStrategy::Latest,
        )
        .unwrap();

    // One terminal in the output, kept from the base
    assert_eq!(report.resolved_state.terminal_state.len(), 1);
    assert_eq!(report.resolved_state.terminal_state[0].command, "ls");
    assert_eq!(report.conflicts.len(), 1);
    assert_eq!(report.conflicts[0].field, "terminalState.1");
}

#[test]
fn single_candidate_passes_through_with_one_warning() {
    let engine = RecoveryEngine::new(test_context());
    let state = sample_state();
    let report = engine
        .resolve_merge_conflicts(
            vec![MergeCandidate {
                workspace_state: state.clone(),
                last_saved_at: Utc::now(),
                source: CandidateSource::Primary,
            }],
            MergeStrategy::Latest,
        )
        .unwrap();
    assert_eq!(report.resolved_state, state);
    assert_eq!(report.warnings.len(), 1);
}

// ============================================================================
// Full write -> corrupt -> checkpoint restore cycle
// ============================================================================

#[test]
fn checkpoint_restores_encrypted_session() {
    let context = test_context();
    let vault = KeyVault::new(context.clone());
    let key = vault
        .create_user_key("u1", "main", PASSWORD, None, None, None)
        .unwrap();
    let credentials = KeyCredentials {
        key_id: key.key_id.clone(),
        password: PASSWORD.to_string(),
    };

    let manager = SessionManager::new(context.clone());
    let state = sample_state();
    let session = manager
        .create_session("u1", "ws", "dev", &state, Some(&credentials))
        .unwrap();
    let checkpoint = manager
        .create_checkpoint(
            &session.id,
            "good",
            &Default::default(),
            Some(PASSWORD),
        )
        .unwrap();

    // Destroy the session payload entirely
    context
        .store
        .update_session(
            &session.id,
            SessionPatch {
                workspace_state: Some(b"\x00\x01\x02 total loss".to_vec()),
                ..SessionPatch::default()
            },
        )
        .unwrap();

    let engine = RecoveryEngine::new(context.clone());
    let report = engine
        .restore(
            &session.id,
            Some(PASSWORD),
            &RestoreOptions {
                fallback_to_checkpoint: Some(checkpoint.id.clone()),
                ..RestoreOptions::default()
            },
        )
        .unwrap();

    assert!(report.success);
    assert_eq!(report.method, RecoveryMethod::Checkpoint);
    assert_eq!(report.state.unwrap(), state);

    // The session row is healthy again and readable through the manager
    let reloaded = manager
        .load_session_state(&session.id, Some(PASSWORD))
        .unwrap();
    assert_eq!(reloaded, state);
}

// ============================================================================
// Rotation over live data
// ============================================================================

#[test]
fn rotation_re_encrypts_sessions_end_to_end() {
    let context = test_context();
    let vault = KeyVault::new(context.clone());
    let key = vault
        .create_user_key("u1", "main", PASSWORD, None, None, None)
        .unwrap();
    let credentials = KeyCredentials {
        key_id: key.key_id.clone(),
        password: PASSWORD.to_string(),
    };

    let manager = SessionManager::new(context.clone());
    let state = sample_state();
    let session = manager
        .create_session("u1", "ws", "dev", &state, Some(&credentials))
        .unwrap();

    let new_password = "Fr3sh!Rotated#Pass77";
    let rotation = RotationEngine::new(context.clone());
    let task = rotation
        .initiate_rotation(
            &RotationRequest {
                user_id: "u1".to_string(),
                key_id: key.key_id.clone(),
                new_password: new_password.to_string(),
                force: true,
                preserve_old_key: false,
                re_encrypt_data: true,
                reason: None,
            },
            PASSWORD,
        )
        .unwrap();
    let finished = rotation.run_task(&task.id, PASSWORD, new_password).unwrap();
    assert_eq!(finished.state, TaskState::Completed);

    // The session opens under the new key's password and not the old
    let reloaded = manager
        .load_session_state(&session.id, Some(new_password))
        .unwrap();
    assert_eq!(reloaded, state);
    assert!(manager
        .load_session_state(&session.id, Some(PASSWORD))
        .is_err());
}

// ============================================================================
// Sync delivery across a realistic flow
// ============================================================================

#[test]
fn subscriber_sees_other_writers_only() {
    let context = test_context();
    let sync = SyncEngine::new(context.clone());
    let manager = SessionManager::new(context.clone()).with_sync(sync.clone());

    let (_sub, rx) = sync.subscribe(SubscribeRequest {
        user_id: "observer".to_string(),
        ..SubscribeRequest::default()
    });
    let (_own, own_rx) = sync.subscribe(SubscribeRequest {
        user_id: "writer".to_string(),
        ..SubscribeRequest::default()
    });

    let session = manager
        .create_session("writer", "ws", "dev", &sample_state(), None)
        .unwrap();
    manager
        .save_session_state(&session.id, &sample_state(), None)
        .unwrap();
    sync.drain();

    // Default subscription filters to session_updated + checkpoint_created
    let seen: Vec<SyncEventType> = rx.try_iter().map(|e| e.event_type).collect();
    assert_eq!(seen, vec![SyncEventType::SessionUpdated]);
    assert!(own_rx.try_recv().is_err());
}

// ============================================================================
// Codec determinism across engines
// ============================================================================

#[test]
fn codec_output_is_stable_for_checksum_binding() {
    let codec = StateCodec::new(52_428_800, false);
    let state = sample_state();
    let a = codec.serialize(&state, None).unwrap();
    let b = codec.serialize(&state, None).unwrap();
    assert_eq!(a.checksum, b.checksum);
    assert!(crypto::verify_hash(&a.bytes, &b.checksum));
}

// ============================================================================
// Expiry & audit housekeeping
// ============================================================================

#[test]
fn audit_reflects_hygiene_after_activity() {
    let context = test_context();
    let vault = KeyVault::new(context.clone());
    let key = vault
        .create_user_key("u1", "main", PASSWORD, None, None, None)
        .unwrap();
    vault
        .encrypt_with_user_key("u1", &key.key_id, PASSWORD, b"data")
        .unwrap();

    let report = vault.security_audit("u1").unwrap();
    assert_eq!(report.score, 100);
    assert_eq!(report.active_keys, 1);
    assert_eq!(report.metrics.encryption_count, 1);

    // Age the key past expiry; the score drops
    context
        .store
        .update_user_key(
            &key.key_id,
            workspace_vault::store::UserKeyPatch {
                expires_at: Some(Utc::now() - Duration::days(1)),
                ..Default::default()
            },
        )
        .unwrap();
    let degraded = vault.security_audit("u1").unwrap();
    assert!(degraded.score <= 80);
    assert!(!degraded.issues.is_empty());
}
