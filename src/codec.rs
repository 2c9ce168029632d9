//! # State Codec
//!
//! Turns a [`WorkspaceState`] into the bytes a session row persists and
//! back: canonical JSON, optional gzip, optional AEAD envelope, and a
//! checksum bound over the bytes exactly as persisted.
//!
//! Canonical means deterministic: map keys are ordered (`BTreeMap` all
//! the way down) and struct fields serialize in declaration order, so the
//! same state always produces the same plaintext bytes. The checksum is
//! computed last and verified first — a mismatch is reported before any
//! decrypt or decompress work touches the payload.
//!
//! ## Incremental mode
//!
//! The codec remembers the last full serialization per session and can
//! emit a delta payload referencing the previous checksum. Deltas are
//! advisory: the codec falls back to a full payload whenever there is no
//! base or the delta would not be smaller, and recovery always demands
//! fulls.

use flate2::read::GzDecoder;
use flate2::write::GzEncoder;
use flate2::Compression;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::{BTreeMap, HashMap};
use std::io::{Read, Write};
use thiserror::Error;
use tracing::debug;

use crate::crypto::{self, CryptoError, Envelope, KEY_LEN};
use crate::workspace::WorkspaceState;

// ============================================================================
// CONSTANTS
// ============================================================================

/// gzip magic bytes, used to detect compressed payloads on decode
const GZIP_MAGIC: [u8; 2] = [0x1f, 0x8b];

// ============================================================================
// ERROR TYPES
// ============================================================================

#[derive(Debug, Error)]
pub enum CodecError {
    #[error("serialized state is {size} bytes, cap is {max}")]
    SessionTooLarge { size: usize, max: usize },

    #[error("checksum mismatch: stored {expected}, payload hashes differently")]
    ChecksumMismatch { expected: String },

    #[error(transparent)]
    Crypto(#[from] CryptoError),

    #[error("state deserialization failed: {0}")]
    Corrupt(String),

    #[error("compression error: {0}")]
    Io(#[from] std::io::Error),

    #[error("payload is a delta based on {base_checksum}; a full payload is required")]
    DeltaNotAccepted { base_checksum: String },
}

pub type Result<T> = std::result::Result<T, CodecError>;

// ============================================================================
// OUTPUT TYPES
// ============================================================================

/// Bytes ready for persistence plus everything a session row records
#[derive(Debug, Clone)]
pub struct SerializedState {
    pub bytes: Vec<u8>,
    /// Lower-case hex SHA-256 over `bytes`
    pub checksum: String,
    pub compressed_size: u64,
    pub uncompressed_size: u64,
    pub compressed: bool,
    pub encrypted: bool,
    pub is_full: bool,
}

/// Delta payload emitted by incremental serialization.
///
/// Carries only the top-level fields that changed since the referenced
/// full serialization.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DeltaPayload {
    pub is_full: bool,
    /// Checksum of the full serialization this delta applies on top of
    pub base_checksum: String,
    pub changes: BTreeMap<String, Value>,
}

// ============================================================================
// STATE CODEC
// ============================================================================

pub struct StateCodec {
    max_session_size: usize,
    compression_enabled: bool,
    /// Last full serialization per session: (checksum, canonical value)
    bases: Mutex<HashMap<String, (String, Value)>>,
}

impl StateCodec {
    pub fn new(max_session_size: usize, compression_enabled: bool) -> Self {
        StateCodec {
            max_session_size,
            compression_enabled,
            bases: Mutex::new(HashMap::new()),
        }
    }

    /// Codec configured from [`crate::config::CoreConfig`]
    pub fn from_config(config: &crate::config::CoreConfig) -> Self {
        StateCodec::new(config.max_session_size_bytes, config.compression_enabled)
    }

    // ------------------------------------------------------------------
    // Full serialization
    // ------------------------------------------------------------------

    /// Serialize a state to its persisted byte form.
    pub fn serialize(
        &self,
        state: &WorkspaceState,
        encrypt_key: Option<&[u8; KEY_LEN]>,
    ) -> Result<SerializedState> {
        let canonical =
            serde_json::to_vec(state).map_err(|e| CodecError::Corrupt(e.to_string()))?;
        self.finish_payload(canonical, encrypt_key, true)
    }

    /// Incremental serialization for one session.
    ///
    /// Emits a delta against the previous full when one exists and the
    /// delta is strictly smaller; otherwise emits (and remembers) a
    /// fresh full payload.
    pub fn serialize_incremental(
        &self,
        session_id: &str,
        state: &WorkspaceState,
        encrypt_key: Option<&[u8; KEY_LEN]>,
    ) -> Result<SerializedState> {
        let value =
            serde_json::to_value(state).map_err(|e| CodecError::Corrupt(e.to_string()))?;

        let base = self.bases.lock().get(session_id).cloned();
        if let Some((base_checksum, base_value)) = base {
            let changes = top_level_changes(&base_value, &value);
            let delta = DeltaPayload {
                is_full: false,
                base_checksum,
                changes,
            };
            let delta_bytes =
                serde_json::to_vec(&delta).map_err(|e| CodecError::Corrupt(e.to_string()))?;
            let full_bytes =
                serde_json::to_vec(state).map_err(|e| CodecError::Corrupt(e.to_string()))?;

            if delta_bytes.len() < full_bytes.len() {
                debug!(
                    session_id,
                    delta = delta_bytes.len(),
                    full = full_bytes.len(),
                    "emitting delta payload"
                );
                return self.finish_payload(delta_bytes, encrypt_key, false);
            }
        }

        let serialized = self.serialize(state, encrypt_key)?;
        self.bases
            .lock()
            .insert(session_id.to_string(), (serialized.checksum.clone(), value));
        Ok(serialized)
    }

    fn finish_payload(
        &self,
        canonical: Vec<u8>,
        encrypt_key: Option<&[u8; KEY_LEN]>,
        is_full: bool,
    ) -> Result<SerializedState> {
        let uncompressed_size = canonical.len();
        if uncompressed_size > self.max_session_size {
            return Err(CodecError::SessionTooLarge {
                size: uncompressed_size,
                max: self.max_session_size,
            });
        }

        let (mut bytes, compressed) = if self.compression_enabled {
            let mut encoder = GzEncoder::new(Vec::new(), Compression::default());
            encoder.write_all(&canonical)?;
            (encoder.finish()?, true)
        } else {
            (canonical, false)
        };
        let compressed_size = bytes.len();

        let encrypted = encrypt_key.is_some();
        if let Some(key) = encrypt_key {
            let envelope = crypto::encrypt_with_key(&bytes, key)?;
            bytes = envelope.to_bytes();
        }

        let checksum = crypto::hash(&bytes);
        Ok(SerializedState {
            bytes,
            checksum,
            compressed_size: compressed_size as u64,
            uncompressed_size: uncompressed_size as u64,
            compressed,
            encrypted,
            is_full,
        })
    }

    // ------------------------------------------------------------------
    // Deserialization
    // ------------------------------------------------------------------

    /// Decode persisted bytes back into a state.
    ///
    /// The checksum is verified before anything else; a mismatch never
    /// silently succeeds — it surfaces for the recovery ladder. Delta
    /// payloads are refused with [`CodecError::DeltaNotAccepted`].
    pub fn deserialize(
        &self,
        bytes: &[u8],
        expected_checksum: &str,
        decrypt_key: Option<&[u8; KEY_LEN]>,
    ) -> Result<WorkspaceState> {
        if !crypto::verify_hash(bytes, expected_checksum) {
            return Err(CodecError::ChecksumMismatch {
                expected: expected_checksum.to_string(),
            });
        }
        self.decode_unverified(bytes, decrypt_key)
    }

    /// Decode without the checksum gate. The recovery engine uses this
    /// on payloads whose checksum already failed.
    pub fn decode_unverified(
        &self,
        bytes: &[u8],
        decrypt_key: Option<&[u8; KEY_LEN]>,
    ) -> Result<WorkspaceState> {
        let plain = self.plaintext_bytes(bytes, decrypt_key)?;

        // Still-wrapped ciphertext must not decode as an (empty) state
        if decrypt_key.is_none() && serde_json::from_slice::<Envelope>(&plain).is_ok() {
            return Err(CodecError::Corrupt(
                "payload is an encrypted envelope; decryption key required".to_string(),
            ));
        }

        // A delta payload decodes as JSON but is not a full state
        if let Ok(delta) = serde_json::from_slice::<DeltaPayload>(&plain) {
            if !delta.is_full {
                return Err(CodecError::DeltaNotAccepted {
                    base_checksum: delta.base_checksum,
                });
            }
        }

        serde_json::from_slice(&plain).map_err(|e| CodecError::Corrupt(e.to_string()))
    }

    /// Undo encryption and compression, yielding canonical JSON bytes.
    pub fn plaintext_bytes(
        &self,
        bytes: &[u8],
        decrypt_key: Option<&[u8; KEY_LEN]>,
    ) -> Result<Vec<u8>> {
        let mut current: Vec<u8> = bytes.to_vec();

        if let Some(key) = decrypt_key {
            let envelope = Envelope::from_bytes(&current)?;
            current = crypto::decrypt_with_key(&envelope, key)?.to_vec();
        }

        if current.starts_with(&GZIP_MAGIC) {
            let mut decoder = GzDecoder::new(current.as_slice());
            let mut inflated = Vec::new();
            decoder.read_to_end(&mut inflated)?;
            current = inflated;
        }

        Ok(current)
    }

    /// Apply a delta on top of the state it was computed against.
    pub fn apply_delta(base: &WorkspaceState, delta: &DeltaPayload) -> Result<WorkspaceState> {
        let mut value =
            serde_json::to_value(base).map_err(|e| CodecError::Corrupt(e.to_string()))?;
        let object = value
            .as_object_mut()
            .ok_or_else(|| CodecError::Corrupt("state is not an object".to_string()))?;
        for (field, changed) in &delta.changes {
            object.insert(field.clone(), changed.clone());
        }
        serde_json::from_value(value).map_err(|e| CodecError::Corrupt(e.to_string()))
    }

    /// Drop the remembered base for a session (e.g. after recovery
    /// rewrote the row).
    pub fn forget_base(&self, session_id: &str) {
        self.bases.lock().remove(session_id);
    }
}

/// Top-level fields of `next` that differ from `base`
fn top_level_changes(base: &Value, next: &Value) -> BTreeMap<String, Value> {
    let mut changes = BTreeMap::new();
    if let (Some(base_map), Some(next_map)) = (base.as_object(), next.as_object()) {
        for (key, next_value) in next_map {
            if base_map.get(key) != Some(next_value) {
                changes.insert(key.clone(), next_value.clone());
            }
        }
    }
    changes
}

// ============================================================================
// TESTS
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use crate::workspace::TerminalEntry;
    use chrono::Utc;

    fn sample_state() -> WorkspaceState {
        let mut state = WorkspaceState::new(Utc::now());
        state.terminal_state.push(TerminalEntry {
            id: "t1".to_string(),
            command: "cargo test".to_string(),
            output: None,
            working_directory: Some("/work".to_string()),
            timestamp: None,
            is_active: true,
            extra: BTreeMap::new(),
        });
        state
            .config
            .insert("theme".to_string(), Value::String("dark".to_string()));
        state
    }

    fn codec() -> StateCodec {
        StateCodec::new(52_428_800, true)
    }

    #[test]
    fn test_round_trip_plain() {
        let codec = StateCodec::new(52_428_800, false);
        let state = sample_state();
        let serialized = codec.serialize(&state, None).unwrap();
        assert!(!serialized.compressed);
        assert!(!serialized.encrypted);

        let decoded = codec
            .deserialize(&serialized.bytes, &serialized.checksum, None)
            .unwrap();
        assert_eq!(decoded, state);
    }

    #[test]
    fn test_round_trip_compressed_and_encrypted() {
        let codec = codec();
        let key = crypto::generate_session_key();
        let state = sample_state();

        let serialized = codec.serialize(&state, Some(&key)).unwrap();
        assert!(serialized.compressed);
        assert!(serialized.encrypted);
        // Persisted bytes are an envelope, not JSON state
        assert!(Envelope::from_bytes(&serialized.bytes).is_ok());

        let decoded = codec
            .deserialize(&serialized.bytes, &serialized.checksum, Some(&key))
            .unwrap();
        assert_eq!(decoded, state);
    }

    #[test]
    fn test_encrypted_payload_without_key_is_refused() {
        let codec = codec();
        let key = crypto::generate_session_key();
        let serialized = codec.serialize(&sample_state(), Some(&key)).unwrap();

        // Checksum matches, but the payload must not decode as an empty
        // state just because the envelope is a JSON object
        let result = codec.deserialize(&serialized.bytes, &serialized.checksum, None);
        assert!(matches!(result, Err(CodecError::Corrupt(_))));
    }

    #[test]
    fn test_serialization_is_deterministic() {
        let codec = StateCodec::new(52_428_800, false);
        let state = sample_state();
        let a = codec.serialize(&state, None).unwrap();
        let b = codec.serialize(&state, None).unwrap();
        assert_eq!(a.bytes, b.bytes);
        assert_eq!(a.checksum, b.checksum);
    }

    #[test]
    fn test_checksum_verified_before_decode() {
        let codec = codec();
        let state = sample_state();
        let serialized = codec.serialize(&state, None).unwrap();

        let result = codec.deserialize(&serialized.bytes, &crypto::hash(b"other"), None);
        assert!(matches!(result, Err(CodecError::ChecksumMismatch { .. })));
    }

    #[test]
    fn test_size_cap_enforced() {
        let codec = StateCodec::new(64, true);
        let state = sample_state();
        let result = codec.serialize(&state, None);
        assert!(matches!(result, Err(CodecError::SessionTooLarge { .. })));
    }

    #[test]
    fn test_compression_shrinks_repetitive_state() {
        let codec = codec();
        let mut state = sample_state();
        for i in 0..200 {
            state.terminal_state.push(TerminalEntry {
                id: format!("t{i}"),
                command: "echo the same command over and over".to_string(),
                output: None,
                working_directory: None,
                timestamp: None,
                is_active: false,
                extra: BTreeMap::new(),
            });
        }
        let serialized = codec.serialize(&state, None).unwrap();
        assert!(serialized.compressed_size < serialized.uncompressed_size);
    }

    #[test]
    fn test_first_incremental_is_full() {
        let codec = codec();
        let state = sample_state();
        let serialized = codec
            .serialize_incremental("s1", &state, None)
            .unwrap();
        assert!(serialized.is_full);
    }

    #[test]
    fn test_small_change_emits_delta() {
        let codec = codec();
        let mut state = sample_state();
        // Enough bulk that a one-field delta is smaller than the full
        for i in 0..50 {
            state.terminal_state.push(TerminalEntry {
                id: format!("t{i}"),
                command: format!("command number {i}"),
                output: None,
                working_directory: None,
                timestamp: None,
                is_active: false,
                extra: BTreeMap::new(),
            });
        }
        let full = codec.serialize_incremental("s1", &state, None).unwrap();
        assert!(full.is_full);

        state
            .config
            .insert("fontSize".to_string(), Value::from(14));
        let delta = codec.serialize_incremental("s1", &state, None).unwrap();
        assert!(!delta.is_full);
        assert!(delta.bytes.len() < full.bytes.len());

        // The delta decodes to a payload referencing the full
        let plain = codec.plaintext_bytes(&delta.bytes, None).unwrap();
        let payload: DeltaPayload = serde_json::from_slice(&plain).unwrap();
        assert_eq!(payload.base_checksum, full.checksum);
        assert!(payload.changes.contains_key("config"));
    }

    #[test]
    fn test_delta_refused_by_full_decoder() {
        let codec = codec();
        let mut state = sample_state();
        for i in 0..50 {
            state.terminal_state.push(TerminalEntry {
                id: format!("t{i}"),
                command: format!("command number {i}"),
                output: None,
                working_directory: None,
                timestamp: None,
                is_active: false,
                extra: BTreeMap::new(),
            });
        }
        codec.serialize_incremental("s1", &state, None).unwrap();
        state
            .config
            .insert("fontSize".to_string(), Value::from(14));
        let delta = codec.serialize_incremental("s1", &state, None).unwrap();
        assert!(!delta.is_full);

        let result = codec.deserialize(&delta.bytes, &delta.checksum, None);
        assert!(matches!(result, Err(CodecError::DeltaNotAccepted { .. })));
    }

    #[test]
    fn test_apply_delta_reproduces_state() {
        let codec = codec();
        let mut state = sample_state();
        for i in 0..50 {
            state.terminal_state.push(TerminalEntry {
                id: format!("t{i}"),
                command: format!("command number {i}"),
                output: None,
                working_directory: None,
                timestamp: None,
                is_active: false,
                extra: BTreeMap::new(),
            });
        }
        codec.serialize_incremental("s1", &state, None).unwrap();
        let base = state.clone();

        state
            .config
            .insert("fontSize".to_string(), Value::from(14));
        let delta_payload = {
            let serialized = codec.serialize_incremental("s1", &state, None).unwrap();
            let plain = codec.plaintext_bytes(&serialized.bytes, None).unwrap();
            serde_json::from_slice::<DeltaPayload>(&plain).unwrap()
        };

        let rebuilt = StateCodec::apply_delta(&base, &delta_payload).unwrap();
        assert_eq!(rebuilt, state);
    }

    #[test]
    fn test_forget_base_forces_full() {
        let codec = codec();
        let mut state = sample_state();
        for i in 0..50 {
            state.terminal_state.push(TerminalEntry {
                id: format!("t{i}"),
                command: format!("command number {i}"),
                output: None,
                working_directory: None,
                timestamp: None,
                is_active: false,
                extra: BTreeMap::new(),
            });
        }
        codec.serialize_incremental("s1", &state, None).unwrap();
        codec.forget_base("s1");

        state
            .config
            .insert("fontSize".to_string(), Value::from(14));
        let serialized = codec.serialize_incremental("s1", &state, None).unwrap();
        assert!(serialized.is_full);
    }
}
