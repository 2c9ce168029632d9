//! # Workspace State Model
//!
//! Typed records for everything a workspace session captures: terminal
//! history, browser tabs, AI conversations, and open files, plus the
//! free-form config and metadata maps.
//!
//! Each record category has its identity field required at the type level
//! (terminals, conversations, and files carry an `id`; browser tabs are
//! identified by `(url, title)`). Fields this crate does not model are
//! preserved round-trip in an opaque `extra` bag, so foreign producers can
//! attach data without breaking the codec.
//!
//! Upstream state arrives through the capability traits at the bottom of
//! this module. A failing provider yields its empty default; provider
//! errors never propagate into the core.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::BTreeMap;
use thiserror::Error;
use tracing::warn;

// ============================================================================
// ERROR TYPES
// ============================================================================

#[derive(Debug, Error)]
pub enum ProviderError {
    #[error("state provider unavailable: {0}")]
    Unavailable(String),
}

pub type ProviderResult<T> = std::result::Result<T, ProviderError>;

// ============================================================================
// RECORD TYPES
// ============================================================================

/// One terminal history entry
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TerminalEntry {
    pub id: String,
    pub command: String,
    #[serde(default)]
    pub output: Option<String>,
    #[serde(default)]
    pub working_directory: Option<String>,
    #[serde(default)]
    pub timestamp: Option<DateTime<Utc>>,
    #[serde(default)]
    pub is_active: bool,
    /// Fields this crate does not model, preserved round-trip
    #[serde(flatten)]
    pub extra: BTreeMap<String, Value>,
}

/// One open browser tab, identified by `(url, title)`
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BrowserTab {
    pub url: String,
    #[serde(default)]
    pub title: String,
    #[serde(default)]
    pub timestamp: Option<DateTime<Utc>>,
    #[serde(default)]
    pub is_active: bool,
    #[serde(default)]
    pub pinned: bool,
    #[serde(flatten)]
    pub extra: BTreeMap<String, Value>,
}

impl BrowserTab {
    /// Composite identity used for merging
    pub fn identity(&self) -> (String, String) {
        (self.url.clone(), self.title.clone())
    }
}

/// One AI conversation thread
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AiConversation {
    pub id: String,
    #[serde(default)]
    pub title: Option<String>,
    #[serde(default)]
    pub message_count: u64,
    #[serde(default)]
    pub last_message_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub is_active: bool,
    #[serde(flatten)]
    pub extra: BTreeMap<String, Value>,
}

impl AiConversation {
    /// Whether the thread saw a message within the last 24 hours
    pub fn is_recent(&self, now: DateTime<Utc>) -> bool {
        self.last_message_at
            .map(|t| now.signed_duration_since(t) <= chrono::Duration::hours(24))
            .unwrap_or(false)
    }
}

/// One open editor file
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct OpenFile {
    pub id: String,
    pub path: String,
    #[serde(default)]
    pub has_unsaved_changes: bool,
    #[serde(default)]
    pub is_active: bool,
    #[serde(default)]
    pub cursor_line: Option<u64>,
    #[serde(flatten)]
    pub extra: BTreeMap<String, Value>,
}

// ============================================================================
// WORKSPACE STATE
// ============================================================================

/// The logical document a session persists.
///
/// Serialized field names match the persisted wire format
/// (`terminalState`, `browserTabs`, `aiConversations`, `openFiles`); the
/// four sequences are required for a blob to count as workspace-shaped
/// during recovery.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct WorkspaceState {
    #[serde(default)]
    pub terminal_state: Vec<TerminalEntry>,
    #[serde(default)]
    pub browser_tabs: Vec<BrowserTab>,
    #[serde(default)]
    pub ai_conversations: Vec<AiConversation>,
    #[serde(default)]
    pub open_files: Vec<OpenFile>,
    /// Free-form configuration; BTreeMap keeps key order deterministic
    #[serde(default)]
    pub config: BTreeMap<String, Value>,
    /// Bookkeeping map (`created_at`, `updated_at`, ...)
    #[serde(default)]
    pub metadata: BTreeMap<String, Value>,
}

impl WorkspaceState {
    /// Empty state stamped with a creation time
    pub fn new(now: DateTime<Utc>) -> Self {
        let mut state = WorkspaceState::default();
        state
            .metadata
            .insert("created_at".to_string(), Value::String(now.to_rfc3339()));
        state
    }

    /// Total number of captured items across the four sequences
    pub fn item_count(&self) -> usize {
        self.terminal_state.len()
            + self.browser_tabs.len()
            + self.ai_conversations.len()
            + self.open_files.len()
    }

    /// Stamp the last-update time into the metadata map
    pub fn touch(&mut self, now: DateTime<Utc>) {
        self.metadata
            .insert("updated_at".to_string(), Value::String(now.to_rfc3339()));
    }
}

// ============================================================================
// JSON DEEP MERGE
// ============================================================================

/// Deep-merge `incoming` into `base`, preserving `base` on collisions.
///
/// Keys present only in `incoming` are added; keys present in both with
/// object values recurse; any other collision keeps the `base` value.
pub fn deep_merge_preserving(base: &Value, incoming: &Value) -> Value {
    match (base, incoming) {
        (Value::Object(base_map), Value::Object(incoming_map)) => {
            let mut merged = base_map.clone();
            for (key, incoming_value) in incoming_map {
                match merged.get(key) {
                    Some(existing) => {
                        let combined = deep_merge_preserving(existing, incoming_value);
                        merged.insert(key.clone(), combined);
                    }
                    None => {
                        merged.insert(key.clone(), incoming_value.clone());
                    }
                }
            }
            Value::Object(merged)
        }
        _ => base.clone(),
    }
}

// ============================================================================
// CAPABILITY ADAPTERS
// ============================================================================

/// Terminal history source
pub trait TerminalSource: Send + Sync {
    fn poll(&self) -> ProviderResult<Vec<TerminalEntry>>;
}

/// Browser tab source
pub trait BrowserSource: Send + Sync {
    fn poll(&self) -> ProviderResult<Vec<BrowserTab>>;
}

/// AI conversation source
pub trait AiSource: Send + Sync {
    fn poll(&self) -> ProviderResult<Vec<AiConversation>>;
}

/// Open file source
pub trait FileSource: Send + Sync {
    fn poll(&self) -> ProviderResult<Vec<OpenFile>>;
}

/// The four upstream capabilities a workspace is assembled from
pub struct StateProviders<'a> {
    pub terminal: &'a dyn TerminalSource,
    pub browser: &'a dyn BrowserSource,
    pub ai: &'a dyn AiSource,
    pub files: &'a dyn FileSource,
}

/// Assemble a [`WorkspaceState`] by polling all four capabilities.
///
/// A provider failure contributes its empty default and a warning; it
/// never aborts assembly.
pub fn collect_workspace_state(providers: &StateProviders<'_>, now: DateTime<Utc>) -> WorkspaceState {
    let mut state = WorkspaceState::new(now);

    state.terminal_state = providers.terminal.poll().unwrap_or_else(|e| {
        warn!(error = %e, "terminal provider failed, using empty default");
        Vec::new()
    });
    state.browser_tabs = providers.browser.poll().unwrap_or_else(|e| {
        warn!(error = %e, "browser provider failed, using empty default");
        Vec::new()
    });
    state.ai_conversations = providers.ai.poll().unwrap_or_else(|e| {
        warn!(error = %e, "ai provider failed, using empty default");
        Vec::new()
    });
    state.open_files = providers.files.poll().unwrap_or_else(|e| {
        warn!(error = %e, "file provider failed, using empty default");
        Vec::new()
    });

    state.touch(now);
    state
}

// ============================================================================
// TESTS
// ============================================================================
