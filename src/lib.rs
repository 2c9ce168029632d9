//! # Workspace Vault - Encrypted Workspace Session Persistence
//!
//! Persists and restores long-lived workspace sessions — terminal
//! history, browser tabs, AI conversations, open files, configuration —
//! under three hard guarantees:
//!
//! - **Encrypted at rest**: every persisted state is AES-256-GCM
//!   ciphertext under keys the user controls through passwords. A
//!   password never encrypts data directly; it unlocks a random session
//!   key through the two-layer wrap in [`key_vault`].
//! - **Recoverable**: corrupted or partially-lost sessions go through a
//!   layered fallback — direct read, checkpoint restore, then structural
//!   repair of whatever survives ([`recovery`]).
//! - **Reconciled**: concurrent writers to the same logical session are
//!   detected by optimistic versioning and reconciled through recorded
//!   conflicts ([`sync`]).
//!
//! ## Example
//!
//! ```rust
//! use workspace_vault::context::CoreContext;
//! use workspace_vault::key_vault::KeyVault;
//! use workspace_vault::sessions::{KeyCredentials, SessionManager};
//! use workspace_vault::workspace::WorkspaceState;
//!
//! let context = CoreContext::in_memory();
//! let vault = KeyVault::new(context.clone());
//! let key = vault
//!     .create_user_key("u1", "laptop", "MyStr0ng!P@ssw0rd123", None, None, None)
//!     .unwrap();
//!
//! let manager = SessionManager::new(context);
//! let credentials = KeyCredentials {
//!     key_id: key.key_id.clone(),
//!     password: "MyStr0ng!P@ssw0rd123".to_string(),
//! };
//! let state = WorkspaceState::new(chrono::Utc::now());
//! let session = manager
//!     .create_session("u1", "ws-main", "dev", &state, Some(&credentials))
//!     .unwrap();
//! let restored = manager
//!     .load_session_state(&session.id, Some("MyStr0ng!P@ssw0rd123"))
//!     .unwrap();
//! assert_eq!(restored, state);
//! ```
//!
//! ## Design
//!
//! Components share nothing ambient: the store adapter, configuration,
//! and metrics travel in an explicit [`context::CoreContext`]. The store
//! is a narrow per-row-atomic trait ([`store::StoreAdapter`]); session
//! rows carry the only authoritative version counter, and everything
//! else — vault, rotation, codec, recovery, sync — is a consumer of that
//! contract.

pub mod codec;
pub mod config;
pub mod context;
pub mod crypto;
pub mod key_vault;
pub mod metrics;
pub mod password;
pub mod recovery;
pub mod rotation;
pub mod sessions;
pub mod store;
pub mod sync;
pub mod workspace;

// Re-export the types most callers touch
pub use codec::{SerializedState, StateCodec};
pub use config::CoreConfig;
pub use context::CoreContext;
pub use crypto::Envelope;
pub use key_vault::{KeyValidation, KeyVault, RotateOptions, SecurityAuditReport};
pub use password::{analyze as analyze_password_strength, PasswordAnalysis, PasswordPolicy};
pub use recovery::{
    MergeCandidate, MergeStrategy, RecoveryEngine, RecoveryMethod, RestoreOptions, RestoreReport,
};
pub use rotation::{RotationEngine, RotationPolicy, RotationRequest, RotationTask, TaskState};
pub use sessions::{KeyCredentials, SessionManager};
pub use store::{
    Checkpoint, JsonFileStore, MemoryStore, Session, StoreAdapter, UserKey,
};
pub use sync::{PublishRequest, SubscribeRequest, SyncEngine, SyncEvent, SyncEventType};
pub use workspace::{
    AiConversation, BrowserTab, OpenFile, TerminalEntry, WorkspaceState,
};

/// Crate version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
