//! # Sync Engine
//!
//! Real-time fan-out for session mutations. One engine instance runs per
//! process; publishers enqueue events, the drain loop delivers them to
//! matching subscriptions, and every `session_updated` is checked against
//! the store for staleness.
//!
//! ## Versioning
//!
//! `publish_event` assigns each event the next version for its session:
//! one past the larger of the store row's version and the last version
//! this engine handed out. Within a session, versions are strictly
//! increasing with no gaps when there are no other writers; across
//! sessions no ordering holds.
//!
//! ## Delivery
//!
//! A subscription receives an event when every filter matches — event
//! type, optional session id, optional workspace id — and the event was
//! published by someone else: the owner never receives their own events.
//!
//! The drain loop wakes on a fixed cadence, swaps the pending queue into
//! a local batch, and dispatches sequentially. Re-entrancy is blocked by
//! an atomic flag, and one dead subscriber never halts delivery to the
//! rest.
//!
//! ## Observers
//!
//! Engine lifecycle is observable over typed channels — subscription
//! created, event delivered, conflict detected, conflict resolved —
//! registered as plain `mpsc` receivers. No inheritance, no callbacks.

use chrono::{DateTime, Utc};
use parking_lot::{Mutex, RwLock};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::mpsc::{channel, Receiver, Sender};
use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::Duration;
use thiserror::Error;
use tracing::{debug, info, warn};

use crate::context::CoreContext;
use crate::crypto;
use crate::store::{SessionPatch, StoreError};
use crate::workspace::deep_merge_preserving;

// ============================================================================
// CONSTANTS
// ============================================================================

/// User id stamped on events the engine publishes on its own behalf
const SYSTEM_USER: &str = "system";

// ============================================================================
// ERROR TYPES
// ============================================================================

#[derive(Debug, Error)]
pub enum SyncError {
    #[error("subscription not found: {0}")]
    SubscriptionNotFound(String),

    #[error("conflict not found: {0}")]
    ConflictNotFound(String),

    #[error("conflict already resolved: {0}")]
    ConflictAlreadyResolved(String),

    #[error(transparent)]
    Store(#[from] StoreError),
}

pub type Result<T> = std::result::Result<T, SyncError>;

// ============================================================================
// EVENT & SUBSCRIPTION TYPES
// ============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SyncEventType {
    SessionCreated,
    SessionUpdated,
    SessionDeleted,
    CheckpointCreated,
    CheckpointDeleted,
}

/// A versioned mutation notification
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SyncEvent {
    pub id: String,
    pub event_type: SyncEventType,
    pub session_id: String,
    pub user_id: String,
    pub workspace_id: Option<String>,
    pub data: Value,
    pub timestamp: DateTime<Utc>,
    /// Authoritative: one past the session's version at assignment time
    pub version: u64,
}

/// In-memory interest registration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Subscription {
    pub id: String,
    pub user_id: String,
    pub session_id: Option<String>,
    pub workspace_id: Option<String>,
    pub event_types: HashSet<SyncEventType>,
    pub created_at: DateTime<Utc>,
    pub last_activity: DateTime<Utc>,
}

impl Subscription {
    /// The delivery filter: all conditions must hold, and the owner
    /// never receives their own events.
    fn wants(&self, event: &SyncEvent) -> bool {
        if !self.event_types.contains(&event.event_type) {
            return false;
        }
        if let Some(session_id) = &self.session_id {
            if session_id != &event.session_id {
                return false;
            }
        }
        if let Some(workspace_id) = &self.workspace_id {
            if Some(workspace_id) != event.workspace_id.as_ref() {
                return false;
            }
        }
        event.user_id != self.user_id
    }
}

/// Parameters for [`SyncEngine::subscribe`]
#[derive(Debug, Clone, Default)]
pub struct SubscribeRequest {
    pub user_id: String,
    pub session_id: Option<String>,
    pub workspace_id: Option<String>,
    /// Defaults to `{session_updated, checkpoint_created}` when empty
    pub event_types: HashSet<SyncEventType>,
}

/// Parameters for [`SyncEngine::publish_event`]
#[derive(Debug, Clone)]
pub struct PublishRequest {
    pub event_type: SyncEventType,
    pub session_id: String,
    pub user_id: String,
    pub workspace_id: Option<String>,
    pub data: Value,
}

// ============================================================================
// CONFLICT TYPES
// ============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ConflictType {
    ConcurrentUpdate,
    DataCorruption,
    VersionMismatch,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Resolution {
    LocalWins,
    RemoteWins,
    Merge,
}

/// A detected divergence pending resolution
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Conflict {
    pub id: String,
    pub session_id: String,
    pub conflict_type: ConflictType,
    pub local_version: u64,
    pub remote_version: u64,
    pub local_data: Value,
    pub remote_data: Value,
    pub timestamp: DateTime<Utc>,
    pub resolved: bool,
    pub resolution: Option<Resolution>,
}

// ============================================================================
// OBSERVER CHANNELS
// ============================================================================

/// A delivery the engine completed, for observers
#[derive(Debug, Clone)]
pub struct DeliveredEvent {
    pub subscription_id: String,
    pub event: SyncEvent,
}

#[derive(Default)]
struct Observers {
    subscription_created: Mutex<Vec<Sender<Subscription>>>,
    event_delivered: Mutex<Vec<Sender<DeliveredEvent>>>,
    conflict_detected: Mutex<Vec<Sender<Conflict>>>,
    conflict_resolved: Mutex<Vec<Sender<Conflict>>>,
}

/// Broadcast to every registered observer, dropping closed channels
fn notify<T: Clone>(senders: &Mutex<Vec<Sender<T>>>, payload: &T) {
    senders
        .lock()
        .retain(|sender| sender.send(payload.clone()).is_ok());
}

// ============================================================================
// METRICS
// ============================================================================

/// Counters exposed by [`SyncEngine::metrics`]
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SyncMetrics {
    pub events_published: u64,
    pub events_delivered: u64,
    pub conflicts_detected: u64,
    pub conflicts_resolved: u64,
    pub active_subscriptions: usize,
    pub pending_events: usize,
}

#[derive(Default)]
struct Counters {
    published: AtomicU64,
    delivered: AtomicU64,
    conflicts_detected: AtomicU64,
    conflicts_resolved: AtomicU64,
}

// ============================================================================
// SYNC ENGINE
// ============================================================================

struct SyncInner {
    context: CoreContext,
    subscriptions: RwLock<HashMap<String, Subscription>>,
    /// Delivery channel per subscription id
    senders: Mutex<HashMap<String, Sender<SyncEvent>>>,
    /// Events awaiting the next drain, in publish order
    pending: Mutex<Vec<SyncEvent>>,
    /// Highest version handed out per session this process lifetime
    assigned_versions: Mutex<HashMap<String, u64>>,
    conflicts: RwLock<HashMap<String, Conflict>>,
    is_processing: AtomicBool,
    running: AtomicBool,
    worker: Mutex<Option<JoinHandle<()>>>,
    observers: Observers,
    counters: Counters,
}

#[derive(Clone)]
pub struct SyncEngine {
    inner: Arc<SyncInner>,
}

impl SyncEngine {
    pub fn new(context: CoreContext) -> Self {
        SyncEngine {
            inner: Arc::new(SyncInner {
                context,
                subscriptions: RwLock::new(HashMap::new()),
                senders: Mutex::new(HashMap::new()),
                pending: Mutex::new(Vec::new()),
                assigned_versions: Mutex::new(HashMap::new()),
                conflicts: RwLock::new(HashMap::new()),
                is_processing: AtomicBool::new(false),
                running: AtomicBool::new(false),
                worker: Mutex::new(None),
                observers: Observers::default(),
                counters: Counters::default(),
            }),
        }
    }

    // ------------------------------------------------------------------
    // Subscriptions
    // ------------------------------------------------------------------

    /// Register interest and receive the delivery channel.
    pub fn subscribe(&self, request: SubscribeRequest) -> (Subscription, Receiver<SyncEvent>) {
        let now = Utc::now();
        let event_types = if request.event_types.is_empty() {
            HashSet::from([
                SyncEventType::SessionUpdated,
                SyncEventType::CheckpointCreated,
            ])
        } else {
            request.event_types
        };

        let subscription = Subscription {
            id: crypto::random_id(Some("sub")),
            user_id: request.user_id,
            session_id: request.session_id,
            workspace_id: request.workspace_id,
            event_types,
            created_at: now,
            last_activity: now,
        };

        let (sender, receiver) = channel();
        self.inner
            .senders
            .lock()
            .insert(subscription.id.clone(), sender);
        self.inner
            .subscriptions
            .write()
            .insert(subscription.id.clone(), subscription.clone());

        debug!(subscription_id = %subscription.id, user_id = %subscription.user_id, "subscribed");
        notify(&self.inner.observers.subscription_created, &subscription);
        (subscription, receiver)
    }

    /// Drop a subscription. Returns whether it existed.
    pub fn unsubscribe(&self, subscription_id: &str) -> bool {
        let removed = self
            .inner
            .subscriptions
            .write()
            .remove(subscription_id)
            .is_some();
        self.inner.senders.lock().remove(subscription_id);
        if removed {
            debug!(subscription_id, "unsubscribed");
        }
        removed
    }

    /// Snapshot of live subscriptions.
    pub fn active_subscriptions(&self) -> Vec<Subscription> {
        self.inner.subscriptions.read().values().cloned().collect()
    }

    /// Drop subscriptions idle longer than `max_inactive_minutes`.
    pub fn cleanup_inactive(&self, max_inactive_minutes: i64) -> usize {
        let cutoff = Utc::now() - chrono::Duration::minutes(max_inactive_minutes);
        let stale: Vec<String> = self
            .inner
            .subscriptions
            .read()
            .values()
            .filter(|s| s.last_activity < cutoff)
            .map(|s| s.id.clone())
            .collect();

        for id in &stale {
            self.unsubscribe(id);
        }
        if !stale.is_empty() {
            info!(count = stale.len(), "garbage-collected inactive subscriptions");
        }
        stale.len()
    }

    // ------------------------------------------------------------------
    // Publish
    // ------------------------------------------------------------------

    /// Assign the next version for the session and enqueue the event.
    pub fn publish_event(&self, request: PublishRequest) -> Result<SyncEvent> {
        let store_version = self
            .inner
            .context
            .store
            .get_session_version(&request.session_id)?;

        let version = {
            let mut assigned = self.inner.assigned_versions.lock();
            let last = assigned
                .get(&request.session_id)
                .copied()
                .unwrap_or(0);
            let next = store_version.max(last) + 1;
            assigned.insert(request.session_id.clone(), next);
            next
        };

        let event = SyncEvent {
            id: crypto::random_id(Some("evt")),
            event_type: request.event_type,
            session_id: request.session_id,
            user_id: request.user_id,
            workspace_id: request.workspace_id,
            data: request.data,
            timestamp: Utc::now(),
            version,
        };

        self.inner.pending.lock().push(event.clone());
        self.inner.counters.published.fetch_add(1, Ordering::Relaxed);
        debug!(event_id = %event.id, session_id = %event.session_id, version, "event published");
        Ok(event)
    }

    // ------------------------------------------------------------------
    // Drain loop
    // ------------------------------------------------------------------

    /// Dispatch every pending event once. Returns delivered count.
    ///
    /// Safe to call from any thread; a concurrent drain is a no-op
    /// thanks to the processing flag.
    pub fn drain(&self) -> usize {
        if self
            .inner
            .is_processing
            .compare_exchange(false, true, Ordering::SeqCst, Ordering::SeqCst)
            .is_err()
        {
            return 0;
        }

        let batch: Vec<SyncEvent> = std::mem::take(&mut *self.inner.pending.lock());
        let mut delivered = 0usize;

        for event in batch {
            if event.event_type == SyncEventType::SessionUpdated {
                if let Err(e) = self.detect_conflict(&event) {
                    warn!(event_id = %event.id, error = %e, "conflict detection failed");
                }
            }
            delivered += self.dispatch(&event);
        }

        self.inner.is_processing.store(false, Ordering::SeqCst);
        delivered
    }

    fn dispatch(&self, event: &SyncEvent) -> usize {
        let targets: Vec<Subscription> = self
            .inner
            .subscriptions
            .read()
            .values()
            .filter(|s| s.wants(event))
            .cloned()
            .collect();

        let mut delivered = 0usize;
        let now = Utc::now();
        for subscription in targets {
            let sender = self.inner.senders.lock().get(&subscription.id).cloned();
            let sent = sender
                .map(|s| s.send(event.clone()).is_ok())
                .unwrap_or(false);

            if sent {
                delivered += 1;
                self.inner.counters.delivered.fetch_add(1, Ordering::Relaxed);
                if let Some(live) = self
                    .inner
                    .subscriptions
                    .write()
                    .get_mut(&subscription.id)
                {
                    live.last_activity = now;
                }
                notify(
                    &self.inner.observers.event_delivered,
                    &DeliveredEvent {
                        subscription_id: subscription.id.clone(),
                        event: event.clone(),
                    },
                );
            } else {
                // One dead subscriber cannot halt delivery to the rest
                warn!(subscription_id = %subscription.id, "delivery failed; receiver gone");
            }
        }
        delivered
    }

    /// Run the drain loop on a background thread until [`SyncEngine::stop`].
    ///
    /// The worker holds only a weak handle, so dropping the last engine
    /// clone ends the loop on its next tick.
    pub fn start(&self) {
        if self.inner.running.swap(true, Ordering::SeqCst) {
            return;
        }
        let weak = Arc::downgrade(&self.inner);
        let interval = Duration::from_millis(self.inner.context.config.sync_drain_interval_ms);
        let handle = std::thread::spawn(move || loop {
            std::thread::sleep(interval);
            match weak.upgrade() {
                Some(inner) => {
                    if !inner.running.load(Ordering::SeqCst) {
                        break;
                    }
                    SyncEngine { inner }.drain();
                }
                None => break,
            }
        });
        *self.inner.worker.lock() = Some(handle);
        info!("sync drain loop started");
    }

    /// Stop the background drain loop and flush once.
    pub fn stop(&self) {
        if !self.inner.running.swap(false, Ordering::SeqCst) {
            return;
        }
        if let Some(handle) = self.inner.worker.lock().take() {
            let _ = handle.join();
        }
        self.drain();
        info!("sync drain loop stopped");
    }

    // ------------------------------------------------------------------
    // Conflicts
    // ------------------------------------------------------------------

    fn detect_conflict(&self, event: &SyncEvent) -> Result<()> {
        let current = match self.inner.context.store.get_session(&event.session_id)? {
            Some(session) => session,
            None => return Ok(()),
        };

        if event.version >= current.version {
            return Ok(());
        }

        let conflict = Conflict {
            id: crypto::random_id(Some("conflict")),
            session_id: event.session_id.clone(),
            conflict_type: ConflictType::VersionMismatch,
            local_version: event.version,
            remote_version: current.version,
            local_data: event.data.clone(),
            remote_data: session_snapshot(&current),
            timestamp: Utc::now(),
            resolved: false,
            resolution: None,
        };

        warn!(
            session_id = %event.session_id,
            local = event.version,
            remote = current.version,
            "version mismatch detected"
        );
        self.inner
            .conflicts
            .write()
            .insert(conflict.id.clone(), conflict.clone());
        self.inner
            .counters
            .conflicts_detected
            .fetch_add(1, Ordering::Relaxed);
        notify(&self.inner.observers.conflict_detected, &conflict);
        Ok(())
    }

    /// Conflicts still awaiting resolution.
    pub fn unresolved_conflicts(&self) -> Vec<Conflict> {
        let mut conflicts: Vec<Conflict> = self
            .inner
            .conflicts
            .read()
            .values()
            .filter(|c| !c.resolved)
            .cloned()
            .collect();
        conflicts.sort_by(|a, b| a.timestamp.cmp(&b.timestamp));
        conflicts
    }

    /// Resolve a conflict and write the winning state back.
    ///
    /// `merge` deep-merges the local data into the remote snapshot:
    /// local-only keys are added, object collisions recurse, and scalar
    /// collisions keep the remote value. The write-back carries
    /// `version = max(local, remote)` and a system-sourced
    /// `session_updated` is re-published.
    pub fn resolve_conflict(&self, conflict_id: &str, resolution: Resolution) -> Result<Conflict> {
        let conflict = {
            let conflicts = self.inner.conflicts.read();
            let conflict = conflicts
                .get(conflict_id)
                .ok_or_else(|| SyncError::ConflictNotFound(conflict_id.to_string()))?;
            if conflict.resolved {
                return Err(SyncError::ConflictAlreadyResolved(conflict_id.to_string()));
            }
            conflict.clone()
        };

        let resolution_state = match resolution {
            Resolution::LocalWins => conflict.local_data.clone(),
            Resolution::RemoteWins => conflict.remote_data.clone(),
            Resolution::Merge => {
                deep_merge_preserving(&conflict.remote_data, &conflict.local_data)
            }
        };

        let winning_version = conflict.local_version.max(conflict.remote_version);
        let bytes = serde_json::to_vec(&resolution_state).unwrap_or_default();
        let checksum = crypto::hash(&bytes);
        self.inner.context.store.update_session(
            &conflict.session_id,
            SessionPatch {
                workspace_state: Some(bytes),
                state_checksum: Some(checksum),
                version: Some(winning_version),
                last_saved_at: Some(Utc::now()),
                ..SessionPatch::default()
            },
        )?;

        let resolved = {
            let mut conflicts = self.inner.conflicts.write();
            let entry = conflicts
                .get_mut(conflict_id)
                .ok_or_else(|| SyncError::ConflictNotFound(conflict_id.to_string()))?;
            entry.resolved = true;
            entry.resolution = Some(resolution);
            entry.clone()
        };

        self.inner
            .counters
            .conflicts_resolved
            .fetch_add(1, Ordering::Relaxed);
        notify(&self.inner.observers.conflict_resolved, &resolved);

        // Tell everyone the row changed, as the system
        self.publish_event(PublishRequest {
            event_type: SyncEventType::SessionUpdated,
            session_id: resolved.session_id.clone(),
            user_id: SYSTEM_USER.to_string(),
            workspace_id: None,
            data: resolution_state,
        })?;

        info!(conflict_id, ?resolution, "conflict resolved");
        Ok(resolved)
    }

    // ------------------------------------------------------------------
    // Observers & metrics
    // ------------------------------------------------------------------

    pub fn observe_subscription_created(&self) -> Receiver<Subscription> {
        let (sender, receiver) = channel();
        self.inner
            .observers
            .subscription_created
            .lock()
            .push(sender);
        receiver
    }

    pub fn observe_event_delivered(&self) -> Receiver<DeliveredEvent> {
        let (sender, receiver) = channel();
        self.inner.observers.event_delivered.lock().push(sender);
        receiver
    }

    pub fn observe_conflict_detected(&self) -> Receiver<Conflict> {
        let (sender, receiver) = channel();
        self.inner.observers.conflict_detected.lock().push(sender);
        receiver
    }

    pub fn observe_conflict_resolved(&self) -> Receiver<Conflict> {
        let (sender, receiver) = channel();
        self.inner.observers.conflict_resolved.lock().push(sender);
        receiver
    }

    pub fn metrics(&self) -> SyncMetrics {
        SyncMetrics {
            events_published: self.inner.counters.published.load(Ordering::Relaxed),
            events_delivered: self.inner.counters.delivered.load(Ordering::Relaxed),
            conflicts_detected: self
                .inner
                .counters
                .conflicts_detected
                .load(Ordering::Relaxed),
            conflicts_resolved: self
                .inner
                .counters
                .conflicts_resolved
                .load(Ordering::Relaxed),
            active_subscriptions: self.inner.subscriptions.read().len(),
            pending_events: self.inner.pending.lock().len(),
        }
    }
}

impl Drop for SyncInner {
    fn drop(&mut self) {
        // Signal only; the worker exits on its next tick. Joining here
        // could deadlock when the final handle drops on the worker
        // thread itself.
        self.running.store(false, Ordering::SeqCst);
    }
}

/// Store row as a JSON snapshot for conflict records
fn session_snapshot(session: &crate::store::Session) -> Value {
    serde_json::json!({
        "id": session.id,
        "version": session.version,
        "state_checksum": session.state_checksum,
        "last_saved_at": session.last_saved_at.to_rfc3339(),
    })
}

// ============================================================================
// TESTS
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use crate::key_vault::tests::test_context;
    use crate::store::tests::session_fixture;
    use serde_json::json;

    fn engine_with_session(version: u64) -> (SyncEngine, CoreContext) {
        let context = test_context();
        context
            .store
            .put_session(session_fixture("s1", "writer", version))
            .unwrap();
        (SyncEngine::new(context.clone()), context)
    }

    fn publish(engine: &SyncEngine, user: &str, session: &str) -> SyncEvent {
        engine
            .publish_event(PublishRequest {
                event_type: SyncEventType::SessionUpdated,
                session_id: session.to_string(),
                user_id: user.to_string(),
                workspace_id: None,
                data: json!({"changed": true}),
            })
            .unwrap()
    }

    #[test]
    fn test_versions_are_sequential_without_other_writers() {
        let (engine, _context) = engine_with_session(1);
        let versions: Vec<u64> = (0..5).map(|_| publish(&engine, "writer", "s1").version).collect();
        assert_eq!(versions, vec![2, 3, 4, 5, 6]);
    }

    #[test]
    fn test_version_reseeds_from_store() {
        let (engine, context) = engine_with_session(1);
        assert_eq!(publish(&engine, "writer", "s1").version, 2);

        // Another writer pushed the row far ahead
        context
            .store
            .update_session(
                "s1",
                SessionPatch {
                    version: Some(10),
                    ..SessionPatch::default()
                },
            )
            .unwrap();
        assert_eq!(publish(&engine, "writer", "s1").version, 11);
    }

    #[test]
    fn test_delivery_filter_and_own_event_exclusion() {
        let (engine, _context) = engine_with_session(1);

        let (_own, own_rx) = engine.subscribe(SubscribeRequest {
            user_id: "writer".to_string(),
            ..SubscribeRequest::default()
        });
        let (_other, other_rx) = engine.subscribe(SubscribeRequest {
            user_id: "reader".to_string(),
            ..SubscribeRequest::default()
        });
        let (_elsewhere, elsewhere_rx) = engine.subscribe(SubscribeRequest {
            user_id: "reader2".to_string(),
            session_id: Some("other-session".to_string()),
            ..SubscribeRequest::default()
        });

        publish(&engine, "writer", "s1");
        engine.drain();

        // Publisher is excluded
        assert!(own_rx.try_recv().is_err());
        // Matching subscriber receives
        let event = other_rx.try_recv().unwrap();
        assert_eq!(event.session_id, "s1");
        // Session filter excludes
        assert!(elsewhere_rx.try_recv().is_err());
    }

    #[test]
    fn test_default_event_types() {
        let (engine, _context) = engine_with_session(1);
        let (subscription, rx) = engine.subscribe(SubscribeRequest {
            user_id: "reader".to_string(),
            ..SubscribeRequest::default()
        });
        assert!(subscription.event_types.contains(&SyncEventType::SessionUpdated));
        assert!(subscription
            .event_types
            .contains(&SyncEventType::CheckpointCreated));
        assert_eq!(subscription.event_types.len(), 2);

        // session_deleted is not in the default set
        engine
            .publish_event(PublishRequest {
                event_type: SyncEventType::SessionDeleted,
                session_id: "s1".to_string(),
                user_id: "writer".to_string(),
                workspace_id: None,
                data: Value::Null,
            })
            .unwrap();
        engine.drain();
        assert!(rx.try_recv().is_err());
    }

    #[test]
    fn test_workspace_filter() {
        let (engine, _context) = engine_with_session(1);
        let (_sub, rx) = engine.subscribe(SubscribeRequest {
            user_id: "reader".to_string(),
            workspace_id: Some("ws-a".to_string()),
            ..SubscribeRequest::default()
        });

        engine
            .publish_event(PublishRequest {
                event_type: SyncEventType::SessionUpdated,
                session_id: "s1".to_string(),
                user_id: "writer".to_string(),
                workspace_id: Some("ws-b".to_string()),
                data: Value::Null,
            })
            .unwrap();
        engine.drain();
        assert!(rx.try_recv().is_err());

        engine
            .publish_event(PublishRequest {
                event_type: SyncEventType::SessionUpdated,
                session_id: "s1".to_string(),
                user_id: "writer".to_string(),
                workspace_id: Some("ws-a".to_string()),
                data: Value::Null,
            })
            .unwrap();
        engine.drain();
        assert!(rx.try_recv().is_ok());
    }

    #[test]
    fn test_delivery_order_within_session() {
        let (engine, _context) = engine_with_session(1);
        let (_sub, rx) = engine.subscribe(SubscribeRequest {
            user_id: "reader".to_string(),
            ..SubscribeRequest::default()
        });

        for _ in 0..4 {
            publish(&engine, "writer", "s1");
        }
        engine.drain();

        let received: Vec<u64> = rx.try_iter().map(|e| e.version).collect();
        assert_eq!(received, vec![2, 3, 4, 5]);
    }

    #[test]
    fn test_dead_subscriber_does_not_halt_delivery() {
        let (engine, _context) = engine_with_session(1);
        let (dead, dead_rx) = engine.subscribe(SubscribeRequest {
            user_id: "reader-a".to_string(),
            ..SubscribeRequest::default()
        });
        drop(dead_rx);
        let (_live, live_rx) = engine.subscribe(SubscribeRequest {
            user_id: "reader-b".to_string(),
            ..SubscribeRequest::default()
        });

        publish(&engine, "writer", "s1");
        let delivered = engine.drain();

        assert_eq!(delivered, 1);
        assert!(live_rx.try_recv().is_ok());
        // The dead subscription still exists; only delivery failed
        assert!(engine
            .active_subscriptions()
            .iter()
            .any(|s| s.id == dead.id));
    }

    #[test]
    fn test_stale_event_creates_version_mismatch_conflict() {
        let (engine, context) = engine_with_session(5);
        let conflict_rx = engine.observe_conflict_detected();

        // Stale publisher: assigned version 6, but the row jumps to 9
        // before the drain sees the event
        publish(&engine, "writer", "s1");
        context
            .store
            .update_session(
                "s1",
                SessionPatch {
                    version: Some(9),
                    ..SessionPatch::default()
                },
            )
            .unwrap();
        engine.drain();

        let conflicts = engine.unresolved_conflicts();
        assert_eq!(conflicts.len(), 1);
        assert_eq!(conflicts[0].conflict_type, ConflictType::VersionMismatch);
        assert_eq!(conflicts[0].local_version, 6);
        assert_eq!(conflicts[0].remote_version, 9);

        let observed = conflict_rx.try_recv().unwrap();
        assert_eq!(observed.id, conflicts[0].id);
    }

    #[test]
    fn test_resolve_conflict_merge_prefers_remote_scalars() {
        let (engine, context) = engine_with_session(5);

        let conflict = Conflict {
            id: "conflict_1".to_string(),
            session_id: "s1".to_string(),
            conflict_type: ConflictType::VersionMismatch,
            local_version: 6,
            remote_version: 9,
            local_data: json!({"theme": "light", "localOnly": 1}),
            remote_data: json!({"theme": "dark", "remoteOnly": 2}),
            timestamp: Utc::now(),
            resolved: false,
            resolution: None,
        };
        engine
            .inner
            .conflicts
            .write()
            .insert(conflict.id.clone(), conflict);

        let resolved_rx = engine.observe_conflict_resolved();
        let resolved = engine
            .resolve_conflict("conflict_1", Resolution::Merge)
            .unwrap();
        assert!(resolved.resolved);
        assert_eq!(resolved.resolution, Some(Resolution::Merge));
        assert!(resolved_rx.try_recv().is_ok());

        // Write-back: version pinned to max(local, remote), merged payload
        let row = context.store.get_session("s1").unwrap().unwrap();
        assert_eq!(row.version, 9);
        let written: Value = serde_json::from_slice(&row.workspace_state).unwrap();
        assert_eq!(written["theme"], "dark");
        assert_eq!(written["localOnly"], 1);
        assert_eq!(written["remoteOnly"], 2);

        // System re-publish is pending
        let metrics = engine.metrics();
        assert_eq!(metrics.pending_events, 1);
        assert!(matches!(
            engine.resolve_conflict("conflict_1", Resolution::Merge),
            Err(SyncError::ConflictAlreadyResolved(_))
        ));
    }

    #[test]
    fn test_cleanup_inactive() {
        let (engine, _context) = engine_with_session(1);
        let (stale, _stale_rx) = engine.subscribe(SubscribeRequest {
            user_id: "reader".to_string(),
            ..SubscribeRequest::default()
        });
        engine.subscribe(SubscribeRequest {
            user_id: "reader2".to_string(),
            ..SubscribeRequest::default()
        });

        // Age one subscription past the cutoff
        engine
            .inner
            .subscriptions
            .write()
            .get_mut(&stale.id)
            .unwrap()
            .last_activity = Utc::now() - chrono::Duration::minutes(45);

        let removed = engine.cleanup_inactive(30);
        assert_eq!(removed, 1);
        assert_eq!(engine.active_subscriptions().len(), 1);
    }

    #[test]
    fn test_drain_loop_thread() {
        let (engine, _context) = engine_with_session(1);
        let (_sub, rx) = engine.subscribe(SubscribeRequest {
            user_id: "reader".to_string(),
            ..SubscribeRequest::default()
        });

        engine.start();
        publish(&engine, "writer", "s1");
        let event = rx.recv_timeout(Duration::from_secs(2)).unwrap();
        assert_eq!(event.version, 2);
        engine.stop();
    }

    #[test]
    fn test_metrics_counters() {
        let (engine, _context) = engine_with_session(1);
        let (_sub, _rx) = engine.subscribe(SubscribeRequest {
            user_id: "reader".to_string(),
            ..SubscribeRequest::default()
        });

        publish(&engine, "writer", "s1");
        publish(&engine, "writer", "s1");
        engine.drain();

        let metrics = engine.metrics();
        assert_eq!(metrics.events_published, 2);
        assert_eq!(metrics.events_delivered, 2);
        assert_eq!(metrics.active_subscriptions, 1);
        assert_eq!(metrics.pending_events, 0);
    }

    #[test]
    fn test_unsubscribe() {
        let (engine, _context) = engine_with_session(1);
        let (subscription, rx) = engine.subscribe(SubscribeRequest {
            user_id: "reader".to_string(),
            ..SubscribeRequest::default()
        });

        assert!(engine.unsubscribe(&subscription.id));
        assert!(!engine.unsubscribe(&subscription.id));

        publish(&engine, "writer", "s1");
        engine.drain();
        assert!(rx.try_recv().is_err());
    }
}
