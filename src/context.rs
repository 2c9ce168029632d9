//! # Core Context
//!
//! The explicit handle that replaces ambient globals: one bundle of the
//! store adapter, configuration, and metrics registry. Engines borrow or
//! clone the context instead of reaching for module state, which keeps
//! every dependency visible at construction time.

use std::sync::Arc;

use crate::config::CoreConfig;
use crate::metrics::MetricsRegistry;
use crate::store::StoreAdapter;

/// Shared dependencies for every core component.
///
/// Cloning is cheap; the store and metrics registry are reference-counted
/// and the configuration is copied.
#[derive(Clone)]
pub struct CoreContext {
    pub store: Arc<dyn StoreAdapter>,
    pub config: CoreConfig,
    pub metrics: Arc<MetricsRegistry>,
}

impl CoreContext {
    pub fn new(store: Arc<dyn StoreAdapter>, config: CoreConfig) -> Self {
        CoreContext {
            store,
            config,
            metrics: Arc::new(MetricsRegistry::new()),
        }
    }

    /// Context over an in-memory store with default configuration
    pub fn in_memory() -> Self {
        CoreContext::new(
            Arc::new(crate::store::MemoryStore::new()),
            CoreConfig::default(),
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_in_memory_context() {
        let context = CoreContext::in_memory();
        assert_eq!(context.config.max_active_keys_per_user, 10);
        assert!(context.store.get_session("absent").unwrap().is_none());
    }

    #[test]
    fn test_clone_shares_store() {
        let context = CoreContext::in_memory();
        let clone = context.clone();
        context
            .store
            .put_session(crate::store::tests::session_fixture("s1", "u1", 1))
            .unwrap();
        assert!(clone.store.get_session("s1").unwrap().is_some());
    }
}
