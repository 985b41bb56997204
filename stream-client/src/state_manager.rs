//! Shared state cache for async consumers.
//!
//! [`StreamingStateManager`] owns a [`StateCache`] behind a mutex, keeps a
//! log of rejected edits and exposes one [`OperationHandler`] per routing
//! type so the cache can be plugged straight into an
//! [`OperationsManager`].

use async_trait::async_trait;
use fedistream_core::{ApplyResult, CacheEntry, CacheStats, StateCache};
use fedistream_types::{EntityType, StreamingOperation};
use std::collections::VecDeque;
use std::sync::{Arc, Mutex};
use tokio::sync::watch;
use tracing::{debug, warn};

use crate::config::CacheConfig;
use crate::lock;
use crate::operations::{HandlerError, OperationHandler, OperationsManager, ROUTING_TYPES};

/// Most recent conflicts kept in the log.
const MAX_CONFLICT_LOG: usize = 100;

/// Cheap-to-clone handle on a shared [`StateCache`].
#[derive(Clone)]
pub struct StreamingStateManager {
    cache: Arc<Mutex<StateCache>>,
    conflicts: Arc<watch::Sender<VecDeque<String>>>,
}

impl StreamingStateManager {
    /// Create an empty cache.
    pub fn new(config: &CacheConfig) -> Self {
        let (conflicts, _) = watch::channel(VecDeque::new());
        Self {
            cache: Arc::new(Mutex::new(StateCache::with_capacity(config.max_entries))),
            conflicts: Arc::new(conflicts),
        }
    }

    /// Apply one operation and log any conflict it reports.
    pub fn apply_operation(&self, op: &StreamingOperation) -> ApplyResult {
        let result = lock(&self.cache).apply_operation(op);

        if !result.conflicts.is_empty() {
            warn!(conflicts = ?result.conflicts, kind = %op.kind(), "stale operation rejected");
            self.conflicts.send_modify(|log| {
                for key in &result.conflicts {
                    if log.len() == MAX_CONFLICT_LOG {
                        log.pop_front();
                    }
                    log.push_back(key.clone());
                }
            });
        } else {
            debug!(
                key = %op.key(),
                kind = %op.kind(),
                applied = result.applied,
                "operation applied"
            );
        }
        result
    }

    /// Look up one entity.
    pub fn get_cached_item(&self, id: &str, entity_type: EntityType) -> Option<CacheEntry> {
        lock(&self.cache).get_cached_item(id, entity_type).cloned()
    }

    /// Every cached entity of one type.
    pub fn items_of(&self, entity_type: EntityType) -> Vec<CacheEntry> {
        lock(&self.cache).items_of(entity_type).cloned().collect()
    }

    /// Cache counters.
    pub fn get_cache_stats(&self) -> CacheStats {
        lock(&self.cache).get_cache_stats()
    }

    /// Drop one entity.
    pub fn evict(&self, entity_type: EntityType, id: &str) -> Option<CacheEntry> {
        lock(&self.cache).evict(entity_type, id)
    }

    /// Drop everything, including the conflict log.
    pub fn clear_cache(&self) {
        lock(&self.cache).clear_cache();
        self.conflicts.send_modify(VecDeque::clear);
    }

    /// Keys (`type:id`) of recently rejected operations, oldest first.
    pub fn conflicts(&self) -> Vec<String> {
        self.conflicts.borrow().iter().cloned().collect()
    }

    /// Watch the conflict log.
    pub fn subscribe_conflicts(&self) -> watch::Receiver<VecDeque<String>> {
        self.conflicts.subscribe()
    }

    /// One handler per routing type, all writing to this cache.
    pub fn handlers(&self) -> Vec<Arc<dyn OperationHandler>> {
        ROUTING_TYPES
            .iter()
            .map(|&routing| {
                Arc::new(CacheHandler {
                    routing,
                    manager: self.clone(),
                }) as Arc<dyn OperationHandler>
            })
            .collect()
    }

    /// Register [`StreamingStateManager::handlers`] with `operations`.
    pub fn register(&self, operations: &OperationsManager) {
        for handler in self.handlers() {
            operations.register_handler(handler);
        }
    }
}

struct CacheHandler {
    routing: &'static str,
    manager: StreamingStateManager,
}

#[async_trait]
impl OperationHandler for CacheHandler {
    fn handler_type(&self) -> &str {
        self.routing
    }

    async fn handle(&self, op: &StreamingOperation) -> Result<(), HandlerError> {
        // Conflicts are recorded in the log, not treated as handler failures
        self.manager.apply_operation(op);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::OperationsConfig;
    use serde_json::json;
    use std::time::Duration;

    fn manager() -> StreamingStateManager {
        StreamingStateManager::new(&CacheConfig::default())
    }

    #[test]
    fn stale_edit_is_logged_as_conflict() {
        let state = manager();
        state.apply_operation(
            &StreamingOperation::update(EntityType::Status, "1", json!({"text": "v5"}))
                .with_version(5),
        );

        let result = state.apply_operation(&StreamingOperation::edit(
            EntityType::Status,
            "1",
            json!({"text": "v3"}),
            Some(3),
        ));

        assert!(!result.applied);
        assert_eq!(state.conflicts(), vec!["status:1".to_string()]);
        assert_eq!(
            state.get_cached_item("1", EntityType::Status).unwrap().entity["text"],
            "v5"
        );
        assert_eq!(state.get_cache_stats().conflicts, 1);
    }

    #[test]
    fn conflict_log_is_bounded() {
        let state = manager();
        state.apply_operation(
            &StreamingOperation::update(EntityType::Status, "1", json!({})).with_version(10),
        );
        for _ in 0..(MAX_CONFLICT_LOG + 5) {
            state.apply_operation(&StreamingOperation::edit(
                EntityType::Status,
                "1",
                json!({}),
                Some(1),
            ));
        }
        assert_eq!(state.conflicts().len(), MAX_CONFLICT_LOG);

        state.clear_cache();
        assert!(state.conflicts().is_empty());
        assert_eq!(state.get_cache_stats().total, 0);
    }

    #[test]
    fn capacity_comes_from_config() {
        let state = StreamingStateManager::new(&CacheConfig {
            max_entries: Some(1),
        });
        state.apply_operation(&StreamingOperation::update(EntityType::Account, "a", json!({})));
        state.apply_operation(&StreamingOperation::update(EntityType::Account, "b", json!({})));

        assert!(state.get_cached_item("a", EntityType::Account).is_none());
        assert_eq!(state.items_of(EntityType::Account).len(), 1);
        assert_eq!(state.get_cache_stats().evictions, 1);
    }

    #[test]
    fn evict_removes_single_entity() {
        let state = manager();
        state.apply_operation(&StreamingOperation::update(EntityType::Status, "1", json!({})));
        assert!(state.evict(EntityType::Status, "1").is_some());
        assert!(state.evict(EntityType::Status, "1").is_none());
    }

    #[test]
    fn handlers_cover_every_routing_type() {
        let handlers = manager().handlers();
        let types: Vec<&str> = handlers.iter().map(|h| h.handler_type()).collect();
        assert_eq!(types, ROUTING_TYPES.to_vec());
    }

    #[tokio::test(start_paused = true)]
    async fn registered_cache_follows_the_queue() {
        let state = manager();
        let operations = OperationsManager::new(
            OperationsConfig::default().with_debounce(Duration::from_millis(10)),
        );
        state.register(&operations);

        operations.process_operation(StreamingOperation::update(
            EntityType::Status,
            "1",
            json!({"text": "hello"}),
        ));
        operations.process_operation(StreamingOperation::update(
            EntityType::Account,
            "a",
            json!({"acct": "alice"}),
        ));
        operations.process_operation(StreamingOperation::delete(EntityType::Status, "1"));
        tokio::time::sleep(Duration::from_millis(20)).await;

        assert!(state.get_cached_item("1", EntityType::Status).is_none());
        assert_eq!(
            state.get_cached_item("a", EntityType::Account).unwrap().entity["acct"],
            "alice"
        );
        assert_eq!(operations.stats().handler_failures, 0);
    }
}
