//! Authoritative entity cache with conflict detection.
//!
//! One [`CacheEntry`] exists per `(entity_type, id)`. Operations are applied
//! with last-writer-wins by version:
//! - Update always applies (upsert)
//! - Delete always applies, even when the entry is already gone
//! - Edit is rejected and reported as a conflict when the cached version is
//!   strictly newer than the incoming one
//!
//! The cache never decides how to resolve a conflict; it reports the entity
//! key so the caller can re-fetch.

use fedistream_types::{
    DeleteOperation, EditOperation, EntityKey, EntityType, StreamingOperation, UpdateOperation,
};
use serde_json::Value;
use std::collections::HashMap;
use std::time::{SystemTime, UNIX_EPOCH};

/// Materialized entity plus its version marker.
#[derive(Debug, Clone, PartialEq)]
pub struct CacheEntry {
    /// Entity kind.
    pub entity_type: EntityType,
    /// Backend id.
    pub id: String,
    /// Current entity JSON.
    pub entity: Value,
    /// Monotonic version used for conflict checks.
    pub version: u64,
    /// When the entry was last written (ms since the Unix epoch).
    pub updated_at: u64,
}

/// Outcome of applying one operation.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ApplyResult {
    /// Whether the cache changed (or, for deletes, is now in the requested state).
    pub applied: bool,
    /// Keys (`type:id`) of entities whose update was rejected as stale.
    pub conflicts: Vec<String>,
}

impl ApplyResult {
    fn applied() -> Self {
        Self {
            applied: true,
            conflicts: Vec::new(),
        }
    }
}

/// Snapshot of cache counters.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CacheStats {
    /// Entries currently cached.
    pub total: usize,
    /// Cached statuses.
    pub statuses: usize,
    /// Cached accounts.
    pub accounts: usize,
    /// Cached notifications.
    pub notifications: usize,
    /// Edits rejected as stale since creation.
    pub conflicts: u64,
    /// Entries dropped to respect the capacity.
    pub evictions: u64,
    /// Configured capacity, if any.
    pub max_entries: Option<usize>,
}

#[derive(Debug, Clone)]
struct Slot {
    entry: CacheEntry,
    /// Write order, for least-recently-updated eviction.
    seq: u64,
}

/// In-memory entity cache keyed by [`EntityKey`].
#[derive(Debug, Clone, Default)]
pub struct StateCache {
    entries: HashMap<EntityKey, Slot>,
    max_entries: Option<usize>,
    seq: u64,
    conflicts: u64,
    evictions: u64,
}

impl StateCache {
    /// Create an unbounded cache.
    pub fn new() -> Self {
        Self::default()
    }

    /// Create a cache holding at most `max_entries` entries (None = unbounded).
    ///
    /// When full, the least recently updated entry is evicted.
    pub fn with_capacity(max_entries: Option<usize>) -> Self {
        Self {
            max_entries: max_entries.map(|max| max.max(1)),
            ..Self::default()
        }
    }

    /// Apply an operation, stamping writes with the current wall clock.
    pub fn apply_operation(&mut self, op: &StreamingOperation) -> ApplyResult {
        self.apply_operation_at(op, now_millis())
    }

    /// Apply an operation with an explicit write timestamp.
    pub fn apply_operation_at(&mut self, op: &StreamingOperation, now_ms: u64) -> ApplyResult {
        match op {
            StreamingOperation::Update(update) => self.apply_update(update, now_ms),
            StreamingOperation::Delete(delete) => self.apply_delete(delete),
            StreamingOperation::Edit(edit) => self.apply_edit(edit, now_ms),
        }
    }

    /// Look up one entity.
    pub fn get_cached_item(&self, id: &str, entity_type: EntityType) -> Option<&CacheEntry> {
        self.entries
            .get(&EntityKey::new(entity_type, id))
            .map(|slot| &slot.entry)
    }

    /// All cached entities of one type, in no particular order.
    pub fn items_of(&self, entity_type: EntityType) -> impl Iterator<Item = &CacheEntry> {
        self.entries
            .values()
            .map(|slot| &slot.entry)
            .filter(move |entry| entry.entity_type == entity_type)
    }

    /// Counters for observability.
    pub fn get_cache_stats(&self) -> CacheStats {
        let count = |ty: EntityType| self.items_of(ty).count();
        CacheStats {
            total: self.entries.len(),
            statuses: count(EntityType::Status),
            accounts: count(EntityType::Account),
            notifications: count(EntityType::Notification),
            conflicts: self.conflicts,
            evictions: self.evictions,
            max_entries: self.max_entries,
        }
    }

    /// Remove one entity, returning it if it was cached.
    pub fn evict(&mut self, entity_type: EntityType, id: &str) -> Option<CacheEntry> {
        self.entries
            .remove(&EntityKey::new(entity_type, id))
            .map(|slot| slot.entry)
    }

    /// Remove every entity. Counters are kept.
    pub fn clear_cache(&mut self) {
        self.entries.clear();
    }

    /// Number of cached entities.
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// Check if the cache is empty.
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    fn apply_update(&mut self, op: &UpdateOperation, now_ms: u64) -> ApplyResult {
        let key = EntityKey::new(op.entity_type, op.id.clone());
        let version = op.version.unwrap_or_else(|| self.next_version(&key));
        self.write(key, op.payload.clone(), version, now_ms);
        ApplyResult::applied()
    }

    fn apply_delete(&mut self, op: &DeleteOperation) -> ApplyResult {
        self.entries.remove(&EntityKey::new(op.entity_type, op.id.clone()));
        ApplyResult::applied()
    }

    fn apply_edit(&mut self, op: &EditOperation, now_ms: u64) -> ApplyResult {
        let key = EntityKey::new(op.entity_type, op.id.clone());

        if let (Some(slot), Some(incoming)) = (self.entries.get(&key), op.version) {
            if slot.entry.version > incoming {
                self.conflicts += 1;
                return ApplyResult {
                    applied: false,
                    conflicts: vec![key.to_string()],
                };
            }
        }

        let version = op.version.unwrap_or_else(|| self.next_version(&key));
        self.write(key, op.payload.clone(), version, now_ms);
        ApplyResult::applied()
    }

    fn next_version(&self, key: &EntityKey) -> u64 {
        self.entries
            .get(key)
            .map(|slot| slot.entry.version.saturating_add(1))
            .unwrap_or(1)
    }

    fn write(&mut self, key: EntityKey, entity: Value, version: u64, now_ms: u64) {
        self.seq += 1;
        let entry = CacheEntry {
            entity_type: key.entity_type,
            id: key.id.clone(),
            entity,
            version,
            updated_at: now_ms,
        };
        let is_new = self
            .entries
            .insert(
                key.clone(),
                Slot {
                    entry,
                    seq: self.seq,
                },
            )
            .is_none();

        if is_new {
            self.enforce_capacity(&key);
        }
    }

    fn enforce_capacity(&mut self, keep: &EntityKey) {
        let Some(max) = self.max_entries else {
            return;
        };
        while self.entries.len() > max {
            let oldest = self
                .entries
                .iter()
                .filter(|(key, _)| *key != keep)
                .min_by_key(|(_, slot)| slot.seq)
                .map(|(key, _)| key.clone());
            match oldest {
                Some(key) => {
                    self.entries.remove(&key);
                    self.evictions += 1;
                }
                None => break,
            }
        }
    }
}

/// Current wall clock in milliseconds since the Unix epoch.
pub fn now_millis() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as u64)
        .unwrap_or(0)
}
