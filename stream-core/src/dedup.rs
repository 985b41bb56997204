//! Deduplication of near-identical operations.
//!
//! Streaming backends routinely deliver the same logical change twice (a
//! reconnect replays from the last event id, or a federated post arrives via
//! two relays). Operations are keyed by `(kind, entity_type, id)`; a key
//! seen again within the window is a repeat and should be discarded.
//!
//! Time is passed in by the caller, keeping this module pure.

use fedistream_types::{EntityType, OperationKind, StreamingOperation};
use std::collections::HashMap;
use std::time::{Duration, Instant};

/// Identity of an operation for deduplication purposes.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct DedupKey {
    /// Operation discriminant.
    pub kind: OperationKind,
    /// Target entity kind.
    pub entity_type: EntityType,
    /// Target entity id.
    pub id: String,
}

impl DedupKey {
    /// Key for an operation.
    pub fn of(op: &StreamingOperation) -> Self {
        Self {
            kind: op.kind(),
            entity_type: op.entity_type(),
            id: op.id().to_string(),
        }
    }
}

/// Time-windowed set of recently processed keys.
#[derive(Debug, Clone)]
pub struct DedupCache {
    window: Duration,
    seen: HashMap<DedupKey, Instant>,
}

impl DedupCache {
    /// Create a cache whose entries expire after `window`.
    pub fn new(window: Duration) -> Self {
        Self {
            window,
            seen: HashMap::new(),
        }
    }

    /// Record `key` at `now` unless it is a repeat.
    ///
    /// Returns `true` if the key is fresh (caller should process it) and
    /// `false` if the same key was recorded less than one window ago. A
    /// repeat does not extend the window.
    pub fn check_and_record(&mut self, key: DedupKey, now: Instant) -> bool {
        self.prune(now);
        if self.seen.contains_key(&key) {
            return false;
        }
        self.seen.insert(key, now);
        true
    }

    /// Drop every entry older than the window.
    pub fn prune(&mut self, now: Instant) {
        let window = self.window;
        self.seen
            .retain(|_, recorded| now.saturating_duration_since(*recorded) < window);
    }

    /// Number of keys currently remembered.
    pub fn len(&self) -> usize {
        self.seen.len()
    }

    /// Check if nothing is remembered.
    pub fn is_empty(&self) -> bool {
        self.seen.is_empty()
    }

    /// Forget everything.
    pub fn clear(&mut self) {
        self.seen.clear();
    }
}
