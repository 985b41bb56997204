//! Optimistic updates with rollback and timeout.
//!
//! [`OptimisticManager`] is a ledger of pending local mutations layered over
//! some base state. Each entry pairs a forward transform (what the UI shows
//! right away) with a rollback transform, and is settled exactly once by an
//! asynchronous confirming operation:
//!
//! - the operation succeeds: the entry is **confirmed**
//! - it fails, times out, is cancelled by [`OptimisticManager::clear`] or the
//!   caller stops awaiting it: the entry is **reverted**
//!
//! Settled entries leave the ledger, so [`OptimisticManager::apply_all`]
//! over the base state always shows exactly the still-pending mutations.
//!
//! [`OptimisticState`] is the single-value variant: it owns the state in a
//! watch channel and applies the rollback itself on failure.

use std::fmt;
use std::future::Future;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use thiserror::Error;
use tokio::sync::{oneshot, watch};
use tracing::{debug, warn};

use crate::config::OptimisticConfig;
use crate::lock;

/// Optimistic update errors.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum OptimisticError {
    /// An update with this id is already pending.
    #[error("optimistic update {0:?} is already pending")]
    DuplicateId(String),

    /// The ledger is full.
    #[error("too many pending optimistic updates (max {0})")]
    MaxPending(usize),

    /// The confirming operation failed.
    #[error("operation failed: {0}")]
    Failed(String),

    /// The confirming operation did not finish in time.
    #[error("operation timed out after {0:?}")]
    Timeout(Duration),

    /// The ledger was cleared while the operation was in flight.
    #[error("optimistic update cancelled")]
    Cancelled,
}

/// Ledger counters.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct OptimisticStats {
    /// Entries ever registered.
    pub total: u64,
    /// Entries whose operation succeeded.
    pub confirmed: u64,
    /// Entries rolled back for any reason.
    pub reverted: u64,
    /// Entries still waiting.
    pub pending: usize,
}

type Transform<S> = Arc<dyn Fn(&S) -> S + Send + Sync>;

struct PendingUpdate<S> {
    seq: u64,
    id: String,
    forward: Transform<S>,
    rollback: Transform<S>,
    cancel: oneshot::Sender<()>,
}

struct Ledger<S> {
    pending: Vec<PendingUpdate<S>>,
    next_seq: u64,
    total: u64,
    confirmed: u64,
    reverted: u64,
}

impl<S> Ledger<S> {
    /// Remove entry `seq` if it is still pending. Returns its id.
    fn settle(&mut self, seq: u64, confirmed: bool) -> Option<String> {
        let pos = self.pending.iter().position(|p| p.seq == seq)?;
        let entry = self.pending.remove(pos);
        if confirmed {
            self.confirmed += 1;
        } else {
            self.reverted += 1;
        }
        Some(entry.id)
    }
}

/// Ledger of pending optimistic updates over state `S`.
///
/// Cheap to clone; clones share the ledger.
pub struct OptimisticManager<S> {
    ledger: Arc<Mutex<Ledger<S>>>,
    timeout: Duration,
    max_pending: usize,
}

impl<S> Clone for OptimisticManager<S> {
    fn clone(&self) -> Self {
        Self {
            ledger: Arc::clone(&self.ledger),
            timeout: self.timeout,
            max_pending: self.max_pending,
        }
    }
}

impl<S> fmt::Debug for OptimisticManager<S> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("OptimisticManager")
            .field("timeout", &self.timeout)
            .field("max_pending", &self.max_pending)
            .field("stats", &self.stats())
            .finish()
    }
}

/// Reverts its entry unless disarmed; covers callers that stop awaiting.
struct SettleGuard<'a, S> {
    ledger: &'a Mutex<Ledger<S>>,
    seq: u64,
    armed: bool,
}

impl<S> SettleGuard<'_, S> {
    fn settle(mut self, confirmed: bool) -> Option<String> {
        self.armed = false;
        lock(self.ledger).settle(self.seq, confirmed)
    }
}

impl<S> Drop for SettleGuard<'_, S> {
    fn drop(&mut self) {
        if self.armed {
            if let Some(id) = lock(self.ledger).settle(self.seq, false) {
                debug!(id = %id, "optimistic update abandoned, reverted");
            }
        }
    }
}

impl<S> OptimisticManager<S> {
    /// Create an empty ledger.
    pub fn new(config: &OptimisticConfig) -> Self {
        Self {
            ledger: Arc::new(Mutex::new(Ledger {
                pending: Vec::new(),
                next_seq: 0,
                total: 0,
                confirmed: 0,
                reverted: 0,
            })),
            timeout: config.timeout(),
            max_pending: config.max_pending.max(1),
        }
    }

    /// Register an optimistic update and settle it with `operation`.
    ///
    /// The forward transform takes effect in [`Self::apply_all`] as soon as
    /// this is called. It fails fast with [`OptimisticError::DuplicateId`]
    /// or [`OptimisticError::MaxPending`] without touching the ledger.
    /// Otherwise the entry is confirmed if `operation` succeeds, and reverted
    /// if it fails, times out, or the ledger is cleared first. Dropping the
    /// returned future before it completes also reverts the entry.
    pub async fn add<F, R, Fut, T, E>(
        &self,
        id: impl Into<String>,
        forward: F,
        rollback: R,
        operation: Fut,
    ) -> Result<T, OptimisticError>
    where
        F: Fn(&S) -> S + Send + Sync + 'static,
        R: Fn(&S) -> S + Send + Sync + 'static,
        Fut: Future<Output = Result<T, E>>,
        E: fmt::Display,
    {
        let id = id.into();
        let (cancel, cancelled) = oneshot::channel();
        let seq = {
            let mut ledger = lock(&self.ledger);
            if ledger.pending.iter().any(|p| p.id == id) {
                return Err(OptimisticError::DuplicateId(id));
            }
            if ledger.pending.len() >= self.max_pending {
                return Err(OptimisticError::MaxPending(self.max_pending));
            }
            ledger.next_seq += 1;
            ledger.total += 1;
            let seq = ledger.next_seq;
            ledger.pending.push(PendingUpdate {
                seq,
                id: id.clone(),
                forward: Arc::new(forward),
                rollback: Arc::new(rollback),
                cancel,
            });
            seq
        };
        debug!(id = %id, "optimistic update applied");

        let guard = SettleGuard {
            ledger: &self.ledger,
            seq,
            armed: true,
        };

        let outcome = tokio::select! {
            result = tokio::time::timeout(self.timeout, operation) => match result {
                Ok(Ok(value)) => Ok(value),
                Ok(Err(e)) => Err(OptimisticError::Failed(e.to_string())),
                Err(_) => Err(OptimisticError::Timeout(self.timeout)),
            },
            _ = cancelled => Err(OptimisticError::Cancelled),
        };

        match &outcome {
            Ok(_) => {
                guard.settle(true);
                debug!(id = %id, "optimistic update confirmed");
            }
            Err(OptimisticError::Cancelled) => {
                // clear() already reverted and counted the entry
                guard.settle(false);
            }
            Err(e) => {
                guard.settle(false);
                warn!(id = %id, error = %e, "optimistic update reverted");
            }
        }
        outcome
    }

    /// Fold every pending forward transform over `base`, oldest first.
    ///
    /// `base` is not modified; calling this twice gives the same result.
    pub fn apply_all(&self, base: &S) -> S
    where
        S: Clone,
    {
        let forwards: Vec<Transform<S>> = lock(&self.ledger)
            .pending
            .iter()
            .map(|p| Arc::clone(&p.forward))
            .collect();
        forwards
            .iter()
            .fold(base.clone(), |state, forward| forward(&state))
    }

    /// Fold every pending rollback transform over `state`, newest first.
    pub fn rollback_all(&self, state: &S) -> S
    where
        S: Clone,
    {
        let rollbacks: Vec<Transform<S>> = lock(&self.ledger)
            .pending
            .iter()
            .map(|p| Arc::clone(&p.rollback))
            .collect();
        rollbacks
            .iter()
            .rev()
            .fold(state.clone(), |state, rollback| rollback(&state))
    }

    /// Ids of pending entries, oldest first.
    pub fn pending_ids(&self) -> Vec<String> {
        lock(&self.ledger)
            .pending
            .iter()
            .map(|p| p.id.clone())
            .collect()
    }

    /// Check if `id` is pending.
    pub fn is_pending(&self, id: &str) -> bool {
        lock(&self.ledger).pending.iter().any(|p| p.id == id)
    }

    /// Ledger counters.
    pub fn stats(&self) -> OptimisticStats {
        let ledger = lock(&self.ledger);
        OptimisticStats {
            total: ledger.total,
            confirmed: ledger.confirmed,
            reverted: ledger.reverted,
            pending: ledger.pending.len(),
        }
    }

    /// Revert every pending entry; their callers get
    /// [`OptimisticError::Cancelled`].
    pub fn clear(&self) {
        let cleared = {
            let mut ledger = lock(&self.ledger);
            let cleared = std::mem::take(&mut ledger.pending);
            ledger.reverted += cleared.len() as u64;
            cleared
        };
        if !cleared.is_empty() {
            debug!(count = cleared.len(), "optimistic ledger cleared");
        }
        for entry in cleared {
            // The caller may already be gone
            let _ = entry.cancel.send(());
        }
    }
}

/// A single optimistic value.
///
/// `update` applies its forward transform immediately and, if the confirming
/// operation fails, applies the rollback transform to whatever the value is
/// at that moment (so concurrent updates are not clobbered).
#[derive(Debug)]
pub struct OptimisticState<S> {
    value: watch::Sender<S>,
}

impl<S> OptimisticState<S> {
    /// Create with an initial value.
    pub fn new(initial: S) -> Self {
        let (value, _) = watch::channel(initial);
        Self { value }
    }

    /// Current value.
    pub fn get(&self) -> S
    where
        S: Clone,
    {
        self.value.borrow().clone()
    }

    /// Replace the value (e.g. with server truth).
    pub fn set(&self, value: S) {
        self.value.send_replace(value);
    }

    /// Watch the value.
    pub fn subscribe(&self) -> watch::Receiver<S> {
        self.value.subscribe()
    }

    /// Apply `forward` now, then settle with `operation`.
    pub async fn update<T, E, Fut>(
        &self,
        forward: impl FnOnce(&S) -> S,
        rollback: impl FnOnce(&S) -> S,
        operation: Fut,
    ) -> Result<T, E>
    where
        Fut: Future<Output = Result<T, E>>,
    {
        self.value.send_modify(|value| {
            let next = forward(value);
            *value = next;
        });

        match operation.await {
            Ok(result) => Ok(result),
            Err(e) => {
                self.value.send_modify(|value| {
                    let previous = rollback(value);
                    *value = previous;
                });
                Err(e)
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::future::pending;

    #[derive(Debug, Clone, PartialEq)]
    struct Post {
        liked: bool,
        likes: u32,
    }

    fn base() -> Post {
        Post {
            liked: false,
            likes: 10,
        }
    }

    fn like(p: &Post) -> Post {
        Post {
            liked: true,
            likes: p.likes + 1,
        }
    }

    fn unlike(p: &Post) -> Post {
        Post {
            liked: false,
            likes: p.likes.saturating_sub(1),
        }
    }

    fn manager(max_pending: usize) -> OptimisticManager<Post> {
        OptimisticManager::new(
            &OptimisticConfig::default()
                .with_timeout(Duration::from_secs(5))
                .with_max_pending(max_pending),
        )
    }

    async fn ok() -> Result<&'static str, String> {
        Ok("done")
    }

    async fn fail() -> Result<&'static str, String> {
        Err("500 from server".into())
    }

    /// Let a spawned `add` register itself.
    async fn settle() {
        tokio::time::sleep(Duration::from_millis(1)).await;
    }

    // ===========================================
    // OptimisticManager Tests
    // ===========================================

    #[tokio::test]
    async fn confirmed_update_leaves_ledger() {
        let ledger = manager(10);
        let result = ledger.add("like-1", like, unlike, ok()).await;

        assert_eq!(result, Ok("done"));
        assert!(!ledger.is_pending("like-1"));
        let stats = ledger.stats();
        assert_eq!((stats.total, stats.confirmed, stats.reverted), (1, 1, 0));
        assert_eq!(ledger.apply_all(&base()), base());
    }

    #[tokio::test]
    async fn failed_update_is_reverted() {
        let ledger = manager(10);
        let result = ledger.add("like-1", like, unlike, fail()).await;

        assert_eq!(result, Err(OptimisticError::Failed("500 from server".into())));
        assert_eq!(ledger.stats().reverted, 1);
        assert_eq!(ledger.apply_all(&base()), base());
    }

    #[tokio::test(start_paused = true)]
    async fn pending_update_shows_in_apply_all() {
        let ledger = manager(10);
        let task = {
            let ledger = ledger.clone();
            tokio::spawn(async move {
                ledger
                    .add("like-1", like, unlike, pending::<Result<(), String>>())
                    .await
            })
        };
        settle().await;

        let shown = ledger.apply_all(&base());
        assert_eq!(shown, Post { liked: true, likes: 11 });
        // Pure fold: applying twice gives the same view
        assert_eq!(ledger.apply_all(&base()), shown);
        assert_eq!(ledger.rollback_all(&shown), base());
        assert_eq!(ledger.pending_ids(), vec!["like-1".to_string()]);

        task.abort();
    }

    #[tokio::test(start_paused = true)]
    async fn timeout_reverts_entry() {
        let ledger = manager(10);
        let task = {
            let ledger = ledger.clone();
            tokio::spawn(async move {
                ledger
                    .add("like-1", like, unlike, pending::<Result<(), String>>())
                    .await
            })
        };

        tokio::time::sleep(Duration::from_secs(6)).await;

        assert_eq!(
            task.await.unwrap(),
            Err(OptimisticError::Timeout(Duration::from_secs(5)))
        );
        let stats = ledger.stats();
        assert_eq!(stats.reverted, 1);
        assert_eq!(stats.pending, 0);
    }

    #[tokio::test(start_paused = true)]
    async fn duplicate_id_fails_fast_without_touching_pending_entry() {
        let ledger = manager(10);
        let first = {
            let ledger = ledger.clone();
            tokio::spawn(async move {
                ledger
                    .add("like-1", like, unlike, pending::<Result<(), String>>())
                    .await
            })
        };
        settle().await;

        let second = ledger.add("like-1", like, unlike, ok()).await;
        assert_eq!(second, Err(OptimisticError::DuplicateId("like-1".into())));
        assert!(ledger.is_pending("like-1"));
        assert_eq!(ledger.stats().total, 1);

        first.abort();
    }

    #[tokio::test(start_paused = true)]
    async fn max_pending_fails_fast() {
        let ledger = manager(1);
        let first = {
            let ledger = ledger.clone();
            tokio::spawn(async move {
                ledger
                    .add("a", like, unlike, pending::<Result<(), String>>())
                    .await
            })
        };
        settle().await;

        let second = ledger.add("b", like, unlike, ok()).await;
        assert_eq!(second, Err(OptimisticError::MaxPending(1)));
        assert_eq!(ledger.pending_ids(), vec!["a".to_string()]);

        first.abort();
    }

    #[tokio::test(start_paused = true)]
    async fn dropping_the_future_reverts() {
        let ledger = manager(10);
        let task = {
            let ledger = ledger.clone();
            tokio::spawn(async move {
                ledger
                    .add("like-1", like, unlike, pending::<Result<(), String>>())
                    .await
            })
        };
        settle().await;
        assert!(ledger.is_pending("like-1"));

        task.abort();
        settle().await;

        assert!(!ledger.is_pending("like-1"));
        assert_eq!(ledger.stats().reverted, 1);
    }

    #[tokio::test(start_paused = true)]
    async fn clear_cancels_every_pending_caller() {
        let ledger = manager(10);
        let mut tasks = Vec::new();
        for id in ["a", "b"] {
            let ledger = ledger.clone();
            tasks.push(tokio::spawn(async move {
                ledger
                    .add(id, like, unlike, pending::<Result<(), String>>())
                    .await
            }));
        }
        settle().await;

        ledger.clear();
        for task in tasks {
            assert_eq!(task.await.unwrap(), Err(OptimisticError::Cancelled));
        }

        let stats = ledger.stats();
        assert_eq!((stats.total, stats.reverted, stats.pending), (2, 2, 0));
    }

    #[tokio::test(start_paused = true)]
    async fn forwards_apply_in_insertion_order() {
        let ledger: OptimisticManager<Vec<&'static str>> =
            OptimisticManager::new(&OptimisticConfig::default());
        let mut tasks = Vec::new();
        for (id, item) in [("1", "first"), ("2", "second")] {
            let ledger = ledger.clone();
            tasks.push(tokio::spawn(async move {
                ledger
                    .add(
                        id,
                        move |s: &Vec<&'static str>| {
                            let mut next = s.clone();
                            next.push(item);
                            next
                        },
                        |s: &Vec<&'static str>| s.clone(),
                        pending::<Result<(), String>>(),
                    )
                    .await
            }));
            settle().await;
        }

        assert_eq!(ledger.apply_all(&Vec::new()), vec!["first", "second"]);
        for task in tasks {
            task.abort();
        }
    }

    // ===========================================
    // OptimisticState Tests
    // ===========================================

    #[tokio::test]
    async fn state_update_keeps_value_on_success() {
        let state = OptimisticState::new(base());
        let result: Result<(), String> = state.update(like, unlike, async { Ok(()) }).await;

        assert!(result.is_ok());
        assert_eq!(state.get(), Post { liked: true, likes: 11 });
    }

    #[tokio::test]
    async fn state_rollback_applies_to_current_value() {
        let state = Arc::new(OptimisticState::new(base()));
        let (release, released) = oneshot::channel::<()>();

        let update = {
            let state = Arc::clone(&state);
            tokio::spawn(async move {
                state
                    .update(like, unlike, async move {
                        let _ = released.await;
                        Err::<(), _>("rejected")
                    })
                    .await
            })
        };
        tokio::task::yield_now().await;
        assert_eq!(state.get().likes, 11);

        // Server truth arrives while the request is in flight
        state.set(Post {
            liked: true,
            likes: 20,
        });
        release.send(()).unwrap();

        assert_eq!(update.await.unwrap(), Err("rejected"));
        assert_eq!(
            state.get(),
            Post {
                liked: false,
                likes: 19
            }
        );
    }

    #[tokio::test]
    async fn state_subscribers_see_changes() {
        let state = OptimisticState::new(1u32);
        let mut rx = state.subscribe();

        state.set(2);
        rx.changed().await.unwrap();
        assert_eq!(*rx.borrow(), 2);
    }
}
