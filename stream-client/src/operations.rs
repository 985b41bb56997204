//! Operation queue: classify, deduplicate, debounce and dispatch.
//!
//! Incoming operations pass through four stages:
//!
//! 1. shape validation (rejections counted and surfaced via
//!    [`StreamingState::error`], never thrown)
//! 2. deduplication by `(kind, entity_type, id)` within a time window
//! 3. a bounded FIFO queue that drops its oldest entry when full
//! 4. a debounced drain that hands each operation to every handler
//!    registered for its routing type, in registration order
//!
//! Handler errors and panics are caught per handler, so one broken handler
//! cannot starve the others.

use async_trait::async_trait;
use fedistream_core::{now_millis, DedupCache, DedupKey, OperationQueue};
use fedistream_types::{RawEvent, StreamError, StreamingOperation};
use futures_util::FutureExt;
use std::collections::{BTreeSet, HashMap};
use std::panic::AssertUnwindSafe;
use std::sync::{Arc, Mutex, Weak};
use thiserror::Error;
use tokio::runtime::Handle;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{debug, error, trace, warn};

use crate::client::StreamingClient;
use crate::config::OperationsConfig;
use crate::events::{Channel, Subscription, TransportEvent};
use crate::lock;
use crate::transport::Transport;

/// Every routing type an operation can have.
pub const ROUTING_TYPES: [&str; 5] = ["timeline", "notification", "account", "delete", "edit"];

/// Handler errors.
#[derive(Debug, Error)]
pub enum HandlerError {
    /// The handler could not apply the operation.
    #[error("handler failed: {0}")]
    Failed(String),

    /// The operation did not fit what the handler expects.
    #[error(transparent)]
    Stream(#[from] StreamError),
}

/// Consumer of one routing type.
#[async_trait]
pub trait OperationHandler: Send + Sync {
    /// Routing type this handler accepts (see [`ROUTING_TYPES`]).
    fn handler_type(&self) -> &str;

    /// Apply one operation.
    async fn handle(&self, op: &StreamingOperation) -> Result<(), HandlerError>;
}

/// What happened to an operation handed to the queue.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Disposition {
    /// Accepted and waiting for the next drain.
    Queued,
    /// Same key seen within the deduplication window.
    Duplicate,
    /// Malformed or unclassifiable.
    Rejected,
    /// The manager has been destroyed.
    Destroyed,
}

/// Stream health as seen by the operation queue.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct StreamingState {
    /// At least one connected stream.
    pub is_streaming: bool,
    /// URLs of the connected streams feeding this manager.
    pub active_streams: BTreeSet<String>,
    /// Arrival time of the last message (ms since the Unix epoch).
    pub last_event_time: Option<u64>,
    /// Most recent error, cleared when a stream opens.
    pub error: Option<String>,
    /// Reconnect attempt currently scheduled (0 when healthy).
    pub reconnect_attempts: u32,
}

/// Queue counters.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct OperationStats {
    /// Operations offered (including rejected ones).
    pub received: u64,
    /// Operations dispatched to their handlers.
    pub processed: u64,
    /// Discarded as duplicates.
    pub deduplicated: u64,
    /// Discarded to respect the queue bound.
    pub dropped: u64,
    /// Malformed or unclassifiable.
    pub invalid: u64,
    /// Handler calls that returned an error or panicked.
    pub handler_failures: u64,
    /// Currently waiting for a drain.
    pub queued: usize,
}

/// Deduplicating, debounced, bounded operation queue.
///
/// Cheap to clone; clones share the queue.
#[derive(Clone)]
pub struct OperationsManager {
    inner: Arc<OpsInner>,
}

struct OpsInner {
    config: OperationsConfig,
    handlers: Mutex<HashMap<String, Vec<Arc<dyn OperationHandler>>>>,
    core: Mutex<OpsCore>,
    state: watch::Sender<StreamingState>,
    /// Serializes drains so operations are dispatched in FIFO order.
    drain: tokio::sync::Mutex<()>,
}

struct OpsCore {
    queue: OperationQueue,
    dedup: Option<DedupCache>,
    stats: OperationStats,
    debounce: Option<JoinHandle<()>>,
    debounce_seq: u64,
    subscriptions: Vec<Subscription>,
    destroyed: bool,
}

impl OperationsManager {
    /// Create a manager.
    pub fn new(config: OperationsConfig) -> Self {
        let core = OpsCore {
            queue: OperationQueue::new(config.max_queue_size),
            dedup: config.deduplication_window().map(DedupCache::new),
            stats: OperationStats::default(),
            debounce: None,
            debounce_seq: 0,
            subscriptions: Vec::new(),
            destroyed: false,
        };
        let (state, _) = watch::channel(StreamingState::default());

        Self {
            inner: Arc::new(OpsInner {
                config,
                handlers: Mutex::new(HashMap::new()),
                core: Mutex::new(core),
                state,
                drain: tokio::sync::Mutex::new(()),
            }),
        }
    }

    /// Add a handler for its declared routing type.
    pub fn register_handler(&self, handler: Arc<dyn OperationHandler>) {
        let handler_type = handler.handler_type().to_string();
        if !ROUTING_TYPES.contains(&handler_type.as_str()) {
            warn!(handler_type = %handler_type, "registered handler for unknown routing type");
        }
        debug!(handler_type = %handler_type, "handler registered");
        lock(&self.inner.handlers)
            .entry(handler_type)
            .or_default()
            .push(handler);
    }

    /// Remove every handler for `handler_type`. Returns how many were removed.
    pub fn unregister_handler(&self, handler_type: &str) -> usize {
        lock(&self.inner.handlers)
            .remove(handler_type)
            .map_or(0, |handlers| handlers.len())
    }

    /// Number of handlers registered for `handler_type`.
    pub fn handler_count(&self, handler_type: &str) -> usize {
        lock(&self.inner.handlers)
            .get(handler_type)
            .map_or(0, Vec::len)
    }

    /// Offer an operation to the queue.
    ///
    /// The debounced drain is a Tokio task. Outside a runtime the operation
    /// is still queued, but it is dispatched only by an explicit
    /// [`OperationsManager::flush`] or [`OperationsManager::process_queue`].
    pub fn process_operation(&self, op: StreamingOperation) -> Disposition {
        self.inner.process_operation(op)
    }

    /// Classify a stream record and offer the resulting operation.
    pub fn process_raw(&self, raw: &RawEvent) -> Disposition {
        self.inner.process_raw(raw)
    }

    /// Drain the queue now, dispatching every queued operation.
    ///
    /// Returns the number of operations dispatched.
    pub async fn process_queue(&self) -> usize {
        self.inner.process_queue().await
    }

    /// Cancel the pending debounce and drain immediately.
    pub async fn flush(&self) -> usize {
        {
            let mut core = lock(&self.inner.core);
            core.debounce_seq += 1;
            if let Some(handle) = core.debounce.take() {
                handle.abort();
            }
        }
        self.inner.process_queue().await
    }

    /// Feed this manager from `client` and track its health.
    pub fn setup_transport_listeners<T: Transport>(&self, client: &StreamingClient<T>) {
        let mut subscriptions = Vec::with_capacity(5);

        let weak = Arc::downgrade(&self.inner);
        subscriptions.push(client.on(Channel::Open, move |event| {
            if let TransportEvent::Open { url, .. } = event {
                with_inner(&weak, |inner| {
                    inner.state.send_modify(|s| {
                        s.active_streams.insert(url.clone());
                        s.is_streaming = true;
                        s.error = None;
                        s.reconnect_attempts = 0;
                    });
                })
            }
        }));

        let weak = Arc::downgrade(&self.inner);
        subscriptions.push(client.on(Channel::Message, move |event| {
            if let TransportEvent::Message(msg) = event {
                with_inner(&weak, |inner| {
                    inner
                        .state
                        .send_modify(|s| s.last_event_time = Some(now_millis()));
                    inner.process_raw(&msg.to_raw_event());
                })
            }
        }));

        let weak = Arc::downgrade(&self.inner);
        subscriptions.push(client.on(Channel::Error, move |event| {
            if let TransportEvent::Error { message, .. } = event {
                with_inner(&weak, |inner| {
                    inner.state.send_modify(|s| s.error = Some(message.clone()));
                })
            }
        }));

        let weak = Arc::downgrade(&self.inner);
        let url = client.config().url.clone();
        subscriptions.push(client.on(Channel::Closed, move |_| {
            with_inner(&weak, |inner| {
                inner.state.send_modify(|s| {
                    s.active_streams.remove(&url);
                    s.is_streaming = !s.active_streams.is_empty();
                });
            })
        }));

        let weak = Arc::downgrade(&self.inner);
        subscriptions.push(client.on(Channel::Reconnecting, move |event| {
            if let TransportEvent::Reconnecting { attempt, .. } = event {
                with_inner(&weak, |inner| {
                    inner.state.send_modify(|s| s.reconnect_attempts = *attempt);
                })
            }
        }));

        let mut core = lock(&self.inner.core);
        if core.destroyed {
            drop(core);
            for subscription in subscriptions {
                subscription.unsubscribe();
            }
            return;
        }
        core.subscriptions.extend(subscriptions);
    }

    /// Snapshot of stream health.
    pub fn state(&self) -> StreamingState {
        self.inner.state.borrow().clone()
    }

    /// Watch stream health.
    pub fn subscribe(&self) -> watch::Receiver<StreamingState> {
        self.inner.state.subscribe()
    }

    /// Snapshot of queue counters.
    pub fn stats(&self) -> OperationStats {
        let core = lock(&self.inner.core);
        OperationStats {
            queued: core.queue.len(),
            ..core.stats.clone()
        }
    }

    /// Detach from every transport, cancel the pending drain and forget all
    /// queued operations and handlers. Idempotent.
    pub fn destroy(&self) {
        let subscriptions = {
            let mut core = lock(&self.inner.core);
            if core.destroyed {
                return;
            }
            core.destroyed = true;
            core.debounce_seq += 1;
            if let Some(handle) = core.debounce.take() {
                handle.abort();
            }
            core.queue.clear();
            if let Some(dedup) = core.dedup.as_mut() {
                dedup.clear();
            }
            std::mem::take(&mut core.subscriptions)
        };
        for subscription in subscriptions {
            subscription.unsubscribe();
        }
        lock(&self.inner.handlers).clear();
        debug!("operations manager destroyed");
    }
}

fn with_inner(weak: &Weak<OpsInner>, f: impl FnOnce(&Arc<OpsInner>)) {
    if let Some(inner) = weak.upgrade() {
        f(&inner);
    }
}

impl OpsInner {
    fn process_operation(self: &Arc<Self>, op: StreamingOperation) -> Disposition {
        let mut core = lock(&self.core);
        if core.destroyed {
            return Disposition::Destroyed;
        }
        core.stats.received += 1;

        if let Err(e) = op.validate() {
            core.stats.invalid += 1;
            drop(core);
            warn!(error = %e, "rejected invalid operation");
            self.state.send_modify(|s| s.error = Some(e.to_string()));
            return Disposition::Rejected;
        }

        let now = tokio::time::Instant::now().into_std();
        if let Some(dedup) = core.dedup.as_mut() {
            if !dedup.check_and_record(DedupKey::of(&op), now) {
                core.stats.deduplicated += 1;
                trace!(kind = %op.kind(), key = %op.key(), "duplicate operation discarded");
                return Disposition::Duplicate;
            }
        }

        if let Some(dropped) = core.queue.push(op) {
            core.stats.dropped += 1;
            warn!(
                key = %dropped.key(),
                max = core.queue.capacity(),
                "operation queue full, dropped oldest operation"
            );
        }

        self.schedule_drain(&mut core);
        Disposition::Queued
    }

    fn process_raw(self: &Arc<Self>, raw: &RawEvent) -> Disposition {
        match StreamingOperation::from_raw(raw) {
            Ok(op) => self.process_operation(op),
            Err(e) => {
                let mut core = lock(&self.core);
                if core.destroyed {
                    return Disposition::Destroyed;
                }
                core.stats.received += 1;
                core.stats.invalid += 1;
                drop(core);

                // Stream-level events without an operation mapping are routine
                if let StreamError::UnrecognizedEvent(_) = e {
                    debug!(event = raw.event_name(), error = %e, "ignoring unclassifiable record");
                } else {
                    warn!(event = raw.event_name(), error = %e, "rejected malformed record");
                    self.state.send_modify(|s| s.error = Some(e.to_string()));
                }
                Disposition::Rejected
            }
        }
    }

    /// Restart the debounce timer.
    fn schedule_drain(self: &Arc<Self>, core: &mut OpsCore) {
        if let Some(handle) = core.debounce.take() {
            handle.abort();
        }
        core.debounce_seq += 1;

        let Ok(runtime) = Handle::try_current() else {
            warn!(queued = core.queue.len(), "no Tokio runtime, operations wait for flush");
            return;
        };
        let seq = core.debounce_seq;
        let delay = self.config.debounce();
        let inner = Arc::clone(self);

        core.debounce = Some(runtime.spawn(async move {
            tokio::time::sleep(delay).await;
            {
                let mut core = lock(&inner.core);
                if core.debounce_seq != seq {
                    return;
                }
                // Detach so operations arriving mid-drain schedule a new pass
                core.debounce = None;
            }
            inner.process_queue().await;
        }));
    }

    async fn process_queue(&self) -> usize {
        let _drain = self.drain.lock().await;
        let batch = {
            let mut core = lock(&self.core);
            if core.destroyed {
                return 0;
            }
            core.queue.drain()
        };
        if batch.is_empty() {
            return 0;
        }
        debug!(count = batch.len(), "draining operation queue");

        for op in &batch {
            let handlers: Vec<Arc<dyn OperationHandler>> = lock(&self.handlers)
                .get(op.routing_type())
                .cloned()
                .unwrap_or_default();
            if handlers.is_empty() {
                trace!(routing_type = op.routing_type(), "no handler for operation");
            }

            let mut failures = 0;
            for handler in handlers {
                match AssertUnwindSafe(handler.handle(op)).catch_unwind().await {
                    Ok(Ok(())) => {}
                    Ok(Err(e)) => {
                        failures += 1;
                        error!(
                            handler_type = handler.handler_type(),
                            key = %op.key(),
                            error = %e,
                            "operation handler failed"
                        );
                    }
                    Err(_) => {
                        failures += 1;
                        error!(
                            handler_type = handler.handler_type(),
                            key = %op.key(),
                            "operation handler panicked"
                        );
                    }
                }
            }

            let mut core = lock(&self.core);
            core.stats.processed += 1;
            core.stats.handler_failures += failures;
        }
        batch.len()
    }
}
