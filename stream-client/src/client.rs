//! StreamingClient - one resilient connection to a streaming endpoint.
//!
//! This module provides [`StreamingClient`], which keeps a stream open,
//! decodes its records and reports everything through typed listeners.
//!
//! # Architecture
//!
//! StreamingClient uses a pure state machine (from stream-core) for the
//! connection lifecycle and interprets the actions it returns to perform
//! the actual I/O via the Transport trait.
//!
//! ```text
//! Listeners ← StreamingClient → Transport / NativeEventSource → Network
//!                   ↓
//!              stream-core (state machine, backoff, decoder)
//! ```
//!
//! Three kinds of background task exist per client: the connection driver
//! (open, decode, report), the heartbeat ticker and the reconnect timer.
//! Each is owned through a `JoinHandle` and aborted when the state machine
//! says so. Every driver and timer carries a generation number; events from
//! a superseded task are ignored.
//!
//! # Example
//!
//! ```ignore
//! use fedistream_client::{Channel, HttpTransport, StreamingClient, TransportConfig};
//!
//! let config = TransportConfig::new("https://social.example/api/v1/streaming/user")
//!     .with_header("Authorization", "Bearer token");
//! let client = StreamingClient::new(config, HttpTransport::new()?);
//!
//! client.on(Channel::Message, |event| println!("{:?}", event));
//! client.connect()?;
//! ```

use fedistream_core::{
    now_millis, Action, ConnectionState, Decoded, Event, EventDecoder, LifecycleEvent,
    ReconnectPolicy,
};
use fedistream_types::RawEvent;
use futures_util::StreamExt;
use serde_json::json;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use thiserror::Error;
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tracing::{debug, error, info, warn};

use crate::config::TransportConfig;
use crate::events::{
    Channel, ListenerId, Listeners, StreamMessage, StreamSource, Subscription, TransportEvent,
};
use crate::lock;
use crate::storage::{KeyValueStorage, MemoryStorage, LAST_EVENT_ID_KEY};
use crate::transport::{
    ByteStream, EventStream, NativeEventSource, PingRequest, StreamRequest, Transport,
    TransportError,
};

/// Client errors.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum ClientError {
    /// `destroy()` was called.
    #[error("client has been destroyed")]
    Destroyed,

    /// Background tasks need a Tokio runtime.
    #[error("connect() must be called from within a Tokio runtime")]
    NoRuntime,
}

/// Builder for [`StreamingClient`].
pub struct StreamingClientBuilder<T: Transport> {
    config: TransportConfig,
    transport: T,
    storage: Arc<dyn KeyValueStorage>,
    native: Option<Arc<dyn NativeEventSource>>,
}

impl<T: Transport> StreamingClientBuilder<T> {
    /// Persist the last event id in `storage` (default: in memory).
    pub fn storage(mut self, storage: Arc<dyn KeyValueStorage>) -> Self {
        self.storage = storage;
        self
    }

    /// Try `source` before the byte-stream transport.
    pub fn native_source(mut self, source: Arc<dyn NativeEventSource>) -> Self {
        self.native = Some(source);
        self
    }

    /// Build the client. The last event id is loaded from storage here.
    pub fn build(self) -> StreamingClient<T> {
        let last_event_id = match self.storage.get_item(LAST_EVENT_ID_KEY) {
            Ok(id) => id.filter(|id| !id.is_empty()),
            Err(e) => {
                warn!(error = %e, "failed to load last event id");
                None
            }
        };
        if let Some(id) = &last_event_id {
            debug!(last_event_id = %id, "resuming from stored event id");
        }

        let shared = Shared {
            state: ConnectionState::new(),
            policy: self.config.reconnect_policy(),
            last_event_id,
            last_latency: None,
            source: None,
            driver: None,
            heartbeat: None,
            reconnect: None,
            generation: 0,
            destroyed: false,
        };

        StreamingClient {
            inner: Arc::new(ClientInner {
                config: self.config,
                transport: self.transport,
                native: self.native,
                storage: self.storage,
                listeners: Arc::new(Listeners::default()),
                shared: Mutex::new(shared),
            }),
        }
    }
}

/// Resilient streaming client.
///
/// Cheap to clone; clones share the connection. Background tasks hold a
/// reference to the client, so call [`StreamingClient::destroy`] (or
/// [`StreamingClient::disconnect`]) to stop them.
pub struct StreamingClient<T: Transport> {
    inner: Arc<ClientInner<T>>,
}

impl<T: Transport> Clone for StreamingClient<T> {
    fn clone(&self) -> Self {
        Self {
            inner: Arc::clone(&self.inner),
        }
    }
}

struct ClientInner<T: Transport> {
    config: TransportConfig,
    transport: T,
    native: Option<Arc<dyn NativeEventSource>>,
    storage: Arc<dyn KeyValueStorage>,
    listeners: Arc<Listeners>,
    shared: Mutex<Shared>,
}

struct Shared {
    state: ConnectionState,
    policy: ReconnectPolicy,
    last_event_id: Option<String>,
    last_latency: Option<Duration>,
    source: Option<StreamSource>,
    driver: Option<JoinHandle<()>>,
    heartbeat: Option<JoinHandle<()>>,
    reconnect: Option<JoinHandle<()>>,
    generation: u64,
    destroyed: bool,
}

enum Opened {
    Native(EventStream),
    Fetch(ByteStream),
}

impl Opened {
    fn source(&self) -> StreamSource {
        match self {
            Self::Native(_) => StreamSource::Native,
            Self::Fetch(_) => StreamSource::Fetch,
        }
    }
}

fn abort(handle: Option<JoinHandle<()>>) {
    if let Some(handle) = handle {
        handle.abort();
    }
}

impl<T: Transport> StreamingClient<T> {
    /// Create a client with in-memory storage and no native source.
    pub fn new(config: TransportConfig, transport: T) -> Self {
        Self::builder(config, transport).build()
    }

    /// Start building a client.
    pub fn builder(config: TransportConfig, transport: T) -> StreamingClientBuilder<T> {
        StreamingClientBuilder {
            config,
            transport,
            storage: Arc::new(MemoryStorage::new()),
            native: None,
        }
    }

    /// Start connecting. Returns immediately; progress is reported to
    /// listeners. Does nothing if already connected or connecting.
    pub fn connect(&self) -> Result<(), ClientError> {
        if tokio::runtime::Handle::try_current().is_err() {
            return Err(ClientError::NoRuntime);
        }
        if lock(&self.inner.shared).destroyed {
            return Err(ClientError::Destroyed);
        }
        info!(url = %self.inner.config.url, "connecting");
        self.inner.feed(None, Event::ConnectRequested);
        Ok(())
    }

    /// Close the stream and cancel every timer. Idempotent.
    pub fn disconnect(&self) {
        self.inner.feed(None, Event::DisconnectRequested);
        self.inner.stop_tasks();
    }

    /// Disconnect and drop every listener. The client cannot reconnect.
    pub fn destroy(&self) {
        self.disconnect();
        lock(&self.inner.shared).destroyed = true;
        self.inner.listeners.clear();
        debug!("streaming client destroyed");
    }

    /// Register `handler` for `channel`. Handlers run in registration order.
    pub fn on<F>(&self, channel: Channel, handler: F) -> Subscription
    where
        F: Fn(&TransportEvent) + Send + Sync + 'static,
    {
        self.inner.listeners.add(channel, Arc::new(handler))
    }

    /// Remove a listener by id. Returns false if it was not registered.
    pub fn off(&self, id: ListenerId) -> bool {
        self.inner.listeners.remove(id)
    }

    /// Number of registered listeners.
    pub fn listener_count(&self) -> usize {
        self.inner.listeners.len()
    }

    /// Current connection state.
    pub fn state(&self) -> ConnectionState {
        lock(&self.inner.shared).state
    }

    /// Check if the stream is open.
    pub fn is_connected(&self) -> bool {
        self.state().is_connected()
    }

    /// Id of the last record received (persisted across restarts).
    pub fn last_event_id(&self) -> Option<String> {
        lock(&self.inner.shared).last_event_id.clone()
    }

    /// Failed attempts since the last successful connection.
    pub fn reconnect_attempts(&self) -> u32 {
        self.state().attempt()
    }

    /// Round-trip time of the last successful heartbeat.
    pub fn last_latency(&self) -> Option<Duration> {
        lock(&self.inner.shared).last_latency
    }

    /// Mechanism behind the open stream, if connected.
    pub fn source(&self) -> Option<StreamSource> {
        let shared = lock(&self.inner.shared);
        shared.source.filter(|_| shared.state.is_connected())
    }

    /// Transport configuration.
    pub fn config(&self) -> &TransportConfig {
        &self.inner.config
    }

    /// Get a reference to the underlying transport (for testing).
    pub fn transport(&self) -> &T {
        &self.inner.transport
    }
}

impl<T: Transport> ClientInner<T> {
    /// Run one state machine step and execute the resulting actions.
    ///
    /// `generation` identifies the task reporting the event; `None` means
    /// the caller is the application.
    fn feed(self: &Arc<Self>, generation: Option<u64>, event: Event) {
        let actions = {
            let mut shared = lock(&self.shared);
            if shared.destroyed || generation.is_some_and(|g| g != shared.generation) {
                return;
            }
            let (next, actions) = shared.state.on_event(event, &shared.policy);
            if next != shared.state {
                debug!(from = shared.state.name(), to = next.name(), "connection state changed");
            }
            shared.state = next;
            actions
        };
        self.execute(actions);
    }

    fn execute(self: &Arc<Self>, actions: Vec<Action>) {
        for action in actions {
            match action {
                Action::Connect => self.spawn_driver(),
                Action::Disconnect => abort(lock(&self.shared).driver.take()),
                Action::StartHeartbeat => self.spawn_heartbeat(),
                Action::StopHeartbeat => abort(lock(&self.shared).heartbeat.take()),
                Action::StartReconnectTimer { delay } => self.spawn_reconnect_timer(delay),
                Action::CancelReconnect => abort(lock(&self.shared).reconnect.take()),
                Action::EmitEvent(event) => self.emit_lifecycle(event),
            }
        }
    }

    fn stop_tasks(&self) {
        let mut shared = lock(&self.shared);
        shared.generation += 1;
        abort(shared.driver.take());
        abort(shared.heartbeat.take());
        abort(shared.reconnect.take());
    }

    fn spawn_driver(self: &Arc<Self>) {
        let mut shared = lock(&self.shared);
        shared.generation += 1;
        let generation = shared.generation;
        abort(shared.driver.take());
        shared.driver = Some(tokio::spawn(Arc::clone(self).drive(generation)));
    }

    fn spawn_heartbeat(self: &Arc<Self>) {
        let Some(every) = self.config.heartbeat_interval() else {
            return;
        };
        let inner = Arc::clone(self);
        let handle = tokio::spawn(async move {
            let mut ticker = tokio::time::interval_at(tokio::time::Instant::now() + every, every);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
            loop {
                ticker.tick().await;
                inner.heartbeat(every).await;
            }
        });
        abort(lock(&self.shared).heartbeat.replace(handle));
    }

    fn spawn_reconnect_timer(self: &Arc<Self>, delay: Duration) {
        let inner = Arc::clone(self);
        let mut shared = lock(&self.shared);
        let generation = shared.generation;
        let handle = tokio::spawn(async move {
            tokio::time::sleep(delay).await;
            inner.feed(Some(generation), Event::ReconnectTimer);
        });
        abort(shared.reconnect.replace(handle));
    }

    /// One connection attempt: open, report, pump until the stream ends.
    async fn drive(self: Arc<Self>, generation: u64) {
        let stream = match self.open().await {
            Ok(stream) => stream,
            Err(e) => {
                warn!(url = %self.config.url, error = %e, "failed to open stream");
                self.feed(
                    Some(generation),
                    Event::ConnectFailed {
                        error: e.to_string(),
                    },
                );
                return;
            }
        };

        lock(&self.shared).source = Some(stream.source());
        self.feed(Some(generation), Event::ConnectSucceeded);

        let reason = match stream {
            Opened::Native(events) => self.pump_native(events).await,
            Opened::Fetch(chunks) => self.pump_bytes(chunks).await,
        };
        self.feed(Some(generation), Event::Disconnected { reason });
    }

    async fn open(&self) -> Result<Opened, TransportError> {
        let last_event_id = lock(&self.shared).last_event_id.clone();

        if let Some(native) = self.native_source() {
            match native.open(&self.config.url, last_event_id.as_deref()).await {
                Ok(events) => return Ok(Opened::Native(events)),
                Err(TransportError::Unsupported) => {
                    debug!("native event source unsupported, falling back to byte stream");
                }
                Err(e) => return Err(e),
            }
        }

        let request = StreamRequest {
            url: self.config.url.clone(),
            headers: self.config.headers.clone(),
            last_event_id,
        };
        self.transport.open(&request).await.map(Opened::Fetch)
    }

    /// Native sources cannot send custom headers.
    fn native_source(&self) -> Option<&Arc<dyn NativeEventSource>> {
        if !self.config.prefer_native || !self.config.headers.is_empty() {
            return None;
        }
        self.native.as_ref()
    }

    async fn pump_bytes(&self, mut chunks: ByteStream) -> String {
        let mut decoder = EventDecoder::new();
        while let Some(chunk) = chunks.next().await {
            match chunk {
                Ok(bytes) => {
                    for decoded in decoder.feed(&bytes) {
                        self.on_decoded(decoded);
                    }
                }
                Err(e) => return self.stream_failed(e),
            }
        }
        if decoder.pending_bytes() > 0 {
            debug!(bytes = decoder.pending_bytes(), "discarding unterminated line");
        }
        "stream ended".to_string()
    }

    async fn pump_native(&self, mut events: EventStream) -> String {
        while let Some(event) = events.next().await {
            match event {
                Ok(raw) => {
                    if let Some(id) = &raw.id {
                        self.set_last_event_id(id.clone());
                    }
                    self.deliver(raw);
                }
                Err(e) => return self.stream_failed(e),
            }
        }
        "stream ended".to_string()
    }

    fn stream_failed(&self, e: TransportError) -> String {
        warn!(error = %e, "stream read failed");
        self.listeners.emit(&TransportEvent::Error {
            message: e.to_string(),
            fatal: false,
        });
        e.to_string()
    }

    fn on_decoded(&self, decoded: Decoded) {
        match decoded {
            Decoded::Event(raw) => self.deliver(raw),
            Decoded::LastEventId(id) => self.set_last_event_id(id),
            Decoded::Retry(delay) => {
                debug!(?delay, "server suggested retry interval");
                lock(&self.shared).policy.set_server_retry(delay);
            }
        }
    }

    fn deliver(&self, raw: RawEvent) {
        self.listeners
            .emit(&TransportEvent::Message(StreamMessage::from_raw(raw)));
    }

    /// Persist and remember the resumption id. An empty id clears it.
    ///
    /// The in-memory id only changes once storage accepted the write.
    fn set_last_event_id(&self, id: String) {
        let next = (!id.is_empty()).then(|| id.clone());
        if lock(&self.shared).last_event_id == next {
            return;
        }

        let result = match &next {
            Some(id) => self.storage.set_item(LAST_EVENT_ID_KEY, id),
            None => self.storage.remove_item(LAST_EVENT_ID_KEY),
        };
        match result {
            Ok(()) => lock(&self.shared).last_event_id = next,
            Err(e) => warn!(error = %e, id = %id, "failed to persist last event id"),
        }
    }

    async fn heartbeat(&self, deadline: Duration) {
        let request = PingRequest {
            url: self.config.ping_url(),
            headers: self.config.headers.clone(),
            body: json!({ "type": "ping", "timestamp": now_millis() }),
        };

        let started = tokio::time::Instant::now();
        let result = match tokio::time::timeout(deadline, self.transport.ping(&request)).await {
            Ok(result) => result,
            Err(_) => Err(TransportError::Timeout),
        };

        match result {
            Ok(()) => {
                let latency = started.elapsed();
                lock(&self.shared).last_latency = Some(latency);
                debug!(?latency, "heartbeat");
                self.listeners.emit(&TransportEvent::Heartbeat { latency });
            }
            Err(e) => {
                warn!(error = %e, "heartbeat failed");
                self.listeners.emit(&TransportEvent::HeartbeatFailed {
                    error: e.to_string(),
                });
            }
        }
    }

    fn emit_lifecycle(&self, event: LifecycleEvent) {
        let event = match event {
            LifecycleEvent::Connected => {
                let source = lock(&self.shared).source.unwrap_or(StreamSource::Fetch);
                info!(url = %self.config.url, ?source, "stream connected");
                TransportEvent::Open {
                    url: self.config.url.clone(),
                    source,
                }
            }
            LifecycleEvent::ConnectFailed { error } => TransportEvent::Error {
                message: error,
                fatal: false,
            },
            LifecycleEvent::ConnectionLost { reason } => {
                info!(%reason, "stream disconnected");
                TransportEvent::Closed { reason }
            }
            LifecycleEvent::ReconnectScheduled { attempt, delay } => {
                info!(attempt, ?delay, "reconnect scheduled");
                TransportEvent::Reconnecting { attempt, delay }
            }
            LifecycleEvent::GaveUp { attempts, error } => {
                error!(attempts, %error, "giving up on stream");
                TransportEvent::Error {
                    message: format!("gave up after {} attempts: {}", attempts, error),
                    fatal: true,
                }
            }
            LifecycleEvent::Closed { reason } => {
                info!(%reason, "stream closed");
                TransportEvent::Closed { reason }
            }
        };
        self.listeners.emit(&event);
    }
}
