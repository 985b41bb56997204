//! # stream-client
//!
//! Async runtime pieces of the fedistream real-time sync core.
//!
//! This is the library applications use to keep a local entity cache in
//! step with a streaming backend.
//!
//! ## Features
//!
//! - **Resilient Streaming**: [`StreamingClient`] with backoff, heartbeat and
//!   `Last-Event-ID` resumption
//! - **Transport Abstraction**: Pluggable byte-stream transport (HTTP, mock)
//!   plus an optional native event source
//! - **Operation Queue**: [`OperationsManager`] deduplicates, debounces and
//!   bounds incoming operations before dispatching them to handlers
//! - **State Cache**: [`StreamingStateManager`] applies operations with
//!   version-based conflict detection
//! - **Optimistic Updates**: [`OptimisticManager`] and [`OptimisticState`]
//!   with rollback and timeout
//!
//! ## Example
//!
//! ```ignore
//! use fedistream_client::{
//!     HttpTransport, OperationsManager, StreamConfig, StreamingClient, StreamingStateManager,
//! };
//!
//! let config = StreamConfig::from_file(path)?;
//! let client = StreamingClient::new(config.transport.clone(), HttpTransport::new()?);
//! let operations = OperationsManager::new(config.operations.clone());
//! let cache = StreamingStateManager::new(&config.cache);
//!
//! cache.register(&operations);
//! operations.setup_transport_listeners(&client);
//! client.connect()?;
//! ```

#![warn(missing_docs)]
#![warn(clippy::all)]

pub mod client;
pub mod config;
pub mod events;
pub mod operations;
pub mod optimistic;
pub mod state_manager;
pub mod storage;
pub mod transport;

pub use client::{ClientError, StreamingClient, StreamingClientBuilder};
pub use config::{
    CacheConfig, ConfigError, OperationsConfig, OptimisticConfig, StreamConfig, TransportConfig,
};
pub use events::{Channel, ListenerId, StreamMessage, StreamSource, Subscription, TransportEvent};
pub use operations::{
    Disposition, HandlerError, OperationHandler, OperationStats, OperationsManager,
    StreamingState, ROUTING_TYPES,
};
pub use optimistic::{OptimisticError, OptimisticManager, OptimisticState, OptimisticStats};
pub use state_manager::StreamingStateManager;
pub use storage::{FileStorage, KeyValueStorage, MemoryStorage, StorageError, LAST_EVENT_ID_KEY};
pub use transport::{
    ByteStream, EventStream, HttpTransport, MockEventSource, MockTransport, NativeEventSource,
    PingRequest, StreamEnd, StreamRequest, Transport, TransportError,
};

use std::sync::{Mutex, MutexGuard, PoisonError};

/// Lock a mutex, recovering the data if a previous holder panicked.
///
/// Listener and handler panics are caught and logged, so a poisoned lock
/// only means a callback died mid-update; the guarded data is still usable.
pub(crate) fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}
