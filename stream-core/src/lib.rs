//! # stream-core
//!
//! Pure logic for fedistream (no I/O, instant tests).
//!
//! This crate implements the state machines and data structures of the
//! real-time sync core without any network or timer I/O, enabling fast unit
//! tests.
//!
//! ## Design Philosophy
//!
//! All modules in this crate are **pure** - they take input and produce output
//! without side effects. Time is passed in explicitly where it matters
//! (deduplication windows), so behavior is deterministic.
//!
//! The actual I/O (network, timers, storage) is performed by `stream-client`,
//! which interprets the actions produced by these state machines.

#![warn(missing_docs)]
#![warn(clippy::all)]

pub mod cache;
pub mod decoder;
pub mod dedup;
pub mod queue;
pub mod state;

pub use cache::{now_millis, ApplyResult, CacheEntry, CacheStats, StateCache};
pub use decoder::{Decoded, EventDecoder};
pub use dedup::{DedupCache, DedupKey};
pub use queue::{BoundedQueue, OperationQueue};
pub use state::{Action, ConnectionState, Event, LifecycleEvent, ReconnectPolicy};
