//! # stream-types
//!
//! Wire and domain types for the fedistream real-time sync core.
//!
//! This crate provides the foundational types used across all fedistream crates:
//! - [`EntityType`], [`EntityKey`] - Identity of cached entities
//! - [`RawEvent`], [`MessageData`] - Records decoded from the event stream
//! - [`StreamingOperation`] - Typed Update/Delete/Edit operations
//! - [`StreamError`] - Error types

#![warn(missing_docs)]
#![warn(clippy::all)]

mod error;
mod event;
mod ids;
mod operation;

pub use error::StreamError;
pub use event::{MessageData, RawEvent, DEFAULT_EVENT_NAME};
pub use ids::{EntityKey, EntityType};
pub use operation::{
    DeleteOperation, EditOperation, OperationKind, StreamingOperation, UpdateOperation,
};
