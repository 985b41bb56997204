//! Transport abstraction for fedistream.
//!
//! This module provides a pluggable transport layer that abstracts the
//! underlying connection mechanism (HTTP streaming, mock for testing).
//!
//! # Design
//!
//! Two seams exist:
//! - [`Transport`] opens a raw byte stream (fetch-style) that the client
//!   decodes itself, and carries heartbeat pings
//! - [`NativeEventSource`] yields already-framed records; it cannot carry
//!   custom headers and may report [`TransportError::Unsupported`], in which
//!   case the client falls back to the byte stream
//!
//! # Example
//!
//! ```ignore
//! let transport = MockTransport::new();
//! transport.queue_stream(["event: update\ndata: {}\n\n"], StreamEnd::Hang);
//! let client = StreamingClient::new(TransportConfig::new("https://x.test"), transport);
//! ```

mod http;
mod mock;

pub use http::HttpTransport;
pub use mock::{MockEventSource, MockTransport, StreamEnd};

use async_trait::async_trait;
use fedistream_types::RawEvent;
use futures_util::Stream;
use std::collections::BTreeMap;
use std::pin::Pin;
use thiserror::Error;

/// Transport errors.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum TransportError {
    /// Connection failed.
    #[error("connection failed: {0}")]
    ConnectionFailed(String),

    /// Server answered with a non-success status.
    #[error("unexpected HTTP status {0}")]
    Status(u16),

    /// Reading from an open stream failed.
    #[error("receive failed: {0}")]
    ReceiveFailed(String),

    /// Send failed.
    #[error("send failed: {0}")]
    SendFailed(String),

    /// This mechanism is not available here.
    #[error("transport not supported")]
    Unsupported,

    /// Request timed out.
    #[error("request timed out")]
    Timeout,
}

/// Raw chunks of an open stream, in arrival order.
pub type ByteStream = Pin<Box<dyn Stream<Item = Result<Vec<u8>, TransportError>> + Send>>;

/// Framed records of an open native stream, in arrival order.
pub type EventStream = Pin<Box<dyn Stream<Item = Result<RawEvent, TransportError>> + Send>>;

/// Parameters for opening a stream.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StreamRequest {
    /// Streaming endpoint.
    pub url: String,
    /// Headers passed through verbatim.
    pub headers: BTreeMap<String, String>,
    /// Resume after this id (`Last-Event-ID`).
    pub last_event_id: Option<String>,
}

/// A heartbeat request.
#[derive(Debug, Clone, PartialEq)]
pub struct PingRequest {
    /// Ping endpoint.
    pub url: String,
    /// Headers passed through verbatim.
    pub headers: BTreeMap<String, String>,
    /// JSON body (`{"type": "ping", "timestamp": ...}`).
    pub body: serde_json::Value,
}

/// Byte-stream transport.
///
/// Implementations handle the underlying connection mechanism
/// (HTTP, mock, etc).
#[async_trait]
pub trait Transport: Send + Sync + 'static {
    /// Open the stream described by `request`.
    ///
    /// Returns once the server accepted the request; the returned stream
    /// ends when the server closes the connection.
    async fn open(&self, request: &StreamRequest) -> Result<ByteStream, TransportError>;

    /// Send one heartbeat and wait for the server to acknowledge it.
    async fn ping(&self, request: &PingRequest) -> Result<(), TransportError>;
}

/// Event source that frames records itself.
#[async_trait]
pub trait NativeEventSource: Send + Sync + 'static {
    /// Open `url`, resuming after `last_event_id` if given.
    async fn open(
        &self,
        url: &str,
        last_event_id: Option<&str>,
    ) -> Result<EventStream, TransportError>;
}
