//! Mock transports for testing.
//!
//! Allows scripting stream contents and failures, and capturing requests
//! and pings for verification.

use super::{
    ByteStream, EventStream, NativeEventSource, PingRequest, StreamRequest, Transport,
    TransportError,
};
use async_trait::async_trait;
use fedistream_types::RawEvent;
use futures_util::stream::{self, StreamExt};
use std::collections::VecDeque;
use std::sync::{Arc, Mutex};

use crate::lock;

/// What a scripted stream does after its last item.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StreamEnd {
    /// Server closes the connection.
    Close,
    /// Connection stays open without further data.
    Hang,
    /// Read fails with the given message.
    Error(String),
}

#[derive(Debug)]
enum Script<T> {
    Stream { items: Vec<T>, end: StreamEnd },
    Fail(TransportError),
}

fn scripted<T: Send + 'static>(
    items: Vec<T>,
    end: StreamEnd,
) -> std::pin::Pin<Box<dyn futures_util::Stream<Item = Result<T, TransportError>> + Send>> {
    let body = stream::iter(items.into_iter().map(Ok));
    match end {
        StreamEnd::Close => Box::pin(body),
        StreamEnd::Hang => Box::pin(body.chain(stream::pending())),
        StreamEnd::Error(message) => Box::pin(body.chain(stream::once(async move {
            Err(TransportError::ReceiveFailed(message))
        }))),
    }
}

/// Mock byte-stream transport.
///
/// Each `open()` consumes the next scripted response. With nothing
/// scripted, `open()` succeeds with a stream that never yields.
#[derive(Debug, Default)]
pub struct MockTransport {
    inner: Arc<Mutex<MockTransportInner>>,
}

#[derive(Debug, Default)]
struct MockTransportInner {
    scripts: VecDeque<Script<Vec<u8>>>,
    requests: Vec<StreamRequest>,
    pings: Vec<PingRequest>,
    fail_next_ping: Option<String>,
}

impl MockTransport {
    /// Create a new mock transport.
    pub fn new() -> Self {
        Self::default()
    }

    /// Script the next `open()` to deliver `chunks` as separate reads.
    pub fn queue_stream<I, C>(&self, chunks: I, end: StreamEnd)
    where
        I: IntoIterator<Item = C>,
        C: AsRef<[u8]>,
    {
        let items = chunks.into_iter().map(|c| c.as_ref().to_vec()).collect();
        lock(&self.inner)
            .scripts
            .push_back(Script::Stream { items, end });
    }

    /// Script the next `open()` to fail.
    pub fn queue_failure(&self, error: &str) {
        lock(&self.inner)
            .scripts
            .push_back(Script::Fail(TransportError::ConnectionFailed(error.to_string())));
    }

    /// Every stream request made so far.
    pub fn requests(&self) -> Vec<StreamRequest> {
        lock(&self.inner).requests.clone()
    }

    /// Number of `open()` calls.
    pub fn open_count(&self) -> usize {
        lock(&self.inner).requests.len()
    }

    /// Every heartbeat sent so far.
    pub fn pings(&self) -> Vec<PingRequest> {
        lock(&self.inner).pings.clone()
    }

    /// Cause the next ping to fail with the given error.
    pub fn fail_next_ping(&self, error: &str) {
        lock(&self.inner).fail_next_ping = Some(error.to_string());
    }

    /// Clear all state (scripts, requests, pings).
    pub fn reset(&self) {
        *lock(&self.inner) = MockTransportInner::default();
    }
}

impl Clone for MockTransport {
    fn clone(&self) -> Self {
        Self {
            inner: Arc::clone(&self.inner),
        }
    }
}

#[async_trait]
impl Transport for MockTransport {
    async fn open(&self, request: &StreamRequest) -> Result<ByteStream, TransportError> {
        let mut inner = lock(&self.inner);
        inner.requests.push(request.clone());

        match inner.scripts.pop_front() {
            Some(Script::Fail(error)) => Err(error),
            Some(Script::Stream { items, end }) => Ok(scripted(items, end)),
            None => Ok(scripted(Vec::new(), StreamEnd::Hang)),
        }
    }

    async fn ping(&self, request: &PingRequest) -> Result<(), TransportError> {
        let mut inner = lock(&self.inner);
        inner.pings.push(request.clone());

        // Check for forced failure
        if let Some(error) = inner.fail_next_ping.take() {
            return Err(TransportError::SendFailed(error));
        }
        Ok(())
    }
}

/// Mock native event source.
///
/// Reports [`TransportError::Unsupported`] unless streams are scripted.
#[derive(Debug, Default)]
pub struct MockEventSource {
    inner: Arc<Mutex<MockEventSourceInner>>,
}

#[derive(Debug, Default)]
struct MockEventSourceInner {
    scripts: VecDeque<Script<RawEvent>>,
    opened: Vec<(String, Option<String>)>,
}

impl MockEventSource {
    /// Create a source that reports itself unsupported.
    pub fn new() -> Self {
        Self::default()
    }

    /// Script the next `open()` to deliver `events`.
    pub fn queue_events(&self, events: Vec<RawEvent>, end: StreamEnd) {
        lock(&self.inner).scripts.push_back(Script::Stream { items: events, end });
    }

    /// Script the next `open()` to fail.
    pub fn queue_failure(&self, error: TransportError) {
        lock(&self.inner).scripts.push_back(Script::Fail(error));
    }

    /// `(url, last_event_id)` of every `open()` call.
    pub fn opened(&self) -> Vec<(String, Option<String>)> {
        lock(&self.inner).opened.clone()
    }
}

impl Clone for MockEventSource {
    fn clone(&self) -> Self {
        Self {
            inner: Arc::clone(&self.inner),
        }
    }
}

#[async_trait]
impl NativeEventSource for MockEventSource {
    async fn open(
        &self,
        url: &str,
        last_event_id: Option<&str>,
    ) -> Result<EventStream, TransportError> {
        let mut inner = lock(&self.inner);
        inner
            .opened
            .push((url.to_string(), last_event_id.map(str::to_string)));

        match inner.scripts.pop_front() {
            Some(Script::Fail(error)) => Err(error),
            Some(Script::Stream { items, end }) => Ok(scripted(items, end)),
            None => Err(TransportError::Unsupported),
        }
    }
}
