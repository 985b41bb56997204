//! Events emitted by the streaming client and the listener registry.

use fedistream_types::{MessageData, RawEvent};
use std::collections::HashMap;
use std::fmt;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, Weak};
use std::time::Duration;
use tracing::error;

use crate::lock;

/// Which mechanism delivered the current connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StreamSource {
    /// Native event source (records framed by the platform).
    Native,
    /// Byte stream decoded by the client.
    Fetch,
}

/// A record delivered to listeners.
#[derive(Debug, Clone, PartialEq)]
pub struct StreamMessage {
    /// Event name (`message` if the record named none).
    pub event: String,
    /// Payload, parsed as JSON when possible.
    pub data: MessageData,
    /// Record id, if any.
    pub id: Option<String>,
    /// Payload exactly as received.
    pub raw: String,
}

impl StreamMessage {
    /// Build a message from a decoded record.
    pub fn from_raw(raw: RawEvent) -> Self {
        Self {
            event: raw.event_name().to_string(),
            data: MessageData::parse(&raw.data),
            id: raw.id,
            raw: raw.data,
        }
    }

    /// The record this message was built from.
    pub fn to_raw_event(&self) -> RawEvent {
        RawEvent {
            event: Some(self.event.clone()),
            data: self.raw.clone(),
            id: self.id.clone(),
        }
    }
}

/// Everything a [`crate::StreamingClient`] reports.
#[derive(Debug, Clone, PartialEq)]
pub enum TransportEvent {
    /// The stream opened.
    Open {
        /// Endpoint.
        url: String,
        /// Delivery mechanism.
        source: StreamSource,
    },
    /// A record arrived.
    Message(StreamMessage),
    /// Something went wrong.
    Error {
        /// Description.
        message: String,
        /// The client stopped retrying.
        fatal: bool,
    },
    /// The stream closed.
    Closed {
        /// Why.
        reason: String,
    },
    /// A reconnect is scheduled.
    Reconnecting {
        /// Attempt number (1-based).
        attempt: u32,
        /// Wait before the attempt.
        delay: Duration,
    },
    /// A heartbeat round trip completed.
    Heartbeat {
        /// Round-trip time.
        latency: Duration,
    },
    /// A heartbeat failed; the connection stays up.
    HeartbeatFailed {
        /// Description.
        error: String,
    },
}

impl TransportEvent {
    /// Channel listeners subscribe to for this event.
    pub fn channel(&self) -> Channel {
        match self {
            Self::Open { .. } => Channel::Open,
            Self::Message(_) => Channel::Message,
            Self::Error { .. } => Channel::Error,
            Self::Closed { .. } => Channel::Closed,
            Self::Reconnecting { .. } => Channel::Reconnecting,
            Self::Heartbeat { .. } | Self::HeartbeatFailed { .. } => Channel::Heartbeat,
        }
    }
}

/// Listener channels.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Channel {
    /// [`TransportEvent::Open`].
    Open,
    /// [`TransportEvent::Message`].
    Message,
    /// [`TransportEvent::Error`].
    Error,
    /// [`TransportEvent::Closed`].
    Closed,
    /// [`TransportEvent::Reconnecting`].
    Reconnecting,
    /// [`TransportEvent::Heartbeat`] and [`TransportEvent::HeartbeatFailed`].
    Heartbeat,
}

/// Identifies one registered listener.
pub type ListenerId = u64;

type Handler = Arc<dyn Fn(&TransportEvent) + Send + Sync>;

/// Ordered handlers per channel.
#[derive(Default)]
pub(crate) struct Listeners {
    next_id: AtomicU64,
    by_channel: Mutex<HashMap<Channel, Vec<(ListenerId, Handler)>>>,
}

impl fmt::Debug for Listeners {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let counts: HashMap<Channel, usize> = lock(&self.by_channel)
            .iter()
            .map(|(channel, handlers)| (*channel, handlers.len()))
            .collect();
        f.debug_struct("Listeners").field("handlers", &counts).finish()
    }
}

impl Listeners {
    pub(crate) fn add(self: &Arc<Self>, channel: Channel, handler: Handler) -> Subscription {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed) + 1;
        lock(&self.by_channel)
            .entry(channel)
            .or_default()
            .push((id, handler));
        Subscription {
            id,
            listeners: Arc::downgrade(self),
        }
    }

    pub(crate) fn remove(&self, id: ListenerId) -> bool {
        let mut by_channel = lock(&self.by_channel);
        for handlers in by_channel.values_mut() {
            if let Some(pos) = handlers.iter().position(|(hid, _)| *hid == id) {
                handlers.remove(pos);
                return true;
            }
        }
        false
    }

    pub(crate) fn clear(&self) {
        lock(&self.by_channel).clear();
    }

    pub(crate) fn len(&self) -> usize {
        lock(&self.by_channel).values().map(Vec::len).sum()
    }

    /// Call every handler of the event's channel in registration order.
    ///
    /// Handlers run without the registry lock held, so they may subscribe,
    /// unsubscribe or drive the client. A panicking handler is logged and
    /// skipped.
    pub(crate) fn emit(&self, event: &TransportEvent) {
        let handlers: Vec<Handler> = lock(&self.by_channel)
            .get(&event.channel())
            .map(|handlers| handlers.iter().map(|(_, h)| Arc::clone(h)).collect())
            .unwrap_or_default();

        for handler in handlers {
            if catch_unwind(AssertUnwindSafe(|| handler(event))).is_err() {
                error!(channel = ?event.channel(), "listener panicked");
            }
        }
    }
}

/// Handle returned by [`crate::StreamingClient::on`].
///
/// Dropping it leaves the listener registered; call
/// [`Subscription::unsubscribe`] to remove it.
#[derive(Debug, Clone)]
pub struct Subscription {
    id: ListenerId,
    listeners: Weak<Listeners>,
}

impl Subscription {
    /// Listener id, usable with [`crate::StreamingClient::off`].
    pub fn id(&self) -> ListenerId {
        self.id
    }

    /// Remove the listener. Returns false if it was already gone.
    pub fn unsubscribe(self) -> bool {
        match self.listeners.upgrade() {
            Some(listeners) => listeners.remove(self.id),
            None => false,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn recorder(log: &Arc<Mutex<Vec<String>>>, tag: &'static str) -> Handler {
        let log = Arc::clone(log);
        Arc::new(move |event: &TransportEvent| {
            log.lock().unwrap().push(format!("{}:{:?}", tag, event.channel()));
        })
    }

    fn closed() -> TransportEvent {
        TransportEvent::Closed {
            reason: "bye".into(),
        }
    }

    #[test]
    fn handlers_run_in_registration_order_per_channel() {
        let listeners = Arc::new(Listeners::default());
        let log = Arc::new(Mutex::new(Vec::new()));

        listeners.add(Channel::Closed, recorder(&log, "first"));
        listeners.add(Channel::Open, recorder(&log, "open"));
        listeners.add(Channel::Closed, recorder(&log, "second"));

        listeners.emit(&closed());
        assert_eq!(
            *log.lock().unwrap(),
            vec!["first:Closed".to_string(), "second:Closed".to_string()]
        );
    }

    #[test]
    fn unsubscribe_removes_only_that_listener() {
        let listeners = Arc::new(Listeners::default());
        let log = Arc::new(Mutex::new(Vec::new()));

        let first = listeners.add(Channel::Closed, recorder(&log, "first"));
        listeners.add(Channel::Closed, recorder(&log, "second"));

        assert!(first.clone().unsubscribe());
        assert!(!first.unsubscribe());

        listeners.emit(&closed());
        assert_eq!(*log.lock().unwrap(), vec!["second:Closed".to_string()]);
        assert_eq!(listeners.len(), 1);
    }

    #[test]
    fn panicking_listener_does_not_stop_others() {
        let listeners = Arc::new(Listeners::default());
        let log = Arc::new(Mutex::new(Vec::new()));

        listeners.add(Channel::Closed, Arc::new(|_: &TransportEvent| panic!("boom")));
        listeners.add(Channel::Closed, recorder(&log, "after"));

        listeners.emit(&closed());
        assert_eq!(log.lock().unwrap().len(), 1);
    }

    #[test]
    fn subscription_outliving_registry_is_inert() {
        let listeners = Arc::new(Listeners::default());
        let sub = listeners.add(Channel::Open, Arc::new(|_: &TransportEvent| {}));
        drop(listeners);
        assert!(!sub.unsubscribe());
    }

    #[test]
    fn heartbeat_failures_share_the_heartbeat_channel() {
        let event = TransportEvent::HeartbeatFailed {
            error: "timeout".into(),
        };
        assert_eq!(event.channel(), Channel::Heartbeat);
    }

    #[test]
    fn message_keeps_raw_payload_and_parses_json() {
        let msg = StreamMessage::from_raw(RawEvent::new("update", "{\"id\":\"1\"}").with_id("7"));
        assert_eq!(msg.event, "update");
        assert_eq!(msg.id.as_deref(), Some("7"));
        assert!(matches!(msg.data, MessageData::Json(_)));
        assert_eq!(msg.to_raw_event().data, "{\"id\":\"1\"}");

        let text = StreamMessage::from_raw(RawEvent {
            event: None,
            data: "hello".into(),
            id: None,
        });
        assert_eq!(text.event, "message");
        assert_eq!(text.data, MessageData::Text("hello".into()));
    }
}
