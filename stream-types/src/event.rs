//! Records decoded from the event stream.

use serde::{Deserialize, Serialize};

/// Event name used when a record carries no `event:` field.
pub const DEFAULT_EVENT_NAME: &str = "message";

/// One blank-line-terminated record from the stream.
///
/// `data` is the verbatim concatenation of every `data:` field in the record.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct RawEvent {
    /// Named event type (`event:` field), if any.
    pub event: Option<String>,
    /// Accumulated payload.
    pub data: String,
    /// Event id (`id:` field), if any.
    pub id: Option<String>,
}

impl RawEvent {
    /// Create a record with an event name and payload.
    pub fn new(event: impl Into<String>, data: impl Into<String>) -> Self {
        Self {
            event: Some(event.into()),
            data: data.into(),
            id: None,
        }
    }

    /// Set the event id.
    pub fn with_id(mut self, id: impl Into<String>) -> Self {
        self.id = Some(id.into());
        self
    }

    /// The event name, falling back to [`DEFAULT_EVENT_NAME`].
    pub fn event_name(&self) -> &str {
        self.event.as_deref().unwrap_or(DEFAULT_EVENT_NAME)
    }
}

/// Best-effort interpretation of a record's payload.
///
/// Payloads that are not valid JSON are kept as text; a malformed payload is
/// the consumer's problem, never a transport failure.
#[derive(Debug, Clone, PartialEq)]
pub enum MessageData {
    /// Payload parsed as JSON.
    Json(serde_json::Value),
    /// Payload that did not parse, kept verbatim.
    Text(String),
}

impl MessageData {
    /// Parse a raw payload.
    pub fn parse(data: &str) -> Self {
        match serde_json::from_str(data) {
            Ok(value) => MessageData::Json(value),
            Err(_) => MessageData::Text(data.to_string()),
        }
    }

    /// The JSON value, if the payload parsed.
    pub fn as_json(&self) -> Option<&serde_json::Value> {
        match self {
            MessageData::Json(value) => Some(value),
            MessageData::Text(_) => None,
        }
    }
}
