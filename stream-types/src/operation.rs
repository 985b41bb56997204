//! Typed streaming operations.
//!
//! Everything after the transport works on [`StreamingOperation`]; raw wire
//! records are validated into one of its variants at the boundary.

use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::fmt;

use crate::{EntityKey, EntityType, RawEvent, StreamError};

/// All operations the sync core understands.
///
/// Serialized as an explicit envelope:
/// `{"type": "update", "entityType": "status", "id": "1", "payload": {...}}`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum StreamingOperation {
    /// Create or replace an entity
    Update(UpdateOperation),
    /// Remove an entity
    Delete(DeleteOperation),
    /// Modify an existing entity
    Edit(EditOperation),
}

/// Create or replace an entity.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct UpdateOperation {
    /// Target entity kind
    pub entity_type: EntityType,
    /// Target entity id
    pub id: String,
    /// Materialized entity
    pub payload: Value,
    /// Version marker, if the backend supplies one
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub version: Option<u64>,
}

/// Remove an entity.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DeleteOperation {
    /// Target entity kind
    pub entity_type: EntityType,
    /// Target entity id
    pub id: String,
    /// Why the entity went away
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reason: Option<String>,
}

/// Modify an existing entity.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct EditOperation {
    /// Target entity kind
    pub entity_type: EntityType,
    /// Target entity id
    pub id: String,
    /// Entity after the edit
    pub payload: Value,
    /// Version marker used for conflict detection
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub version: Option<u64>,
}

/// Discriminant of a [`StreamingOperation`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum OperationKind {
    /// [`StreamingOperation::Update`]
    Update,
    /// [`StreamingOperation::Delete`]
    Delete,
    /// [`StreamingOperation::Edit`]
    Edit,
}

impl fmt::Display for OperationKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            OperationKind::Update => f.write_str("update"),
            OperationKind::Delete => f.write_str("delete"),
            OperationKind::Edit => f.write_str("edit"),
        }
    }
}

impl StreamingOperation {
    /// Build an update.
    pub fn update(entity_type: EntityType, id: impl Into<String>, payload: Value) -> Self {
        Self::Update(UpdateOperation {
            entity_type,
            id: id.into(),
            payload,
            version: None,
        })
    }

    /// Build a delete.
    pub fn delete(entity_type: EntityType, id: impl Into<String>) -> Self {
        Self::Delete(DeleteOperation {
            entity_type,
            id: id.into(),
            reason: None,
        })
    }

    /// Build an edit carrying a version marker.
    pub fn edit(
        entity_type: EntityType,
        id: impl Into<String>,
        payload: Value,
        version: Option<u64>,
    ) -> Self {
        Self::Edit(EditOperation {
            entity_type,
            id: id.into(),
            payload,
            version,
        })
    }

    /// Set the version marker (no-op for deletes).
    pub fn with_version(mut self, version: u64) -> Self {
        match &mut self {
            Self::Update(op) => op.version = Some(version),
            Self::Edit(op) => op.version = Some(version),
            Self::Delete(_) => {}
        }
        self
    }

    /// The operation discriminant.
    pub fn kind(&self) -> OperationKind {
        match self {
            Self::Update(_) => OperationKind::Update,
            Self::Delete(_) => OperationKind::Delete,
            Self::Edit(_) => OperationKind::Edit,
        }
    }

    /// Target entity kind.
    pub fn entity_type(&self) -> EntityType {
        match self {
            Self::Update(op) => op.entity_type,
            Self::Delete(op) => op.entity_type,
            Self::Edit(op) => op.entity_type,
        }
    }

    /// Target entity id.
    pub fn id(&self) -> &str {
        match self {
            Self::Update(op) => &op.id,
            Self::Delete(op) => &op.id,
            Self::Edit(op) => &op.id,
        }
    }

    /// Cache identity of the target entity.
    pub fn key(&self) -> EntityKey {
        EntityKey::new(self.entity_type(), self.id())
    }

    /// The handler type this operation is routed to.
    ///
    /// Updates route by entity (`timeline`, `account`, `notification`);
    /// deletes and edits have their own handler types.
    pub fn routing_type(&self) -> &'static str {
        match self {
            Self::Update(op) => match op.entity_type {
                EntityType::Status => "timeline",
                EntityType::Account => "account",
                EntityType::Notification => "notification",
            },
            Self::Delete(_) => "delete",
            Self::Edit(_) => "edit",
        }
    }

    /// Check that the operation has a usable shape.
    ///
    /// Ids must be non-empty and update/edit payloads must be JSON objects.
    pub fn validate(&self) -> Result<(), StreamError> {
        if self.id().trim().is_empty() {
            return Err(StreamError::InvalidOperation(format!(
                "{} {} has an empty id",
                self.kind(),
                self.entity_type()
            )));
        }
        let payload = match self {
            Self::Update(op) => Some(&op.payload),
            Self::Edit(op) => Some(&op.payload),
            Self::Delete(_) => None,
        };
        if let Some(payload) = payload {
            if !payload.is_object() {
                return Err(StreamError::InvalidOperation(format!(
                    "{} {}:{} payload is not an object",
                    self.kind(),
                    self.entity_type(),
                    self.id()
                )));
            }
        }
        Ok(())
    }

    /// Classify a raw stream record.
    ///
    /// Records whose JSON data is an explicit operation envelope (a `type` of
    /// `update`/`delete`/`edit` plus an `entityType`) are decoded as such.
    /// Otherwise the event name selects the shape: `update` (status),
    /// `notification`, `delete` (status id as data) and `status.update`
    /// (status edit).
    pub fn from_raw(raw: &RawEvent) -> Result<Self, StreamError> {
        let parsed: Option<Value> = serde_json::from_str(&raw.data).ok();

        if let Some(value) = parsed.as_ref().filter(|v| is_envelope(v)) {
            let op: StreamingOperation = serde_json::from_value(value.clone())?;
            op.validate()?;
            return Ok(op);
        }

        let op = match raw.event_name() {
            "update" => {
                let payload = require_object(parsed)?;
                let id = payload_id(&payload)?;
                let version = payload.get("version").and_then(Value::as_u64);
                Self::Update(UpdateOperation {
                    entity_type: EntityType::Status,
                    id,
                    payload,
                    version,
                })
            }
            "notification" => {
                let payload = require_object(parsed)?;
                let id = payload_id(&payload)?;
                Self::update(EntityType::Notification, id, payload)
            }
            "status.update" => {
                let payload = require_object(parsed)?;
                let id = payload_id(&payload)?;
                let version = payload.get("version").and_then(Value::as_u64);
                Self::edit(EntityType::Status, id, payload, version)
            }
            "delete" => {
                let id = match parsed {
                    Some(Value::String(s)) => s,
                    Some(Value::Number(n)) => n.to_string(),
                    _ => raw.data.trim().to_string(),
                };
                Self::delete(EntityType::Status, id)
            }
            other => return Err(StreamError::UnrecognizedEvent(other.to_string())),
        };
        op.validate()?;
        Ok(op)
    }
}

fn is_envelope(value: &Value) -> bool {
    let kind = value.get("type").and_then(Value::as_str);
    matches!(kind, Some("update" | "delete" | "edit")) && value.get("entityType").is_some()
}

fn require_object(parsed: Option<Value>) -> Result<Value, StreamError> {
    match parsed {
        Some(value @ Value::Object(_)) => Ok(value),
        _ => Err(StreamError::MissingField("payload")),
    }
}

fn payload_id(payload: &Value) -> Result<String, StreamError> {
    match payload.get("id") {
        Some(Value::String(s)) => Ok(s.clone()),
        Some(Value::Number(n)) => Ok(n.to_string()),
        _ => Err(StreamError::MissingField("id")),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn envelope_round_trips_through_serde() {
        let op = StreamingOperation::edit(
            EntityType::Account,
            "42",
            json!({"display_name": "new"}),
            Some(7),
        );
        let json = serde_json::to_value(&op).unwrap();
        assert_eq!(json["type"], "edit");
        assert_eq!(json["entityType"], "account");
        assert_eq!(json["version"], 7);
    }

    #[test]
    fn explicit_envelope_wins_over_event_name() {
        let raw = RawEvent::new(
            "message",
            r#"{"type":"delete","entityType":"notification","id":"9","reason":"dismissed"}"#,
        );
        let op = StreamingOperation::from_raw(&raw).unwrap();
        assert_eq!(op.kind(), OperationKind::Delete);
        assert_eq!(op.entity_type(), EntityType::Notification);
        assert_eq!(op.id(), "9");
    }

    #[test]
    fn mastodon_update_becomes_status_update() {
        let raw = RawEvent::new("update", r#"{"id":"101","content":"<p>hi</p>"}"#);
        let op = StreamingOperation::from_raw(&raw).unwrap();
        assert_eq!(op.kind(), OperationKind::Update);
        assert_eq!(op.entity_type(), EntityType::Status);
        assert_eq!(op.routing_type(), "timeline");
    }

    #[test]
    fn notification_with_type_field_is_not_an_envelope() {
        let raw = RawEvent::new("notification", r#"{"id":"5","type":"mention"}"#);
        let op = StreamingOperation::from_raw(&raw).unwrap();
        assert_eq!(op.entity_type(), EntityType::Notification);
        assert_eq!(op.routing_type(), "notification");
    }

    #[test]
    fn delete_accepts_bare_id() {
        let op = StreamingOperation::from_raw(&RawEvent::new("delete", "108")).unwrap();
        assert_eq!(op, StreamingOperation::delete(EntityType::Status, "108"));

        let op = StreamingOperation::from_raw(&RawEvent::new("delete", "\"abc\"")).unwrap();
        assert_eq!(op.id(), "abc");
    }

    #[test]
    fn status_update_event_is_an_edit() {
        let raw = RawEvent::new("status.update", r#"{"id":"7","version":3}"#);
        let op = StreamingOperation::from_raw(&raw).unwrap();
        assert_eq!(op.kind(), OperationKind::Edit);
        assert_eq!(op.routing_type(), "edit");
        match op {
            StreamingOperation::Edit(edit) => assert_eq!(edit.version, Some(3)),
            other => panic!("expected edit, got {:?}", other),
        }
    }

    #[test]
    fn unknown_event_is_rejected() {
        let err = StreamingOperation::from_raw(&RawEvent::new("filters_changed", "")).unwrap_err();
        assert!(matches!(err, StreamError::UnrecognizedEvent(name) if name == "filters_changed"));
    }

    #[test]
    fn update_without_id_is_rejected() {
        let err = StreamingOperation::from_raw(&RawEvent::new("update", r#"{"content":"x"}"#))
            .unwrap_err();
        assert!(matches!(err, StreamError::MissingField("id")));
    }

    #[test]
    fn malformed_update_payload_is_rejected() {
        let err = StreamingOperation::from_raw(&RawEvent::new("update", "not json")).unwrap_err();
        assert!(matches!(err, StreamError::MissingField("payload")));
    }

    #[test]
    fn validate_rejects_empty_id_and_scalar_payload() {
        assert!(StreamingOperation::delete(EntityType::Status, " ")
            .validate()
            .is_err());
        assert!(StreamingOperation::update(EntityType::Status, "1", json!("text"))
            .validate()
            .is_err());
        assert!(StreamingOperation::update(EntityType::Status, "1", json!({}))
            .validate()
            .is_ok());
    }

    #[test]
    fn routing_types_cover_every_handler() {
        let routes: Vec<_> = [
            StreamingOperation::update(EntityType::Status, "1", json!({})),
            StreamingOperation::update(EntityType::Account, "1", json!({})),
            StreamingOperation::update(EntityType::Notification, "1", json!({})),
            StreamingOperation::delete(EntityType::Account, "1"),
            StreamingOperation::edit(EntityType::Status, "1", json!({}), None),
        ]
        .iter()
        .map(StreamingOperation::routing_type)
        .collect();
        assert_eq!(
            routes,
            vec!["timeline", "account", "notification", "delete", "edit"]
        );
    }
}
