//! Identity types for cached entities.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

use crate::StreamError;

/// The kind of entity an operation targets.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum EntityType {
    /// A post on a timeline.
    Status,
    /// A user account.
    Account,
    /// A notification addressed to the current user.
    Notification,
}

impl EntityType {
    /// All entity types, in a stable order.
    pub const ALL: [EntityType; 3] = [
        EntityType::Status,
        EntityType::Account,
        EntityType::Notification,
    ];

    /// The lowercase wire name of this entity type.
    pub fn as_str(&self) -> &'static str {
        match self {
            EntityType::Status => "status",
            EntityType::Account => "account",
            EntityType::Notification => "notification",
        }
    }
}

impl fmt::Display for EntityType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for EntityType {
    type Err = StreamError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "status" => Ok(EntityType::Status),
            "account" => Ok(EntityType::Account),
            "notification" => Ok(EntityType::Notification),
            other => Err(StreamError::UnknownEntityType(other.to_string())),
        }
    }
}

/// Cache identity of an entity: `(entity_type, id)`.
///
/// Displayed as `type:id`, which is also the form used in conflict reports.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct EntityKey {
    /// Kind of entity.
    pub entity_type: EntityType,
    /// Backend identifier.
    pub id: String,
}

impl EntityKey {
    /// Create a new key.
    pub fn new(entity_type: EntityType, id: impl Into<String>) -> Self {
        Self {
            entity_type,
            id: id.into(),
        }
    }
}

impl fmt::Display for EntityKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.entity_type, self.id)
    }
}
