//! The envelope: unit of delivery for every channel.
//!
//! An envelope is a JSON object with a `type` discriminator, a millisecond
//! `timestamp`, and any number of business fields that this layer never
//! interprets beyond participant matching.

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::time::{SystemTime, UNIX_EPOCH};

/// Well-known envelope kinds.
pub mod kinds {
    pub const CONNECTED: &str = "connected";
    pub const PING: &str = "ping";
    pub const PRESENCE: &str = "presence";
    pub const NEW_MESSAGE: &str = "new_message";
    pub const MATCH: &str = "match";
}

/// Fields that may name the users an envelope concerns.
const PARTICIPANT_FIELDS: [&str; 2] = ["participants", "userIds"];

/// Milliseconds since the Unix epoch.
#[must_use]
pub fn now_millis() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_millis() as u64
}

/// A typed, timestamped payload moved through a channel.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Envelope {
    /// Discriminates client-side handling.
    #[serde(rename = "type")]
    pub kind: String,
    /// Creation time in milliseconds since the Unix epoch.
    pub timestamp: u64,
    /// Business fields, opaque to the delivery layer.
    #[serde(flatten)]
    pub fields: Map<String, Value>,
}

impl Envelope {
    /// Create an envelope of the given kind stamped with the current time.
    #[must_use]
    pub fn new(kind: impl Into<String>) -> Self {
        Self {
            kind: kind.into(),
            timestamp: now_millis(),
            fields: Map::new(),
        }
    }

    /// Add a field.
    #[must_use]
    pub fn with_field(mut self, name: impl Into<String>, value: impl Into<Value>) -> Self {
        self.fields.insert(name.into(), value.into());
        self
    }

    /// Override the timestamp.
    #[must_use]
    pub fn with_timestamp(mut self, timestamp: u64) -> Self {
        self.timestamp = timestamp;
        self
    }

    /// The first envelope of every stream.
    #[must_use]
    pub fn connected(
        user_id: impl Into<String>,
        connection_id: impl Into<String>,
        keepalive_ms: u64,
    ) -> Self {
        Self::new(kinds::CONNECTED)
            .with_field("userId", user_id.into())
            .with_field("connectionId", connection_id.into())
            .with_field("keepalive", keepalive_ms)
    }

    /// A keep-alive envelope.
    #[must_use]
    pub fn ping() -> Self {
        Self::new(kinds::PING)
    }

    /// A presence change for one user.
    #[must_use]
    pub fn presence(user_id: impl Into<String>, is_online: bool, last_seen: u64) -> Self {
        Self::new(kinds::PRESENCE)
            .with_field("userId", user_id.into())
            .with_field("isOnline", is_online)
            .with_field("lastSeen", last_seen)
    }

    /// Get the envelope kind.
    #[must_use]
    pub fn kind(&self) -> &str {
        &self.kind
    }

    /// Check the envelope kind.
    #[must_use]
    pub fn is(&self, kind: &str) -> bool {
        self.kind == kind
    }

    /// Get a business field.
    #[must_use]
    pub fn field(&self, name: &str) -> Option<&Value> {
        self.fields.get(name)
    }

    /// Get a string field.
    #[must_use]
    pub fn str_field(&self, name: &str) -> Option<&str> {
        self.fields.get(name).and_then(Value::as_str)
    }

    /// Check whether the envelope names `user_id`, either as its `userId`
    /// or as a member of a `participants`/`userIds` list.
    #[must_use]
    pub fn names_participant(&self, user_id: &str) -> bool {
        if self.str_field("userId") == Some(user_id) {
            return true;
        }
        PARTICIPANT_FIELDS.iter().any(|name| {
            self.fields
                .get(*name)
                .and_then(Value::as_array)
                .is_some_and(|ids| ids.iter().any(|id| id.as_str() == Some(user_id)))
        })
    }
}
