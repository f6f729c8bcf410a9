//! Conversation messages and session metadata.

use std::collections::HashMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::execution::ExecutionKind;

/// Author of a message.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Role {
    #[default]
    User,
    Assistant,
    System,
    Tool,
}

/// One entry in a session's append-only history.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Message {
    #[serde(default)]
    pub role: Role,
    #[serde(default)]
    pub content: String,
    #[serde(default = "Utc::now")]
    pub timestamp: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub user_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub user_name: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub user_email: Option<String>,
}

impl Message {
    /// Message with the current timestamp and no user identity.
    #[must_use]
    pub fn new(role: Role, content: impl Into<String>) -> Self {
        Self {
            role,
            content: content.into(),
            timestamp: Utc::now(),
            user_id: None,
            user_name: None,
            user_email: None,
        }
    }

    /// User message.
    #[must_use]
    pub fn user(content: impl Into<String>) -> Self {
        Self::new(Role::User, content)
    }

    /// Assistant message.
    #[must_use]
    pub fn assistant(content: impl Into<String>) -> Self {
        Self::new(Role::Assistant, content)
    }

    /// Attach a user id.
    #[must_use]
    pub fn with_user_id(mut self, user_id: Option<String>) -> Self {
        self.user_id = user_id;
        self
    }
}

/// Projection of a [`Message`] handed to the computation engine.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ContextMessage {
    pub role: Role,
    pub content: String,
}

impl From<&Message> for ContextMessage {
    fn from(msg: &Message) -> Self {
        Self {
            role: msg.role,
            content: msg.content.clone(),
        }
    }
}

/// Metadata stored alongside a persisted session.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct SessionMetadata {
    /// Entity key (`agent_id` / `team_id`) mapped to its id.
    #[serde(flatten)]
    pub entity: HashMap<String, Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub organization_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub turn_count: Option<usize>,
    /// Intermediate write taken while the execution was still running.
    #[serde(default, skip_serializing_if = "std::ops::Not::not")]
    pub snapshot: bool,
}

impl SessionMetadata {
    /// Metadata for a turn of the given entity.
    #[must_use]
    pub fn for_entity(
        kind: ExecutionKind,
        entity_id: &str,
        organization_id: &str,
    ) -> Self {
        let mut entity = HashMap::new();
        entity.insert(kind.entity_key().to_string(), Value::String(entity_id.to_string()));
        Self {
            entity,
            organization_id: Some(organization_id.to_string()),
            turn_count: None,
            snapshot: false,
        }
    }

    /// Mark as a periodic snapshot.
    #[must_use]
    pub const fn snapshot(mut self) -> Self {
        self.snapshot = true;
        self
    }

    /// Record the total message count.
    #[must_use]
    pub const fn with_turn_count(mut self, turn_count: usize) -> Self {
        self.turn_count = Some(turn_count);
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn message_tolerates_missing_fields() {
        let msg: Message = serde_json::from_str(r#"{"content":"hello"}"#).unwrap();
        assert_eq!(msg.role, Role::User);
        assert_eq!(msg.content, "hello");
        assert!(msg.user_id.is_none());
    }

    #[test]
    fn metadata_flattens_entity_key() {
        let meta = SessionMetadata::for_entity(ExecutionKind::Team, "team-7", "org-1")
            .with_turn_count(4);
        let json = serde_json::to_value(&meta).unwrap();
        assert_eq!(json["team_id"], "team-7");
        assert_eq!(json["organization_id"], "org-1");
        assert_eq!(json["turn_count"], 4);
        assert!(json.get("snapshot").is_none());

        let json = serde_json::to_value(meta.snapshot()).unwrap();
        assert_eq!(json["snapshot"], true);
    }
}
