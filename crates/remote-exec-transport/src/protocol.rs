//! Wire payloads exchanged with the control plane.

use chrono::{DateTime, Utc};
use remote_exec_core::{
    ExecutionKind, Message, SessionMetadata, SessionRecord, StreamingEvent, ToolsetConfig,
};
use serde::{Deserialize, Serialize};
use serde_json::{Value, json};

/// Event type used for the execution-kind cache entry.
pub const METADATA_EVENT: &str = "metadata";

/// Body of `POST /executions/{id}/events`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EventEnvelope {
    pub event_type: String,
    pub data: Value,
    pub timestamp: DateTime<Utc>,
}

impl EventEnvelope {
    #[must_use]
    pub fn from_event(event: &StreamingEvent) -> Self {
        Self {
            event_type: event.event_type().to_string(),
            data: event.data(),
            timestamp: event.timestamp,
        }
    }

    /// Cache entry recording whether the execution is an agent or team run.
    #[must_use]
    pub fn execution_kind(kind: ExecutionKind) -> Self {
        Self {
            event_type: METADATA_EVENT.to_string(),
            data: json!({ "execution_type": kind.cache_label() }),
            timestamp: Utc::now(),
        }
    }
}

/// Body of `GET /executions/{id}/session`.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct SessionPayload {
    #[serde(default)]
    pub session_id: Option<String>,
    #[serde(default)]
    pub messages: Vec<Message>,
}

impl From<SessionPayload> for SessionRecord {
    fn from(payload: SessionPayload) -> Self {
        Self {
            session_id: payload.session_id,
            messages: payload.messages,
        }
    }
}

/// Body of `POST /executions/{id}/session`.
#[derive(Debug, Serialize)]
pub struct PersistSessionRequest<'a> {
    pub session_id: &'a str,
    pub user_id: Option<&'a str>,
    pub messages: &'a [Message],
    pub metadata: &'a SessionMetadata,
}

/// Toolsets endpoint response; the control plane returns a bare array,
/// older deployments wrap it.
#[derive(Debug, Deserialize)]
#[serde(untagged)]
pub enum ToolsetsPayload {
    List(Vec<ToolsetConfig>),
    Wrapped { toolsets: Vec<ToolsetConfig> },
}

impl ToolsetsPayload {
    #[must_use]
    pub fn into_vec(self) -> Vec<ToolsetConfig> {
        match self {
            Self::List(toolsets) | Self::Wrapped { toolsets } => toolsets,
        }
    }
}

/// Path segment naming the entity collection for toolset lookups.
#[must_use]
pub const fn toolset_collection(kind: ExecutionKind) -> &'static str {
    match kind {
        ExecutionKind::Agent => "agents",
        ExecutionKind::Team => "teams",
    }
}
