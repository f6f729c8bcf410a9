//! Execution identity, input and terminal result.

use std::fmt;

use serde::{Deserialize, Serialize};

use crate::tool::ToolMessage;

/// Opaque identifier of one execution, supplied by the caller.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ExecutionId(String);

impl ExecutionId {
    /// Wrap a caller-supplied identifier.
    #[must_use]
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    /// Full identifier.
    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// First eight characters, used as the log field.
    #[must_use]
    pub fn short(&self) -> &str {
        short(&self.0, 8)
    }
}

impl fmt::Display for ExecutionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for ExecutionId {
    fn from(value: &str) -> Self {
        Self::new(value)
    }
}

impl From<String> for ExecutionId {
    fn from(value: String) -> Self {
        Self(value)
    }
}

/// Identifier the computation engine assigns once a run starts.
///
/// Required to cancel that specific run.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct RunToken(String);

impl RunToken {
    /// Wrap an engine-assigned run identifier.
    #[must_use]
    pub fn new(token: impl Into<String>) -> Self {
        Self(token.into())
    }

    /// Full token.
    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// First sixteen characters, used as the log field.
    #[must_use]
    pub fn short(&self) -> &str {
        short(&self.0, 16)
    }
}

impl fmt::Display for RunToken {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for RunToken {
    fn from(value: &str) -> Self {
        Self::new(value)
    }
}

fn short(s: &str, max_chars: usize) -> &str {
    s.char_indices()
        .nth(max_chars)
        .map_or(s, |(idx, _)| &s[..idx])
}

/// Whether the execution is a single agent turn or a team turn.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ExecutionKind {
    /// Single agent.
    #[default]
    Agent,
    /// Team of agents led by a coordinator model.
    Team,
}

impl ExecutionKind {
    /// Metadata key naming the executed entity (`agent_id` / `team_id`).
    #[must_use]
    pub const fn entity_key(self) -> &'static str {
        match self {
            Self::Agent => "agent_id",
            Self::Team => "team_id",
        }
    }

    /// Label recorded in the execution metadata cache.
    #[must_use]
    pub const fn cache_label(self) -> &'static str {
        match self {
            Self::Agent => "AGENT",
            Self::Team => "TEAM",
        }
    }

    /// Lowercase name used in logs.
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Agent => "agent",
            Self::Team => "team",
        }
    }
}

/// Request to run one turn.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ExecutionInput {
    /// Caller-supplied execution identifier.
    pub execution_id: ExecutionId,
    /// Agent or team.
    #[serde(default)]
    pub kind: ExecutionKind,
    /// Agent id or team id.
    pub entity_id: String,
    /// Owning organization.
    pub organization_id: String,
    /// User prompt for this turn.
    pub prompt: String,
    /// System-level instructions.
    #[serde(default)]
    pub system_prompt: Option<String>,
    /// Model identifier forwarded to the engine.
    #[serde(default)]
    pub model_id: Option<String>,
    /// Conversation to continue; `None` starts a new one.
    #[serde(default)]
    pub session_id: Option<String>,
    /// Requesting user.
    #[serde(default)]
    pub user_id: Option<String>,
}

impl ExecutionInput {
    /// Minimal agent input.
    #[must_use]
    pub fn agent(
        execution_id: impl Into<ExecutionId>,
        agent_id: impl Into<String>,
        organization_id: impl Into<String>,
        prompt: impl Into<String>,
    ) -> Self {
        Self {
            execution_id: execution_id.into(),
            kind: ExecutionKind::Agent,
            entity_id: agent_id.into(),
            organization_id: organization_id.into(),
            prompt: prompt.into(),
            system_prompt: None,
            model_id: None,
            session_id: None,
            user_id: None,
        }
    }

    /// Continue the given session.
    #[must_use]
    pub fn with_session(mut self, session_id: impl Into<String>) -> Self {
        self.session_id = Some(session_id.into());
        self
    }

    /// Attribute the turn to a user.
    #[must_use]
    pub fn with_user(mut self, user_id: impl Into<String>) -> Self {
        self.user_id = Some(user_id.into());
        self
    }

    /// Switch to a team execution.
    #[must_use]
    pub const fn as_team(mut self) -> Self {
        self.kind = ExecutionKind::Team;
        self
    }

    /// Session key used for persistence; defaults to the execution id.
    #[must_use]
    pub fn persistence_session_id(&self) -> String {
        self.session_id
            .as_deref()
            .filter(|s| !s.is_empty())
            .map_or_else(|| self.execution_id.to_string(), str::to_string)
    }
}

/// Token usage reported on the final chunk.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Usage {
    pub prompt_tokens: u64,
    pub completion_tokens: u64,
    pub total_tokens: u64,
}

/// Terminal status of an execution.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ExecutionStatus {
    /// Stream ran to exhaustion.
    Completed,
    /// Engine raised or returned an error.
    Failed,
    /// Confirmed stop via the cancellation path.
    Cancelled,
}

/// Structured outcome returned by every `execute` call.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ExecutionResult {
    pub execution_id: ExecutionId,
    pub status: ExecutionStatus,
    pub success: bool,
    /// Best-available response, partial on failure or cancellation.
    pub response: String,
    #[serde(default)]
    pub usage: Option<Usage>,
    pub finish_reason: String,
    #[serde(default)]
    pub run_token: Option<RunToken>,
    #[serde(default)]
    pub model: Option<String>,
    #[serde(default)]
    pub error: Option<String>,
    /// Whether the final session write was accepted.
    pub session_persisted: bool,
    /// Tool calls completed during the run, in completion order.
    #[serde(default)]
    pub tool_messages: Vec<ToolMessage>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn short_truncates_on_char_boundary() {
        let id = ExecutionId::new("0123456789abcdef");
        assert_eq!(id.short(), "01234567");

        let id = ExecutionId::new("abc");
        assert_eq!(id.short(), "abc");

        let id = ExecutionId::new("ééééééééé");
        assert_eq!(id.short(), "éééééééé");
    }

    #[test]
    fn persistence_session_defaults_to_execution_id() {
        let input = ExecutionInput::agent("exec-1", "agent-1", "org", "hi");
        assert_eq!(input.persistence_session_id(), "exec-1");

        let input = input.with_session("");
        assert_eq!(input.persistence_session_id(), "exec-1");

        let input = input.with_session("sess-9");
        assert_eq!(input.persistence_session_id(), "sess-9");
    }

    #[test]
    fn kind_labels() {
        assert_eq!(ExecutionKind::Agent.entity_key(), "agent_id");
        assert_eq!(ExecutionKind::Team.entity_key(), "team_id");
        assert_eq!(ExecutionKind::Team.cache_label(), "TEAM");
    }

    #[test]
    fn input_deserializes_with_defaults() {
        let input: ExecutionInput = serde_json::from_str(
            r#"{"execution_id":"e1","entity_id":"a1","organization_id":"o1","prompt":"p"}"#,
        )
        .unwrap();
        assert_eq!(input.kind, ExecutionKind::Agent);
        assert!(input.session_id.is_none());
        assert_eq!(input.execution_id.as_str(), "e1");
    }
}
