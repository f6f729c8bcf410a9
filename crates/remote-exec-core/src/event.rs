//! Output chunks produced by the engine and events delivered to the sink.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Value, json};

use crate::execution::{ExecutionId, RunToken, Usage};

/// One element of the engine's output sequence.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct StreamChunk {
    /// Text delta, possibly empty.
    #[serde(default)]
    pub content_delta: String,
    /// Present once, when the run becomes cancellable.
    #[serde(default)]
    pub run_token: Option<RunToken>,
    /// Present only on the final chunk.
    #[serde(default)]
    pub usage: Option<Usage>,
    /// Present only on the final chunk.
    #[serde(default)]
    pub finish_reason: Option<String>,
    /// Team member that produced the delta; `None` for the leader or a lone agent.
    #[serde(default)]
    pub member: Option<String>,
}

impl StreamChunk {
    /// Content delta from the leader.
    #[must_use]
    pub fn content(delta: impl Into<String>) -> Self {
        Self {
            content_delta: delta.into(),
            ..Self::default()
        }
    }

    /// Chunk announcing the run token.
    #[must_use]
    pub fn run_started(token: impl Into<String>) -> Self {
        Self {
            run_token: Some(RunToken::new(token)),
            ..Self::default()
        }
    }

    /// Content delta from a team member.
    #[must_use]
    pub fn member_content(member: impl Into<String>, delta: impl Into<String>) -> Self {
        Self {
            content_delta: delta.into(),
            member: Some(member.into()),
            ..Self::default()
        }
    }

    /// Final chunk carrying usage and finish reason.
    #[must_use]
    pub fn finish(usage: Usage, finish_reason: impl Into<String>) -> Self {
        Self {
            usage: Some(usage),
            finish_reason: Some(finish_reason.into()),
            ..Self::default()
        }
    }
}

/// Outcome of a single tool invocation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ToolStatus {
    Success,
    Failed,
}

/// Payload of a [`StreamingEvent`].
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum EventKind {
    /// Engine reported a cancellable run.
    RunStarted { run_token: RunToken },
    /// Leader text delta.
    ContentChunk { message_id: String, content: String },
    /// Team member text delta.
    MemberContentChunk {
        message_id: String,
        member_name: String,
        content: String,
    },
    /// Team member stopped streaming.
    MemberMessageComplete {
        message_id: String,
        member_name: String,
    },
    /// Tool invocation began.
    ToolStarted {
        tool_name: String,
        tool_execution_id: String,
        #[serde(default)]
        arguments: Value,
    },
    /// Tool invocation finished.
    ToolCompleted {
        tool_name: String,
        tool_execution_id: String,
        status: ToolStatus,
        #[serde(default)]
        output: Option<String>,
        #[serde(default)]
        error: Option<String>,
    },
}

/// Event pushed to the external sink.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StreamingEvent {
    pub execution_id: ExecutionId,
    /// Position in this execution's event order, starting at 0.
    pub sequence: u64,
    pub timestamp: DateTime<Utc>,
    #[serde(flatten)]
    pub kind: EventKind,
}

impl StreamingEvent {
    /// Wire name of the event.
    #[must_use]
    pub const fn event_type(&self) -> &'static str {
        match &self.kind {
            EventKind::RunStarted { .. } => "run_started",
            EventKind::ContentChunk { .. } => "message_chunk",
            EventKind::MemberContentChunk { .. } => "member_message_chunk",
            EventKind::MemberMessageComplete { .. } => "member_message_complete",
            EventKind::ToolStarted { .. } => "tool_started",
            EventKind::ToolCompleted { .. } => "tool_completed",
        }
    }

    /// Wire payload of the event.
    #[must_use]
    pub fn data(&self) -> Value {
        match &self.kind {
            EventKind::RunStarted { run_token } => json!({
                "run_id": run_token,
                "execution_id": self.execution_id,
                "cancellable": true,
            }),
            EventKind::ContentChunk {
                message_id,
                content,
            } => json!({
                "role": "assistant",
                "content": content,
                "is_chunk": true,
                "message_id": message_id,
            }),
            EventKind::MemberContentChunk {
                message_id,
                member_name,
                content,
            } => json!({
                "role": "assistant",
                "content": content,
                "is_chunk": true,
                "message_id": message_id,
                "source": "team_member",
                "member_name": member_name,
            }),
            EventKind::MemberMessageComplete {
                message_id,
                member_name,
            } => json!({
                "message_id": message_id,
                "member_name": member_name,
                "source": "team_member",
            }),
            EventKind::ToolStarted {
                tool_name,
                tool_execution_id,
                arguments,
            } => json!({
                "tool_name": tool_name,
                "tool_execution_id": tool_execution_id,
                "tool_arguments": arguments,
            }),
            EventKind::ToolCompleted {
                tool_name,
                tool_execution_id,
                status,
                output,
                error,
            } => json!({
                "tool_name": tool_name,
                "tool_execution_id": tool_execution_id,
                "status": status,
                "tool_output": output,
                "tool_error": error,
            }),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn event(kind: EventKind) -> StreamingEvent {
        StreamingEvent {
            execution_id: ExecutionId::new("exec-1"),
            sequence: 0,
            timestamp: Utc::now(),
            kind,
        }
    }

    #[test]
    fn wire_names() {
        let ev = event(EventKind::ContentChunk {
            message_id: "m1".into(),
            content: "hi".into(),
        });
        assert_eq!(ev.event_type(), "message_chunk");
        assert_eq!(ev.data()["message_id"], "m1");
        assert_eq!(ev.data()["is_chunk"], true);

        let ev = event(EventKind::RunStarted {
            run_token: RunToken::new("r1"),
        });
        assert_eq!(ev.event_type(), "run_started");
        assert_eq!(ev.data()["run_id"], "r1");
        assert_eq!(ev.data()["execution_id"], "exec-1");
    }

    #[test]
    fn tool_completed_payload() {
        let ev = event(EventKind::ToolCompleted {
            tool_name: "shell".into(),
            tool_execution_id: "shell_1".into(),
            status: ToolStatus::Failed,
            output: None,
            error: Some("exit 1".into()),
        });
        let data = ev.data();
        assert_eq!(data["status"], "failed");
        assert_eq!(data["tool_error"], "exit 1");
        assert!(data["tool_output"].is_null());
    }

    #[test]
    fn chunk_constructors() {
        let chunk = StreamChunk::run_started("r1");
        assert!(chunk.content_delta.is_empty());
        assert_eq!(chunk.run_token, Some(RunToken::new("r1")));

        let chunk = StreamChunk::member_content("researcher", "x");
        assert_eq!(chunk.member.as_deref(), Some("researcher"));
    }
}
