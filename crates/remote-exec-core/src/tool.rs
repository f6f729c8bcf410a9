//! Hooks the engine calls around each tool invocation.

use std::{fmt::Display, future::Future, sync::Arc};

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::{Message, Role, ToolStatus};

/// Result of a tool call as reported to the observer.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ToolOutcome {
    Success(Option<String>),
    Failed(String),
}

/// Record of one finished tool call, returned with the execution result.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ToolMessage {
    pub tool_name: String,
    pub tool_execution_id: String,
    pub status: ToolStatus,
    #[serde(default)]
    pub output: Option<String>,
    #[serde(default)]
    pub error: Option<String>,
}

impl ToolMessage {
    /// Output on success, the error text on failure.
    #[must_use]
    pub fn content(&self) -> &str {
        match self.status {
            ToolStatus::Success => self.output.as_deref().unwrap_or_default(),
            ToolStatus::Failed => self.error.as_deref().unwrap_or_default(),
        }
    }

    /// Conversation entry with the `tool` role.
    #[must_use]
    pub fn to_message(&self) -> Message {
        Message::new(Role::Tool, self.content())
    }
}

/// Receiver of tool-execution notifications.
///
/// Both methods are called synchronously by the engine and must not block.
pub trait ToolObserver: Send + Sync {
    /// A tool is about to run. Returns the invocation id.
    fn on_tool_started(&self, tool_name: &str, arguments: Value) -> String;

    /// The invocation identified by `tool_execution_id` finished.
    fn on_tool_completed(&self, tool_name: &str, tool_execution_id: &str, outcome: ToolOutcome);
}

/// An in-flight tool call. Consumed by reporting its outcome.
#[must_use = "report the outcome with `succeeded` or `failed`"]
pub struct ToolInvocation {
    observer: Arc<dyn ToolObserver>,
    tool_name: String,
    tool_execution_id: String,
}

impl ToolInvocation {
    /// Notify the observer that `tool_name` is starting.
    pub fn begin(observer: Arc<dyn ToolObserver>, tool_name: &str, arguments: Value) -> Self {
        let tool_execution_id = observer.on_tool_started(tool_name, arguments);
        Self {
            observer,
            tool_name: tool_name.to_string(),
            tool_execution_id,
        }
    }

    /// Id shared by the started and completed notifications.
    #[must_use]
    pub fn id(&self) -> &str {
        &self.tool_execution_id
    }

    /// Report success.
    pub fn succeeded(self, output: Option<String>) {
        self.finish(ToolOutcome::Success(output));
    }

    /// Report failure.
    pub fn failed(self, error: impl Display) {
        self.finish(ToolOutcome::Failed(error.to_string()));
    }

    fn finish(self, outcome: ToolOutcome) {
        self.observer
            .on_tool_completed(&self.tool_name, &self.tool_execution_id, outcome);
    }
}

/// Run `call` bracketed by started/completed notifications.
///
/// # Errors
/// Returns the error produced by `call`, after reporting it.
pub async fn observe_tool<F, T, E>(
    observer: Arc<dyn ToolObserver>,
    tool_name: &str,
    arguments: Value,
    call: F,
) -> Result<T, E>
where
    F: Future<Output = Result<T, E>>,
    T: Display,
    E: Display,
{
    let invocation = ToolInvocation::begin(observer, tool_name, arguments);
    match call.await {
        Ok(value) => {
            invocation.succeeded(Some(value.to_string()));
            Ok(value)
        }
        Err(e) => {
            invocation.failed(&e);
            Err(e)
        }
    }
}
