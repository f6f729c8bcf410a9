//! Tool-execution events for one execution.

use std::{
    fmt::Display,
    future::Future,
    sync::{
        Arc,
        atomic::{AtomicU64, Ordering},
    },
};

use chrono::Utc;
use parking_lot::Mutex;
use remote_exec_core::{
    EventKind, ToolInvocation, ToolMessage, ToolObserver, ToolOutcome, ToolStatus, observe_tool,
};
use serde_json::Value;

use crate::publisher::EventPublisher;

/// Emits `ToolStarted`/`ToolCompleted` pairs through the execution's publisher
/// and keeps a record of every completed call.
///
/// Invocation ids are `{tool}_{micros}`, with micros strictly increasing so
/// concurrent calls to the same tool never collide.
pub struct ToolEvents {
    publisher: EventPublisher,
    output_limit: usize,
    last_micros: AtomicU64,
    completed: Mutex<Vec<ToolMessage>>,
}

impl ToolEvents {
    #[must_use]
    pub const fn new(publisher: EventPublisher, output_limit: usize) -> Self {
        Self {
            publisher,
            output_limit,
            last_micros: AtomicU64::new(0),
            completed: Mutex::new(Vec::new()),
        }
    }

    /// Completed calls so far, in completion order.
    #[must_use]
    pub fn messages(&self) -> Vec<ToolMessage> {
        self.completed.lock().clone()
    }

    /// Report the start of `tool_name` and return the in-flight invocation.
    pub fn started(self: &Arc<Self>, tool_name: &str, arguments: Value) -> ToolInvocation {
        ToolInvocation::begin(Arc::clone(self) as Arc<dyn ToolObserver>, tool_name, arguments)
    }

    /// Run `call` bracketed by tool events.
    ///
    /// # Errors
    /// Returns the error produced by `call`.
    pub async fn observe<F, T, E>(
        self: &Arc<Self>,
        tool_name: &str,
        arguments: Value,
        call: F,
    ) -> Result<T, E>
    where
        F: Future<Output = Result<T, E>>,
        T: Display,
        E: Display,
    {
        observe_tool(Arc::clone(self) as Arc<dyn ToolObserver>, tool_name, arguments, call).await
    }

    fn next_id(&self, tool_name: &str) -> String {
        let now = u64::try_from(Utc::now().timestamp_micros()).unwrap_or(0);
        let previous = self
            .last_micros
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |last| {
                Some(now.max(last + 1))
            })
            .unwrap_or(now);
        format!("{tool_name}_{}", now.max(previous + 1))
    }

    fn truncate(&self, text: String) -> String {
        if text.chars().count() <= self.output_limit {
            return text;
        }
        text.chars().take(self.output_limit).collect()
    }
}

impl ToolObserver for ToolEvents {
    fn on_tool_started(&self, tool_name: &str, arguments: Value) -> String {
        let tool_execution_id = self.next_id(tool_name);
        tracing::debug!(
            execution_id = self.publisher.execution_id().short(),
            tool_name,
            tool_execution_id = %tool_execution_id,
            "Tool started"
        );
        self.publisher.emit(EventKind::ToolStarted {
            tool_name: tool_name.to_string(),
            tool_execution_id: tool_execution_id.clone(),
            arguments,
        });
        tool_execution_id
    }

    fn on_tool_completed(&self, tool_name: &str, tool_execution_id: &str, outcome: ToolOutcome) {
        let (status, output, error) = match outcome {
            ToolOutcome::Success(output) => {
                (ToolStatus::Success, output.map(|o| self.truncate(o)), None)
            }
            ToolOutcome::Failed(error) => (ToolStatus::Failed, None, Some(error)),
        };
        tracing::debug!(
            execution_id = self.publisher.execution_id().short(),
            tool_name,
            tool_execution_id,
            ?status,
            "Tool completed"
        );
        self.completed.lock().push(ToolMessage {
            tool_name: tool_name.to_string(),
            tool_execution_id: tool_execution_id.to_string(),
            status,
            output: output.clone(),
            error: error.clone(),
        });
        self.publisher.emit(EventKind::ToolCompleted {
            tool_name: tool_name.to_string(),
            tool_execution_id: tool_execution_id.to_string(),
            status,
            output,
            error,
        });
    }
}

#[cfg(test)]
mod tests {
    use std::{collections::HashSet, time::Duration};

    use remote_exec_core::{EventStore, ExecutionId};

    use super::*;

    fn setup(limit: usize) -> (Arc<EventStore>, EventPublisher, Arc<ToolEvents>) {
        let store = Arc::new(EventStore::new());
        let publisher =
            EventPublisher::spawn(ExecutionId::new("e1"), store.clone(), Duration::from_secs(1));
        let tools = Arc::new(ToolEvents::new(publisher.clone(), limit));
        (store, publisher, tools)
    }

    #[tokio::test]
    async fn started_and_completed_share_id() {
        let (store, publisher, tools) = setup(1000);

        let invocation = tools.started("search", serde_json::json!({"q": "rust"}));
        let id = invocation.id().to_string();
        invocation.succeeded(Some("3 results".into()));
        publisher.close(Duration::from_secs(1)).await;

        let events = store.history();
        assert_eq!(events.len(), 2);
        match (&events[0].kind, &events[1].kind) {
            (
                EventKind::ToolStarted {
                    tool_execution_id: started,
                    ..
                },
                EventKind::ToolCompleted {
                    tool_execution_id: completed,
                    status,
                    output,
                    ..
                },
            ) => {
                assert_eq!(started, &id);
                assert_eq!(completed, &id);
                assert_eq!(*status, ToolStatus::Success);
                assert_eq!(output.as_deref(), Some("3 results"));
            }
            other => panic!("unexpected events: {other:?}"),
        }
        assert!(id.starts_with("search_"));
    }

    #[tokio::test]
    async fn ids_are_unique_under_rapid_calls() {
        let (_store, _publisher, tools) = setup(10);

        let ids: HashSet<String> = (0..1000).map(|_| tools.next_id("calc")).collect();
        assert_eq!(ids.len(), 1000);
    }

    #[tokio::test]
    async fn output_is_truncated_and_errors_reported() {
        let (store, publisher, tools) = setup(5);

        let ok: Result<String, String> = tools
            .observe("echo", Value::Null, async { Ok("abcdefghij".to_string()) })
            .await;
        assert!(ok.is_ok());
        let err: Result<String, String> = tools
            .observe("echo", Value::Null, async { Err("denied".to_string()) })
            .await;
        assert!(err.is_err());
        publisher.close(Duration::from_secs(1)).await;

        let completed: Vec<(ToolStatus, Option<String>, Option<String>)> = store
            .history()
            .into_iter()
            .filter_map(|e| match e.kind {
                EventKind::ToolCompleted {
                    status,
                    output,
                    error,
                    ..
                } => Some((status, output, error)),
                _ => None,
            })
            .collect();
        assert_eq!(
            completed,
            vec![
                (ToolStatus::Success, Some("abcde".into()), None),
                (ToolStatus::Failed, None, Some("denied".into())),
            ]
        );

        let recorded: Vec<(ToolStatus, String)> = tools
            .messages()
            .iter()
            .map(|m| (m.status, m.content().to_string()))
            .collect();
        assert_eq!(
            recorded,
            vec![
                (ToolStatus::Success, "abcde".to_string()),
                (ToolStatus::Failed, "denied".to_string()),
            ]
        );
    }

    #[tokio::test]
    async fn unfinished_call_is_not_recorded() {
        let (_store, _publisher, tools) = setup(100);

        let pending = tools.started("slow", Value::Null);
        assert!(tools.messages().is_empty());

        let id = pending.id().to_string();
        pending.succeeded(None);
        let messages = tools.messages();
        assert_eq!(messages.len(), 1);
        assert_eq!(messages[0].tool_execution_id, id);
        assert_eq!(messages[0].content(), "");
    }
}
