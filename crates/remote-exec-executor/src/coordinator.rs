//! Orchestrates one execution from history load to final persist.

use std::{fmt, sync::Arc};

use chrono::{DateTime, Utc};
use remote_exec_core::{
    ComputationEngine, CoordinatorConfig, EngineError, EventSink, ExecutionContext, ExecutionId,
    ExecutionInput, ExecutionKind, ExecutionResult, ExecutionStatus, Message, MetadataCache,
    RunToken, SessionMetadata, SessionStore, ToolMessage, ToolsetConfig, ToolsetResolver,
};
use remote_exec_session::SessionContinuityManager;
use serde::{Deserialize, Serialize};
use tokio::{
    task::{JoinError, JoinHandle},
    time::Instant,
};
use tokio_util::sync::CancellationToken;

use crate::{
    pipeline::{ResponseBuffer, StreamOutcome, StreamingPipeline, Termination},
    publisher::EventPublisher,
    registry::{CancelError, CancellationRegistry, CancelledRun, ComputationHandle},
    snapshot::{SnapshotPlan, SnapshotTask},
    tools::ToolEvents,
};

/// Lifecycle of one execution.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExecutionState {
    Pending,
    Loading,
    Running,
    Cancelling,
    Completed,
    Failed,
    Cancelled,
}

impl ExecutionState {
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::Loading => "loading",
            Self::Running => "running",
            Self::Cancelling => "cancelling",
            Self::Completed => "completed",
            Self::Failed => "failed",
            Self::Cancelled => "cancelled",
        }
    }

    #[must_use]
    pub const fn is_terminal(self) -> bool {
        matches!(self, Self::Completed | Self::Failed | Self::Cancelled)
    }
}

impl fmt::Display for ExecutionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

struct StateTracker {
    execution_id: ExecutionId,
    state: ExecutionState,
    entered_at: Instant,
}

impl StateTracker {
    fn new(execution_id: ExecutionId) -> Self {
        Self {
            execution_id,
            state: ExecutionState::Pending,
            entered_at: Instant::now(),
        }
    }

    const fn current(&self) -> ExecutionState {
        self.state
    }

    fn advance(&mut self, next: ExecutionState) {
        let now = Instant::now();
        tracing::debug!(
            execution_id = self.execution_id.short(),
            from = %self.state,
            to = %next,
            elapsed_ms = u64::try_from((now - self.entered_at).as_millis()).unwrap_or(u64::MAX),
            "Execution state changed"
        );
        self.state = next;
        self.entered_at = now;
    }
}

/// Reply to an external cancel request.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CancelOutcome {
    pub success: bool,
    #[serde(default)]
    pub error: Option<String>,
    pub execution_id: ExecutionId,
    #[serde(default)]
    pub run_token: Option<RunToken>,
    #[serde(default)]
    pub cancelled_at: Option<DateTime<Utc>>,
    /// Whether the stopped run was an agent or a team.
    #[serde(default, rename = "instance_type")]
    pub kind: Option<ExecutionKind>,
}

impl CancelOutcome {
    fn cancelled(execution_id: ExecutionId, run: CancelledRun) -> Self {
        Self {
            success: true,
            error: None,
            execution_id,
            run_token: Some(run.run_token),
            cancelled_at: Some(Utc::now()),
            kind: Some(run.kind),
        }
    }

    fn refused(execution_id: ExecutionId, error: &CancelError) -> Self {
        Self {
            success: false,
            error: Some(error.to_string()),
            execution_id,
            run_token: None,
            cancelled_at: None,
            kind: None,
        }
    }
}

/// Single execution workflow with session continuity and cancellation.
///
/// Many executions may run on one coordinator concurrently; they share only
/// the [`CancellationRegistry`].
pub struct ExecutionCoordinator {
    engine: Arc<dyn ComputationEngine>,
    sessions: SessionContinuityManager,
    registry: Arc<CancellationRegistry>,
    sink: Arc<dyn EventSink>,
    toolsets: Option<Arc<dyn ToolsetResolver>>,
    metadata_cache: Option<Arc<dyn MetadataCache>>,
    config: CoordinatorConfig,
}

impl ExecutionCoordinator {
    #[must_use]
    pub fn new(
        engine: Arc<dyn ComputationEngine>,
        store: Arc<dyn SessionStore>,
        registry: Arc<CancellationRegistry>,
        sink: Arc<dyn EventSink>,
        config: CoordinatorConfig,
    ) -> Self {
        let sessions = SessionContinuityManager::new(store).with_retry_policy(config.retry_policy());
        Self {
            engine,
            sessions,
            registry,
            sink,
            toolsets: None,
            metadata_cache: None,
            config,
        }
    }

    /// Resolve toolsets before each run.
    #[must_use]
    pub fn with_toolset_resolver(mut self, resolver: Arc<dyn ToolsetResolver>) -> Self {
        self.toolsets = Some(resolver);
        self
    }

    /// Record each execution's kind for event consumers.
    #[must_use]
    pub fn with_metadata_cache(mut self, cache: Arc<dyn MetadataCache>) -> Self {
        self.metadata_cache = Some(cache);
        self
    }

    #[must_use]
    pub const fn registry(&self) -> &Arc<CancellationRegistry> {
        &self.registry
    }

    #[must_use]
    pub const fn config(&self) -> &CoordinatorConfig {
        &self.config
    }

    /// Stop a running execution.
    pub fn cancel(&self, execution_id: &ExecutionId) -> CancelOutcome {
        match self.registry.cancel(execution_id) {
            Ok(run) => {
                tracing::info!(
                    execution_id = execution_id.short(),
                    run_token = run.run_token.short(),
                    kind = run.kind.as_str(),
                    "Cancellation accepted"
                );
                CancelOutcome::cancelled(execution_id.clone(), run)
            }
            Err(e @ (CancelError::NotFound(_) | CancelError::NotStarted(_))) => {
                tracing::info!(execution_id = execution_id.short(), "Cancel refused: {e}");
                CancelOutcome::refused(execution_id.clone(), &e)
            }
            Err(e) => {
                tracing::warn!(execution_id = execution_id.short(), "Cancel failed: {e}");
                CancelOutcome::refused(execution_id.clone(), &e)
            }
        }
    }

    /// Run one execution to a terminal state.
    ///
    /// Never fails: engine errors and cancellation are reported through the
    /// returned result, which always carries the best available response.
    pub async fn execute(&self, input: ExecutionInput) -> ExecutionResult {
        let execution_id = input.execution_id.clone();
        let mut state = StateTracker::new(execution_id.clone());
        tracing::info!(
            execution_id = execution_id.short(),
            kind = input.kind.as_str(),
            entity_id = %input.entity_id,
            "Starting execution"
        );

        state.advance(ExecutionState::Loading);
        let history = self
            .sessions
            .load_history(&execution_id, input.session_id.as_deref())
            .await;
        let toolsets = self.resolve_toolsets(&input).await;
        self.cache_kind(&input).await;

        let ctx = ExecutionContext::new(&input, SessionContinuityManager::build_context(&history))
            .with_toolsets(toolsets);
        let model = ctx.model_id.clone();
        let turn = Turn {
            session_id: input.persistence_session_id(),
            metadata: SessionMetadata::for_entity(
                input.kind,
                &input.entity_id,
                &input.organization_id,
            ),
            user_message: Message::user(input.prompt.as_str()).with_user_id(input.user_id.clone()),
            history,
        };

        let computation = match self.engine.instantiate(&ctx).await {
            Ok(computation) => computation,
            Err(e) => {
                tracing::error!(
                    execution_id = execution_id.short(),
                    "Failed to create computation: {e}"
                );
                state.advance(ExecutionState::Failed);
                let outcome =
                    StreamOutcome::interrupted(&ResponseBuffer::new(), Termination::Failed(e.to_string()));
                let persisted = self.persist_final(&input, turn, &outcome.response).await;
                return build_result(
                    execution_id,
                    ExecutionState::Failed,
                    outcome,
                    model,
                    persisted,
                    Vec::new(),
                );
            }
        };

        // Dropping this future mid-run cancels the worker and the engine run.
        let cancel = CancellationToken::new();
        let abandon = cancel.clone().drop_guard();
        let registration = self.registry.register_scoped(
            execution_id.clone(),
            ComputationHandle::new(Arc::clone(&computation), cancel.clone()).with_kind(input.kind),
        );

        let publisher = EventPublisher::spawn(
            execution_id.clone(),
            Arc::clone(&self.sink),
            self.config.publish_timeout,
        );
        let tools = Arc::new(ToolEvents::new(publisher.clone(), self.config.tool_output_limit));
        let tool_log = Arc::clone(&tools);
        let pipeline = StreamingPipeline::new(
            execution_id.clone(),
            publisher.clone(),
            Arc::clone(&self.registry),
        );
        let buffer = pipeline.buffer();

        state.advance(ExecutionState::Running);
        let snapshots = SnapshotTask::spawn(
            self.sessions.clone(),
            SnapshotPlan {
                execution_id: execution_id.clone(),
                session_id: turn.session_id.clone(),
                user_id: input.user_id.clone(),
                base: turn.messages(),
                metadata: turn.metadata.clone(),
            },
            buffer.clone(),
            self.config.snapshot_interval,
        );

        let worker_cancel = cancel.clone();
        let worker = tokio::spawn(async move {
            let started = tokio::select! {
                biased;
                () = worker_cancel.cancelled() => Err(EngineError::Cancelled),
                started = computation.run(ctx, tools) => started,
            };
            match started {
                Ok(stream) => pipeline.consume(stream, &worker_cancel).await,
                Err(EngineError::Cancelled) => pipeline.finish(Termination::Cancelled),
                Err(e) => {
                    tracing::error!("Computation failed to start: {e}");
                    pipeline.finish(Termination::Failed(e.to_string()))
                }
            }
        });

        let outcome = match join_worker(worker, &cancel, &mut state).await {
            Ok(outcome) => outcome,
            Err(e) => {
                tracing::error!(
                    execution_id = execution_id.short(),
                    "Computation worker died: {e}"
                );
                StreamOutcome::interrupted(&buffer, Termination::Failed(format!("worker failed: {e}")))
            }
        };

        let terminal = if cancel.is_cancelled() || outcome.termination == Termination::Cancelled {
            if state.current() != ExecutionState::Cancelling {
                state.advance(ExecutionState::Cancelling);
            }
            ExecutionState::Cancelled
        } else if matches!(outcome.termination, Termination::Failed(_)) {
            ExecutionState::Failed
        } else {
            ExecutionState::Completed
        };

        let snapshot_count = snapshots.stop(self.config.snapshot_grace).await;
        let stats = publisher.close(self.config.publisher_drain_timeout).await;
        registration.release();
        let _ = abandon.disarm();

        let persisted = self.persist_final(&input, turn, &outcome.response).await;
        state.advance(terminal);

        tracing::info!(
            execution_id = execution_id.short(),
            status = %terminal,
            response_len = outcome.response.len(),
            snapshots = snapshot_count,
            events_published = stats.published,
            events_failed = stats.failed,
            session_persisted = persisted,
            "Execution finished"
        );

        build_result(
            execution_id,
            terminal,
            outcome,
            model,
            persisted,
            tool_log.messages(),
        )
    }

    async fn resolve_toolsets(&self, input: &ExecutionInput) -> Vec<ToolsetConfig> {
        let Some(resolver) = &self.toolsets else {
            return Vec::new();
        };

        match resolver.resolve_toolsets(input.kind, &input.entity_id).await {
            Ok(toolsets) => {
                let enabled: Vec<ToolsetConfig> =
                    toolsets.into_iter().filter(|t| t.enabled).collect();
                tracing::debug!(
                    execution_id = input.execution_id.short(),
                    count = enabled.len(),
                    "Resolved toolsets"
                );
                enabled
            }
            Err(e) => {
                tracing::warn!(
                    execution_id = input.execution_id.short(),
                    "Toolset resolution failed, running without tools: {e}"
                );
                Vec::new()
            }
        }
    }

    async fn cache_kind(&self, input: &ExecutionInput) {
        if let Some(cache) = &self.metadata_cache {
            if let Err(e) = cache
                .cache_execution_kind(&input.execution_id, input.kind)
                .await
            {
                tracing::debug!(
                    execution_id = input.execution_id.short(),
                    "Metadata cache update failed: {e}"
                );
            }
        }
    }

    async fn persist_final(&self, input: &ExecutionInput, turn: Turn, response: &str) -> bool {
        let mut messages = turn.messages();
        if !response.is_empty() {
            messages.push(Message::assistant(response));
        }
        let metadata = turn.metadata.with_turn_count(messages.len());

        self.sessions
            .persist_history(
                &input.execution_id,
                &turn.session_id,
                input.user_id.as_deref(),
                messages,
                metadata,
            )
            .await
    }
}

/// Wait for the worker, entering `Cancelling` as soon as the token fires
/// rather than when the worker returns.
async fn join_worker(
    mut worker: JoinHandle<StreamOutcome>,
    cancel: &CancellationToken,
    state: &mut StateTracker,
) -> Result<StreamOutcome, JoinError> {
    tokio::select! {
        biased;
        joined = &mut worker => joined,
        () = cancel.cancelled() => {
            state.advance(ExecutionState::Cancelling);
            worker.await
        }
    }
}

/// Conversation state of the turn being executed.
struct Turn {
    session_id: String,
    metadata: SessionMetadata,
    user_message: Message,
    history: Vec<Message>,
}

impl Turn {
    /// Prior history followed by this turn's user message.
    fn messages(&self) -> Vec<Message> {
        let mut messages = Vec::with_capacity(self.history.len() + 2);
        messages.extend(self.history.iter().cloned());
        messages.push(self.user_message.clone());
        messages
    }
}

fn build_result(
    execution_id: ExecutionId,
    terminal: ExecutionState,
    outcome: StreamOutcome,
    model: Option<String>,
    session_persisted: bool,
    tool_messages: Vec<ToolMessage>,
) -> ExecutionResult {
    let (status, finish_reason, error) = match (terminal, outcome.termination) {
        (ExecutionState::Cancelled, _) => (
            ExecutionStatus::Cancelled,
            "cancelled".to_string(),
            Some("Execution was cancelled".to_string()),
        ),
        (ExecutionState::Failed, Termination::Failed(message)) => {
            (ExecutionStatus::Failed, "error".to_string(), Some(message))
        }
        (ExecutionState::Failed, _) => (
            ExecutionStatus::Failed,
            "error".to_string(),
            Some("Execution failed".to_string()),
        ),
        _ => (
            ExecutionStatus::Completed,
            outcome.finish_reason.unwrap_or_else(|| "stop".to_string()),
            None,
        ),
    };

    ExecutionResult {
        execution_id,
        success: status == ExecutionStatus::Completed,
        status,
        response: outcome.response,
        usage: outcome.usage,
        finish_reason,
        run_token: outcome.run_token,
        model,
        error,
        session_persisted,
        tool_messages,
    }
}
