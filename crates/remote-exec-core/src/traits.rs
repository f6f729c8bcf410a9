//! Collaborator traits and their error types.

use std::sync::Arc;

use async_trait::async_trait;
use futures::stream::BoxStream;
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::{
    ExecutionContext, ExecutionId, ExecutionKind, Message, RunToken, SessionMetadata,
    StreamChunk, StreamingEvent, ToolObserver, ToolsetConfig, retry::Transient,
};

/// Lazy, finite, non-restartable sequence of output chunks.
pub type ChunkStream = BoxStream<'static, Result<StreamChunk, EngineError>>;

/// Session store error.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum StoreError {
    #[error("Session not found: {0}")]
    NotFound(String),
    #[error("Transient store failure: {0}")]
    Transient(String),
    #[error("Store rejected request with status {status}")]
    Rejected { status: u16 },
    #[error("Malformed store response: {0}")]
    Decode(String),
    #[error("Store error: {0}")]
    Internal(String),
}

impl Transient for StoreError {
    fn is_transient(&self) -> bool {
        matches!(self, Self::Transient(_))
    }
}

/// Computation engine error.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum EngineError {
    #[error("Run was cancelled")]
    Cancelled,
    #[error("Computation failed: {0}")]
    Failed(String),
    #[error("Transient engine failure: {0}")]
    Transient(String),
}

impl Transient for EngineError {
    fn is_transient(&self) -> bool {
        matches!(self, Self::Transient(_))
    }
}

/// Event sink error.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum SinkError {
    #[error("Publish timed out after {0} ms")]
    Timeout(u64),
    #[error("Transient sink failure: {0}")]
    Transient(String),
    #[error("Sink rejected event with status {status}")]
    Rejected { status: u16 },
    #[error("Sink closed")]
    Closed,
}

impl Transient for SinkError {
    fn is_transient(&self) -> bool {
        matches!(self, Self::Timeout(_) | Self::Transient(_))
    }
}

/// A running (or about to run) computation instance.
///
/// Created once per execution and held by the cancellation registry for
/// the lifetime of the run.
#[async_trait]
pub trait Computation: Send + Sync {
    /// Start the run and return its output stream.
    ///
    /// Tool invocations performed by the run must be reported to `tools`.
    async fn run(
        &self,
        ctx: ExecutionContext,
        tools: Arc<dyn ToolObserver>,
    ) -> Result<ChunkStream, EngineError>;

    /// Ask the engine to stop the run identified by `run_token`.
    ///
    /// Must return quickly; it is invoked while the registry entry is locked.
    /// `Ok(false)` means the engine declined (e.g. the run already finished).
    fn cancel_run(&self, run_token: &RunToken) -> Result<bool, EngineError>;
}

/// Factory for computation instances.
#[async_trait]
pub trait ComputationEngine: Send + Sync {
    /// Create the computation for one execution.
    async fn instantiate(
        &self,
        ctx: &ExecutionContext,
    ) -> Result<Arc<dyn Computation>, EngineError>;
}

/// Stored conversation returned by [`SessionStore::load`].
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct SessionRecord {
    #[serde(default)]
    pub session_id: Option<String>,
    #[serde(default)]
    pub messages: Vec<Message>,
}

/// One write of a session's full history.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SessionWrite {
    pub execution_id: ExecutionId,
    pub session_id: String,
    pub user_id: Option<String>,
    pub messages: Vec<Message>,
    pub metadata: SessionMetadata,
}

/// Remote store holding session history.
#[async_trait]
pub trait SessionStore: Send + Sync {
    /// Load a session; `Ok(None)` when the store has no such session.
    async fn load(
        &self,
        execution_id: &ExecutionId,
        session_id: &str,
    ) -> Result<Option<SessionRecord>, StoreError>;

    /// Overwrite the session's history. `Ok(false)` when the store declined.
    async fn persist(&self, write: &SessionWrite) -> Result<bool, StoreError>;
}

/// Destination for streaming events.
#[async_trait]
pub trait EventSink: Send + Sync {
    /// Deliver one event; `Ok` on any accepted outcome.
    async fn publish(&self, event: &StreamingEvent) -> Result<(), SinkError>;
}

/// Read-only toolset lookup consumed once per execution start.
#[async_trait]
pub trait ToolsetResolver: Send + Sync {
    /// Toolsets resolved for the agent or team.
    async fn resolve_toolsets(
        &self,
        kind: ExecutionKind,
        entity_id: &str,
    ) -> Result<Vec<ToolsetConfig>, StoreError>;
}

/// Fast-path cache of execution metadata used by event consumers.
#[async_trait]
pub trait MetadataCache: Send + Sync {
    /// Record the execution's kind.
    async fn cache_execution_kind(
        &self,
        execution_id: &ExecutionId,
        kind: ExecutionKind,
    ) -> Result<(), SinkError>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn transient_classification() {
        assert!(StoreError::Transient("timeout".into()).is_transient());
        assert!(!StoreError::NotFound("s1".into()).is_transient());
        assert!(!StoreError::Rejected { status: 400 }.is_transient());

        assert!(SinkError::Timeout(1000).is_transient());
        assert!(!SinkError::Closed.is_transient());

        assert!(!EngineError::Cancelled.is_transient());
    }

    #[test]
    fn record_defaults() {
        let record: SessionRecord = serde_json::from_str("{}").unwrap();
        assert!(record.messages.is_empty());
    }
}
