//! Core abstractions for remote execution coordination.
//!
//! This crate provides the fundamental building blocks:
//! - `ExecutionInput` / `ExecutionResult` - what goes in and comes out of a run
//! - `StreamChunk` / `StreamingEvent` - engine output and sink-bound events
//! - `EventStore` - Broadcast + history sink for local consumers
//! - `RetryPolicy` - Exponential backoff for store I/O
//! - Engine, store and sink traits

pub mod config;
pub mod context;
pub mod event;
pub mod event_store;
pub mod execution;
pub mod message;
pub mod retry;
pub mod tool;
pub mod traits;

pub use config::{ConfigError, CoordinatorConfig};
pub use context::{ExecutionContext, ToolsetConfig};
pub use event::{EventKind, StreamChunk, StreamingEvent, ToolStatus};
pub use event_store::EventStore;
pub use execution::{
    ExecutionId, ExecutionInput, ExecutionKind, ExecutionResult, ExecutionStatus, RunToken, Usage,
};
pub use message::{ContextMessage, Message, Role, SessionMetadata};
pub use retry::{RetryConfig, RetryDecision, RetryPolicy, Transient};
pub use tool::{ToolInvocation, ToolMessage, ToolObserver, ToolOutcome, observe_tool};
pub use traits::{
    ChunkStream, Computation, ComputationEngine, EngineError, EventSink, MetadataCache,
    SessionRecord, SessionStore, SessionWrite, SinkError, StoreError, ToolsetResolver,
};
