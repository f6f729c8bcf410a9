//! Execution coordinator with streaming, snapshots and cooperative cancellation.
//!
//! Provides:
//! - `ExecutionCoordinator` - Run one execution from history load to final persist
//! - `CancellationRegistry` - Shared map of running computations
//! - `StreamingPipeline` - Chunk stream to response and events
//! - `EventPublisher` / `ToolEvents` - Fire-and-forget event delivery

pub mod coordinator;
pub mod pipeline;
pub mod publisher;
pub mod registry;
pub mod snapshot;
pub mod tools;

#[cfg(test)]
mod testing;

pub use coordinator::{CancelOutcome, ExecutionCoordinator, ExecutionState};
pub use pipeline::{ResponseBuffer, StreamOutcome, StreamingPipeline, Termination};
pub use publisher::{EventPublisher, PublisherStats};
pub use registry::{
    CancelError, CancellationRegistry, CancelledRun, ComputationHandle, ExecutionHandle,
    RegistrationGuard,
};
pub use snapshot::{SnapshotPlan, SnapshotTask};
pub use tools::ToolEvents;
