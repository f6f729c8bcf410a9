//! Registry of running computations, keyed by execution id.
//!
//! The only state shared between concurrent executions. Every operation
//! takes the map lock once and never awaits while holding it.

use std::{
    collections::HashMap,
    sync::{
        Arc,
        atomic::{AtomicU64, Ordering},
    },
};

use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use remote_exec_core::{Computation, ExecutionId, ExecutionKind, RunToken};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tokio_util::sync::CancellationToken;

/// Why a cancel request did not stop the execution.
#[derive(Debug, Clone, Error, PartialEq, Eq, Serialize, Deserialize)]
pub enum CancelError {
    #[error("Execution {0} not found or already completed")]
    NotFound(ExecutionId),
    #[error("Execution {0} has not started a cancellable run yet")]
    NotStarted(ExecutionId),
    #[error("Engine declined to cancel run {0}")]
    Rejected(RunToken),
    #[error("Engine failed to cancel run: {0}")]
    Engine(String),
}

/// A run the engine confirmed it stopped.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CancelledRun {
    pub run_token: RunToken,
    pub kind: ExecutionKind,
}

/// Live reference to a running computation.
#[derive(Clone)]
pub struct ComputationHandle {
    computation: Arc<dyn Computation>,
    cancel: CancellationToken,
    kind: ExecutionKind,
}

impl ComputationHandle {
    /// `cancel` is triggered once the engine confirms a cancellation.
    #[must_use]
    pub fn new(computation: Arc<dyn Computation>, cancel: CancellationToken) -> Self {
        Self {
            computation,
            cancel,
            kind: ExecutionKind::Agent,
        }
    }

    #[must_use]
    pub const fn with_kind(mut self, kind: ExecutionKind) -> Self {
        self.kind = kind;
        self
    }

    #[must_use]
    pub const fn kind(&self) -> ExecutionKind {
        self.kind
    }

    #[must_use]
    pub fn computation(&self) -> &Arc<dyn Computation> {
        &self.computation
    }

    #[must_use]
    pub const fn token(&self) -> &CancellationToken {
        &self.cancel
    }
}

/// Registry entry for one execution.
#[derive(Clone)]
pub struct ExecutionHandle {
    pub execution_id: ExecutionId,
    pub handle: ComputationHandle,
    pub run_token: Option<RunToken>,
    pub started_at: DateTime<Utc>,
    serial: u64,
}

/// Maps execution ids to their running computations.
#[derive(Default)]
pub struct CancellationRegistry {
    entries: Mutex<HashMap<ExecutionId, ExecutionHandle>>,
    next_serial: AtomicU64,
}

impl CancellationRegistry {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Store `handle` for `execution_id`, replacing any previous entry.
    pub fn register(&self, execution_id: ExecutionId, handle: ComputationHandle) {
        self.insert(execution_id, handle);
    }

    /// Register and return a guard that unregisters on drop.
    ///
    /// The guard only removes the entry it created; a later re-registration
    /// of the same id survives the guard.
    #[must_use]
    pub fn register_scoped(
        self: &Arc<Self>,
        execution_id: ExecutionId,
        handle: ComputationHandle,
    ) -> RegistrationGuard {
        let serial = self.insert(execution_id.clone(), handle);
        RegistrationGuard {
            registry: Arc::clone(self),
            execution_id,
            serial,
            released: false,
        }
    }

    fn insert(&self, execution_id: ExecutionId, handle: ComputationHandle) -> u64 {
        let serial = self.next_serial.fetch_add(1, Ordering::Relaxed);
        let entry = ExecutionHandle {
            execution_id: execution_id.clone(),
            handle,
            run_token: None,
            started_at: Utc::now(),
            serial,
        };

        let replaced = self.entries.lock().insert(execution_id.clone(), entry);
        if replaced.is_some() {
            tracing::info!(
                execution_id = execution_id.short(),
                "Replaced existing registration"
            );
        } else {
            tracing::debug!(execution_id = execution_id.short(), "Registered execution");
        }
        serial
    }

    /// Record the run token. The first token wins.
    ///
    /// Returns `true` when the token was recorded.
    pub fn set_run_token(&self, execution_id: &ExecutionId, token: RunToken) -> bool {
        let mut entries = self.entries.lock();
        let Some(entry) = entries.get_mut(execution_id) else {
            tracing::debug!(
                execution_id = execution_id.short(),
                "Run token for unregistered execution ignored"
            );
            return false;
        };

        if entry.run_token.is_some() {
            return false;
        }

        tracing::debug!(
            execution_id = execution_id.short(),
            run_token = token.short(),
            "Run token recorded"
        );
        entry.run_token = Some(token);
        true
    }

    /// Ask the engine to stop the run of `execution_id`.
    ///
    /// On success the entry is removed and its token cancelled. On failure
    /// the entry stays so the caller can retry.
    ///
    /// # Errors
    /// [`CancelError::NotFound`] if absent, [`CancelError::NotStarted`] if no
    /// run token has been reported, otherwise the engine's refusal.
    pub fn cancel(&self, execution_id: &ExecutionId) -> Result<CancelledRun, CancelError> {
        let mut entries = self.entries.lock();
        let (computation, token, kind) = {
            let entry = entries
                .get(execution_id)
                .ok_or_else(|| CancelError::NotFound(execution_id.clone()))?;
            let token = entry
                .run_token
                .clone()
                .ok_or_else(|| CancelError::NotStarted(execution_id.clone()))?;
            (Arc::clone(&entry.handle.computation), token, entry.handle.kind)
        };

        match computation.cancel_run(&token) {
            Ok(true) => {
                if let Some(entry) = entries.remove(execution_id) {
                    entry.handle.cancel.cancel();
                }
                Ok(CancelledRun {
                    run_token: token,
                    kind,
                })
            }
            Ok(false) => Err(CancelError::Rejected(token)),
            Err(e) => Err(CancelError::Engine(e.to_string())),
        }
    }

    /// Remove the entry if present. Returns whether anything was removed.
    pub fn unregister(&self, execution_id: &ExecutionId) -> bool {
        let removed = self.entries.lock().remove(execution_id).is_some();
        if removed {
            tracing::debug!(execution_id = execution_id.short(), "Unregistered execution");
        }
        removed
    }

    fn remove_own(&self, execution_id: &ExecutionId, serial: u64) -> Option<ExecutionHandle> {
        let mut entries = self.entries.lock();
        if entries.get(execution_id).is_some_and(|e| e.serial == serial) {
            entries.remove(execution_id)
        } else {
            None
        }
    }

    #[must_use]
    pub fn contains(&self, execution_id: &ExecutionId) -> bool {
        self.entries.lock().contains_key(execution_id)
    }

    #[must_use]
    pub fn active_count(&self) -> usize {
        self.entries.lock().len()
    }

    #[must_use]
    pub fn run_token(&self, execution_id: &ExecutionId) -> Option<RunToken> {
        self.entries
            .lock()
            .get(execution_id)
            .and_then(|e| e.run_token.clone())
    }

    #[must_use]
    pub fn get(&self, execution_id: &ExecutionId) -> Option<ExecutionHandle> {
        self.entries.lock().get(execution_id).cloned()
    }
}

/// Scoped registration returned by [`CancellationRegistry::register_scoped`].
///
/// Dropped without [`release`](Self::release), it also asks the engine to
/// stop the run, so an abandoned execution does not keep computing.
pub struct RegistrationGuard {
    registry: Arc<CancellationRegistry>,
    execution_id: ExecutionId,
    serial: u64,
    released: bool,
}

impl RegistrationGuard {
    #[must_use]
    pub const fn execution_id(&self) -> &ExecutionId {
        &self.execution_id
    }

    /// Unregister after a normal end of the run.
    pub fn release(mut self) {
        self.released = true;
        self.registry.remove_own(&self.execution_id, self.serial);
    }
}

impl Drop for RegistrationGuard {
    fn drop(&mut self) {
        if self.released {
            return;
        }

        let Some(entry) = self.registry.remove_own(&self.execution_id, self.serial) else {
            return;
        };

        tracing::warn!(
            execution_id = self.execution_id.short(),
            "Execution abandoned, stopping computation"
        );
        entry.handle.cancel.cancel();
        if let Some(token) = entry.run_token {
            if let Err(e) = entry.handle.computation.cancel_run(&token) {
                tracing::warn!(
                    execution_id = self.execution_id.short(),
                    "Engine cancel after abandon failed: {e}"
                );
            }
        }
    }
}
