//! Periodic best-effort persistence of an in-progress execution.

use std::{
    sync::{
        Arc,
        atomic::{AtomicBool, Ordering},
    },
    time::Duration,
};

use remote_exec_core::{ExecutionId, Message, SessionMetadata};
use remote_exec_session::SessionContinuityManager;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use crate::pipeline::ResponseBuffer;

/// What every snapshot of one execution writes.
#[derive(Debug, Clone)]
pub struct SnapshotPlan {
    pub execution_id: ExecutionId,
    pub session_id: String,
    pub user_id: Option<String>,
    /// Prior history followed by this turn's user message.
    pub base: Vec<Message>,
    pub metadata: SessionMetadata,
}

/// Background task writing `base + partial response` on a fixed interval.
///
/// A snapshot is only written when the response grew since the last
/// successful one. [`stop`](Self::stop) must complete before the final
/// persist so the two writes never interleave.
pub struct SnapshotTask {
    handle: Option<JoinHandle<usize>>,
    stop: CancellationToken,
    running: Arc<AtomicBool>,
}

impl SnapshotTask {
    #[must_use]
    pub fn spawn(
        sessions: SessionContinuityManager,
        plan: SnapshotPlan,
        buffer: ResponseBuffer,
        interval: Duration,
    ) -> Self {
        let stop = CancellationToken::new();
        let running = Arc::new(AtomicBool::new(true));
        let handle = tokio::spawn(run(
            sessions,
            plan,
            buffer,
            interval,
            stop.clone(),
            Arc::clone(&running),
        ));

        Self {
            handle: Some(handle),
            stop,
            running,
        }
    }

    /// Stop the task, waiting up to `grace` for an in-flight write.
    ///
    /// Returns the number of snapshots written.
    pub async fn stop(mut self, grace: Duration) -> usize {
        self.running.store(false, Ordering::Release);
        self.stop.cancel();

        let Some(mut handle) = self.handle.take() else {
            return 0;
        };

        match tokio::time::timeout(grace, &mut handle).await {
            Ok(Ok(written)) => written,
            Ok(Err(e)) => {
                tracing::warn!("Snapshot task ended abnormally: {e}");
                0
            }
            Err(_) => {
                tracing::warn!("Snapshot still in flight after {grace:?}, aborting it");
                handle.abort();
                let _ = handle.await;
                0
            }
        }
    }
}

impl Drop for SnapshotTask {
    fn drop(&mut self) {
        self.running.store(false, Ordering::Release);
        self.stop.cancel();
        if let Some(handle) = self.handle.take() {
            handle.abort();
        }
    }
}

async fn run(
    sessions: SessionContinuityManager,
    plan: SnapshotPlan,
    buffer: ResponseBuffer,
    interval: Duration,
    stop: CancellationToken,
    running: Arc<AtomicBool>,
) -> usize {
    let mut persisted_len = 0;
    let mut written = 0;

    loop {
        tokio::select! {
            biased;
            () = stop.cancelled() => break,
            () = tokio::time::sleep(interval) => {}
        }

        if !running.load(Ordering::Acquire) {
            break;
        }

        let partial = buffer.snapshot();
        if partial.len() <= persisted_len {
            tracing::debug!(
                execution_id = plan.execution_id.short(),
                "No new output since last snapshot"
            );
            continue;
        }

        let mut messages = plan.base.clone();
        messages.push(Message::assistant(partial.as_str()));
        let metadata = plan
            .metadata
            .clone()
            .snapshot()
            .with_turn_count(messages.len());

        if sessions
            .persist_history(
                &plan.execution_id,
                &plan.session_id,
                plan.user_id.as_deref(),
                messages,
                metadata,
            )
            .await
        {
            persisted_len = partial.len();
            written += 1;
            tracing::debug!(
                execution_id = plan.execution_id.short(),
                response_len = persisted_len,
                "Snapshot written"
            );
        }
    }

    written
}
