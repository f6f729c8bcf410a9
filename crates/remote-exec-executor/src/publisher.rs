//! Fire-and-forget delivery of streaming events to the sink.
//!
//! Events are stamped and queued synchronously, then forwarded in order by a
//! background task. A slow or failing sink never stalls the producer.

use std::{
    sync::{
        Arc,
        atomic::{AtomicU64, Ordering},
    },
    time::Duration,
};

use chrono::Utc;
use parking_lot::Mutex;
use remote_exec_core::{EventKind, EventSink, ExecutionId, StreamingEvent};
use tokio::{sync::mpsc, task::JoinHandle};

/// Delivery counters.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct PublisherStats {
    pub published: u64,
    pub failed: u64,
}

struct Queue {
    next_sequence: u64,
    sender: Option<mpsc::UnboundedSender<StreamingEvent>>,
}

#[derive(Default)]
struct Counters {
    published: AtomicU64,
    failed: AtomicU64,
}

struct Inner {
    execution_id: ExecutionId,
    queue: Mutex<Queue>,
    forwarder: Mutex<Option<JoinHandle<()>>>,
    counters: Arc<Counters>,
}

/// Per-execution event publisher. Cheap to clone.
#[derive(Clone)]
pub struct EventPublisher {
    inner: Arc<Inner>,
}

impl EventPublisher {
    /// Start the forwarder task delivering to `sink`.
    ///
    /// Each delivery is bounded by `publish_timeout`. The forwarder exits
    /// once the publisher is closed or every clone is dropped.
    #[must_use]
    pub fn spawn(
        execution_id: ExecutionId,
        sink: Arc<dyn EventSink>,
        publish_timeout: Duration,
    ) -> Self {
        let (tx, rx) = mpsc::unbounded_channel();
        let inner = Arc::new(Inner {
            execution_id,
            queue: Mutex::new(Queue {
                next_sequence: 0,
                sender: Some(tx),
            }),
            forwarder: Mutex::new(None),
            counters: Arc::new(Counters::default()),
        });

        let handle = tokio::spawn(forward(
            inner.execution_id.clone(),
            Arc::clone(&inner.counters),
            rx,
            sink,
            publish_timeout,
        ));
        *inner.forwarder.lock() = Some(handle);

        Self { inner }
    }

    #[must_use]
    pub fn execution_id(&self) -> &ExecutionId {
        &self.inner.execution_id
    }

    /// Stamp and queue an event. Returns `false` once the publisher is closed.
    pub fn emit(&self, kind: EventKind) -> bool {
        let mut queue = self.inner.queue.lock();
        let sequence = queue.next_sequence;
        let Some(sender) = queue.sender.as_ref() else {
            tracing::debug!(
                execution_id = self.inner.execution_id.short(),
                "Event dropped after publisher close"
            );
            return false;
        };

        let event = StreamingEvent {
            execution_id: self.inner.execution_id.clone(),
            sequence,
            timestamp: Utc::now(),
            kind,
        };
        if sender.send(event).is_err() {
            return false;
        }
        queue.next_sequence += 1;
        true
    }

    #[must_use]
    pub fn stats(&self) -> PublisherStats {
        PublisherStats {
            published: self.inner.counters.published.load(Ordering::Relaxed),
            failed: self.inner.counters.failed.load(Ordering::Relaxed),
        }
    }

    /// Stop accepting events and wait up to `drain_timeout` for the queue to
    /// flush. Undelivered events are dropped after that.
    pub async fn close(&self, drain_timeout: Duration) -> PublisherStats {
        self.inner.queue.lock().sender = None;

        let handle = self.inner.forwarder.lock().take();
        if let Some(mut handle) = handle {
            if tokio::time::timeout(drain_timeout, &mut handle).await.is_err() {
                tracing::warn!(
                    execution_id = self.inner.execution_id.short(),
                    "Event queue not drained in {drain_timeout:?}, dropping the rest"
                );
                handle.abort();
            }
        }

        self.stats()
    }
}

async fn forward(
    execution_id: ExecutionId,
    counters: Arc<Counters>,
    mut rx: mpsc::UnboundedReceiver<StreamingEvent>,
    sink: Arc<dyn EventSink>,
    publish_timeout: Duration,
) {
    while let Some(event) = rx.recv().await {
        match tokio::time::timeout(publish_timeout, sink.publish(&event)).await {
            Ok(Ok(())) => {
                counters.published.fetch_add(1, Ordering::Relaxed);
            }
            Ok(Err(e)) => {
                counters.failed.fetch_add(1, Ordering::Relaxed);
                tracing::warn!(
                    execution_id = execution_id.short(),
                    event_type = event.event_type(),
                    sequence = event.sequence,
                    "Failed to publish event: {e}"
                );
            }
            Err(_) => {
                counters.failed.fetch_add(1, Ordering::Relaxed);
                tracing::warn!(
                    execution_id = execution_id.short(),
                    event_type = event.event_type(),
                    sequence = event.sequence,
                    "Publishing event timed out after {publish_timeout:?}"
                );
            }
        }
    }
}
