//! Broadcast + history event store.
//!
//! Local [`EventSink`] that keeps every event it receives and fans them out
//! to live subscribers. Late subscribers receive history first, then switch
//! to live updates.

use std::collections::VecDeque;

use async_trait::async_trait;
use futures::{StreamExt, stream::BoxStream};
use parking_lot::RwLock;
use tokio::sync::broadcast;
use tokio_stream::wrappers::BroadcastStream;

use crate::{ExecutionId, StreamingEvent, traits::{EventSink, SinkError}};

/// Default number of events kept in history.
const HISTORY_EVENTS: usize = 10_000;

pub struct EventStore {
    history: RwLock<VecDeque<StreamingEvent>>,
    capacity: usize,
    sender: broadcast::Sender<StreamingEvent>,
}

impl Default for EventStore {
    fn default() -> Self {
        Self::new()
    }
}

impl EventStore {
    #[must_use]
    pub fn new() -> Self {
        Self::with_capacity(HISTORY_EVENTS)
    }

    /// Store keeping at most `capacity` events; the oldest are evicted first.
    #[must_use]
    pub fn with_capacity(capacity: usize) -> Self {
        let (sender, _) = broadcast::channel(capacity.clamp(16, HISTORY_EVENTS));
        Self {
            history: RwLock::new(VecDeque::with_capacity(32)),
            capacity: capacity.max(1),
            sender,
        }
    }

    /// Append to history and notify live listeners.
    pub fn push(&self, event: StreamingEvent) {
        {
            let mut history = self.history.write();
            while history.len() >= self.capacity {
                history.pop_front();
            }
            history.push_back(event.clone());
        }
        let _ = self.sender.send(event);
    }

    /// Receiver for live updates only.
    #[must_use]
    pub fn subscribe(&self) -> broadcast::Receiver<StreamingEvent> {
        self.sender.subscribe()
    }

    /// Snapshot of every stored event.
    #[must_use]
    pub fn history(&self) -> Vec<StreamingEvent> {
        self.history.read().iter().cloned().collect()
    }

    /// Stored events of one execution, in arrival order.
    #[must_use]
    pub fn events_for(&self, execution_id: &ExecutionId) -> Vec<StreamingEvent> {
        self.history
            .read()
            .iter()
            .filter(|e| &e.execution_id == execution_id)
            .cloned()
            .collect()
    }

    /// Concatenated leader content for one execution.
    #[must_use]
    pub fn content_for(&self, execution_id: &ExecutionId) -> String {
        self.history
            .read()
            .iter()
            .filter(|e| &e.execution_id == execution_id)
            .filter_map(|e| match &e.kind {
                crate::EventKind::ContentChunk { content, .. } => Some(content.as_str()),
                _ => None,
            })
            .collect()
    }

    /// Stream that yields history first, then live updates.
    ///
    /// Subscribes before snapshotting history, so an event pushed in between
    /// may be yielded twice but never lost.
    #[must_use]
    pub fn history_plus_stream(&self) -> BoxStream<'static, StreamingEvent> {
        let rx = self.subscribe();
        let history = self.history();

        let hist = futures::stream::iter(history);
        let live = BroadcastStream::new(rx).filter_map(|res| async move { res.ok() });

        Box::pin(hist.chain(live))
    }
}

#[async_trait]
impl EventSink for EventStore {
    async fn publish(&self, event: &StreamingEvent) -> Result<(), SinkError> {
        self.push(event.clone());
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use chrono::Utc;

    use super::*;
    use crate::EventKind;

    fn chunk(exec: &str, sequence: u64, content: &str) -> StreamingEvent {
        StreamingEvent {
            execution_id: ExecutionId::new(exec),
            sequence,
            timestamp: Utc::now(),
            kind: EventKind::ContentChunk {
                message_id: format!("{exec}_1"),
                content: content.into(),
            },
        }
    }

    #[test]
    fn history_is_bounded() {
        let store = EventStore::with_capacity(2);
        store.push(chunk("e1", 0, "a"));
        store.push(chunk("e1", 1, "b"));
        store.push(chunk("e1", 2, "c"));

        let seqs: Vec<u64> = store.history().iter().map(|e| e.sequence).collect();
        assert_eq!(seqs, vec![1, 2]);
    }

    #[tokio::test]
    async fn filters_by_execution() {
        let store = EventStore::new();
        store.publish(&chunk("e1", 0, "He")).await.unwrap();
        store.publish(&chunk("e2", 0, "xx")).await.unwrap();
        store.publish(&chunk("e1", 1, "llo")).await.unwrap();

        let id = ExecutionId::new("e1");
        assert_eq!(store.events_for(&id).len(), 2);
        assert_eq!(store.content_for(&id), "Hello");
    }

    #[tokio::test]
    async fn late_subscriber_sees_history_then_live() {
        let store = EventStore::new();
        store.push(chunk("e1", 0, "a"));

        let mut stream = store.history_plus_stream();
        store.push(chunk("e1", 1, "b"));

        assert_eq!(stream.next().await.unwrap().sequence, 0);
        assert_eq!(stream.next().await.unwrap().sequence, 1);
    }
}
