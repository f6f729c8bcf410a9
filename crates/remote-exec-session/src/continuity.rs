//! Conversation history load/persist around an execution.

use std::sync::Arc;

use remote_exec_core::{
    ContextMessage, ExecutionId, Message, RetryPolicy, SessionMetadata,
    traits::{SessionStore, SessionWrite, StoreError},
};

/// Loads prior history before a run and persists it afterwards.
///
/// Every store call is wrapped in a [`RetryPolicy`]. Failures are logged and
/// absorbed: a lost history or a failed write never fails the execution.
#[derive(Clone)]
pub struct SessionContinuityManager {
    store: Arc<dyn SessionStore>,
    retry: RetryPolicy,
}

impl SessionContinuityManager {
    /// Manager with the default policy (3 retries, 1s initial delay).
    #[must_use]
    pub fn new(store: Arc<dyn SessionStore>) -> Self {
        Self {
            store,
            retry: RetryPolicy::default(),
        }
    }

    #[must_use]
    pub const fn with_retry_policy(mut self, retry: RetryPolicy) -> Self {
        self.retry = retry;
        self
    }

    /// Prior messages of `session_id`, oldest first.
    ///
    /// Empty when there is no session id, when the store has no such
    /// session, or when the store keeps failing.
    pub async fn load_history(
        &self,
        execution_id: &ExecutionId,
        session_id: Option<&str>,
    ) -> Vec<Message> {
        let Some(session_id) = session_id.filter(|s| !s.is_empty()) else {
            tracing::debug!(execution_id = execution_id.short(), "No session id, starting fresh");
            return Vec::new();
        };

        let result = self
            .retry
            .run_transient("session load", || self.store.load(execution_id, session_id))
            .await;

        match result {
            Ok(Some(record)) => {
                tracing::info!(
                    execution_id = execution_id.short(),
                    session_id,
                    message_count = record.messages.len(),
                    "Loaded session history"
                );
                record.messages
            }
            Ok(None) | Err(StoreError::NotFound(_)) => {
                tracing::info!(
                    execution_id = execution_id.short(),
                    session_id,
                    "No existing session, starting fresh"
                );
                Vec::new()
            }
            Err(e) => {
                tracing::warn!(
                    execution_id = execution_id.short(),
                    session_id,
                    "Failed to load session history, continuing without it: {e}"
                );
                Vec::new()
            }
        }
    }

    /// Overwrite the stored history. Returns whether the store accepted it.
    ///
    /// An empty message list is not written and reports success.
    pub async fn persist_history(
        &self,
        execution_id: &ExecutionId,
        session_id: &str,
        user_id: Option<&str>,
        messages: Vec<Message>,
        metadata: SessionMetadata,
    ) -> bool {
        if messages.is_empty() {
            tracing::debug!(execution_id = execution_id.short(), "No messages to persist");
            return true;
        }

        let write = SessionWrite {
            execution_id: execution_id.clone(),
            session_id: session_id.to_string(),
            user_id: user_id.map(str::to_string),
            messages,
            metadata,
        };

        match self
            .retry
            .run_transient("session persist", || self.store.persist(&write))
            .await
        {
            Ok(true) => {
                tracing::info!(
                    execution_id = execution_id.short(),
                    session_id,
                    message_count = write.messages.len(),
                    snapshot = write.metadata.snapshot,
                    "Persisted session"
                );
                true
            }
            Ok(false) => {
                tracing::warn!(
                    execution_id = execution_id.short(),
                    session_id,
                    "Session store declined the write"
                );
                false
            }
            Err(e) => {
                tracing::warn!(
                    execution_id = execution_id.short(),
                    session_id,
                    "Failed to persist session: {e}"
                );
                false
            }
        }
    }

    /// Project stored messages onto what the engine needs, keeping order.
    #[must_use]
    pub fn build_context(messages: &[Message]) -> Vec<ContextMessage> {
        messages.iter().map(ContextMessage::from).collect()
    }
}

#[cfg(test)]
mod tests {
    use std::{
        collections::VecDeque,
        sync::atomic::{AtomicUsize, Ordering},
        time::Duration,
    };

    use async_trait::async_trait;
    use parking_lot::Mutex;
    use remote_exec_core::{ExecutionKind, Role, traits::SessionRecord};

    use super::*;
    use crate::MemorySessionStore;

    /// Store replaying scripted outcomes, then succeeding.
    #[derive(Default)]
    struct ScriptedStore {
        loads: Mutex<VecDeque<Result<Option<SessionRecord>, StoreError>>>,
        persists: Mutex<VecDeque<Result<bool, StoreError>>>,
        load_calls: AtomicUsize,
        persist_calls: AtomicUsize,
    }

    impl ScriptedStore {
        fn with_loads(outcomes: Vec<Result<Option<SessionRecord>, StoreError>>) -> Self {
            Self {
                loads: Mutex::new(outcomes.into()),
                ..Self::default()
            }
        }

        fn with_persists(outcomes: Vec<Result<bool, StoreError>>) -> Self {
            Self {
                persists: Mutex::new(outcomes.into()),
                ..Self::default()
            }
        }
    }

    #[async_trait]
    impl SessionStore for ScriptedStore {
        async fn load(
            &self,
            _execution_id: &ExecutionId,
            _session_id: &str,
        ) -> Result<Option<SessionRecord>, StoreError> {
            self.load_calls.fetch_add(1, Ordering::SeqCst);
            self.loads.lock().pop_front().unwrap_or(Ok(None))
        }

        async fn persist(&self, _write: &SessionWrite) -> Result<bool, StoreError> {
            self.persist_calls.fetch_add(1, Ordering::SeqCst);
            self.persists.lock().pop_front().unwrap_or(Ok(true))
        }
    }

    fn manager(store: Arc<dyn SessionStore>) -> SessionContinuityManager {
        SessionContinuityManager::new(store)
    }

    fn metadata() -> SessionMetadata {
        SessionMetadata::for_entity(ExecutionKind::Agent, "a1", "o1")
    }

    #[tokio::test(start_paused = true)]
    async fn not_found_is_empty_without_retry() {
        let store = Arc::new(ScriptedStore::with_loads(vec![Err(StoreError::NotFound(
            "s1".into(),
        ))]));
        let history = manager(store.clone())
            .load_history(&ExecutionId::new("e1"), Some("s1"))
            .await;

        assert!(history.is_empty());
        assert_eq!(store.load_calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn missing_session_id_skips_store() {
        let store = Arc::new(ScriptedStore::default());
        let mgr = manager(store.clone());

        assert!(mgr.load_history(&ExecutionId::new("e1"), None).await.is_empty());
        assert!(mgr.load_history(&ExecutionId::new("e1"), Some("")).await.is_empty());
        assert_eq!(store.load_calls.load(Ordering::SeqCst), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn transient_load_failures_are_retried() {
        let record = SessionRecord {
            session_id: Some("s1".into()),
            messages: vec![Message::user("hi"), Message::assistant("hello")],
        };
        let store = Arc::new(ScriptedStore::with_loads(vec![
            Err(StoreError::Transient("timeout".into())),
            Err(StoreError::Transient("timeout".into())),
            Ok(Some(record)),
        ]));

        let started = tokio::time::Instant::now();
        let history = manager(store.clone())
            .load_history(&ExecutionId::new("e1"), Some("s1"))
            .await;

        assert_eq!(history.len(), 2);
        assert_eq!(store.load_calls.load(Ordering::SeqCst), 3);
        assert!(started.elapsed() >= Duration::from_secs(3));
    }

    #[tokio::test(start_paused = true)]
    async fn exhausted_load_retries_yield_empty() {
        let store = Arc::new(ScriptedStore::with_loads(
            (0..4)
                .map(|_| Err(StoreError::Transient("timeout".into())))
                .collect(),
        ));
        let history = manager(store.clone())
            .load_history(&ExecutionId::new("e1"), Some("s1"))
            .await;

        assert!(history.is_empty());
        assert_eq!(store.load_calls.load(Ordering::SeqCst), 4);
    }

    #[tokio::test(start_paused = true)]
    async fn persist_failure_returns_false() {
        let store = Arc::new(ScriptedStore::with_persists(vec![Err(
            StoreError::Rejected { status: 422 },
        )]));
        let ok = manager(store.clone())
            .persist_history(
                &ExecutionId::new("e1"),
                "s1",
                None,
                vec![Message::user("hi")],
                metadata(),
            )
            .await;

        assert!(!ok);
        assert_eq!(store.persist_calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn declined_persist_returns_false() {
        let store = Arc::new(ScriptedStore::with_persists(vec![Ok(false)]));
        let ok = manager(store)
            .persist_history(
                &ExecutionId::new("e1"),
                "s1",
                None,
                vec![Message::user("hi")],
                metadata(),
            )
            .await;
        assert!(!ok);
    }

    #[tokio::test(start_paused = true)]
    async fn empty_persist_is_skipped() {
        let store = Arc::new(ScriptedStore::default());
        let ok = manager(store.clone())
            .persist_history(&ExecutionId::new("e1"), "s1", None, Vec::new(), metadata())
            .await;

        assert!(ok);
        assert_eq!(store.persist_calls.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn round_trip_through_memory_store() {
        let store = Arc::new(MemorySessionStore::new());
        let mgr = manager(store.clone());
        let exec = ExecutionId::new("e1");

        let messages = vec![Message::user("q"), Message::assistant("a")];
        assert!(
            mgr.persist_history(&exec, "s1", Some("u1"), messages, metadata())
                .await
        );

        let loaded = mgr.load_history(&ExecutionId::new("e2"), Some("s1")).await;
        assert_eq!(loaded.len(), 2);
        assert_eq!(store.writes()[0].user_id.as_deref(), Some("u1"));
    }

    #[test]
    fn build_context_preserves_order() {
        let messages = vec![
            Message::user("first"),
            Message::assistant("second"),
            Message::new(Role::Tool, "third"),
        ];
        let ctx = SessionContinuityManager::build_context(&messages);

        let projected: Vec<(Role, &str)> =
            ctx.iter().map(|m| (m.role, m.content.as_str())).collect();
        assert_eq!(
            projected,
            vec![
                (Role::User, "first"),
                (Role::Assistant, "second"),
                (Role::Tool, "third"),
            ]
        );
    }
}
