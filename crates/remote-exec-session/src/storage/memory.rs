//! In-memory session storage.

use std::collections::HashMap;

use async_trait::async_trait;
use parking_lot::RwLock;
use remote_exec_core::{
    ExecutionId, Message,
    traits::{SessionRecord, SessionStore, SessionWrite, StoreError},
};

/// In-memory storage implementation.
///
/// Sessions are keyed by session id so consecutive executions continue the
/// same conversation. Useful for development and tests. Data is lost on
/// restart.
pub struct MemorySessionStore {
    sessions: RwLock<HashMap<String, Vec<Message>>>,
    writes: RwLock<Vec<SessionWrite>>,
}

impl MemorySessionStore {
    /// Create a new in-memory storage.
    #[must_use]
    pub fn new() -> Self {
        Self {
            sessions: RwLock::new(HashMap::new()),
            writes: RwLock::new(Vec::new()),
        }
    }

    /// Pre-populate a session's history.
    pub fn seed(&self, session_id: impl Into<String>, messages: Vec<Message>) {
        self.sessions.write().insert(session_id.into(), messages);
    }

    /// Current stored history of a session.
    #[must_use]
    pub fn messages(&self, session_id: &str) -> Option<Vec<Message>> {
        self.sessions.read().get(session_id).cloned()
    }

    /// Every accepted write, oldest first.
    #[must_use]
    pub fn writes(&self) -> Vec<SessionWrite> {
        self.writes.read().clone()
    }

    #[must_use]
    pub fn session_count(&self) -> usize {
        self.sessions.read().len()
    }
}

impl Default for MemorySessionStore {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl SessionStore for MemorySessionStore {
    async fn load(
        &self,
        _execution_id: &ExecutionId,
        session_id: &str,
    ) -> Result<Option<SessionRecord>, StoreError> {
        Ok(self
            .sessions
            .read()
            .get(session_id)
            .map(|messages| SessionRecord {
                session_id: Some(session_id.to_string()),
                messages: messages.clone(),
            }))
    }

    async fn persist(&self, write: &SessionWrite) -> Result<bool, StoreError> {
        if write.session_id.is_empty() {
            return Err(StoreError::Rejected { status: 400 });
        }

        self.sessions
            .write()
            .insert(write.session_id.clone(), write.messages.clone());
        self.writes.write().push(write.clone());

        Ok(true)
    }
}

#[cfg(test)]
mod tests {
    use remote_exec_core::{ExecutionKind, SessionMetadata};

    use super::*;

    fn write(session_id: &str, messages: Vec<Message>) -> SessionWrite {
        SessionWrite {
            execution_id: ExecutionId::new("e1"),
            session_id: session_id.into(),
            user_id: None,
            messages,
            metadata: SessionMetadata::for_entity(ExecutionKind::Agent, "a1", "o1"),
        }
    }

    #[tokio::test]
    async fn load_returns_last_written_order() {
        let store = MemorySessionStore::new();
        let messages = vec![
            Message::user("one"),
            Message::assistant("two"),
            Message::user("three"),
        ];
        assert!(store.persist(&write("s1", messages)).await.unwrap());

        let record = store
            .load(&ExecutionId::new("e2"), "s1")
            .await
            .unwrap()
            .unwrap();
        let contents: Vec<&str> = record.messages.iter().map(|m| m.content.as_str()).collect();
        assert_eq!(contents, vec!["one", "two", "three"]);
    }

    #[tokio::test]
    async fn unknown_session_is_none() {
        let store = MemorySessionStore::new();
        let loaded = tokio_test::assert_ok!(store.load(&ExecutionId::new("e1"), "missing").await);
        assert!(loaded.is_none());
    }

    #[tokio::test]
    async fn persist_overwrites() {
        let store = MemorySessionStore::new();
        store.seed("s1", vec![Message::user("old")]);
        store
            .persist(&write("s1", vec![Message::user("new")]))
            .await
            .unwrap();

        assert_eq!(store.messages("s1").unwrap()[0].content, "new");
        assert_eq!(store.writes().len(), 1);
        assert_eq!(store.session_count(), 1);
    }
}
