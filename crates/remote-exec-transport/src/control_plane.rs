//! HTTP client for the control plane.
//!
//! One client backs all four collaborator seams of the coordinator: session
//! storage, event delivery, toolset resolution and the execution metadata
//! cache.

use async_trait::async_trait;
use remote_exec_core::{
    EventSink, ExecutionId, ExecutionKind, MetadataCache, SessionRecord, SessionStore,
    SessionWrite, SinkError, StoreError, StreamingEvent, ToolsetConfig, ToolsetResolver,
    Transient,
};
use reqwest::{
    Client, Response, StatusCode, Url,
    header::{AUTHORIZATION, HeaderValue},
};
use serde::de::DeserializeOwned;
use thiserror::Error;

use crate::{
    config::ControlPlaneConfig,
    protocol::{
        EventEnvelope, PersistSessionRequest, SessionPayload, ToolsetsPayload, toolset_collection,
    },
};

const API_PREFIX: [&str; 2] = ["api", "v1"];

#[derive(Debug, Error)]
pub enum ControlPlaneError {
    #[error("Control plane request timed out")]
    Timeout,
    #[error("Could not reach control plane: {0}")]
    Connect(String),
    #[error("Control plane returned status {status}")]
    Status { status: u16 },
    #[error("Malformed control plane response: {0}")]
    Decode(String),
    #[error("HTTP error: {0}")]
    Http(String),
    #[error("Invalid control plane URL: {0}")]
    InvalidUrl(String),
    #[error("API key is not a valid header value")]
    InvalidApiKey,
}

impl Transient for ControlPlaneError {
    fn is_transient(&self) -> bool {
        match self {
            Self::Timeout | Self::Connect(_) => true,
            Self::Status { status } => matches!(status, 502..=504),
            _ => false,
        }
    }
}

impl From<reqwest::Error> for ControlPlaneError {
    fn from(err: reqwest::Error) -> Self {
        if err.is_timeout() {
            Self::Timeout
        } else if err.is_connect() {
            Self::Connect(err.to_string())
        } else if err.is_decode() {
            Self::Decode(err.to_string())
        } else if let Some(status) = err.status() {
            Self::Status {
                status: status.as_u16(),
            }
        } else {
            Self::Http(err.to_string())
        }
    }
}

impl From<ControlPlaneError> for StoreError {
    fn from(err: ControlPlaneError) -> Self {
        if err.is_transient() {
            return Self::Transient(err.to_string());
        }
        match err {
            ControlPlaneError::Status { status: 404 } => Self::NotFound("session".into()),
            ControlPlaneError::Status { status } => Self::Rejected { status },
            ControlPlaneError::Decode(msg) => Self::Decode(msg),
            other => Self::Internal(other.to_string()),
        }
    }
}

impl From<ControlPlaneError> for SinkError {
    fn from(err: ControlPlaneError) -> Self {
        if err.is_transient() {
            return Self::Transient(err.to_string());
        }
        match err {
            ControlPlaneError::Status { status } => Self::Rejected { status },
            other => Self::Transient(other.to_string()),
        }
    }
}

/// Control-plane client authenticated with a user key.
#[derive(Debug, Clone)]
pub struct ControlPlaneClient {
    client: Client,
    base_url: Url,
    auth: HeaderValue,
}

impl ControlPlaneClient {
    /// # Errors
    /// Fails when the base URL or API key are unusable or the HTTP client
    /// cannot be built.
    pub fn new(config: &ControlPlaneConfig) -> Result<Self, ControlPlaneError> {
        let base_url = Url::parse(&config.base_url)
            .map_err(|e| ControlPlaneError::InvalidUrl(format!("{}: {e}", config.base_url)))?;
        if base_url.cannot_be_a_base() {
            return Err(ControlPlaneError::InvalidUrl(config.base_url.clone()));
        }

        let mut auth = HeaderValue::from_str(&format!("UserKey {}", config.api_key))
            .map_err(|_| ControlPlaneError::InvalidApiKey)?;
        auth.set_sensitive(true);

        let client = Client::builder()
            .timeout(config.request_timeout)
            .connect_timeout(config.connect_timeout)
            .build()?;

        Ok(Self {
            client,
            base_url,
            auth,
        })
    }

    fn endpoint(&self, segments: &[&str]) -> Result<Url, ControlPlaneError> {
        let mut url = self.base_url.clone();
        url.path_segments_mut()
            .map_err(|()| ControlPlaneError::InvalidUrl(self.base_url.to_string()))?
            .pop_if_empty()
            .extend(API_PREFIX)
            .extend(segments);
        Ok(url)
    }

    /// Deliver one event envelope; any 2xx is accepted.
    ///
    /// # Errors
    /// Returns the transport failure or the rejecting status.
    pub async fn post_event(
        &self,
        execution_id: &ExecutionId,
        envelope: &EventEnvelope,
    ) -> Result<(), ControlPlaneError> {
        let url = self.endpoint(&["executions", execution_id.as_str(), "events"])?;
        let response = self
            .client
            .post(url)
            .header(AUTHORIZATION, self.auth.clone())
            .json(envelope)
            .send()
            .await?;

        ensure_success(&response)?;
        tracing::trace!(
            execution_id = execution_id.short(),
            event_type = %envelope.event_type,
            "Event accepted"
        );
        Ok(())
    }

    /// Fetch the stored session; `None` on 404.
    ///
    /// # Errors
    /// Returns the transport failure, a non-404 error status, or a decode error.
    pub async fn fetch_session(
        &self,
        execution_id: &ExecutionId,
        session_id: &str,
    ) -> Result<Option<SessionPayload>, ControlPlaneError> {
        let url = self.endpoint(&["executions", execution_id.as_str(), "session"])?;
        let response = self
            .client
            .get(url)
            .query(&[("session_id", session_id)])
            .header(AUTHORIZATION, self.auth.clone())
            .send()
            .await?;

        if response.status() == StatusCode::NOT_FOUND {
            return Ok(None);
        }
        decode(response).await.map(Some)
    }

    /// Overwrite the session's history.
    ///
    /// # Errors
    /// Returns the transport failure or the rejecting status.
    pub async fn persist_session(
        &self,
        execution_id: &ExecutionId,
        request: &PersistSessionRequest<'_>,
    ) -> Result<(), ControlPlaneError> {
        let url = self.endpoint(&["executions", execution_id.as_str(), "session"])?;
        let response = self
            .client
            .post(url)
            .header(AUTHORIZATION, self.auth.clone())
            .json(request)
            .send()
            .await?;

        ensure_success(&response)
    }

    /// Toolsets resolved for an agent or team; empty on 404.
    ///
    /// # Errors
    /// Returns the transport failure, a non-404 error status, or a decode error.
    pub async fn fetch_toolsets(
        &self,
        kind: ExecutionKind,
        entity_id: &str,
    ) -> Result<Vec<ToolsetConfig>, ControlPlaneError> {
        let url = self.endpoint(&[
            "toolsets",
            "associations",
            toolset_collection(kind),
            entity_id,
            "toolsets",
            "resolved",
        ])?;
        let response = self
            .client
            .get(url)
            .header(AUTHORIZATION, self.auth.clone())
            .send()
            .await?;

        if response.status() == StatusCode::NOT_FOUND {
            return Ok(Vec::new());
        }
        decode::<ToolsetsPayload>(response)
            .await
            .map(ToolsetsPayload::into_vec)
    }
}

fn ensure_success(response: &Response) -> Result<(), ControlPlaneError> {
    let status = response.status();
    if status.is_success() {
        Ok(())
    } else {
        Err(ControlPlaneError::Status {
            status: status.as_u16(),
        })
    }
}

async fn decode<T: DeserializeOwned>(response: Response) -> Result<T, ControlPlaneError> {
    ensure_success(&response)?;
    let body = response.bytes().await?;
    serde_json::from_slice(&body).map_err(|e| ControlPlaneError::Decode(e.to_string()))
}

#[async_trait]
impl SessionStore for ControlPlaneClient {
    async fn load(
        &self,
        execution_id: &ExecutionId,
        session_id: &str,
    ) -> Result<Option<SessionRecord>, StoreError> {
        Ok(self
            .fetch_session(execution_id, session_id)
            .await?
            .map(SessionRecord::from))
    }

    async fn persist(&self, write: &SessionWrite) -> Result<bool, StoreError> {
        let request = PersistSessionRequest {
            session_id: &write.session_id,
            user_id: write.user_id.as_deref(),
            messages: &write.messages,
            metadata: &write.metadata,
        };
        self.persist_session(&write.execution_id, &request).await?;
        Ok(true)
    }
}

#[async_trait]
impl EventSink for ControlPlaneClient {
    async fn publish(&self, event: &StreamingEvent) -> Result<(), SinkError> {
        let envelope = EventEnvelope::from_event(event);
        Ok(self.post_event(&event.execution_id, &envelope).await?)
    }
}

#[async_trait]
impl ToolsetResolver for ControlPlaneClient {
    async fn resolve_toolsets(
        &self,
        kind: ExecutionKind,
        entity_id: &str,
    ) -> Result<Vec<ToolsetConfig>, StoreError> {
        Ok(self.fetch_toolsets(kind, entity_id).await?)
    }
}

#[async_trait]
impl MetadataCache for ControlPlaneClient {
    async fn cache_execution_kind(
        &self,
        execution_id: &ExecutionId,
        kind: ExecutionKind,
    ) -> Result<(), SinkError> {
        let envelope = EventEnvelope::execution_kind(kind);
        Ok(self.post_event(execution_id, &envelope).await?)
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use remote_exec_core::{EventKind, Message, SessionMetadata};
    use serde_json::json;
    use wiremock::{
        Mock, MockServer, ResponseTemplate,
        matchers::{body_partial_json, header, method, path, query_param},
    };

    use super::*;

    fn client_for(server: &MockServer) -> ControlPlaneClient {
        ControlPlaneClient::new(&ControlPlaneConfig::new(server.uri(), "key-1")).unwrap()
    }

    fn write() -> SessionWrite {
        SessionWrite {
            execution_id: ExecutionId::new("exec-1"),
            session_id: "sess-1".into(),
            user_id: Some("u1".into()),
            messages: vec![Message::user("hi"), Message::assistant("hello")],
            metadata: SessionMetadata::for_entity(ExecutionKind::Agent, "a1", "o1"),
        }
    }

    #[tokio::test]
    async fn event_is_posted_with_user_key() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/api/v1/executions/exec-1/events"))
            .and(header("authorization", "UserKey key-1"))
            .and(body_partial_json(json!({
                "event_type": "message_chunk",
                "data": { "content": "hi" },
            })))
            .respond_with(ResponseTemplate::new(202))
            .expect(1)
            .mount(&server)
            .await;

        let event = StreamingEvent {
            execution_id: ExecutionId::new("exec-1"),
            sequence: 0,
            timestamp: chrono::Utc::now(),
            kind: EventKind::ContentChunk {
                message_id: "exec-1_1".into(),
                content: "hi".into(),
            },
        };
        tokio_test::assert_ok!(client_for(&server).publish(&event).await);
    }

    #[tokio::test]
    async fn loads_session_by_id() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/api/v1/executions/exec-1/session"))
            .and(query_param("session_id", "sess-1"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({
                "session_id": "sess-1",
                "messages": [
                    { "role": "user", "content": "q", "timestamp": "2026-01-01T00:00:00Z" },
                    { "role": "assistant", "content": "a", "timestamp": "2026-01-01T00:00:01Z" },
                ],
            })))
            .mount(&server)
            .await;

        let record = client_for(&server)
            .load(&ExecutionId::new("exec-1"), "sess-1")
            .await
            .unwrap()
            .unwrap();
        assert_eq!(record.session_id.as_deref(), Some("sess-1"));
        assert_eq!(record.messages.len(), 2);
        assert_eq!(record.messages[1].content, "a");
    }

    #[tokio::test]
    async fn missing_session_is_none() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/api/v1/executions/exec-1/session"))
            .respond_with(ResponseTemplate::new(404))
            .mount(&server)
            .await;

        let loaded = client_for(&server)
            .load(&ExecutionId::new("exec-1"), "sess-1")
            .await
            .unwrap();
        assert!(loaded.is_none());
    }

    #[tokio::test]
    async fn unavailable_store_is_transient() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .respond_with(ResponseTemplate::new(503))
            .mount(&server)
            .await;

        let err = client_for(&server)
            .load(&ExecutionId::new("exec-1"), "sess-1")
            .await
            .unwrap_err();
        assert!(err.is_transient());
    }

    #[tokio::test]
    async fn garbage_session_body_is_decode_error() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .respond_with(ResponseTemplate::new(200).set_body_string("not json"))
            .mount(&server)
            .await;

        let err = client_for(&server)
            .load(&ExecutionId::new("exec-1"), "sess-1")
            .await
            .unwrap_err();
        assert!(matches!(err, StoreError::Decode(_)));
    }

    #[tokio::test]
    async fn persist_sends_full_history() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/api/v1/executions/exec-1/session"))
            .and(body_partial_json(json!({
                "session_id": "sess-1",
                "user_id": "u1",
                "metadata": { "agent_id": "a1", "organization_id": "o1" },
            })))
            .respond_with(ResponseTemplate::new(201))
            .expect(1)
            .mount(&server)
            .await;

        assert!(client_for(&server).persist(&write()).await.unwrap());
    }

    #[tokio::test]
    async fn persist_rejection_keeps_status() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .respond_with(ResponseTemplate::new(400))
            .mount(&server)
            .await;

        let err = client_for(&server).persist(&write()).await.unwrap_err();
        assert_eq!(err, StoreError::Rejected { status: 400 });
        assert!(!err.is_transient());
    }

    #[tokio::test]
    async fn team_toolsets_use_team_path() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path(
                "/api/v1/toolsets/associations/teams/t1/toolsets/resolved",
            ))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!([
                { "name": "fs", "type": "file_system", "configuration": { "root": "/" } },
                { "name": "shell", "type": "shell", "enabled": false },
            ])))
            .mount(&server)
            .await;

        let toolsets = client_for(&server)
            .resolve_toolsets(ExecutionKind::Team, "t1")
            .await
            .unwrap();
        assert_eq!(toolsets.len(), 2);
        assert_eq!(toolsets[0].toolset_type, "file_system");
        assert!(!toolsets[1].enabled);
    }

    #[tokio::test]
    async fn metadata_cache_posts_kind_event() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/api/v1/executions/exec-1/events"))
            .and(body_partial_json(json!({
                "event_type": "metadata",
                "data": { "execution_type": "TEAM" },
            })))
            .respond_with(ResponseTemplate::new(200))
            .expect(1)
            .mount(&server)
            .await;

        tokio_test::assert_ok!(
            client_for(&server)
                .cache_execution_kind(&ExecutionId::new("exec-1"), ExecutionKind::Team)
                .await
        );
    }

    #[tokio::test]
    async fn slow_control_plane_times_out_as_transient() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .respond_with(ResponseTemplate::new(200).set_delay(Duration::from_millis(500)))
            .mount(&server)
            .await;

        let config = ControlPlaneConfig::new(server.uri(), "key-1")
            .with_request_timeout(Duration::from_millis(50));
        let client = ControlPlaneClient::new(&config).unwrap();

        let err = client
            .fetch_session(&ExecutionId::new("exec-1"), "sess-1")
            .await
            .unwrap_err();
        assert!(matches!(err, ControlPlaneError::Timeout));
        assert!(StoreError::from(err).is_transient());
    }

    #[test]
    fn base_path_is_preserved() {
        let config = ControlPlaneConfig::new("https://cp.example.com/prefix/", "k");
        let client = ControlPlaneClient::new(&config).unwrap();
        let url = client.endpoint(&["executions", "a/b", "events"]).unwrap();
        assert_eq!(
            url.as_str(),
            "https://cp.example.com/prefix/api/v1/executions/a%2Fb/events"
        );
    }

    #[test]
    fn rejection_is_not_retried() {
        assert!(ControlPlaneError::Status { status: 502 }.is_transient());
        assert!(!ControlPlaneError::Status { status: 401 }.is_transient());
        assert_eq!(
            SinkError::from(ControlPlaneError::Status { status: 401 }),
            SinkError::Rejected { status: 401 }
        );
    }
}
