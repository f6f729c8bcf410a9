//! Consumes the engine's chunk stream into a response and an event sequence.

use std::sync::Arc;

use chrono::Utc;
use futures::StreamExt;
use parking_lot::RwLock;
use remote_exec_core::{
    ChunkStream, EngineError, EventKind, ExecutionId, RunToken, StreamChunk, Usage,
};
use tokio_util::sync::CancellationToken;

use crate::{publisher::EventPublisher, registry::CancellationRegistry};

/// Leader response accumulated so far, shared with the snapshot task.
#[derive(Clone, Default)]
pub struct ResponseBuffer {
    text: Arc<RwLock<String>>,
}

impl ResponseBuffer {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    pub fn append(&self, delta: &str) {
        self.text.write().push_str(delta);
    }

    /// Copy of the current text.
    #[must_use]
    pub fn snapshot(&self) -> String {
        self.text.read().clone()
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.text.read().len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.text.read().is_empty()
    }
}

/// Why the chunk stream stopped being consumed.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Termination {
    /// Stream ran to its end.
    Exhausted,
    /// Cancellation was observed before the next chunk.
    Cancelled,
    /// Stream yielded an error.
    Failed(String),
}

/// Result of consuming a chunk stream.
#[derive(Debug, Clone)]
pub struct StreamOutcome {
    pub response: String,
    pub usage: Option<Usage>,
    pub finish_reason: Option<String>,
    pub run_token: Option<RunToken>,
    pub termination: Termination,
}

impl StreamOutcome {
    /// Outcome for a stream that never got going, keeping whatever was buffered.
    #[must_use]
    pub fn interrupted(buffer: &ResponseBuffer, termination: Termination) -> Self {
        Self {
            response: buffer.snapshot(),
            usage: None,
            finish_reason: None,
            run_token: None,
            termination,
        }
    }
}

struct MemberMessage {
    member: String,
    message_id: String,
}

/// Per-turn streaming state.
///
/// Every leader chunk of the turn shares one message id. Team member output
/// is forwarded under its own per-member message id and is not part of the
/// accumulated response.
pub struct StreamingPipeline {
    execution_id: ExecutionId,
    publisher: EventPublisher,
    registry: Arc<CancellationRegistry>,
    buffer: ResponseBuffer,
    message_id: String,
    run_token: Option<RunToken>,
    usage: Option<Usage>,
    finish_reason: Option<String>,
    member: Option<MemberMessage>,
}

impl StreamingPipeline {
    #[must_use]
    pub fn new(
        execution_id: ExecutionId,
        publisher: EventPublisher,
        registry: Arc<CancellationRegistry>,
    ) -> Self {
        let message_id = format!("{execution_id}_{}", Utc::now().timestamp_micros());
        Self {
            execution_id,
            publisher,
            registry,
            buffer: ResponseBuffer::new(),
            message_id,
            run_token: None,
            usage: None,
            finish_reason: None,
            member: None,
        }
    }

    /// Handle to the accumulated response.
    #[must_use]
    pub fn buffer(&self) -> ResponseBuffer {
        self.buffer.clone()
    }

    /// Message id shared by this turn's leader chunks.
    #[must_use]
    pub fn message_id(&self) -> &str {
        &self.message_id
    }

    /// Consume `stream` until it ends, errors, or `cancel` fires.
    ///
    /// `cancel` is checked before every chunk.
    pub async fn consume(mut self, mut stream: ChunkStream, cancel: &CancellationToken) -> StreamOutcome {
        let termination = loop {
            let next = tokio::select! {
                biased;
                () = cancel.cancelled() => break Termination::Cancelled,
                next = stream.next() => next,
            };

            match next {
                None => break Termination::Exhausted,
                Some(Ok(chunk)) => self.on_chunk(chunk),
                Some(Err(EngineError::Cancelled)) => break Termination::Cancelled,
                Some(Err(e)) => {
                    tracing::error!(
                        execution_id = self.execution_id.short(),
                        "Chunk stream failed: {e}"
                    );
                    break Termination::Failed(e.to_string());
                }
            }
        };

        self.finish(termination)
    }

    /// Close any open member message and produce the outcome.
    #[must_use]
    pub fn finish(mut self, termination: Termination) -> StreamOutcome {
        self.complete_member();
        tracing::debug!(
            execution_id = self.execution_id.short(),
            response_len = self.buffer.len(),
            ?termination,
            "Stream consumed"
        );
        StreamOutcome {
            response: self.buffer.snapshot(),
            usage: self.usage,
            finish_reason: self.finish_reason,
            run_token: self.run_token,
            termination,
        }
    }

    fn on_chunk(&mut self, chunk: StreamChunk) {
        let StreamChunk {
            content_delta,
            run_token,
            usage,
            finish_reason,
            member,
        } = chunk;

        if let Some(token) = run_token {
            self.on_run_token(token);
        }

        if !content_delta.is_empty() {
            match member {
                Some(member) => self.on_member_content(member, content_delta),
                None => {
                    self.buffer.append(&content_delta);
                    self.publisher.emit(EventKind::ContentChunk {
                        message_id: self.message_id.clone(),
                        content: content_delta,
                    });
                }
            }
        }

        if usage.is_some() {
            self.usage = usage;
        }
        if finish_reason.is_some() {
            self.finish_reason = finish_reason;
        }
    }

    fn on_run_token(&mut self, token: RunToken) {
        if self.run_token.is_some() {
            tracing::debug!(
                execution_id = self.execution_id.short(),
                run_token = token.short(),
                "Ignoring repeated run token"
            );
            return;
        }

        tracing::info!(
            execution_id = self.execution_id.short(),
            run_token = token.short(),
            "Run started"
        );
        self.registry.set_run_token(&self.execution_id, token.clone());
        self.publisher.emit(EventKind::RunStarted {
            run_token: token.clone(),
        });
        self.run_token = Some(token);
    }

    fn on_member_content(&mut self, member: String, content: String) {
        let switching = self.member.as_ref().is_none_or(|m| m.member != member);
        if switching {
            self.complete_member();
            let message_id = format!(
                "{}_{member}_{}",
                self.execution_id,
                Utc::now().timestamp_micros()
            );
            self.member = Some(MemberMessage { member, message_id });
        }

        if let Some(current) = &self.member {
            self.publisher.emit(EventKind::MemberContentChunk {
                message_id: current.message_id.clone(),
                member_name: current.member.clone(),
                content,
            });
        }
    }

    fn complete_member(&mut self) {
        if let Some(MemberMessage { member, message_id }) = self.member.take() {
            self.publisher.emit(EventKind::MemberMessageComplete {
                message_id,
                member_name: member,
            });
        }
    }
}
