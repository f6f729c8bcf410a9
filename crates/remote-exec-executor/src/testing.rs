//! Test doubles shared by the unit tests of this crate.

use std::sync::Arc;

use async_trait::async_trait;
use futures::StreamExt;
use parking_lot::Mutex;
use remote_exec_core::{
    ChunkStream, Computation, EngineError, ExecutionContext, RunToken, StreamChunk, ToolObserver,
};

#[derive(Clone, Copy)]
enum CancelReply {
    Accept,
    Decline,
    Fail,
}

pub struct StubComputation {
    reply: CancelReply,
    chunks: Vec<Result<StreamChunk, EngineError>>,
    cancels: Mutex<Vec<RunToken>>,
}

impl StubComputation {
    fn with_reply(reply: CancelReply) -> Self {
        Self {
            reply,
            chunks: Vec::new(),
            cancels: Mutex::new(Vec::new()),
        }
    }

    pub fn accepting() -> Self {
        Self::with_reply(CancelReply::Accept)
    }

    pub fn declining() -> Self {
        Self::with_reply(CancelReply::Decline)
    }

    pub fn failing() -> Self {
        Self::with_reply(CancelReply::Fail)
    }

    pub fn streaming(chunks: Vec<Result<StreamChunk, EngineError>>) -> Self {
        Self {
            chunks,
            ..Self::accepting()
        }
    }

    pub fn cancel_calls(&self) -> Vec<RunToken> {
        self.cancels.lock().clone()
    }
}

#[async_trait]
impl Computation for StubComputation {
    async fn run(
        &self,
        _ctx: ExecutionContext,
        _tools: Arc<dyn ToolObserver>,
    ) -> Result<ChunkStream, EngineError> {
        Ok(futures::stream::iter(self.chunks.clone()).boxed())
    }

    fn cancel_run(&self, run_token: &RunToken) -> Result<bool, EngineError> {
        self.cancels.lock().push(run_token.clone());
        match self.reply {
            CancelReply::Accept => Ok(true),
            CancelReply::Decline => Ok(false),
            CancelReply::Fail => Err(EngineError::Failed("engine unreachable".into())),
        }
    }
}
