//! Scripted execution demo.
//!
//! Run with: cargo run -p scripted-run-demo
//!
//! Runs two turns of the same session against a scripted engine, then starts
//! a third turn and cancels it mid-stream. With `CONTROL_PLANE_URL` and
//! `CONTROL_PLANE_API_KEY` set, sessions, events and toolsets go to the
//! control plane instead of the in-memory store.

use std::{sync::Arc, time::Duration};

use async_trait::async_trait;
use futures::{StreamExt, stream};
use remote_exec_core::{
    ChunkStream, Computation, ComputationEngine, CoordinatorConfig, EngineError, EventKind,
    EventSink, EventStore, ExecutionContext, ExecutionInput, ExecutionResult, RunToken,
    SessionStore, StreamChunk, ToolObserver, Usage, observe_tool,
};
use remote_exec_executor::{CancellationRegistry, ExecutionCoordinator};
use remote_exec_session::MemorySessionStore;
use remote_exec_transport::{ControlPlaneClient, ControlPlaneConfig};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};
use uuid::Uuid;

/// Engine replying with a fixed sentence, one word per chunk.
struct ScriptedEngine {
    word_delay: Duration,
}

struct ScriptedComputation {
    word_delay: Duration,
}

#[async_trait]
impl ComputationEngine for ScriptedEngine {
    async fn instantiate(
        &self,
        _ctx: &ExecutionContext,
    ) -> Result<Arc<dyn Computation>, EngineError> {
        Ok(Arc::new(ScriptedComputation {
            word_delay: self.word_delay,
        }))
    }
}

#[async_trait]
impl Computation for ScriptedComputation {
    async fn run(
        &self,
        ctx: ExecutionContext,
        tools: Arc<dyn ToolObserver>,
    ) -> Result<ChunkStream, EngineError> {
        let prior = ctx.history.len();
        let words = observe_tool(
            tools,
            "count_words",
            serde_json::json!({ "text": ctx.prompt }),
            async { Ok::<_, EngineError>(ctx.prompt.split_whitespace().count()) },
        )
        .await?;

        let reply = format!(
            "Turn {} heard {words} words and remembers {prior} earlier messages.",
            prior / 2 + 1
        );
        let completion_tokens = reply.split_whitespace().count() as u64;

        let mut chunks = vec![StreamChunk::run_started(format!("run-{}", Uuid::new_v4()))];
        chunks.extend(
            reply
                .split_inclusive(' ')
                .map(StreamChunk::content),
        );
        chunks.push(StreamChunk::finish(
            Usage {
                prompt_tokens: words as u64,
                completion_tokens,
                total_tokens: words as u64 + completion_tokens,
            },
            "stop",
        ));

        let delay = self.word_delay;
        Ok(stream::iter(chunks)
            .then(move |chunk| async move {
                tokio::time::sleep(delay).await;
                Ok(chunk)
            })
            .boxed())
    }

    fn cancel_run(&self, run_token: &RunToken) -> Result<bool, EngineError> {
        tracing::info!(run_token = run_token.short(), "Engine stopping run");
        Ok(true)
    }
}

fn report(result: &ExecutionResult) {
    println!(
        "[{}] {:?} finish={} persisted={} tools={} response={:?}",
        result.execution_id.short(),
        result.status,
        result.finish_reason,
        result.session_persisted,
        result.tool_messages.len(),
        result.response,
    );
    if let Some(error) = &result.error {
        println!("    error: {error}");
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::registry()
        .with(tracing_subscriber::fmt::layer())
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "info".into()),
        )
        .init();

    let config = CoordinatorConfig::from_env()?;
    let engine = Arc::new(ScriptedEngine {
        word_delay: Duration::from_millis(40),
    });
    let registry = Arc::new(CancellationRegistry::new());
    let events = Arc::new(EventStore::new());

    let coordinator = match ControlPlaneConfig::from_env() {
        Ok(cp_config) => {
            tracing::info!(base_url = %cp_config.base_url, "Using control plane");
            let client = Arc::new(ControlPlaneClient::new(&cp_config)?);
            ExecutionCoordinator::new(
                engine,
                client.clone() as Arc<dyn SessionStore>,
                Arc::clone(&registry),
                client.clone() as Arc<dyn EventSink>,
                config,
            )
            .with_toolset_resolver(client.clone())
            .with_metadata_cache(client)
        }
        Err(e) => {
            tracing::info!("Control plane not configured ({e}), using in-memory store");
            ExecutionCoordinator::new(
                engine,
                Arc::new(MemorySessionStore::new()),
                Arc::clone(&registry),
                events.clone(),
                config,
            )
        }
    };
    let coordinator = Arc::new(coordinator);

    let mut live = events.history_plus_stream();
    tokio::spawn(async move {
        while let Some(event) = live.next().await {
            if let EventKind::ToolCompleted {
                tool_name, output, ..
            } = &event.kind
            {
                println!("    tool {tool_name} -> {}", output.as_deref().unwrap_or(""));
            }
        }
    });

    let session_id = format!("demo-{}", Uuid::new_v4());
    let turn = |prompt: &str| {
        ExecutionInput::agent(Uuid::new_v4().to_string(), "demo-agent", "demo-org", prompt)
            .with_session(session_id.clone())
            .with_user("demo-user")
    };

    report(&coordinator.execute(turn("Hello there")).await);
    report(&coordinator.execute(turn("Do you remember what I said?")).await);

    let input = turn("Tell me a long story");
    let execution_id = input.execution_id.clone();
    let running = tokio::spawn({
        let coordinator = Arc::clone(&coordinator);
        async move { coordinator.execute(input).await }
    });

    for _ in 0..200 {
        if registry.run_token(&execution_id).is_some() {
            break;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    tokio::time::sleep(Duration::from_millis(150)).await;

    let outcome = coordinator.cancel(&execution_id);
    println!(
        "cancel {} -> success={} kind={:?} error={:?}",
        execution_id.short(),
        outcome.success,
        outcome.kind,
        outcome.error
    );
    report(&running.await?);

    Ok(())
}
