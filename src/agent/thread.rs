//! Orchestrates one LLM call end-to-end.
//!
//! `run_thread` assembles the context, issues the completion call through
//! the unified provider interface, and hands the chunk stream to the
//! response processor.  The caller gets the event stream immediately and
//! the iteration outcome when the response has fully drained.
//!
//! The thread manager owns the tool registry for the lifetime of one
//! agent run; tools are registered per run, not globally, so every agent
//! gets exactly its own tool set.

use std::sync::Arc;

use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_stream::wrappers::ReceiverStream;

use crate::ai::{CompletionRequest, LlmProvider, Message};
use crate::events::{AgentEvent, event_channel};
use crate::store::ThreadStore;
use crate::tools::{ToolContext, ToolExecutor, ToolParser, ToolRegistry};

use super::processor::{IterationOutcome, ProcessorConfig, ResponseProcessor};
use super::{AgentError, ContextBuilder};

/// Parameters for one `run_thread` call.
#[derive(Debug, Clone)]
pub struct RunThreadParams {
    pub system_prompt: String,
    pub model: String,
    pub temperature: Option<f32>,
    pub max_tokens: Option<u32>,
    /// Ephemeral user message appended after history, never persisted.
    pub temporary_message: Option<Message>,
    pub processor: ProcessorConfig,
}

/// A running thread call: the live event stream plus the join handle for
/// the final outcome.
pub struct ThreadRun {
    pub events: ReceiverStream<AgentEvent>,
    pub outcome: JoinHandle<Result<IterationOutcome, AgentError>>,
}

pub struct ThreadManager {
    provider: Arc<dyn LlmProvider>,
    threads: Arc<dyn ThreadStore>,
    registry: Arc<ToolRegistry>,
    context: ContextBuilder,
}

impl ThreadManager {
    pub fn new(
        provider: Arc<dyn LlmProvider>,
        threads: Arc<dyn ThreadStore>,
        registry: Arc<ToolRegistry>,
    ) -> Self {
        let context = ContextBuilder::new(threads.clone());
        Self {
            provider,
            threads,
            registry,
            context,
        }
    }

    pub fn registry(&self) -> &Arc<ToolRegistry> {
        &self.registry
    }

    /// Pick a max_tokens default appropriate for the model family when
    /// the caller did not set one.
    fn default_max_tokens(model: &str) -> Option<u32> {
        let model = model.to_ascii_lowercase();
        if model.contains("sonnet") {
            Some(64_000)
        } else if model.contains("gpt-4") {
            Some(4_096)
        } else {
            None
        }
    }

    /// Run one LLM call against the thread.
    ///
    /// Returns immediately with the event stream; processing runs in a
    /// spawned task.  Transport failures surface as an `error` event and
    /// an `error_flagged` outcome.
    #[tracing::instrument(name = "thread.run", skip_all, fields(model = %params.model))]
    pub async fn run_thread(
        &self,
        thread_id: &str,
        ctx: ToolContext,
        params: RunThreadParams,
    ) -> Result<ThreadRun, AgentError> {
        // Assemble messages: system + visible history + ephemeral turn
        // message.
        let mut messages = vec![Message::system(params.system_prompt.clone())];
        messages.extend(self.context.history(thread_id).await?);
        if let Some(temporary) = params.temporary_message.clone() {
            messages.push(temporary);
        }

        let mut request = CompletionRequest::new(params.model.clone(), messages).with_stream(true);
        if let Some(t) = params.temperature {
            request = request.with_temperature(t);
        }
        if let Some(m) = params.max_tokens.or_else(|| Self::default_max_tokens(&params.model)) {
            request = request.with_max_tokens(m);
        }

        let (tx, rx) = event_channel();
        let provider = self.provider.clone();
        let processor = ResponseProcessor::new(
            Arc::new(ToolExecutor::new(self.registry.clone())),
            Arc::new(ToolParser::from_registry(
                &self.registry,
                params.processor.max_tool_calls,
            )),
            self.threads.clone(),
            params.processor.clone(),
        );

        let outcome = tokio::spawn(async move {
            let stream = match provider.stream(request).await {
                Ok(stream) => stream,
                Err(e) => {
                    tracing::error!(error = %e, "completion call failed");
                    send_error(&tx, format!("Error running thread: {e}")).await;
                    return Ok(IterationOutcome {
                        error_flagged: true,
                        ..IterationOutcome::default()
                    });
                }
            };
            processor.process(stream, &ctx, &tx).await
        });

        Ok(ThreadRun {
            events: ReceiverStream::new(rx),
            outcome,
        })
    }
}

async fn send_error(tx: &mpsc::Sender<AgentEvent>, message: String) {
    crate::events::emit(tx, AgentEvent::error(message)).await;
}

// ─── Tests ────────────────────────────────────────────────────────────────────
