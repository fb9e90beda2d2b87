//! The outer agent iteration loop.
//!
//! Each iteration is gated by billing, skipped when the model already has
//! the last word, fed the newest browser state and image context as an
//! ephemeral turn message, and processed to completion before the next
//! one starts.  The loop stops on a terminator signal, on a flagged
//! error, on billing denial, on cancellation, or after `max_iterations` —
//! and never in the middle of a tool execution.

use std::sync::{
    Arc,
    atomic::{AtomicBool, Ordering as AtomicOrdering},
};

use futures::StreamExt;
use tokio_stream::wrappers::ReceiverStream;

use crate::ai::LlmProvider;
use crate::billing::BillingGate;
use crate::capabilities::{CapabilityProvider, register_capabilities};
use crate::config::AgentLimits;
use crate::events::{AgentEvent, EventSink, emit, event_channel};
use crate::sandbox::SandboxProvider;
use crate::storage::{ImageStore, InlineImageStore};
use crate::store::{MessageKind, ThreadStore};
use crate::tools::{Tool as _, ToolContext, ToolRegistry, default_toolset};

use super::processor::ProcessorConfig;
use super::thread::{RunThreadParams, ThreadManager};
use super::{AgentProfile, ContextBuilder, IterationState};

/// Inputs for one agent invocation.
#[derive(Clone)]
pub struct RunOptions {
    pub thread_id: String,
    pub project_id: String,
    pub model: String,
    pub profile: Option<AgentProfile>,
    /// Forward `thought` / `tool_call` / `tool_result` events to the
    /// caller as they happen.  Errors and lifecycle status are always
    /// forwarded.
    pub stream: bool,
    pub max_iterations: Option<usize>,
    pub temperature: Option<f32>,
    pub max_tokens: Option<u32>,
    pub processor: Option<ProcessorConfig>,
    /// Cooperative cancellation, honored at iteration boundaries.
    pub cancel_flag: Option<Arc<AtomicBool>>,
}

impl RunOptions {
    pub fn new(
        thread_id: impl Into<String>,
        project_id: impl Into<String>,
        model: impl Into<String>,
    ) -> Self {
        Self {
            thread_id: thread_id.into(),
            project_id: project_id.into(),
            model: model.into(),
            profile: None,
            stream: true,
            max_iterations: None,
            temperature: Some(0.0),
            max_tokens: None,
            processor: None,
            cancel_flag: None,
        }
    }
}

/// Drives an agent invocation end-to-end.
pub struct AgentDriver {
    provider: Arc<dyn LlmProvider>,
    threads: Arc<dyn ThreadStore>,
    billing: Arc<dyn BillingGate>,
    sandbox: Arc<dyn SandboxProvider>,
    images: Arc<dyn ImageStore>,
    capabilities: Vec<Arc<dyn CapabilityProvider>>,
    limits: AgentLimits,
}

impl AgentDriver {
    pub fn new(
        provider: Arc<dyn LlmProvider>,
        threads: Arc<dyn ThreadStore>,
        billing: Arc<dyn BillingGate>,
        sandbox: Arc<dyn SandboxProvider>,
    ) -> Self {
        Self {
            provider,
            threads,
            billing,
            sandbox,
            images: Arc::new(InlineImageStore),
            capabilities: Vec::new(),
            limits: AgentLimits::default(),
        }
    }

    pub fn with_images(mut self, images: Arc<dyn ImageStore>) -> Self {
        self.images = images;
        self
    }

    pub fn with_capabilities(mut self, capabilities: Vec<Arc<dyn CapabilityProvider>>) -> Self {
        self.capabilities = capabilities;
        self
    }

    pub fn with_limits(mut self, limits: AgentLimits) -> Self {
        self.limits = limits;
        self
    }

    /// Run the invocation, emitting events into `sink`.  Returns the
    /// final iteration state; every failure is also reported as an event.
    #[tracing::instrument(
        name = "agent.run",
        skip_all,
        fields(thread = %options.thread_id, model = %options.model)
    )]
    pub async fn run(&self, options: RunOptions, sink: EventSink) -> IterationState {
        let max_iterations = options.max_iterations.unwrap_or(self.limits.max_iterations);
        let mut state = IterationState::new(max_iterations);

        let account_id = match self.threads.thread_account(&options.thread_id).await {
            Ok(account) => account,
            Err(e) => {
                emit(&sink, AgentEvent::error(format!("could not resolve account: {e}"))).await;
                return state;
            }
        };

        // Tools are registered per run: the profile picks the built-in
        // subset, capability providers merge on top.
        let mut registry = ToolRegistry::new();
        let enabled = options
            .profile
            .as_ref()
            .and_then(|p| p.enabled_tools.clone());
        for tool in default_toolset() {
            let allowed = match &enabled {
                Some(names) => names.iter().any(|n| n == tool.name()),
                None => true,
            };
            if allowed {
                registry.register(tool);
            }
        }
        register_capabilities(&mut registry, &self.capabilities);

        let context = ContextBuilder::new(self.threads.clone());
        let system_prompt =
            context.system_prompt(options.profile.as_ref(), &registry, &self.capabilities);

        let manager = ThreadManager::new(
            self.provider.clone(),
            self.threads.clone(),
            Arc::new(registry),
        );

        let ctx = ToolContext {
            thread_id: options.thread_id.clone(),
            project_id: options.project_id.clone(),
            sandbox: self.sandbox.clone(),
            threads: self.threads.clone(),
            images: self.images.clone(),
        };

        let processor_config = options.processor.clone().unwrap_or(ProcessorConfig {
            max_tool_calls: self.limits.max_tool_calls,
            ..ProcessorConfig::default()
        });

        while state.iteration_index < max_iterations {
            state.iteration_index += 1;

            if let Some(flag) = &options.cancel_flag
                && flag.load(AtomicOrdering::SeqCst)
            {
                emit(&sink, AgentEvent::status("cancelled")).await;
                break;
            }

            emit(
                &sink,
                AgentEvent::status_with_message(
                    "iteration_start",
                    format!("{}/{max_iterations}", state.iteration_index),
                ),
            )
            .await;

            // ── Billing gate ───────────────────────────────────────────────
            let billing = self.billing.check(&account_id).await;
            if !billing.can_run {
                let message = format!("Billing limit reached: {}", billing.message);
                tracing::warn!(account = %account_id, "billing denied the iteration");
                emit(&sink, AgentEvent::error(message)).await;
                break;
            }

            // ── Last-message check ─────────────────────────────────────────
            match self
                .threads
                .latest_message(
                    &options.thread_id,
                    &[MessageKind::Assistant, MessageKind::Tool, MessageKind::User],
                )
                .await
            {
                Ok(Some(last)) if last.kind == MessageKind::Assistant => {
                    tracing::info!("last message is from the assistant; stopping");
                    break;
                }
                Ok(_) => {}
                Err(e) => {
                    emit(&sink, AgentEvent::error(e.to_string())).await;
                    break;
                }
            }

            // ── Ephemeral turn injection ───────────────────────────────────
            let temporary_message = match context.turn_message(&options.thread_id).await {
                Ok(message) => message,
                Err(e) => {
                    emit(&sink, AgentEvent::error(e.to_string())).await;
                    break;
                }
            };

            // ── One LLM turn ───────────────────────────────────────────────
            let params = RunThreadParams {
                system_prompt: system_prompt.clone(),
                model: options.model.clone(),
                temperature: options.temperature,
                max_tokens: options.max_tokens,
                temporary_message,
                processor: processor_config.clone(),
            };

            let run = match manager
                .run_thread(&options.thread_id, ctx.clone(), params)
                .await
            {
                Ok(run) => run,
                Err(e) => {
                    emit(&sink, AgentEvent::error(format!("Error running thread: {e}"))).await;
                    break;
                }
            };

            let mut events = run.events;
            while let Some(event) = events.next().await {
                let forward = match &event {
                    AgentEvent::Thought { .. }
                    | AgentEvent::ToolCall { .. }
                    | AgentEvent::ToolResult { .. } => options.stream,
                    _ => true,
                };
                if forward {
                    emit(&sink, event).await;
                }
            }

            let outcome = match run.outcome.await {
                Ok(Ok(outcome)) => outcome,
                Ok(Err(e)) => {
                    emit(&sink, AgentEvent::error(format!("Error running thread: {e}"))).await;
                    break;
                }
                Err(e) => {
                    emit(&sink, AgentEvent::error(format!("iteration task failed: {e}"))).await;
                    break;
                }
            };
            state.absorb(&outcome);

            if state.error_flagged {
                tracing::info!(
                    iteration = state.iteration_index,
                    "stopping due to error detected in the response stream"
                );
                break;
            }
            if state.terminate_requested {
                tracing::info!(
                    tool = ?state.last_tool_name,
                    "agent requested termination"
                );
                if options.stream {
                    emit(
                        &sink,
                        AgentEvent::FinalResponse {
                            content: state.accumulated_assistant_text.clone(),
                        },
                    )
                    .await;
                }
                break;
            }
            tracing::debug!(
                iteration = state.iteration_index,
                tool = ?state.last_tool_name,
                "iteration complete; continuing"
            );
        }

        state
    }

    /// Spawn the invocation and return its event stream.
    pub fn run_stream(self: Arc<Self>, options: RunOptions) -> ReceiverStream<AgentEvent> {
        let (tx, rx) = event_channel();
        tokio::spawn(async move {
            self.run(options, tx).await;
        });
        ReceiverStream::new(rx)
    }
}

// ─── Tests ────────────────────────────────────────────────────────────────────
