//! Streamed-response processing for one LLM call.
//!
//! The processor consumes the transport's chunk stream, emits every text
//! delta immediately as a `thought` event, and scans a rolling buffer for
//! closed tool markup.  Tool calls execute in parallel or sequentially as
//! configured; results join at end of stream and are emitted and
//! persisted in source order (assistant message first, then one tool
//! message per call, then a terminal status).  The three terminator tags
//! — `ask`, `complete`, `web-browser-takeover` — are pure signals: once
//! one closes, no further executions are scheduled.

use std::sync::Arc;

use futures::StreamExt;
use serde_json::json;
use tokio::task::JoinHandle;

use crate::ai::{LlmStream, StreamChunk};
use crate::events::{AgentEvent, EventSink, emit};
use crate::store::{MessageKind, ThreadStore};
use crate::tools::message::is_terminator;
use crate::tools::{
    ToolCall, ToolContext, ToolErrorKind, ToolExecutor, ToolParser, ToolRecord, ToolResult,
    canonical_name,
};

use super::AgentError;

/// Configuration for one response-processing pass.
#[derive(Debug, Clone)]
pub struct ProcessorConfig {
    /// Execute a response's tool calls concurrently.
    pub parallel_tools: bool,
    /// Start executions as soon as their markup closes in the stream,
    /// instead of waiting for stream end.
    pub execute_on_stream: bool,
    /// Scan assistant text for inline xml tool markup.
    pub xml_tool_parsing: bool,
    /// Hard cap on tool executions per response.
    pub max_tool_calls: usize,
}

impl Default for ProcessorConfig {
    fn default() -> Self {
        Self {
            parallel_tools: true,
            execute_on_stream: true,
            xml_tool_parsing: true,
            max_tool_calls: 10,
        }
    }
}

/// What one processed response means for the driver loop.
#[derive(Debug, Clone, Default)]
pub struct IterationOutcome {
    pub terminate_requested: bool,
    pub error_flagged: bool,
    pub last_tool_name: Option<String>,
    pub assistant_text: String,
    pub executed_tools: usize,
}

enum Scheduled {
    Done(ToolResult),
    Running(JoinHandle<ToolResult>),
}

pub struct ResponseProcessor {
    executor: Arc<ToolExecutor>,
    parser: Arc<ToolParser>,
    threads: Arc<dyn ThreadStore>,
    config: ProcessorConfig,
}

impl ResponseProcessor {
    pub fn new(
        executor: Arc<ToolExecutor>,
        parser: Arc<ToolParser>,
        threads: Arc<dyn ThreadStore>,
        config: ProcessorConfig,
    ) -> Self {
        Self {
            executor,
            parser,
            threads,
            config,
        }
    }

    /// Drive one response stream to completion.
    #[tracing::instrument(name = "processor.run", skip_all)]
    pub async fn process(
        &self,
        mut stream: LlmStream,
        ctx: &ToolContext,
        sink: &EventSink,
    ) -> Result<IterationOutcome, AgentError> {
        let mut outcome = IterationOutcome::default();
        let mut buffer = String::new();
        let mut scan_from = 0usize;
        let mut pending: Vec<(ToolCall, Scheduled)> = Vec::new();
        let mut parse_errors = 0usize;
        let mut dropped_calls = 0usize;

        // ── Drain the stream ───────────────────────────────────────────────
        while let Some(item) = stream.next().await {
            match item {
                Ok(StreamChunk::TextDelta { content }) => {
                    if content.is_empty() {
                        continue;
                    }
                    emit(
                        sink,
                        AgentEvent::Thought {
                            content: content.clone(),
                        },
                    )
                    .await;
                    buffer.push_str(&content);

                    // Deferred mode parses the whole buffer at stream end.
                    if self.config.xml_tool_parsing && self.config.execute_on_stream {
                        self.scan_buffer(
                            &buffer,
                            &mut scan_from,
                            &mut outcome,
                            &mut pending,
                            &mut parse_errors,
                            &mut dropped_calls,
                            ctx,
                            sink,
                        )
                        .await;
                    }
                }
                Ok(StreamChunk::Status { status, message }) => {
                    if status == "error" {
                        tracing::error!(?message, "error chunk in response stream");
                        emit(
                            sink,
                            AgentEvent::error(
                                message.unwrap_or_else(|| "stream error".to_string()),
                            ),
                        )
                        .await;
                        // Keep draining so persisted state stays coherent,
                        // but schedule nothing further.
                        outcome.error_flagged = true;
                    }
                }
                Err(e) => {
                    tracing::error!(error = %e, "response stream failed");
                    emit(sink, AgentEvent::error(e.to_string())).await;
                    outcome.error_flagged = true;
                    break;
                }
            }
        }

        outcome.assistant_text = buffer.clone();

        // ── Deferred execution (execute_on_stream = false) ─────────────────
        if !self.config.execute_on_stream
            && self.config.xml_tool_parsing
            && !outcome.error_flagged
        {
            let parsed = self.parser.parse_response(&buffer);
            parse_errors += parsed.parse_errors;
            if parsed.truncated {
                dropped_calls += 1;
            }
            for call in parsed.calls {
                if outcome.terminate_requested {
                    break;
                }
                if is_terminator(&call.name) {
                    outcome.terminate_requested = true;
                    outcome.last_tool_name = Some(canonical_name(&call.name));
                    continue;
                }
                self.schedule(call, &mut pending, &mut outcome, ctx, sink).await;
            }
        }

        // ── Join executions and persist, in source order ───────────────────
        if !buffer.is_empty() || !pending.is_empty() {
            self.threads
                .add_message(
                    &ctx.thread_id,
                    MessageKind::Assistant,
                    json!({ "role": "assistant", "content": buffer }),
                    true,
                )
                .await?;
        }

        for (call, scheduled) in pending {
            let result = match scheduled {
                Scheduled::Done(result) => result,
                Scheduled::Running(handle) => handle.await.unwrap_or_else(|e| {
                    ToolResult::err(format!("tool execution aborted: {e}"))
                        .with_error_kind(ToolErrorKind::Exception)
                }),
            };

            let record = ToolRecord::new(&canonical_name(&call.name), &call.kwargs, &result);
            let content = serde_json::to_value(&record)
                .map_err(|e| AgentError::Internal(e.to_string()))?;
            self.threads
                .add_message(&ctx.thread_id, MessageKind::Tool, content, true)
                .await?;

            outcome.executed_tools += 1;
            outcome.last_tool_name = Some(canonical_name(&call.name));
            emit(
                sink,
                AgentEvent::ToolResult {
                    tool_name: call.name.clone(),
                    tool_output: result.output.clone(),
                    is_error: !result.success,
                },
            )
            .await;
        }

        // ── Warnings ───────────────────────────────────────────────────────
        if parse_errors > 0 {
            emit(
                sink,
                AgentEvent::status_with_message(
                    "warning",
                    "malformed tool markup was ignored",
                ),
            )
            .await;
        }
        if dropped_calls > 0 {
            emit(
                sink,
                AgentEvent::status_with_message(
                    "warning",
                    format!(
                        "tool call limit ({}) reached; additional calls were discarded",
                        self.config.max_tool_calls
                    ),
                ),
            )
            .await;
        }

        // ── Terminal status ────────────────────────────────────────────────
        self.threads
            .add_message(
                &ctx.thread_id,
                MessageKind::Status,
                json!({
                    "status_type": "iteration_end",
                    "agent_should_terminate": outcome.terminate_requested,
                    "executed_tools": outcome.executed_tools,
                }),
                false,
            )
            .await?;
        if outcome.terminate_requested {
            emit(sink, AgentEvent::status("terminate_requested")).await;
        }

        Ok(outcome)
    }

    /// Scan newly buffered text for closed tool markup and handle each
    /// region exactly once.
    #[allow(clippy::too_many_arguments)]
    async fn scan_buffer(
        &self,
        buffer: &str,
        scan_from: &mut usize,
        outcome: &mut IterationOutcome,
        pending: &mut Vec<(ToolCall, Scheduled)>,
        parse_errors: &mut usize,
        dropped_calls: &mut usize,
        ctx: &ToolContext,
        sink: &EventSink,
    ) {
        while let Some(region) =
            crate::tools::parser::next_closed_region(&buffer[*scan_from..], self.parser.known_tags())
        {
            let body = &buffer[*scan_from + region.start..*scan_from + region.end];
            *scan_from += region.end;

            // Terminator tags are pure signals; once one closes, nothing
            // further is scheduled even if more markup follows.
            if crate::tools::message::TERMINATOR_TAGS.contains(&region.tag.as_str()) {
                outcome.terminate_requested = true;
                outcome.last_tool_name = Some(canonical_name(&region.tag));
                continue;
            }
            if outcome.terminate_requested || outcome.error_flagged {
                continue;
            }

            match self.parser.parse_region(body) {
                Ok(calls) => {
                    for call in calls {
                        if outcome.terminate_requested {
                            break;
                        }
                        if is_terminator(&call.name) {
                            outcome.terminate_requested = true;
                            outcome.last_tool_name = Some(canonical_name(&call.name));
                            continue;
                        }
                        if pending.len() >= self.config.max_tool_calls {
                            *dropped_calls += 1;
                            continue;
                        }
                        self.schedule(call, pending, outcome, ctx, sink).await;
                    }
                }
                Err(e) => {
                    tracing::warn!(error = %e, "failed to parse tool region");
                    *parse_errors += 1;
                }
            }
        }
    }

    /// Emit the call event and start (or run) the execution.
    async fn schedule(
        &self,
        call: ToolCall,
        pending: &mut Vec<(ToolCall, Scheduled)>,
        outcome: &mut IterationOutcome,
        ctx: &ToolContext,
        sink: &EventSink,
    ) {
        if pending.len() >= self.config.max_tool_calls {
            return;
        }

        emit(
            sink,
            AgentEvent::ToolCall {
                tool_name: call.name.clone(),
                tool_args: serde_json::Value::Object(call.kwargs.clone()),
            },
        )
        .await;
        outcome.last_tool_name = Some(canonical_name(&call.name));

        if self.config.parallel_tools {
            let executor = self.executor.clone();
            let task_call = call.clone();
            let task_ctx = ctx.clone();
            let handle =
                tokio::spawn(async move { executor.execute(&task_call, &task_ctx).await });
            pending.push((call, Scheduled::Running(handle)));
        } else {
            let result = self.executor.execute(&call, ctx).await;
            pending.push((call, Scheduled::Done(result)));
        }
    }
}

// ─── Tests ────────────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ai::LlmError;
    use crate::events::event_channel;
    use crate::store::{InMemoryStore, Message};
    use crate::tools::testutil::{ScriptedSandbox, ctx_with};
    use crate::tools::{ToolRegistry, default_toolset};

    fn chunk_stream(chunks: Vec<StreamChunk>) -> LlmStream {
        Box::pin(futures::stream::iter(
            chunks.into_iter().map(Ok::<_, LlmError>),
        ))
    }

    fn processor(
        threads: Arc<InMemoryStore>,
        config: ProcessorConfig,
    ) -> ResponseProcessor {
        let mut registry = ToolRegistry::new();
        for tool in default_toolset() {
            registry.register(tool);
        }
        let registry = Arc::new(registry);
        let parser = Arc::new(ToolParser::from_registry(&registry, config.max_tool_calls));
        ResponseProcessor::new(
            Arc::new(ToolExecutor::new(registry)),
            parser,
            threads,
            config,
        )
    }

    async fn run_processor(
        config: ProcessorConfig,
        chunks: Vec<StreamChunk>,
    ) -> (IterationOutcome, Vec<AgentEvent>, Vec<Message>, String) {
        let sandbox = ScriptedSandbox::ok("a.txt\nb.txt");
        let (ctx, store) = ctx_with(sandbox).await;
        let thread_id = ctx.thread_id.clone();
        let proc = processor(store.clone(), config);

        let (tx, mut rx) = event_channel();
        let outcome = proc
            .process(chunk_stream(chunks), &ctx, &tx)
            .await
            .unwrap();
        drop(tx);

        let mut events = Vec::new();
        while let Some(event) = rx.recv().await {
            events.push(event);
        }

        // All messages, visible or not, in insertion order.
        let mut all = store.visible_messages(&thread_id).await.unwrap();
        if let Some(status) = store
            .latest_message(&thread_id, &[MessageKind::Status])
            .await
            .unwrap()
        {
            all.push(status);
        }
        (outcome, events, all, thread_id)
    }

    fn tool_result_events(events: &[AgentEvent]) -> Vec<&AgentEvent> {
        events
            .iter()
            .filter(|e| matches!(e, AgentEvent::ToolResult { .. }))
            .collect()
    }

    #[tokio::test]
    async fn text_only_response_emits_thoughts_and_persists_assistant() {
        let (outcome, events, messages, _) = run_processor(
            ProcessorConfig::default(),
            vec![
                StreamChunk::text("Hello, "),
                StreamChunk::text("world."),
            ],
        )
        .await;

        assert!(!outcome.terminate_requested);
        assert_eq!(outcome.assistant_text, "Hello, world.");
        let thoughts: Vec<_> = events
            .iter()
            .filter(|e| matches!(e, AgentEvent::Thought { .. }))
            .collect();
        assert_eq!(thoughts.len(), 2);

        let assistant = &messages[0];
        assert_eq!(assistant.kind, MessageKind::Assistant);
        assert_eq!(assistant.content["content"], "Hello, world.");
    }

    #[tokio::test]
    async fn tool_call_split_across_deltas_executes_once() {
        let (outcome, events, messages, _) = run_processor(
            ProcessorConfig::default(),
            vec![
                StreamChunk::text("Checking: <shell><com"),
                StreamChunk::text("mand>ls /tmp</command></shell> done"),
            ],
        )
        .await;

        assert_eq!(outcome.executed_tools, 1);
        assert_eq!(outcome.last_tool_name.as_deref(), Some("shell"));

        let calls: Vec<_> = events
            .iter()
            .filter(|e| matches!(e, AgentEvent::ToolCall { .. }))
            .collect();
        assert_eq!(calls.len(), 1);
        assert_eq!(tool_result_events(&events).len(), 1);

        // Assistant message first, then the tool record.
        assert_eq!(messages[0].kind, MessageKind::Assistant);
        assert_eq!(messages[1].kind, MessageKind::Tool);
        assert_eq!(messages[1].content["tool_name"], "shell");
        assert_eq!(messages[1].content["kwargs"]["command"], "ls /tmp");
    }

    #[tokio::test]
    async fn results_keep_source_order_under_parallel_execution() {
        let text = "<shell><command>first</command></shell>\
                    <shell><command>second</command></shell>\
                    <shell><command>third</command></shell>";
        let (outcome, _, messages, _) = run_processor(
            ProcessorConfig::default(),
            vec![StreamChunk::text(text)],
        )
        .await;

        assert_eq!(outcome.executed_tools, 3);
        let kwargs: Vec<_> = messages
            .iter()
            .filter(|m| m.kind == MessageKind::Tool)
            .map(|m| m.content["kwargs"]["command"].as_str().unwrap().to_string())
            .collect();
        assert_eq!(kwargs, vec!["first", "second", "third"]);
    }

    #[tokio::test]
    async fn cap_drops_excess_calls_with_one_warning() {
        let text: String = (0..12)
            .map(|i| format!("<shell><command>cmd {i}</command></shell>"))
            .collect();
        let (outcome, events, _, _) = run_processor(
            ProcessorConfig::default(),
            vec![StreamChunk::text(text)],
        )
        .await;

        assert_eq!(outcome.executed_tools, 10);
        assert_eq!(tool_result_events(&events).len(), 10);
        let warnings: Vec<_> = events
            .iter()
            .filter(|e| {
                matches!(e, AgentEvent::Status { status, .. } if status == "warning")
            })
            .collect();
        assert_eq!(warnings.len(), 1);
    }

    #[tokio::test]
    async fn terminator_sets_flag_and_blocks_later_tools() {
        let (outcome, events, _, _) = run_processor(
            ProcessorConfig::default(),
            vec![StreamChunk::text(
                "Done. <complete></complete> <shell><command>ls</command></shell>",
            )],
        )
        .await;

        assert!(outcome.terminate_requested);
        assert_eq!(outcome.executed_tools, 0);
        assert!(tool_result_events(&events).is_empty());
    }

    #[tokio::test]
    async fn structured_ask_is_a_terminator_too() {
        let (outcome, _, _, _) = run_processor(
            ProcessorConfig::default(),
            vec![StreamChunk::text(
                r#"<function_calls><invoke name="ask"><parameter name="text">Which one?</parameter></invoke></function_calls>"#,
            )],
        )
        .await;
        assert!(outcome.terminate_requested);
        assert_eq!(outcome.last_tool_name.as_deref(), Some("ask"));
        assert_eq!(outcome.executed_tools, 0);
    }

    #[tokio::test]
    async fn error_chunk_flags_error_and_keeps_draining() {
        let (outcome, events, _, _) = run_processor(
            ProcessorConfig::default(),
            vec![
                StreamChunk::text("partial "),
                StreamChunk::error("provider overloaded"),
                StreamChunk::text("tail"),
            ],
        )
        .await;

        assert!(outcome.error_flagged);
        // Both deltas were still emitted.
        let thoughts = events
            .iter()
            .filter(|e| matches!(e, AgentEvent::Thought { .. }))
            .count();
        assert_eq!(thoughts, 2);
        assert!(
            events
                .iter()
                .any(|e| matches!(e, AgentEvent::Error { .. }))
        );
    }

    #[tokio::test]
    async fn deferred_mode_executes_after_stream_end() {
        let config = ProcessorConfig {
            execute_on_stream: false,
            ..ProcessorConfig::default()
        };
        let (outcome, events, messages, _) = run_processor(
            config,
            vec![StreamChunk::text(
                "<shell><command>ls</command></shell>",
            )],
        )
        .await;

        assert_eq!(outcome.executed_tools, 1);
        assert_eq!(tool_result_events(&events).len(), 1);
        assert_eq!(messages[1].content["tool_name"], "shell");
    }

    #[tokio::test]
    async fn sequential_mode_matches_parallel_results() {
        let config = ProcessorConfig {
            parallel_tools: false,
            ..ProcessorConfig::default()
        };
        let (outcome, _, messages, _) = run_processor(
            config,
            vec![StreamChunk::text(
                "<shell><command>a</command></shell><shell><command>b</command></shell>",
            )],
        )
        .await;

        assert_eq!(outcome.executed_tools, 2);
        let kwargs: Vec<_> = messages
            .iter()
            .filter(|m| m.kind == MessageKind::Tool)
            .map(|m| m.content["kwargs"]["command"].as_str().unwrap().to_string())
            .collect();
        assert_eq!(kwargs, vec!["a", "b"]);
    }

    #[tokio::test]
    async fn malformed_markup_warns_once() {
        let (outcome, events, _, _) = run_processor(
            ProcessorConfig::default(),
            vec![StreamChunk::text(
                "<shell><command>a & b</command></shell>",
            )],
        )
        .await;

        assert_eq!(outcome.executed_tools, 0);
        let warnings = events
            .iter()
            .filter(|e| {
                matches!(e, AgentEvent::Status { status, .. } if status == "warning")
            })
            .count();
        assert_eq!(warnings, 1);
    }

    #[tokio::test]
    async fn terminal_status_records_termination() {
        let (_, _, messages, _) = run_processor(
            ProcessorConfig::default(),
            vec![StreamChunk::text("Done. <complete></complete>")],
        )
        .await;

        let status = messages.last().unwrap();
        assert_eq!(status.kind, MessageKind::Status);
        assert_eq!(status.content["agent_should_terminate"], true);
    }
}
