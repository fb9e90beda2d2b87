//! Typed events emitted while an agent invocation runs.
//!
//! Every event serializes to one JSON object tagged by `type`, ready to be
//! written as a JSON line or an SSE record.  Events for one invocation flow
//! through a bounded mpsc channel and arrive in causal order: text deltas
//! for a response region precede the `tool_call` parsed from that region,
//! and tool results are delivered in source order.

use serde::{Deserialize, Serialize};
use serde_json::Value;
use tokio::sync::mpsc;

/// Buffer size of a per-invocation event channel.
pub const EVENT_CHANNEL_CAPACITY: usize = 256;

/// All events observable by a client of the agent runtime.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum AgentEvent {
    /// Incremental assistant text.
    Thought { content: String },
    /// A tool invocation was parsed and is about to execute.
    ToolCall { tool_name: String, tool_args: Value },
    /// Result of one executed tool.
    ToolResult {
        tool_name: String,
        tool_output: Value,
        is_error: bool,
    },
    /// Full assistant text, emitted only when a terminator closed the turn.
    FinalResponse { content: String },
    /// Non-recoverable error for this invocation.
    Error { message: String },
    /// Lifecycle marker (iteration start, billing stop, warnings, ...).
    Status {
        status: String,
        #[serde(skip_serializing_if = "Option::is_none")]
        message: Option<String>,
    },
}

impl AgentEvent {
    pub fn status(status: impl Into<String>) -> Self {
        AgentEvent::Status {
            status: status.into(),
            message: None,
        }
    }

    pub fn status_with_message(status: impl Into<String>, message: impl Into<String>) -> Self {
        AgentEvent::Status {
            status: status.into(),
            message: Some(message.into()),
        }
    }

    pub fn error(message: impl Into<String>) -> Self {
        AgentEvent::Error {
            message: message.into(),
        }
    }
}

/// Sending half of an invocation's event stream.
pub type EventSink = mpsc::Sender<AgentEvent>;

/// Create a bounded event channel for one invocation.
pub fn event_channel() -> (mpsc::Sender<AgentEvent>, mpsc::Receiver<AgentEvent>) {
    mpsc::channel(EVENT_CHANNEL_CAPACITY)
}

/// Send an event, logging (not failing) when the receiver is gone.
///
/// A dropped receiver means the client went away; the iteration still runs
/// to completion so that messages are persisted consistently.
pub async fn emit(sink: &EventSink, event: AgentEvent) {
    if sink.send(event).await.is_err() {
        tracing::debug!("event receiver dropped; continuing without a listener");
    }
}

// ─── Tests ────────────────────────────────────────────────────────────────────
