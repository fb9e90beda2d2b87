//! End-of-turn signals: `ask`, `complete`, and `web-browser-takeover`.
//!
//! These are pure signals, not work: the response processor stops the
//! agent as soon as one of their tags closes and schedules no execution
//! for them.  The tool exists so the operations are registered — their
//! tags are recognized by the stream scanner and they appear in the
//! system-prompt catalog with usage guidance.

use async_trait::async_trait;
use serde_json::{Map, Value, json};

use super::schema::{OperationSchema, ParamSource, XmlSchema};
use super::traits::{Tool, ToolContext, ToolResult};

/// Canonical operation names that end the agent invocation.
pub const TERMINATOR_OPERATIONS: [&str; 3] = ["ask", "complete", "web_browser_takeover"];
/// XML tag names of the terminators.
pub const TERMINATOR_TAGS: [&str; 3] = ["ask", "complete", "web-browser-takeover"];

/// Returns true when `name` (canonical form) is a terminator signal.
pub fn is_terminator(name: &str) -> bool {
    TERMINATOR_OPERATIONS.contains(&super::canonical_name(name).as_str())
}

/// Conversation control signals.
pub struct MessageTool;

#[async_trait]
impl Tool for MessageTool {
    fn name(&self) -> &str {
        "message"
    }

    fn description(&self) -> &str {
        "End your turn: use 'ask' when you need input from the user, \
         'complete' when the task is finished, and 'web-browser-takeover' \
         when the user must take over the browser (logins, captchas)."
    }

    fn operations(&self) -> Vec<OperationSchema> {
        vec![
            OperationSchema::new("ask", "Ask the user a question and wait for their reply")
                .with_parameters(json!({
                    "type": "object",
                    "properties": {
                        "text": { "type": "string", "description": "The question for the user." },
                        "attachments": { "type": "string", "description": "Optional comma-separated workspace files to show." }
                    },
                    "required": ["text"]
                }))
                .with_xml(
                    XmlSchema::new("ask")
                        .with_param("text", ParamSource::Text)
                        .with_param("attachments", ParamSource::Attribute),
                ),
            OperationSchema::new("complete", "Declare the task finished")
                .with_parameters(json!({
                    "type": "object",
                    "properties": {
                        "text": { "type": "string", "description": "Optional closing summary." }
                    }
                }))
                .with_xml(XmlSchema::new("complete").with_param("text", ParamSource::Text)),
            OperationSchema::new(
                "web_browser_takeover",
                "Hand browser control to the user",
            )
            .with_parameters(json!({
                "type": "object",
                "properties": {
                    "text": { "type": "string", "description": "What the user should do in the browser." }
                },
                "required": ["text"]
            }))
            .with_xml(
                XmlSchema::new("web-browser-takeover").with_param("text", ParamSource::Text),
            ),
        ]
    }

    async fn invoke(
        &self,
        operation: &str,
        args: Map<String, Value>,
        _ctx: ToolContext,
    ) -> Result<ToolResult, String> {
        // Normally unreachable — the processor intercepts terminators
        // before execution.  Direct invocation still behaves sensibly.
        let text = args
            .get("text")
            .and_then(Value::as_str)
            .unwrap_or_default()
            .to_string();
        Ok(ToolResult::ok(text).with_metadata(json!({
            "agent_should_terminate": true,
            "signal": operation,
        })))
    }
}

// ─── Tests ────────────────────────────────────────────────────────────────────
