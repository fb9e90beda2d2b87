use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use crate::sandbox::{SandboxError, SandboxHandle, SandboxProvider};
use crate::storage::ImageStore;
use crate::store::ThreadStore;

use super::schema::OperationSchema;

/// Default wall-clock budget for one tool invocation.
pub const DEFAULT_TOOL_TIMEOUT: Duration = Duration::from_secs(60);

/// Why a tool invocation failed, when the failure came from the runtime
/// rather than the tool's own logic.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ToolErrorKind {
    Timeout,
    Exception,
}

/// The result of executing a tool operation.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ToolResult {
    /// Whether the tool considered the execution successful.
    pub success: bool,
    /// Output payload (plain text or structured).
    pub output: Value,
    /// Optional structured metadata for machine consumption.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub metadata: Option<Value>,
    /// Runtime-level failure class, absent for ordinary tool failures.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error_kind: Option<ToolErrorKind>,
}

impl ToolResult {
    pub fn ok(output: impl Into<String>) -> Self {
        Self {
            success: true,
            output: Value::String(output.into()),
            metadata: None,
            error_kind: None,
        }
    }

    pub fn ok_json(output: Value) -> Self {
        Self {
            success: true,
            output,
            metadata: None,
            error_kind: None,
        }
    }

    pub fn err(output: impl Into<String>) -> Self {
        Self {
            success: false,
            output: Value::String(output.into()),
            metadata: None,
            error_kind: None,
        }
    }

    pub fn with_metadata(mut self, metadata: Value) -> Self {
        self.metadata = Some(metadata);
        self
    }

    pub fn with_error_kind(mut self, kind: ToolErrorKind) -> Self {
        self.error_kind = Some(kind);
        self
    }

    /// Output flattened to text, for history injection.
    pub fn output_text(&self) -> String {
        match &self.output {
            Value::String(s) => s.clone(),
            other => other.to_string(),
        }
    }
}

/// Persisted record of one executed tool call: the call echo plus its
/// result, stored as the content of a `tool` message.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ToolRecord {
    pub tool_name: String,
    pub kwargs: Map<String, Value>,
    pub success: bool,
    pub output: Value,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error_kind: Option<ToolErrorKind>,
}

impl ToolRecord {
    pub fn new(tool_name: &str, kwargs: &Map<String, Value>, result: &ToolResult) -> Self {
        Self {
            tool_name: tool_name.to_string(),
            kwargs: kwargs.clone(),
            success: result.success,
            output: result.output.clone(),
            error_kind: result.error_kind,
        }
    }
}

/// Per-call dependencies handed to a tool by the executor.
///
/// Tools receive everything they need here and never hold a back-reference
/// to the thread manager.
#[derive(Clone)]
pub struct ToolContext {
    pub thread_id: String,
    pub project_id: String,
    pub sandbox: Arc<dyn SandboxProvider>,
    pub threads: Arc<dyn ThreadStore>,
    pub images: Arc<dyn ImageStore>,
}

impl ToolContext {
    /// Resolve the project's sandbox, starting it if needed.
    pub async fn sandbox_handle(&self) -> Result<Arc<dyn SandboxHandle>, SandboxError> {
        self.sandbox.ensure(&self.project_id).await
    }
}

/// A capability the agent can invoke.
///
/// A tool may expose several operations (the files tool exposes
/// `create_file`, `read_file`, ...); the registry indexes each operation
/// by its canonical name and dispatches back through [`Tool::invoke`].
#[async_trait]
pub trait Tool: Send + Sync {
    /// Stable machine identifier for the tool as a whole (snake_case).
    fn name(&self) -> &str;

    /// Human-readable description used in the system-prompt catalog.
    fn description(&self) -> &str;

    /// Operations this tool advertises.
    fn operations(&self) -> Vec<OperationSchema>;

    /// Execute one operation with string-typed kwargs; each tool parses
    /// and validates its own parameters from the map.
    async fn invoke(
        &self,
        operation: &str,
        args: Map<String, Value>,
        ctx: ToolContext,
    ) -> Result<ToolResult, String>;

    /// Wall-clock budget for one invocation of `operation`.
    fn timeout(&self, _operation: &str) -> Duration {
        DEFAULT_TOOL_TIMEOUT
    }

    /// Whether the tool appears in the standard system-prompt catalog.
    /// The capability pass-through wrapper opts out; its catalog is
    /// rendered separately.
    fn advertise_in_prompt(&self) -> bool {
        true
    }
}
