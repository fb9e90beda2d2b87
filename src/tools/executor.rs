//! Executes parsed tool calls against the registry.
//!
//! The executor resolves the handler (normalizing hyphenated names on
//! miss), enforces the per-tool timeout, and converts every failure mode
//! into a failed [`ToolResult`].  It never returns an error to the caller:
//! tool-level failures become results the model can observe and react to.

use std::sync::Arc;

use super::parser::ToolCall;
use super::registry::{ToolRegistry, canonical_name};
use super::traits::{Tool as _, ToolContext, ToolErrorKind, ToolResult};

pub struct ToolExecutor {
    registry: Arc<ToolRegistry>,
}

impl ToolExecutor {
    pub fn new(registry: Arc<ToolRegistry>) -> Self {
        Self { registry }
    }

    pub fn registry(&self) -> &ToolRegistry {
        &self.registry
    }

    /// Execute one call to completion.
    ///
    /// On timeout the invocation future is dropped, which best-effort
    /// cancels any in-flight sandbox exec awaited inside it; the sandbox
    /// process itself is not forcibly killed.
    #[tracing::instrument(name = "tool.execute", skip_all, fields(tool = %call.name))]
    pub async fn execute(&self, call: &ToolCall, ctx: &ToolContext) -> ToolResult {
        let Some(entry) = self.registry.resolve(&call.name) else {
            let normalized = canonical_name(&call.name);
            return ToolResult::err(format!(
                "Tool function '{}' (normalized to '{normalized}') not found in registry",
                call.name
            ));
        };

        let operation = entry.schema.name.clone();
        let tool = entry.tool.clone();
        let timeout = tool.timeout(&operation);
        let args = call.kwargs.clone();
        let task_ctx = ctx.clone();

        // Run in a spawned task so a panicking tool is contained instead
        // of unwinding through the response processor.
        let mut handle = tokio::spawn(async move {
            tool.invoke(&operation, args, task_ctx).await
        });

        match tokio::time::timeout(timeout, &mut handle).await {
            Err(_) => {
                // Aborting cancels any in-flight sandbox exec at its next
                // await point; the in-container process is not killed.
                handle.abort();
                tracing::warn!(tool = %call.name, ?timeout, "tool execution timed out");
                ToolResult::err(format!(
                    "tool execution timed out after {}s",
                    timeout.as_secs()
                ))
                .with_error_kind(ToolErrorKind::Timeout)
            }
            Ok(Err(join_err)) => {
                tracing::error!(tool = %call.name, error = %join_err, "tool task failed");
                ToolResult::err(format!("tool execution aborted: {join_err}"))
                    .with_error_kind(ToolErrorKind::Exception)
            }
            Ok(Ok(Err(message))) => {
                tracing::warn!(tool = %call.name, error = %message, "tool raised an error");
                ToolResult::err(message).with_error_kind(ToolErrorKind::Exception)
            }
            Ok(Ok(Ok(result))) => result,
        }
    }
}

// ─── Tests ────────────────────────────────────────────────────────────────────
