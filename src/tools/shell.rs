//! Shell execution inside the project sandbox.

use std::time::Duration;

use async_trait::async_trait;
use serde_json::{Map, Value, json};

use crate::sandbox::{SandboxHandle as _, WORKSPACE_DIR};

use super::schema::{OperationSchema, ParamSource, XmlSchema};
use super::traits::{Tool, ToolContext, ToolResult};

/// Upper bound a model may request for one command.
const MAX_COMMAND_TIMEOUT: Duration = Duration::from_secs(300);
const DEFAULT_COMMAND_TIMEOUT: Duration = Duration::from_secs(60);

/// Executes shell commands in the sandbox workspace.
pub struct ShellTool;

#[async_trait]
impl Tool for ShellTool {
    fn name(&self) -> &str {
        "shell"
    }

    fn description(&self) -> &str {
        "Execute shell commands inside the project sandbox. Commands run in \
         /workspace by default and return stdout, stderr, and the exit code."
    }

    fn operations(&self) -> Vec<OperationSchema> {
        vec![
            OperationSchema::new("shell", "Run a shell command in the sandbox workspace")
                .with_parameters(json!({
                    "type": "object",
                    "properties": {
                        "command": {
                            "type": "string",
                            "description": "The shell command to execute."
                        },
                        "folder": {
                            "type": "string",
                            "description": "Optional workspace subdirectory to run in."
                        },
                        "timeout": {
                            "type": "string",
                            "description": "Optional timeout in seconds (max 300)."
                        }
                    },
                    "required": ["command"]
                }))
                .with_xml(
                    XmlSchema::new("shell")
                        .with_param("command", ParamSource::Element)
                        .with_param("folder", ParamSource::Attribute)
                        .with_param("timeout", ParamSource::Attribute),
                ),
        ]
    }

    async fn invoke(
        &self,
        _operation: &str,
        args: Map<String, Value>,
        ctx: ToolContext,
    ) -> Result<ToolResult, String> {
        let command = args
            .get("command")
            .and_then(Value::as_str)
            .filter(|c| !c.trim().is_empty())
            .ok_or("missing required argument 'command'")?
            .to_string();

        let workdir = match args.get("folder").and_then(Value::as_str) {
            Some(folder) if !folder.trim().is_empty() => super::clean_path(folder),
            _ => WORKSPACE_DIR.to_string(),
        };

        let timeout = args
            .get("timeout")
            .and_then(|v| match v {
                Value::String(s) => s.parse::<u64>().ok(),
                Value::Number(n) => n.as_u64(),
                _ => None,
            })
            .map(Duration::from_secs)
            .unwrap_or(DEFAULT_COMMAND_TIMEOUT)
            .min(MAX_COMMAND_TIMEOUT);

        let sandbox = ctx.sandbox_handle().await.map_err(|e| e.to_string())?;
        let output = sandbox
            .exec(&command, Some(&workdir), Some(timeout))
            .await
            .map_err(|e| e.to_string())?;

        let mut text = output.stdout.clone();
        if !output.stderr.is_empty() {
            if !text.is_empty() {
                text.push('\n');
            }
            text.push_str("STDERR: ");
            text.push_str(&output.stderr);
        }

        let meta = json!({ "exit_code": output.exit_code, "cwd": workdir });
        let result = if output.success() {
            ToolResult::ok(text)
        } else {
            ToolResult::err(text)
        };
        Ok(result.with_metadata(meta))
    }
}

// ─── Tests ────────────────────────────────────────────────────────────────────
