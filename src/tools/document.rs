//! Document generation inside the sandbox.
//!
//! Writes markdown source into the workspace and converts it with the
//! sandbox image's `pandoc`.  Conversion is the slowest built-in
//! operation, so it carries a doubled timeout.

use std::time::Duration;

use async_trait::async_trait;
use serde_json::{Map, Value, json};

use crate::sandbox::SandboxHandle as _;

use super::clean_path;
use super::schema::{OperationSchema, ParamSource, XmlSchema};
use super::traits::{Tool, ToolContext, ToolResult};

/// Document conversion gets twice the standard tool budget.
const CONVERSION_TIMEOUT: Duration = Duration::from_secs(120);

const SUPPORTED_FORMATS: [&str; 3] = ["pdf", "docx", "html"];

/// Generates pdf/docx/html documents from markdown content.
pub struct DocumentTool;

#[async_trait]
impl Tool for DocumentTool {
    fn name(&self) -> &str {
        "document"
    }

    fn description(&self) -> &str {
        "Generate a document in the workspace: provide markdown content \
         and a target format (pdf, docx, or html)."
    }

    fn operations(&self) -> Vec<OperationSchema> {
        vec![
            OperationSchema::new("generate_document", "Render markdown content to a document")
                .with_parameters(json!({
                    "type": "object",
                    "properties": {
                        "path": {
                            "type": "string",
                            "description": "Output path without extension, e.g. reports/summary."
                        },
                        "format": {
                            "type": "string",
                            "enum": SUPPORTED_FORMATS,
                            "description": "Target document format."
                        },
                        "content": {
                            "type": "string",
                            "description": "Markdown source of the document."
                        }
                    },
                    "required": ["path", "format", "content"]
                }))
                .with_xml(
                    XmlSchema::new("generate-document")
                        .with_param("path", ParamSource::Attribute)
                        .with_param("format", ParamSource::Attribute)
                        .with_param("content", ParamSource::Text),
                ),
        ]
    }

    fn timeout(&self, _operation: &str) -> Duration {
        CONVERSION_TIMEOUT
    }

    async fn invoke(
        &self,
        _operation: &str,
        args: Map<String, Value>,
        ctx: ToolContext,
    ) -> Result<ToolResult, String> {
        let path = args
            .get("path")
            .and_then(Value::as_str)
            .filter(|p| !p.trim().is_empty())
            .ok_or("missing required argument 'path'")?;
        let format = args
            .get("format")
            .and_then(Value::as_str)
            .ok_or("missing required argument 'format'")?
            .to_ascii_lowercase();
        let content = args
            .get("content")
            .and_then(Value::as_str)
            .ok_or("missing required argument 'content'")?;

        if !SUPPORTED_FORMATS.contains(&format.as_str()) {
            return Ok(ToolResult::err(format!(
                "Unsupported document format '{format}'. Supported: pdf, docx, html."
            )));
        }

        let base = clean_path(path.trim_end_matches(".md"));
        let source = format!("{base}.md");
        let target = format!("{base}.{format}");

        let sandbox = ctx.sandbox_handle().await.map_err(|e| e.to_string())?;
        sandbox
            .upload(&source, content.as_bytes())
            .await
            .map_err(|e| e.to_string())?;

        let command = format!("pandoc '{source}' -o '{target}'");
        let output = sandbox
            .exec(&command, None, Some(CONVERSION_TIMEOUT))
            .await
            .map_err(|e| e.to_string())?;

        if !output.success() {
            return Ok(ToolResult::err(format!(
                "Document conversion failed (exit {}): {}",
                output.exit_code,
                output.stderr.trim()
            )));
        }

        Ok(ToolResult::ok_json(json!({
            "message": format!("Document generated: {target}"),
            "source": source,
            "path": target,
            "format": format,
        })))
    }
}

// ─── Tests ────────────────────────────────────────────────────────────────────
