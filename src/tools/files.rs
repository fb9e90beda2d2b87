//! File operations over the sandbox filesystem primitives.

use async_trait::async_trait;
use serde_json::{Map, Value, json};

use crate::sandbox::SandboxHandle as _;

use super::clean_path;
use super::schema::{OperationSchema, ParamSource, XmlSchema};
use super::traits::{Tool, ToolContext, ToolResult};

/// Creates, reads, lists, and deletes files in the sandbox workspace.
pub struct FilesTool;

impl FilesTool {
    fn require_path(args: &Map<String, Value>) -> Result<String, String> {
        args.get("path")
            .and_then(Value::as_str)
            .filter(|p| !p.trim().is_empty())
            .map(clean_path)
            .ok_or_else(|| "missing required argument 'path'".to_string())
    }
}

#[async_trait]
impl Tool for FilesTool {
    fn name(&self) -> &str {
        "files"
    }

    fn description(&self) -> &str {
        "Create, read, list, and delete files in the sandbox workspace. \
         All paths are relative to /workspace."
    }

    fn operations(&self) -> Vec<OperationSchema> {
        vec![
            OperationSchema::new("create_file", "Write a file, creating parent directories")
                .with_parameters(json!({
                    "type": "object",
                    "properties": {
                        "path": { "type": "string", "description": "Target file path." },
                        "content": { "type": "string", "description": "Full file content." }
                    },
                    "required": ["path", "content"]
                }))
                .with_xml(
                    XmlSchema::new("create-file")
                        .with_param("path", ParamSource::Attribute)
                        .with_param("content", ParamSource::Text),
                ),
            OperationSchema::new("read_file", "Read a file as UTF-8 text")
                .with_parameters(json!({
                    "type": "object",
                    "properties": {
                        "path": { "type": "string", "description": "File to read." }
                    },
                    "required": ["path"]
                }))
                .with_xml(XmlSchema::new("read-file").with_param("path", ParamSource::Text)),
            OperationSchema::new("list_dir", "List a directory")
                .with_parameters(json!({
                    "type": "object",
                    "properties": {
                        "path": { "type": "string", "description": "Directory to list; defaults to the workspace root." }
                    }
                }))
                .with_xml(XmlSchema::new("list-dir").with_param("path", ParamSource::Text)),
            OperationSchema::new("delete_file", "Delete a file")
                .with_parameters(json!({
                    "type": "object",
                    "properties": {
                        "path": { "type": "string", "description": "File to delete." }
                    },
                    "required": ["path"]
                }))
                .with_xml(XmlSchema::new("delete-file").with_param("path", ParamSource::Text)),
            OperationSchema::new("create_folder", "Create a directory")
                .with_parameters(json!({
                    "type": "object",
                    "properties": {
                        "path": { "type": "string", "description": "Directory to create." },
                        "permissions": { "type": "string", "description": "Optional octal mode, e.g. 755." }
                    },
                    "required": ["path"]
                }))
                .with_xml(
                    XmlSchema::new("create-folder")
                        .with_param("path", ParamSource::Attribute)
                        .with_param("permissions", ParamSource::Attribute),
                ),
        ]
    }

    async fn invoke(
        &self,
        operation: &str,
        args: Map<String, Value>,
        ctx: ToolContext,
    ) -> Result<ToolResult, String> {
        let sandbox = ctx.sandbox_handle().await.map_err(|e| e.to_string())?;

        match operation {
            "create_file" => {
                let path = Self::require_path(&args)?;
                let content = args
                    .get("content")
                    .and_then(Value::as_str)
                    .ok_or("missing required argument 'content'")?;
                sandbox
                    .upload(&path, content.as_bytes())
                    .await
                    .map_err(|e| e.to_string())?;
                Ok(ToolResult::ok(format!(
                    "File created: {path} ({} bytes)",
                    content.len()
                )))
            }
            "read_file" => {
                let path = Self::require_path(&args)?;
                let bytes = sandbox.read_file(&path).await.map_err(|e| e.to_string())?;
                Ok(ToolResult::ok(String::from_utf8_lossy(&bytes).into_owned()))
            }
            "list_dir" => {
                let path = args
                    .get("path")
                    .and_then(Value::as_str)
                    .filter(|p| !p.trim().is_empty())
                    .map(clean_path)
                    .unwrap_or_else(|| clean_path(""));
                let entries = sandbox.list_dir(&path).await.map_err(|e| e.to_string())?;
                Ok(ToolResult::ok_json(json!({
                    "path": path,
                    "entries": entries,
                })))
            }
            "delete_file" => {
                let path = Self::require_path(&args)?;
                let output = sandbox
                    .exec(&format!("rm -f '{path}'"), None, None)
                    .await
                    .map_err(|e| e.to_string())?;
                if output.success() {
                    Ok(ToolResult::ok(format!("Deleted: {path}")))
                } else {
                    Ok(ToolResult::err(output.stderr))
                }
            }
            "create_folder" => {
                let path = Self::require_path(&args)?;
                let permissions = args
                    .get("permissions")
                    .and_then(Value::as_str)
                    .map(|p| u32::from_str_radix(p, 8).map_err(|e| format!("bad permissions: {e}")))
                    .transpose()?;
                sandbox
                    .mkdir(&path, permissions)
                    .await
                    .map_err(|e| e.to_string())?;
                Ok(ToolResult::ok(format!("Directory created: {path}")))
            }
            other => Err(format!("unknown files operation '{other}'")),
        }
    }
}

// ─── Tests ────────────────────────────────────────────────────────────────────
