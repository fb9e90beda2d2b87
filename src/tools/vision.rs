//! Lets the model look at an image file from the sandbox workspace.
//!
//! `see_image` reads the file, base64-encodes it, and persists an
//! `image_context` message.  The context builder attaches the newest
//! image context to the next turn and then deletes the record, so each
//! sighting is one-shot.

use async_trait::async_trait;
use base64::Engine as _;
use base64::engine::general_purpose::STANDARD as BASE64;
use serde_json::{Map, Value, json};

use crate::sandbox::SandboxHandle as _;
use crate::store::{MessageKind, ThreadStore as _};

use super::clean_path;
use super::schema::{OperationSchema, ParamSource, XmlSchema};
use super::traits::{Tool, ToolContext, ToolResult};

/// Maximum image size we are willing to inline into context.
const MAX_IMAGE_BYTES: usize = 10 * 1024 * 1024;

fn mime_for(path: &str) -> Option<&'static str> {
    let ext = path.rsplit('.').next()?.to_ascii_lowercase();
    match ext.as_str() {
        "png" => Some("image/png"),
        "jpg" | "jpeg" => Some("image/jpeg"),
        "gif" => Some("image/gif"),
        "webp" => Some("image/webp"),
        _ => None,
    }
}

/// Reads workspace images into the model's visual context.
pub struct VisionTool;

#[async_trait]
impl Tool for VisionTool {
    fn name(&self) -> &str {
        "vision"
    }

    fn description(&self) -> &str {
        "Look at an image file from the workspace. The image is attached \
         to your next turn so you can describe or act on its contents."
    }

    fn operations(&self) -> Vec<OperationSchema> {
        vec![
            OperationSchema::new("see_image", "Attach a workspace image to the next turn")
                .with_parameters(json!({
                    "type": "object",
                    "properties": {
                        "file_path": {
                            "type": "string",
                            "description": "Image path relative to /workspace (png, jpg, gif, webp; max 10 MB)."
                        }
                    },
                    "required": ["file_path"]
                }))
                .with_xml(XmlSchema::new("see-image").with_param("file_path", ParamSource::Text)),
        ]
    }

    async fn invoke(
        &self,
        _operation: &str,
        args: Map<String, Value>,
        ctx: ToolContext,
    ) -> Result<ToolResult, String> {
        let raw_path = args
            .get("file_path")
            .and_then(Value::as_str)
            .filter(|p| !p.trim().is_empty())
            .ok_or("missing required argument 'file_path'")?;
        let path = clean_path(raw_path);

        let Some(mime_type) = mime_for(&path) else {
            return Ok(ToolResult::err(format!(
                "Unsupported image format: {path}. Supported formats: png, jpg, jpeg, gif, webp."
            )));
        };

        let sandbox = ctx.sandbox_handle().await.map_err(|e| e.to_string())?;
        if !sandbox.exists(&path).await.map_err(|e| e.to_string())? {
            return Ok(ToolResult::err(format!("Image not found: {path}")));
        }

        let bytes = sandbox.read_file(&path).await.map_err(|e| e.to_string())?;
        if bytes.len() > MAX_IMAGE_BYTES {
            return Ok(ToolResult::err(format!(
                "Image too large: {} bytes (max {MAX_IMAGE_BYTES}).",
                bytes.len()
            )));
        }

        let content = json!({
            "file_path": path,
            "mime_type": mime_type,
            "base64": BASE64.encode(&bytes),
        });
        ctx.threads
            .add_message(&ctx.thread_id, MessageKind::ImageContext, content, false)
            .await
            .map_err(|e| e.to_string())?;

        Ok(ToolResult::ok(format!(
            "Successfully loaded the image '{path}'; it will be visible in your next turn."
        )))
    }
}

// ─── Tests ────────────────────────────────────────────────────────────────────
