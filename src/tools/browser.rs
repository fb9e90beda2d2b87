//! Browser automation through the sandbox's control API.
//!
//! The sandbox image runs a browser automation service on
//! `localhost:8003`; this tool drives it with `curl` executed *inside* the
//! container, so no browser traffic leaves the sandbox.  Every successful
//! action persists a `browser_state` message carrying the page state; the
//! newest one is injected into the next turn by the context builder.
//! Returned screenshots are uploaded to object storage and replaced by
//! their URL before the state is persisted.

use std::time::Duration;

use async_trait::async_trait;
use serde_json::{Map, Value, json};

use crate::sandbox::SandboxHandle as _;
use crate::storage::ImageStore as _;
use crate::store::{MessageKind, ThreadStore as _};

use super::schema::{OperationSchema, ParamSource, XmlSchema};
use super::traits::{Tool, ToolContext, ToolResult};

const AUTOMATION_BASE: &str = "http://localhost:8003/api/automation";
/// Budget for one automation API request inside the sandbox.
const REQUEST_TIMEOUT: Duration = Duration::from_secs(30);

fn shell_quote(value: &str) -> String {
    format!("'{}'", value.replace('\'', r"'\''"))
}

/// One automation endpoint an operation maps onto.
struct Action {
    endpoint: &'static str,
    method: &'static str,
    params: Value,
}

/// Drives the in-sandbox browser automation API.
pub struct BrowserTool;

impl BrowserTool {
    fn action_for(operation: &str, args: &Map<String, Value>) -> Result<Action, String> {
        let str_arg = |key: &str| -> Option<String> {
            args.get(key).and_then(|v| match v {
                Value::String(s) => Some(s.clone()),
                Value::Number(n) => Some(n.to_string()),
                _ => None,
            })
        };
        let required = |key: &str| -> Result<String, String> {
            str_arg(key).ok_or_else(|| format!("missing required argument '{key}'"))
        };

        match operation {
            "browser_navigate_to" => Ok(Action {
                endpoint: "navigate_to",
                method: "POST",
                params: json!({ "url": required("url")? }),
            }),
            "browser_click_element" => Ok(Action {
                endpoint: "click_element",
                method: "POST",
                params: json!({ "index": required("index")?.parse::<u64>().map_err(|_| "argument 'index' must be a number".to_string())? }),
            }),
            "browser_input_text" => Ok(Action {
                endpoint: "input_text",
                method: "POST",
                params: json!({
                    "index": required("index")?.parse::<u64>().map_err(|_| "argument 'index' must be a number".to_string())?,
                    "text": required("text")?,
                }),
            }),
            "browser_scroll_down" | "browser_scroll_up" => {
                let endpoint = if operation == "browser_scroll_down" {
                    "scroll_down"
                } else {
                    "scroll_up"
                };
                let params = match str_arg("amount") {
                    Some(amount) => json!({ "amount": amount }),
                    None => json!({}),
                };
                Ok(Action {
                    endpoint,
                    method: "POST",
                    params,
                })
            }
            "browser_go_back" => Ok(Action {
                endpoint: "go_back",
                method: "POST",
                params: json!({}),
            }),
            other => Err(format!("unknown browser operation '{other}'")),
        }
    }

    fn curl_command(action: &Action) -> String {
        let url = format!("{AUTOMATION_BASE}/{}", action.endpoint);
        let mut cmd = format!(
            "curl -s -X {} {} -H 'Content-Type: application/json'",
            action.method,
            shell_quote(&url)
        );
        if action.method == "POST" {
            cmd.push_str(" -d ");
            cmd.push_str(&shell_quote(&action.params.to_string()));
        }
        cmd
    }
}

#[async_trait]
impl Tool for BrowserTool {
    fn name(&self) -> &str {
        "browser"
    }

    fn description(&self) -> &str {
        "Control the sandboxed web browser: navigate, click elements by \
         index, type into fields, and scroll. Each action reports the \
         resulting page state."
    }

    fn operations(&self) -> Vec<OperationSchema> {
        let index_param = json!({
            "type": "object",
            "properties": {
                "index": { "type": "integer", "description": "Element index from the page state." }
            },
            "required": ["index"]
        });

        vec![
            OperationSchema::new("browser_navigate_to", "Navigate to a URL")
                .with_parameters(json!({
                    "type": "object",
                    "properties": {
                        "url": { "type": "string", "description": "The URL to open." }
                    },
                    "required": ["url"]
                }))
                .with_xml(
                    XmlSchema::new("browser-navigate-to").with_param("url", ParamSource::Text),
                ),
            OperationSchema::new("browser_click_element", "Click an interactive element")
                .with_parameters(index_param.clone())
                .with_xml(
                    XmlSchema::new("browser-click-element")
                        .with_param("index", ParamSource::Text),
                ),
            OperationSchema::new("browser_input_text", "Type text into an input element")
                .with_parameters(json!({
                    "type": "object",
                    "properties": {
                        "index": { "type": "integer", "description": "Element index from the page state." },
                        "text": { "type": "string", "description": "Text to type." }
                    },
                    "required": ["index", "text"]
                }))
                .with_xml(
                    XmlSchema::new("browser-input-text")
                        .with_param("index", ParamSource::Attribute)
                        .with_param("text", ParamSource::Text),
                ),
            OperationSchema::new("browser_scroll_down", "Scroll the page down")
                .with_parameters(json!({
                    "type": "object",
                    "properties": {
                        "amount": { "type": "integer", "description": "Pixels to scroll; omit for one viewport." }
                    }
                }))
                .with_xml(
                    XmlSchema::new("browser-scroll-down")
                        .with_param("amount", ParamSource::Attribute),
                ),
            OperationSchema::new("browser_scroll_up", "Scroll the page up")
                .with_parameters(json!({
                    "type": "object",
                    "properties": {
                        "amount": { "type": "integer", "description": "Pixels to scroll; omit for one viewport." }
                    }
                }))
                .with_xml(
                    XmlSchema::new("browser-scroll-up")
                        .with_param("amount", ParamSource::Attribute),
                ),
            OperationSchema::new("browser_go_back", "Go back in browser history")
                .with_parameters(json!({ "type": "object", "properties": {} }))
                .with_xml(XmlSchema::new("browser-go-back")),
        ]
    }

    async fn invoke(
        &self,
        operation: &str,
        args: Map<String, Value>,
        ctx: ToolContext,
    ) -> Result<ToolResult, String> {
        let action = Self::action_for(operation, &args)?;
        let sandbox = ctx.sandbox_handle().await.map_err(|e| e.to_string())?;

        let command = Self::curl_command(&action);
        tracing::debug!(endpoint = action.endpoint, "executing browser action");

        let output = sandbox
            .exec(&command, None, Some(REQUEST_TIMEOUT))
            .await
            .map_err(|e| e.to_string())?;

        if !output.success() {
            return Ok(ToolResult::err(format!(
                "Browser automation request failed with exit code {}.\nStdout: {}\nStderr: {}",
                output.exit_code,
                output.stdout.chars().take(500).collect::<String>(),
                output.stderr.chars().take(500).collect::<String>(),
            )));
        }

        let body = output.stdout.trim();
        if body.is_empty() {
            return Ok(ToolResult::err("Empty response from browser service."));
        }
        if !(body.starts_with('{') && body.ends_with('}')) {
            return Ok(ToolResult::err(format!(
                "Response from browser service was not valid JSON: {}",
                body.chars().take(200).collect::<String>()
            )));
        }

        let mut state: Value = match serde_json::from_str(body) {
            Ok(v) => v,
            Err(e) => {
                return Ok(ToolResult::err(format!(
                    "Failed to parse response JSON: {e}. Raw output: {}",
                    body.chars().take(200).collect::<String>()
                )));
            }
        };

        let message = state
            .get("message")
            .and_then(Value::as_str)
            .unwrap_or("Browser action completed successfully")
            .to_string();

        if action.endpoint == "input_text"
            && message.contains("Element is not an <input>, <textarea>, <select> or [contenteditable]")
        {
            return Ok(ToolResult::err(
                "Action failed: The element targeted for text input is not an input \
                 field. Ensure the element is an <input>, <textarea>, <select>, or has a \
                 [contenteditable] attribute; the current page state lists which elements \
                 accept text.",
            ));
        }

        // Replace inline screenshot data with an uploaded URL before the
        // state is persisted.
        let screenshot_base64 = state
            .get("screenshot_base64")
            .and_then(Value::as_str)
            .map(str::to_string);
        if let Some(base64_data) = screenshot_base64 {
            match ctx.images.upload_base64(&base64_data, "image/jpeg").await {
                Ok(url) => {
                    let obj = state.as_object_mut().ok_or("state is not an object")?;
                    obj.remove("screenshot_base64");
                    obj.insert("screenshot_url".into(), Value::String(url));
                }
                Err(e) => {
                    tracing::warn!(error = %e, "screenshot upload failed; keeping inline data");
                    if let Some(obj) = state.as_object_mut() {
                        obj.insert("image_upload_error".into(), Value::String(e));
                    }
                }
            }
        }

        let message_id = ctx
            .threads
            .add_message(&ctx.thread_id, MessageKind::BrowserState, state.clone(), false)
            .await
            .map_err(|e| e.to_string())?;

        let mut payload = json!({
            "success": true,
            "message": message,
            "message_id": message_id,
        });
        let out = payload.as_object_mut().ok_or("payload is not an object")?;
        for key in ["url", "title", "ocr_text", "screenshot_url"] {
            if let Some(value) = state.get(key).filter(|v| !v.is_null()) {
                out.insert(key.to_string(), value.clone());
            }
        }
        if let Some(count) = state.get("element_count").and_then(Value::as_u64) {
            out.insert("elements_found".into(), json!(count));
        }
        if let Some(pixels) = state.get("pixels_below").and_then(Value::as_i64) {
            out.insert("scrollable_content".into(), json!(pixels > 0));
        }

        Ok(ToolResult::ok_json(payload))
    }
}

// ─── Tests ────────────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::ThreadStore as _;
    use crate::tools::testutil::{ScriptedSandbox, args, ctx_with};

    #[test]
    fn curl_command_posts_json_payload() {
        let action = Action {
            endpoint: "navigate_to",
            method: "POST",
            params: json!({"url": "https://example.com"}),
        };
        let cmd = BrowserTool::curl_command(&action);
        assert!(cmd.starts_with("curl -s -X POST"));
        assert!(cmd.contains("http://localhost:8003/api/automation/navigate_to"));
        assert!(cmd.contains(r#"{"url":"https://example.com"}"#));
    }

    #[test]
    fn unknown_operation_is_rejected() {
        assert!(BrowserTool::action_for("browser_fly", &Map::new()).is_err());
    }

    #[tokio::test]
    async fn navigate_persists_browser_state() {
        let sandbox = ScriptedSandbox::ok(
            r#"{"message": "Navigated", "url": "https://example.com", "title": "Example", "element_count": 12, "pixels_below": 600}"#,
        );
        let (ctx, store) = ctx_with(sandbox).await;
        let thread_id = ctx.thread_id.clone();

        let result = BrowserTool
            .invoke(
                "browser_navigate_to",
                args(&[("url", "https://example.com")]),
                ctx,
            )
            .await
            .unwrap();

        assert!(result.success);
        let payload = result.output;
        assert_eq!(payload["url"], "https://example.com");
        assert_eq!(payload["elements_found"], 12);
        assert_eq!(payload["scrollable_content"], true);

        let state = store
            .latest_message(&thread_id, &[MessageKind::BrowserState])
            .await
            .unwrap()
            .unwrap();
        assert!(!state.is_llm_visible);
        assert_eq!(state.content["title"], "Example");
    }

    #[tokio::test]
    async fn screenshot_is_replaced_by_uploaded_url() {
        let sandbox = ScriptedSandbox::ok(
            r#"{"message": "ok", "screenshot_base64": "aGVsbG8="}"#,
        );
        let (ctx, store) = ctx_with(sandbox).await;
        let thread_id = ctx.thread_id.clone();

        BrowserTool
            .invoke("browser_go_back", Map::new(), ctx)
            .await
            .unwrap();

        let state = store
            .latest_message(&thread_id, &[MessageKind::BrowserState])
            .await
            .unwrap()
            .unwrap();
        assert!(state.content.get("screenshot_base64").is_none());
        assert_eq!(
            state.content["screenshot_url"],
            "data:image/jpeg;base64,aGVsbG8="
        );
    }

    #[tokio::test]
    async fn input_text_rejection_gets_guidance() {
        let sandbox = ScriptedSandbox::ok(
            r#"{"message": "Element is not an <input>, <textarea>, <select> or [contenteditable]"}"#,
        );
        let (ctx, _) = ctx_with(sandbox).await;
        let result = BrowserTool
            .invoke(
                "browser_input_text",
                args(&[("index", "3"), ("text", "hello")]),
                ctx,
            )
            .await
            .unwrap();
        assert!(!result.success);
        assert!(result.output_text().contains("not an input"));
    }

    #[tokio::test]
    async fn non_json_response_fails_cleanly() {
        let sandbox = ScriptedSandbox::ok("<html>gateway error</html>");
        let (ctx, _) = ctx_with(sandbox).await;
        let result = BrowserTool
            .invoke("browser_go_back", Map::new(), ctx)
            .await
            .unwrap();
        assert!(!result.success);
        assert!(result.output_text().contains("not valid JSON"));
    }

    #[tokio::test]
    async fn curl_failure_reports_exit_code() {
        let sandbox = ScriptedSandbox::failing("connection refused", 7);
        let (ctx, _) = ctx_with(sandbox).await;
        let result = BrowserTool
            .invoke("browser_go_back", Map::new(), ctx)
            .await
            .unwrap();
        assert!(!result.success);
        assert!(result.output_text().contains("exit code 7"));
    }
}
