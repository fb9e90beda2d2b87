//! Assembles the message list for one LLM call.
//!
//! Three layers go into a call: the system prompt (default or custom,
//! plus the tool and capability catalogs, appended exactly once), the
//! thread's llm-visible history, and an ephemeral turn message carrying
//! the newest browser state and image context.  The turn message is never
//! persisted; the image context record is deleted after use so each
//! sighting reaches the model exactly once.

use std::sync::Arc;

use async_trait::async_trait;
use serde_json::Value;

use crate::ai::{ContentBlock, Message};
use crate::capabilities::{CapabilityProvider, capability_catalog};
use crate::prompts::{TOOL_CATALOG_MARKER, default_system_prompt};
use crate::store::{MessageKind, StoreError, ThreadStore};
use crate::tools::{Tool as _, ToolRegistry};

use super::AgentProfile;

/// External context manager: condenses history that no longer fits the
/// model's budget.  Implementations typically summarize the oldest
/// messages; the runtime only defines the seam.
#[async_trait]
pub trait ContextCondenser: Send + Sync {
    async fn condense(&self, messages: Vec<Message>, context_limit: usize) -> Vec<Message>;
}

pub struct ContextBuilder {
    threads: Arc<dyn ThreadStore>,
    condenser: Option<Arc<dyn ContextCondenser>>,
    context_limit: usize,
}

impl ContextBuilder {
    pub fn new(threads: Arc<dyn ThreadStore>) -> Self {
        Self {
            threads,
            condenser: None,
            context_limit: usize::MAX,
        }
    }

    /// Attach a condenser applied to loaded history when it may exceed
    /// `context_limit` (a token budget interpreted by the condenser).
    pub fn with_condenser(mut self, condenser: Arc<dyn ContextCondenser>, context_limit: usize) -> Self {
        self.condenser = Some(condenser);
        self.context_limit = context_limit;
        self
    }

    // ── System prompt ────────────────────────────────────────────────────────

    /// Build the system prompt for a run.
    ///
    /// A custom profile prompt replaces the default entirely; the tool
    /// catalog and capability catalog are appended on top of either,
    /// guarded by marker checks so re-entry cannot duplicate them.
    pub fn system_prompt(
        &self,
        profile: Option<&AgentProfile>,
        registry: &ToolRegistry,
        capabilities: &[Arc<dyn CapabilityProvider>],
    ) -> String {
        let mut prompt = match profile.and_then(|p| p.system_prompt.as_deref()) {
            Some(custom) if !custom.trim().is_empty() => custom.trim().to_string(),
            _ => default_system_prompt().to_string(),
        };

        if !prompt.contains(TOOL_CATALOG_MARKER) {
            prompt.push_str(&tool_catalog(registry));
        }

        if let Some(catalog) = capability_catalog(capabilities)
            && !prompt.contains("--- External Capability Operations ---")
        {
            prompt.push_str(&catalog);
        }

        prompt
    }

    // ── History ──────────────────────────────────────────────────────────────

    /// Load the thread's llm-visible messages, in insertion order, mapped
    /// to completion-call messages.  When a condenser is attached it gets
    /// a chance to shrink older history to the context budget.
    pub async fn history(&self, thread_id: &str) -> Result<Vec<Message>, StoreError> {
        let messages = self.raw_history(thread_id).await?;
        Ok(match &self.condenser {
            Some(condenser) => condenser.condense(messages, self.context_limit).await,
            None => messages,
        })
    }

    async fn raw_history(&self, thread_id: &str) -> Result<Vec<Message>, StoreError> {
        let mut messages = Vec::new();
        for record in self.threads.visible_messages(thread_id).await? {
            match record.kind {
                MessageKind::User => messages.push(Message::user(text_of(&record.content))),
                MessageKind::Assistant => {
                    messages.push(Message::assistant(text_of(&record.content)));
                }
                MessageKind::Tool => {
                    // Tool results are folded in as user messages; the
                    // completion interface has no native tool role.
                    let name = record.content["tool_name"].as_str().unwrap_or("unknown");
                    let prefix = if record.content["success"].as_bool().unwrap_or(false) {
                        "✓"
                    } else {
                        "✗"
                    };
                    let output = match &record.content["output"] {
                        Value::String(s) => s.clone(),
                        other => other.to_string(),
                    };
                    messages.push(Message::user(format!("[Tool: {name}] {prefix}\n{output}")));
                }
                // Ephemeral kinds are injected via the turn message, not
                // the durable history.
                MessageKind::Status | MessageKind::BrowserState | MessageKind::ImageContext => {}
            }
        }
        Ok(messages)
    }

    // ── Turn message ─────────────────────────────────────────────────────────

    /// Assemble the ephemeral turn message for this iteration from the
    /// newest `browser_state` and `image_context` records.
    ///
    /// The image context is consumed: its record is deleted once it has
    /// been included.  Browser state persists across iterations.
    pub async fn turn_message(&self, thread_id: &str) -> Result<Option<Message>, StoreError> {
        let mut blocks: Vec<ContentBlock> = Vec::new();

        if let Some(record) = self
            .threads
            .latest_message(thread_id, &[MessageKind::BrowserState])
            .await?
        {
            let mut state = record.content.clone();
            let screenshot_url = state
                .get("screenshot_url")
                .and_then(Value::as_str)
                .map(str::to_string);
            let screenshot_base64 = state
                .get("screenshot_base64")
                .and_then(Value::as_str)
                .map(str::to_string);
            if let Some(obj) = state.as_object_mut() {
                obj.remove("screenshot_url");
                obj.remove("screenshot_base64");
            }

            let rendered =
                serde_json::to_string_pretty(&state).unwrap_or_else(|_| state.to_string());
            blocks.push(ContentBlock::Text {
                text: format!("The following is the current state of the browser:\n{rendered}"),
            });

            if let Some(url) = screenshot_url {
                blocks.push(ContentBlock::ImageUrl { url });
            } else if let Some(base64_data) = screenshot_base64 {
                blocks.push(ContentBlock::ImageUrl {
                    url: format!("data:image/jpeg;base64,{base64_data}"),
                });
            } else {
                tracing::debug!("browser state present but carries no screenshot");
            }
        }

        if let Some(record) = self
            .threads
            .latest_message(thread_id, &[MessageKind::ImageContext])
            .await?
        {
            let base64_data = record.content.get("base64").and_then(Value::as_str);
            let mime_type = record.content.get("mime_type").and_then(Value::as_str);
            let file_path = record
                .content
                .get("file_path")
                .and_then(Value::as_str)
                .unwrap_or("unknown file");

            if let (Some(base64_data), Some(mime_type)) = (base64_data, mime_type) {
                blocks.push(ContentBlock::Text {
                    text: format!("Here is the image you requested to see: '{file_path}'"),
                });
                blocks.push(ContentBlock::ImageUrl {
                    url: format!("data:{mime_type};base64,{base64_data}"),
                });
            } else {
                tracing::warn!(file_path, "image context record is missing data; dropping");
            }

            // One-shot: consumed regardless of whether it was usable.
            self.threads.delete_message(record.id).await?;
        }

        Ok(if blocks.is_empty() {
            None
        } else {
            Some(Message::user_blocks(blocks))
        })
    }
}

fn text_of(content: &Value) -> String {
    match content.get("content") {
        Some(Value::String(s)) => s.clone(),
        Some(other) => other.to_string(),
        None => match content {
            Value::String(s) => s.clone(),
            other => other.to_string(),
        },
    }
}

/// Render the catalog of registered tools for the system prompt.
///
/// Operations are grouped per tool, excluding tools that opted out
/// (the capability pass-through wrapper renders its own section).
fn tool_catalog(registry: &ToolRegistry) -> String {
    let mut text = format!("\n\n{TOOL_CATALOG_MARKER}\n");
    text.push_str(
        "You have access to the following tools; invoke them with the \
         standard function-call format.\n",
    );

    let mut current_tool: Option<String> = None;
    let mut listed_any = false;
    let mut entries: Vec<_> = registry
        .operations()
        .into_iter()
        .filter(|e| e.tool.advertise_in_prompt())
        .collect();
    entries.sort_by(|a, b| {
        (a.tool.name(), a.schema.name.as_str()).cmp(&(b.tool.name(), b.schema.name.as_str()))
    });

    for entry in entries {
        listed_any = true;
        if current_tool.as_deref() != Some(entry.tool.name()) {
            current_tool = Some(entry.tool.name().to_string());
            text.push_str(&format!(
                "\n**{}**: {}\n",
                entry.tool.name(),
                entry.tool.description()
            ));
        }

        text.push_str(&format!(
            "  - `{}`: {}\n",
            entry.schema.name, entry.schema.description
        ));
        if let Some(params) = &entry.schema.parameters {
            let required: Vec<&str> = params
                .get("required")
                .and_then(Value::as_array)
                .map(|a| a.iter().filter_map(Value::as_str).collect())
                .unwrap_or_default();
            if let Some(props) = params.get("properties").and_then(Value::as_object)
                && !props.is_empty()
            {
                let rendered: Vec<String> = props
                    .iter()
                    .map(|(name, schema)| {
                        let ty = schema.get("type").and_then(Value::as_str).unwrap_or("any");
                        let desc = schema
                            .get("description")
                            .and_then(Value::as_str)
                            .unwrap_or_default();
                        let mut s = format!("{name} ({ty})");
                        if !desc.is_empty() {
                            s.push_str(&format!(": {desc}"));
                        }
                        s
                    })
                    .collect();
                text.push_str(&format!("    Parameters: {}\n", rendered.join("; ")));
            }
            if !required.is_empty() {
                text.push_str(&format!("    Required: {}\n", required.join(", ")));
            }
        }
    }

    if !listed_any {
        text.push_str("\nNo tools are currently registered.\n");
    }
    text
}

// ─── Tests ────────────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ai::MessageContent;
    use crate::store::InMemoryStore;
    use crate::tools::default_toolset;
    use serde_json::json;

    fn full_registry() -> ToolRegistry {
        let mut registry = ToolRegistry::new();
        for tool in default_toolset() {
            registry.register(tool);
        }
        registry
    }

    async fn store_with_thread() -> (Arc<InMemoryStore>, String) {
        let store = Arc::new(InMemoryStore::new());
        let thread = store.create_thread("acct").await.unwrap();
        (store, thread)
    }

    #[test]
    fn default_prompt_gets_catalog_once() {
        let registry = full_registry();
        let builder = ContextBuilder::new(Arc::new(InMemoryStore::new()));
        let prompt = builder.system_prompt(None, &registry, &[]);

        assert_eq!(prompt.matches(TOOL_CATALOG_MARKER).count(), 1);
        assert!(prompt.contains("`shell`"));
        assert!(prompt.contains("`create_file`"));

        // Re-building from an already-cataloged prompt must not duplicate.
        let profile = AgentProfile {
            name: "re-entry".into(),
            system_prompt: Some(prompt.clone()),
            enabled_tools: None,
        };
        let again = builder.system_prompt(Some(&profile), &registry, &[]);
        assert_eq!(again.matches(TOOL_CATALOG_MARKER).count(), 1);
    }

    #[test]
    fn custom_prompt_replaces_default_entirely() {
        let registry = full_registry();
        let builder = ContextBuilder::new(Arc::new(InMemoryStore::new()));
        let profile = AgentProfile {
            name: "custom".into(),
            system_prompt: Some("You only answer in haiku.".into()),
            enabled_tools: None,
        };
        let prompt = builder.system_prompt(Some(&profile), &registry, &[]);
        assert!(prompt.starts_with("You only answer in haiku."));
        assert!(!prompt.contains("autonomous agent"));
        // The catalog still describes the registered tools.
        assert!(prompt.contains(TOOL_CATALOG_MARKER));
    }

    #[tokio::test]
    async fn history_maps_kinds_and_skips_hidden() {
        let (store, thread) = store_with_thread().await;
        store
            .add_message(&thread, MessageKind::User, json!({"content": "list files"}), true)
            .await
            .unwrap();
        store
            .add_message(
                &thread,
                MessageKind::Assistant,
                json!({"content": "Looking now."}),
                true,
            )
            .await
            .unwrap();
        store
            .add_message(
                &thread,
                MessageKind::Tool,
                json!({
                    "tool_name": "shell",
                    "kwargs": {"command": "ls"},
                    "success": true,
                    "output": "a.txt"
                }),
                true,
            )
            .await
            .unwrap();
        store
            .add_message(&thread, MessageKind::BrowserState, json!({"url": "x"}), false)
            .await
            .unwrap();

        let builder = ContextBuilder::new(store);
        let history = builder.history(&thread).await.unwrap();
        assert_eq!(history.len(), 3);
        assert_eq!(history[0].content.as_text(), "list files");
        let tool_text = history[2].content.as_text();
        assert!(tool_text.contains("[Tool: shell] ✓"));
        assert!(tool_text.contains("a.txt"));
    }

    #[tokio::test]
    async fn turn_message_strips_screenshot_and_prefers_url() {
        let (store, thread) = store_with_thread().await;
        store
            .add_message(
                &thread,
                MessageKind::BrowserState,
                json!({
                    "url": "https://example.com",
                    "title": "Example",
                    "screenshot_url": "https://cdn.example.com/shot.jpg",
                    "screenshot_base64": "ZGF0YQ=="
                }),
                false,
            )
            .await
            .unwrap();

        let builder = ContextBuilder::new(store);
        let message = builder.turn_message(&thread).await.unwrap().unwrap();
        let MessageContent::Blocks(blocks) = &message.content else {
            panic!("expected block content");
        };
        assert_eq!(blocks.len(), 2);
        match &blocks[0] {
            ContentBlock::Text { text } => {
                assert!(text.contains("state of the browser"));
                assert!(!text.contains("screenshot"));
            }
            other => panic!("unexpected block: {other:?}"),
        }
        match &blocks[1] {
            ContentBlock::ImageUrl { url } => {
                assert_eq!(url, "https://cdn.example.com/shot.jpg");
            }
            other => panic!("unexpected block: {other:?}"),
        }
    }

    #[tokio::test]
    async fn image_context_is_consumed_after_one_turn() {
        let (store, thread) = store_with_thread().await;
        store
            .add_message(
                &thread,
                MessageKind::ImageContext,
                json!({
                    "file_path": "/workspace/shot.png",
                    "mime_type": "image/png",
                    "base64": "aGk="
                }),
                false,
            )
            .await
            .unwrap();

        let builder = ContextBuilder::new(store.clone());
        let message = builder.turn_message(&thread).await.unwrap().unwrap();
        let MessageContent::Blocks(blocks) = &message.content else {
            panic!("expected block content");
        };
        assert_eq!(blocks.len(), 2);

        // Next iteration sees neither the record nor a turn message.
        assert!(
            store
                .latest_message(&thread, &[MessageKind::ImageContext])
                .await
                .unwrap()
                .is_none()
        );
        assert!(builder.turn_message(&thread).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn browser_state_survives_across_turns() {
        let (store, thread) = store_with_thread().await;
        store
            .add_message(
                &thread,
                MessageKind::BrowserState,
                json!({"url": "https://example.com", "screenshot_url": "u"}),
                false,
            )
            .await
            .unwrap();

        let builder = ContextBuilder::new(store.clone());
        assert!(builder.turn_message(&thread).await.unwrap().is_some());
        assert!(builder.turn_message(&thread).await.unwrap().is_some());
    }

    #[tokio::test]
    async fn empty_thread_has_no_turn_message() {
        let (store, thread) = store_with_thread().await;
        let builder = ContextBuilder::new(store);
        assert!(builder.turn_message(&thread).await.unwrap().is_none());
    }

    struct KeepLastTwo;

    #[async_trait]
    impl ContextCondenser for KeepLastTwo {
        async fn condense(&self, messages: Vec<Message>, _limit: usize) -> Vec<Message> {
            let skip = messages.len().saturating_sub(2);
            messages.into_iter().skip(skip).collect()
        }
    }

    #[tokio::test]
    async fn condenser_shrinks_loaded_history() {
        let (store, thread) = store_with_thread().await;
        for i in 0..5 {
            store
                .add_message(
                    &thread,
                    MessageKind::User,
                    json!({"content": format!("msg {i}")}),
                    true,
                )
                .await
                .unwrap();
        }

        let builder =
            ContextBuilder::new(store).with_condenser(Arc::new(KeepLastTwo), 100_000);
        let history = builder.history(&thread).await.unwrap();
        assert_eq!(history.len(), 2);
        assert_eq!(history[1].content.as_text(), "msg 4");
    }
}
