use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use thiserror::Error;

use crate::sandbox::SandboxDescriptor;

/// Errors surfaced by the persistence layer.
#[derive(Debug, Error)]
pub enum StoreError {
    #[error("thread not found: {0}")]
    ThreadNotFound(String),

    #[error("project not found: {0}")]
    ProjectNotFound(String),

    #[error("message not found: {0}")]
    MessageNotFound(u64),

    #[error("storage backend error: {0}")]
    Backend(String),
}

/// Discriminates the payload stored in a thread message.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MessageKind {
    User,
    Assistant,
    Tool,
    Status,
    BrowserState,
    ImageContext,
}

/// One record in a thread's append-only message sequence.
///
/// Messages are never mutated after insertion; corrections are new
/// messages.  Within a thread, ids strictly increase in insertion order.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Message {
    pub id: u64,
    pub thread_id: String,
    pub kind: MessageKind,
    pub content: Value,
    pub is_llm_visible: bool,
    pub created_at: DateTime<Utc>,
}

/// A project owns at most one sandbox and belongs to exactly one account.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Project {
    pub project_id: String,
    pub account_id: String,
    pub sandbox: Option<SandboxDescriptor>,
}

/// Append-only message storage scoped by thread.
#[async_trait]
pub trait ThreadStore: Send + Sync {
    /// Create a thread owned by `account_id`, returning its id.
    async fn create_thread(&self, account_id: &str) -> Result<String, StoreError>;

    /// Account that owns `thread_id` (billing checks key off this).
    async fn thread_account(&self, thread_id: &str) -> Result<String, StoreError>;

    /// Insert a message and return its assigned id.
    async fn add_message(
        &self,
        thread_id: &str,
        kind: MessageKind,
        content: Value,
        is_llm_visible: bool,
    ) -> Result<u64, StoreError>;

    /// Most recent message of any of the given kinds, or `None`.
    async fn latest_message(
        &self,
        thread_id: &str,
        kinds: &[MessageKind],
    ) -> Result<Option<Message>, StoreError>;

    /// All llm-visible messages of the thread in insertion order.
    async fn visible_messages(&self, thread_id: &str) -> Result<Vec<Message>, StoreError>;

    /// Delete one message by id (used for one-shot image context).
    async fn delete_message(&self, message_id: u64) -> Result<(), StoreError>;
}

/// Project records and their sandbox descriptors.
#[async_trait]
pub trait ProjectStore: Send + Sync {
    /// Create a project owned by `account_id`, returning its id.
    async fn create_project(&self, account_id: &str) -> Result<String, StoreError>;

    async fn get_project(&self, project_id: &str) -> Result<Project, StoreError>;

    /// Record or clear the project's sandbox descriptor.
    async fn set_sandbox(
        &self,
        project_id: &str,
        descriptor: Option<SandboxDescriptor>,
    ) -> Result<(), StoreError>;
}
