use async_trait::async_trait;
use futures::Stream;
use std::pin::Pin;
use thiserror::Error;

use super::types::{CompletionRequest, CompletionResponse, StreamChunk};

/// Errors surfaced by an LLM transport.
#[derive(Debug, Error)]
pub enum LlmError {
    #[error("provider request failed: {0}")]
    Request(String),

    #[error("response stream failed: {0}")]
    Stream(String),
}

/// Type alias for a streaming completion response.
pub type LlmStream = Pin<Box<dyn Stream<Item = Result<StreamChunk, LlmError>> + Send>>;

/// Trait for LLM providers.
///
/// Implementations own transport, retries, and credential handling; the
/// agent core only sees chunks.
#[async_trait]
pub trait LlmProvider: Send + Sync {
    /// Complete a prompt and return the full response.
    async fn complete(&self, request: CompletionRequest) -> Result<CompletionResponse, LlmError>;

    /// Stream a completion response.
    async fn stream(&self, request: CompletionRequest) -> Result<LlmStream, LlmError>;

    /// Get the context window limit for this provider.
    fn context_limit(&self) -> usize;

    /// Get the provider name.
    fn provider_name(&self) -> &str;
}
