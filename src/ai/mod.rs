//! Unified LLM completion interface consumed by the agent core.
//!
//! The runtime never talks to a model API directly; it goes through the
//! [`LlmProvider`] trait so that transport, provider selection, and
//! credentials stay outside the core.

pub mod provider;
pub mod types;

pub use provider::{LlmError, LlmProvider, LlmStream};
pub use types::{
    CompletionRequest, CompletionResponse, ContentBlock, Message, MessageContent, MessageRole,
    StreamChunk,
};
