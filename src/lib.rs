//! Sandpiper — core runtime for an autonomous AI agent.
//!
//! The runtime drives an LLM through iterative reasoning steps: each
//! iteration builds context from the thread, streams one completion,
//! parses tool invocations out of the response (structured call blocks
//! and inline XML), executes them inside the project's sandbox container,
//! folds the results back into the thread, and emits a typed event
//! stream.  Persistence, billing, LLM transport, and object storage are
//! consumed through traits; deployments supply the implementations.
//!
//! ```ignore
//! let driver = AgentDriver::new(provider, store.clone(), billing, sandbox);
//! let mut events = Arc::new(driver).run_stream(RunOptions::new(thread_id, project_id, model));
//! while let Some(event) = events.next().await {
//!     println!("{}", serde_json::to_string(&event)?);
//! }
//! ```

pub mod agent;
pub mod ai;
pub mod billing;
pub mod capabilities;
pub mod config;
pub mod events;
pub mod prompts;
pub mod sandbox;
pub mod storage;
pub mod store;
pub mod tools;

/// Convenience re-exports for the most commonly used traits and types.
///
/// ```rust
/// use sandpiper::prelude::*;
/// ```
pub mod prelude {
    // Agent loop
    pub use crate::agent::{
        AgentDriver, AgentError, AgentProfile, IterationState, ProcessorConfig, RunOptions,
        ThreadManager,
    };

    // LLM interface
    pub use crate::ai::{
        CompletionRequest, CompletionResponse, LlmProvider, LlmStream, Message, MessageRole,
        StreamChunk,
    };

    // Tool system
    pub use crate::tools::{
        Tool, ToolCall, ToolContext, ToolRegistry, ToolResult,
    };

    // Sandbox
    pub use crate::sandbox::{
        SandboxDescriptor, SandboxError, SandboxHandle, SandboxProvider, SandboxService,
    };

    // Persistence
    pub use crate::store::{InMemoryStore, MessageKind, ProjectStore, ThreadStore};

    // Billing
    pub use crate::billing::{BillingGate, BillingStatus};

    // Events
    pub use crate::events::AgentEvent;

    // Configuration
    pub use crate::config::{AppConfig, load_default_config};
}
