//! The agent core: context assembly, streamed response processing, and
//! the outer iteration loop.

pub mod context;
pub mod driver;
pub mod processor;
pub mod thread;

pub use context::{ContextBuilder, ContextCondenser};
pub use driver::{AgentDriver, RunOptions};
pub use processor::{IterationOutcome, ProcessorConfig, ResponseProcessor};
pub use thread::{RunThreadParams, ThreadManager, ThreadRun};

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::ai::LlmError;
use crate::sandbox::SandboxError;
use crate::store::StoreError;

/// Infrastructure failures that abort an agent invocation.  Tool-level
/// failures never surface here; they become tool results the model can
/// react to.
#[derive(Debug, Error)]
pub enum AgentError {
    #[error(transparent)]
    Store(#[from] StoreError),

    #[error(transparent)]
    Llm(#[from] LlmError),

    #[error(transparent)]
    Sandbox(#[from] SandboxError),

    #[error("agent runtime error: {0}")]
    Internal(String),
}

/// Per-agent configuration supplied by the caller.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct AgentProfile {
    pub name: String,
    /// Custom system prompt.  When set it replaces the default prompt
    /// entirely, so the model never sees tools it does not have.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub system_prompt: Option<String>,
    /// Tool names to register; `None` registers the full built-in set.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub enabled_tools: Option<Vec<String>>,
}

/// Bookkeeping for one driver iteration.
#[derive(Debug, Clone)]
pub struct IterationState {
    pub iteration_index: usize,
    pub max_iterations: usize,
    pub last_tool_name: Option<String>,
    pub terminate_requested: bool,
    pub error_flagged: bool,
    pub accumulated_assistant_text: String,
}

impl IterationState {
    pub fn new(max_iterations: usize) -> Self {
        Self {
            iteration_index: 0,
            max_iterations,
            last_tool_name: None,
            terminate_requested: false,
            error_flagged: false,
            accumulated_assistant_text: String::new(),
        }
    }

    /// Fold one processed response into the state.
    pub fn absorb(&mut self, outcome: &IterationOutcome) {
        if outcome.last_tool_name.is_some() {
            self.last_tool_name = outcome.last_tool_name.clone();
        }
        self.terminate_requested |= outcome.terminate_requested;
        self.error_flagged |= outcome.error_flagged;
        self.accumulated_assistant_text = outcome.assistant_text.clone();
    }
}
