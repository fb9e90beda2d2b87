//! Tool system: registry, invocation parsing, execution, and the built-in
//! sandbox tool set.

pub mod browser;
pub mod document;
pub mod executor;
pub mod files;
pub mod message;
pub mod parser;
pub mod registry;
pub mod schema;
pub mod shell;
#[cfg(test)]
pub(crate) mod testutil;
pub mod traits;
pub mod vision;

use std::sync::Arc;

pub use browser::BrowserTool;
pub use document::DocumentTool;
pub use executor::ToolExecutor;
pub use files::FilesTool;
pub use message::MessageTool;
pub use parser::{CallSource, ParsedResponse, ToolCall, ToolParser};
pub use registry::{RegisteredOperation, ToolRegistry, canonical_name};
pub use schema::{OperationSchema, ParamSource, XmlMapping, XmlSchema};
pub use shell::ShellTool;
pub use traits::{Tool, ToolContext, ToolErrorKind, ToolRecord, ToolResult};
pub use vision::VisionTool;

use crate::sandbox::WORKSPACE_DIR;

/// Normalize a user-supplied path to an absolute path under `/workspace`.
///
/// Models refer to files as `a.txt`, `/workspace/a.txt`, or `./a.txt`
/// interchangeably; everything collapses to the absolute container path.
/// Traversal segments are dropped.
pub fn clean_path(path: &str) -> String {
    let mut segments: Vec<&str> = Vec::new();
    for segment in path.trim().split('/') {
        match segment {
            "" | "." | ".." => continue,
            "workspace" if segments.is_empty() => continue,
            s => segments.push(s),
        }
    }

    if segments.is_empty() {
        WORKSPACE_DIR.to_string()
    } else {
        format!("{WORKSPACE_DIR}/{}", segments.join("/"))
    }
}

/// The full built-in tool set.  The driver filters this by the agent
/// configuration before registering.
pub fn default_toolset() -> Vec<Arc<dyn Tool>> {
    vec![
        Arc::new(ShellTool),
        Arc::new(FilesTool),
        Arc::new(BrowserTool),
        Arc::new(VisionTool),
        Arc::new(MessageTool),
        Arc::new(DocumentTool),
    ]
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn clean_path_normalizes_all_spellings() {
        assert_eq!(clean_path("a.txt"), "/workspace/a.txt");
        assert_eq!(clean_path("/workspace/a.txt"), "/workspace/a.txt");
        assert_eq!(clean_path("./docs/b.md"), "/workspace/docs/b.md");
        assert_eq!(clean_path("/a.txt"), "/workspace/a.txt");
        assert_eq!(clean_path(""), "/workspace");
        assert_eq!(clean_path("/workspace"), "/workspace");
    }

    #[test]
    fn clean_path_drops_traversal() {
        assert_eq!(clean_path("../../etc/passwd"), "/workspace/etc/passwd");
        assert_eq!(clean_path("a/../b.txt"), "/workspace/a/b.txt");
    }

    #[test]
    fn default_toolset_has_unique_operation_names() {
        let mut registry = ToolRegistry::new();
        let mut count = 0;
        for tool in default_toolset() {
            count += tool.operations().len();
            registry.register(tool);
        }
        assert_eq!(registry.len(), count, "operation names must not collide");
    }
}
