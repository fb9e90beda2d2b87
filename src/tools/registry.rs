use std::{collections::HashMap, sync::Arc};

use super::schema::OperationSchema;
use super::traits::Tool;

/// Convert a display alias to the canonical underscored form.
pub fn canonical_name(name: &str) -> String {
    name.replace('-', "_")
}

/// One registered operation: the owning tool instance plus the schema it
/// advertised for this operation.
#[derive(Clone)]
pub struct RegisteredOperation {
    pub tool: Arc<dyn Tool>,
    pub schema: OperationSchema,
}

/// Central registry of callable operations, keyed by canonical name.
///
/// Registries are built per agent invocation, never shared across runs:
/// each run registers exactly the tool set its agent configuration allows.
pub struct ToolRegistry {
    operations: HashMap<String, RegisteredOperation>,
}

impl ToolRegistry {
    pub fn new() -> Self {
        Self {
            operations: HashMap::new(),
        }
    }

    /// Register a tool, indexing every operation it advertises.
    /// Re-registering an operation name overwrites the previous entry.
    pub fn register(&mut self, tool: Arc<dyn Tool>) {
        for schema in tool.operations() {
            let key = canonical_name(&schema.name);
            if self.operations.contains_key(&key) {
                tracing::warn!(operation = %key, "overwriting previously registered operation");
            }
            self.operations.insert(
                key,
                RegisteredOperation {
                    tool: tool.clone(),
                    schema,
                },
            );
        }
    }

    /// Look up an operation.  An exact canonical match is preferred;
    /// hyphen→underscore normalization is applied only on miss.
    pub fn resolve(&self, name: &str) -> Option<&RegisteredOperation> {
        if let Some(entry) = self.operations.get(name) {
            return Some(entry);
        }
        self.operations.get(&canonical_name(name))
    }

    /// Map of xml tag name → canonical operation name, for the stream
    /// scanner and the invocation parser.
    pub fn xml_tags(&self) -> HashMap<String, String> {
        self.operations
            .iter()
            .filter_map(|(name, entry)| {
                entry
                    .schema
                    .xml
                    .as_ref()
                    .map(|xml| (xml.tag_name.clone(), name.clone()))
            })
            .collect()
    }

    /// All registered operations in name order (stable catalog output).
    pub fn operations(&self) -> Vec<&RegisteredOperation> {
        let mut entries: Vec<_> = self.operations.values().collect();
        entries.sort_by(|a, b| a.schema.name.cmp(&b.schema.name));
        entries
    }

    pub fn len(&self) -> usize {
        self.operations.len()
    }

    pub fn is_empty(&self) -> bool {
        self.operations.is_empty()
    }
}

impl Default for ToolRegistry {
    fn default() -> Self {
        Self::new()
    }
}

// ─── Tests ────────────────────────────────────────────────────────────────────
