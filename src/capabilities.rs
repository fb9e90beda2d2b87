//! External capability providers.
//!
//! A capability provider is a configurable source of extra operations
//! (an MCP server, a data-provider hub, ...).  At invocation start every
//! initialized provider's operations are merged into the tool registry
//! through [`CapabilityCallTool`], one registry entry per remote
//! operation, so the model calls them exactly like built-in tools.  The
//! wrapper opts out of the standard prompt catalog: the context builder
//! renders the capability catalog separately, together with the rule that
//! provider results are authoritative.

use std::sync::Arc;

use async_trait::async_trait;
use serde_json::{Map, Value};

use crate::tools::{OperationSchema, Tool, ToolContext, ToolRegistry, ToolResult};

/// One operation advertised by a capability provider.
#[derive(Debug, Clone)]
pub struct CapabilityOp {
    /// Canonical underscored operation name.
    pub name: String,
    pub description: String,
    /// JSON-schema parameters object.
    pub parameters: Value,
}

/// A source of external operations, initialized before the run starts.
#[async_trait]
pub trait CapabilityProvider: Send + Sync {
    /// Provider name, used in the prompt catalog.
    fn name(&self) -> &str;

    /// Operations currently available.  Empty when the provider failed to
    /// initialize; the run proceeds without it.
    fn operations(&self) -> Vec<CapabilityOp>;

    /// Invoke one operation with string-typed kwargs.
    async fn call(&self, operation: &str, args: Map<String, Value>) -> Result<Value, String>;
}

/// Registry adapter that forwards one provider's operations.
pub struct CapabilityCallTool {
    provider: Arc<dyn CapabilityProvider>,
}

impl CapabilityCallTool {
    pub fn new(provider: Arc<dyn CapabilityProvider>) -> Self {
        Self { provider }
    }
}

#[async_trait]
impl Tool for CapabilityCallTool {
    fn name(&self) -> &str {
        self.provider.name()
    }

    fn description(&self) -> &str {
        "Pass-through to an external capability provider."
    }

    fn operations(&self) -> Vec<OperationSchema> {
        self.provider
            .operations()
            .into_iter()
            .map(|op| {
                OperationSchema::new(op.name, op.description).with_parameters(op.parameters)
            })
            .collect()
    }

    fn advertise_in_prompt(&self) -> bool {
        false
    }

    async fn invoke(
        &self,
        operation: &str,
        args: Map<String, Value>,
        _ctx: ToolContext,
    ) -> Result<ToolResult, String> {
        let output = self.provider.call(operation, args).await?;
        Ok(ToolResult::ok_json(output))
    }
}

/// Merge every provider's operations into the registry.
pub fn register_capabilities(
    registry: &mut ToolRegistry,
    providers: &[Arc<dyn CapabilityProvider>],
) {
    for provider in providers {
        let ops = provider.operations();
        if ops.is_empty() {
            tracing::warn!(provider = provider.name(), "capability provider has no operations; skipping");
            continue;
        }
        tracing::info!(
            provider = provider.name(),
            operations = ops.len(),
            "registering capability provider"
        );
        registry.register(Arc::new(CapabilityCallTool::new(provider.clone())));
    }
}

/// Prompt section describing the available capability operations and the
/// rules for using their results.
pub fn capability_catalog(providers: &[Arc<dyn CapabilityProvider>]) -> Option<String> {
    let mut listed = Vec::new();
    for provider in providers {
        for op in provider.operations() {
            listed.push((provider.name().to_string(), op));
        }
    }
    if listed.is_empty() {
        return None;
    }

    let mut text = String::from("\n\n--- External Capability Operations ---\n");
    text.push_str(
        "These operations are served by external providers and are called \
         with the standard function-call format.\n\nAvailable operations:\n",
    );
    for (provider, op) in &listed {
        text.push_str(&format!("- **{}** ({provider}): {}\n", op.name, op.description));
        if let Some(props) = op.parameters.get("properties").and_then(Value::as_object)
            && !props.is_empty()
        {
            let names: Vec<_> = props.keys().map(String::as_str).collect();
            text.push_str(&format!("  Parameters: {}\n", names.join(", ")));
        }
    }
    text.push_str(
        "\nCapability results are authoritative: base your statements on \
         the exact output these operations return, cite only sources they \
         produced, and never fabricate data beyond them. If an operation \
         returns too little information, say so rather than filling gaps.\n",
    );
    Some(text)
}

// ─── Tests ────────────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    struct WeatherProvider;

    #[async_trait]
    impl CapabilityProvider for WeatherProvider {
        fn name(&self) -> &str {
            "weather_hub"
        }
        fn operations(&self) -> Vec<CapabilityOp> {
            vec![CapabilityOp {
                name: "get_forecast".into(),
                description: "Fetch a weather forecast".into(),
                parameters: json!({
                    "type": "object",
                    "properties": { "city": { "type": "string" } },
                    "required": ["city"]
                }),
            }]
        }
        async fn call(&self, operation: &str, args: Map<String, Value>) -> Result<Value, String> {
            assert_eq!(operation, "get_forecast");
            Ok(json!({ "city": args["city"], "forecast": "sunny" }))
        }
    }

    struct EmptyProvider;

    #[async_trait]
    impl CapabilityProvider for EmptyProvider {
        fn name(&self) -> &str {
            "broken"
        }
        fn operations(&self) -> Vec<CapabilityOp> {
            vec![]
        }
        async fn call(&self, _: &str, _: Map<String, Value>) -> Result<Value, String> {
            Err("uninitialized".into())
        }
    }

    #[test]
    fn operations_merge_into_registry() {
        let mut registry = ToolRegistry::new();
        let providers: Vec<Arc<dyn CapabilityProvider>> =
            vec![Arc::new(WeatherProvider), Arc::new(EmptyProvider)];
        register_capabilities(&mut registry, &providers);

        let entry = registry.resolve("get_forecast").unwrap();
        assert!(!entry.tool.advertise_in_prompt());
        assert_eq!(registry.len(), 1);
    }

    #[test]
    fn catalog_lists_operations_and_rules() {
        let providers: Vec<Arc<dyn CapabilityProvider>> = vec![Arc::new(WeatherProvider)];
        let catalog = capability_catalog(&providers).unwrap();
        assert!(catalog.contains("get_forecast"));
        assert!(catalog.contains("weather_hub"));
        assert!(catalog.contains("authoritative"));
        assert!(catalog.contains("Parameters: city"));
    }

    #[test]
    fn catalog_absent_without_operations() {
        let providers: Vec<Arc<dyn CapabilityProvider>> = vec![Arc::new(EmptyProvider)];
        assert!(capability_catalog(&providers).is_none());
    }
}
