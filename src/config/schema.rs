//! TOML configuration schema for the agent runtime.
//!
//! All fields have `#[serde(default)]` so a partially-filled `config.toml`
//! works correctly.  Missing sections fall back to their `Default` impl.
//!
//! Example `~/.sandpiper/config.toml`:
//! ```toml
//! [sandbox]
//! kind = "local"
//! image = "agent-runtime/sandbox:latest"
//!
//! [managed]
//! api_key = "mk-..."
//! server_url = "https://sandboxes.example.com/api"
//! target = "eu"
//!
//! [agent]
//! max_iterations = 100
//! max_tool_calls = 10
//! ```

use serde::{Deserialize, Serialize};

// ─── SandboxKind ──────────────────────────────────────────────────────────────

/// Which sandbox backend executes tool workloads.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum SandboxKind {
    /// Containers on the local container runtime.
    #[default]
    Local,
    /// Instances on the managed remote sandbox service.
    Managed,
}

// ─── SandboxConfig ────────────────────────────────────────────────────────────

/// Configuration for per-project sandbox containers.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct SandboxConfig {
    /// Backend selection.
    pub kind: SandboxKind,
    /// Image tag for the agent runtime sandbox.
    pub image: String,
    /// Explicit host port for the container's VNC endpoint (6080).
    /// `None` lets the runtime assign one.
    pub vnc_host_port: Option<u16>,
    /// Explicit host port for the container's web endpoint (8080).
    pub web_host_port: Option<u16>,
}

impl Default for SandboxConfig {
    fn default() -> Self {
        Self {
            kind: SandboxKind::default(),
            image: "agent-runtime/sandbox:latest".to_string(),
            vnc_host_port: None,
            web_host_port: None,
        }
    }
}

// ─── ManagedConfig ────────────────────────────────────────────────────────────

/// Credentials for the managed remote sandbox service.
///
/// The managed backend is considered configured only when both `api_key`
/// and `server_url` are non-empty.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Default)]
#[serde(default)]
pub struct ManagedConfig {
    pub api_key: String,
    pub server_url: String,
    /// Deployment target / region identifier.
    pub target: String,
}

impl ManagedConfig {
    pub fn is_configured(&self) -> bool {
        !self.api_key.is_empty() && !self.server_url.is_empty()
    }
}

// ─── AgentLimits ──────────────────────────────────────────────────────────────

/// Hard bounds on a single agent invocation.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct AgentLimits {
    /// Maximum driver-loop iterations per invocation.
    pub max_iterations: usize,
    /// Maximum provider-native auto-continues per LLM call.
    pub native_max_auto_continues: usize,
    /// Maximum tool invocations honored per LLM response.
    pub max_tool_calls: usize,
}

impl Default for AgentLimits {
    fn default() -> Self {
        Self {
            max_iterations: 100,
            native_max_auto_continues: 25,
            max_tool_calls: 10,
        }
    }
}

// ─── AppConfig ────────────────────────────────────────────────────────────────

/// Root configuration object.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Default)]
#[serde(default)]
pub struct AppConfig {
    pub sandbox: SandboxConfig,
    pub managed: ManagedConfig,
    pub agent: AgentLimits,
}

// ─── Tests ────────────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_match_documented_limits() {
        let cfg = AppConfig::default();
        assert_eq!(cfg.agent.max_iterations, 100);
        assert_eq!(cfg.agent.native_max_auto_continues, 25);
        assert_eq!(cfg.agent.max_tool_calls, 10);
        assert_eq!(cfg.sandbox.kind, SandboxKind::Local);
    }

    #[test]
    fn partial_toml_fills_defaults() {
        let cfg: AppConfig = toml::from_str(
            r#"
            [sandbox]
            kind = "managed"
            "#,
        )
        .unwrap();
        assert_eq!(cfg.sandbox.kind, SandboxKind::Managed);
        assert_eq!(cfg.sandbox.image, "agent-runtime/sandbox:latest");
        assert_eq!(cfg.agent.max_tool_calls, 10);
    }

    #[test]
    fn managed_config_requires_key_and_url() {
        let mut managed = ManagedConfig::default();
        assert!(!managed.is_configured());
        managed.api_key = "mk-test".into();
        assert!(!managed.is_configured());
        managed.server_url = "https://sandboxes.example.com".into();
        assert!(managed.is_configured());
    }

    #[test]
    fn sandbox_kind_serde_snake_case() {
        assert_eq!(
            serde_json::to_string(&SandboxKind::Managed).unwrap(),
            "\"managed\""
        );
        let parsed: SandboxKind = serde_json::from_str("\"local\"").unwrap();
        assert_eq!(parsed, SandboxKind::Local);
    }
}
