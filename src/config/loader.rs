//! TOML configuration loading and env-var overrides.
//!
//! # Loading order
//! 1. Parse `~/.sandpiper/config.toml` (or the path in `SANDPIPER_CONFIG`)
//! 2. Apply environment variable overrides
//! 3. Fall back to [`AppConfig::default()`] if the file is missing

use std::{
    env, fs,
    path::{Path, PathBuf},
};

use super::schema::{AppConfig, SandboxKind};

// ─── default_config_path ─────────────────────────────────────────────────────

/// Return the default config file path: `~/.sandpiper/config.toml`.
pub fn default_config_path() -> Result<PathBuf, String> {
    dirs::home_dir()
        .map(|h| h.join(".sandpiper").join("config.toml"))
        .ok_or_else(|| "could not determine home directory".to_string())
}

// ─── load_config ─────────────────────────────────────────────────────────────

/// Load [`AppConfig`] from the given path, falling back to defaults if the
/// file does not exist, then applying environment variable overrides.
pub fn load_config(path: &Path) -> Result<AppConfig, String> {
    let mut config = match fs::read_to_string(path) {
        Ok(content) => toml::from_str::<AppConfig>(&content)
            .map_err(|e| format!("failed to parse config at {path:?}: {e}"))?,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => AppConfig::default(),
        Err(e) => return Err(format!("failed to read config at {path:?}: {e}")),
    };

    apply_env_overrides(&mut config);
    Ok(config)
}

/// Load config from the default path (or `SANDPIPER_CONFIG`).
pub fn load_default_config() -> AppConfig {
    let path = env::var("SANDPIPER_CONFIG")
        .map(PathBuf::from)
        .unwrap_or_else(|_| {
            default_config_path().unwrap_or_else(|_| PathBuf::from("config.toml"))
        });

    load_config(&path).unwrap_or_default()
}

// ─── apply_env_overrides ─────────────────────────────────────────────────────

/// Apply environment variable overrides to `config`.
///
/// Supported overrides:
/// - `SANDBOX_TYPE`                   → `sandbox.kind` (`local` / `managed`)
/// - `SANDBOX_IMAGE_NAME`             → `sandbox.image`
/// - `SANDBOX_API_KEY`                → `managed.api_key`
/// - `SANDBOX_SERVER_URL`             → `managed.server_url`
/// - `SANDBOX_TARGET`                 → `managed.target`
/// - `SANDPIPER_MAX_ITERATIONS`       → `agent.max_iterations`
/// - `SANDPIPER_MAX_AUTO_CONTINUES`   → `agent.native_max_auto_continues`
/// - `SANDPIPER_MAX_TOOL_CALLS`       → `agent.max_tool_calls`
fn apply_env_overrides(config: &mut AppConfig) {
    if let Ok(v) = env::var("SANDBOX_TYPE") {
        match v.to_ascii_lowercase().as_str() {
            "local" => config.sandbox.kind = SandboxKind::Local,
            "managed" => config.sandbox.kind = SandboxKind::Managed,
            other => tracing::warn!(value = other, "ignoring unknown SANDBOX_TYPE"),
        }
    }
    if let Ok(v) = env::var("SANDBOX_IMAGE_NAME") {
        config.sandbox.image = v;
    }
    if let Ok(v) = env::var("SANDBOX_API_KEY") {
        config.managed.api_key = v;
    }
    if let Ok(v) = env::var("SANDBOX_SERVER_URL") {
        config.managed.server_url = v;
    }
    if let Ok(v) = env::var("SANDBOX_TARGET") {
        config.managed.target = v;
    }
    if let Ok(v) = env::var("SANDPIPER_MAX_ITERATIONS")
        && let Ok(n) = v.parse::<usize>()
    {
        config.agent.max_iterations = n;
    }
    if let Ok(v) = env::var("SANDPIPER_MAX_AUTO_CONTINUES")
        && let Ok(n) = v.parse::<usize>()
    {
        config.agent.native_max_auto_continues = n;
    }
    if let Ok(v) = env::var("SANDPIPER_MAX_TOOL_CALLS")
        && let Ok(n) = v.parse::<usize>()
    {
        config.agent.max_tool_calls = n;
    }
}

// ─── Tests ────────────────────────────────────────────────────────────────────
