//! Runtime configuration: TOML schema plus loading/override logic.

pub mod loader;
pub mod schema;

pub use loader::{default_config_path, load_config, load_default_config};
pub use schema::{AgentLimits, AppConfig, ManagedConfig, SandboxConfig, SandboxKind};
