//! valet-config: TOML configuration with environment overrides.
//!
//! The config file lives at `~/.valet/config.toml`. Environment variables
//! are applied on top at load time; precedence from weakest to strongest is
//! config file, then dedicated `VALET_*` variables, then the generic
//! provider/channel variables (`ANTHROPIC_API_KEY`, `TELEGRAM_BOT_TOKEN`, …).

use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};
use thiserror::Error;

pub const DEFAULT_MODEL: &str = "claude-sonnet-4-5";
pub const DEFAULT_MAX_TOKENS: u32 = 8192;
pub const DEFAULT_HOST: &str = "0.0.0.0";
pub const DEFAULT_PORT: u16 = 18790;
pub const DEFAULT_BUF_SIZE: usize = 100;
pub const DEFAULT_HEARTBEAT_SECS: u64 = 30 * 60;

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
    #[error("TOML parse error: {0}")]
    Toml(#[from] toml::de::Error),
    #[error("TOML serialize error: {0}")]
    TomlSer(#[from] toml::ser::Error),
    #[error("Home directory not found")]
    NoHomeDir,
}

// ──────────────────── Sections ────────────────────

/// Agent runtime settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AgentConfig {
    /// Workspace directory holding AGENTS.md, SOUL.md, HEARTBEAT.md and logs.
    #[serde(default)]
    pub workspace: Option<PathBuf>,
    #[serde(default = "default_model")]
    pub model: String,
    #[serde(default = "default_max_tokens")]
    pub max_tokens: u32,
    /// Real-time tool progress messages sent to the chat while the agent runs.
    #[serde(default)]
    pub tool_log: ToolLogConfig,
}

fn default_model() -> String {
    DEFAULT_MODEL.to_string()
}

fn default_max_tokens() -> u32 {
    DEFAULT_MAX_TOKENS
}

impl Default for AgentConfig {
    fn default() -> Self {
        Self {
            workspace: None,
            model: default_model(),
            max_tokens: default_max_tokens(),
            tool_log: ToolLogConfig::default(),
        }
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ToolLogConfig {
    /// Whether progress updates are forwarded to the originating chat.
    /// Context-window warnings are forwarded regardless.
    #[serde(default)]
    pub enabled: bool,
}

/// LLM provider credentials.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ProviderConfig {
    #[serde(default)]
    pub api_key: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub base_url: Option<String>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ChannelsConfig {
    #[serde(default)]
    pub telegram: TelegramConfig,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct TelegramConfig {
    #[serde(default)]
    pub enabled: bool,
    #[serde(default)]
    pub token: String,
    /// Sender ids allowed to talk to the gateway. Empty accepts everyone.
    #[serde(default)]
    pub allow_from: Vec<String>,
}

/// Local RPC server binding.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GatewayConfig {
    #[serde(default = "default_host")]
    pub host: String,
    #[serde(default = "default_port")]
    pub port: u16,
    /// Queue capacity of the message bus.
    #[serde(default = "default_buf_size")]
    pub buf_size: usize,
    /// Enables the operational command set (/logs, /status, /chatid,
    /// /cleanup, /restart).
    #[serde(default = "default_true")]
    pub extended_commands: bool,
}

fn default_host() -> String {
    DEFAULT_HOST.to_string()
}

fn default_port() -> u16 {
    DEFAULT_PORT
}

fn default_buf_size() -> usize {
    DEFAULT_BUF_SIZE
}

fn default_true() -> bool {
    true
}

impl Default for GatewayConfig {
    fn default() -> Self {
        Self {
            host: default_host(),
            port: default_port(),
            buf_size: default_buf_size(),
            extended_commands: true,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HeartbeatConfig {
    #[serde(default = "default_heartbeat_secs")]
    pub interval_secs: u64,
}

fn default_heartbeat_secs() -> u64 {
    DEFAULT_HEARTBEAT_SECS
}

impl Default for HeartbeatConfig {
    fn default() -> Self {
        Self {
            interval_secs: default_heartbeat_secs(),
        }
    }
}

// ──────────────────── Top level ────────────────────

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Config {
    #[serde(default)]
    pub agent: AgentConfig,
    #[serde(default)]
    pub provider: ProviderConfig,
    #[serde(default)]
    pub channels: ChannelsConfig,
    #[serde(default)]
    pub gateway: GatewayConfig,
    #[serde(default)]
    pub heartbeat: HeartbeatConfig,
}

impl Config {
    /// The effective workspace directory: configured value or
    /// `<config_dir>/workspace`.
    pub fn workspace_dir(&self) -> PathBuf {
        match &self.agent.workspace {
            Some(p) => p.clone(),
            None => config_dir().map(|d| d.join("workspace")).unwrap_or_else(|_| PathBuf::from("workspace")),
        }
    }

    /// True when the RPC server is reachable only from this machine.
    /// Shell-command cron payloads are refused otherwise.
    pub fn rpc_is_loopback(&self) -> bool {
        matches!(self.gateway.host.as_str(), "127.0.0.1" | "::1" | "localhost")
    }
}

/// Resolve the valet config directory (`~/.valet`).
pub fn config_dir() -> Result<PathBuf, ConfigError> {
    dirs::home_dir()
        .map(|h| h.join(".valet"))
        .ok_or(ConfigError::NoHomeDir)
}

/// Resolve the config file path (`~/.valet/config.toml`).
pub fn config_file_path() -> Result<PathBuf, ConfigError> {
    Ok(config_dir()?.join("config.toml"))
}

/// Ensure the config directory exists.
pub fn ensure_config_dir() -> Result<PathBuf, ConfigError> {
    let dir = config_dir()?;
    if !dir.exists() {
        std::fs::create_dir_all(&dir)?;
    }
    Ok(dir)
}

/// Load configuration from the default path and apply env overrides.
pub fn load_config() -> Result<Config, ConfigError> {
    let _ = dotenvy::dotenv();
    let mut config = load_config_from(&config_file_path()?)?;
    apply_env_overrides(&mut config);
    Ok(config)
}

/// Load configuration from a specific path, falling back to defaults when
/// the file does not exist. Does not apply env overrides.
pub fn load_config_from(path: &Path) -> Result<Config, ConfigError> {
    if !path.exists() {
        tracing::debug!("config file not found at {}, using defaults", path.display());
        return Ok(Config::default());
    }
    let content = std::fs::read_to_string(path)?;
    Ok(toml::from_str(&content)?)
}

/// Save configuration to the default path.
pub fn save_config(config: &Config) -> Result<(), ConfigError> {
    let dir = ensure_config_dir()?;
    let content = toml::to_string_pretty(config)?;
    std::fs::write(dir.join("config.toml"), content)?;
    Ok(())
}

/// Apply environment overrides: dedicated `VALET_*` variables override the
/// file, generic variables override both.
pub fn apply_env_overrides(config: &mut Config) {
    let mut set = |target: &mut String, var: &str| {
        if let Ok(v) = std::env::var(var) {
            if !v.is_empty() {
                *target = v;
            }
        }
    };

    set(&mut config.provider.api_key, "VALET_API_KEY");
    set(&mut config.provider.api_key, "ANTHROPIC_API_KEY");

    let mut base_url = config.provider.base_url.clone().unwrap_or_default();
    set(&mut base_url, "VALET_BASE_URL");
    set(&mut base_url, "ANTHROPIC_BASE_URL");
    if !base_url.is_empty() {
        config.provider.base_url = Some(base_url);
    }

    set(&mut config.channels.telegram.token, "VALET_TELEGRAM_TOKEN");
    set(&mut config.channels.telegram.token, "TELEGRAM_BOT_TOKEN");
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let config = Config::default();
        assert_eq!(config.gateway.host, "0.0.0.0");
        assert_eq!(config.gateway.port, 18790);
        assert_eq!(config.gateway.buf_size, 100);
        assert!(config.gateway.extended_commands);
        assert_eq!(config.heartbeat.interval_secs, 1800);
        assert_eq!(config.agent.model, DEFAULT_MODEL);
        assert!(!config.channels.telegram.enabled);
    }

    #[test]
    fn test_toml_parse() {
        let toml_str = r#"
[agent]
model = "claude-opus-4"

[channels.telegram]
enabled = true
token = "123:ABC"
allow_from = ["42"]

[gateway]
host = "127.0.0.1"
port = 19000
extended_commands = false
"#;
        let config: Config = toml::from_str(toml_str).unwrap();
        assert_eq!(config.agent.model, "claude-opus-4");
        assert!(config.channels.telegram.enabled);
        assert_eq!(config.channels.telegram.allow_from, vec!["42"]);
        assert_eq!(config.gateway.port, 19000);
        assert!(!config.gateway.extended_commands);
        assert!(config.rpc_is_loopback());
    }

    #[test]
    fn test_roundtrip() {
        let config = Config::default();
        let serialized = toml::to_string_pretty(&config).unwrap();
        let deserialized: Config = toml::from_str(&serialized).unwrap();
        assert_eq!(config.gateway.port, deserialized.gateway.port);
        assert_eq!(config.agent.model, deserialized.agent.model);
    }

    #[test]
    fn test_load_missing_file_uses_defaults() {
        let dir = tempfile::tempdir().unwrap();
        let config = load_config_from(&dir.path().join("nope.toml")).unwrap();
        assert_eq!(config.gateway.port, DEFAULT_PORT);
    }

    #[test]
    fn test_rpc_is_loopback() {
        let mut config = Config::default();
        assert!(!config.rpc_is_loopback());
        config.gateway.host = "127.0.0.1".into();
        assert!(config.rpc_is_loopback());
        config.gateway.host = "localhost".into();
        assert!(config.rpc_is_loopback());
    }

    #[test]
    fn test_env_precedence_generic_wins() {
        // Env-var tests mutate process state; keep them in one test to avoid
        // interference between parallel test threads.
        let mut config = Config::default();
        config.provider.api_key = "from-file".into();

        std::env::set_var("VALET_API_KEY", "dedicated");
        std::env::remove_var("ANTHROPIC_API_KEY");
        apply_env_overrides(&mut config);
        assert_eq!(config.provider.api_key, "dedicated");

        std::env::set_var("ANTHROPIC_API_KEY", "generic");
        apply_env_overrides(&mut config);
        assert_eq!(config.provider.api_key, "generic");

        std::env::remove_var("VALET_API_KEY");
        std::env::remove_var("ANTHROPIC_API_KEY");
    }
}
