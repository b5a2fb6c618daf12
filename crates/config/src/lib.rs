//! Configuration loading, validation, and management for ChatRelay.
//!
//! Loads configuration from `~/.chatrelay/config.toml` with environment
//! variable overrides. Validates all settings at startup; the result is
//! immutable for the life of the process and shared behind an `Arc`.

use chatrelay_core::ProviderFamily;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::{Path, PathBuf};

/// The root configuration structure.
///
/// Maps directly to `~/.chatrelay/config.toml`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AppConfig {
    /// Provider used for chat until a `/provider` command switches it
    #[serde(default = "default_active_provider")]
    pub active_provider: String,

    /// Delay inserted before every provider call, in milliseconds
    #[serde(default)]
    pub rate_limit_delay_ms: u64,

    /// Directory holding instructions, environment summary and user context
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub context_dir: Option<PathBuf>,

    /// Gateway configuration
    #[serde(default)]
    pub gateway: GatewayConfig,

    /// Context and history ceilings
    #[serde(default)]
    pub budget: BudgetConfig,

    /// Named provider configurations
    #[serde(default = "default_providers")]
    pub providers: HashMap<String, ProviderConfig>,
}

fn default_active_provider() -> String {
    "openai".into()
}

fn default_providers() -> HashMap<String, ProviderConfig> {
    let mut providers = HashMap::new();
    providers.insert(
        "openai".to_string(),
        ProviderConfig {
            model: Some("gpt-4o-mini".into()),
            ..ProviderConfig::new(ProviderFamily::ChatCompletions)
        },
    );
    providers
}

/// Redact a secret for Debug output.
fn redact(s: &Option<String>) -> &'static str {
    match s {
        Some(_) => "[REDACTED]",
        None => "None",
    }
}

#[derive(Clone, Serialize, Deserialize)]
pub struct ProviderConfig {
    /// Wire-protocol family; selects the adapter
    pub family: ProviderFamily,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub api_key: Option<String>,

    /// Base endpoint; the family default is used when unset
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub api_url: Option<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub model: Option<String>,

    /// Executable for the `cli-subprocess` family
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub executable_path: Option<PathBuf>,

    /// Extra arguments passed to the executable
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub args: Vec<String>,

    #[serde(default = "default_max_tokens")]
    pub max_tokens: u32,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub temperature: Option<f32>,

    /// Wall-clock limit for one provider call
    #[serde(default = "default_timeout_secs")]
    pub timeout_secs: u64,
}

fn default_max_tokens() -> u32 {
    4096
}
fn default_timeout_secs() -> u64 {
    120
}

impl ProviderConfig {
    pub fn new(family: ProviderFamily) -> Self {
        Self {
            family,
            api_key: None,
            api_url: None,
            model: None,
            executable_path: None,
            args: Vec::new(),
            max_tokens: default_max_tokens(),
            temperature: None,
            timeout_secs: default_timeout_secs(),
        }
    }

    /// Base URL, falling back to the family's public endpoint.
    pub fn base_url(&self) -> String {
        self.api_url
            .clone()
            .unwrap_or_else(|| default_base_url(self.family).to_string())
    }

    /// Model name, falling back to a family default.
    pub fn model_or_default(&self) -> String {
        self.model.clone().unwrap_or_else(|| match self.family {
            ProviderFamily::ChatCompletions => "gpt-4o-mini".into(),
            ProviderFamily::MessageBlock => "claude-sonnet-4-20250514".into(),
            ProviderFamily::CliSubprocess => "default".into(),
        })
    }
}

/// Public endpoint for each family.
pub fn default_base_url(family: ProviderFamily) -> &'static str {
    match family {
        ProviderFamily::ChatCompletions => "https://api.openai.com/v1",
        ProviderFamily::MessageBlock => "https://api.anthropic.com/v1",
        ProviderFamily::CliSubprocess => "",
    }
}

impl std::fmt::Debug for ProviderConfig {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ProviderConfig")
            .field("family", &self.family)
            .field("api_key", &redact(&self.api_key))
            .field("api_url", &self.api_url)
            .field("model", &self.model)
            .field("executable_path", &self.executable_path)
            .field("args", &self.args)
            .field("max_tokens", &self.max_tokens)
            .field("temperature", &self.temperature)
            .field("timeout_secs", &self.timeout_secs)
            .finish()
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GatewayConfig {
    #[serde(default = "default_port")]
    pub port: u16,

    #[serde(default = "default_host")]
    pub host: String,

    /// Largest accepted request body
    #[serde(default = "default_max_body_bytes")]
    pub max_body_bytes: usize,

    /// Browser origins allowed by CORS; empty allows any
    #[serde(default)]
    pub allowed_origins: Vec<String>,
}

fn default_port() -> u16 {
    8787
}
fn default_host() -> String {
    "127.0.0.1".into()
}
fn default_max_body_bytes() -> usize {
    8 * 1024 * 1024
}

impl Default for GatewayConfig {
    fn default() -> Self {
        Self {
            port: default_port(),
            host: default_host(),
            max_body_bytes: default_max_body_bytes(),
            allowed_origins: Vec::new(),
        }
    }
}

/// Character and message-count ceilings applied to every request.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BudgetConfig {
    /// Cap for the base instructions segment
    #[serde(default = "default_base_instructions_cap")]
    pub base_instructions_cap: usize,

    /// Cap for the environment summary segment
    #[serde(default = "default_system_context_cap")]
    pub system_context_cap: usize,

    /// Cap for rules, persona, goals and skills together
    #[serde(default = "default_user_context_cap")]
    pub user_context_cap: usize,

    /// Messages kept from history (0 = unlimited)
    #[serde(default = "default_max_history_messages")]
    pub max_history_messages: usize,

    /// Most recent rounds whose tool results are kept verbatim
    #[serde(default = "default_tool_rounds_kept_in_full")]
    pub tool_rounds_kept_in_full: usize,

    /// Below this combined size skills are included verbatim
    #[serde(default = "default_skill_full_text_threshold")]
    pub skill_full_text_threshold: usize,
}

fn default_base_instructions_cap() -> usize {
    12_000
}
fn default_system_context_cap() -> usize {
    6_000
}
fn default_user_context_cap() -> usize {
    8_000
}
fn default_max_history_messages() -> usize {
    24
}
fn default_tool_rounds_kept_in_full() -> usize {
    2
}
fn default_skill_full_text_threshold() -> usize {
    4_000
}

impl Default for BudgetConfig {
    fn default() -> Self {
        Self {
            base_instructions_cap: default_base_instructions_cap(),
            system_context_cap: default_system_context_cap(),
            user_context_cap: default_user_context_cap(),
            max_history_messages: default_max_history_messages(),
            tool_rounds_kept_in_full: default_tool_rounds_kept_in_full(),
            skill_full_text_threshold: default_skill_full_text_threshold(),
        }
    }
}

impl AppConfig {
    /// Load configuration from the default path (~/.chatrelay/config.toml),
    /// then apply environment overrides:
    /// - `CHATRELAY_PROVIDER` selects the active provider
    /// - `CHATRELAY_MODEL` overrides the active provider's model
    /// - `CHATRELAY_API_KEY`, then `OPENAI_API_KEY` / `ANTHROPIC_API_KEY`
    ///   by family, fill in a missing key for the active provider
    /// - `CHATRELAY_CONTEXT_DIR` overrides the context directory
    pub fn load() -> Result<Self, ConfigError> {
        let config_path = Self::config_dir().join("config.toml");
        let mut config = Self::load_from(&config_path)?;
        config.apply_env_overrides(|key| std::env::var(key).ok());
        config.validate()?;
        Ok(config)
    }

    /// Load configuration from a specific file path.
    pub fn load_from(path: &Path) -> Result<Self, ConfigError> {
        if !path.exists() {
            tracing::info!("No config file found at {}, using defaults", path.display());
            return Ok(Self::default());
        }

        let content = std::fs::read_to_string(path).map_err(|e| ConfigError::ReadError {
            path: path.to_path_buf(),
            reason: e.to_string(),
        })?;

        let config: Self = toml::from_str(&content).map_err(|e| ConfigError::ParseError {
            path: path.to_path_buf(),
            reason: e.to_string(),
        })?;

        config.validate()?;
        Ok(config)
    }

    /// Apply overrides from an environment lookup.
    pub fn apply_env_overrides(&mut self, lookup: impl Fn(&str) -> Option<String>) {
        if let Some(provider) = lookup("CHATRELAY_PROVIDER") {
            self.active_provider = provider;
        }
        if let Some(dir) = lookup("CHATRELAY_CONTEXT_DIR") {
            self.context_dir = Some(PathBuf::from(dir));
        }

        let model = lookup("CHATRELAY_MODEL");
        let Some(active) = self.providers.get_mut(&self.active_provider) else {
            return;
        };
        if let Some(model) = model {
            active.model = Some(model);
        }
        if active.api_key.is_none() {
            let family_var = match active.family {
                ProviderFamily::ChatCompletions => Some("OPENAI_API_KEY"),
                ProviderFamily::MessageBlock => Some("ANTHROPIC_API_KEY"),
                ProviderFamily::CliSubprocess => None,
            };
            active.api_key =
                lookup("CHATRELAY_API_KEY").or_else(|| family_var.and_then(|v| lookup(v)));
        }
    }

    /// Get the configuration directory path.
    pub fn config_dir() -> PathBuf {
        dirs_home().join(".chatrelay")
    }

    /// Directory read for context files on every request.
    pub fn context_dir(&self) -> PathBuf {
        self.context_dir
            .clone()
            .unwrap_or_else(|| Self::config_dir().join("context"))
    }

    /// The active provider's name and configuration.
    pub fn active(&self) -> Option<(&str, &ProviderConfig)> {
        self.providers
            .get_key_value(&self.active_provider)
            .map(|(k, v)| (k.as_str(), v))
    }

    /// Provider names, sorted.
    pub fn provider_names(&self) -> Vec<String> {
        let mut names: Vec<String> = self.providers.keys().cloned().collect();
        names.sort();
        names
    }

    /// Validate the configuration.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if !self.providers.contains_key(&self.active_provider) {
            return Err(ConfigError::ValidationError(format!(
                "active_provider '{}' is not defined under [providers]",
                self.active_provider
            )));
        }

        for (name, provider) in &self.providers {
            if provider.timeout_secs == 0 {
                return Err(ConfigError::ValidationError(format!(
                    "providers.{name}.timeout_secs must be > 0"
                )));
            }
            if let Some(t) = provider.temperature {
                if !(0.0..=2.0).contains(&t) {
                    return Err(ConfigError::ValidationError(format!(
                        "providers.{name}.temperature must be between 0.0 and 2.0"
                    )));
                }
            }
            if provider.family == ProviderFamily::CliSubprocess
                && provider.executable_path.is_none()
            {
                return Err(ConfigError::ValidationError(format!(
                    "providers.{name} uses cli-subprocess but has no executable_path"
                )));
            }
        }

        let b = &self.budget;
        if b.base_instructions_cap == 0 || b.system_context_cap == 0 || b.user_context_cap == 0 {
            return Err(ConfigError::ValidationError(
                "budget caps must be > 0".into(),
            ));
        }

        Ok(())
    }

    /// Generate a default config TOML string (for the `config` command).
    pub fn default_toml() -> String {
        let config = Self::default();
        toml::to_string_pretty(&config).unwrap_or_default()
    }
}

impl Default for AppConfig {
    fn default() -> Self {
        Self {
            active_provider: default_active_provider(),
            rate_limit_delay_ms: 0,
            context_dir: None,
            gateway: GatewayConfig::default(),
            budget: BudgetConfig::default(),
            providers: default_providers(),
        }
    }
}

/// Get the user's home directory.
fn dirs_home() -> PathBuf {
    #[cfg(target_os = "windows")]
    {
        std::env::var("USERPROFILE")
            .map(PathBuf::from)
            .unwrap_or_else(|_| PathBuf::from("C:\\Users\\Default"))
    }
    #[cfg(not(target_os = "windows"))]
    {
        std::env::var("HOME")
            .map(PathBuf::from)
            .unwrap_or_else(|_| PathBuf::from("/tmp"))
    }
}

/// Configuration errors.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("Failed to read config file at {path}: {reason}")]
    ReadError { path: PathBuf, reason: String },

    #[error("Failed to parse config file at {path}: {reason}")]
    ParseError { path: PathBuf, reason: String },

    #[error("Configuration validation failed: {0}")]
    ValidationError(String),
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn default_config_is_valid() {
        let config = AppConfig::default();
        assert!(config.validate().is_ok());
        assert_eq!(config.active_provider, "openai");
        assert_eq!(config.gateway.port, 8787);
        assert_eq!(config.budget.max_history_messages, 24);
    }

    #[test]
    fn config_roundtrip_toml() {
        let config = AppConfig::default();
        let toml_str = toml::to_string_pretty(&config).unwrap();
        let parsed: AppConfig = toml::from_str(&toml_str).unwrap();
        assert_eq!(parsed.active_provider, config.active_provider);
        assert_eq!(parsed.budget, config.budget);
    }

    #[test]
    fn missing_config_file_returns_defaults() {
        let config = AppConfig::load_from(Path::new("/nonexistent/config.toml")).unwrap();
        assert_eq!(config.active_provider, "openai");
    }

    #[test]
    fn parses_all_three_families() {
        let toml_str = r#"
active_provider = "claude"
rate_limit_delay_ms = 250

[budget]
max_history_messages = 10
tool_rounds_kept_in_full = 1

[providers.local]
family = "chat-completions"
api_url = "http://localhost:11434/v1"
model = "llama3"

[providers.claude]
family = "message-block"
api_key = "sk-ant-test"
model = "claude-sonnet-4-20250514"

[providers.cli]
family = "cli-subprocess"
executable_path = "/usr/local/bin/llm"
args = ["--json"]
timeout_secs = 30
"#;
        let mut file = tempfile::NamedTempFile::new().unwrap();
        file.write_all(toml_str.as_bytes()).unwrap();
        let config = AppConfig::load_from(file.path()).unwrap();

        assert_eq!(config.rate_limit_delay_ms, 250);
        assert_eq!(config.budget.max_history_messages, 10);
        // Unset budget fields keep their defaults
        assert_eq!(config.budget.user_context_cap, 8_000);
        assert_eq!(config.providers.len(), 3);
        let (name, active) = config.active().unwrap();
        assert_eq!(name, "claude");
        assert_eq!(active.family, ProviderFamily::MessageBlock);
        assert_eq!(active.base_url(), "https://api.anthropic.com/v1");
        assert_eq!(config.providers["cli"].args, vec!["--json".to_string()]);
        assert_eq!(config.provider_names(), vec!["claude", "cli", "local"]);
    }

    #[test]
    fn unknown_active_provider_rejected() {
        let config = AppConfig {
            active_provider: "nope".into(),
            ..AppConfig::default()
        };
        assert!(config.validate().is_err());
    }

    #[test]
    fn cli_provider_requires_executable() {
        let mut config = AppConfig::default();
        config
            .providers
            .insert("cli".into(), ProviderConfig::new(ProviderFamily::CliSubprocess));
        let err = config.validate().unwrap_err();
        assert!(err.to_string().contains("executable_path"));
    }

    #[test]
    fn env_overrides_apply_to_active_provider() {
        let mut config = AppConfig::default();
        let env: HashMap<&str, &str> = [
            ("CHATRELAY_MODEL", "gpt-4.1"),
            ("OPENAI_API_KEY", "sk-from-env"),
            ("CHATRELAY_CONTEXT_DIR", "/srv/context"),
        ]
        .into_iter()
        .collect();
        config.apply_env_overrides(|k| env.get(k).map(|v| v.to_string()));

        let (_, active) = config.active().unwrap();
        assert_eq!(active.model.as_deref(), Some("gpt-4.1"));
        assert_eq!(active.api_key.as_deref(), Some("sk-from-env"));
        assert_eq!(config.context_dir(), PathBuf::from("/srv/context"));
    }

    #[test]
    fn env_key_does_not_replace_configured_key() {
        let mut config = AppConfig::default();
        config.providers.get_mut("openai").unwrap().api_key = Some("sk-file".into());
        config.apply_env_overrides(|k| (k == "CHATRELAY_API_KEY").then(|| "sk-env".to_string()));
        assert_eq!(config.providers["openai"].api_key.as_deref(), Some("sk-file"));
    }

    #[test]
    fn debug_redacts_api_keys() {
        let mut config = AppConfig::default();
        config.providers.get_mut("openai").unwrap().api_key = Some("sk-secret-123".into());
        let debug = format!("{config:?}");
        assert!(!debug.contains("sk-secret-123"));
        assert!(debug.contains("[REDACTED]"));
    }

    #[test]
    fn default_toml_generation() {
        let toml_str = AppConfig::default_toml();
        assert!(toml_str.contains("active_provider"));
        assert!(toml_str.contains("chat-completions"));
    }
}
