//! Configuration loading, validation, and management for conclave.
//!
//! Loads configuration from `~/.conclave/config.toml` with environment
//! variable overrides. Validates all settings at startup.

use conclave_core::participant::{ModelBinding, Participant, ParticipantRole};
use conclave_core::session::SpeakingMode;
use serde::{Deserialize, Serialize};
use std::collections::{HashMap, HashSet};
use std::path::{Path, PathBuf};
use std::time::Duration;

/// The root configuration structure.
///
/// Maps directly to `~/.conclave/config.toml`.
#[derive(Clone, Serialize, Deserialize)]
pub struct AppConfig {
    /// API key (can be overridden per-provider)
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub api_key: Option<String>,

    /// Default LLM provider
    #[serde(default = "default_provider")]
    pub default_provider: String,

    /// Default model for participants that don't name one
    #[serde(default = "default_model")]
    pub default_model: String,

    /// Default temperature
    #[serde(default = "default_temperature")]
    pub default_temperature: f32,

    /// Loop, timeout, and streaming limits
    #[serde(default)]
    pub orchestration: OrchestrationConfig,

    /// Provider-specific configurations
    #[serde(default)]
    pub providers: HashMap<String, ProviderConfig>,

    /// Stdio plugins exposed to participants as tools
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub plugins: Vec<PluginConfig>,

    /// Predefined sessions
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub sessions: Vec<SessionConfig>,
}

fn default_provider() -> String {
    "openrouter".into()
}
fn default_model() -> String {
    "anthropic/claude-sonnet-4".into()
}
fn default_temperature() -> f32 {
    0.7
}
fn default_true() -> bool {
    true
}

/// Redact a secret string for Debug output.
fn redact(s: &Option<String>) -> &'static str {
    match s {
        Some(_) => "[REDACTED]",
        None => "None",
    }
}

impl std::fmt::Debug for AppConfig {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AppConfig")
            .field("api_key", &redact(&self.api_key))
            .field("default_provider", &self.default_provider)
            .field("default_model", &self.default_model)
            .field("default_temperature", &self.default_temperature)
            .field("orchestration", &self.orchestration)
            .field("providers", &self.providers)
            .field("plugins", &self.plugins)
            .field("sessions", &self.sessions)
            .finish()
    }
}

impl std::fmt::Debug for ProviderConfig {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ProviderConfig")
            .field("api_key", &redact(&self.api_key))
            .field("api_url", &self.api_url)
            .field("default_model", &self.default_model)
            .finish()
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OrchestrationConfig {
    /// Model rounds per loop run before the turn is cut off
    #[serde(default = "default_max_iterations")]
    pub max_iterations: u32,

    /// Timeout for a single completion call, distinct from cancellation
    #[serde(default = "default_model_timeout_secs")]
    pub model_timeout_secs: u64,

    /// Minimum gap between render notifications for one participant
    #[serde(default = "default_stream_throttle_ms")]
    pub stream_throttle_ms: u64,
}

fn default_max_iterations() -> u32 {
    10
}
fn default_model_timeout_secs() -> u64 {
    300
}
fn default_stream_throttle_ms() -> u64 {
    150
}

impl OrchestrationConfig {
    pub fn model_timeout(&self) -> Duration {
        Duration::from_secs(self.model_timeout_secs)
    }

    pub fn stream_throttle(&self) -> Duration {
        Duration::from_millis(self.stream_throttle_ms)
    }
}

impl Default for OrchestrationConfig {
    fn default() -> Self {
        Self {
            max_iterations: default_max_iterations(),
            model_timeout_secs: default_model_timeout_secs(),
            stream_throttle_ms: default_stream_throttle_ms(),
        }
    }
}

#[derive(Clone, Serialize, Deserialize)]
pub struct ProviderConfig {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub api_key: Option<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub api_url: Option<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub default_model: Option<String>,
}

/// A tool backed by an external program speaking JSON over stdio.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PluginConfig {
    pub name: String,

    #[serde(default)]
    pub description: String,

    pub command: String,

    #[serde(default)]
    pub args: Vec<String>,

    /// Working directory for the plugin process
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub working_dir: Option<PathBuf>,

    #[serde(default = "default_true")]
    pub enabled: bool,
}

/// Idle-timeout behavior for a session.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FlowLockConfig {
    #[serde(default)]
    pub enabled: bool,

    #[serde(default = "default_cooldown_ms")]
    pub cooldown_ms: u64,

    /// Prompt handed to the participant chosen when the timer fires
    #[serde(default = "default_trigger_prompt")]
    pub trigger_prompt: String,
}

fn default_cooldown_ms() -> u64 {
    30_000
}
fn default_trigger_prompt() -> String {
    "The conversation has gone quiet. Pick up the thread: add something new, \
     ask the others a question, or move the discussion forward."
        .into()
}

impl FlowLockConfig {
    pub fn cooldown(&self) -> Duration {
        Duration::from_millis(self.cooldown_ms)
    }
}

impl Default for FlowLockConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            cooldown_ms: default_cooldown_ms(),
            trigger_prompt: default_trigger_prompt(),
        }
    }
}

/// A predefined session.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SessionConfig {
    pub name: String,

    #[serde(default)]
    pub speaking_mode: SpeakingMode,

    #[serde(default)]
    pub flow_lock: FlowLockConfig,

    #[serde(default)]
    pub participants: Vec<ParticipantConfig>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ParticipantConfig {
    pub id: String,

    /// Defaults to `id`
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub display_name: Option<String>,

    #[serde(default)]
    pub role: ParticipantRole,

    /// Defaults to the top-level `default_model`
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub model: Option<String>,

    /// Defaults to the top-level `default_provider`
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub provider: Option<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub temperature: Option<f32>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub max_tokens: Option<u32>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub system_prompt: Option<String>,

    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub tags: Vec<String>,

    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub keywords: Vec<String>,
}

impl AppConfig {
    /// Load configuration from the default path (~/.conclave/config.toml).
    ///
    /// Also checks environment variables for API keys:
    /// - `CONCLAVE_API_KEY` (highest priority)
    /// - `OPENROUTER_API_KEY`
    /// - `OPENAI_API_KEY`
    pub fn load() -> Result<Self, ConfigError> {
        let config_path = Self::config_dir().join("config.toml");
        let mut config = Self::load_from(&config_path)?;
        config.apply_env_overrides();
        Ok(config)
    }

    fn apply_env_overrides(&mut self) {
        if self.api_key.is_none() {
            self.api_key = std::env::var("CONCLAVE_API_KEY")
                .ok()
                .or_else(|| std::env::var("OPENROUTER_API_KEY").ok())
                .or_else(|| std::env::var("OPENAI_API_KEY").ok());
        }

        if let Ok(provider) = std::env::var("CONCLAVE_PROVIDER") {
            self.default_provider = provider;
        }

        if let Ok(model) = std::env::var("CONCLAVE_MODEL") {
            self.default_model = model;
        }
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

        Self::from_toml_str(&content).map_err(|e| match e {
            ConfigError::ParseError { reason, .. } => ConfigError::ParseError {
                path: path.to_path_buf(),
                reason,
            },
            other => other,
        })
    }

    /// Parse and validate a TOML document.
    pub fn from_toml_str(content: &str) -> Result<Self, ConfigError> {
        let config: Self = toml::from_str(content).map_err(|e| ConfigError::ParseError {
            path: PathBuf::from("<inline>"),
            reason: e.to_string(),
        })?;
        config.validate()?;
        Ok(config)
    }

    /// Get the configuration directory path.
    pub fn config_dir() -> PathBuf {
        dirs_home().join(".conclave")
    }

    /// Default location for session transcripts.
    pub fn transcripts_dir() -> PathBuf {
        Self::config_dir().join("transcripts")
    }

    /// Validate the configuration.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if !(0.0..=2.0).contains(&self.default_temperature) {
            return Err(ConfigError::ValidationError(
                "default_temperature must be between 0.0 and 2.0".into(),
            ));
        }

        if self.orchestration.max_iterations == 0 {
            return Err(ConfigError::ValidationError(
                "orchestration.max_iterations must be at least 1".into(),
            ));
        }

        if self.orchestration.stream_throttle_ms == 0 {
            return Err(ConfigError::ValidationError(
                "orchestration.stream_throttle_ms must be at least 1".into(),
            ));
        }

        let mut plugin_names = HashSet::new();
        for plugin in &self.plugins {
            if !plugin_names.insert(plugin.name.as_str()) {
                return Err(ConfigError::ValidationError(format!(
                    "duplicate plugin name '{}'",
                    plugin.name
                )));
            }
        }

        for session in &self.sessions {
            session.validate()?;
        }

        Ok(())
    }

    /// Check if an API key is available (from config or environment).
    pub fn has_api_key(&self) -> bool {
        self.api_key.is_some()
    }

    /// Find a predefined session by name.
    pub fn session(&self, name: &str) -> Option<&SessionConfig> {
        self.sessions.iter().find(|s| s.name == name)
    }

    /// Resolve a session's participants, filling in defaults.
    pub fn participants_for(&self, session: &SessionConfig) -> Vec<Participant> {
        session
            .participants
            .iter()
            .map(|p| p.to_participant(&self.default_provider, &self.default_model, self.default_temperature))
            .collect()
    }

    /// Generate a default config TOML string (for `init` command).
    pub fn default_toml() -> String {
        let config = Self::starter();
        toml::to_string_pretty(&config).unwrap_or_default()
    }

    /// A small two-participant panel used by `init`.
    pub fn starter() -> Self {
        Self {
            sessions: vec![SessionConfig {
                name: "panel".into(),
                speaking_mode: SpeakingMode::Sequential,
                flow_lock: FlowLockConfig::default(),
                participants: vec![
                    ParticipantConfig::new("alice", "Alice", ParticipantRole::Host),
                    ParticipantConfig::new("bob", "Bob", ParticipantRole::Participant),
                ],
            }],
            ..Self::default()
        }
    }
}

impl Default for AppConfig {
    fn default() -> Self {
        Self {
            api_key: None,
            default_provider: default_provider(),
            default_model: default_model(),
            default_temperature: default_temperature(),
            orchestration: OrchestrationConfig::default(),
            providers: HashMap::new(),
            plugins: vec![],
            sessions: vec![],
        }
    }
}

impl SessionConfig {
    fn validate(&self) -> Result<(), ConfigError> {
        if self.flow_lock.cooldown_ms == 0 {
            return Err(ConfigError::ValidationError(format!(
                "session '{}': flow_lock.cooldown_ms must be at least 1",
                self.name
            )));
        }

        let mut ids = HashSet::new();
        for participant in &self.participants {
            if participant.id.trim().is_empty() {
                return Err(ConfigError::ValidationError(format!(
                    "session '{}': participant id must not be empty",
                    self.name
                )));
            }
            if !ids.insert(participant.id.as_str()) {
                return Err(ConfigError::ValidationError(format!(
                    "session '{}': duplicate participant id '{}'",
                    self.name, participant.id
                )));
            }
            if let Some(t) = participant.temperature {
                if !(0.0..=2.0).contains(&t) {
                    return Err(ConfigError::ValidationError(format!(
                        "session '{}': temperature for '{}' must be between 0.0 and 2.0",
                        self.name, participant.id
                    )));
                }
            }
        }

        Ok(())
    }
}

impl ParticipantConfig {
    pub fn new(id: &str, display_name: &str, role: ParticipantRole) -> Self {
        Self {
            id: id.into(),
            display_name: Some(display_name.into()),
            role,
            model: None,
            provider: None,
            temperature: None,
            max_tokens: None,
            system_prompt: None,
            tags: vec![],
            keywords: vec![],
        }
    }

    pub fn to_participant(
        &self,
        default_provider: &str,
        default_model: &str,
        default_temperature: f32,
    ) -> Participant {
        let mut binding = ModelBinding::new(self.model.as_deref().unwrap_or(default_model))
            .with_provider(self.provider.as_deref().unwrap_or(default_provider));
        binding.temperature = self.temperature.unwrap_or(default_temperature);
        binding.max_tokens = self.max_tokens;

        let mut participant = Participant::new(
            &self.id,
            self.display_name.as_deref().unwrap_or(&self.id),
        )
        .with_role(self.role)
        .with_model(binding)
        .with_tags(self.tags.iter().cloned())
        .with_keywords(self.keywords.iter().cloned());

        if let Some(prompt) = &self.system_prompt {
            participant = participant.with_system_prompt(prompt);
        }
        participant
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

impl From<ConfigError> for conclave_core::Error {
    fn from(e: ConfigError) -> Self {
        conclave_core::Error::Config {
            message: e.to_string(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use conclave_core::participant::ParticipantRole;

    const PANEL: &str = r#"
default_provider = "openrouter"
default_model = "openai/gpt-4o"

[orchestration]
max_iterations = 4
stream_throttle_ms = 50

[[plugins]]
name = "HelloWorld"
description = "Greets someone"
command = "python"
args = ["plugins/HelloWorld/main.py"]

[[sessions]]
name = "panel"
speaking_mode = "weighted-random"

[sessions.flow_lock]
enabled = true
cooldown_ms = 15000

[[sessions.participants]]
id = "alice"
display_name = "Alice"
role = "host"
model = "anthropic/claude-sonnet-4"
tags = ["rust", "compilers"]

[[sessions.participants]]
id = "bob"
keywords = ["database"]
temperature = 0.2
"#;

    #[test]
    fn default_config_is_valid() {
        let config = AppConfig::default();
        assert_eq!(config.default_provider, "openrouter");
        assert_eq!(config.orchestration.max_iterations, 10);
        assert_eq!(config.orchestration.stream_throttle_ms, 150);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn config_roundtrip_toml() {
        let config = AppConfig::starter();
        let toml_str = toml::to_string_pretty(&config).unwrap();
        let parsed: AppConfig = toml::from_str(&toml_str).unwrap();
        assert_eq!(parsed.default_provider, config.default_provider);
        assert_eq!(parsed.sessions.len(), 1);
        assert_eq!(parsed.sessions[0].participants[0].role, ParticipantRole::Host);
    }

    #[test]
    fn invalid_temperature_rejected() {
        let config = AppConfig {
            default_temperature: 5.0,
            ..AppConfig::default()
        };
        assert!(config.validate().is_err());
    }

    #[test]
    fn zero_iterations_rejected() {
        let mut config = AppConfig::default();
        config.orchestration.max_iterations = 0;
        assert!(config.validate().is_err());
    }

    #[test]
    fn missing_config_file_returns_defaults() {
        let config = AppConfig::load_from(Path::new("/nonexistent/config.toml")).unwrap();
        assert_eq!(config.default_provider, "openrouter");
    }

    #[test]
    fn load_from_reads_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("config.toml");
        std::fs::write(&path, PANEL).unwrap();

        let config = AppConfig::load_from(&path).unwrap();
        assert_eq!(config.orchestration.max_iterations, 4);
        assert_eq!(config.orchestration.model_timeout_secs, 300);
        assert_eq!(config.plugins[0].args, vec!["plugins/HelloWorld/main.py"]);
    }

    #[test]
    fn parse_error_reports_path() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("config.toml");
        std::fs::write(&path, "default_model = [").unwrap();

        let err = AppConfig::load_from(&path).unwrap_err();
        assert!(err.to_string().contains("config.toml"));
    }

    #[test]
    fn session_config_parsing() {
        let config = AppConfig::from_toml_str(PANEL).unwrap();
        let session = config.session("panel").unwrap();
        assert_eq!(session.speaking_mode, SpeakingMode::WeightedRandom);
        assert!(session.flow_lock.enabled);
        assert_eq!(session.flow_lock.cooldown(), Duration::from_secs(15));
        assert!(!session.flow_lock.trigger_prompt.is_empty());
    }

    #[test]
    fn participants_fill_in_defaults() {
        let config = AppConfig::from_toml_str(PANEL).unwrap();
        let participants = config.participants_for(config.session("panel").unwrap());

        let alice = &participants[0];
        assert_eq!(alice.display_name, "Alice");
        assert_eq!(alice.role, ParticipantRole::Host);
        let binding = alice.model.as_ref().unwrap();
        assert_eq!(binding.model, "anthropic/claude-sonnet-4");
        assert_eq!(binding.provider.as_deref(), Some("openrouter"));

        let bob = &participants[1];
        assert_eq!(bob.display_name, "bob");
        assert_eq!(bob.role, ParticipantRole::Participant);
        let binding = bob.model.as_ref().unwrap();
        assert_eq!(binding.model, "openai/gpt-4o");
        assert!((binding.temperature - 0.2).abs() < f32::EPSILON);
        assert_eq!(bob.keywords, vec!["database"]);
    }

    #[test]
    fn duplicate_participant_ids_rejected() {
        let toml_str = r#"
[[sessions]]
name = "dup"
[[sessions.participants]]
id = "alice"
[[sessions.participants]]
id = "alice"
"#;
        let err = AppConfig::from_toml_str(toml_str).unwrap_err();
        assert!(err.to_string().contains("duplicate participant id"));
    }

    #[test]
    fn zero_cooldown_rejected() {
        let toml_str = r#"
[[sessions]]
name = "hasty"
[sessions.flow_lock]
cooldown_ms = 0
"#;
        assert!(AppConfig::from_toml_str(toml_str).is_err());
    }

    #[test]
    fn debug_output_redacts_keys() {
        let mut config = AppConfig {
            api_key: Some("sk-secret".into()),
            ..AppConfig::default()
        };
        config.providers.insert(
            "openai".into(),
            ProviderConfig {
                api_key: Some("sk-other".into()),
                api_url: None,
                default_model: None,
            },
        );
        let debug = format!("{config:?}");
        assert!(!debug.contains("sk-secret"));
        assert!(!debug.contains("sk-other"));
        assert!(debug.contains("[REDACTED]"));
    }

    #[test]
    fn default_toml_generation() {
        let toml_str = AppConfig::default_toml();
        assert!(toml_str.contains("openrouter"));
        assert!(toml_str.contains("alice"));
        assert!(AppConfig::from_toml_str(&toml_str).is_ok());
    }
}
