//! Configuration loading, validation, and management for Stepweave.
//!
//! Loads configuration from `~/.stepweave/config.toml` with environment
//! variable overrides. Validates all settings at startup.

use serde::{Deserialize, Serialize};
use std::collections::{HashMap, HashSet};
use std::path::{Path, PathBuf};

/// The root configuration structure.
///
/// Maps directly to `~/.stepweave/config.toml`.
#[derive(Clone, Default, Serialize, Deserialize)]
pub struct AppConfig {
    /// API key for the default model endpoint
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub api_key: Option<String>,

    /// Agent loop settings
    #[serde(default)]
    pub agent: AgentConfig,

    /// Tool execution and provider settings
    #[serde(default)]
    pub tools: ToolsConfig,

    /// Model routing
    #[serde(default)]
    pub models: ModelsConfig,

    /// HTTP gateway, users and entitlements
    #[serde(default)]
    pub gateway: GatewayConfig,

    /// Resumable stream settings
    #[serde(default)]
    pub resumable: ResumableConfig,
}

/// Redact a secret for Debug output.
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
            .field("agent", &self.agent)
            .field("tools", &self.tools)
            .field("models", &self.models)
            .field("gateway", &self.gateway)
            .field("resumable", &self.resumable)
            .finish()
    }
}

// ── Agent ──

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AgentConfig {
    /// Upper bound on model invocations per request
    #[serde(default = "default_max_steps")]
    pub max_steps: usize,

    /// Whole-run deadline
    #[serde(default = "default_run_timeout_secs")]
    pub run_timeout_secs: u64,

    /// Thinking budget for reasoning-capable models
    #[serde(default = "default_reasoning_budget_tokens")]
    pub reasoning_budget_tokens: u32,

    #[serde(default = "default_system_prompt")]
    pub system_prompt: String,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub temperature: Option<f32>,
}

fn default_max_steps() -> usize {
    20
}
fn default_run_timeout_secs() -> u64 {
    300
}
fn default_reasoning_budget_tokens() -> u32 {
    10_000
}
fn default_system_prompt() -> String {
    "You are a friendly assistant. Keep your responses concise and helpful. \
     Use the available tools when they help answer the request."
        .into()
}

impl Default for AgentConfig {
    fn default() -> Self {
        Self {
            max_steps: default_max_steps(),
            run_timeout_secs: default_run_timeout_secs(),
            reasoning_budget_tokens: default_reasoning_budget_tokens(),
            system_prompt: default_system_prompt(),
            temperature: None,
        }
    }
}

// ── Tools ──

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ToolsConfig {
    /// Per-call deadline applied by the isolation wrapper
    #[serde(default = "default_call_timeout_secs")]
    pub call_timeout_secs: u64,

    /// Keep initialised providers for the lifetime of the process
    #[serde(default = "default_true")]
    pub cache_providers: bool,

    /// Tool names whose calls wait for user approval
    #[serde(default)]
    pub require_approval: Vec<String>,

    /// Register the built-in document tools
    #[serde(default = "default_true")]
    pub documents: bool,

    /// Subprocess-backed tool providers
    #[serde(default)]
    pub providers: Vec<ProcessProviderConfig>,
}

fn default_call_timeout_secs() -> u64 {
    90
}
fn default_true() -> bool {
    true
}

impl Default for ToolsConfig {
    fn default() -> Self {
        Self {
            call_timeout_secs: default_call_timeout_secs(),
            cache_providers: true,
            require_approval: Vec::new(),
            documents: true,
            providers: Vec::new(),
        }
    }
}

/// A tool server started as a child process, speaking line-delimited
/// JSON-RPC over stdio.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProcessProviderConfig {
    pub name: String,
    pub command: String,

    #[serde(default)]
    pub args: Vec<String>,

    /// Extra environment for the child
    #[serde(default)]
    pub env: HashMap<String, String>,

    /// The provider contributes no tools unless all of these are set
    #[serde(default)]
    pub required_env: Vec<String>,
}

// ── Models ──

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ModelsConfig {
    /// Model used when a request does not name one
    #[serde(default = "default_model")]
    pub default_model: String,

    /// Model used by the document tools
    #[serde(default = "default_model")]
    pub artifact_model: String,

    /// Endpoint serving every model id without a dedicated prefix route
    #[serde(default = "default_endpoint")]
    pub default_endpoint: EndpointConfig,

    /// Prefix routes, e.g. `deepseek` serves `deepseek/*` with the prefix stripped
    #[serde(default = "default_endpoints")]
    pub endpoints: HashMap<String, EndpointConfig>,
}

fn default_model() -> String {
    "openai/gpt-4o-mini".into()
}
fn default_endpoint() -> EndpointConfig {
    EndpointConfig {
        api_url: "https://openrouter.ai/api/v1".into(),
        api_key: None,
    }
}
fn default_endpoints() -> HashMap<String, EndpointConfig> {
    HashMap::from([(
        "deepseek".to_string(),
        EndpointConfig {
            api_url: "https://api.deepseek.com/v1".into(),
            api_key: None,
        },
    )])
}

impl Default for ModelsConfig {
    fn default() -> Self {
        Self {
            default_model: default_model(),
            artifact_model: default_model(),
            default_endpoint: default_endpoint(),
            endpoints: default_endpoints(),
        }
    }
}

/// An OpenAI-compatible chat completions endpoint.
#[derive(Clone, Serialize, Deserialize)]
pub struct EndpointConfig {
    pub api_url: String,

    /// Falls back to the top-level `api_key`
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub api_key: Option<String>,
}

impl std::fmt::Debug for EndpointConfig {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EndpointConfig")
            .field("api_url", &self.api_url)
            .field("api_key", &redact(&self.api_key))
            .finish()
    }
}

// ── Gateway ──

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GatewayConfig {
    #[serde(default = "default_port")]
    pub port: u16,

    #[serde(default = "default_host")]
    pub host: String,

    /// Bearer tokens accepted by the gateway
    #[serde(default)]
    pub users: Vec<UserConfig>,

    #[serde(default)]
    pub entitlements: Entitlements,
}

fn default_port() -> u16 {
    42618
}
fn default_host() -> String {
    "127.0.0.1".into()
}

impl Default for GatewayConfig {
    fn default() -> Self {
        Self {
            port: default_port(),
            host: default_host(),
            users: Vec::new(),
            entitlements: Entitlements::default(),
        }
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum UserType {
    Guest,
    #[default]
    Regular,
}

#[derive(Clone, Serialize, Deserialize)]
pub struct UserConfig {
    pub token: String,
    pub user_id: String,

    #[serde(default)]
    pub user_type: UserType,
}

impl std::fmt::Debug for UserConfig {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("UserConfig")
            .field("token", &"[REDACTED]")
            .field("user_id", &self.user_id)
            .field("user_type", &self.user_type)
            .finish()
    }
}

/// Daily message allowance per user type.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Entitlements {
    #[serde(default = "default_guest_messages")]
    pub guest_messages_per_day: usize,

    #[serde(default = "default_regular_messages")]
    pub regular_messages_per_day: usize,
}

fn default_guest_messages() -> usize {
    20
}
fn default_regular_messages() -> usize {
    100
}

impl Entitlements {
    pub fn max_messages_per_day(&self, user_type: UserType) -> usize {
        match user_type {
            UserType::Guest => self.guest_messages_per_day,
            UserType::Regular => self.regular_messages_per_day,
        }
    }
}

impl Default for Entitlements {
    fn default() -> Self {
        Self {
            guest_messages_per_day: default_guest_messages(),
            regular_messages_per_day: default_regular_messages(),
        }
    }
}

// ── Resumable streams ──

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ResumableConfig {
    #[serde(default = "default_true")]
    pub enabled: bool,

    /// How long a finished stream stays available to reconnecting clients
    #[serde(default = "default_retention_secs")]
    pub retention_secs: u64,
}

fn default_retention_secs() -> u64 {
    300
}

impl Default for ResumableConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            retention_secs: default_retention_secs(),
        }
    }
}

impl AppConfig {
    /// Load configuration from the default path with environment overrides.
    ///
    /// Priority: env vars > config file > defaults
    pub fn load() -> Result<Self, ConfigError> {
        let config_path = Self::config_dir().join("config.toml");
        let mut config = Self::load_from(&config_path)?;

        if config.api_key.is_none() {
            config.api_key = std::env::var("STEPWEAVE_API_KEY")
                .ok()
                .or_else(|| std::env::var("OPENAI_API_KEY").ok());
        }

        if let Ok(model) = std::env::var("STEPWEAVE_MODEL") {
            config.models.default_model = model;
        }

        if let Ok(port) = std::env::var("STEPWEAVE_PORT") {
            config.gateway.port = port.parse().map_err(|_| {
                ConfigError::ValidationError(format!("STEPWEAVE_PORT is not a port: {port}"))
            })?;
        }

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

    /// Get the configuration directory path.
    pub fn config_dir() -> PathBuf {
        dirs_home().join(".stepweave")
    }

    /// Validate the configuration.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.agent.max_steps == 0 {
            return Err(ConfigError::ValidationError(
                "agent.max_steps must be at least 1".into(),
            ));
        }
        if self.agent.run_timeout_secs == 0 || self.tools.call_timeout_secs == 0 {
            return Err(ConfigError::ValidationError(
                "agent.run_timeout_secs and tools.call_timeout_secs must be > 0".into(),
            ));
        }
        if let Some(t) = self.agent.temperature
            && !(0.0..=2.0).contains(&t)
        {
            return Err(ConfigError::ValidationError(
                "agent.temperature must be between 0.0 and 2.0".into(),
            ));
        }

        let mut names = HashSet::new();
        for provider in &self.tools.providers {
            if provider.name.is_empty() || provider.command.is_empty() {
                return Err(ConfigError::ValidationError(
                    "tools.providers entries need a name and a command".into(),
                ));
            }
            if !names.insert(provider.name.as_str()) {
                return Err(ConfigError::ValidationError(format!(
                    "duplicate tool provider name: {}",
                    provider.name
                )));
            }
        }

        let mut tokens = HashSet::new();
        for user in &self.gateway.users {
            if user.token.is_empty() || user.user_id.is_empty() {
                return Err(ConfigError::ValidationError(
                    "gateway.users entries need a token and a user_id".into(),
                ));
            }
            if !tokens.insert(user.token.as_str()) {
                return Err(ConfigError::ValidationError(format!(
                    "duplicate gateway token for user {}",
                    user.user_id
                )));
            }
        }

        Ok(())
    }

    /// Check if an API key is available (from config or environment).
    pub fn has_api_key(&self) -> bool {
        self.api_key.is_some()
    }

    /// Generate a default config TOML string (for `config --default`).
    pub fn default_toml() -> String {
        let config = Self::default();
        toml::to_string_pretty(&config).unwrap_or_default()
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
