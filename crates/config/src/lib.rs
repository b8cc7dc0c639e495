//! Configuration loading, validation, and management for Colloquy.
//!
//! Loads configuration from `~/.colloquy/config.toml` with environment
//! variable overrides. Validates all settings at startup.

use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

/// The root configuration structure.
///
/// Maps directly to `~/.colloquy/config.toml`.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct AppConfig {
    /// Model service connection
    #[serde(default)]
    pub model: ModelConfig,

    /// Conversation memory
    #[serde(default)]
    pub memory: MemoryConfig,

    /// Retrieval augmentation
    #[serde(default)]
    pub retrieval: RetrievalConfig,

    /// Tool dispatch
    #[serde(default)]
    pub tools: ToolsConfig,

    /// Answer validation and retries
    #[serde(default)]
    pub validation: ValidationConfig,

    /// Advisor chain layout
    #[serde(default)]
    pub pipeline: PipelineConfig,
}

// --- model ---

#[derive(Clone, Serialize, Deserialize)]
pub struct ModelConfig {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub api_key: Option<String>,

    #[serde(default = "default_base_url")]
    pub base_url: String,

    #[serde(default = "default_model")]
    pub model: String,

    #[serde(default = "default_embedding_model")]
    pub embedding_model: String,

    #[serde(default = "default_temperature")]
    pub temperature: f32,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub max_tokens: Option<u32>,

    /// Per model call
    #[serde(default = "default_model_timeout_secs")]
    pub timeout_secs: u64,
}

fn default_base_url() -> String {
    "https://api.openai.com/v1".into()
}
fn default_model() -> String {
    "gpt-4o-mini".into()
}
fn default_embedding_model() -> String {
    "text-embedding-3-small".into()
}
fn default_temperature() -> f32 {
    0.7
}
fn default_model_timeout_secs() -> u64 {
    60
}

impl Default for ModelConfig {
    fn default() -> Self {
        Self {
            api_key: None,
            base_url: default_base_url(),
            model: default_model(),
            embedding_model: default_embedding_model(),
            temperature: default_temperature(),
            max_tokens: None,
            timeout_secs: default_model_timeout_secs(),
        }
    }
}

/// Hide secrets in Debug output.
fn redact(s: &Option<String>) -> &'static str {
    match s {
        Some(_) => "[REDACTED]",
        None => "None",
    }
}

impl std::fmt::Debug for ModelConfig {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ModelConfig")
            .field("api_key", &redact(&self.api_key))
            .field("base_url", &self.base_url)
            .field("model", &self.model)
            .field("embedding_model", &self.embedding_model)
            .field("temperature", &self.temperature)
            .field("max_tokens", &self.max_tokens)
            .field("timeout_secs", &self.timeout_secs)
            .finish()
    }
}

// --- memory ---

/// Where conversation histories are kept.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MemoryBackendKind {
    /// Process-local, lost on exit
    #[default]
    Memory,
    /// One JSON file per conversation
    File,
    /// SQLite database (requires the `sqlite` feature)
    Sqlite,
}

/// What to do when the conversation store fails.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MemoryFailurePolicy {
    #[default]
    Abort,
    /// Log and continue without history
    Proceed,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MemoryConfig {
    #[serde(default)]
    pub backend: MemoryBackendKind,

    /// Messages kept per conversation
    #[serde(default = "default_window")]
    pub window: usize,

    /// Directory (file backend) or database file (sqlite backend).
    /// Defaults under the config directory.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub path: Option<PathBuf>,

    #[serde(default = "default_memory_timeout_ms")]
    pub timeout_ms: u64,

    #[serde(default)]
    pub on_failure: MemoryFailurePolicy,
}

fn default_window() -> usize {
    colloquy_core::memory::DEFAULT_WINDOW
}
fn default_memory_timeout_ms() -> u64 {
    5_000
}

impl Default for MemoryConfig {
    fn default() -> Self {
        Self {
            backend: MemoryBackendKind::default(),
            window: default_window(),
            path: None,
            timeout_ms: default_memory_timeout_ms(),
            on_failure: MemoryFailurePolicy::default(),
        }
    }
}

impl MemoryConfig {
    /// The storage location, falling back to the config directory.
    pub fn resolved_path(&self) -> PathBuf {
        self.path.clone().unwrap_or_else(|| match self.backend {
            MemoryBackendKind::Sqlite => AppConfig::config_dir().join("conversations.db"),
            _ => AppConfig::config_dir().join("conversations"),
        })
    }
}

// --- retrieval ---

/// What to do when the vector index fails or times out.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RetrievalFailurePolicy {
    /// Proceed without augmentation
    #[default]
    Degrade,
    Abort,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RetrievalConfig {
    #[serde(default)]
    pub enabled: bool,

    #[serde(default = "default_top_k")]
    pub top_k: usize,

    #[serde(default = "default_similarity_threshold")]
    pub similarity_threshold: f32,

    #[serde(default = "default_retrieval_timeout_ms")]
    pub timeout_ms: u64,

    #[serde(default)]
    pub on_failure: RetrievalFailurePolicy,

    /// JSON file of pre-embedded documents for the in-memory index
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub documents_path: Option<PathBuf>,
}

fn default_top_k() -> usize {
    3
}
fn default_similarity_threshold() -> f32 {
    0.5
}
fn default_retrieval_timeout_ms() -> u64 {
    5_000
}

impl Default for RetrievalConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            top_k: default_top_k(),
            similarity_threshold: default_similarity_threshold(),
            timeout_ms: default_retrieval_timeout_ms(),
            on_failure: RetrievalFailurePolicy::default(),
            documents_path: None,
        }
    }
}

// --- tools ---

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ToolsConfig {
    /// Tool names to register; empty disables tool dispatch
    #[serde(default = "default_enabled_tools")]
    pub enabled: Vec<String>,

    /// Extra model rounds allowed after tool results
    #[serde(default = "default_max_rounds")]
    pub max_rounds: u32,

    /// Per tool invocation
    #[serde(default = "default_tool_timeout_ms")]
    pub timeout_ms: u64,
}

fn default_enabled_tools() -> Vec<String> {
    vec![
        "createTicket".into(),
        "getTicketStatus".into(),
        "getCurrentLocalTime".into(),
        "getCurrentTime".into(),
    ]
}
fn default_max_rounds() -> u32 {
    1
}
fn default_tool_timeout_ms() -> u64 {
    30_000
}

impl Default for ToolsConfig {
    fn default() -> Self {
        Self {
            enabled: default_enabled_tools(),
            max_rounds: default_max_rounds(),
            timeout_ms: default_tool_timeout_ms(),
        }
    }
}

// --- validation ---

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EvaluatorKind {
    #[default]
    FactChecking,
    Relevancy,
}

/// How an evaluator that cannot reach a verdict is treated.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EvaluatorErrorPolicy {
    #[default]
    Pass,
    Fail,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ValidationConfig {
    #[serde(default)]
    pub enabled: bool,

    #[serde(default)]
    pub evaluator: EvaluatorKind,

    #[serde(default = "default_max_attempts")]
    pub max_attempts: u32,

    #[serde(default)]
    pub on_evaluator_error: EvaluatorErrorPolicy,

    #[serde(default = "default_fallback_message")]
    pub fallback_message: String,

    /// Per-evaluation limit; expiry goes through `on_evaluator_error`
    #[serde(default = "default_evaluator_timeout_secs")]
    pub timeout_secs: u64,
}

fn default_max_attempts() -> u32 {
    3
}

fn default_evaluator_timeout_secs() -> u64 {
    30
}

/// Served when every attempt is rejected.
pub const DEFAULT_FALLBACK_MESSAGE: &str =
    "I'm sorry, I could not answer your question. Please try rephrasing it.";

fn default_fallback_message() -> String {
    DEFAULT_FALLBACK_MESSAGE.into()
}

impl Default for ValidationConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            evaluator: EvaluatorKind::default(),
            max_attempts: default_max_attempts(),
            on_evaluator_error: EvaluatorErrorPolicy::default(),
            fallback_message: default_fallback_message(),
            timeout_secs: default_evaluator_timeout_secs(),
        }
    }
}

// --- pipeline ---

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PipelineConfig {
    /// Advisor names, outermost first
    #[serde(default = "default_advisors")]
    pub advisors: Vec<String>,

    #[serde(default = "default_system_prompt")]
    pub system_prompt: String,
}

fn default_advisors() -> Vec<String> {
    vec![
        "logger".into(),
        "memory".into(),
        "retrieval".into(),
        "tool_dispatch".into(),
        "usage".into(),
    ]
}
fn default_system_prompt() -> String {
    "You are a helpful IT helpdesk assistant. Answer concisely, and use the \
     available tools when the user asks to open or check a support ticket."
        .into()
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self {
            advisors: default_advisors(),
            system_prompt: default_system_prompt(),
        }
    }
}

impl AppConfig {
    /// Load configuration from the default path (~/.colloquy/config.toml).
    ///
    /// Environment overrides:
    /// - `COLLOQUY_API_KEY` (highest priority), then `OPENAI_API_KEY`
    /// - `COLLOQUY_MODEL`
    /// - `COLLOQUY_BASE_URL`
    pub fn load() -> Result<Self, ConfigError> {
        Self::load_at(&Self::config_path())
    }

    /// Like [`load`](Self::load), from an explicit file.
    pub fn load_at(path: &Path) -> Result<Self, ConfigError> {
        let mut config = Self::load_from(path)?;
        config.apply_env(|key| std::env::var(key).ok());
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

    fn apply_env(&mut self, var: impl Fn(&str) -> Option<String>) {
        if let Some(key) = var("COLLOQUY_API_KEY") {
            self.model.api_key = Some(key);
        } else if self.model.api_key.is_none() {
            self.model.api_key = var("OPENAI_API_KEY");
        }

        if let Some(model) = var("COLLOQUY_MODEL") {
            self.model.model = model;
        }

        if let Some(url) = var("COLLOQUY_BASE_URL") {
            self.model.base_url = url;
        }
    }

    /// Get the configuration directory path.
    pub fn config_dir() -> PathBuf {
        dirs_home().join(".colloquy")
    }

    pub fn config_path() -> PathBuf {
        Self::config_dir().join("config.toml")
    }

    /// A copy safe to print: the API key is masked.
    pub fn redacted(&self) -> Self {
        let mut config = self.clone();
        if config.model.api_key.is_some() {
            config.model.api_key = Some("[REDACTED]".into());
        }
        config
    }

    /// Validate the configuration.
    pub fn validate(&self) -> Result<(), ConfigError> {
        let invalid = |msg: &str| Err(ConfigError::ValidationError(msg.into()));

        if !(0.0..=2.0).contains(&self.model.temperature) {
            return invalid("model.temperature must be between 0.0 and 2.0");
        }
        if self.model.timeout_secs == 0 {
            return invalid("model.timeout_secs must be > 0");
        }
        if self.memory.window == 0 {
            return invalid("memory.window must be >= 1");
        }
        if self.memory.timeout_ms == 0 {
            return invalid("memory.timeout_ms must be > 0");
        }
        if self.retrieval.top_k == 0 {
            return invalid("retrieval.top_k must be >= 1");
        }
        if !(0.0..=1.0).contains(&self.retrieval.similarity_threshold) {
            return invalid("retrieval.similarity_threshold must be between 0.0 and 1.0");
        }
        if self.retrieval.timeout_ms == 0 {
            return invalid("retrieval.timeout_ms must be > 0");
        }
        if self.tools.timeout_ms == 0 {
            return invalid("tools.timeout_ms must be > 0");
        }
        if self.validation.max_attempts == 0 {
            return invalid("validation.max_attempts must be >= 1");
        }
        if self.validation.timeout_secs == 0 {
            return invalid("validation.timeout_secs must be > 0");
        }
        if self.pipeline.advisors.iter().any(|a| a.trim().is_empty()) {
            return invalid("pipeline.advisors must not contain empty names");
        }

        Ok(())
    }

    /// Check if an API key is available (from config or environment).
    pub fn has_api_key(&self) -> bool {
        self.model.api_key.is_some()
    }

    /// Generate a default config TOML string (for `config init`).
    pub fn default_toml() -> String {
        toml::to_string_pretty(&Self::default()).unwrap_or_default()
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
