//! Error types for the Colloquy domain.
//!
//! Uses `thiserror` for ergonomic error definitions.
//! Each bounded context has its own error enum; [`PipelineError`] wraps them
//! all and is what the advisor chain propagates.

use thiserror::Error;

/// The top-level error type for a pipeline execution.
#[derive(Debug, Error)]
pub enum PipelineError {
    // --- Model errors ---
    #[error("Model invocation error: {0}")]
    Model(#[from] ModelError),

    // --- Retrieval errors ---
    #[error("Retrieval error: {0}")]
    Retrieval(#[from] RetrievalError),

    // --- Tool errors ---
    #[error("Tool invocation error: {0}")]
    Tool(#[from] ToolError),

    // --- Memory errors ---
    #[error("Memory store error: {0}")]
    Memory(#[from] MemoryStoreError),

    // --- Configuration errors ---
    #[error("Configuration error: {0}")]
    Configuration(#[from] ConfigurationError),

    // --- Evaluation errors ---
    #[error("Evaluation error: {0}")]
    Evaluation(#[from] EvaluationError),

    /// The inbound request's cancellation token fired.
    #[error("Request cancelled")]
    Cancelled,

    // --- Serialization ---
    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    // --- Generic ---
    #[error("Internal error: {0}")]
    Internal(String),
}

impl PipelineError {
    /// Whether this error is a timeout of some collaborator call.
    pub fn is_timeout(&self) -> bool {
        matches!(
            self,
            Self::Model(ModelError::Timeout(_))
                | Self::Retrieval(RetrievalError::Timeout { .. })
                | Self::Tool(ToolError::Timeout { .. })
                | Self::Memory(MemoryStoreError::Timeout { .. })
        )
    }
}

/// Result type alias using [`PipelineError`].
pub type Result<T> = std::result::Result<T, PipelineError>;

// --- Bounded context errors ---

#[derive(Debug, Clone, Error)]
pub enum ModelError {
    #[error("API request failed: {message} (status: {status_code})")]
    ApiError { status_code: u16, message: String },

    #[error("Rate limited by model service, retry after {retry_after_secs}s")]
    RateLimited { retry_after_secs: u64 },

    #[error("Authentication failed: {0}")]
    AuthenticationFailed(String),

    #[error("Model not found: {0}")]
    ModelNotFound(String),

    #[error("Stream interrupted: {0}")]
    StreamInterrupted(String),

    #[error("Model service not configured: {0}")]
    NotConfigured(String),

    #[error("Model call timed out: {0}")]
    Timeout(String),

    #[error("Network error: {0}")]
    Network(String),

    #[error("Invalid response from model service: {0}")]
    InvalidResponse(String),
}

#[derive(Debug, Clone, Error)]
pub enum RetrievalError {
    #[error("Vector index unavailable: {0}")]
    Unavailable(String),

    #[error("Vector index query failed: {0}")]
    QueryFailed(String),

    #[error("Vector index query timed out after {timeout_ms}ms")]
    Timeout { timeout_ms: u64 },
}

#[derive(Debug, Clone, Error)]
pub enum ToolError {
    #[error("Tool not found: {0}")]
    NotFound(String),

    #[error("Tool execution failed: {tool_name}: {reason}")]
    ExecutionFailed { tool_name: String, reason: String },

    #[error("Invalid arguments for {tool_name}: {reason}")]
    InvalidArguments { tool_name: String, reason: String },

    #[error("Tool {tool_name} requires call context key '{key}'")]
    MissingContext { tool_name: String, key: String },

    #[error("Tool timed out: {tool_name} after {timeout_ms}ms")]
    Timeout { tool_name: String, timeout_ms: u64 },

    #[error("Tool call round limit exceeded: model still requested tools after {max_rounds} extra round(s)")]
    RoundLimitExceeded { max_rounds: u32 },
}

#[derive(Debug, Clone, Error)]
pub enum MemoryStoreError {
    #[error("Conversation store unavailable: {0}")]
    Unavailable(String),

    #[error("Storage error: {0}")]
    Storage(String),

    #[error("Stored history is corrupted: {0}")]
    Corrupted(String),

    #[error("Migration failed: {0}")]
    MigrationFailed(String),

    #[error("Memory operation on {conversation_id} timed out after {timeout_ms}ms")]
    Timeout {
        conversation_id: String,
        timeout_ms: u64,
    },
}

#[derive(Debug, Clone, Error)]
pub enum ConfigurationError {
    #[error("Tool registered twice: {0}")]
    DuplicateTool(String),

    #[error("Invalid input schema for tool {tool_name}: {reason}")]
    InvalidToolSchema { tool_name: String, reason: String },

    #[error("Unknown advisor: {0}")]
    UnknownAdvisor(String),

    #[error("Advisor listed twice in chain: {0}")]
    DuplicateAdvisor(String),

    #[error("{0}")]
    Invalid(String),
}

#[derive(Debug, Clone, Error)]
pub enum EvaluationError {
    #[error("Evaluator model call failed: {0}")]
    Model(#[from] ModelError),

    #[error("Evaluator returned an unrecognised verdict: {0}")]
    Unparseable(String),

    #[error("Evaluator gave no verdict within {timeout_ms}ms")]
    Timeout { timeout_ms: u64 },
}

/// An answer that the evaluator rejected.
///
/// Only the retry wrapper produces and consumes this; it never escapes to
/// the caller.
#[derive(Debug, Clone, Error)]
#[error("Answer rejected on attempt {attempt}: {}", rationale.as_deref().unwrap_or("no rationale"))]
pub struct ValidationFailure {
    pub attempt: u32,
    pub rationale: Option<String>,
}
