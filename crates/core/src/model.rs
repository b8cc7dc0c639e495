//! ChatModel trait: the abstraction over model services.
//!
//! A ChatModel knows how to send a conversation to a generative model and
//! get a reply back, either complete or as a stream of chunks.
//!
//! The pipeline never talks HTTP; the OpenAI-compatible implementation lives
//! in `colloquy-providers` and tests script their own.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use crate::error::ModelError;
use crate::message::{Message, ToolCallIntent};

/// Per-request model options.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ModelOptions {
    /// Override the service's default model
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub model: Option<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub temperature: Option<f32>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub max_tokens: Option<u32>,
}

/// One request to the model service.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ModelRequest {
    /// The conversation messages, system prompt first
    pub messages: Vec<Message>,

    /// Tools the model may call
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub tools: Vec<ToolDefinition>,

    #[serde(default)]
    pub options: ModelOptions,
}

impl ModelRequest {
    pub fn new(messages: Vec<Message>) -> Self {
        Self {
            messages,
            tools: Vec::new(),
            options: ModelOptions::default(),
        }
    }
}

/// A tool definition sent to the model so it knows what it may call.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ToolDefinition {
    pub name: String,
    pub description: String,

    /// JSON Schema describing the tool's parameters
    pub parameters: serde_json::Value,
}

/// A complete (non-streaming) model reply.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ModelResponse {
    /// The generated assistant message, possibly carrying tool intents
    pub message: Message,

    /// Token usage as reported by the service, if it reported any
    pub usage: Option<Usage>,

    /// Which model actually responded
    #[serde(default)]
    pub model: String,
}

impl ModelResponse {
    pub fn tool_calls(&self) -> &[ToolCallIntent] {
        self.message.tool_calls()
    }
}

/// Token usage for one model invocation.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Usage {
    pub prompt_tokens: u32,
    pub completion_tokens: u32,
    pub total_tokens: u32,
}

impl Usage {
    pub fn add(&mut self, other: &Usage) {
        self.prompt_tokens = self.prompt_tokens.saturating_add(other.prompt_tokens);
        self.completion_tokens = self.completion_tokens.saturating_add(other.completion_tokens);
        self.total_tokens = self.total_tokens.saturating_add(other.total_tokens);
    }
}

/// A single chunk of a streamed reply.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ModelChunk {
    /// Content delta
    #[serde(default)]
    pub content: Option<String>,

    /// Fully assembled tool intents (only on the final chunk)
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub tool_calls: Vec<ToolCallIntent>,

    /// Whether this is the final chunk
    #[serde(default)]
    pub done: bool,

    /// Usage (typically only on the final chunk)
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub usage: Option<Usage>,
}

/// An embedding request.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EmbeddingRequest {
    /// The embedding model; `None` uses the service default
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub model: Option<String>,

    pub inputs: Vec<String>,
}

/// An embedding response, one vector per input.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EmbeddingResponse {
    pub embeddings: Vec<Vec<f32>>,
    pub model: String,
    pub usage: Option<Usage>,
}

/// The model service trait.
///
/// The advisor chain's terminal step calls `invoke()` or `stream()` without
/// knowing which backend answers.
#[async_trait]
pub trait ChatModel: Send + Sync {
    /// A human-readable name (e.g. "openai", "scripted").
    fn name(&self) -> &str;

    /// Send a request and get a complete reply.
    async fn invoke(&self, request: ModelRequest) -> Result<ModelResponse, ModelError>;

    /// Send a request and get a stream of reply chunks.
    ///
    /// Default implementation calls `invoke()` and wraps the result as a single chunk.
    async fn stream(
        &self,
        request: ModelRequest,
    ) -> Result<tokio::sync::mpsc::Receiver<Result<ModelChunk, ModelError>>, ModelError> {
        let response = self.invoke(request).await?;
        let (tx, rx) = tokio::sync::mpsc::channel(1);
        let _ = tx
            .send(Ok(ModelChunk {
                content: Some(response.message.content().to_string()),
                tool_calls: response.message.tool_calls().to_vec(),
                done: true,
                usage: response.usage,
            }))
            .await;
        Ok(rx)
    }

    /// Generate embeddings for the given texts.
    ///
    /// Default implementation reports that embeddings aren't supported.
    async fn embed(&self, _request: EmbeddingRequest) -> Result<EmbeddingResponse, ModelError> {
        Err(ModelError::NotConfigured(format!(
            "Model service '{}' does not support embeddings",
            self.name()
        )))
    }
}
