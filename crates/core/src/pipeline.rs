//! Request and response types of one pipeline execution.

use serde::{Deserialize, Serialize};
use tokio_util::sync::CancellationToken;

use crate::context::CallContext;
use crate::message::ConversationId;
use crate::model::{ModelOptions, Usage};
use crate::retrieval::RetrievedDocument;

/// One inbound user turn.
#[derive(Debug, Clone)]
pub struct PipelineRequest {
    pub conversation_id: ConversationId,
    pub user_message: String,
    pub context: CallContext,
    pub options: ModelOptions,

    /// Fires when the caller gives up; every suspension point observes it
    pub cancel: CancellationToken,
}

impl PipelineRequest {
    pub fn new(conversation_id: impl Into<ConversationId>, user_message: impl Into<String>) -> Self {
        Self {
            conversation_id: conversation_id.into(),
            user_message: user_message.into(),
            context: CallContext::new(),
            options: ModelOptions::default(),
            cancel: CancellationToken::new(),
        }
    }

    pub fn with_context(mut self, key: impl Into<String>, value: impl Into<serde_json::Value>) -> Self {
        self.context = self.context.with(key, value);
        self
    }

    pub fn with_options(mut self, options: ModelOptions) -> Self {
        self.options = options;
        self
    }

    pub fn with_cancellation(mut self, cancel: CancellationToken) -> Self {
        self.cancel = cancel;
        self
    }
}

/// Token accounting accumulated over every model round of a request.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct TokenUsage {
    pub prompt_tokens: u64,
    pub completion_tokens: u64,
    pub total_tokens: u64,
}

impl TokenUsage {
    pub fn record(&mut self, usage: &Usage) {
        self.prompt_tokens += u64::from(usage.prompt_tokens);
        self.completion_tokens += u64::from(usage.completion_tokens);
        self.total_tokens += u64::from(usage.total_tokens);
    }

    pub fn merge(&mut self, other: &TokenUsage) {
        self.prompt_tokens += other.prompt_tokens;
        self.completion_tokens += other.completion_tokens;
        self.total_tokens += other.total_tokens;
    }
}

/// One tool invocation, successful or not.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ToolInvocation {
    pub call_id: String,
    pub tool_name: String,
    pub arguments: String,

    /// Tool output, or the error text reported back to the model
    pub output: String,
    pub success: bool,
    pub returns_direct: bool,
    pub duration_ms: u64,

    /// Model round that requested it, starting at 1
    pub round: u32,
}

/// The resolved reply to one request.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct PipelineResponse {
    pub content: String,
    pub usage: TokenUsage,

    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub tool_trace: Vec<ToolInvocation>,

    /// Retrieved context the answer was grounded on
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub documents: Vec<RetrievedDocument>,

    pub model_rounds: u32,
}

impl PipelineResponse {
    pub fn new(content: impl Into<String>) -> Self {
        Self {
            content: content.into(),
            ..Self::default()
        }
    }
}

/// An item of a streamed reply.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum PipelineChunk {
    /// Content as it arrives from the model
    Delta { content: String },

    /// Terminal chunk with usage totals and tool trace
    Done { response: PipelineResponse },
}

/// An evaluator's judgement of an answer.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EvaluationVerdict {
    pub pass: bool,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub score: Option<f32>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub rationale: Option<String>,
}

impl EvaluationVerdict {
    pub fn pass() -> Self {
        Self {
            pass: true,
            score: Some(1.0),
            rationale: None,
        }
    }

    pub fn fail(rationale: impl Into<String>) -> Self {
        Self {
            pass: false,
            score: Some(0.0),
            rationale: Some(rationale.into()),
        }
    }
}
