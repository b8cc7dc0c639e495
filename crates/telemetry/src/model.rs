//! Data model for execution traces, spans and usage views.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

// ── Span ──────────────────────────────────────────────────────────────────

/// The kind of work a span represents.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum SpanKind {
    /// One model round that reported token usage.
    ModelRound,
    /// A tool invocation.
    ToolExecution,
    /// A vector index lookup.
    Retrieval,
    /// A completed turn written to memory.
    MemoryWrite,
    /// The retry wrapper judging an answer.
    Evaluation,
    /// The fallback reply after every attempt was rejected.
    Fallback,
}

impl std::fmt::Display for SpanKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::ModelRound => write!(f, "model_round"),
            Self::ToolExecution => write!(f, "tool_execution"),
            Self::Retrieval => write!(f, "retrieval"),
            Self::MemoryWrite => write!(f, "memory_write"),
            Self::Evaluation => write!(f, "evaluation"),
            Self::Fallback => write!(f, "fallback"),
        }
    }
}

/// A single traced unit of work.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Span {
    pub id: String,
    pub kind: SpanKind,
    /// Model name, tool name, or a short description.
    pub label: String,
    pub recorded_at: DateTime<Utc>,
    pub duration_ms: Option<u64>,
    pub prompt_tokens: Option<u32>,
    pub completion_tokens: Option<u32>,
    pub success: Option<bool>,
    pub metadata: serde_json::Map<String, serde_json::Value>,
}

impl Span {
    pub fn new(kind: SpanKind, label: impl Into<String>, recorded_at: DateTime<Utc>) -> Self {
        Self {
            id: Uuid::new_v4().to_string(),
            kind,
            label: label.into(),
            recorded_at,
            duration_ms: None,
            prompt_tokens: None,
            completion_tokens: None,
            success: None,
            metadata: serde_json::Map::new(),
        }
    }

    pub fn with_tokens(mut self, prompt: u32, completion: u32) -> Self {
        self.prompt_tokens = Some(prompt);
        self.completion_tokens = Some(completion);
        self
    }

    pub fn with_outcome(mut self, success: bool) -> Self {
        self.success = Some(success);
        self
    }

    pub fn with_duration(mut self, duration_ms: u64) -> Self {
        self.duration_ms = Some(duration_ms);
        self
    }

    pub fn with_metadata(mut self, key: &str, value: impl Into<serde_json::Value>) -> Self {
        self.metadata.insert(key.to_string(), value.into());
        self
    }

    /// Prompt plus completion tokens, or 0 if not recorded.
    pub fn total_tokens(&self) -> u32 {
        self.prompt_tokens.unwrap_or(0) + self.completion_tokens.unwrap_or(0)
    }
}

// ── Trace ─────────────────────────────────────────────────────────────────

/// How a traced request ended.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case", tag = "status", content = "detail")]
pub enum TraceOutcome {
    Completed,
    Failed(String),
}

/// The spans of one pipeline execution.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Trace {
    pub id: String,
    pub conversation_id: String,
    pub spans: Vec<Span>,
    pub started_at: DateTime<Utc>,
    pub ended_at: Option<DateTime<Utc>>,
    pub outcome: Option<TraceOutcome>,
    /// Wall-clock time reported by the executor.
    pub duration_ms: Option<u64>,
}

impl Trace {
    pub fn new(conversation_id: impl Into<String>, started_at: DateTime<Utc>) -> Self {
        Self {
            id: Uuid::new_v4().to_string(),
            conversation_id: conversation_id.into(),
            spans: Vec::new(),
            started_at,
            ended_at: None,
            outcome: None,
            duration_ms: None,
        }
    }

    pub fn add_span(&mut self, span: Span) {
        self.spans.push(span);
    }

    pub fn end(&mut self, outcome: TraceOutcome, at: DateTime<Utc>) {
        self.ended_at = Some(at);
        self.outcome = Some(outcome);
    }

    pub fn is_open(&self) -> bool {
        self.ended_at.is_none()
    }

    pub fn total_tokens(&self) -> u32 {
        self.spans.iter().map(Span::total_tokens).sum()
    }

    pub fn model_round_count(&self) -> usize {
        self.count(SpanKind::ModelRound)
    }

    pub fn tool_execution_count(&self) -> usize {
        self.count(SpanKind::ToolExecution)
    }

    fn count(&self, kind: SpanKind) -> usize {
        self.spans.iter().filter(|s| s.kind == kind).count()
    }
}

// ── Aggregated views ──────────────────────────────────────────────────────

/// Running totals for one conversation.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ConversationUsage {
    pub prompt_tokens: u64,
    pub completion_tokens: u64,
    pub total_tokens: u64,
    pub model_rounds: u64,
    pub tool_invocations: u64,
    pub tool_failures: u64,
    pub requests_completed: u64,
    pub requests_failed: u64,
    pub rejected_answers: u64,
    pub fallbacks: u64,
}

/// Token usage for a single model.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ModelUsage {
    pub model: String,
    pub prompt_tokens: u64,
    pub completion_tokens: u64,
    pub total_tokens: u64,
    pub rounds: u64,
}

/// Engine-wide totals at a point in time.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct UsageSnapshot {
    pub totals: ConversationUsage,
    pub conversations: usize,
    pub trace_count: usize,
    /// Sorted by total tokens, largest first.
    pub by_model: Vec<ModelUsage>,
    /// Events dropped because the subscriber fell behind.
    pub events_lost: u64,
}
