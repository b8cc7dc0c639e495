//! Execution traces and token accounting for Colloquy pipelines.
//!
//! The engine subscribes to the pipeline's [`EventBus`](colloquy_core::event::EventBus)
//! and folds every [`DomainEvent`](colloquy_core::event::DomainEvent) into a
//! trace for the request it belongs to, plus running usage totals per
//! conversation and per model.

pub mod engine;
pub mod model;

pub use engine::TelemetryEngine;
pub use model::{ConversationUsage, ModelUsage, Span, SpanKind, Trace, TraceOutcome, UsageSnapshot};

/// Errors from the telemetry subsystem.
#[derive(Debug, thiserror::Error)]
pub enum TelemetryError {
    #[error("unknown trace id: {0}")]
    UnknownTrace(String),

    #[error("serialization error: {0}")]
    SerdeError(#[from] serde_json::Error),
}
