//! # Colloquy Core
//!
//! Domain types, collaborator traits, and error definitions for the Colloquy
//! advisor pipeline. This crate has **no orchestration logic**: it defines
//! the vocabulary that the pipeline, the memory store, the tools, and the
//! reference collaborators all implement against.
//!
//! ## Design Philosophy
//!
//! Every external collaborator (model service, vector index, conversation
//! persistence, observability sink) is a trait here. Implementations live in
//! their own crates, so that:
//! - backends can be swapped via configuration
//! - tests can script the model and the index deterministically
//! - the dependency graph points inward on core

pub mod context;
pub mod error;
pub mod event;
pub mod memory;
pub mod message;
pub mod model;
pub mod pipeline;
pub mod retrieval;
pub mod tool;

// Re-export key types at crate root for ergonomics
pub use context::CallContext;
pub use error::{PipelineError, Result};
pub use event::{DomainEvent, EventBus};
pub use memory::{ConversationHistory, ConversationRepository};
pub use message::{ConversationId, Message, Role, ToolCallIntent};
pub use model::{ChatModel, ModelChunk, ModelOptions, ModelRequest, ModelResponse, Usage};
pub use pipeline::{
    EvaluationVerdict, PipelineChunk, PipelineRequest, PipelineResponse, TokenUsage,
    ToolInvocation,
};
pub use retrieval::{RetrievedDocument, SearchRequest, VectorIndex};
pub use tool::{Tool, ToolRegistry};
