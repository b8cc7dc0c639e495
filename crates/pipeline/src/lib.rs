//! The Colloquy pipeline: turns one user message into a resolved reply.
//!
//! A request flows through an ordered chain of advisors around a model call:
//!
//! 1. **memory** loads the conversation's recent history
//! 2. **retrieval** injects documents similar to the question
//! 3. **tool_dispatch** runs the model's tool intents, looping the model
//! 4. **usage** accumulates token usage per round
//!
//! The [`ChatPipeline`] executor then persists the completed turn, and the
//! optional [`ValidatingPipeline`] judges the answer and retries rejected
//! ones before falling back to a fixed reply.

pub mod advisor;
pub mod advisors;
pub mod evaluation;
pub mod executor;
pub mod registry;
pub mod retry;

#[cfg(test)]
pub(crate) mod test_helpers;

pub use advisor::{AdvisedRequest, AdvisedResponse, AdvisedStream, Advisor, Chain, StreamEvent};
pub use advisors::{
    LoggerAdvisor, MemoryAdvisor, RetrievalAdvisor, ToolDispatchAdvisor, UsageAuditAdvisor,
};
pub use evaluation::{EvaluationInput, Evaluator, FactCheckingEvaluator, RelevancyEvaluator};
pub use executor::{ChatPipeline, ChatPipelineBuilder};
pub use registry::AdvisorRegistry;
pub use retry::ValidatingPipeline;
