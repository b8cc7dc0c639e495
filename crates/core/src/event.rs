//! Domain event system: the pipeline's observability sink.
//!
//! Advisors and the executor publish events as work happens. Subscribers
//! (the telemetry engine, a CLI printer) react without the pipeline knowing
//! about them. Publishing never blocks and never fails.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tokio::sync::broadcast;

/// All domain events in the system.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum DomainEvent {
    /// A model round reported token usage
    UsageRecorded {
        conversation_id: String,
        model: String,
        prompt_tokens: u32,
        completion_tokens: u32,
        total_tokens: u32,
        timestamp: DateTime<Utc>,
    },

    /// A tool ran (or failed to)
    ToolInvoked {
        conversation_id: String,
        tool_name: String,
        success: bool,
        duration_ms: u64,
        timestamp: DateTime<Utc>,
    },

    /// Retrieval augmentation ran
    ContextRetrieved {
        conversation_id: String,
        documents: usize,
        degraded: bool,
        timestamp: DateTime<Utc>,
    },

    /// A completed turn was written to conversation memory
    MemoryPersisted {
        conversation_id: String,
        history_len: usize,
        timestamp: DateTime<Utc>,
    },

    /// A pipeline execution finished successfully
    RequestCompleted {
        conversation_id: String,
        model_rounds: u32,
        total_tokens: u64,
        duration_ms: u64,
        timestamp: DateTime<Utc>,
    },

    /// A pipeline execution aborted
    RequestFailed {
        conversation_id: String,
        error_message: String,
        timestamp: DateTime<Utc>,
    },

    /// The retry wrapper judged an attempt
    AnswerEvaluated {
        conversation_id: String,
        attempt: u32,
        passed: bool,
        timestamp: DateTime<Utc>,
    },

    /// Every attempt was rejected; the fallback text was served
    FallbackServed {
        conversation_id: String,
        attempts: u32,
        timestamp: DateTime<Utc>,
    },
}

impl DomainEvent {
    pub fn conversation_id(&self) -> &str {
        match self {
            Self::UsageRecorded { conversation_id, .. }
            | Self::ToolInvoked { conversation_id, .. }
            | Self::ContextRetrieved { conversation_id, .. }
            | Self::MemoryPersisted { conversation_id, .. }
            | Self::RequestCompleted { conversation_id, .. }
            | Self::RequestFailed { conversation_id, .. }
            | Self::AnswerEvaluated { conversation_id, .. }
            | Self::FallbackServed { conversation_id, .. } => conversation_id,
        }
    }
}

/// A broadcast-based event bus for domain events.
///
/// Uses `tokio::sync::broadcast` for multi-consumer pub/sub. Slow
/// subscribers lag and lose events rather than blocking publishers.
#[derive(Clone)]
pub struct EventBus {
    sender: broadcast::Sender<Arc<DomainEvent>>,
}

impl EventBus {
    /// Create a new event bus with the given capacity.
    pub fn new(capacity: usize) -> Self {
        let (sender, _) = broadcast::channel(capacity.max(1));
        Self { sender }
    }

    /// Publish an event to all subscribers.
    pub fn publish(&self, event: DomainEvent) {
        // No subscribers is fine
        let _ = self.sender.send(Arc::new(event));
    }

    /// Subscribe to receive events.
    pub fn subscribe(&self) -> broadcast::Receiver<Arc<DomainEvent>> {
        self.sender.subscribe()
    }
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new(256)
    }
}

impl std::fmt::Debug for EventBus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EventBus")
            .field("subscribers", &self.sender.receiver_count())
            .finish()
    }
}
