//! Conversation history loading.
//!
//! Writing the completed turn back is done once by the executor, so an
//! aborted request never leaves half a turn behind.

use crate::advisor::{AdvisedRequest, AdvisedResponse, AdvisedStream, Advisor, Chain, cancellable};
use async_trait::async_trait;
use colloquy_config::MemoryFailurePolicy;
use colloquy_core::error::Result;
use colloquy_memory::ConversationMemory;
use std::sync::Arc;
use tracing::{debug, warn};

pub struct MemoryAdvisor {
    memory: Arc<ConversationMemory>,
    policy: MemoryFailurePolicy,
}

impl MemoryAdvisor {
    pub fn new(memory: Arc<ConversationMemory>) -> Self {
        Self {
            memory,
            policy: MemoryFailurePolicy::default(),
        }
    }

    pub fn with_policy(mut self, policy: MemoryFailurePolicy) -> Self {
        self.policy = policy;
        self
    }

    async fn load_into(&self, request: &mut AdvisedRequest) -> Result<()> {
        let id = request.request.conversation_id.clone();
        match cancellable(request.cancel(), self.memory.load(&id)).await? {
            Ok(history) => {
                if request.system_prompt.is_none() {
                    request.system_prompt =
                        history.system_message().map(|m| m.content().to_string());
                }
                request.history = history
                    .into_messages()
                    .into_iter()
                    .filter(|m| !m.is_system())
                    .collect();
                debug!(
                    conversation_id = %id,
                    history = request.history.len(),
                    "Loaded conversation history"
                );
                Ok(())
            }
            Err(e) if self.policy == MemoryFailurePolicy::Proceed => {
                warn!(
                    conversation_id = %id,
                    error = %e,
                    "History unavailable, continuing without it"
                );
                Ok(())
            }
            Err(e) => Err(e.into()),
        }
    }
}

#[async_trait]
impl Advisor for MemoryAdvisor {
    fn name(&self) -> &str {
        "memory"
    }

    async fn advise_call(
        &self,
        mut request: AdvisedRequest,
        chain: Chain,
    ) -> Result<AdvisedResponse> {
        self.load_into(&mut request).await?;
        chain.next_call(request).await
    }

    async fn advise_stream(
        &self,
        mut request: AdvisedRequest,
        chain: Chain,
    ) -> Result<AdvisedStream> {
        self.load_into(&mut request).await?;
        chain.next_stream(request).await
    }
}
