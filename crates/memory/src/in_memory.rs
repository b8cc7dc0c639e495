//! In-memory repository: useful for testing and ephemeral sessions.

use async_trait::async_trait;
use colloquy_core::error::MemoryStoreError;
use colloquy_core::memory::{ConversationHistory, ConversationRepository};
use colloquy_core::message::ConversationId;
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::RwLock;

/// Keeps histories in a map. Nothing survives the process.
#[derive(Clone, Default)]
pub struct InMemoryRepository {
    conversations: Arc<RwLock<HashMap<ConversationId, ConversationHistory>>>,
}

impl InMemoryRepository {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn len(&self) -> usize {
        self.conversations.read().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.conversations.read().await.is_empty()
    }
}

#[async_trait]
impl ConversationRepository for InMemoryRepository {
    fn name(&self) -> &str {
        "memory"
    }

    async fn get(&self, id: &ConversationId) -> Result<Option<ConversationHistory>, MemoryStoreError> {
        Ok(self.conversations.read().await.get(id).cloned())
    }

    async fn put(&self, id: &ConversationId, history: &ConversationHistory) -> Result<(), MemoryStoreError> {
        self.conversations
            .write()
            .await
            .insert(id.clone(), history.clone());
        Ok(())
    }

    async fn delete(&self, id: &ConversationId) -> Result<bool, MemoryStoreError> {
        Ok(self.conversations.write().await.remove(id).is_some())
    }
}
