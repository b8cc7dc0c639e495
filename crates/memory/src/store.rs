//! The conversation memory store.
//!
//! Wraps a [`ConversationRepository`] with the window policy and per-conversation
//! serialization. Different conversations never wait on each other; calls on
//! the same conversation run one at a time in arrival order (tokio's `Mutex`
//! is FIFO). Lock entries are dropped from the table as soon as nobody holds
//! or waits on them.

use colloquy_core::error::MemoryStoreError;
use colloquy_core::memory::{ConversationHistory, ConversationRepository, DEFAULT_WINDOW};
use colloquy_core::message::{ConversationId, Message};
use std::collections::HashMap;
use std::future::Future;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::OwnedMutexGuard;
use tracing::debug;

type KeyLocks = Mutex<HashMap<ConversationId, Arc<tokio::sync::Mutex<()>>>>;

pub struct ConversationMemory {
    repository: Arc<dyn ConversationRepository>,
    window: usize,
    timeout: Duration,
    locks: KeyLocks,
}

impl ConversationMemory {
    pub fn new(repository: Arc<dyn ConversationRepository>) -> Self {
        Self {
            repository,
            window: DEFAULT_WINDOW,
            timeout: Duration::from_secs(5),
            locks: Mutex::new(HashMap::new()),
        }
    }

    /// Messages kept per conversation (at least 1).
    pub fn with_window(mut self, window: usize) -> Self {
        self.window = window.max(1);
        self
    }

    /// Timeout applied to each repository call.
    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    pub fn window(&self) -> usize {
        self.window
    }

    pub fn backend_name(&self) -> &str {
        self.repository.name()
    }

    /// The history of a conversation; empty if it was never seen.
    pub async fn load(&self, id: &ConversationId) -> Result<ConversationHistory, MemoryStoreError> {
        let _guard = self.lock(id).await;
        self.fetch(id).await
    }

    /// Append one message and enforce the window.
    pub async fn append(&self, id: &ConversationId, message: Message) -> Result<ConversationHistory, MemoryStoreError> {
        self.append_all(id, vec![message]).await
    }

    /// Append several messages in one read-modify-write.
    pub async fn append_all(
        &self,
        id: &ConversationId,
        messages: Vec<Message>,
    ) -> Result<ConversationHistory, MemoryStoreError> {
        let _guard = self.lock(id).await;
        let mut history = self.fetch(id).await?;
        for message in messages {
            history.push(message, self.window);
        }
        self.timed(id, self.repository.put(id, &history)).await?;
        debug!(conversation_id = %id, len = history.len(), "Conversation history saved");
        Ok(history)
    }

    /// Forget a conversation.
    pub async fn clear(&self, id: &ConversationId) -> Result<bool, MemoryStoreError> {
        let _guard = self.lock(id).await;
        self.timed(id, self.repository.delete(id)).await
    }

    /// Number of conversations with a live lock entry.
    pub fn tracked_locks(&self) -> usize {
        self.locks.lock().unwrap_or_else(|e| e.into_inner()).len()
    }

    async fn fetch(&self, id: &ConversationId) -> Result<ConversationHistory, MemoryStoreError> {
        let stored = self.timed(id, self.repository.get(id)).await?;
        Ok(stored
            .map(|h| ConversationHistory::from_messages(h.into_messages(), self.window))
            .unwrap_or_default())
    }

    async fn timed<T>(
        &self,
        id: &ConversationId,
        fut: impl Future<Output = Result<T, MemoryStoreError>>,
    ) -> Result<T, MemoryStoreError> {
        tokio::time::timeout(self.timeout, fut)
            .await
            .map_err(|_| MemoryStoreError::Timeout {
                conversation_id: id.to_string(),
                timeout_ms: self.timeout.as_millis() as u64,
            })?
    }

    async fn lock(&self, id: &ConversationId) -> KeyGuard<'_> {
        // Built before waiting so a caller dropped mid-wait still prunes
        let mut key = KeyGuard {
            store: self,
            id: id.clone(),
            guard: None,
        };
        let mutex = {
            let mut locks = self.locks.lock().unwrap_or_else(|e| e.into_inner());
            locks.entry(id.clone()).or_default().clone()
        };
        key.guard = Some(mutex.lock_owned().await);
        key
    }

    fn prune(&self, id: &ConversationId) {
        let mut locks = self.locks.lock().unwrap_or_else(|e| e.into_inner());
        // Only the table itself still references it
        if locks.get(id).is_some_and(|m| Arc::strong_count(m) == 1) {
            locks.remove(id);
        }
    }
}

impl std::fmt::Debug for ConversationMemory {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ConversationMemory")
            .field("backend", &self.repository.name())
            .field("window", &self.window)
            .field("timeout", &self.timeout)
            .finish()
    }
}

struct KeyGuard<'a> {
    store: &'a ConversationMemory,
    id: ConversationId,
    guard: Option<OwnedMutexGuard<()>>,
}

impl Drop for KeyGuard<'_> {
    fn drop(&mut self) {
        self.guard.take();
        self.store.prune(&self.id);
    }
}
