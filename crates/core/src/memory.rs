//! Conversation history and the persistence trait behind it.
//!
//! [`ConversationHistory`] owns the windowing rule; a
//! [`ConversationRepository`] only stores and fetches whole histories.
//! Serializing access per conversation is the memory store's job
//! (`colloquy-memory`), not the repository's.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use crate::error::MemoryStoreError;
use crate::message::{ConversationId, Message};

/// Default number of messages kept per conversation.
pub const DEFAULT_WINDOW: usize = 10;

/// Ordered messages of one conversation, bounded by a window.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ConversationHistory {
    messages: Vec<Message>,
}

impl ConversationHistory {
    pub fn new() -> Self {
        Self::default()
    }

    /// Build from stored messages and bring them within `window`.
    pub fn from_messages(messages: Vec<Message>, window: usize) -> Self {
        let mut history = Self::new();
        for message in messages {
            history.push(message, window);
        }
        history
    }

    /// Append one message and enforce the window.
    ///
    /// A system message replaces any earlier one and sits at the front.
    /// Past the window, the oldest non-system message goes first.
    pub fn push(&mut self, message: Message, window: usize) {
        let window = window.max(1);

        if message.is_system() {
            self.messages.retain(|m| !m.is_system());
            self.messages.insert(0, message);
        } else {
            self.messages.push(message);
        }

        while self.messages.len() > window {
            match self.messages.iter().position(|m| !m.is_system()) {
                Some(oldest) => {
                    self.messages.remove(oldest);
                }
                None => break,
            }
        }
    }

    pub fn messages(&self) -> &[Message] {
        &self.messages
    }

    pub fn into_messages(self) -> Vec<Message> {
        self.messages
    }

    pub fn len(&self) -> usize {
        self.messages.len()
    }

    pub fn is_empty(&self) -> bool {
        self.messages.is_empty()
    }

    pub fn system_message(&self) -> Option<&Message> {
        self.messages.iter().find(|m| m.is_system())
    }
}

/// Durable storage of whole conversation histories.
///
/// Implementations: in-memory, JSON file, SQLite.
#[async_trait]
pub trait ConversationRepository: Send + Sync {
    /// The backend name (e.g. "memory", "file", "sqlite").
    fn name(&self) -> &str;

    /// Fetch a history; `None` if the conversation was never stored.
    async fn get(&self, id: &ConversationId) -> Result<Option<ConversationHistory>, MemoryStoreError>;

    /// Replace the stored history.
    async fn put(&self, id: &ConversationId, history: &ConversationHistory) -> Result<(), MemoryStoreError>;

    /// Forget a conversation. Returns whether anything was stored.
    async fn delete(&self, id: &ConversationId) -> Result<bool, MemoryStoreError>;
}
