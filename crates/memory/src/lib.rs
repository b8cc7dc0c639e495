//! Conversation memory for Colloquy.
//!
//! [`ConversationMemory`] is the windowed, per-conversation-serialized store
//! the pipeline talks to. The repositories underneath only persist whole
//! histories. The in-memory vector index used for retrieval lives here too.

pub mod file_backend;
pub mod in_memory;
pub mod store;
pub mod vector;

#[cfg(feature = "sqlite")]
pub mod sqlite;

pub use file_backend::FileRepository;
pub use in_memory::InMemoryRepository;
pub use store::ConversationMemory;
pub use vector::{EmbeddedDocument, InMemoryVectorIndex, cosine_similarity, rank_documents};

#[cfg(feature = "sqlite")]
pub use sqlite::SqliteRepository;
