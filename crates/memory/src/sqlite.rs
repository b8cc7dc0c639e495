//! SQLite repository.
//!
//! One row per message in `conversation_messages`, ordered by `seq` within
//! a conversation. A `put` replaces the whole conversation inside a single
//! transaction, so readers never observe half a window.

use async_trait::async_trait;
use colloquy_core::error::MemoryStoreError;
use colloquy_core::memory::{ConversationHistory, ConversationRepository};
use colloquy_core::message::{ConversationId, Message};
use sqlx::sqlite::{SqliteConnectOptions, SqliteJournalMode, SqlitePoolOptions, SqliteSynchronous};
use sqlx::{Row, SqlitePool};
use std::str::FromStr;
use tracing::{debug, info};

pub struct SqliteRepository {
    pool: SqlitePool,
}

impl SqliteRepository {
    /// Open (or create) the database at `path`.
    ///
    /// Pass `"sqlite::memory:"` for an ephemeral database.
    pub async fn new(path: &str) -> Result<Self, MemoryStoreError> {
        let options = SqliteConnectOptions::from_str(path)
            .map_err(|e| MemoryStoreError::Storage(format!("Invalid SQLite path: {e}")))?
            .create_if_missing(true)
            .journal_mode(SqliteJournalMode::Wal)
            .synchronous(SqliteSynchronous::Normal);

        // Every connection to `:memory:` is its own database
        let max_connections = if path.contains(":memory:") { 1 } else { 4 };

        let pool = SqlitePoolOptions::new()
            .max_connections(max_connections)
            .connect_with(options)
            .await
            .map_err(|e| MemoryStoreError::Unavailable(format!("Failed to open SQLite: {e}")))?;

        let repo = Self { pool };
        repo.run_migrations().await?;
        info!("SQLite conversation repository initialized at {path}");
        Ok(repo)
    }

    /// Create from an existing pool.
    pub async fn from_pool(pool: SqlitePool) -> Result<Self, MemoryStoreError> {
        let repo = Self { pool };
        repo.run_migrations().await?;
        Ok(repo)
    }

    async fn run_migrations(&self) -> Result<(), MemoryStoreError> {
        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS conversation_messages (
                conversation_id TEXT    NOT NULL,
                seq             INTEGER NOT NULL,
                role            TEXT    NOT NULL,
                content         TEXT    NOT NULL,
                message         TEXT    NOT NULL,
                created_at      TEXT    NOT NULL,
                PRIMARY KEY (conversation_id, seq)
            )
            "#,
        )
        .execute(&self.pool)
        .await
        .map_err(|e| MemoryStoreError::MigrationFailed(format!("conversation_messages table: {e}")))?;

        debug!("SQLite migrations complete");
        Ok(())
    }
}

#[async_trait]
impl ConversationRepository for SqliteRepository {
    fn name(&self) -> &str {
        "sqlite"
    }

    async fn get(&self, id: &ConversationId) -> Result<Option<ConversationHistory>, MemoryStoreError> {
        let rows = sqlx::query(
            "SELECT message FROM conversation_messages WHERE conversation_id = ?1 ORDER BY seq",
        )
        .bind(id.as_str())
        .fetch_all(&self.pool)
        .await
        .map_err(|e| MemoryStoreError::Storage(format!("SELECT failed: {e}")))?;

        if rows.is_empty() {
            return Ok(None);
        }

        let mut messages = Vec::with_capacity(rows.len());
        for row in &rows {
            let json: String = row
                .try_get("message")
                .map_err(|e| MemoryStoreError::Corrupted(format!("message column: {e}")))?;
            let message: Message = serde_json::from_str(&json)
                .map_err(|e| MemoryStoreError::Corrupted(format!("conversation {id}: {e}")))?;
            messages.push(message);
        }

        // Stored rows were already windowed when written
        Ok(Some(ConversationHistory::from_messages(messages, usize::MAX)))
    }

    async fn put(&self, id: &ConversationId, history: &ConversationHistory) -> Result<(), MemoryStoreError> {
        let mut tx = self
            .pool
            .begin()
            .await
            .map_err(|e| MemoryStoreError::Storage(format!("BEGIN failed: {e}")))?;

        sqlx::query("DELETE FROM conversation_messages WHERE conversation_id = ?1")
            .bind(id.as_str())
            .execute(&mut *tx)
            .await
            .map_err(|e| MemoryStoreError::Storage(format!("DELETE failed: {e}")))?;

        for (seq, message) in history.messages().iter().enumerate() {
            let json = serde_json::to_string(message)
                .map_err(|e| MemoryStoreError::Storage(format!("Message serialization: {e}")))?;
            sqlx::query(
                r#"
                INSERT INTO conversation_messages (conversation_id, seq, role, content, message, created_at)
                VALUES (?1, ?2, ?3, ?4, ?5, ?6)
                "#,
            )
            .bind(id.as_str())
            .bind(seq as i64)
            .bind(message.role().to_string())
            .bind(message.content())
            .bind(&json)
            .bind(message.timestamp().to_rfc3339())
            .execute(&mut *tx)
            .await
            .map_err(|e| MemoryStoreError::Storage(format!("INSERT failed: {e}")))?;
        }

        tx.commit()
            .await
            .map_err(|e| MemoryStoreError::Storage(format!("COMMIT failed: {e}")))?;
        Ok(())
    }

    async fn delete(&self, id: &ConversationId) -> Result<bool, MemoryStoreError> {
        let result = sqlx::query("DELETE FROM conversation_messages WHERE conversation_id = ?1")
            .bind(id.as_str())
            .execute(&self.pool)
            .await
            .map_err(|e| MemoryStoreError::Storage(format!("DELETE failed: {e}")))?;
        Ok(result.rows_affected() > 0)
    }
}
