//! File-based repository: one JSON document per conversation.
//!
//! Storage location: `~/.colloquy/conversations/<id>.json`
//!
//! Simple, portable, and human-inspectable. Writes go to a temporary file
//! that is renamed over the old one, so a crash never leaves half a history.

use async_trait::async_trait;
use colloquy_core::error::MemoryStoreError;
use colloquy_core::memory::{ConversationHistory, ConversationRepository};
use colloquy_core::message::ConversationId;
use std::path::{Path, PathBuf};
use tracing::debug;

pub struct FileRepository {
    dir: PathBuf,
}

impl FileRepository {
    /// Repository rooted at `dir`; the directory is created on first write.
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        let dir = dir.into();
        debug!(path = %dir.display(), "File conversation repository opened");
        Self { dir }
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    fn path_for(&self, id: &ConversationId) -> PathBuf {
        self.dir.join(format!("{}.json", file_stem(id.as_str())))
    }
}

/// Map a conversation id onto a safe file name.
///
/// Ids made of `[A-Za-z0-9_-]` are kept as-is; anything else is hex encoded
/// so distinct ids can never collide or escape the directory.
fn file_stem(id: &str) -> String {
    let plain = !id.is_empty()
        && id
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || c == '-' || c == '_');
    if plain {
        id.to_string()
    } else {
        let hex: String = id.bytes().map(|b| format!("{b:02x}")).collect();
        format!("x-{hex}")
    }
}

#[async_trait]
impl ConversationRepository for FileRepository {
    fn name(&self) -> &str {
        "file"
    }

    async fn get(&self, id: &ConversationId) -> Result<Option<ConversationHistory>, MemoryStoreError> {
        let path = self.path_for(id);
        let content = match tokio::fs::read_to_string(&path).await {
            Ok(c) => c,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(None),
            Err(e) => {
                return Err(MemoryStoreError::Storage(format!(
                    "Failed to read {}: {e}",
                    path.display()
                )));
            }
        };

        let history = serde_json::from_str(&content).map_err(|e| {
            MemoryStoreError::Corrupted(format!("{}: {e}", path.display()))
        })?;
        Ok(Some(history))
    }

    async fn put(&self, id: &ConversationId, history: &ConversationHistory) -> Result<(), MemoryStoreError> {
        tokio::fs::create_dir_all(&self.dir).await.map_err(|e| {
            MemoryStoreError::Storage(format!("Failed to create conversation directory: {e}"))
        })?;

        let json = serde_json::to_string_pretty(history).map_err(|e| {
            MemoryStoreError::Storage(format!("Failed to serialize history: {e}"))
        })?;

        let path = self.path_for(id);
        let tmp = path.with_extension("json.tmp");
        tokio::fs::write(&tmp, json)
            .await
            .map_err(|e| MemoryStoreError::Storage(format!("Failed to write history file: {e}")))?;
        tokio::fs::rename(&tmp, &path)
            .await
            .map_err(|e| MemoryStoreError::Storage(format!("Failed to replace history file: {e}")))?;
        Ok(())
    }

    async fn delete(&self, id: &ConversationId) -> Result<bool, MemoryStoreError> {
        match tokio::fs::remove_file(self.path_for(id)).await {
            Ok(()) => Ok(true),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(false),
            Err(e) => Err(MemoryStoreError::Storage(format!(
                "Failed to delete history file: {e}"
            ))),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use colloquy_core::message::Message;

    fn history(contents: &[&str]) -> ConversationHistory {
        let mut h = ConversationHistory::new();
        for c in contents {
            h.push(Message::user(*c), 10);
        }
        h
    }

    #[tokio::test]
    async fn put_and_get_persists() {
        let dir = tempfile::tempdir().unwrap();
        let id = ConversationId::from("alice-1");

        let repo = FileRepository::new(dir.path());
        repo.put(&id, &history(&["VPN is down"])).await.unwrap();
        assert!(dir.path().join("alice-1.json").exists());

        // A fresh instance reads the same file
        let repo2 = FileRepository::new(dir.path());
        let stored = repo2.get(&id).await.unwrap().unwrap();
        assert_eq!(stored.messages()[0].content(), "VPN is down");
    }

    #[tokio::test]
    async fn missing_conversation_is_none() {
        let dir = tempfile::tempdir().unwrap();
        let repo = FileRepository::new(dir.path().join("not-yet-created"));
        assert!(repo.get(&"c1".into()).await.unwrap().is_none());
        assert!(!repo.delete(&"c1".into()).await.unwrap());
    }

    #[tokio::test]
    async fn unsafe_ids_stay_inside_directory() {
        let dir = tempfile::tempdir().unwrap();
        let repo = FileRepository::new(dir.path());
        let id = ConversationId::from("../../etc/passwd");
        repo.put(&id, &history(&["x"])).await.unwrap();

        let entries: Vec<_> = std::fs::read_dir(dir.path()).unwrap().collect();
        assert_eq!(entries.len(), 1);
        assert!(repo.get(&id).await.unwrap().is_some());
    }

    #[tokio::test]
    async fn corrupted_file_is_reported() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("c1.json"), "this is not json").unwrap();
        let repo = FileRepository::new(dir.path());
        let err = repo.get(&"c1".into()).await.unwrap_err();
        assert!(matches!(err, MemoryStoreError::Corrupted(_)));
    }

    #[tokio::test]
    async fn delete_persists() {
        let dir = tempfile::tempdir().unwrap();
        let repo = FileRepository::new(dir.path());
        let id = ConversationId::from("c1");
        repo.put(&id, &history(&["a", "b"])).await.unwrap();
        assert!(repo.delete(&id).await.unwrap());
        assert!(FileRepository::new(dir.path()).get(&id).await.unwrap().is_none());
    }

    #[test]
    fn file_stem_encoding() {
        assert_eq!(file_stem("abc_1-2"), "abc_1-2");
        assert_eq!(file_stem("a/b"), "x-612f62");
        assert_eq!(file_stem(""), "x-");
    }
}
