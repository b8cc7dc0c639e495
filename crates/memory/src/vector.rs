//! In-memory vector index over pre-embedded documents.
//!
//! Documents arrive already embedded (ingestion and chunking happen
//! elsewhere). Queries are embedded through the model service and ranked
//! by cosine similarity.

use async_trait::async_trait;
use colloquy_core::error::RetrievalError;
use colloquy_core::model::{ChatModel, EmbeddingRequest};
use colloquy_core::retrieval::{RetrievedDocument, SearchRequest, VectorIndex};
use serde::{Deserialize, Serialize};
use std::path::Path;
use std::sync::Arc;
use tokio::sync::RwLock;
use tracing::debug;

/// Compute cosine similarity between two vectors.
///
/// Returns a value in [-1, 1]. Returns 0.0 for empty, zero-norm, or
/// mismatched-length inputs.
pub fn cosine_similarity(a: &[f32], b: &[f32]) -> f32 {
    if a.len() != b.len() || a.is_empty() {
        return 0.0;
    }

    let (dot, norm_a, norm_b) = a.iter().zip(b).fold((0.0f64, 0.0f64, 0.0f64), |(d, na, nb), (x, y)| {
        let (x, y) = (f64::from(*x), f64::from(*y));
        (d + x * y, na + x * x, nb + y * y)
    });

    let denom = norm_a.sqrt() * norm_b.sqrt();
    if denom < 1e-10 {
        return 0.0;
    }

    (dot / denom) as f32
}

/// A document with its precomputed embedding.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EmbeddedDocument {
    pub source_id: String,
    pub text: String,
    pub embedding: Vec<f32>,
}

/// Score `documents` against `query`, keep those at or above `threshold`,
/// best first (ties keep input order), at most `top_k`.
pub fn rank_documents(
    documents: &[EmbeddedDocument],
    query: &[f32],
    top_k: usize,
    threshold: f32,
) -> Vec<RetrievedDocument> {
    let mut scored: Vec<RetrievedDocument> = documents
        .iter()
        .filter_map(|doc| {
            let score = cosine_similarity(&doc.embedding, query).clamp(0.0, 1.0);
            (score >= threshold).then(|| RetrievedDocument {
                text: doc.text.clone(),
                score,
                source_id: doc.source_id.clone(),
            })
        })
        .collect();

    // sort_by is stable
    scored.sort_by(|a, b| b.score.total_cmp(&a.score));
    scored.truncate(top_k);
    scored
}

pub struct InMemoryVectorIndex {
    embedder: Arc<dyn ChatModel>,
    embedding_model: Option<String>,
    documents: RwLock<Vec<EmbeddedDocument>>,
}

impl InMemoryVectorIndex {
    /// An empty index that embeds queries through `embedder`.
    pub fn new(embedder: Arc<dyn ChatModel>) -> Self {
        Self {
            embedder,
            embedding_model: None,
            documents: RwLock::new(Vec::new()),
        }
    }

    pub fn with_embedding_model(mut self, model: impl Into<String>) -> Self {
        self.embedding_model = Some(model.into());
        self
    }

    pub fn with_documents(self, documents: Vec<EmbeddedDocument>) -> Self {
        Self {
            documents: RwLock::new(documents),
            ..self
        }
    }

    pub async fn add(&self, document: EmbeddedDocument) {
        self.documents.write().await.push(document);
    }

    pub async fn len(&self) -> usize {
        self.documents.read().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.documents.read().await.is_empty()
    }

    /// Read a JSON array of [`EmbeddedDocument`]s.
    pub fn load_documents(path: &Path) -> Result<Vec<EmbeddedDocument>, RetrievalError> {
        let content = std::fs::read_to_string(path).map_err(|e| {
            RetrievalError::Unavailable(format!("Failed to read {}: {e}", path.display()))
        })?;
        serde_json::from_str(&content).map_err(|e| {
            RetrievalError::Unavailable(format!("Invalid document file {}: {e}", path.display()))
        })
    }
}

#[async_trait]
impl VectorIndex for InMemoryVectorIndex {
    fn name(&self) -> &str {
        "in_memory"
    }

    async fn search(&self, request: SearchRequest) -> Result<Vec<RetrievedDocument>, RetrievalError> {
        let response = self
            .embedder
            .embed(EmbeddingRequest {
                model: self.embedding_model.clone(),
                inputs: vec![request.query.clone()],
            })
            .await
            .map_err(|e| RetrievalError::Unavailable(format!("Query embedding failed: {e}")))?;

        let query = response
            .embeddings
            .into_iter()
            .next()
            .ok_or_else(|| RetrievalError::QueryFailed("Embedding service returned no vector".into()))?;

        let documents = self.documents.read().await;
        let results = rank_documents(&documents, &query, request.top_k, request.similarity_threshold);
        debug!(
            candidates = documents.len(),
            returned = results.len(),
            "Vector search complete"
        );
        Ok(results)
    }
}
