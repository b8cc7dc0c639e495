//! Vector index abstraction used by retrieval augmentation.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use crate::error::RetrievalError;

/// A snippet returned by the vector index. Lives for one request only.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RetrievedDocument {
    pub text: String,

    /// Similarity in `[0, 1]`, higher is closer
    pub score: f32,

    pub source_id: String,
}

/// A similarity query.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SearchRequest {
    pub query: String,
    pub top_k: usize,
    pub similarity_threshold: f32,
}

impl SearchRequest {
    pub fn new(query: impl Into<String>) -> Self {
        Self {
            query: query.into(),
            top_k: 3,
            similarity_threshold: 0.5,
        }
    }
}

/// An external similarity-search engine.
///
/// Implementations are asked to honour `top_k` and the threshold, but the
/// retrieval advisor re-applies both before using the results.
#[async_trait]
pub trait VectorIndex: Send + Sync {
    fn name(&self) -> &str;

    async fn search(&self, request: SearchRequest) -> Result<Vec<RetrievedDocument>, RetrievalError>;
}
