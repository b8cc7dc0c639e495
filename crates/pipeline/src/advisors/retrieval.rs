//! Retrieval augmentation.
//!
//! Queries the vector index with the user message and injects the hits into
//! the system message for this request only. Retrieved documents are never
//! persisted to conversation memory.

use crate::advisor::{
    AdvisedRequest, AdvisedResponse, AdvisedStream, Advisor, Chain, guarded, map_completed,
};
use async_trait::async_trait;
use chrono::Utc;
use colloquy_config::{RetrievalConfig, RetrievalFailurePolicy};
use colloquy_core::error::{RetrievalError, Result};
use colloquy_core::event::{DomainEvent, EventBus};
use colloquy_core::retrieval::{RetrievedDocument, SearchRequest, VectorIndex};
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, warn};

pub struct RetrievalAdvisor {
    index: Arc<dyn VectorIndex>,
    top_k: usize,
    similarity_threshold: f32,
    timeout: Duration,
    policy: RetrievalFailurePolicy,
    events: EventBus,
}

impl RetrievalAdvisor {
    /// Top 3 documents scoring at least 0.5, degrading on failure.
    pub fn new(index: Arc<dyn VectorIndex>, events: EventBus) -> Self {
        Self::from_config(index, &RetrievalConfig::default(), events)
    }

    pub fn from_config(
        index: Arc<dyn VectorIndex>,
        config: &RetrievalConfig,
        events: EventBus,
    ) -> Self {
        Self {
            index,
            top_k: config.top_k,
            similarity_threshold: config.similarity_threshold,
            timeout: Duration::from_millis(config.timeout_ms),
            policy: config.on_failure,
            events,
        }
    }

    pub fn with_top_k(mut self, top_k: usize) -> Self {
        self.top_k = top_k;
        self
    }

    pub fn with_similarity_threshold(mut self, threshold: f32) -> Self {
        self.similarity_threshold = threshold;
        self
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    pub fn with_policy(mut self, policy: RetrievalFailurePolicy) -> Self {
        self.policy = policy;
        self
    }

    async fn retrieve(&self, request: &AdvisedRequest) -> Result<Vec<RetrievedDocument>> {
        let conversation_id = request.request.conversation_id.to_string();
        let search = SearchRequest {
            query: request.request.user_message.clone(),
            top_k: self.top_k,
            similarity_threshold: self.similarity_threshold,
        };
        let timeout_ms = self.timeout.as_millis() as u64;

        let outcome = guarded(request.cancel(), self.timeout, self.index.search(search), || {
            RetrievalError::Timeout { timeout_ms }
        })
        .await?;

        let (documents, degraded) = match outcome {
            Ok(hits) => (enforce_bounds(hits, self.top_k, self.similarity_threshold), false),
            Err(e) if self.policy == RetrievalFailurePolicy::Degrade => {
                warn!(
                    conversation_id = %conversation_id,
                    index = %self.index.name(),
                    error = %e,
                    "Retrieval failed, answering without context"
                );
                (Vec::new(), true)
            }
            Err(e) => return Err(e.into()),
        };

        debug!(
            conversation_id = %conversation_id,
            documents = documents.len(),
            "Retrieved context"
        );
        self.events.publish(DomainEvent::ContextRetrieved {
            conversation_id,
            documents: documents.len(),
            degraded,
            timestamp: Utc::now(),
        });
        Ok(documents)
    }
}

/// At most `top_k` documents scoring at least `threshold`, best first.
///
/// Applied to whatever the index returns; ties keep index order.
fn enforce_bounds(
    hits: Vec<RetrievedDocument>,
    top_k: usize,
    threshold: f32,
) -> Vec<RetrievedDocument> {
    let mut documents: Vec<RetrievedDocument> = hits
        .into_iter()
        .filter(|d| d.score.is_finite() && d.score >= threshold)
        .map(|mut d| {
            d.score = d.score.clamp(0.0, 1.0);
            d
        })
        .collect();
    documents.sort_by(|a, b| b.score.total_cmp(&a.score));
    documents.truncate(top_k);
    documents
}

#[async_trait]
impl Advisor for RetrievalAdvisor {
    fn name(&self) -> &str {
        "retrieval"
    }

    async fn advise_call(
        &self,
        mut request: AdvisedRequest,
        chain: Chain,
    ) -> Result<AdvisedResponse> {
        let documents = self.retrieve(&request).await?;
        request.documents = documents.clone();
        let mut response = chain.next_call(request).await?;
        response.response.documents = documents;
        Ok(response)
    }

    async fn advise_stream(
        &self,
        mut request: AdvisedRequest,
        chain: Chain,
    ) -> Result<AdvisedStream> {
        let documents = self.retrieve(&request).await?;
        request.documents = documents.clone();
        let upstream = chain.next_stream(request).await?;
        Ok(map_completed(upstream, move |mut response| {
            response.response.documents = documents;
            response
        }))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::advisor::ModelStep;
    use crate::test_helpers::SequentialMockModel;
    use colloquy_core::error::PipelineError;
    use colloquy_core::model::ModelOptions;
    use colloquy_core::pipeline::PipelineRequest;

    fn doc(id: &str, score: f32) -> RetrievedDocument {
        RetrievedDocument {
            text: format!("text of {id}"),
            score,
            source_id: id.into(),
        }
    }

    type SearchResult = std::result::Result<Vec<RetrievedDocument>, RetrievalError>;

    /// Returns its canned hits regardless of the request.
    struct CannedIndex(Vec<RetrievedDocument>);

    #[async_trait]
    impl VectorIndex for CannedIndex {
        fn name(&self) -> &str {
            "canned"
        }
        async fn search(&self, _request: SearchRequest) -> SearchResult {
            Ok(self.0.clone())
        }
    }

    struct DownIndex;

    #[async_trait]
    impl VectorIndex for DownIndex {
        fn name(&self) -> &str {
            "down"
        }
        async fn search(&self, _request: SearchRequest) -> SearchResult {
            Err(RetrievalError::Unavailable("connection refused".into()))
        }
    }

    struct HangingIndex;

    #[async_trait]
    impl VectorIndex for HangingIndex {
        fn name(&self) -> &str {
            "hanging"
        }
        async fn search(&self, _request: SearchRequest) -> SearchResult {
            std::future::pending().await
        }
    }

    fn chain(advisor: RetrievalAdvisor, model: Arc<SequentialMockModel>) -> Chain {
        Chain::new(
            vec![Arc::new(advisor)],
            ModelStep::new(model, ModelOptions::default(), Duration::from_secs(5)),
        )
    }

    #[test]
    fn bounds_hold_even_for_a_misbehaving_index() {
        let hits = vec![
            doc("low", 0.2),
            doc("b", 0.7),
            doc("a", 0.9),
            doc("c", 0.7),
            doc("d", 0.6),
            doc("nan", f32::NAN),
        ];
        let docs = enforce_bounds(hits, 3, 0.5);
        let ids: Vec<_> = docs.iter().map(|d| d.source_id.as_str()).collect();
        assert_eq!(ids, vec!["a", "b", "c"]);
        assert!(docs.iter().all(|d| d.score >= 0.5));
    }

    #[tokio::test]
    async fn context_injected_and_returned() {
        let index = Arc::new(CannedIndex(vec![doc("hr-1", 0.9), doc("hr-2", 0.1)]));
        let model = Arc::new(SequentialMockModel::single_text("24 days."));
        let events = EventBus::new(8);
        let mut rx = events.subscribe();

        let response = chain(RetrievalAdvisor::new(index, events), model.clone())
            .next_call(AdvisedRequest::new(PipelineRequest::new("c1", "How many leaves?")))
            .await
            .unwrap();

        assert_eq!(response.response.documents.len(), 1);
        let system = &model.requests()[0].messages[0];
        assert!(system.is_system());
        assert!(system.content().contains("text of hr-1"));
        assert!(!system.content().contains("text of hr-2"));
        assert!(matches!(
            rx.recv().await.unwrap().as_ref(),
            DomainEvent::ContextRetrieved { documents: 1, degraded: false, .. }
        ));
    }

    #[tokio::test]
    async fn unavailable_index_degrades() {
        let model = Arc::new(SequentialMockModel::single_text("I don't know."));
        let advisor = RetrievalAdvisor::new(Arc::new(DownIndex), EventBus::default());
        let response = chain(advisor, model.clone())
            .next_call(AdvisedRequest::new(PipelineRequest::new("c1", "q")))
            .await
            .unwrap();
        assert!(response.response.documents.is_empty());
        assert_eq!(model.call_count(), 1);
    }

    #[tokio::test]
    async fn unavailable_index_can_abort() {
        let model = Arc::new(SequentialMockModel::new(vec![]));
        let advisor = RetrievalAdvisor::new(Arc::new(DownIndex), EventBus::default())
            .with_policy(RetrievalFailurePolicy::Abort);
        let err = chain(advisor, model)
            .next_call(AdvisedRequest::new(PipelineRequest::new("c1", "q")))
            .await
            .unwrap_err();
        assert!(matches!(err, PipelineError::Retrieval(RetrievalError::Unavailable(_))));
    }

    #[tokio::test(start_paused = true)]
    async fn slow_index_times_out() {
        let advisor = RetrievalAdvisor::new(Arc::new(HangingIndex), EventBus::default())
            .with_timeout(Duration::from_millis(100))
            .with_policy(RetrievalFailurePolicy::Abort);
        let err = chain(advisor, Arc::new(SequentialMockModel::new(vec![])))
            .next_call(AdvisedRequest::new(PipelineRequest::new("c1", "q")))
            .await
            .unwrap_err();
        assert!(matches!(
            err,
            PipelineError::Retrieval(RetrievalError::Timeout { timeout_ms: 100 })
        ));
    }
}
