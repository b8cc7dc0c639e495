//! Token usage audit.

use crate::advisor::{AdvisedRequest, AdvisedResponse, AdvisedStream, Advisor, Chain, map_completed};
use async_trait::async_trait;
use chrono::Utc;
use colloquy_core::error::Result;
use colloquy_core::event::{DomainEvent, EventBus};
use tracing::info;

/// Adds each model round's reported usage into the reply.
///
/// Purely observational: never alters content and never fails. Rounds
/// without reported usage are skipped. Inside `tool_dispatch` it records
/// every round; outside, it records the sum of the rounds once.
pub struct UsageAuditAdvisor {
    events: EventBus,
}

impl UsageAuditAdvisor {
    pub fn new(events: EventBus) -> Self {
        Self { events }
    }
}

fn audit(
    events: &EventBus,
    conversation_id: &str,
    mut response: AdvisedResponse,
) -> AdvisedResponse {
    let Some(usage) = response.round_usage.take() else {
        return response;
    };

    response.response.usage.record(&usage);
    info!(
        conversation_id = %conversation_id,
        model = %response.model,
        prompt_tokens = usage.prompt_tokens,
        completion_tokens = usage.completion_tokens,
        total_tokens = usage.total_tokens,
        "Token usage"
    );
    events.publish(DomainEvent::UsageRecorded {
        conversation_id: conversation_id.to_string(),
        model: response.model.clone(),
        prompt_tokens: usage.prompt_tokens,
        completion_tokens: usage.completion_tokens,
        total_tokens: usage.total_tokens,
        timestamp: Utc::now(),
    });
    response
}

#[async_trait]
impl Advisor for UsageAuditAdvisor {
    fn name(&self) -> &str {
        "usage"
    }

    async fn advise_call(&self, request: AdvisedRequest, chain: Chain) -> Result<AdvisedResponse> {
        let conversation_id = request.request.conversation_id.to_string();
        let response = chain.next_call(request).await?;
        Ok(audit(&self.events, &conversation_id, response))
    }

    async fn advise_stream(&self, request: AdvisedRequest, chain: Chain) -> Result<AdvisedStream> {
        let conversation_id = request.request.conversation_id.to_string();
        let upstream = chain.next_stream(request).await?;
        let events = self.events.clone();
        // Usage only arrives with the terminal chunk
        Ok(map_completed(upstream, move |response| {
            audit(&events, &conversation_id, response)
        }))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::advisor::{ModelStep, StreamEvent};
    use crate::test_helpers::{SequentialMockModel, collect, make_text_response};
    use colloquy_core::model::ModelOptions;
    use colloquy_core::pipeline::PipelineRequest;
    use std::sync::Arc;
    use std::time::Duration;

    fn chain(model: SequentialMockModel, events: &EventBus) -> Chain {
        Chain::new(
            vec![Arc::new(UsageAuditAdvisor::new(events.clone()))],
            ModelStep::new(Arc::new(model), ModelOptions::default(), Duration::from_secs(5)),
        )
    }

    #[tokio::test]
    async fn records_usage_and_publishes() {
        let events = EventBus::new(8);
        let mut rx = events.subscribe();

        let response = chain(SequentialMockModel::single_text("hi"), &events)
            .next_call(AdvisedRequest::new(PipelineRequest::new("c1", "hello")))
            .await
            .unwrap();

        assert_eq!(response.response.usage.total_tokens, 15);
        assert!(response.round_usage.is_none());
        assert_eq!(response.response.content, "hi");

        let event = rx.recv().await.unwrap();
        assert!(matches!(
            event.as_ref(),
            DomainEvent::UsageRecorded { total_tokens: 15, .. }
        ));
    }

    #[tokio::test]
    async fn missing_usage_is_skipped() {
        let mut reply = make_text_response("hi");
        reply.usage = None;
        let events = EventBus::new(8);
        let mut rx = events.subscribe();

        let response = chain(SequentialMockModel::new(vec![reply]), &events)
            .next_call(AdvisedRequest::new(PipelineRequest::new("c1", "hello")))
            .await
            .unwrap();

        assert_eq!(response.response.usage.total_tokens, 0);
        assert!(rx.try_recv().is_err());
    }

    #[tokio::test]
    async fn stream_usage_flushed_with_terminal_event() {
        let events = EventBus::new(8);
        let mut rx = events.subscribe();

        let mut stream = chain(SequentialMockModel::streaming(vec!["a", "b"]), &events)
            .next_stream(AdvisedRequest::new(PipelineRequest::new("c1", "hello")))
            .await
            .unwrap();

        // First delta arrives before any usage is recorded
        let first = stream.recv().await.unwrap().unwrap();
        assert!(matches!(first, StreamEvent::Delta(ref t) if t == "a"));

        let (rest, completed) = collect(stream).await.unwrap();
        assert_eq!(rest, vec!["b"]);
        assert_eq!(completed.response.usage.total_tokens, 15);
        assert!(matches!(
            rx.recv().await.unwrap().as_ref(),
            DomainEvent::UsageRecorded { .. }
        ));
    }
}
