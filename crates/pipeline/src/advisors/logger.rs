//! Debug logging of requests and replies.

use crate::advisor::{AdvisedRequest, AdvisedResponse, AdvisedStream, Advisor, Chain, map_completed};
use async_trait::async_trait;
use colloquy_core::error::Result;
use tracing::debug;

pub struct LoggerAdvisor;

fn log_request(request: &AdvisedRequest) {
    debug!(
        conversation_id = %request.request.conversation_id,
        user_message = %request.request.user_message,
        history = request.history.len(),
        documents = request.documents.len(),
        tools = request.tools.len(),
        "Advised request"
    );
}

fn log_response(conversation_id: &str, response: &AdvisedResponse) {
    debug!(
        conversation_id = %conversation_id,
        content = %response.response.content,
        model_rounds = response.response.model_rounds,
        tool_calls = response.response.tool_trace.len(),
        short_circuited = response.short_circuited,
        "Advised response"
    );
}

#[async_trait]
impl Advisor for LoggerAdvisor {
    fn name(&self) -> &str {
        "logger"
    }

    async fn advise_call(&self, request: AdvisedRequest, chain: Chain) -> Result<AdvisedResponse> {
        log_request(&request);
        let conversation_id = request.request.conversation_id.to_string();
        let response = chain.next_call(request).await?;
        log_response(&conversation_id, &response);
        Ok(response)
    }

    async fn advise_stream(&self, request: AdvisedRequest, chain: Chain) -> Result<AdvisedStream> {
        log_request(&request);
        let conversation_id = request.request.conversation_id.to_string();
        let upstream = chain.next_stream(request).await?;
        Ok(map_completed(upstream, move |response| {
            log_response(&conversation_id, &response);
            response
        }))
    }
}
