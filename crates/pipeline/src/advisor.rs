//! The advisor chain: ordered interceptors around one model call.
//!
//! Advisors run in registration order on the way in and in reverse on the
//! way out. Each receives the request and the rest of the chain, and may
//! pass through, rewrite the request, post-process the response,
//! short-circuit without calling further, or abort with an error.
//!
//! Streams are `mpsc` receivers of [`StreamEvent`]s: any number of content
//! deltas followed by exactly one `Completed` carrying the resolved reply.

use async_trait::async_trait;
use colloquy_core::error::{ModelError, PipelineError, Result};
use colloquy_core::message::{Message, ToolCallIntent};
use colloquy_core::model::{
    ChatModel, ModelOptions, ModelRequest, ModelResponse, ToolDefinition, Usage,
};
use colloquy_core::pipeline::{PipelineRequest, PipelineResponse};
use colloquy_core::retrieval::RetrievedDocument;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::debug;

/// Capacity of every stream relay channel.
pub(crate) const STREAM_BUFFER: usize = 32;

/// The request as it travels through the chain.
#[derive(Debug, Clone)]
pub struct AdvisedRequest {
    pub request: PipelineRequest,

    /// The inbound user turn, persisted verbatim on success
    pub user_message: Message,

    /// Base system instructions
    pub system_prompt: Option<String>,

    /// Prior turns loaded from memory, oldest first
    pub history: Vec<Message>,

    /// Retrieved context for this request only
    pub documents: Vec<RetrievedDocument>,

    /// Assistant tool intents and tool results of the current turn
    pub transcript: Vec<Message>,

    pub tools: Vec<ToolDefinition>,

    /// Model round about to run, starting at 1
    pub round: u32,
}

impl AdvisedRequest {
    pub fn new(request: PipelineRequest) -> Self {
        let user_message = Message::user(request.user_message.clone());
        Self {
            request,
            user_message,
            system_prompt: None,
            history: Vec::new(),
            documents: Vec::new(),
            transcript: Vec::new(),
            tools: Vec::new(),
            round: 1,
        }
    }

    pub fn cancel(&self) -> &CancellationToken {
        &self.request.cancel
    }

    /// The system message sent to the model, with retrieved context appended.
    pub fn system_message(&self) -> Option<Message> {
        let base = self.system_prompt.as_deref().unwrap_or_default();
        if self.documents.is_empty() {
            return (!base.is_empty()).then(|| Message::system(base));
        }

        let context = self
            .documents
            .iter()
            .map(|d| d.text.as_str())
            .collect::<Vec<_>>()
            .join("\n");
        let mut text = String::from(base);
        if !text.is_empty() {
            text.push_str("\n\n");
        }
        text.push_str("Context information is below.\n---------------------\n");
        text.push_str(&context);
        text.push_str(
            "\n---------------------\nGiven the context information and the conversation so far, \
             answer the user. If the answer is not in the context, say that you cannot answer.",
        );
        Some(Message::system(text))
    }

    /// Everything the model sees this round, system message first.
    pub fn model_messages(&self) -> Vec<Message> {
        let mut messages = Vec::with_capacity(self.history.len() + self.transcript.len() + 2);
        messages.extend(self.system_message());
        messages.extend(self.history.iter().filter(|m| !m.is_system()).cloned());
        messages.push(self.user_message.clone());
        messages.extend(self.transcript.iter().cloned());
        messages
    }
}

/// The reply as it travels back out of the chain.
#[derive(Debug, Clone)]
pub struct AdvisedResponse {
    /// Accumulated reply; `content` is the latest round's
    pub response: PipelineResponse,

    /// Assistant message of the latest model round
    pub message: Message,

    /// Usage of the latest round not yet accounted for
    pub round_usage: Option<Usage>,

    /// Model that answered the latest round
    pub model: String,

    /// Set when a returns-direct tool produced the content
    pub short_circuited: bool,
}

impl AdvisedResponse {
    /// Wrap one model round.
    pub fn from_model(response: ModelResponse) -> Self {
        Self {
            response: PipelineResponse {
                content: response.message.content().to_string(),
                model_rounds: 1,
                ..PipelineResponse::default()
            },
            round_usage: response.usage,
            model: response.model,
            message: response.message,
            short_circuited: false,
        }
    }

    /// A reply produced without calling the model.
    pub fn short_circuit(content: impl Into<String>) -> Self {
        let content = content.into();
        Self {
            response: PipelineResponse::new(content.clone()),
            message: Message::assistant(content),
            round_usage: None,
            model: String::new(),
            short_circuited: true,
        }
    }

    pub fn tool_calls(&self) -> &[ToolCallIntent] {
        self.message.tool_calls()
    }
}

/// One item of an advised stream.
#[derive(Debug, Clone)]
pub enum StreamEvent {
    Delta(String),
    Completed(AdvisedResponse),
}

pub type AdvisedStream = mpsc::Receiver<Result<StreamEvent>>;

/// An interceptor in the chain.
#[async_trait]
pub trait Advisor: Send + Sync {
    /// Unique name, used to place the advisor from configuration.
    fn name(&self) -> &str;

    async fn advise_call(&self, request: AdvisedRequest, chain: Chain) -> Result<AdvisedResponse> {
        chain.next_call(request).await
    }

    async fn advise_stream(&self, request: AdvisedRequest, chain: Chain) -> Result<AdvisedStream> {
        chain.next_stream(request).await
    }
}

/// The remainder of the chain, from one advisor's point of view.
///
/// Cheap to clone; an advisor that loops (tool dispatch) clones it once per
/// round.
#[derive(Clone)]
pub struct Chain {
    advisors: Arc<[Arc<dyn Advisor>]>,
    position: usize,
    terminal: Arc<ModelStep>,
}

impl Chain {
    pub(crate) fn new(advisors: Vec<Arc<dyn Advisor>>, terminal: ModelStep) -> Self {
        Self {
            advisors: advisors.into(),
            position: 0,
            terminal: Arc::new(terminal),
        }
    }

    /// Names of the advisors still ahead, in order.
    pub fn remaining(&self) -> Vec<&str> {
        self.advisors[self.position.min(self.advisors.len())..]
            .iter()
            .map(|a| a.name())
            .collect()
    }

    pub async fn next_call(mut self, request: AdvisedRequest) -> Result<AdvisedResponse> {
        match self.advisors.get(self.position).cloned() {
            Some(advisor) => {
                self.position += 1;
                advisor.advise_call(request, self).await
            }
            None => self.terminal.call(request).await,
        }
    }

    pub async fn next_stream(mut self, request: AdvisedRequest) -> Result<AdvisedStream> {
        match self.advisors.get(self.position).cloned() {
            Some(advisor) => {
                self.position += 1;
                advisor.advise_stream(request, self).await
            }
            None => self.terminal.stream(request).await,
        }
    }
}

/// The innermost step: the model call itself.
pub(crate) struct ModelStep {
    model: Arc<dyn ChatModel>,
    defaults: ModelOptions,
    timeout: Duration,
}

impl ModelStep {
    pub(crate) fn new(
        model: Arc<dyn ChatModel>,
        defaults: ModelOptions,
        timeout: Duration,
    ) -> Self {
        Self {
            model,
            defaults,
            timeout,
        }
    }

    fn model_request(&self, request: &AdvisedRequest) -> ModelRequest {
        let overrides = &request.request.options;
        ModelRequest {
            messages: request.model_messages(),
            tools: request.tools.clone(),
            options: ModelOptions {
                model: overrides.model.clone().or_else(|| self.defaults.model.clone()),
                temperature: overrides.temperature.or(self.defaults.temperature),
                max_tokens: overrides.max_tokens.or(self.defaults.max_tokens),
            },
        }
    }

    fn timeout_error(&self) -> ModelError {
        ModelError::Timeout(format!(
            "no reply from '{}' within {}ms",
            self.model.name(),
            self.timeout.as_millis()
        ))
    }

    async fn call(&self, request: AdvisedRequest) -> Result<AdvisedResponse> {
        let model_request = self.model_request(&request);
        debug!(
            conversation_id = %request.request.conversation_id,
            round = request.round,
            messages = model_request.messages.len(),
            tools = model_request.tools.len(),
            "Invoking model"
        );

        let response = guarded(
            request.cancel(),
            self.timeout,
            self.model.invoke(model_request),
            || self.timeout_error(),
        )
        .await??;
        Ok(AdvisedResponse::from_model(response))
    }

    async fn stream(&self, request: AdvisedRequest) -> Result<AdvisedStream> {
        let model_request = self.model_request(&request);
        let model_name = model_request
            .options
            .model
            .clone()
            .unwrap_or_else(|| self.model.name().to_string());
        let deadline = tokio::time::Instant::now() + self.timeout;

        let mut chunks = guarded(
            request.cancel(),
            self.timeout,
            self.model.stream(model_request),
            || self.timeout_error(),
        )
        .await??;

        let timeout_error = self.timeout_error();
        let cancel = request.cancel().clone();
        let (tx, rx) = mpsc::channel(STREAM_BUFFER);

        tokio::spawn(async move {
            let mut content = String::new();
            let mut tool_calls = Vec::new();
            let mut usage = None;

            loop {
                let next = tokio::select! {
                    biased;
                    _ = cancel.cancelled() => Err(PipelineError::Cancelled),
                    chunk = tokio::time::timeout_at(deadline, chunks.recv()) => match chunk {
                        Ok(chunk) => Ok(chunk),
                        Err(_) => Err(PipelineError::Model(timeout_error.clone())),
                    },
                };

                let chunk = match next {
                    Ok(Some(Ok(chunk))) => chunk,
                    // Sender gone without a terminal chunk; keep what arrived
                    Ok(None) => break,
                    Ok(Some(Err(e))) => {
                        let _ = tx.send(Err(e.into())).await;
                        return;
                    }
                    Err(e) => {
                        let _ = tx.send(Err(e)).await;
                        return;
                    }
                };

                if let Some(text) = chunk.content.filter(|t| !t.is_empty()) {
                    content.push_str(&text);
                    if tx.send(Ok(StreamEvent::Delta(text))).await.is_err() {
                        return;
                    }
                }
                tool_calls.extend(chunk.tool_calls);
                if chunk.usage.is_some() {
                    usage = chunk.usage;
                }
                if chunk.done {
                    break;
                }
            }

            let message = if tool_calls.is_empty() {
                Message::assistant(content)
            } else {
                Message::assistant_with_tool_calls(content, tool_calls)
            };
            let response = AdvisedResponse::from_model(ModelResponse {
                message,
                usage,
                model: model_name,
            });
            let _ = tx.send(Ok(StreamEvent::Completed(response))).await;
        });

        Ok(rx)
    }
}

/// Run `fut` under `limit`, giving up as soon as `cancel` fires.
///
/// The outer error is only ever [`PipelineError::Cancelled`]; the inner
/// result carries the call's own error or `on_timeout()`.
pub(crate) async fn guarded<T, E>(
    cancel: &CancellationToken,
    limit: Duration,
    fut: impl Future<Output = std::result::Result<T, E>>,
    on_timeout: impl FnOnce() -> E,
) -> Result<std::result::Result<T, E>> {
    tokio::select! {
        biased;
        _ = cancel.cancelled() => Err(PipelineError::Cancelled),
        res = tokio::time::timeout(limit, fut) => Ok(res.unwrap_or_else(|_| Err(on_timeout()))),
    }
}

/// Run `fut` unless `cancel` fires first.
pub(crate) async fn cancellable<T>(
    cancel: &CancellationToken,
    fut: impl Future<Output = T>,
) -> Result<T> {
    tokio::select! {
        biased;
        _ = cancel.cancelled() => Err(PipelineError::Cancelled),
        out = fut => Ok(out),
    }
}

/// Forward `upstream`, applying `f` to the completed reply.
///
/// Deltas pass through untouched and in order. Stops as soon as the
/// downstream receiver is dropped.
pub(crate) fn map_completed<F>(mut upstream: AdvisedStream, f: F) -> AdvisedStream
where
    F: FnOnce(AdvisedResponse) -> AdvisedResponse + Send + 'static,
{
    let (tx, rx) = mpsc::channel(STREAM_BUFFER);
    tokio::spawn(async move {
        let mut f = Some(f);
        while let Some(event) = upstream.recv().await {
            let event = match (event, f.take()) {
                (Ok(StreamEvent::Completed(response)), Some(f)) => {
                    Ok(StreamEvent::Completed(f(response)))
                }
                (event, unused) => {
                    f = unused;
                    event
                }
            };
            if tx.send(event).await.is_err() {
                return;
            }
        }
    });
    rx
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_helpers::{SequentialMockModel, StalledModel, collect};
    use colloquy_core::pipeline::PipelineRequest;

    /// Records its name on the way in and out.
    struct Tracer {
        name: &'static str,
        log: Arc<std::sync::Mutex<Vec<String>>>,
    }

    #[async_trait]
    impl Advisor for Tracer {
        fn name(&self) -> &str {
            self.name
        }

        async fn advise_call(
            &self,
            request: AdvisedRequest,
            chain: Chain,
        ) -> Result<AdvisedResponse> {
            self.log.lock().unwrap().push(format!("in:{}", self.name));
            let response = chain.next_call(request).await?;
            self.log.lock().unwrap().push(format!("out:{}", self.name));
            Ok(response)
        }
    }

    struct Refuse;

    #[async_trait]
    impl Advisor for Refuse {
        fn name(&self) -> &str {
            "refuse"
        }

        async fn advise_call(
            &self,
            _request: AdvisedRequest,
            _chain: Chain,
        ) -> Result<AdvisedResponse> {
            Ok(AdvisedResponse::short_circuit("Not today."))
        }
    }

    fn step(model: Arc<dyn ChatModel>) -> ModelStep {
        ModelStep::new(model, ModelOptions::default(), Duration::from_secs(5))
    }

    #[tokio::test]
    async fn onion_order() {
        let log = Arc::new(std::sync::Mutex::new(Vec::new()));
        let advisors: Vec<Arc<dyn Advisor>> = vec![
            Arc::new(Tracer { name: "a", log: log.clone() }),
            Arc::new(Tracer { name: "b", log: log.clone() }),
        ];
        let model = Arc::new(SequentialMockModel::single_text("hi"));
        let chain = Chain::new(advisors, step(model));
        assert_eq!(chain.remaining(), vec!["a", "b"]);

        let response = chain
            .next_call(AdvisedRequest::new(PipelineRequest::new("c1", "hello")))
            .await
            .unwrap();
        assert_eq!(response.response.content, "hi");
        assert_eq!(*log.lock().unwrap(), vec!["in:a", "in:b", "out:b", "out:a"]);
    }

    #[tokio::test]
    async fn short_circuit_skips_model() {
        let model = Arc::new(SequentialMockModel::new(vec![]));
        let chain = Chain::new(vec![Arc::new(Refuse)], step(model.clone()));
        let response = chain
            .next_call(AdvisedRequest::new(PipelineRequest::new("c1", "hello")))
            .await
            .unwrap();
        assert_eq!(response.response.content, "Not today.");
        assert_eq!(model.call_count(), 0);
    }

    #[test]
    fn context_goes_into_system_message() {
        let mut request = AdvisedRequest::new(PipelineRequest::new("c1", "How many leaves?"));
        request.system_prompt = Some("You are an HR assistant.".into());
        request.documents = vec![
            RetrievedDocument {
                text: "Employees get 24 paid leaves.".into(),
                score: 0.9,
                source_id: "hr-1".into(),
            },
            RetrievedDocument {
                text: "Leaves reset in January.".into(),
                score: 0.8,
                source_id: "hr-2".into(),
            },
        ];

        let messages = request.model_messages();
        assert_eq!(messages.len(), 2);
        assert!(messages[0].is_system());
        assert!(messages[0].content().starts_with("You are an HR assistant."));
        assert!(
            messages[0]
                .content()
                .contains("Employees get 24 paid leaves.\nLeaves reset in January.")
        );
        assert_eq!(messages[1].content(), "How many leaves?");
    }

    #[tokio::test]
    async fn stream_forwards_deltas_then_completes() {
        let model = Arc::new(SequentialMockModel::streaming(vec!["New ", "Delhi", "."]));
        let chain = Chain::new(vec![], step(model));
        let rx = chain
            .next_stream(AdvisedRequest::new(PipelineRequest::new("c1", "capital?")))
            .await
            .unwrap();

        let (deltas, completed) = collect(rx).await.unwrap();
        assert_eq!(deltas, vec!["New ", "Delhi", "."]);
        assert_eq!(completed.response.content, "New Delhi.");
        assert!(completed.round_usage.is_some());
    }

    #[tokio::test(start_paused = true)]
    async fn model_timeout() {
        let step = ModelStep::new(
            Arc::new(StalledModel),
            ModelOptions::default(),
            Duration::from_millis(50),
        );
        let chain = Chain::new(vec![], step);
        let err = chain
            .next_call(AdvisedRequest::new(PipelineRequest::new("c1", "hello")))
            .await
            .unwrap_err();
        assert!(matches!(err, PipelineError::Model(ModelError::Timeout(_))));
        assert!(err.is_timeout());
    }

    #[tokio::test]
    async fn cancelled_before_model_replies() {
        let cancel = CancellationToken::new();
        let request = PipelineRequest::new("c1", "hello").with_cancellation(cancel.clone());
        cancel.cancel();
        let chain = Chain::new(vec![], step(Arc::new(StalledModel)));
        let err = chain.next_call(AdvisedRequest::new(request)).await.unwrap_err();
        assert!(matches!(err, PipelineError::Cancelled));
    }
}
