//! The advisor chain executor.
//!
//! Runs one request through the chain and, on success (including a
//! short-circuit), writes the user + assistant turn to conversation memory
//! exactly once. An aborted or cancelled request persists nothing.

use crate::advisor::{
    AdvisedRequest, AdvisedResponse, AdvisedStream, Advisor, Chain, ModelStep, STREAM_BUFFER,
    StreamEvent, cancellable,
};
use crate::registry::AdvisorRegistry;
use chrono::Utc;
use colloquy_config::{AppConfig, MemoryFailurePolicy};
use colloquy_core::error::{ConfigurationError, ModelError, PipelineError, Result};
use colloquy_core::event::{DomainEvent, EventBus};
use colloquy_core::message::{ConversationId, Message};
use colloquy_core::model::{ChatModel, ModelOptions};
use colloquy_core::pipeline::{PipelineChunk, PipelineRequest, PipelineResponse};
use colloquy_memory::ConversationMemory;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

/// An assembled pipeline: an ordered advisor chain around a model.
#[derive(Clone)]
pub struct ChatPipeline {
    chain: Chain,
    memory: Option<Arc<ConversationMemory>>,
    memory_policy: MemoryFailurePolicy,
    system_prompt: Option<String>,
    events: EventBus,
}

pub struct ChatPipelineBuilder {
    model: Arc<dyn ChatModel>,
    advisors: Vec<Arc<dyn Advisor>>,
    memory: Option<Arc<ConversationMemory>>,
    memory_policy: MemoryFailurePolicy,
    system_prompt: Option<String>,
    options: ModelOptions,
    model_timeout: Duration,
    events: EventBus,
}

impl ChatPipelineBuilder {
    /// Append an advisor; the first added is the outermost.
    pub fn advisor(mut self, advisor: Arc<dyn Advisor>) -> Self {
        self.advisors.push(advisor);
        self
    }

    pub fn advisors(mut self, advisors: impl IntoIterator<Item = Arc<dyn Advisor>>) -> Self {
        self.advisors.extend(advisors);
        self
    }

    /// Conversation memory the completed turn is written to.
    pub fn memory(mut self, memory: Arc<ConversationMemory>) -> Self {
        self.memory = Some(memory);
        self
    }

    pub fn memory_policy(mut self, policy: MemoryFailurePolicy) -> Self {
        self.memory_policy = policy;
        self
    }

    pub fn system_prompt(mut self, prompt: impl Into<String>) -> Self {
        self.system_prompt = Some(prompt.into());
        self
    }

    /// Defaults for options a request leaves unset.
    pub fn model_options(mut self, options: ModelOptions) -> Self {
        self.options = options;
        self
    }

    pub fn model_timeout(mut self, timeout: Duration) -> Self {
        self.model_timeout = timeout;
        self
    }

    pub fn events(mut self, events: EventBus) -> Self {
        self.events = events;
        self
    }

    pub fn build(self) -> std::result::Result<ChatPipeline, ConfigurationError> {
        for (i, advisor) in self.advisors.iter().enumerate() {
            if self.advisors[..i].iter().any(|a| a.name() == advisor.name()) {
                return Err(ConfigurationError::DuplicateAdvisor(advisor.name().to_string()));
            }
        }

        debug!(
            advisors = ?self.advisors.iter().map(|a| a.name()).collect::<Vec<_>>(),
            model = %self.model.name(),
            "Building pipeline"
        );
        let terminal = ModelStep::new(self.model, self.options, self.model_timeout);
        Ok(ChatPipeline {
            chain: Chain::new(self.advisors, terminal),
            memory: self.memory,
            memory_policy: self.memory_policy,
            system_prompt: self.system_prompt,
            events: self.events,
        })
    }
}

impl ChatPipeline {
    pub fn builder(model: Arc<dyn ChatModel>) -> ChatPipelineBuilder {
        ChatPipelineBuilder {
            model,
            advisors: Vec::new(),
            memory: None,
            memory_policy: MemoryFailurePolicy::default(),
            system_prompt: None,
            options: ModelOptions::default(),
            model_timeout: Duration::from_secs(60),
            events: EventBus::default(),
        }
    }

    /// Lay out the chain named in `config.pipeline.advisors`.
    ///
    /// `retrieval` is left out while retrieval is disabled, and
    /// `tool_dispatch` while no tool is enabled. Memory is persisted only if
    /// the `memory` advisor is part of the chain.
    pub fn from_config(
        config: &AppConfig,
        model: Arc<dyn ChatModel>,
        registry: &AdvisorRegistry,
        memory: Option<Arc<ConversationMemory>>,
        events: EventBus,
    ) -> std::result::Result<Self, ConfigurationError> {
        let names: Vec<&str> = config
            .pipeline
            .advisors
            .iter()
            .map(String::as_str)
            .filter(|name| *name != "retrieval" || config.retrieval.enabled)
            .filter(|name| *name != "tool_dispatch" || !config.tools.enabled.is_empty())
            .collect();
        let advisors = registry.resolve(&names)?;

        let mut builder = Self::builder(model)
            .advisors(advisors)
            .memory_policy(config.memory.on_failure)
            .model_options(ModelOptions {
                model: Some(config.model.model.clone()),
                temperature: Some(config.model.temperature),
                max_tokens: config.model.max_tokens,
            })
            .model_timeout(Duration::from_secs(config.model.timeout_secs))
            .events(events);
        if !config.pipeline.system_prompt.trim().is_empty() {
            builder = builder.system_prompt(config.pipeline.system_prompt.clone());
        }
        if let Some(memory) = memory.filter(|_| names.contains(&"memory")) {
            builder = builder.memory(memory);
        }
        builder.build()
    }

    /// Advisor names, outermost first.
    pub fn advisor_names(&self) -> Vec<&str> {
        self.chain.remaining()
    }

    pub fn events(&self) -> &EventBus {
        &self.events
    }

    fn advised(&self, request: PipelineRequest) -> AdvisedRequest {
        let mut advised = AdvisedRequest::new(request);
        advised.system_prompt = self.system_prompt.clone();
        advised
    }

    /// Run one request to completion.
    pub async fn call(&self, request: PipelineRequest) -> Result<PipelineResponse> {
        let started = Instant::now();
        let conversation_id = request.conversation_id.clone();
        let cancel = request.cancel.clone();
        info!(conversation_id = %conversation_id, "Processing request");

        let result = async {
            if cancel.is_cancelled() {
                return Err(PipelineError::Cancelled);
            }
            let advised = self.advised(request);
            let user = advised.user_message.clone();
            let response = self.chain.clone().next_call(advised).await?;
            self.persist(&conversation_id, &cancel, user, &response).await?;
            Ok(response.response)
        }
        .await;

        self.report(&conversation_id, started, result.as_ref());
        result
    }

    /// Run one request, streaming content as it arrives.
    ///
    /// Yields [`PipelineChunk::Delta`]s in model order, then one
    /// [`PipelineChunk::Done`] once the turn has been persisted. Dropping
    /// the receiver abandons the request.
    pub async fn stream(
        &self,
        request: PipelineRequest,
    ) -> Result<mpsc::Receiver<Result<PipelineChunk>>> {
        let started = Instant::now();
        let conversation_id = request.conversation_id.clone();
        let cancel = request.cancel.clone();
        info!(conversation_id = %conversation_id, "Processing streamed request");

        let opened = async {
            if cancel.is_cancelled() {
                return Err(PipelineError::Cancelled);
            }
            let advised = self.advised(request);
            let user = advised.user_message.clone();
            let upstream = self.chain.clone().next_stream(advised).await?;
            Ok((user, upstream))
        }
        .await;
        let (user, upstream) = match opened {
            Ok(opened) => opened,
            Err(e) => {
                self.report(&conversation_id, started, Err(&e));
                return Err(e);
            }
        };

        let this = self.clone();
        let (tx, rx) = mpsc::channel(STREAM_BUFFER);
        tokio::spawn(async move {
            match this.relay(&conversation_id, &cancel, user, upstream, &tx).await {
                Ok(Some(response)) => this.report(&conversation_id, started, Ok(&response)),
                Ok(None) => debug!(conversation_id = %conversation_id, "Stream receiver dropped"),
                Err(e) => {
                    this.report(&conversation_id, started, Err(&e));
                    let _ = tx.send(Err(e)).await;
                }
            }
        });
        Ok(rx)
    }

    /// Forward deltas; persist and emit `Done` on completion.
    ///
    /// `Ok(None)` means the receiver went away first.
    async fn relay(
        &self,
        conversation_id: &ConversationId,
        cancel: &CancellationToken,
        user: Message,
        mut upstream: AdvisedStream,
        tx: &mpsc::Sender<Result<PipelineChunk>>,
    ) -> Result<Option<PipelineResponse>> {
        loop {
            let event = cancellable(cancel, upstream.recv()).await?;
            match event {
                Some(Ok(StreamEvent::Delta(content))) => {
                    if tx.send(Ok(PipelineChunk::Delta { content })).await.is_err() {
                        return Ok(None);
                    }
                }
                Some(Ok(StreamEvent::Completed(response))) => {
                    self.persist(conversation_id, cancel, user, &response).await?;
                    let response = response.response;
                    let done = PipelineChunk::Done {
                        response: response.clone(),
                    };
                    if tx.send(Ok(done)).await.is_err() {
                        return Ok(None);
                    }
                    return Ok(Some(response));
                }
                Some(Err(e)) => return Err(e),
                None => {
                    return Err(ModelError::StreamInterrupted(
                        "stream ended without a final reply".into(),
                    )
                    .into());
                }
            }
        }
    }

    async fn persist(
        &self,
        conversation_id: &ConversationId,
        cancel: &CancellationToken,
        user: Message,
        response: &AdvisedResponse,
    ) -> Result<()> {
        let Some(memory) = &self.memory else {
            return Ok(());
        };

        let turn = vec![user, Message::assistant(response.response.content.clone())];
        match cancellable(cancel, memory.append_all(conversation_id, turn)).await? {
            Ok(history) => {
                self.events.publish(DomainEvent::MemoryPersisted {
                    conversation_id: conversation_id.to_string(),
                    history_len: history.len(),
                    timestamp: Utc::now(),
                });
                Ok(())
            }
            Err(e) if self.memory_policy == MemoryFailurePolicy::Proceed => {
                warn!(conversation_id = %conversation_id, error = %e, "Turn not persisted");
                Ok(())
            }
            Err(e) => Err(e.into()),
        }
    }

    fn report(
        &self,
        conversation_id: &ConversationId,
        started: Instant,
        result: std::result::Result<&PipelineResponse, &PipelineError>,
    ) {
        let duration_ms = started.elapsed().as_millis() as u64;
        match result {
            Ok(response) => {
                info!(
                    conversation_id = %conversation_id,
                    model_rounds = response.model_rounds,
                    total_tokens = response.usage.total_tokens,
                    duration_ms,
                    "Request completed"
                );
                self.events.publish(DomainEvent::RequestCompleted {
                    conversation_id: conversation_id.to_string(),
                    model_rounds: response.model_rounds,
                    total_tokens: response.usage.total_tokens,
                    duration_ms,
                    timestamp: Utc::now(),
                });
            }
            Err(e) => {
                warn!(
                    conversation_id = %conversation_id,
                    error = %e,
                    duration_ms,
                    "Request failed"
                );
                self.events.publish(DomainEvent::RequestFailed {
                    conversation_id: conversation_id.to_string(),
                    error_message: e.to_string(),
                    timestamp: Utc::now(),
                });
            }
        }
    }
}

impl std::fmt::Debug for ChatPipeline {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ChatPipeline")
            .field("advisors", &self.advisor_names())
            .field("memory", &self.memory.is_some())
            .finish()
    }
}
