//! Tool dispatch: runs the model's tool intents and loops the model.
//!
//! After each model round, every intent runs in order under its own
//! timeout. Per-tool failures (unknown name, bad arguments, missing context,
//! tool error, timeout) are reported back to the model as the tool's result
//! and never abort the request. If any returns-direct tool succeeds, its
//! output is the final answer. Otherwise the results go back to the model for
//! another round, up to `max_rounds` extra rounds.

use crate::advisor::{
    AdvisedRequest, AdvisedResponse, AdvisedStream, Advisor, Chain, STREAM_BUFFER, StreamEvent,
    guarded,
};
use async_trait::async_trait;
use chrono::Utc;
use colloquy_config::ToolsConfig;
use colloquy_core::error::{ModelError, PipelineError, Result, ToolError};
use colloquy_core::event::{DomainEvent, EventBus};
use colloquy_core::message::{Message, ToolCallIntent};
use colloquy_core::model::Usage;
use colloquy_core::pipeline::{TokenUsage, ToolInvocation};
use colloquy_core::tool::ToolRegistry;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

#[derive(Clone)]
pub struct ToolDispatchAdvisor {
    registry: Arc<ToolRegistry>,
    max_rounds: u32,
    timeout: Duration,
    events: EventBus,
}

/// What the rounds so far add up to.
#[derive(Default)]
struct Rounds {
    usage: TokenUsage,

    /// Round usage no inner advisor has recorded yet
    unaudited: Option<Usage>,
    model_rounds: u32,
    trace: Vec<ToolInvocation>,
}

impl Rounds {
    fn absorb(&mut self, response: &mut AdvisedResponse) {
        self.usage.merge(&response.response.usage);
        if let Some(usage) = response.round_usage.take() {
            self.unaudited.get_or_insert_with(Usage::default).add(&usage);
        }
        self.model_rounds += response.response.model_rounds;
        self.trace.append(&mut response.response.tool_trace);
    }

    /// The final reply, handing unaudited usage on to outer advisors.
    fn finish(self, mut response: AdvisedResponse) -> AdvisedResponse {
        response.response.usage = self.usage;
        response.round_usage = self.unaudited;
        response.response.model_rounds = self.model_rounds;
        response.response.tool_trace = self.trace;
        response
    }
}

enum Next {
    Done(AdvisedResponse),
    Again,
}

/// Results of one round of tool invocations.
struct RoundOutcome {
    invocations: Vec<ToolInvocation>,
    messages: Vec<Message>,
    direct: Vec<String>,
}

impl ToolDispatchAdvisor {
    /// One extra model round, 30 second tool timeout.
    pub fn new(registry: Arc<ToolRegistry>, events: EventBus) -> Self {
        Self::from_config(registry, &ToolsConfig::default(), events)
    }

    pub fn from_config(
        registry: Arc<ToolRegistry>,
        config: &ToolsConfig,
        events: EventBus,
    ) -> Self {
        Self {
            registry,
            max_rounds: config.max_rounds,
            timeout: Duration::from_millis(config.timeout_ms),
            events,
        }
    }

    pub fn with_max_rounds(mut self, max_rounds: u32) -> Self {
        self.max_rounds = max_rounds;
        self
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    /// Decide what follows a completed model round.
    async fn after_round(
        &self,
        request: &mut AdvisedRequest,
        mut response: AdvisedResponse,
        rounds: &mut Rounds,
    ) -> Result<Next> {
        rounds.absorb(&mut response);

        let intents = response.tool_calls().to_vec();
        if intents.is_empty() {
            return Ok(Next::Done(std::mem::take(rounds).finish(response)));
        }
        if request.round > self.max_rounds {
            warn!(
                conversation_id = %request.request.conversation_id,
                max_rounds = self.max_rounds,
                "Model still requesting tools after the last allowed round"
            );
            return Err(ToolError::RoundLimitExceeded {
                max_rounds: self.max_rounds,
            }
            .into());
        }

        let outcome = self.dispatch(request, &intents).await?;
        rounds.trace.extend(outcome.invocations);

        if !outcome.direct.is_empty() {
            response.response.content = outcome.direct.join("\n");
            response.short_circuited = true;
            info!(
                conversation_id = %request.request.conversation_id,
                round = request.round,
                "Returning tool output directly"
            );
            return Ok(Next::Done(std::mem::take(rounds).finish(response)));
        }

        request.transcript.push(response.message);
        request.transcript.extend(outcome.messages);
        request.round += 1;
        Ok(Next::Again)
    }

    async fn dispatch(
        &self,
        request: &AdvisedRequest,
        intents: &[ToolCallIntent],
    ) -> Result<RoundOutcome> {
        let conversation_id = request.request.conversation_id.to_string();
        let mut outcome = RoundOutcome {
            invocations: Vec::with_capacity(intents.len()),
            messages: Vec::with_capacity(intents.len()),
            direct: Vec::new(),
        };

        debug!(
            conversation_id = %conversation_id,
            round = request.round,
            tool_count = intents.len(),
            "Executing tool calls"
        );

        for intent in intents {
            let start = Instant::now();
            let timeout_ms = self.timeout.as_millis() as u64;
            let result = guarded(
                request.cancel(),
                self.timeout,
                self.registry.invoke(intent, &request.request.context),
                || ToolError::Timeout {
                    tool_name: intent.name.clone(),
                    timeout_ms,
                },
            )
            .await?;
            let duration_ms = start.elapsed().as_millis() as u64;

            let returns_direct = self
                .registry
                .get(&intent.name)
                .is_some_and(|tool| tool.returns_direct());
            let (output, success) = match result {
                Ok(output) => (output, true),
                Err(e) => {
                    warn!(
                        conversation_id = %conversation_id,
                        tool = %intent.name,
                        error = %e,
                        "Tool invocation failed"
                    );
                    (format!("Error: {e}"), false)
                }
            };

            self.events.publish(DomainEvent::ToolInvoked {
                conversation_id: conversation_id.clone(),
                tool_name: intent.name.clone(),
                success,
                duration_ms,
                timestamp: Utc::now(),
            });

            if success && returns_direct {
                outcome.direct.push(output.clone());
            }
            outcome.messages.push(Message::tool_result(intent.id.clone(), output.clone()));
            outcome.invocations.push(ToolInvocation {
                call_id: intent.id.clone(),
                tool_name: intent.name.clone(),
                arguments: intent.arguments.clone(),
                output,
                success,
                returns_direct,
                duration_ms,
                round: request.round,
            });
        }

        Ok(outcome)
    }

    async fn relay(
        &self,
        mut request: AdvisedRequest,
        chain: Chain,
        mut upstream: AdvisedStream,
        tx: &mpsc::Sender<Result<StreamEvent>>,
    ) -> Result<()> {
        let mut rounds = Rounds::default();
        loop {
            // A round's text is released only once the round turns out final
            let mut held = Vec::new();
            let mut completed = None;
            while let Some(event) = upstream.recv().await {
                match event? {
                    StreamEvent::Delta(text) => held.push(text),
                    StreamEvent::Completed(response) => {
                        completed = Some(response);
                        break;
                    }
                }
            }
            let response = completed.ok_or_else(|| {
                PipelineError::Model(ModelError::StreamInterrupted(
                    "stream ended before the round completed".into(),
                ))
            })?;

            match self.after_round(&mut request, response, &mut rounds).await? {
                Next::Done(response) => {
                    if response.short_circuited {
                        held = vec![response.response.content.clone()];
                    }
                    for text in held {
                        if tx.send(Ok(StreamEvent::Delta(text))).await.is_err() {
                            return Ok(());
                        }
                    }
                    let _ = tx.send(Ok(StreamEvent::Completed(response))).await;
                    return Ok(());
                }
                Next::Again => {
                    upstream = chain.clone().next_stream(request.clone()).await?;
                }
            }
        }
    }
}

#[async_trait]
impl Advisor for ToolDispatchAdvisor {
    fn name(&self) -> &str {
        "tool_dispatch"
    }

    async fn advise_call(
        &self,
        mut request: AdvisedRequest,
        chain: Chain,
    ) -> Result<AdvisedResponse> {
        request.tools.extend(self.registry.definitions());
        let mut rounds = Rounds::default();
        loop {
            let response = chain.clone().next_call(request.clone()).await?;
            let next = self.after_round(&mut request, response, &mut rounds).await?;
            if let Next::Done(response) = next {
                return Ok(response);
            }
        }
    }

    async fn advise_stream(
        &self,
        mut request: AdvisedRequest,
        chain: Chain,
    ) -> Result<AdvisedStream> {
        request.tools.extend(self.registry.definitions());
        let first = chain.clone().next_stream(request.clone()).await?;

        let this = self.clone();
        let (tx, rx) = mpsc::channel(STREAM_BUFFER);
        tokio::spawn(async move {
            if let Err(e) = this.relay(request, chain, first, &tx).await {
                let _ = tx.send(Err(e)).await;
            }
        });
        Ok(rx)
    }
}
