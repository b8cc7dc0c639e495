//! End-to-end integration tests for the Colloquy pipeline.
//!
//! These tests exercise the full path from a user message to the resolved
//! reply: advisor chain assembly, conversation memory, retrieval, tool
//! dispatch, usage accounting, validation with retries, streaming and
//! cancellation.

use std::sync::{Arc, Mutex};
use std::time::Duration;

use colloquy_config::{AppConfig, DEFAULT_FALLBACK_MESSAGE, MemoryBackendKind};
use colloquy_core::error::{ModelError, PipelineError};
use colloquy_core::event::{DomainEvent, EventBus};
use colloquy_core::message::{Message, Role, ToolCallIntent};
use colloquy_core::model::{
    ChatModel, EmbeddingRequest, EmbeddingResponse, ModelChunk, ModelRequest, ModelResponse, Usage,
};
use colloquy_core::pipeline::{PipelineChunk, PipelineRequest};
use colloquy_core::tool::ToolRegistry;
use colloquy_memory::{
    ConversationMemory, EmbeddedDocument, FileRepository, InMemoryRepository, InMemoryVectorIndex,
};
use colloquy_pipeline::{
    AdvisorRegistry, ChatPipeline, LoggerAdvisor, MemoryAdvisor, RelevancyEvaluator, RetrievalAdvisor,
    ToolDispatchAdvisor, UsageAuditAdvisor, ValidatingPipeline,
};
use colloquy_telemetry::TelemetryEngine;
use colloquy_tools::{TicketRepository, default_registry};
use tokio::sync::mpsc;

// ── Mock Model ───────────────────────────────────────────────────────────

/// A mock model that returns scripted responses in sequence.
struct ScriptedModel {
    responses: Vec<ModelResponse>,
    requests: Mutex<Vec<ModelRequest>>,
    stall: bool,
}

impl ScriptedModel {
    fn new(responses: Vec<ModelResponse>) -> Self {
        Self {
            responses,
            requests: Mutex::new(Vec::new()),
            stall: false,
        }
    }

    fn text(response: &str) -> Self {
        Self::new(vec![text_response(response)])
    }

    fn repeated(response: &str, n: usize) -> Self {
        Self::new((0..n).map(|_| text_response(response)).collect())
    }

    fn tool_then_text(tool_calls: Vec<ToolCallIntent>, answer: &str) -> Self {
        Self::new(vec![tool_response(tool_calls), text_response(answer)])
    }

    /// Never answers.
    fn stalled() -> Self {
        Self {
            stall: true,
            ..Self::new(Vec::new())
        }
    }

    fn calls(&self) -> usize {
        self.requests.lock().unwrap().len()
    }

    fn last_request(&self) -> ModelRequest {
        self.requests.lock().unwrap().last().cloned().unwrap()
    }
}

#[async_trait::async_trait]
impl ChatModel for ScriptedModel {
    fn name(&self) -> &str {
        "e2e_mock"
    }

    async fn invoke(&self, request: ModelRequest) -> Result<ModelResponse, ModelError> {
        if self.stall {
            std::future::pending::<()>().await;
        }
        let mut requests = self.requests.lock().unwrap();
        let n = requests.len();
        if n >= self.responses.len() {
            panic!("ScriptedModel exhausted: call #{n}, have {}", self.responses.len());
        }
        requests.push(request);
        Ok(self.responses[n].clone())
    }

    async fn stream(
        &self,
        request: ModelRequest,
    ) -> Result<mpsc::Receiver<Result<ModelChunk, ModelError>>, ModelError> {
        let response = self.invoke(request).await?;
        let words: Vec<String> = response
            .message
            .content()
            .split_inclusive(' ')
            .map(String::from)
            .collect();

        let (tx, rx) = mpsc::channel(words.len() + 1);
        for word in words {
            tx.try_send(Ok(ModelChunk {
                content: Some(word),
                ..ModelChunk::default()
            }))
            .unwrap();
        }
        tx.try_send(Ok(ModelChunk {
            content: None,
            tool_calls: response.message.tool_calls().to_vec(),
            done: true,
            usage: response.usage,
        }))
        .unwrap();
        Ok(rx)
    }
}

/// Embeds text on two axes: leave policy vs. everything else.
struct KeywordEmbedder;

#[async_trait::async_trait]
impl ChatModel for KeywordEmbedder {
    fn name(&self) -> &str {
        "keyword_embedder"
    }

    async fn invoke(&self, _request: ModelRequest) -> Result<ModelResponse, ModelError> {
        Err(ModelError::NotConfigured("embeddings only".into()))
    }

    async fn embed(&self, request: EmbeddingRequest) -> Result<EmbeddingResponse, ModelError> {
        let embeddings = request
            .inputs
            .iter()
            .map(|text| {
                if text.to_lowercase().contains("leave") {
                    vec![1.0, 0.1]
                } else {
                    vec![0.0, 1.0]
                }
            })
            .collect();
        Ok(EmbeddingResponse {
            embeddings,
            model: "keyword".into(),
            usage: None,
        })
    }
}

fn usage() -> Option<Usage> {
    Some(Usage {
        prompt_tokens: 10,
        completion_tokens: 5,
        total_tokens: 15,
    })
}

fn text_response(text: &str) -> ModelResponse {
    ModelResponse {
        message: Message::assistant(text),
        usage: usage(),
        model: "mock".into(),
    }
}

fn tool_response(tool_calls: Vec<ToolCallIntent>) -> ModelResponse {
    ModelResponse {
        message: Message::assistant_with_tool_calls("", tool_calls),
        usage: usage(),
        model: "mock".into(),
    }
}

fn make_tool_call(name: &str, args: serde_json::Value) -> ToolCallIntent {
    ToolCallIntent::new(format!("call_{name}"), name, args.to_string())
}

fn memory(window: usize) -> Arc<ConversationMemory> {
    Arc::new(ConversationMemory::new(Arc::new(InMemoryRepository::new())).with_window(window))
}

/// memory → tool dispatch → usage, around `model`.
fn helpdesk_pipeline(
    model: Arc<dyn ChatModel>,
    memory: Arc<ConversationMemory>,
    tools: Arc<ToolRegistry>,
    events: EventBus,
) -> ChatPipeline {
    ChatPipeline::builder(model)
        .advisor(Arc::new(LoggerAdvisor))
        .advisor(Arc::new(MemoryAdvisor::new(memory.clone())))
        .advisor(Arc::new(ToolDispatchAdvisor::new(tools, events.clone())))
        .advisor(Arc::new(UsageAuditAdvisor::new(events.clone())))
        .memory(memory)
        .system_prompt("You are a helpful IT helpdesk assistant.")
        .events(events)
        .build()
        .unwrap()
}

fn helpdesk_tools() -> (Arc<ToolRegistry>, Arc<TicketRepository>) {
    let tickets = Arc::new(TicketRepository::new());
    let registry = default_registry(&["createTicket", "getTicketStatus"], tickets.clone()).unwrap();
    (Arc::new(registry), tickets)
}

// ── Scenario A: plain question ──────────────────────────────────────────

#[tokio::test]
async fn e2e_capital_of_india_single_round() {
    let model = Arc::new(ScriptedModel::text("The capital of India is New Delhi."));
    let memory = memory(10);
    let pipeline = ChatPipeline::builder(model.clone())
        .advisor(Arc::new(MemoryAdvisor::new(memory.clone())))
        .advisor(Arc::new(UsageAuditAdvisor::new(EventBus::default())))
        .memory(memory.clone())
        .build()
        .unwrap();

    let response = pipeline
        .call(PipelineRequest::new("scenario-a", "What is the capital of India?"))
        .await
        .unwrap();

    assert!(!response.content.is_empty());
    assert!(response.content.contains("New Delhi"));
    assert!(response.usage.total_tokens > 0);
    assert_eq!(response.model_rounds, 1);
    assert_eq!(model.calls(), 1);

    let history = memory.load(&"scenario-a".into()).await.unwrap();
    let roles: Vec<Role> = history.messages().iter().map(|m| m.role()).collect();
    assert_eq!(roles, vec![Role::User, Role::Assistant]);
}

// ── Scenario B: memory window ───────────────────────────────────────────

#[tokio::test]
async fn e2e_eleven_turns_keep_window_of_ten() {
    let model = Arc::new(ScriptedModel::repeated("Noted.", 11));
    let memory = memory(10);
    let pipeline = ChatPipeline::builder(model.clone())
        .advisor(Arc::new(MemoryAdvisor::new(memory.clone())))
        .memory(memory.clone())
        .build()
        .unwrap();

    for turn in 1..=11 {
        pipeline
            .call(PipelineRequest::new("scenario-b", format!("turn {turn}")))
            .await
            .unwrap();
    }

    let history = memory.load(&"scenario-b".into()).await.unwrap();
    assert_eq!(history.len(), 10);
    assert!(history.messages().iter().all(|m| m.content() != "turn 1"));
    assert_eq!(history.messages()[0].content(), "turn 7");

    // The last model call saw the windowed history before turn 11 was stored
    let seen = model.last_request().messages;
    assert!(seen.iter().all(|m| m.content() != "turn 1"));
    assert_eq!(seen.last().unwrap().content(), "turn 11");
}

// ── Scenario C: returns-direct tool ─────────────────────────────────────

#[tokio::test]
async fn e2e_create_ticket_returns_direct() {
    let model = Arc::new(ScriptedModel::new(vec![tool_response(vec![make_tool_call(
        "createTicket",
        serde_json::json!({"issue": "VPN down"}),
    )])]));
    let (tools, tickets) = helpdesk_tools();
    let memory = memory(10);
    let pipeline = helpdesk_pipeline(model.clone(), memory.clone(), tools, EventBus::default());

    let response = pipeline
        .call(PipelineRequest::new("scenario-c", "My VPN is down, open a ticket").with_context("username", "alice"))
        .await
        .unwrap();

    assert!(response.content.contains("Ticket #1"), "got: {}", response.content);
    assert!(response.content.contains("alice"));
    assert_eq!(model.calls(), 1);
    assert_eq!(response.model_rounds, 1);
    assert_eq!(response.tool_trace.len(), 1);
    assert!(response.tool_trace[0].returns_direct);

    let alice = tickets.by_username("alice").await;
    assert_eq!(alice.len(), 1);
    assert_eq!(alice[0].issue, "VPN down");

    // The short-circuited reply is still remembered
    let history = memory.load(&"scenario-c".into()).await.unwrap();
    assert_eq!(history.messages().last().unwrap().content(), response.content);
}

#[tokio::test]
async fn e2e_ticket_without_username_reports_inline() {
    let model = Arc::new(ScriptedModel::tool_then_text(
        vec![make_tool_call("createTicket", serde_json::json!({"issue": "VPN down"}))],
        "I need your username to open a ticket.",
    ));
    let (tools, tickets) = helpdesk_tools();
    let pipeline = helpdesk_pipeline(model.clone(), memory(10), tools, EventBus::default());

    let response = pipeline
        .call(PipelineRequest::new("c-missing", "Open a ticket: VPN down"))
        .await
        .unwrap();

    assert_eq!(response.content, "I need your username to open a ticket.");
    assert_eq!(model.calls(), 2);
    assert!(!response.tool_trace[0].success);
    assert!(tickets.is_empty().await);
}

#[tokio::test]
async fn e2e_unknown_tool_reported_to_model() {
    let model = Arc::new(ScriptedModel::tool_then_text(
        vec![make_tool_call("launchRockets", serde_json::json!({}))],
        "I can't do that.",
    ));
    let (tools, _) = helpdesk_tools();
    let pipeline = helpdesk_pipeline(model.clone(), memory(10), tools, EventBus::default());

    let response = pipeline.call(PipelineRequest::new("c-unknown", "Launch")).await.unwrap();
    assert_eq!(response.content, "I can't do that.");
    assert_eq!(response.model_rounds, 2);
    assert_eq!(response.usage.total_tokens, 30);

    let tool_message = model
        .last_request()
        .messages
        .into_iter()
        .find(|m| m.role() == Role::Tool)
        .unwrap();
    assert!(tool_message.content().starts_with("Error:"));
    assert_eq!(tool_message.tool_call_id(), Some("call_launchRockets"));
}

// ── Retrieval ───────────────────────────────────────────────────────────

#[tokio::test]
async fn e2e_retrieval_grounds_the_answer() {
    let index = InMemoryVectorIndex::new(Arc::new(KeywordEmbedder)).with_documents(vec![
        EmbeddedDocument {
            source_id: "hr-leave".into(),
            text: "Employees are entitled to 24 paid leaves per year.".into(),
            embedding: vec![1.0, 0.0],
        },
        EmbeddedDocument {
            source_id: "it-vpn".into(),
            text: "Restart the VPN client before raising a ticket.".into(),
            embedding: vec![0.0, 1.0],
        },
    ]);
    let model = Arc::new(ScriptedModel::text("You get 24 paid leaves a year."));
    let events = EventBus::default();
    let pipeline = ChatPipeline::builder(model.clone())
        .advisor(Arc::new(RetrievalAdvisor::new(Arc::new(index), events.clone())))
        .system_prompt("Answer from the context.")
        .events(events)
        .build()
        .unwrap();

    let response = pipeline
        .call(PipelineRequest::new("c-rag", "How many paid leaves do I get?"))
        .await
        .unwrap();

    assert_eq!(response.documents.len(), 1);
    assert_eq!(response.documents[0].source_id, "hr-leave");

    let system = model.last_request().messages[0].clone();
    assert!(system.is_system());
    assert!(system.content().starts_with("Answer from the context."));
    assert!(system.content().contains("Context information is below."));
    assert!(system.content().contains("24 paid leaves per year"));
    assert!(!system.content().contains("VPN"));
}

// ── Validation & retry ──────────────────────────────────────────────────

#[tokio::test]
async fn e2e_rejected_answers_fall_back() {
    let model = Arc::new(ScriptedModel::repeated("Bananas.", 3));
    let judge = Arc::new(ScriptedModel::repeated("NO", 3));
    let pipeline = ChatPipeline::builder(model.clone())
        .advisor(Arc::new(UsageAuditAdvisor::new(EventBus::default())))
        .build()
        .unwrap();
    let validating = ValidatingPipeline::new(pipeline, Arc::new(RelevancyEvaluator::new(judge.clone())));

    let response = validating
        .call(PipelineRequest::new("c-retry", "What is the capital of India?"))
        .await
        .unwrap();

    assert_eq!(response.content, DEFAULT_FALLBACK_MESSAGE);
    assert_eq!(model.calls(), 3);
    assert_eq!(judge.calls(), 3);
    assert_eq!(response.usage.total_tokens, 45);
}

#[tokio::test]
async fn e2e_second_attempt_passes_verbatim() {
    let model = Arc::new(ScriptedModel::new(vec![
        text_response("Mumbai."),
        text_response("New Delhi."),
    ]));
    let judge = Arc::new(ScriptedModel::new(vec![text_response("NO"), text_response("YES")]));
    let memory = memory(10);
    let pipeline = ChatPipeline::builder(model.clone())
        .advisor(Arc::new(MemoryAdvisor::new(memory.clone())))
        .memory(memory.clone())
        .build()
        .unwrap();
    let validating = ValidatingPipeline::new(pipeline, Arc::new(RelevancyEvaluator::new(judge)));

    let response = validating
        .call(PipelineRequest::new("c-retry2", "What is the capital of India?"))
        .await
        .unwrap();

    assert_eq!(response.content, "New Delhi.");
    assert_eq!(model.calls(), 2);

    // Rejected attempts are not rolled back
    let history = memory.load(&"c-retry2".into()).await.unwrap();
    assert_eq!(history.len(), 4);
}

// ── Streaming ───────────────────────────────────────────────────────────

#[tokio::test]
async fn e2e_stream_in_order_and_persist_once() {
    let model = Arc::new(ScriptedModel::text("New Delhi is the capital."));
    let memory = memory(10);
    let (tools, _) = helpdesk_tools();
    let pipeline = helpdesk_pipeline(model, memory.clone(), tools, EventBus::default());

    let mut rx = pipeline
        .stream(PipelineRequest::new("c-stream", "Capital of India?"))
        .await
        .unwrap();

    let mut deltas = Vec::new();
    let mut done = None;
    while let Some(chunk) = rx.recv().await {
        match chunk.unwrap() {
            PipelineChunk::Delta { content } => deltas.push(content),
            PipelineChunk::Done { response } => done = Some(response),
        }
    }

    assert_eq!(deltas, vec!["New ", "Delhi ", "is ", "the ", "capital."]);
    let response = done.unwrap();
    assert_eq!(response.content, "New Delhi is the capital.");
    assert_eq!(response.usage.total_tokens, 15);

    let history = memory.load(&"c-stream".into()).await.unwrap();
    assert_eq!(history.len(), 2);
}

// ── Cancellation & timeouts ─────────────────────────────────────────────

#[tokio::test]
async fn e2e_cancelled_request_persists_nothing() {
    let memory = memory(10);
    let pipeline = ChatPipeline::builder(Arc::new(ScriptedModel::stalled()))
        .advisor(Arc::new(MemoryAdvisor::new(memory.clone())))
        .memory(memory.clone())
        .build()
        .unwrap();

    let request = PipelineRequest::new("c-cancel", "hello");
    let cancel = request.cancel.clone();
    let task = tokio::spawn(async move { pipeline.call(request).await });
    tokio::time::sleep(Duration::from_millis(20)).await;
    cancel.cancel();

    let err = task.await.unwrap().unwrap_err();
    assert!(matches!(err, PipelineError::Cancelled));
    assert!(memory.load(&"c-cancel".into()).await.unwrap().is_empty());
}

#[tokio::test(start_paused = true)]
async fn e2e_model_timeout_not_retried() {
    let model = Arc::new(ScriptedModel::stalled());
    let pipeline = ChatPipeline::builder(model.clone())
        .model_timeout(Duration::from_secs(5))
        .build()
        .unwrap();
    let judge = Arc::new(ScriptedModel::new(Vec::new()));
    let validating = ValidatingPipeline::new(pipeline, Arc::new(RelevancyEvaluator::new(judge.clone())));

    let err = validating
        .call(PipelineRequest::new("c-timeout", "hello"))
        .await
        .unwrap_err();
    assert!(matches!(err, PipelineError::Model(ModelError::Timeout(_))));
    assert_eq!(judge.calls(), 0);
}

// ── Configuration-driven assembly ───────────────────────────────────────

#[tokio::test]
async fn e2e_config_assembly_with_file_memory() {
    let dir = tempfile::tempdir().unwrap();
    let mut config = AppConfig::default();
    config.memory.backend = MemoryBackendKind::File;
    config.memory.path = Some(dir.path().to_path_buf());
    config.tools.enabled = vec!["createTicket".into()];

    let events = EventBus::default();
    let build = |model: Arc<dyn ChatModel>| {
        let memory = Arc::new(
            ConversationMemory::new(Arc::new(FileRepository::new(config.memory.resolved_path())))
                .with_window(config.memory.window),
        );
        let (tools, _) = helpdesk_tools();
        let registry = AdvisorRegistry::standard(&config, Some(memory.clone()), None, tools, &events);
        ChatPipeline::from_config(&config, model, &registry, Some(memory), events.clone()).unwrap()
    };

    let first = build(Arc::new(ScriptedModel::text("Hello Alice.")));
    assert_eq!(first.advisor_names(), vec!["logger", "memory", "tool_dispatch", "usage"]);
    first
        .call(PipelineRequest::new("c-file", "Hi, I'm Alice"))
        .await
        .unwrap();

    // A fresh pipeline over the same directory sees the stored turn
    let model = Arc::new(ScriptedModel::text("You are Alice."));
    let second = build(model.clone());
    second
        .call(PipelineRequest::new("c-file", "Who am I?"))
        .await
        .unwrap();

    let seen: Vec<String> = model
        .last_request()
        .messages
        .iter()
        .map(|m| m.content().to_string())
        .collect();
    assert!(seen.contains(&"Hi, I'm Alice".to_string()));
    assert!(seen.contains(&"Hello Alice.".to_string()));
    assert!(seen[0].starts_with("You are a helpful IT helpdesk assistant"));
}

#[tokio::test]
async fn e2e_unknown_advisor_is_configuration_error() {
    let mut config = AppConfig::default();
    config.pipeline.advisors = vec!["logger".into(), "spellcheck".into()];
    let registry = AdvisorRegistry::standard(&config, None, None, Arc::new(ToolRegistry::new()), &EventBus::default());

    let result = ChatPipeline::from_config(
        &config,
        Arc::new(ScriptedModel::text("unused")),
        &registry,
        None,
        EventBus::default(),
    );
    assert!(result.is_err());
}

// ── Telemetry ───────────────────────────────────────────────────────────

#[tokio::test]
async fn e2e_telemetry_traces_a_tool_request() {
    let events = EventBus::default();
    let telemetry = Arc::new(TelemetryEngine::new());
    let mut rx = events.subscribe();
    let handle = telemetry.spawn(&events);

    let model = Arc::new(ScriptedModel::new(vec![tool_response(vec![make_tool_call(
        "createTicket",
        serde_json::json!({"issue": "Printer jam"}),
    )])]));
    let (tools, _) = helpdesk_tools();
    let pipeline = helpdesk_pipeline(model, memory(10), tools, events.clone());
    pipeline
        .call(PipelineRequest::new("c-telemetry", "Printer jammed").with_context("username", "bob"))
        .await
        .unwrap();

    // Wait until the pipeline has reported, then close the bus
    while let Ok(event) = rx.recv().await {
        if matches!(event.as_ref(), DomainEvent::RequestCompleted { .. }) {
            break;
        }
    }
    drop(pipeline);
    drop(events);
    handle.await.unwrap();

    let usage = telemetry.conversation_usage("c-telemetry");
    assert_eq!(usage.requests_completed, 1);
    assert_eq!(usage.tool_invocations, 1);
    assert_eq!(usage.total_tokens, 15);

    let trace = &telemetry.traces_for_conversation("c-telemetry")[0];
    assert_eq!(trace.model_round_count(), 1);
    assert_eq!(trace.tool_execution_count(), 1);
    assert!(!trace.is_open());
}
