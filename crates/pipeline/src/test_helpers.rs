//! Shared test helpers for pipeline tests.

use crate::advisor::{AdvisedResponse, AdvisedStream, StreamEvent};
use async_trait::async_trait;
use colloquy_core::error::{ModelError, PipelineError, ToolError};
use colloquy_core::context::CallContext;
use colloquy_core::message::{Message, ToolCallIntent};
use colloquy_core::model::{ChatModel, ModelChunk, ModelRequest, ModelResponse, Usage};
use colloquy_core::tool::Tool;
use std::sync::Mutex;
use std::time::Duration;
use tokio::sync::mpsc;

/// A mock model that returns a sequence of scripted responses.
///
/// Each call to `invoke` or `stream` returns the next response in the queue.
/// Panics if more calls are made than responses provided.
pub struct SequentialMockModel {
    responses: Vec<ModelResponse>,
    /// Per-call stream chunking; calls without an entry stream as one chunk
    parts: Vec<Vec<String>>,
    delay: Option<Duration>,
    calls: Mutex<Vec<ModelRequest>>,
}

impl SequentialMockModel {
    pub fn new(responses: Vec<ModelResponse>) -> Self {
        Self {
            responses,
            parts: Vec::new(),
            delay: None,
            calls: Mutex::new(Vec::new()),
        }
    }

    /// A model that returns a single text response (no tool calls).
    pub fn single_text(text: &str) -> Self {
        Self::new(vec![make_text_response(text)])
    }

    /// A model that returns the same text `n` times.
    pub fn repeated_text(text: &str, n: usize) -> Self {
        Self::new((0..n).map(|_| make_text_response(text)).collect())
    }

    /// A model that first requests tools, then gives a final answer.
    pub fn tool_then_answer(tool_calls: Vec<ToolCallIntent>, answer: &str) -> Self {
        Self::new(vec![
            make_tool_call_response(tool_calls, ""),
            make_text_response(answer),
        ])
    }

    /// A model whose single reply streams as the given pieces.
    pub fn streaming(parts: Vec<&str>) -> Self {
        let mut model = Self::single_text(&parts.concat());
        model.parts = vec![parts.into_iter().map(String::from).collect()];
        model
    }

    /// Wait this long before every reply.
    pub fn with_delay(mut self, delay: Duration) -> Self {
        self.delay = Some(delay);
        self
    }

    pub fn call_count(&self) -> usize {
        self.calls.lock().unwrap().len()
    }

    /// Every request received so far.
    pub fn requests(&self) -> Vec<ModelRequest> {
        self.calls.lock().unwrap().clone()
    }

    async fn next(&self, request: ModelRequest) -> (usize, ModelResponse) {
        if let Some(delay) = self.delay {
            tokio::time::sleep(delay).await;
        }
        let mut calls = self.calls.lock().unwrap();
        let n = calls.len();
        if n >= self.responses.len() {
            panic!(
                "SequentialMockModel: no more responses (call #{}, have {})",
                n,
                self.responses.len()
            );
        }
        calls.push(request);
        (n, self.responses[n].clone())
    }
}

#[async_trait]
impl ChatModel for SequentialMockModel {
    fn name(&self) -> &str {
        "sequential_mock"
    }

    async fn invoke(&self, request: ModelRequest) -> Result<ModelResponse, ModelError> {
        Ok(self.next(request).await.1)
    }

    async fn stream(
        &self,
        request: ModelRequest,
    ) -> Result<mpsc::Receiver<Result<ModelChunk, ModelError>>, ModelError> {
        let (n, response) = self.next(request).await;
        let parts = self
            .parts
            .get(n)
            .cloned()
            .unwrap_or_else(|| vec![response.message.content().to_string()]);

        let (tx, rx) = mpsc::channel(parts.len() + 1);
        for part in parts {
            let _ = tx.try_send(Ok(ModelChunk {
                content: Some(part),
                ..ModelChunk::default()
            }));
        }
        let _ = tx.try_send(Ok(ModelChunk {
            content: None,
            tool_calls: response.message.tool_calls().to_vec(),
            done: true,
            usage: response.usage,
        }));
        Ok(rx)
    }
}

/// A model that never answers.
pub struct StalledModel;

#[async_trait]
impl ChatModel for StalledModel {
    fn name(&self) -> &str {
        "stalled"
    }

    async fn invoke(&self, _request: ModelRequest) -> Result<ModelResponse, ModelError> {
        std::future::pending().await
    }
}

/// A model that always fails with the given error.
pub struct FailingModel(pub ModelError);

#[async_trait]
impl ChatModel for FailingModel {
    fn name(&self) -> &str {
        "failing"
    }

    async fn invoke(&self, _request: ModelRequest) -> Result<ModelResponse, ModelError> {
        Err(self.0.clone())
    }
}

pub fn usage() -> Usage {
    Usage {
        prompt_tokens: 10,
        completion_tokens: 5,
        total_tokens: 15,
    }
}

/// A simple text response (no tool calls).
pub fn make_text_response(text: &str) -> ModelResponse {
    ModelResponse {
        message: Message::assistant(text),
        usage: Some(usage()),
        model: "mock-model".into(),
    }
}

/// A response with tool calls and optional thought content.
pub fn make_tool_call_response(tool_calls: Vec<ToolCallIntent>, thought: &str) -> ModelResponse {
    ModelResponse {
        message: Message::assistant_with_tool_calls(thought, tool_calls),
        usage: Some(usage()),
        model: "mock-model".into(),
    }
}

/// A tool call intent with id `call_<name>`.
pub fn make_tool_call(name: &str, args: serde_json::Value) -> ToolCallIntent {
    ToolCallIntent::new(format!("call_{name}"), name, args.to_string())
}

/// Drain an advised stream into its deltas and completed reply.
pub async fn collect(
    mut rx: AdvisedStream,
) -> Result<(Vec<String>, AdvisedResponse), PipelineError> {
    let mut deltas = Vec::new();
    while let Some(event) = rx.recv().await {
        match event? {
            StreamEvent::Delta(text) => deltas.push(text),
            StreamEvent::Completed(response) => return Ok((deltas, response)),
        }
    }
    Err(PipelineError::Internal("stream ended without completion".into()))
}

/// A tool returning a fixed output.
pub struct StaticTool {
    pub name: &'static str,
    pub output: &'static str,
    pub returns_direct: bool,
}

#[async_trait]
impl Tool for StaticTool {
    fn name(&self) -> &str {
        self.name
    }

    fn description(&self) -> &str {
        "Returns a fixed string"
    }

    fn parameters_schema(&self) -> serde_json::Value {
        serde_json::json!({ "type": "object", "properties": {} })
    }

    fn returns_direct(&self) -> bool {
        self.returns_direct
    }

    async fn invoke(
        &self,
        _arguments: serde_json::Value,
        _context: &CallContext,
    ) -> Result<String, ToolError> {
        Ok(self.output.to_string())
    }
}

/// A tool that always fails.
pub struct BrokenTool;

#[async_trait]
impl Tool for BrokenTool {
    fn name(&self) -> &str {
        "broken"
    }

    fn description(&self) -> &str {
        "Always fails"
    }

    fn parameters_schema(&self) -> serde_json::Value {
        serde_json::json!({ "type": "object", "properties": {} })
    }

    async fn invoke(
        &self,
        _arguments: serde_json::Value,
        _context: &CallContext,
    ) -> Result<String, ToolError> {
        Err(ToolError::ExecutionFailed {
            tool_name: "broken".into(),
            reason: "backend offline".into(),
        })
    }
}

/// A tool that never returns.
pub struct SlowTool;

#[async_trait]
impl Tool for SlowTool {
    fn name(&self) -> &str {
        "slow"
    }

    fn description(&self) -> &str {
        "Never finishes"
    }

    fn parameters_schema(&self) -> serde_json::Value {
        serde_json::json!({ "type": "object", "properties": {} })
    }

    async fn invoke(
        &self,
        _arguments: serde_json::Value,
        _context: &CallContext,
    ) -> Result<String, ToolError> {
        std::future::pending().await
    }
}
