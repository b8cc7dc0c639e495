//! OpenAI-compatible model service.
//!
//! Works with OpenAI, Azure-style proxies, Ollama, vLLM and any endpoint
//! exposing `/chat/completions` and `/embeddings`.
//!
//! Supports:
//! - Chat completions (non-streaming and streaming SSE)
//! - Tool use / function calling
//! - Embeddings

use async_trait::async_trait;
use colloquy_config::ModelConfig;
use colloquy_core::error::ModelError;
use colloquy_core::message::{Message, ToolCallIntent};
use colloquy_core::model::*;
use futures::StreamExt;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::time::Duration;
use tokio::sync::mpsc;
use tracing::{debug, trace, warn};

/// A model service speaking the OpenAI chat-completions protocol.
pub struct OpenAiChatModel {
    base_url: String,
    api_key: Option<String>,
    model: String,
    embedding_model: String,
    temperature: f32,
    max_tokens: Option<u32>,
    client: reqwest::Client,
}

impl OpenAiChatModel {
    pub fn new(
        base_url: impl Into<String>,
        api_key: Option<String>,
        model: impl Into<String>,
    ) -> Result<Self, ModelError> {
        let client = reqwest::Client::builder()
            .connect_timeout(Duration::from_secs(10))
            .timeout(Duration::from_secs(120))
            .build()
            .map_err(|e| ModelError::NotConfigured(format!("Failed to create HTTP client: {e}")))?;

        Ok(Self {
            base_url: base_url.into().trim_end_matches('/').to_string(),
            api_key,
            model: model.into(),
            embedding_model: "text-embedding-3-small".into(),
            temperature: 0.7,
            max_tokens: None,
            client,
        })
    }

    /// Build from the `[model]` config section.
    pub fn from_config(config: &ModelConfig) -> Result<Self, ModelError> {
        let mut model = Self::new(&config.base_url, config.api_key.clone(), &config.model)?;
        model.embedding_model = config.embedding_model.clone();
        model.temperature = config.temperature;
        model.max_tokens = config.max_tokens;
        Ok(model)
    }

    pub fn model(&self) -> &str {
        &self.model
    }

    fn post(&self, path: &str) -> reqwest::RequestBuilder {
        let builder = self
            .client
            .post(format!("{}/{path}", self.base_url))
            .header("Content-Type", "application/json");
        match &self.api_key {
            Some(key) => builder.bearer_auth(key),
            None => builder,
        }
    }

    fn chat_body(&self, request: &ModelRequest, stream: bool) -> serde_json::Value {
        let options = &request.options;
        let mut body = serde_json::json!({
            "model": options.model.as_deref().unwrap_or(&self.model),
            "messages": to_api_messages(&request.messages),
            "temperature": options.temperature.unwrap_or(self.temperature),
            "stream": stream,
        });

        if let Some(max_tokens) = options.max_tokens.or(self.max_tokens) {
            body["max_tokens"] = serde_json::json!(max_tokens);
        }
        if !request.tools.is_empty() {
            body["tools"] = serde_json::json!(to_api_tools(&request.tools));
        }
        if stream {
            body["stream_options"] = serde_json::json!({ "include_usage": true });
        }
        body
    }
}

/// Map HTTP failures onto model errors; pass successful responses through.
async fn check_status(response: reqwest::Response) -> Result<reqwest::Response, ModelError> {
    let status = response.status().as_u16();
    match status {
        200 => Ok(response),
        429 => {
            let retry_after_secs = response
                .headers()
                .get("retry-after")
                .and_then(|v| v.to_str().ok())
                .and_then(|v| v.parse().ok())
                .unwrap_or(5);
            Err(ModelError::RateLimited { retry_after_secs })
        }
        401 | 403 => Err(ModelError::AuthenticationFailed(
            "Invalid API key or insufficient permissions".into(),
        )),
        404 => Err(ModelError::ModelNotFound(
            response.text().await.unwrap_or_default(),
        )),
        _ => {
            let message = response.text().await.unwrap_or_default();
            warn!(status, body = %message, "Model service returned error");
            Err(ModelError::ApiError {
                status_code: status,
                message,
            })
        }
    }
}

fn to_api_messages(messages: &[Message]) -> Vec<ApiMessage> {
    messages
        .iter()
        .map(|m| ApiMessage {
            role: m.role().to_string(),
            content: Some(m.content().to_string()),
            tool_calls: (!m.tool_calls().is_empty()).then(|| {
                m.tool_calls()
                    .iter()
                    .map(|tc| ApiToolCall {
                        id: tc.id.clone(),
                        r#type: "function".into(),
                        function: ApiFunction {
                            name: tc.name.clone(),
                            arguments: tc.arguments.clone(),
                        },
                    })
                    .collect()
            }),
            tool_call_id: m.tool_call_id().map(String::from),
        })
        .collect()
}

fn to_api_tools(tools: &[ToolDefinition]) -> Vec<ApiToolDefinition> {
    tools
        .iter()
        .map(|t| ApiToolDefinition {
            r#type: "function".into(),
            function: ApiToolFunction {
                name: t.name.clone(),
                description: t.description.clone(),
                parameters: t.parameters.clone(),
            },
        })
        .collect()
}

fn from_api_message(message: ApiMessage) -> Message {
    let tool_calls: Vec<ToolCallIntent> = message
        .tool_calls
        .unwrap_or_default()
        .into_iter()
        .map(|tc| ToolCallIntent::new(tc.id, tc.function.name, tc.function.arguments))
        .collect();
    let content = message.content.unwrap_or_default();
    if tool_calls.is_empty() {
        Message::assistant(content)
    } else {
        Message::assistant_with_tool_calls(content, tool_calls)
    }
}

impl From<ApiUsage> for Usage {
    fn from(u: ApiUsage) -> Self {
        Usage {
            prompt_tokens: u.prompt_tokens,
            completion_tokens: u.completion_tokens,
            total_tokens: u.total_tokens,
        }
    }
}

#[async_trait]
impl ChatModel for OpenAiChatModel {
    fn name(&self) -> &str {
        "openai"
    }

    async fn invoke(&self, request: ModelRequest) -> Result<ModelResponse, ModelError> {
        let body = self.chat_body(&request, false);
        debug!(model = %body["model"], messages = request.messages.len(), "Sending completion request");

        let response = self
            .post("chat/completions")
            .json(&body)
            .send()
            .await
            .map_err(|e| ModelError::Network(e.to_string()))?;
        let response = check_status(response).await?;

        let api_response: ApiResponse = response
            .json()
            .await
            .map_err(|e| ModelError::InvalidResponse(format!("Failed to parse response: {e}")))?;

        let choice = api_response
            .choices
            .into_iter()
            .next()
            .ok_or_else(|| ModelError::InvalidResponse("No choices in response".into()))?;

        Ok(ModelResponse {
            message: from_api_message(choice.message),
            usage: api_response.usage.map(Usage::from),
            model: api_response.model,
        })
    }

    async fn stream(
        &self,
        request: ModelRequest,
    ) -> Result<mpsc::Receiver<Result<ModelChunk, ModelError>>, ModelError> {
        let body = self.chat_body(&request, true);
        debug!(model = %body["model"], "Sending streaming request");

        let response = self
            .post("chat/completions")
            .header("Accept", "text/event-stream")
            .json(&body)
            .send()
            .await
            .map_err(|e| ModelError::Network(e.to_string()))?;
        let response = check_status(response).await?;

        let (tx, rx) = mpsc::channel(64);

        // Read the SSE byte stream off the caller's task
        tokio::spawn(async move {
            let mut bytes = response.bytes_stream();
            let mut lines = SseLines::default();
            let mut assembler = StreamAssembler::default();

            while let Some(next) = bytes.next().await {
                let chunk = match next {
                    Ok(b) => b,
                    Err(e) => {
                        let _ = tx.send(Err(ModelError::StreamInterrupted(e.to_string()))).await;
                        return;
                    }
                };

                for data in lines.feed(&String::from_utf8_lossy(&chunk)) {
                    if let Some(out) = assembler.accept(&data) {
                        let done = out.done;
                        if tx.send(Ok(out)).await.is_err() {
                            return; // receiver dropped
                        }
                        if done {
                            return;
                        }
                    }
                }
            }

            // Stream ended without [DONE] or a usage chunk
            let _ = tx.send(Ok(assembler.finish(None))).await;
        });

        Ok(rx)
    }

    async fn embed(&self, request: EmbeddingRequest) -> Result<EmbeddingResponse, ModelError> {
        let model = request.model.as_deref().unwrap_or(&self.embedding_model);
        let body = serde_json::json!({
            "model": model,
            "input": request.inputs,
            "encoding_format": "float",
        });

        debug!(model = %model, count = request.inputs.len(), "Sending embedding request");

        let response = self
            .post("embeddings")
            .json(&body)
            .send()
            .await
            .map_err(|e| ModelError::Network(e.to_string()))?;
        let response = check_status(response).await?;

        let api_resp: EmbeddingApiResponse = response.json().await.map_err(|e| {
            ModelError::InvalidResponse(format!("Failed to parse embedding response: {e}"))
        })?;

        Ok(EmbeddingResponse {
            embeddings: api_resp.data.into_iter().map(|d| d.embedding).collect(),
            model: api_resp.model,
            usage: api_resp.usage.map(|u| Usage {
                prompt_tokens: u.prompt_tokens,
                completion_tokens: 0,
                total_tokens: u.total_tokens,
            }),
        })
    }
}

// --- SSE handling ---

/// Splits a byte-chunked SSE body into `data:` payloads.
#[derive(Default)]
struct SseLines {
    buffer: String,
}

impl SseLines {
    fn feed(&mut self, text: &str) -> Vec<String> {
        self.buffer.push_str(text);
        let mut out = Vec::new();
        while let Some(end) = self.buffer.find('\n') {
            let line: String = self.buffer.drain(..=end).collect();
            let line = line.trim_end_matches(['\n', '\r']);
            // Blank lines and comments carry nothing
            if let Some(data) = line.strip_prefix("data:") {
                out.push(data.trim().to_string());
            }
        }
        out
    }
}

/// Turns SSE payloads into model chunks, assembling tool-call fragments.
#[derive(Default)]
struct StreamAssembler {
    // Keyed by the service's tool index so intents keep their order
    tool_calls: BTreeMap<u32, ToolCallIntent>,
}

impl StreamAssembler {
    fn accept(&mut self, data: &str) -> Option<ModelChunk> {
        if data == "[DONE]" {
            return Some(self.finish(None));
        }

        let parsed: StreamResponse = match serde_json::from_str(data) {
            Ok(p) => p,
            Err(e) => {
                trace!(data = %data, error = %e, "Ignoring unparseable SSE chunk");
                return None;
            }
        };

        if let Some(usage) = parsed.usage {
            return Some(self.finish(Some(usage.into())));
        }

        let choice = parsed.choices.into_iter().next()?;
        for delta in choice.delta.tool_calls.unwrap_or_default() {
            let intent = self
                .tool_calls
                .entry(delta.index)
                .or_insert_with(|| ToolCallIntent::new("", "", ""));
            if let Some(id) = delta.id {
                intent.id = id;
            }
            if let Some(function) = delta.function {
                if let Some(name) = function.name {
                    intent.name = name;
                }
                if let Some(args) = function.arguments {
                    intent.arguments.push_str(&args);
                }
            }
        }

        choice
            .delta
            .content
            .filter(|c| !c.is_empty())
            .map(|content| ModelChunk {
                content: Some(content),
                ..ModelChunk::default()
            })
    }

    fn finish(&mut self, usage: Option<Usage>) -> ModelChunk {
        ModelChunk {
            content: None,
            tool_calls: std::mem::take(&mut self.tool_calls).into_values().collect(),
            done: true,
            usage,
        }
    }
}

// --- OpenAI API types (internal) ---

#[derive(Debug, Serialize, Deserialize)]
struct ApiMessage {
    role: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    content: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    tool_calls: Option<Vec<ApiToolCall>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    tool_call_id: Option<String>,
}

#[derive(Debug, Serialize, Deserialize)]
struct ApiToolCall {
    id: String,
    r#type: String,
    function: ApiFunction,
}

#[derive(Debug, Serialize, Deserialize)]
struct ApiFunction {
    name: String,
    arguments: String,
}

#[derive(Debug, Serialize)]
struct ApiToolDefinition {
    r#type: String,
    function: ApiToolFunction,
}

#[derive(Debug, Serialize)]
struct ApiToolFunction {
    name: String,
    description: String,
    parameters: serde_json::Value,
}

#[derive(Debug, Deserialize)]
struct ApiResponse {
    #[serde(default)]
    model: String,
    choices: Vec<ApiChoice>,
    usage: Option<ApiUsage>,
}

#[derive(Debug, Deserialize)]
struct ApiChoice {
    message: ApiMessage,
}

#[derive(Debug, Deserialize)]
struct ApiUsage {
    prompt_tokens: u32,
    completion_tokens: u32,
    total_tokens: u32,
}

#[derive(Debug, Deserialize)]
struct EmbeddingApiResponse {
    data: Vec<EmbeddingData>,
    #[serde(default)]
    model: String,
    usage: Option<EmbeddingApiUsage>,
}

#[derive(Debug, Deserialize)]
struct EmbeddingData {
    embedding: Vec<f32>,
}

#[derive(Debug, Deserialize)]
struct EmbeddingApiUsage {
    prompt_tokens: u32,
    total_tokens: u32,
}

#[derive(Debug, Deserialize)]
struct StreamResponse {
    #[serde(default)]
    choices: Vec<StreamChoice>,
    #[serde(default)]
    usage: Option<ApiUsage>,
}

#[derive(Debug, Deserialize)]
struct StreamChoice {
    delta: StreamDelta,
}

#[derive(Debug, Deserialize)]
struct StreamDelta {
    #[serde(default)]
    content: Option<String>,
    #[serde(default)]
    tool_calls: Option<Vec<StreamToolCallDelta>>,
}

#[derive(Debug, Deserialize)]
struct StreamToolCallDelta {
    index: u32,
    #[serde(default)]
    id: Option<String>,
    #[serde(default)]
    function: Option<StreamFunctionDelta>,
}

#[derive(Debug, Deserialize)]
struct StreamFunctionDelta {
    #[serde(default)]
    name: Option<String>,
    #[serde(default)]
    arguments: Option<String>,
}
