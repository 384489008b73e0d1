//! LLM provider client.
//!
//! The [`LlmProvider`] trait is the seam the orchestrator talks through;
//! [`HttpProvider`] implements it against the Anthropic-style Messages API
//! with both streaming SSE and non-streaming modes. Clients are pooled per
//! `(provider, model, base_url)` so concurrent requests share connections.

use std::sync::Arc;

use async_trait::async_trait;
use futures::StreamExt;
use reqwest::header::{CONTENT_TYPE, HeaderMap, HeaderValue};
use serde_json::{Value, json};

use crate::error::{EngineError, EngineResult};
use crate::llm::streaming::{SseParser, StreamAccumulator, StreamEvent};
use crate::llm::types::{ChatRequest, ContentPart, LlmReply, Message, MessageContent, Role, ToolCall};

/// Messages API version header value.
const API_VERSION: &str = "2023-06-01";

/// HTTP timeout for LLM calls.
const REQUEST_TIMEOUT_SECS: u64 = 120;

/// Default max tokens when the request does not specify one.
const DEFAULT_MAX_TOKENS: u32 = 4096;

// ---------------------------------------------------------------------------
// Trait
// ---------------------------------------------------------------------------

/// A chat-completion provider the orchestrator can drive.
#[async_trait]
pub trait LlmProvider: Send + Sync {
    /// Send a chat request and return the full reply (non-streaming).
    async fn chat(&self, request: &ChatRequest) -> EngineResult<LlmReply>;

    /// Send a chat request with streaming, invoking `on_text` for each text
    /// delta, and return the aggregated reply.
    async fn stream_chat(
        &self,
        request: &ChatRequest,
        on_text: &mut (dyn for<'a> FnMut(&'a str) + Send),
    ) -> EngineResult<LlmReply>;
}

// ---------------------------------------------------------------------------
// Configuration
// ---------------------------------------------------------------------------

/// Connection parameters for one provider endpoint.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct ProviderConfig {
    /// Provider tag (e.g. `anthropic`); part of the pool key.
    pub provider: String,
    /// Base URL of the API.
    pub base_url: String,
    /// API key for authentication.
    pub api_key: String,
    /// Model identifier; part of the pool key.
    pub model: String,
}

// ---------------------------------------------------------------------------
// HTTP provider
// ---------------------------------------------------------------------------

/// Messages-API client supporting streaming and tool use.
pub struct HttpProvider {
    config: ProviderConfig,
    http: reqwest::Client,
}

impl HttpProvider {
    /// Create a new provider client.
    pub fn new(config: ProviderConfig) -> EngineResult<Self> {
        if config.api_key.is_empty() {
            return Err(EngineError::MissingApiKey {
                provider: config.provider.clone(),
            });
        }

        let http = reqwest::Client::builder()
            .timeout(std::time::Duration::from_secs(REQUEST_TIMEOUT_SECS))
            .build()
            .map_err(|e| EngineError::LlmRequestFailed {
                reason: format!("failed to build HTTP client: {e}"),
            })?;

        Ok(Self { config, http })
    }

    // -- request building ---------------------------------------------------

    /// Build the JSON body for the Messages API.
    fn build_request_body(&self, request: &ChatRequest, stream: bool) -> Value {
        let (system_text, messages) = split_system_message(&request.messages);

        let mut body = json!({
            "model": if request.model.is_empty() { &self.config.model } else { &request.model },
            "max_tokens": request.max_tokens.unwrap_or(DEFAULT_MAX_TOKENS),
            "messages": messages,
        });

        if let Some(system) = system_text {
            body["system"] = json!(system);
        }
        if let Some(temperature) = request.temperature {
            body["temperature"] = json!(temperature);
        }
        if !request.tools.is_empty() {
            let tools: Vec<Value> = request
                .tools
                .iter()
                .map(|t| {
                    json!({
                        "name": t.name,
                        "description": t.description,
                        "input_schema": t.parameters,
                    })
                })
                .collect();
            body["tools"] = json!(tools);
        }
        if stream {
            body["stream"] = json!(true);
        }

        body
    }

    async fn send_request(&self, body: &Value) -> EngineResult<reqwest::Response> {
        let url = format!("{}/v1/messages", self.config.base_url);

        let mut headers = HeaderMap::new();
        headers.insert(
            "x-api-key",
            HeaderValue::from_str(&self.config.api_key).map_err(|e| {
                EngineError::LlmRequestFailed {
                    reason: format!("invalid API key header: {e}"),
                }
            })?,
        );
        headers.insert("anthropic-version", HeaderValue::from_static(API_VERSION));
        headers.insert(CONTENT_TYPE, HeaderValue::from_static("application/json"));

        tracing::debug!(url = %url, model = %body["model"], "sending LLM request");

        self.http
            .post(&url)
            .headers(headers)
            .json(body)
            .send()
            .await
            .map_err(|e| EngineError::LlmRequestFailed {
                reason: e.to_string(),
            })
    }

    // -- response parsing ---------------------------------------------------

    fn parse_non_streaming_response(&self, v: &Value) -> EngineResult<LlmReply> {
        let content = v["content"]
            .as_array()
            .ok_or_else(|| EngineError::LlmParseFailed {
                reason: "missing `content` array in response".into(),
            })?;

        let mut text_parts: Vec<String> = Vec::new();
        let mut tool_calls: Vec<ToolCall> = Vec::new();

        for block in content {
            match block["type"].as_str() {
                Some("text") => {
                    if let Some(t) = block["text"].as_str() {
                        text_parts.push(t.to_owned());
                    }
                }
                Some("tool_use") => {
                    tool_calls.push(ToolCall {
                        id: block["id"].as_str().unwrap_or_default().to_owned(),
                        name: block["name"].as_str().unwrap_or_default().to_owned(),
                        arguments: block["input"].clone(),
                    });
                }
                _ => {}
            }
        }

        let text = text_parts.join("");
        if tool_calls.is_empty() {
            Ok(LlmReply::Text(text))
        } else {
            Ok(LlmReply::ToolCalls {
                partial_text: text,
                calls: tool_calls,
            })
        }
    }

    async fn consume_stream(
        &self,
        resp: reqwest::Response,
        on_text: &mut (dyn for<'a> FnMut(&'a str) + Send),
    ) -> EngineResult<LlmReply> {
        let mut parser = SseParser::new();
        let mut accumulator = StreamAccumulator::new();
        let mut byte_stream = resp.bytes_stream();

        // Buffer for partial lines that span chunk boundaries.
        let mut line_buffer = String::new();

        while let Some(chunk_result) = byte_stream.next().await {
            let chunk = chunk_result.map_err(|e| EngineError::LlmStreamError {
                reason: format!("stream read error: {e}"),
            })?;
            let text = std::str::from_utf8(&chunk).map_err(|e| EngineError::LlmStreamError {
                reason: format!("invalid UTF-8 in stream: {e}"),
            })?;
            line_buffer.push_str(text);

            while let Some(newline_pos) = line_buffer.find('\n') {
                let line = line_buffer[..newline_pos].to_owned();
                line_buffer = line_buffer[newline_pos + 1..].to_owned();

                if let Some(event) = parser.parse_line(&line)? {
                    accumulator.apply(&event, on_text);
                    if matches!(event, StreamEvent::MessageStop) {
                        return accumulator.into_reply();
                    }
                }
            }
        }

        // Stream ended without a MessageStop; return what we have.
        accumulator.into_reply()
    }
}

#[async_trait]
impl LlmProvider for HttpProvider {
    async fn chat(&self, request: &ChatRequest) -> EngineResult<LlmReply> {
        let body = self.build_request_body(request, false);
        let resp = self.send_request(&body).await?;

        let status = resp.status();
        let text = resp.text().await.map_err(|e| EngineError::LlmRequestFailed {
            reason: format!("failed to read response body: {e}"),
        })?;

        if !status.is_success() {
            return Err(EngineError::LlmRequestFailed {
                reason: format!("API returned {status}: {text}"),
            });
        }

        let v: Value = serde_json::from_str(&text).map_err(|e| EngineError::LlmParseFailed {
            reason: format!("invalid JSON response: {e}"),
        })?;
        self.parse_non_streaming_response(&v)
    }

    async fn stream_chat(
        &self,
        request: &ChatRequest,
        on_text: &mut (dyn for<'a> FnMut(&'a str) + Send),
    ) -> EngineResult<LlmReply> {
        let body = self.build_request_body(request, true);
        let resp = self.send_request(&body).await?;

        let status = resp.status();
        if !status.is_success() {
            let text = resp.text().await.unwrap_or_default();
            return Err(EngineError::LlmRequestFailed {
                reason: format!("API returned {status}: {text}"),
            });
        }

        self.consume_stream(resp, on_text).await
    }
}

// ---------------------------------------------------------------------------
// Wire translation
// ---------------------------------------------------------------------------

/// Render message content into the Messages API shape. Plain text stays a
/// string; multimodal parts become content blocks with base64 image
/// sources.
fn content_to_wire(content: &MessageContent) -> Value {
    match content {
        MessageContent::Text(text) => json!(text),
        MessageContent::Parts(parts) => {
            let blocks: Vec<Value> = parts
                .iter()
                .map(|part| match part {
                    ContentPart::Text { text } => json!({"type": "text", "text": text}),
                    ContentPart::Image {
                        media_type,
                        data_base64,
                    } => json!({
                        "type": "image",
                        "source": {
                            "type": "base64",
                            "media_type": media_type,
                            "data": data_base64,
                        }
                    }),
                })
                .collect();
            json!(blocks)
        }
    }
}

/// Split system messages out (the API expects them as a top-level field)
/// and convert the rest to the wire format.
fn split_system_message(messages: &[Message]) -> (Option<String>, Vec<Value>) {
    let mut system: Option<String> = None;
    let mut wire_messages: Vec<Value> = Vec::with_capacity(messages.len());

    for msg in messages {
        match msg.role {
            Role::System => {
                // Single system block; concat if multiple exist.
                let text = msg.content_text();
                match &mut system {
                    Some(existing) => {
                        existing.push('\n');
                        existing.push('\n');
                        existing.push_str(&text);
                    }
                    None => system = Some(text),
                }
            }
            Role::User => {
                wire_messages.push(json!({
                    "role": "user",
                    "content": content_to_wire(&msg.content),
                }));
            }
            Role::Assistant => {
                if msg.tool_calls.is_empty() {
                    wire_messages.push(json!({
                        "role": "assistant",
                        "content": content_to_wire(&msg.content),
                    }));
                } else {
                    let mut content: Vec<Value> = Vec::new();
                    let text = msg.content_text();
                    if !text.is_empty() {
                        content.push(json!({"type": "text", "text": text}));
                    }
                    for tc in &msg.tool_calls {
                        content.push(json!({
                            "type": "tool_use",
                            "id": tc.id,
                            "name": tc.name,
                            "input": tc.arguments,
                        }));
                    }
                    wire_messages.push(json!({"role": "assistant", "content": content}));
                }
            }
            Role::Tool => {
                // Tool results ride as user messages with tool_result blocks.
                wire_messages.push(json!({
                    "role": "user",
                    "content": [{
                        "type": "tool_result",
                        "tool_use_id": msg.tool_call_id,
                        "content": msg.content_text(),
                    }],
                }));
            }
        }
    }

    (system, wire_messages)
}

// ---------------------------------------------------------------------------
// Provider pool
// ---------------------------------------------------------------------------

/// Shared clients keyed by `(provider, model, base_url)`.
#[derive(Default)]
pub struct ProviderPool {
    clients: dashmap::DashMap<(String, String, String), Arc<HttpProvider>>,
}

impl ProviderPool {
    /// Create an empty pool.
    pub fn new() -> Self {
        Self::default()
    }

    /// Get or create the client for `config`.
    pub fn get(&self, config: &ProviderConfig) -> EngineResult<Arc<dyn LlmProvider>> {
        let key = (
            config.provider.clone(),
            config.model.clone(),
            config.base_url.clone(),
        );
        if let Some(existing) = self.clients.get(&key) {
            return Ok(Arc::clone(existing.value()) as Arc<dyn LlmProvider>);
        }
        let client = Arc::new(HttpProvider::new(config.clone())?);
        self.clients.insert(key, Arc::clone(&client));
        Ok(client)
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
