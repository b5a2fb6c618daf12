//! Chat-completions family adapter.
//!
//! Works with: OpenAI, OpenRouter, Ollama, vLLM, DeepSeek, Groq and any
//! endpoint exposing a streamed `/chat/completions`.
//!
//! Supports:
//! - Conversion of unified messages to flat API messages and back
//! - Reasoning from `reasoning_content` / `reasoning` deltas and inline `<think>` tags
//! - Tool-call fragments accumulated per call id until complete

use std::collections::HashMap;

use async_trait::async_trait;
use chatrelay_config::ProviderConfig;
use chatrelay_core::error::ProviderError;
use chatrelay_core::message::{Message, Part, Role};
use chatrelay_core::provider::*;
use futures::StreamExt;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tracing::{debug, trace, warn};

use crate::sse::{SseDecoder, check_status, transport_error};
use crate::think::{Segment, ThinkSplitter};
use crate::tool_args::finalize_tool_call;

/// A chat-completions style LLM provider.
pub struct OpenAiCompatProvider {
    name: String,
    base_url: String,
    api_key: Option<String>,
    model: String,
    max_tokens: u32,
    temperature: Option<f32>,
    client: reqwest::Client,
}

impl OpenAiCompatProvider {
    /// Build from a provider config entry.
    pub fn from_config(name: &str, config: &ProviderConfig) -> Result<Self, ProviderError> {
        let client = reqwest::Client::builder()
            .timeout(std::time::Duration::from_secs(config.timeout_secs))
            .build()
            .map_err(|e| ProviderError::NotConfigured(format!("HTTP client: {e}")))?;

        Ok(Self {
            name: name.to_string(),
            base_url: config.base_url().trim_end_matches('/').to_string(),
            api_key: config.api_key.clone(),
            model: config.model_or_default(),
            max_tokens: config.max_tokens,
            temperature: config.temperature,
            client,
        })
    }

    fn build_body(&self, request: &ProviderRequest) -> Value {
        let model = if request.model.is_empty() {
            &self.model
        } else {
            &request.model
        };

        let mut body = serde_json::json!({
            "model": model,
            "messages": to_api_messages(&request.system, &request.messages),
            "stream": true,
            "max_tokens": request.max_tokens.unwrap_or(self.max_tokens),
        });

        if let Some(t) = request.temperature.or(self.temperature) {
            body["temperature"] = serde_json::json!(t);
        }

        if !request.tools.is_empty() {
            body["tools"] = serde_json::json!(to_api_tools(&request.tools));
        }

        body
    }
}

#[async_trait]
impl Provider for OpenAiCompatProvider {
    fn name(&self) -> &str {
        &self.name
    }

    fn family(&self) -> ProviderFamily {
        ProviderFamily::ChatCompletions
    }

    fn model(&self) -> &str {
        &self.model
    }

    async fn stream(&self, request: ProviderRequest) -> Result<EventReceiver, ProviderError> {
        let url = format!("{}/chat/completions", self.base_url);
        let body = self.build_body(&request);

        debug!(
            provider = %self.name,
            model = %body["model"],
            messages = request.messages.len(),
            tools = request.tools.len(),
            "Sending streaming request"
        );

        let mut req = self
            .client
            .post(&url)
            .header("Content-Type", "application/json")
            .header("Accept", "text/event-stream")
            .json(&body);
        if let Some(key) = &self.api_key {
            req = req.bearer_auth(key);
        }

        let response = req.send().await.map_err(transport_error)?;
        let response = check_status(response, &self.name).await?;

        let (tx, rx) = tokio::sync::mpsc::channel(64);
        let provider_name = self.name.clone();

        // Spawn task to read the SSE byte stream and parse chunks
        tokio::spawn(async move {
            let mut byte_stream = response.bytes_stream();
            let mut decoder = SseDecoder::new();
            let mut parser = ChatCompletionsStream::new();

            loop {
                let chunk = tokio::select! {
                    _ = tx.closed() => {
                        debug!(provider = %provider_name, "Client went away, dropping upstream stream");
                        return;
                    }
                    chunk = byte_stream.next() => chunk,
                };

                let bytes = match chunk {
                    Some(Ok(b)) => b,
                    Some(Err(e)) => {
                        let _ = tx
                            .send(Err(ProviderError::StreamInterrupted(e.to_string())))
                            .await;
                        return;
                    }
                    None => break,
                };

                for frame in decoder.push(&bytes) {
                    let events = match parser.on_data(&frame.data) {
                        Ok(events) => events,
                        Err(e) => {
                            let _ = tx.send(Err(e)).await;
                            return;
                        }
                    };
                    for event in events {
                        if tx.send(Ok(event)).await.is_err() {
                            return; // receiver dropped
                        }
                    }
                    if parser.is_done() {
                        return;
                    }
                }
            }

            trace!(provider = %provider_name, "Upstream closed without [DONE]");
            for item in parser.on_eof() {
                if let Err(e) = &item {
                    warn!(provider = %provider_name, error = %e, "Upstream stream cut off");
                }
                if tx.send(item).await.is_err() {
                    return;
                }
            }
        });

        Ok(rx)
    }
}

// ── Message conversion ──────────────────────────────────────────────────

/// Convert unified messages to the flat chat-completions shape.
///
/// The system text becomes the first message. Tool calls ride on an
/// assistant message; each tool result becomes its own `tool` message.
/// Reasoning parts are not sent back upstream.
pub fn to_api_messages(system: &str, messages: &[Message]) -> Vec<ApiMessage> {
    let mut out = Vec::with_capacity(messages.len() + 1);

    if !system.is_empty() {
        out.push(ApiMessage::plain("system", system));
    }

    for msg in messages {
        let text = msg.text();
        let tool_calls: Vec<ApiToolCall> = msg
            .tool_calls()
            .map(|(id, name, arguments)| ApiToolCall {
                id: id.to_string(),
                r#type: "function".into(),
                function: ApiFunction {
                    name: name.to_string(),
                    arguments: arguments.to_string(),
                },
            })
            .collect();

        if msg.role != Role::Tool && (!text.is_empty() || !tool_calls.is_empty()) {
            out.push(ApiMessage {
                role: msg.role.as_str().to_string(),
                content: if text.is_empty() { None } else { Some(text) },
                tool_calls: if tool_calls.is_empty() {
                    None
                } else {
                    Some(tool_calls)
                },
                tool_call_id: None,
            });
        }

        for (call_id, payload) in msg.tool_results() {
            out.push(ApiMessage {
                role: "tool".into(),
                content: Some(payload_to_string(payload)),
                tool_calls: None,
                tool_call_id: Some(call_id.to_string()),
            });
        }
    }

    out
}

/// Convert chat-completions messages back to the unified shape.
pub fn from_api_messages(messages: &[ApiMessage]) -> Vec<Message> {
    messages
        .iter()
        .filter_map(|m| {
            let role = Role::parse(&m.role)?;
            let mut parts = Vec::new();

            if role == Role::Tool {
                let call_id = m.tool_call_id.clone()?;
                let payload = parse_payload(m.content.as_deref().unwrap_or_default());
                return Some(Message::new(Role::Tool, vec![Part::tool_result(call_id, payload)]));
            }

            if let Some(content) = m.content.as_deref().filter(|c| !c.is_empty()) {
                parts.push(Part::text(content));
            }
            for tc in m.tool_calls.iter().flatten() {
                let arguments = serde_json::from_str(&tc.function.arguments)
                    .unwrap_or_else(|_| Value::String(tc.function.arguments.clone()));
                parts.push(Part::tool_call(&tc.id, &tc.function.name, arguments));
            }
            Some(Message::new(role, parts))
        })
        .collect()
}

/// Convert tool definitions to the chat-completions `function` shape.
pub(crate) fn to_api_tools(tools: &[ToolDefinition]) -> Vec<ApiToolDefinition> {
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

/// Tool results travel as strings; plain strings are sent unquoted.
pub(crate) fn payload_to_string(payload: &Value) -> String {
    match payload {
        Value::String(s) => s.clone(),
        other => other.to_string(),
    }
}

/// Inverse of [`payload_to_string`] for structured payloads.
pub(crate) fn parse_payload(s: &str) -> Value {
    let trimmed = s.trim_start();
    if trimmed.starts_with('{') || trimmed.starts_with('[') {
        if let Ok(v) = serde_json::from_str(s) {
            return v;
        }
    }
    Value::String(s.to_string())
}

// ── Stream parsing ──────────────────────────────────────────────────────

/// Turns `data:` payloads into provider events.
pub(crate) struct ChatCompletionsStream {
    think: ThinkSplitter,
    calls: Vec<ToolCallAccumulator>,
    slot_by_index: HashMap<u32, usize>,
    finish_reason: Option<FinishReason>,
    done: bool,
}

impl ChatCompletionsStream {
    pub fn new() -> Self {
        Self {
            think: ThinkSplitter::new(),
            calls: Vec::new(),
            slot_by_index: HashMap::new(),
            finish_reason: None,
            done: false,
        }
    }

    pub fn is_done(&self) -> bool {
        self.done
    }

    pub fn on_data(&mut self, data: &str) -> Result<Vec<ProviderEvent>, ProviderError> {
        if self.done {
            return Ok(Vec::new());
        }
        if data == "[DONE]" {
            return Ok(self.finish());
        }

        let chunk: StreamResponse = match serde_json::from_str(data) {
            Ok(c) => c,
            Err(e) => {
                trace!(data = %data, error = %e, "Ignoring unparseable SSE chunk");
                return Ok(Vec::new());
            }
        };

        if let Some(err) = chunk.error {
            let message = err
                .get("message")
                .and_then(Value::as_str)
                .map(str::to_string)
                .unwrap_or_else(|| err.to_string());
            let code = err.get("code").and_then(Value::as_u64).unwrap_or(500);
            if code == 429 {
                return Err(ProviderError::RateLimited { retry_after_secs: 5 });
            }
            return Err(ProviderError::ApiError {
                status_code: u16::try_from(code).unwrap_or(500),
                message,
            });
        }

        let mut events = Vec::new();
        for choice in chunk.choices {
            let delta = choice.delta;

            let reasoning = delta.reasoning_content.or(delta.reasoning);
            if let Some(r) = reasoning.filter(|r| !r.is_empty()) {
                events.push(ProviderEvent::ReasoningDelta(r));
            }

            if let Some(content) = delta.content.filter(|c| !c.is_empty()) {
                for segment in self.think.push(&content) {
                    events.push(segment_event(segment));
                }
            }

            for tc in delta.tool_calls.unwrap_or_default() {
                self.accumulate(tc);
            }

            if let Some(reason) = choice.finish_reason {
                self.finish_reason = Some(map_finish_reason(&reason));
            }
        }

        Ok(events)
    }

    fn accumulate(&mut self, delta: StreamToolCallDelta) {
        let by_id = delta
            .id
            .as_ref()
            .and_then(|id| self.calls.iter().position(|c| &c.id == id));

        let slot = match by_id {
            Some(slot) => slot,
            None => match self.slot_by_index.get(&delta.index).copied() {
                // Same index, no id or the id this slot already has
                Some(slot)
                    if delta.id.is_none()
                        || self.calls[slot].id.is_empty()
                        || delta.id.as_deref() == Some(self.calls[slot].id.as_str()) =>
                {
                    slot
                }
                // New index, or a provider that reuses index 0 for every call
                _ => {
                    self.calls.push(ToolCallAccumulator::default());
                    let slot = self.calls.len() - 1;
                    self.slot_by_index.insert(delta.index, slot);
                    slot
                }
            },
        };

        let acc = &mut self.calls[slot];
        if let Some(id) = delta.id.filter(|id| !id.is_empty()) {
            acc.id = id;
        }
        if let Some(func) = delta.function {
            if let Some(name) = func.name.filter(|n| !n.is_empty()) {
                acc.name = name;
            }
            if let Some(args) = func.arguments {
                acc.arguments.push_str(&args);
            }
        }
    }

    /// Flush held-back text, emit completed tool calls, then `Finish`.
    pub fn finish(&mut self) -> Vec<ProviderEvent> {
        if self.done {
            return Vec::new();
        }
        let mut events = self.flush();
        events.push(ProviderEvent::Finish(
            self.finish_reason.unwrap_or(FinishReason::Stop),
        ));
        events
    }

    /// The byte stream ended without `[DONE]`.
    ///
    /// A finish reason already seen still ends the turn cleanly. Otherwise
    /// whatever was received is flushed and the stream is reported as
    /// interrupted.
    pub fn on_eof(&mut self) -> Vec<Result<ProviderEvent, ProviderError>> {
        if self.done {
            return Vec::new();
        }
        if self.finish_reason.is_some() {
            return self.finish().into_iter().map(Ok).collect();
        }
        let mut out: Vec<Result<ProviderEvent, ProviderError>> =
            self.flush().into_iter().map(Ok).collect();
        out.push(Err(ProviderError::StreamInterrupted(
            "upstream closed before [DONE] or a finish reason".into(),
        )));
        out
    }

    fn flush(&mut self) -> Vec<ProviderEvent> {
        self.done = true;
        let mut events: Vec<ProviderEvent> =
            self.think.finish().into_iter().map(segment_event).collect();
        events.extend(self.calls.drain(..).filter_map(ToolCallAccumulator::into_event));
        events
    }
}

fn segment_event(segment: Segment) -> ProviderEvent {
    match segment {
        Segment::Text(t) => ProviderEvent::TextDelta(t),
        Segment::Reasoning(r) => ProviderEvent::ReasoningDelta(r),
    }
}

pub(crate) fn map_finish_reason(reason: &str) -> FinishReason {
    match reason {
        "tool_calls" | "function_call" => FinishReason::ToolCalls,
        "length" => FinishReason::Length,
        "content_filter" => FinishReason::ContentFilter,
        _ => FinishReason::Stop,
    }
}

/// Accumulates incremental tool call deltas into a complete tool call.
#[derive(Debug, Default)]
struct ToolCallAccumulator {
    id: String,
    name: String,
    arguments: String,
}

impl ToolCallAccumulator {
    fn into_event(self) -> Option<ProviderEvent> {
        finalize_tool_call(self.id, self.name, &self.arguments)
    }
}

// ── API types ───────────────────────────────────────────────────────────

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ApiMessage {
    pub role: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub content: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tool_calls: Option<Vec<ApiToolCall>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tool_call_id: Option<String>,
}

impl ApiMessage {
    fn plain(role: &str, content: &str) -> Self {
        Self {
            role: role.to_string(),
            content: Some(content.to_string()),
            tool_calls: None,
            tool_call_id: None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ApiToolCall {
    pub id: String,
    pub r#type: String,
    pub function: ApiFunction,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ApiFunction {
    pub name: String,
    pub arguments: String,
}

#[derive(Debug, Serialize, Deserialize)]
pub(crate) struct ApiToolDefinition {
    r#type: String,
    function: ApiToolFunction,
}

#[derive(Debug, Serialize, Deserialize)]
struct ApiToolFunction {
    name: String,
    description: String,
    parameters: Value,
}

/// A single SSE `data: {...}` chunk from a streaming response.
#[derive(Debug, Deserialize)]
struct StreamResponse {
    #[serde(default)]
    choices: Vec<StreamChoice>,
    #[serde(default)]
    error: Option<Value>,
}

#[derive(Debug, Deserialize)]
struct StreamChoice {
    #[serde(default)]
    delta: StreamDelta,
    #[serde(default)]
    finish_reason: Option<String>,
}

#[derive(Debug, Default, Deserialize)]
struct StreamDelta {
    #[serde(default)]
    content: Option<String>,
    #[serde(default)]
    reasoning_content: Option<String>,
    #[serde(default)]
    reasoning: Option<String>,
    #[serde(default)]
    tool_calls: Option<Vec<StreamToolCallDelta>>,
}

/// A tool call delta; arrives incrementally across chunks.
#[derive(Debug, Deserialize)]
struct StreamToolCallDelta {
    #[serde(default)]
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
