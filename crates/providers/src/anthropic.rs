//! Message-block family adapter (Anthropic Messages API).
//!
//! Features:
//! - `x-api-key` header authentication (not Bearer)
//! - `anthropic-version` header
//! - System prompt as top-level field
//! - Strict user/assistant alternation: adjacent same-role messages are merged
//! - Native tool use with `tool_use` / `tool_result` content blocks
//! - Streaming via SSE with `content_block_*` events, including thinking

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

use crate::openai_compat::{parse_payload, payload_to_string};
use crate::sse::{SseDecoder, check_status, transport_error};
use crate::tool_args::finalize_tool_call;

const ANTHROPIC_VERSION: &str = "2023-06-01";

/// Inserted when a conversation would otherwise open with an assistant turn.
const OPENER_TEXT: &str = "(continuing conversation)";

/// Anthropic native Messages API provider.
pub struct AnthropicProvider {
    name: String,
    base_url: String,
    api_key: Option<String>,
    model: String,
    max_tokens: u32,
    temperature: Option<f32>,
    client: reqwest::Client,
}

impl AnthropicProvider {
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
        let (lifted_system, messages) = to_api_messages(&request.messages);
        let system = [request.system.as_str(), lifted_system.as_deref().unwrap_or("")]
            .into_iter()
            .filter(|s| !s.is_empty())
            .collect::<Vec<_>>()
            .join("\n\n");

        let model = if request.model.is_empty() {
            &self.model
        } else {
            &request.model
        };

        let mut body = serde_json::json!({
            "model": model,
            "messages": messages,
            "max_tokens": request.max_tokens.unwrap_or(self.max_tokens),
            "stream": true,
        });

        if !system.is_empty() {
            body["system"] = serde_json::json!(system);
        }
        if let Some(t) = request.temperature.or(self.temperature) {
            body["temperature"] = serde_json::json!(t);
        }
        // Tool specs are translated once, here
        if !request.tools.is_empty() {
            body["tools"] = serde_json::json!(to_api_tools(&request.tools));
        }

        body
    }
}

#[async_trait]
impl Provider for AnthropicProvider {
    fn name(&self) -> &str {
        &self.name
    }

    fn family(&self) -> ProviderFamily {
        ProviderFamily::MessageBlock
    }

    fn model(&self) -> &str {
        &self.model
    }

    async fn stream(&self, request: ProviderRequest) -> Result<EventReceiver, ProviderError> {
        let url = format!("{}/messages", self.base_url);
        let body = self.build_body(&request);

        debug!(
            provider = %self.name,
            model = %body["model"],
            messages = body["messages"].as_array().map(Vec::len).unwrap_or(0),
            "Sending streaming request"
        );

        let response = self
            .client
            .post(&url)
            .header("x-api-key", self.api_key.as_deref().unwrap_or_default())
            .header("anthropic-version", ANTHROPIC_VERSION)
            .header("Content-Type", "application/json")
            .json(&body)
            .send()
            .await
            .map_err(transport_error)?;
        let response = check_status(response, &self.name).await?;

        let (tx, rx) = tokio::sync::mpsc::channel(64);
        let provider_name = self.name.clone();

        tokio::spawn(async move {
            let mut byte_stream = response.bytes_stream();
            let mut decoder = SseDecoder::new();
            let mut parser = MessageBlockStream::new();

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
                            return;
                        }
                    }
                    if parser.is_done() {
                        return;
                    }
                }
            }

            if let Some(err) = parser.on_eof() {
                warn!(provider = %provider_name, error = %err, "Upstream closed without message_stop");
                let _ = tx.send(Err(err)).await;
            }
        });

        Ok(rx)
    }
}

// ── Message conversion ──────────────────────────────────────────────────

/// Convert unified messages to alternating message-block messages.
///
/// Returns the text of any system-role messages (the API takes system text
/// as a top-level field) and the converted messages. Tool results become
/// `tool_result` blocks on user turns, reasoning is dropped, empty text is
/// skipped, and adjacent messages with the same resulting role are merged
/// without losing any block.
pub fn to_api_messages(messages: &[Message]) -> (Option<String>, Vec<AnthropicMessage>) {
    let mut system_parts: Vec<String> = Vec::new();
    let mut turns: Vec<(&'static str, Vec<ContentBlock>)> = Vec::new();

    for msg in messages {
        let role = match msg.role {
            Role::System => {
                let text = msg.text();
                if !text.trim().is_empty() {
                    system_parts.push(text);
                }
                continue;
            }
            Role::User | Role::Tool => "user",
            Role::Assistant => "assistant",
        };

        let blocks: Vec<ContentBlock> = msg.parts.iter().filter_map(to_block).collect();
        if blocks.is_empty() {
            continue;
        }

        match turns.last_mut() {
            Some((last_role, last_blocks)) if *last_role == role => {
                merge_blocks(last_blocks, blocks)
            }
            _ => turns.push((role, blocks)),
        }
    }

    if turns.first().is_some_and(|(role, _)| *role == "assistant") {
        turns.insert(
            0,
            (
                "user",
                vec![ContentBlock::Text {
                    text: OPENER_TEXT.into(),
                }],
            ),
        );
    }

    let out = turns
        .into_iter()
        .map(|(role, mut blocks)| {
            if role == "user" {
                // tool_result blocks must lead a user turn
                blocks.sort_by_key(|b| !matches!(b, ContentBlock::ToolResult { .. }));
            }
            AnthropicMessage {
                role: role.to_string(),
                content: AnthropicContent::Blocks(blocks),
            }
        })
        .collect();

    let system = if system_parts.is_empty() {
        None
    } else {
        Some(system_parts.join("\n\n"))
    };
    (system, out)
}

fn to_block(part: &Part) -> Option<ContentBlock> {
    match part {
        Part::Text { content } if content.trim().is_empty() => None,
        Part::Text { content } => Some(ContentBlock::Text {
            text: content.clone(),
        }),
        Part::Reasoning { .. } => None,
        Part::ToolCall {
            id,
            name,
            arguments,
        } => Some(ContentBlock::ToolUse {
            id: id.clone(),
            name: name.clone(),
            input: if arguments.is_object() {
                arguments.clone()
            } else {
                serde_json::json!({ "value": arguments })
            },
        }),
        Part::ToolResult { call_id, payload } => Some(ContentBlock::ToolResult {
            tool_use_id: call_id.clone(),
            content: payload_to_string(payload),
        }),
    }
}

/// Append blocks, joining text that lands next to text.
fn merge_blocks(into: &mut Vec<ContentBlock>, blocks: Vec<ContentBlock>) {
    for block in blocks {
        match (into.last_mut(), block) {
            (Some(ContentBlock::Text { text }), ContentBlock::Text { text: next }) => {
                text.push_str("\n\n");
                text.push_str(&next);
            }
            (_, block) => into.push(block),
        }
    }
}

/// Convert message-block messages back to the unified shape.
///
/// Tool results on a user turn come back as a separate tool-role message.
pub fn from_api_messages(system: Option<&str>, messages: &[AnthropicMessage]) -> Vec<Message> {
    let mut out = Vec::new();

    if let Some(system) = system.filter(|s| !s.is_empty()) {
        out.push(Message::system(system));
    }

    for msg in messages {
        let Some(role) = Role::parse(&msg.role) else {
            continue;
        };
        let blocks: Vec<ContentBlock> = match &msg.content {
            AnthropicContent::Text(t) => vec![ContentBlock::Text { text: t.clone() }],
            AnthropicContent::Blocks(b) => b.clone(),
        };

        let mut results = Vec::new();
        let mut parts = Vec::new();
        for block in blocks {
            match block {
                ContentBlock::Text { text } => parts.push(Part::text(text)),
                ContentBlock::ToolUse { id, name, input } => {
                    parts.push(Part::tool_call(id, name, input))
                }
                ContentBlock::ToolResult {
                    tool_use_id,
                    content,
                } => results.push(Part::tool_result(tool_use_id, parse_payload(&content))),
            }
        }

        if !results.is_empty() {
            out.push(Message::new(Role::Tool, results));
        }
        if !parts.is_empty() {
            out.push(Message::new(role, parts));
        }
    }

    out
}

/// Convert chat-completions shaped tool definitions to `input_schema` form.
pub(crate) fn to_api_tools(tools: &[ToolDefinition]) -> Vec<AnthropicTool> {
    tools
        .iter()
        .map(|t| AnthropicTool {
            name: t.name.clone(),
            description: t.description.clone(),
            input_schema: t.parameters.clone(),
        })
        .collect()
}

// ── Stream parsing ──────────────────────────────────────────────────────

#[derive(Debug)]
struct PendingToolUse {
    id: String,
    name: String,
    json: String,
}

/// Turns message-block SSE payloads into provider events.
pub(crate) struct MessageBlockStream {
    tool_blocks: HashMap<u64, PendingToolUse>,
    finish_reason: Option<FinishReason>,
    done: bool,
}

impl MessageBlockStream {
    pub fn new() -> Self {
        Self {
            tool_blocks: HashMap::new(),
            finish_reason: None,
            done: false,
        }
    }

    pub fn is_done(&self) -> bool {
        self.done
    }

    pub fn on_data(&mut self, data: &str) -> Result<Vec<ProviderEvent>, ProviderError> {
        if self.done || data.is_empty() {
            return Ok(Vec::new());
        }

        let event: Value = match serde_json::from_str(data) {
            Ok(v) => v,
            Err(e) => {
                trace!(error = %e, data = %data, "Ignoring unparseable message-block SSE");
                return Ok(Vec::new());
            }
        };

        let index = event["index"].as_u64().unwrap_or(0);
        let mut events = Vec::new();

        match event["type"].as_str().unwrap_or("") {
            "content_block_start" => {
                let block = &event["content_block"];
                match block["type"].as_str() {
                    Some("tool_use") => {
                        self.tool_blocks.insert(
                            index,
                            PendingToolUse {
                                id: block["id"].as_str().unwrap_or_default().to_string(),
                                name: block["name"].as_str().unwrap_or_default().to_string(),
                                json: String::new(),
                            },
                        );
                    }
                    Some("text") => {
                        if let Some(text) = block["text"].as_str().filter(|t| !t.is_empty()) {
                            events.push(ProviderEvent::TextDelta(text.to_string()));
                        }
                    }
                    _ => {}
                }
            }
            "content_block_delta" => {
                let delta = &event["delta"];
                match delta["type"].as_str().unwrap_or("") {
                    "text_delta" => {
                        if let Some(text) = delta["text"].as_str().filter(|t| !t.is_empty()) {
                            events.push(ProviderEvent::TextDelta(text.to_string()));
                        }
                    }
                    "thinking_delta" => {
                        if let Some(thinking) =
                            delta["thinking"].as_str().filter(|t| !t.is_empty())
                        {
                            events.push(ProviderEvent::ReasoningDelta(thinking.to_string()));
                        }
                    }
                    "input_json_delta" => {
                        if let (Some(pending), Some(partial)) = (
                            self.tool_blocks.get_mut(&index),
                            delta["partial_json"].as_str(),
                        ) {
                            pending.json.push_str(partial);
                        }
                    }
                    _ => {}
                }
            }
            "content_block_stop" => {
                if let Some(pending) = self.tool_blocks.remove(&index) {
                    events.extend(finalize_tool_call(pending.id, pending.name, &pending.json));
                }
            }
            "message_delta" => {
                if let Some(reason) = event["delta"]["stop_reason"].as_str() {
                    self.finish_reason = Some(map_stop_reason(reason));
                }
            }
            "message_stop" => events.extend(self.finish()),
            "error" => {
                let error = &event["error"];
                let message = error["message"].as_str().unwrap_or("unknown error").to_string();
                return Err(match error["type"].as_str().unwrap_or("") {
                    "rate_limit_error" | "overloaded_error" => {
                        ProviderError::RateLimited { retry_after_secs: 5 }
                    }
                    "authentication_error" | "permission_error" => {
                        ProviderError::AuthenticationFailed(message)
                    }
                    _ => ProviderError::ApiError {
                        status_code: 500,
                        message,
                    },
                });
            }
            // message_start, ping
            _ => {}
        }

        Ok(events)
    }

    /// Emit unfinished tool blocks, then `Finish`.
    pub fn finish(&mut self) -> Vec<ProviderEvent> {
        if self.done {
            return Vec::new();
        }
        self.done = true;

        let mut pending: Vec<(u64, PendingToolUse)> = self.tool_blocks.drain().collect();
        pending.sort_by_key(|(i, _)| *i);
        let mut events: Vec<ProviderEvent> = pending
            .into_iter()
            .filter_map(|(_, p)| finalize_tool_call(p.id, p.name, &p.json))
            .collect();

        events.push(ProviderEvent::Finish(
            self.finish_reason.unwrap_or(FinishReason::Stop),
        ));
        events
    }

    /// The byte stream ended before `message_stop`.
    ///
    /// Finished blocks were already emitted at `content_block_stop`; tool
    /// blocks still open are incomplete and dropped.
    pub fn on_eof(&mut self) -> Option<ProviderError> {
        if self.done {
            return None;
        }
        self.done = true;
        if !self.tool_blocks.is_empty() {
            debug!(open = self.tool_blocks.len(), "Dropping unfinished tool blocks");
            self.tool_blocks.clear();
        }
        Some(ProviderError::StreamInterrupted(
            "upstream closed before message_stop".into(),
        ))
    }
}

pub(crate) fn map_stop_reason(reason: &str) -> FinishReason {
    match reason {
        "tool_use" => FinishReason::ToolCalls,
        "max_tokens" => FinishReason::Length,
        "refusal" => FinishReason::ContentFilter,
        // end_turn, stop_sequence, pause_turn
        _ => FinishReason::Stop,
    }
}

// ── API types ───────────────────────────────────────────────────────────

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AnthropicMessage {
    pub role: String,
    pub content: AnthropicContent,
}

impl AnthropicMessage {
    /// Number of blocks carried.
    pub fn block_count(&self) -> usize {
        match &self.content {
            AnthropicContent::Text(_) => 1,
            AnthropicContent::Blocks(b) => b.len(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum AnthropicContent {
    Text(String),
    Blocks(Vec<ContentBlock>),
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type")]
pub enum ContentBlock {
    #[serde(rename = "text")]
    Text { text: String },
    #[serde(rename = "tool_use")]
    ToolUse { id: String, name: String, input: Value },
    #[serde(rename = "tool_result")]
    ToolResult { tool_use_id: String, content: String },
}

#[derive(Debug, Serialize, Deserialize)]
pub(crate) struct AnthropicTool {
    name: String,
    description: String,
    input_schema: Value,
}
