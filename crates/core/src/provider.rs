//! Provider trait: the abstraction over LLM backends.
//!
//! The set of backend families is closed: chat-completions style HTTP,
//! message-block style HTTP, and a local executable. Each family has one
//! [`Provider`] implementation; the gateway picks one per request and only
//! ever sees the family-neutral [`ProviderEvent`] stream it produces.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::error::ProviderError;
use crate::message::Message;

/// Wire-protocol family of a backend.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum ProviderFamily {
    /// `/chat/completions` style: flat messages, `tool` role, streamed deltas
    ChatCompletions,
    /// Content blocks with strict user/assistant alternation
    MessageBlock,
    /// A local executable driven through stdin/stdout
    CliSubprocess,
}

impl ProviderFamily {
    pub fn as_str(&self) -> &'static str {
        match self {
            ProviderFamily::ChatCompletions => "chat-completions",
            ProviderFamily::MessageBlock => "message-block",
            ProviderFamily::CliSubprocess => "cli-subprocess",
        }
    }
}

impl std::fmt::Display for ProviderFamily {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for ProviderFamily {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "chat-completions" | "openai" => Ok(ProviderFamily::ChatCompletions),
            "message-block" | "anthropic" => Ok(ProviderFamily::MessageBlock),
            "cli-subprocess" | "cli" => Ok(ProviderFamily::CliSubprocess),
            other => Err(format!("unknown provider family '{other}'")),
        }
    }
}

/// A request handed to a provider adapter.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProviderRequest {
    /// The model to use (e.g., "gpt-4o", "claude-sonnet-4")
    pub model: String,

    /// Assembled system context, kept apart from the history
    #[serde(default)]
    pub system: String,

    /// Trimmed conversation history
    pub messages: Vec<Message>,

    /// Tools the model may call
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub tools: Vec<ToolDefinition>,

    /// Maximum tokens to generate
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub max_tokens: Option<u32>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub temperature: Option<f32>,
}

/// A tool definition in the canonical (chat-completions) shape.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ToolDefinition {
    /// The tool name
    pub name: String,

    /// Description of what the tool does
    #[serde(default)]
    pub description: String,

    /// JSON Schema describing the tool's parameters
    #[serde(default = "empty_schema")]
    pub parameters: Value,
}

fn empty_schema() -> Value {
    serde_json::json!({ "type": "object", "properties": {} })
}

impl ToolDefinition {
    /// Accept either the flat shape or `{"type":"function","function":{...}}`.
    pub fn from_value(value: &Value) -> Option<Self> {
        let inner = value.get("function").unwrap_or(value);
        let name = inner.get("name")?.as_str()?.trim();
        if name.is_empty() {
            return None;
        }
        let description = inner
            .get("description")
            .and_then(Value::as_str)
            .unwrap_or_default()
            .to_string();
        let parameters = inner
            .get("parameters")
            .or_else(|| inner.get("input_schema"))
            .cloned()
            .unwrap_or_else(empty_schema);
        Some(Self {
            name: name.to_string(),
            description,
            parameters,
        })
    }
}

/// Why generation stopped.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum FinishReason {
    Stop,
    ToolCalls,
    Length,
    ContentFilter,
    Error,
}

impl FinishReason {
    pub fn as_str(&self) -> &'static str {
        match self {
            FinishReason::Stop => "stop",
            FinishReason::ToolCalls => "tool-calls",
            FinishReason::Length => "length",
            FinishReason::ContentFilter => "content-filter",
            FinishReason::Error => "error",
        }
    }
}

impl std::fmt::Display for FinishReason {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// One event from a provider adapter. Family-specific parsing ends here.
#[derive(Debug, Clone, PartialEq)]
pub enum ProviderEvent {
    TextDelta(String),
    ReasoningDelta(String),
    /// A complete tool call; arguments are already parsed.
    ToolCall {
        id: String,
        name: String,
        arguments: Value,
    },
    Finish(FinishReason),
}

/// The receiving half of an adapter's event channel.
///
/// Dropping it cancels the adapter: its task notices the closed channel and
/// releases the connection or child process it holds.
pub type EventReceiver = tokio::sync::mpsc::Receiver<Result<ProviderEvent, ProviderError>>;

/// The core Provider trait.
///
/// One implementation per [`ProviderFamily`]. The pipeline calls `stream()`
/// without knowing which family it is talking to.
#[async_trait]
pub trait Provider: Send + Sync {
    /// The configured name of this provider (e.g., "openrouter", "claude").
    fn name(&self) -> &str;

    fn family(&self) -> ProviderFamily;

    /// Default model used when the request does not name one.
    fn model(&self) -> &str;

    /// Start generation and return the event stream.
    ///
    /// Errors before the first byte (connect, status) are returned directly;
    /// later failures arrive through the channel.
    async fn stream(&self, request: ProviderRequest) -> Result<EventReceiver, ProviderError>;
}
