//! Message and Conversation domain types.
//!
//! A message is a role plus an ordered list of typed parts. Every request
//! carries the whole conversation; nothing here is persisted server-side.

use serde::{Deserialize, Serialize};
use serde_json::Value;

/// The role of a message sender in a conversation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    /// The end user
    User,
    /// The model
    Assistant,
    /// System instructions
    System,
    /// Tool execution result
    Tool,
}

impl Role {
    pub fn as_str(&self) -> &'static str {
        match self {
            Role::User => "user",
            Role::Assistant => "assistant",
            Role::System => "system",
            Role::Tool => "tool",
        }
    }

    /// Parse a role name as clients send it. Unknown roles yield `None`.
    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "user" => Some(Role::User),
            "assistant" => Some(Role::Assistant),
            "system" => Some(Role::System),
            "tool" => Some(Role::Tool),
            _ => None,
        }
    }
}

impl std::fmt::Display for Role {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// One typed fragment of a message.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "kebab-case")]
pub enum Part {
    Text {
        content: String,
    },
    Reasoning {
        content: String,
    },
    ToolCall {
        id: String,
        name: String,
        arguments: Value,
    },
    ToolResult {
        call_id: String,
        payload: Value,
    },
}

impl Part {
    pub fn text(content: impl Into<String>) -> Self {
        Part::Text {
            content: content.into(),
        }
    }

    pub fn reasoning(content: impl Into<String>) -> Self {
        Part::Reasoning {
            content: content.into(),
        }
    }

    pub fn tool_call(id: impl Into<String>, name: impl Into<String>, arguments: Value) -> Self {
        Part::ToolCall {
            id: id.into(),
            name: name.into(),
            arguments,
        }
    }

    pub fn tool_result(call_id: impl Into<String>, payload: Value) -> Self {
        Part::ToolResult {
            call_id: call_id.into(),
            payload,
        }
    }

    pub fn is_tool_call(&self) -> bool {
        matches!(self, Part::ToolCall { .. })
    }

    pub fn is_tool_result(&self) -> bool {
        matches!(self, Part::ToolResult { .. })
    }
}

/// A single message in a conversation.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Message {
    /// Who sent this message
    pub role: Role,

    /// Ordered content
    pub parts: Vec<Part>,

    /// Synthetic local-command response; never forwarded to a model.
    #[serde(default, skip_serializing_if = "std::ops::Not::not")]
    pub local: bool,
}

impl Message {
    pub fn new(role: Role, parts: Vec<Part>) -> Self {
        Self {
            role,
            parts,
            local: false,
        }
    }

    /// Create a new user message.
    pub fn user(content: impl Into<String>) -> Self {
        Self::new(Role::User, vec![Part::text(content)])
    }

    /// Create a new assistant message.
    pub fn assistant(content: impl Into<String>) -> Self {
        Self::new(Role::Assistant, vec![Part::text(content)])
    }

    /// Create a new system message.
    pub fn system(content: impl Into<String>) -> Self {
        Self::new(Role::System, vec![Part::text(content)])
    }

    /// Create a tool-role message carrying one result.
    pub fn tool_result(call_id: impl Into<String>, payload: Value) -> Self {
        Self::new(Role::Tool, vec![Part::tool_result(call_id, payload)])
    }

    /// All text parts joined in order. Reasoning is not included.
    pub fn text(&self) -> String {
        self.parts
            .iter()
            .filter_map(|p| match p {
                Part::Text { content } => Some(content.as_str()),
                _ => None,
            })
            .collect::<Vec<_>>()
            .join("")
    }

    /// Tool calls as `(id, name, arguments)`.
    pub fn tool_calls(&self) -> impl Iterator<Item = (&str, &str, &Value)> {
        self.parts.iter().filter_map(|p| match p {
            Part::ToolCall {
                id,
                name,
                arguments,
            } => Some((id.as_str(), name.as_str(), arguments)),
            _ => None,
        })
    }

    /// Tool results as `(call_id, payload)`.
    pub fn tool_results(&self) -> impl Iterator<Item = (&str, &Value)> {
        self.parts.iter().filter_map(|p| match p {
            Part::ToolResult { call_id, payload } => Some((call_id.as_str(), payload)),
            _ => None,
        })
    }

    pub fn has_tool_calls(&self) -> bool {
        self.parts.iter().any(Part::is_tool_call)
    }

    pub fn has_tool_results(&self) -> bool {
        self.parts.iter().any(Part::is_tool_result)
    }

    pub fn is_empty(&self) -> bool {
        self.parts.is_empty()
    }
}

/// An ordered conversation, owned by a single request.
///
/// Clients resubmit the whole history every time; the gateway never stores one.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Conversation {
    messages: Vec<Message>,
}

impl Conversation {
    pub fn new(messages: Vec<Message>) -> Self {
        Self { messages }
    }

    pub fn push(&mut self, message: Message) {
        self.messages.push(message);
    }

    pub fn messages(&self) -> &[Message] {
        &self.messages
    }

    pub fn into_messages(self) -> Vec<Message> {
        self.messages
    }

    pub fn len(&self) -> usize {
        self.messages.len()
    }

    pub fn is_empty(&self) -> bool {
        self.messages.is_empty()
    }

    /// Text of the newest message, if that message is from the user.
    pub fn last_user_text(&self) -> Option<String> {
        self.messages
            .last()
            .filter(|m| m.role == Role::User)
            .map(Message::text)
    }

    /// Ids of tool calls that no later message answers.
    pub fn unresolved_tool_calls(&self) -> Vec<String> {
        let mut pending: Vec<String> = Vec::new();
        for msg in &self.messages {
            for (id, _, _) in msg.tool_calls() {
                pending.push(id.to_string());
            }
            for (call_id, _) in msg.tool_results() {
                pending.retain(|id| id != call_id);
            }
        }
        pending
    }
}

impl From<Vec<Message>> for Conversation {
    fn from(messages: Vec<Message>) -> Self {
        Self::new(messages)
    }
}
