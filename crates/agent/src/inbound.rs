//! Parsing the client's chat request into unified messages.
//!
//! The client sends its whole history on every request. Historical messages
//! come in several shapes (UI-stream parts, explicit call/result parts, a
//! plain `content` string), and one malformed message must never fail the
//! request: anything unrecognizable is dropped with a warning.

use std::collections::HashSet;

use chatrelay_core::message::{Conversation, Message, Part, Role};
use chatrelay_core::provider::ToolDefinition;
use serde::Deserialize;
use serde_json::{Map, Value};
use tracing::{debug, warn};

/// Body of `POST /v1/chat`.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct ChatRequest {
    #[serde(default)]
    pub messages: Vec<Value>,
    /// Tool specs the client can execute; flat or `{"function": {...}}` form
    #[serde(default)]
    pub tools: Vec<Value>,
}

impl ChatRequest {
    pub fn new(messages: Vec<Value>) -> Self {
        Self {
            messages,
            tools: Vec::new(),
        }
    }

    pub fn parsed_messages(&self) -> Vec<Message> {
        parse_messages(&self.messages)
    }

    pub fn conversation(&self) -> Conversation {
        Conversation::new(self.parsed_messages())
    }

    pub fn parsed_tools(&self) -> Vec<ToolDefinition> {
        parse_tools(&self.tools)
    }
}

/// Parse tool specs, skipping any without a name.
pub fn parse_tools(values: &[Value]) -> Vec<ToolDefinition> {
    values
        .iter()
        .filter_map(|v| {
            let tool = ToolDefinition::from_value(v);
            if tool.is_none() {
                warn!(tool = %v, "Dropping tool spec without a name");
            }
            tool
        })
        .collect()
}

/// Parse an inbound message array.
///
/// Local command echoes are removed, assistant messages carrying tool
/// results are split into an assistant message and a tool message, and tool
/// results that answer no earlier call are dropped.
pub fn parse_messages(values: &[Value]) -> Vec<Message> {
    let mut parsed = Vec::with_capacity(values.len());

    for (index, value) in values.iter().enumerate() {
        let Some(obj) = value.as_object() else {
            warn!(index, "Dropping message that is not an object");
            continue;
        };
        if is_local(obj) {
            debug!(index, "Skipping local command message");
            continue;
        }
        let Some(role) = obj.get("role").and_then(Value::as_str).and_then(Role::parse) else {
            warn!(index, role = ?obj.get("role"), "Dropping message with unknown role");
            continue;
        };
        let Some(parts) = message_parts(role, obj) else {
            warn!(index, "Dropping message with malformed content");
            continue;
        };
        parsed.extend(split_results(role, parts));
    }

    drop_orphaned_results(parsed)
}

fn is_local(obj: &Map<String, Value>) -> bool {
    obj.get("metadata")
        .and_then(|m| m.get("local"))
        .and_then(Value::as_bool)
        .unwrap_or(false)
        || obj.get("local").and_then(Value::as_bool).unwrap_or(false)
}

fn message_parts(role: Role, obj: &Map<String, Value>) -> Option<Vec<Part>> {
    if let Some(parts) = obj.get("parts") {
        return parse_part_list(parts.as_array()?);
    }

    match obj.get("content") {
        Some(Value::String(text)) => {
            // Chat-completions style tool message
            if role == Role::Tool {
                let call_id = obj.get("tool_call_id").and_then(Value::as_str)?;
                return Some(vec![Part::tool_result(call_id, text_payload(text))]);
            }
            Some(vec![Part::text(text.clone())])
        }
        Some(Value::Array(items)) => parse_part_list(items),
        Some(Value::Null) | None => None,
        Some(_) => None,
    }
}

fn parse_part_list(items: &[Value]) -> Option<Vec<Part>> {
    let mut parts = Vec::with_capacity(items.len());
    for item in items {
        parts.extend(parse_part(item));
    }
    Some(parts)
}

/// One inbound part may expand to a call plus its result.
fn parse_part(item: &Value) -> Vec<Part> {
    let Some(kind) = item.get("type").and_then(Value::as_str) else {
        if let Some(text) = item.as_str() {
            return vec![Part::text(text)];
        }
        warn!(part = %item, "Dropping part without a type");
        return Vec::new();
    };

    match kind {
        "text" => text_field(item).map(Part::text).into_iter().collect(),
        "reasoning" => text_field(item).map(Part::reasoning).into_iter().collect(),
        "tool-call" => {
            let (Some(id), Some(name)) = (str_field(item, "toolCallId"), str_field(item, "toolName"))
            else {
                warn!(part = %item, "Dropping tool call without id or name");
                return Vec::new();
            };
            let input = item
                .get("input")
                .or_else(|| item.get("args"))
                .cloned()
                .unwrap_or_else(|| Value::Object(Map::new()));
            vec![Part::tool_call(id, name, input)]
        }
        "tool-result" => {
            let Some(id) = str_field(item, "toolCallId") else {
                warn!(part = %item, "Dropping tool result without id");
                return Vec::new();
            };
            let output = item
                .get("output")
                .or_else(|| item.get("result"))
                .cloned()
                .unwrap_or(Value::Null);
            vec![Part::tool_result(id, output)]
        }
        "dynamic-tool" => match str_field(item, "toolName") {
            Some(name) => ui_tool_part(name, item),
            None => Vec::new(),
        },
        // step-start, source-url, file and other UI-only parts
        other => match other.strip_prefix("tool-") {
            Some(name) if !name.is_empty() => ui_tool_part(name, item),
            _ => {
                debug!(kind = other, "Ignoring non-content part");
                Vec::new()
            }
        },
    }
}

/// A UI-stream tool part carries the call and, once run, its outcome.
fn ui_tool_part(name: &str, item: &Value) -> Vec<Part> {
    let Some(id) = str_field(item, "toolCallId") else {
        warn!(tool = name, "Dropping tool part without toolCallId");
        return Vec::new();
    };
    let input = item
        .get("input")
        .cloned()
        .filter(|v| !v.is_null())
        .unwrap_or_else(|| Value::Object(Map::new()));

    let mut parts = vec![Part::tool_call(id, name, input)];
    match str_field(item, "state").unwrap_or("input-available") {
        "output-available" => {
            let output = item.get("output").cloned().unwrap_or(Value::Null);
            parts.push(Part::tool_result(id, output));
        }
        "output-error" => {
            let error = str_field(item, "errorText").unwrap_or("tool failed");
            parts.push(Part::tool_result(id, serde_json::json!({ "error": error })));
        }
        // input-streaming, input-available: call still pending
        _ => {}
    }
    parts
}

fn text_field(item: &Value) -> Option<String> {
    str_field(item, "text")
        .or_else(|| str_field(item, "content"))
        .map(str::to_string)
}

fn str_field<'a>(item: &'a Value, key: &str) -> Option<&'a str> {
    item.get(key).and_then(Value::as_str)
}

fn text_payload(text: &str) -> Value {
    let trimmed = text.trim_start();
    if trimmed.starts_with('{') || trimmed.starts_with('[') {
        if let Ok(v) = serde_json::from_str(text) {
            return v;
        }
    }
    Value::String(text.to_string())
}

/// Results never ride on an assistant message downstream.
fn split_results(role: Role, parts: Vec<Part>) -> Vec<Message> {
    if role == Role::Tool {
        let results: Vec<Part> = parts.into_iter().filter(Part::is_tool_result).collect();
        return vec![Message::new(Role::Tool, results)];
    }
    if role != Role::Assistant || !parts.iter().any(Part::is_tool_result) {
        return vec![Message::new(role, parts)];
    }

    let (results, rest): (Vec<Part>, Vec<Part>) = parts.into_iter().partition(Part::is_tool_result);
    vec![Message::new(role, rest), Message::new(Role::Tool, results)]
}

fn drop_orphaned_results(messages: Vec<Message>) -> Vec<Message> {
    let mut known_calls: HashSet<String> = HashSet::new();
    let mut out = Vec::with_capacity(messages.len());

    for mut msg in messages {
        for (id, _, _) in msg.tool_calls() {
            known_calls.insert(id.to_string());
        }
        msg.parts.retain(|part| match part {
            Part::ToolResult { call_id, .. } => {
                let known = known_calls.contains(call_id);
                if !known {
                    warn!(call_id = %call_id, "Dropping tool result with no matching call");
                }
                known
            }
            _ => true,
        });
        if msg.is_empty() {
            continue;
        }
        out.push(msg);
    }

    out
}
