//! Structured-reply extraction for providers without native tool calling.
//!
//! The model is asked for a JSON object but often wraps it in prose or a
//! code fence. Extraction prefers a fenced block, then the whole reply, then
//! the first balanced `{...}` object in the text. Anything unrecognizable is
//! plain text.

use serde_json::Value;
use tracing::debug;

/// A reply split into text for the user and requested tool calls.
#[derive(Debug, Clone, PartialEq, Default)]
pub struct StructuredReply {
    pub text: String,
    /// `(name, arguments)` in the order the model listed them
    pub tool_calls: Vec<(String, Value)>,
}

const TEXT_KEYS: [&str; 4] = ["response", "text", "message", "content"];
const ARG_KEYS: [&str; 4] = ["arguments", "args", "input", "parameters"];

/// Interpret a free-form reply.
pub fn interpret_reply(reply: &str) -> StructuredReply {
    let Some(value) = extract_json(reply) else {
        return StructuredReply {
            text: reply.trim().to_string(),
            tool_calls: Vec::new(),
        };
    };

    let tool_calls = tool_calls_from(&value);
    let text = TEXT_KEYS
        .iter()
        .find_map(|k| value.get(k).and_then(Value::as_str))
        .map(str::to_string);

    match text {
        Some(text) => StructuredReply { text, tool_calls },
        None if !tool_calls.is_empty() => StructuredReply {
            text: String::new(),
            tool_calls,
        },
        None => {
            debug!("JSON in reply has no recognized fields, treating reply as text");
            StructuredReply {
                text: reply.trim().to_string(),
                tool_calls: Vec::new(),
            }
        }
    }
}

/// Find the JSON value the model meant to send.
pub fn extract_json(text: &str) -> Option<Value> {
    fenced_blocks(text)
        .into_iter()
        .find_map(|block| parse_container(block.trim()))
        .or_else(|| parse_container(text.trim()))
        .or_else(|| first_balanced_object(text))
}

fn parse_container(s: &str) -> Option<Value> {
    match serde_json::from_str::<Value>(s) {
        Ok(v) if v.is_object() || v.is_array() => Some(v),
        _ => None,
    }
}

/// Bodies of ``` fenced blocks, with any language tag removed.
fn fenced_blocks(text: &str) -> Vec<&str> {
    let mut blocks = Vec::new();
    let mut rest = text;

    while let Some(open) = rest.find("```") {
        let after = &rest[open + 3..];
        // Skip the info string ("json", "JSON", ...) up to end of line
        let body_start = after.find('\n').map(|i| i + 1).unwrap_or(0);
        let body = &after[body_start..];
        let Some(close) = body.find("```") else {
            break;
        };
        blocks.push(&body[..close]);
        rest = &body[close + 3..];
    }

    blocks
}

/// First `{...}` that parses, scanning string-aware for the matching brace.
fn first_balanced_object(text: &str) -> Option<Value> {
    let bytes = text.as_bytes();
    let mut search_from = 0;

    while let Some(offset) = text[search_from..].find('{') {
        let start = search_from + offset;
        if let Some(end) = matching_brace(bytes, start) {
            if let Ok(v) = serde_json::from_str::<Value>(&text[start..=end]) {
                if v.is_object() {
                    return Some(v);
                }
            }
        }
        search_from = start + 1;
    }

    None
}

fn matching_brace(bytes: &[u8], start: usize) -> Option<usize> {
    let mut depth = 0usize;
    let mut in_string = false;
    let mut escaped = false;

    for (i, &b) in bytes.iter().enumerate().skip(start) {
        if in_string {
            match b {
                _ if escaped => escaped = false,
                b'\\' => escaped = true,
                b'"' => in_string = false,
                _ => {}
            }
            continue;
        }
        match b {
            b'"' => in_string = true,
            b'{' => depth += 1,
            b'}' => {
                depth -= 1;
                if depth == 0 {
                    return Some(i);
                }
            }
            _ => {}
        }
    }

    None
}

fn tool_calls_from(value: &Value) -> Vec<(String, Value)> {
    if let Some(items) = value.as_array() {
        return items.iter().filter_map(|v| single_call(v, true)).collect();
    }
    if let Some(items) = value.get("tool_calls").and_then(Value::as_array) {
        return items.iter().filter_map(|v| single_call(v, true)).collect();
    }
    single_call(value, false).into_iter().collect()
}

/// Read one call. Inside a list a bare `name` is enough; at top level a
/// `name` also needs arguments, so `{"name": "Ada"}` stays text.
fn single_call(value: &Value, in_list: bool) -> Option<(String, Value)> {
    let obj = value.as_object()?;
    let func = obj.get("function").and_then(Value::as_object);

    let name = obj
        .get("tool")
        .and_then(Value::as_str)
        .or_else(|| func.and_then(|f| f.get("name")).and_then(Value::as_str))
        .or_else(|| {
            let has_args = ARG_KEYS.iter().any(|k| obj.contains_key(*k));
            (in_list || has_args)
                .then(|| obj.get("name").and_then(Value::as_str))
                .flatten()
        })?
        .trim();
    if name.is_empty() {
        return None;
    }

    let raw_args = ARG_KEYS
        .iter()
        .find_map(|k| obj.get(*k))
        .or_else(|| func.and_then(|f| ARG_KEYS.iter().find_map(|k| f.get(*k))));

    let arguments = match raw_args {
        None | Some(Value::Null) => Value::Object(Default::default()),
        // Some models double-encode arguments
        Some(Value::String(s)) => serde_json::from_str(s).unwrap_or_else(|_| Value::String(s.clone())),
        Some(v) => v.clone(),
    };

    Some((name.to_string(), arguments))
}
