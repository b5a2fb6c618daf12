//! Completing streamed tool calls.

use chatrelay_core::ProviderEvent;
use serde_json::Value;
use tracing::warn;

/// Turn an accumulated tool call into an event.
///
/// Empty arguments become `{}`. Arguments that are not valid JSON degrade to
/// a text delta carrying the raw call, so the request still completes. A call
/// with no name is dropped. A missing id is replaced with a fresh one.
pub(crate) fn finalize_tool_call(id: String, name: String, raw: &str) -> Option<ProviderEvent> {
    if name.is_empty() {
        warn!(id = %id, "Dropping streamed tool call without a name");
        return None;
    }

    let raw = raw.trim();
    let arguments = if raw.is_empty() {
        Value::Object(Default::default())
    } else {
        match serde_json::from_str::<Value>(raw) {
            Ok(v) => v,
            Err(e) => {
                warn!(tool = %name, error = %e, "Unparseable tool-call arguments, falling back to text");
                return Some(ProviderEvent::TextDelta(format!(
                    "\n[tool call `{name}` with unparseable arguments: {raw}]\n"
                )));
            }
        }
    };

    let id = if id.is_empty() { new_call_id() } else { id };

    Some(ProviderEvent::ToolCall {
        id,
        name,
        arguments,
    })
}

/// A provider-independent tool call id.
pub(crate) fn new_call_id() -> String {
    format!("call_{}", uuid::Uuid::new_v4().simple())
}
