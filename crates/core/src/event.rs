//! Outbound stream events: the wire protocol the client consumes.
//!
//! Each event is one JSON object sent as an SSE `data:` line. A stream is
//! `start`, any number of text/reasoning parts and tool inputs, then exactly
//! one terminal (`finish` or `error`), then the literal [`DONE_SENTINEL`].

use std::collections::HashSet;

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::error::ProtocolError;
use crate::provider::FinishReason;

/// Payload of the final `data:` line.
pub const DONE_SENTINEL: &str = "[DONE]";

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "kebab-case")]
pub enum StreamEvent {
    #[serde(rename_all = "camelCase")]
    Start {
        message_id: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        message_metadata: Option<Value>,
    },
    ReasoningStart {
        id: String,
    },
    ReasoningDelta {
        id: String,
        delta: String,
    },
    ReasoningEnd {
        id: String,
    },
    TextStart {
        id: String,
    },
    TextDelta {
        id: String,
        delta: String,
    },
    TextEnd {
        id: String,
    },
    #[serde(rename_all = "camelCase")]
    ToolInputAvailable {
        tool_call_id: String,
        tool_name: String,
        input: Value,
    },
    #[serde(rename_all = "camelCase")]
    Finish { finish_reason: FinishReason },
    #[serde(rename_all = "camelCase")]
    Error { error_text: String },
}

impl StreamEvent {
    /// The `type` tag as it appears on the wire.
    pub fn kind(&self) -> &'static str {
        match self {
            StreamEvent::Start { .. } => "start",
            StreamEvent::ReasoningStart { .. } => "reasoning-start",
            StreamEvent::ReasoningDelta { .. } => "reasoning-delta",
            StreamEvent::ReasoningEnd { .. } => "reasoning-end",
            StreamEvent::TextStart { .. } => "text-start",
            StreamEvent::TextDelta { .. } => "text-delta",
            StreamEvent::TextEnd { .. } => "text-end",
            StreamEvent::ToolInputAvailable { .. } => "tool-input-available",
            StreamEvent::Finish { .. } => "finish",
            StreamEvent::Error { .. } => "error",
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, StreamEvent::Finish { .. } | StreamEvent::Error { .. })
    }

    /// Serialize as the body of one SSE `data:` line.
    pub fn to_data(&self) -> String {
        // Every field is a string, enum or JSON value; serialization cannot fail.
        serde_json::to_string(self).unwrap_or_else(|_| {
            r#"{"type":"error","errorText":"event serialization failed"}"#.to_string()
        })
    }
}

/// Checks a sequence of events against the stream invariants.
///
/// Ids must be unique, deltas and ends must refer to an open part, there is
/// exactly one `start` first and exactly one terminal last, and no part may
/// still be open when the terminal arrives.
#[derive(Debug, Default)]
pub struct StreamValidator {
    started: bool,
    terminated: bool,
    seen: HashSet<String>,
    open: Vec<String>,
}

impl StreamValidator {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn is_terminated(&self) -> bool {
        self.terminated
    }

    /// Ids opened and not yet closed, oldest first.
    pub fn open_ids(&self) -> &[String] {
        &self.open
    }

    pub fn observe(&mut self, event: &StreamEvent) -> Result<(), ProtocolError> {
        if self.terminated {
            return Err(ProtocolError::AfterTerminal(event.kind().to_string()));
        }
        match event {
            StreamEvent::Start { .. } => {
                if self.started {
                    return Err(ProtocolError::DuplicateStart);
                }
                self.started = true;
                return Ok(());
            }
            _ if !self.started => return Err(ProtocolError::MissingStart),
            StreamEvent::TextStart { id } | StreamEvent::ReasoningStart { id } => {
                if !self.seen.insert(id.clone()) {
                    return Err(ProtocolError::DuplicateId(id.clone()));
                }
                self.open.push(id.clone());
            }
            StreamEvent::TextDelta { id, .. } | StreamEvent::ReasoningDelta { id, .. } => {
                if !self.open.contains(id) {
                    return Err(ProtocolError::UnopenedPart(id.clone()));
                }
            }
            StreamEvent::TextEnd { id } | StreamEvent::ReasoningEnd { id } => {
                let Some(pos) = self.open.iter().position(|o| o == id) else {
                    return Err(ProtocolError::UnopenedPart(id.clone()));
                };
                self.open.remove(pos);
            }
            StreamEvent::ToolInputAvailable { tool_call_id, .. } => {
                if !self.seen.insert(tool_call_id.clone()) {
                    return Err(ProtocolError::DuplicateId(tool_call_id.clone()));
                }
            }
            StreamEvent::Finish { .. } | StreamEvent::Error { .. } => {
                if let Some(id) = self.open.first() {
                    return Err(ProtocolError::UnclosedPart(id.clone()));
                }
                self.terminated = true;
            }
        }
        Ok(())
    }

    /// Validate a complete stream, including that it was terminated.
    pub fn validate(events: &[StreamEvent]) -> Result<(), ProtocolError> {
        let mut validator = Self::new();
        for event in events {
            validator.observe(event)?;
        }
        if !validator.started {
            return Err(ProtocolError::MissingStart);
        }
        if !validator.terminated {
            return match validator.open.first() {
                Some(id) => Err(ProtocolError::UnclosedPart(id.clone())),
                None => Err(ProtocolError::MissingTerminal),
            };
        }
        Ok(())
    }
}
