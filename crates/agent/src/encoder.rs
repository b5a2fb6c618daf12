//! Provider events to wire events.
//!
//! [`StreamEncoder`] is a per-stream state machine. It opens text and
//! reasoning parts lazily on the first delta, closes the open part when the
//! kind changes, before a tool call and before the terminal, and emits
//! exactly one terminal. Every event it produces is checked against
//! [`StreamValidator`], so an invariant violation surfaces as a
//! [`ProtocolError`] for this stream only.

use chatrelay_core::error::ProtocolError;
use chatrelay_core::event::{StreamEvent, StreamValidator};
use chatrelay_core::provider::{FinishReason, ProviderEvent};
use serde_json::Value;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum PartKind {
    Text,
    Reasoning,
}

#[derive(Debug)]
pub struct StreamEncoder {
    message_id: String,
    open: Option<(PartKind, String)>,
    next_text: usize,
    next_reasoning: usize,
    tool_calls: usize,
    finish_reason: Option<FinishReason>,
    validator: StreamValidator,
}

impl Default for StreamEncoder {
    fn default() -> Self {
        Self::new()
    }
}

impl StreamEncoder {
    pub fn new() -> Self {
        Self::with_message_id(format!("msg-{}", uuid::Uuid::new_v4()))
    }

    pub fn with_message_id(message_id: impl Into<String>) -> Self {
        Self {
            message_id: message_id.into(),
            open: None,
            next_text: 0,
            next_reasoning: 0,
            tool_calls: 0,
            finish_reason: None,
            validator: StreamValidator::new(),
        }
    }

    pub fn message_id(&self) -> &str {
        &self.message_id
    }

    pub fn is_terminated(&self) -> bool {
        self.validator.is_terminated()
    }

    /// Tool calls emitted so far.
    pub fn tool_call_count(&self) -> usize {
        self.tool_calls
    }

    /// The finish reason sent, if the stream finished normally.
    pub fn finish_reason(&self) -> Option<FinishReason> {
        self.finish_reason
    }

    /// The opening `start` event.
    pub fn start(&mut self, metadata: Option<Value>) -> Result<Vec<StreamEvent>, ProtocolError> {
        let mut out = Vec::with_capacity(1);
        self.emit(
            &mut out,
            StreamEvent::Start {
                message_id: self.message_id.clone(),
                message_metadata: metadata,
            },
        )?;
        Ok(out)
    }

    /// Encode one provider event.
    pub fn push(&mut self, event: ProviderEvent) -> Result<Vec<StreamEvent>, ProtocolError> {
        let mut out = Vec::new();
        match event {
            ProviderEvent::TextDelta(delta) => self.delta(&mut out, PartKind::Text, delta)?,
            ProviderEvent::ReasoningDelta(delta) => self.delta(&mut out, PartKind::Reasoning, delta)?,
            ProviderEvent::ToolCall { id, name, arguments } => {
                self.close_open(&mut out)?;
                self.emit(
                    &mut out,
                    StreamEvent::ToolInputAvailable {
                        tool_call_id: id,
                        tool_name: name,
                        input: arguments,
                    },
                )?;
                self.tool_calls += 1;
            }
            ProviderEvent::Finish(reason) => self.finish(&mut out, reason)?,
        }
        Ok(out)
    }

    /// Close any open part and end with an `error` event.
    ///
    /// Safe to call in any state; after the terminal it emits nothing.
    pub fn fail(&mut self, message: impl Into<String>) -> Vec<StreamEvent> {
        let mut out = Vec::new();
        if self.is_terminated() {
            return out;
        }
        // A failure before start still needs a well-formed stream
        let _ = self.emit_unchecked_start(&mut out);
        let _ = self.close_open(&mut out);
        let event = StreamEvent::Error {
            error_text: message.into(),
        };
        if self.validator.observe(&event).is_ok() {
            out.push(event);
        }
        out
    }

    /// A friendly text part then `finish stop`.
    pub fn notice(&mut self, text: impl Into<String>) -> Result<Vec<StreamEvent>, ProtocolError> {
        let mut out = Vec::new();
        self.emit_unchecked_start(&mut out)?;
        self.delta(&mut out, PartKind::Text, text.into())?;
        self.finish(&mut out, FinishReason::Stop)?;
        Ok(out)
    }

    /// A whole locally produced response: start, one text part, finish.
    pub fn local_response(
        text: impl Into<String>,
        metadata: Value,
    ) -> Result<Vec<StreamEvent>, ProtocolError> {
        let mut encoder = Self::new();
        let mut out = encoder.start(Some(metadata))?;
        out.extend(encoder.notice(text)?);
        Ok(out)
    }

    // ── internals ─────────────────────────────────────────────────────────

    fn emit(&mut self, out: &mut Vec<StreamEvent>, event: StreamEvent) -> Result<(), ProtocolError> {
        self.validator.observe(&event)?;
        out.push(event);
        Ok(())
    }

    fn emit_unchecked_start(&mut self, out: &mut Vec<StreamEvent>) -> Result<(), ProtocolError> {
        match self.start(None) {
            Ok(events) => {
                out.extend(events);
                Ok(())
            }
            // Already started
            Err(ProtocolError::DuplicateStart) => Ok(()),
            Err(e) => Err(e),
        }
    }

    fn delta(&mut self, out: &mut Vec<StreamEvent>, kind: PartKind, delta: String) -> Result<(), ProtocolError> {
        if delta.is_empty() {
            return Ok(());
        }
        let id = match &self.open {
            Some((open_kind, id)) if *open_kind == kind => id.clone(),
            _ => {
                self.close_open(out)?;
                let id = self.next_id(kind);
                let start = match kind {
                    PartKind::Text => StreamEvent::TextStart { id: id.clone() },
                    PartKind::Reasoning => StreamEvent::ReasoningStart { id: id.clone() },
                };
                self.emit(out, start)?;
                self.open = Some((kind, id.clone()));
                id
            }
        };
        let event = match kind {
            PartKind::Text => StreamEvent::TextDelta { id, delta },
            PartKind::Reasoning => StreamEvent::ReasoningDelta { id, delta },
        };
        self.emit(out, event)
    }

    fn close_open(&mut self, out: &mut Vec<StreamEvent>) -> Result<(), ProtocolError> {
        let Some((kind, id)) = self.open.take() else {
            return Ok(());
        };
        let end = match kind {
            PartKind::Text => StreamEvent::TextEnd { id },
            PartKind::Reasoning => StreamEvent::ReasoningEnd { id },
        };
        self.emit(out, end)
    }

    fn finish(&mut self, out: &mut Vec<StreamEvent>, reported: FinishReason) -> Result<(), ProtocolError> {
        self.close_open(out)?;
        let reason = resolve_finish(reported, self.tool_calls);
        self.emit(out, StreamEvent::Finish { finish_reason: reason })?;
        self.finish_reason = Some(reason);
        Ok(())
    }

    fn next_id(&mut self, kind: PartKind) -> String {
        match kind {
            PartKind::Text => {
                self.next_text += 1;
                format!("txt-{}", self.next_text)
            }
            PartKind::Reasoning => {
                self.next_reasoning += 1;
                format!("rsn-{}", self.next_reasoning)
            }
        }
    }
}

/// `tool-calls` exactly when this turn emitted tool calls; the client
/// resubmits on it, so an upstream claim without calls becomes `stop`.
pub fn resolve_finish(reported: FinishReason, tool_calls: usize) -> FinishReason {
    match (tool_calls, reported) {
        (n, _) if n > 0 => FinishReason::ToolCalls,
        (_, FinishReason::ToolCalls) => FinishReason::Stop,
        (_, other) => other,
    }
}
