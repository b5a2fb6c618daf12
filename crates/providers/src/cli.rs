//! CLI-subprocess family adapter.
//!
//! Runs a local executable once per request: the whole conversation and the
//! tool list are rendered into one prompt on stdin, and the reply on stdout
//! is parsed for a JSON object carrying text and tool calls. There is no
//! incremental output, so the adapter emits any tool calls, then the text as
//! a single delta, then `Finish`.
//!
//! The child is killed on timeout and whenever the event receiver is dropped.

use std::path::PathBuf;
use std::process::Stdio;
use std::time::Duration;

use async_trait::async_trait;
use chatrelay_config::ProviderConfig;
use chatrelay_core::error::ProviderError;
use chatrelay_core::message::{Message, Part, Role};
use chatrelay_core::provider::*;
use serde_json::Value;
use tokio::io::AsyncWriteExt;
use tokio::process::Command;
use tracing::{debug, warn};

use crate::extract::interpret_reply;
use crate::tool_args::new_call_id;

/// Largest stderr excerpt carried in an error.
const STDERR_EXCERPT: usize = 2000;

pub struct CliProvider {
    name: String,
    executable: PathBuf,
    args: Vec<String>,
    model: String,
    timeout: Duration,
}

impl CliProvider {
    pub fn from_config(name: &str, config: &ProviderConfig) -> Result<Self, ProviderError> {
        let executable = config.executable_path.clone().ok_or_else(|| {
            ProviderError::NotConfigured(format!("{name}: executable_path is required"))
        })?;

        Ok(Self {
            name: name.to_string(),
            executable,
            args: config.args.clone(),
            model: config.model_or_default(),
            timeout: Duration::from_secs(config.timeout_secs),
        })
    }

    /// Arguments with `{model}` substituted.
    fn resolved_args(&self, model: &str) -> Vec<String> {
        self.args.iter().map(|a| a.replace("{model}", model)).collect()
    }
}

#[async_trait]
impl Provider for CliProvider {
    fn name(&self) -> &str {
        &self.name
    }

    fn family(&self) -> ProviderFamily {
        ProviderFamily::CliSubprocess
    }

    fn model(&self) -> &str {
        &self.model
    }

    async fn stream(&self, request: ProviderRequest) -> Result<EventReceiver, ProviderError> {
        let model = if request.model.is_empty() {
            self.model.clone()
        } else {
            request.model.clone()
        };
        let prompt = render_prompt(&request.system, &request.messages, &request.tools);

        debug!(
            provider = %self.name,
            executable = %self.executable.display(),
            prompt_chars = prompt.len(),
            "Spawning CLI provider"
        );

        let mut child = Command::new(&self.executable)
            .args(self.resolved_args(&model))
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .spawn()
            .map_err(|e| {
                ProviderError::NotConfigured(format!(
                    "failed to start {}: {e}",
                    self.executable.display()
                ))
            })?;

        // Feed stdin from its own task so a child that writes before reading
        // cannot deadlock against us.
        if let Some(mut stdin) = child.stdin.take() {
            tokio::spawn(async move {
                if let Err(e) = stdin.write_all(prompt.as_bytes()).await {
                    debug!(error = %e, "CLI provider closed stdin early");
                }
            });
        }

        let (tx, rx) = tokio::sync::mpsc::channel(16);
        let provider_name = self.name.clone();
        let timeout = self.timeout;

        tokio::spawn(async move {
            let output = tokio::select! {
                _ = tx.closed() => {
                    // Dropping the wait future drops the child, which kills it
                    debug!(provider = %provider_name, "Client went away, killing CLI provider");
                    return;
                }
                result = tokio::time::timeout(timeout, child.wait_with_output()) => result,
            };

            let output = match output {
                Err(_) => {
                    warn!(provider = %provider_name, timeout_secs = timeout.as_secs(), "CLI provider timed out");
                    let _ = tx
                        .send(Err(ProviderError::Timeout(format!(
                            "{provider_name} did not answer within {}s",
                            timeout.as_secs()
                        ))))
                        .await;
                    return;
                }
                Ok(Err(e)) => {
                    let _ = tx
                        .send(Err(ProviderError::StreamInterrupted(e.to_string())))
                        .await;
                    return;
                }
                Ok(Ok(output)) => output,
            };

            if !output.status.success() {
                let stderr = String::from_utf8_lossy(&output.stderr);
                let stderr = tail(stderr.trim(), STDERR_EXCERPT);
                warn!(provider = %provider_name, code = ?output.status.code(), "CLI provider failed");
                let _ = tx
                    .send(Err(ProviderError::SubprocessFailed {
                        code: output.status.code(),
                        stderr,
                    }))
                    .await;
                return;
            }

            let stdout = String::from_utf8_lossy(&output.stdout);
            for event in reply_events(&stdout) {
                if tx.send(Ok(event)).await.is_err() {
                    return;
                }
            }
        });

        Ok(rx)
    }
}

/// Events for one complete reply: tool calls, the text, then `Finish`.
pub(crate) fn reply_events(reply: &str) -> Vec<ProviderEvent> {
    let structured = interpret_reply(reply);
    let has_calls = !structured.tool_calls.is_empty();

    let mut events: Vec<ProviderEvent> = structured
        .tool_calls
        .into_iter()
        .map(|(name, arguments)| ProviderEvent::ToolCall {
            id: new_call_id(),
            name,
            arguments,
        })
        .collect();

    if !structured.text.is_empty() {
        events.push(ProviderEvent::TextDelta(structured.text));
    }

    events.push(ProviderEvent::Finish(if has_calls {
        FinishReason::ToolCalls
    } else {
        FinishReason::Stop
    }));
    events
}

fn tail(s: &str, max: usize) -> String {
    if s.len() <= max {
        return s.to_string();
    }
    let mut start = s.len() - max;
    while !s.is_char_boundary(start) {
        start += 1;
    }
    format!("…{}", &s[start..])
}

// ── Prompt rendering ────────────────────────────────────────────────────

const TRANSCRIPT_OPEN: &str = "<transcript>";
const TRANSCRIPT_CLOSE: &str = "</transcript>";
const SYSTEM_OPEN: &str = "<system>";
const SYSTEM_CLOSE: &str = "</system>";

const REPLY_FORMAT: &str = r#"<reply-format>
Answer the last user message. Reply with one JSON object and nothing else:
{"response": "<text shown to the user>", "tool_calls": [{"name": "<tool name>", "arguments": {}}]}
Use an empty "tool_calls" list when no tool is needed. Only call tools listed above.
</reply-format>"#;

/// Render system text, tools and conversation into one prompt.
pub fn render_prompt(system: &str, messages: &[Message], tools: &[ToolDefinition]) -> String {
    let mut out = String::new();

    if !system.is_empty() {
        out.push_str(SYSTEM_OPEN);
        out.push('\n');
        out.push_str(system);
        out.push('\n');
        out.push_str(SYSTEM_CLOSE);
        out.push_str("\n\n");
    }

    if !tools.is_empty() {
        out.push_str("<tools>\n");
        for tool in tools {
            out.push_str(&format!("- {}: {}\n", tool.name, tool.description));
            out.push_str(&format!("  parameters: {}\n", tool.parameters));
        }
        out.push_str("</tools>\n\n");
    }

    out.push_str(TRANSCRIPT_OPEN);
    out.push('\n');
    out.push_str(&render_transcript(messages));
    out.push_str(TRANSCRIPT_CLOSE);
    out.push_str("\n\n");
    out.push_str(REPLY_FORMAT);
    out.push('\n');
    out
}

/// Line-oriented transcript that [`parse_transcript`] reverses.
///
/// Each message opens with `### <role>`. Text lines that could be mistaken
/// for markup are escaped with a leading backslash. Reasoning is omitted.
pub fn render_transcript(messages: &[Message]) -> String {
    let mut out = String::new();

    for msg in messages {
        out.push_str("### ");
        out.push_str(msg.role.as_str());
        out.push('\n');

        let text = msg.text();
        if !text.is_empty() {
            for line in text.split('\n') {
                if needs_escape(line) {
                    out.push('\\');
                }
                out.push_str(line);
                out.push('\n');
            }
        }
        for (id, name, arguments) in msg.tool_calls() {
            out.push_str(&format!("[tool-call id={id} name={name}] {arguments}\n"));
        }
        for (call_id, payload) in msg.tool_results() {
            out.push_str(&format!("[tool-result id={call_id}] {payload}\n"));
        }
    }

    out
}

fn needs_escape(line: &str) -> bool {
    line.starts_with("### ")
        || line.starts_with("[tool-")
        || line.starts_with('\\')
        || line.starts_with(TRANSCRIPT_CLOSE)
}

/// Parse a transcript produced by [`render_transcript`].
pub fn parse_transcript(transcript: &str) -> Vec<Message> {
    let mut out = Vec::new();
    let mut current: Option<(Role, Vec<String>, Vec<Part>)> = None;

    for line in transcript.lines() {
        if let Some(role) = line.strip_prefix("### ").and_then(Role::parse) {
            flush(&mut out, current.take());
            current = Some((role, Vec::new(), Vec::new()));
            continue;
        }
        let Some((_, text, parts)) = current.as_mut() else {
            continue;
        };

        if let Some(rest) = line.strip_prefix("[tool-call ") {
            if let Some(part) = parse_call_line(rest) {
                parts.push(part);
                continue;
            }
        }
        if let Some(rest) = line.strip_prefix("[tool-result ") {
            if let Some(part) = parse_result_line(rest) {
                parts.push(part);
                continue;
            }
        }
        text.push(line.strip_prefix('\\').unwrap_or(line).to_string());
    }
    flush(&mut out, current);

    out
}

fn flush(out: &mut Vec<Message>, current: Option<(Role, Vec<String>, Vec<Part>)>) {
    let Some((role, text, tool_parts)) = current else {
        return;
    };
    let mut parts = Vec::with_capacity(tool_parts.len() + 1);
    if !text.is_empty() {
        parts.push(Part::text(text.join("\n")));
    }
    parts.extend(tool_parts);
    out.push(Message::new(role, parts));
}

/// `id=<id> name=<name>] <json>`
fn parse_call_line(rest: &str) -> Option<Part> {
    let rest = rest.strip_prefix("id=")?;
    let (id, rest) = rest.split_once(" name=")?;
    let (name, json) = rest.split_once("] ")?;
    let arguments: Value = serde_json::from_str(json).ok()?;
    Some(Part::tool_call(id, name, arguments))
}

/// `id=<id>] <json>`
fn parse_result_line(rest: &str) -> Option<Part> {
    let rest = rest.strip_prefix("id=")?;
    let (id, json) = rest.split_once("] ")?;
    let payload: Value = serde_json::from_str(json).ok()?;
    Some(Part::tool_result(id, payload))
}

/// Recover the system text and conversation from a rendered prompt.
pub fn parse_prompt(prompt: &str) -> Vec<Message> {
    let mut out = Vec::new();

    if let Some(start) = prompt.find(&format!("{SYSTEM_OPEN}\n")) {
        let body = &prompt[start + SYSTEM_OPEN.len() + 1..];
        if let Some(end) = body.find(&format!("\n{SYSTEM_CLOSE}")) {
            out.push(Message::system(&body[..end]));
        }
    }

    if let Some(start) = prompt.find(&format!("{TRANSCRIPT_OPEN}\n")) {
        let body = &prompt[start + TRANSCRIPT_OPEN.len() + 1..];
        let end = body.rfind(TRANSCRIPT_CLOSE).unwrap_or(body.len());
        out.extend(parse_transcript(&body[..end]));
    }

    out
}
