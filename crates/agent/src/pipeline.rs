//! The request pipeline.
//!
//! One request is one independent step of the agent loop:
//!
//! 1. **Receive** the client's full history
//! 2. **Intercept** a local command and answer it without a provider call
//! 3. **Normalize**: parse messages, assemble the system context, trim history
//! 4. **Stream** the active provider's answer through the encoder
//! 5. **Finish** with `tool-calls` when the turn requested tools, so the
//!    client runs them and resubmits the whole history
//!
//! Nothing is kept between requests except the runtime settings snapshot.

use std::sync::Arc;
use std::time::Duration;

use chatrelay_config::{AppConfig, BudgetConfig};
use chatrelay_core::error::{ProtocolError, ProviderError};
use chatrelay_core::event::StreamEvent;
use chatrelay_core::message::Message;
use chatrelay_core::provider::{Provider, ProviderFamily, ProviderRequest, ToolDefinition};
use chatrelay_providers::{ProviderMessages, ProviderRouter, to_provider_format};
use serde::Serialize;
use tokio::sync::mpsc;
use tracing::{Instrument, debug, error, info, info_span, warn};

use crate::command::{self, Command, CommandEnv, CommandReply};
use crate::context::{
    AssembledContext, AssemblyMetadata, ContextSource, FileContextSource, TrimStats, assemble_block, trim,
};
use crate::encoder::StreamEncoder;
use crate::inbound::ChatRequest;
use crate::settings::{RuntimeSettings, SettingsHandle};

/// Request-scoped phases, logged as the request moves through them.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RequestPhase {
    Received,
    Normalized,
    Streaming,
    Finished,
}

impl RequestPhase {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Received => "received",
            Self::Normalized => "normalized",
            Self::Streaming => "streaming",
            Self::Finished => "finished",
        }
    }
}

impl std::fmt::Display for RequestPhase {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Per-request identity, for log correlation.
#[derive(Debug, Clone)]
pub struct RequestContext {
    pub request_id: String,
}

impl Default for RequestContext {
    fn default() -> Self {
        Self {
            request_id: uuid::Uuid::new_v4().to_string(),
        }
    }
}

/// Snapshot of what the pipeline would use for the next request.
#[derive(Debug, Clone, Serialize)]
pub struct PipelineStatus {
    pub active_provider: String,
    pub family: Option<ProviderFamily>,
    pub model: Option<String>,
    pub providers: Vec<String>,
    pub active_skills: Vec<String>,
    pub budget: BudgetConfig,
    pub rate_limit_delay_ms: u64,
}

/// What a request would send upstream, without sending it.
#[derive(Debug, Clone, Serialize)]
pub struct ContextPreview {
    pub provider: String,
    pub family: ProviderFamily,
    pub system_text: String,
    pub assembly: AssemblyMetadata,
    pub trim: TrimStats,
    pub messages: Vec<Message>,
    pub tools: Vec<ToolDefinition>,
    pub provider_messages: ProviderMessages,
}

struct Prepared {
    request: ProviderRequest,
    assembled: AssembledContext,
    trim: TrimStats,
}

/// Shared, cheaply cloneable request handler.
#[derive(Clone)]
pub struct ChatPipeline {
    config: Arc<AppConfig>,
    providers: ProviderRouter,
    source: Arc<dyn ContextSource>,
    settings: SettingsHandle,
}

impl ChatPipeline {
    pub fn new(config: Arc<AppConfig>, providers: ProviderRouter, source: Arc<dyn ContextSource>) -> Self {
        let settings = SettingsHandle::new(RuntimeSettings::new(config.active_provider.clone()));
        Self {
            config,
            providers,
            source,
            settings,
        }
    }

    /// Build providers and a file context source from configuration.
    pub fn from_config(config: Arc<AppConfig>) -> Result<Self, ProviderError> {
        let providers = chatrelay_providers::build_from_config(&config)?;
        let source = Arc::new(FileContextSource::new(config.context_dir()));
        Ok(Self::new(config, providers, source))
    }

    pub fn config(&self) -> &AppConfig {
        &self.config
    }

    pub fn providers(&self) -> &ProviderRouter {
        &self.providers
    }

    pub fn settings(&self) -> &SettingsHandle {
        &self.settings
    }

    pub fn status(&self) -> PipelineStatus {
        let settings = self.settings.snapshot();
        let provider = self.providers.get(&settings.active_provider);
        PipelineStatus {
            family: provider.as_ref().map(|p| p.family()),
            model: provider.as_ref().map(|p| p.model().to_string()),
            active_provider: settings.active_provider,
            providers: self.providers.names(),
            active_skills: settings.active_skills.into_iter().collect(),
            budget: self.config.budget.clone(),
            rate_limit_delay_ms: self.config.rate_limit_delay_ms,
        }
    }

    /// Stream the answer to one chat request.
    ///
    /// The returned receiver yields a complete event stream ending in one
    /// terminal. Dropping it cancels the request and any upstream work.
    pub fn run(&self, request: ChatRequest, ctx: RequestContext) -> mpsc::Receiver<StreamEvent> {
        let (tx, rx) = mpsc::channel(64);
        let pipeline = self.clone();
        let span = info_span!("chat", request_id = %ctx.request_id);
        tokio::spawn(async move { pipeline.drive(request, tx).await }.instrument(span));
        rx
    }

    /// Assemble everything a request would send, for inspection.
    pub async fn preview(&self, request: &ChatRequest) -> Result<ContextPreview, ProviderError> {
        let settings = self.settings.snapshot();
        let provider = self.active_provider(&settings)?;
        let prepared = self
            .prepare(request.parsed_messages(), request.parsed_tools(), &settings)
            .await;
        let family = provider.family();

        Ok(ContextPreview {
            provider: settings.active_provider,
            family,
            provider_messages: to_provider_format(
                &prepared.request.system,
                &prepared.request.messages,
                family,
                &prepared.request.tools,
            ),
            system_text: prepared.assembled.system_text,
            assembly: prepared.assembled.metadata,
            trim: prepared.trim,
            messages: prepared.request.messages,
            tools: prepared.request.tools,
        })
    }

    // ── Request flow ────────────────────────────────────────────────────

    async fn drive(self, request: ChatRequest, tx: mpsc::Sender<StreamEvent>) {
        info!(phase = %RequestPhase::Received, messages = request.messages.len(), "Chat request");

        let conversation = request.conversation();
        if let Some(command) = command::intercept(&conversation) {
            self.answer_locally(&command, &tx).await;
            return;
        }

        let settings = self.settings.snapshot();
        let mut encoder = StreamEncoder::new();

        let provider = match self.active_provider(&settings) {
            Ok(p) => p,
            Err(e) => {
                warn!(error = %e, "No usable provider");
                send_all(&tx, encoder.fail(e.to_string())).await;
                return;
            }
        };

        let pending_tool_calls = conversation.unresolved_tool_calls().len();
        let prepared = self
            .prepare(conversation.into_messages(), request.parsed_tools(), &settings)
            .await;
        info!(
            phase = %RequestPhase::Normalized,
            provider = %settings.active_provider,
            family = %provider.family(),
            kept = prepared.trim.kept,
            dropped = prepared.trim.dropped,
            compacted = prepared.trim.compacted,
            system_chars = prepared.assembled.metadata.total_chars,
            truncated = prepared.assembled.metadata.any_truncated(),
            tools = prepared.request.tools.len(),
            pending_tool_calls,
            "Request normalized"
        );

        let started = encoder.start(None);
        if !forward(&tx, &mut encoder, started).await {
            return;
        }

        if self.config.rate_limit_delay_ms > 0 {
            let delay = Duration::from_millis(self.config.rate_limit_delay_ms);
            tokio::select! {
                _ = tx.closed() => return,
                _ = tokio::time::sleep(delay) => {}
            }
        }

        let opened = tokio::select! {
            _ = tx.closed() => {
                debug!("Client disconnected before the provider answered");
                return;
            }
            opened = provider.stream(prepared.request) => opened,
        };
        let mut events = match opened {
            Ok(rx) => rx,
            Err(e) => {
                self.provider_failed(&tx, &mut encoder, e).await;
                self.log_finished(&encoder);
                return;
            }
        };
        info!(phase = %RequestPhase::Streaming, "Provider stream open");

        loop {
            let next = tokio::select! {
                _ = tx.closed() => {
                    // Dropping `events` tells the adapter to stop
                    debug!("Client disconnected mid-stream");
                    return;
                }
                next = events.recv() => next,
            };

            match next {
                Some(Ok(event)) => {
                    let encoded = encoder.push(event);
                    if !forward(&tx, &mut encoder, encoded).await {
                        break;
                    }
                }
                Some(Err(e)) => {
                    self.provider_failed(&tx, &mut encoder, e).await;
                    break;
                }
                None => {
                    if !encoder.is_terminated() {
                        warn!("Provider stream ended without a finish");
                        send_all(&tx, encoder.fail("The provider stream ended unexpectedly")).await;
                    }
                    break;
                }
            }
        }

        self.log_finished(&encoder);
    }

    async fn answer_locally(&self, command: &Command, tx: &mpsc::Sender<StreamEvent>) {
        let reply = self.run_command(command).await;
        match StreamEncoder::local_response(reply.text, reply.metadata) {
            Ok(events) => {
                send_all(tx, events).await;
            }
            Err(e) => error!(error = %e, "Failed to encode local response"),
        }
        info!(
            phase = %RequestPhase::Finished,
            command = command.name(),
            "Answered locally"
        );
    }

    /// Run a local command against the current settings.
    pub async fn run_command(&self, command: &Command) -> CommandReply {
        let skills = self.source.load().await.user_context.skills;
        let status = self.status();
        command::execute(
            command,
            &CommandEnv {
                settings: &self.settings,
                providers: &self.providers,
                skills: &skills,
                status: &status,
            },
        )
    }

    async fn provider_failed(
        &self,
        tx: &mpsc::Sender<StreamEvent>,
        encoder: &mut StreamEncoder,
        err: ProviderError,
    ) {
        match err {
            ProviderError::RateLimited { retry_after_secs } => {
                warn!(retry_after_secs, "Provider rate limited the request");
                let notice = encoder.notice(rate_limit_notice(retry_after_secs));
                forward(tx, encoder, notice).await;
            }
            other => {
                warn!(error = %other, "Provider request failed");
                send_all(tx, encoder.fail(other.to_string())).await;
            }
        }
    }

    fn log_finished(&self, encoder: &StreamEncoder) {
        info!(
            phase = %RequestPhase::Finished,
            finish_reason = encoder.finish_reason().map(|r| r.as_str()).unwrap_or("error"),
            tool_calls = encoder.tool_call_count(),
            "Request finished"
        );
    }

    // ── Normalization ───────────────────────────────────────────────────

    fn active_provider(&self, settings: &RuntimeSettings) -> Result<Arc<dyn Provider>, ProviderError> {
        self.providers.get(&settings.active_provider).ok_or_else(|| {
            ProviderError::NotConfigured(format!(
                "provider '{}' is not available",
                settings.active_provider
            ))
        })
    }

    async fn prepare(
        &self,
        messages: Vec<Message>,
        tools: Vec<ToolDefinition>,
        settings: &RuntimeSettings,
    ) -> Prepared {
        let mut block = self.source.load().await;
        for skill in &mut block.user_context.skills {
            skill.pinned = settings.active_skills.contains(&skill.id);
        }

        let budget = &self.config.budget;
        let assembled = assemble_block(&block, budget);

        let messages: Vec<Message> = messages.into_iter().filter(|m| !m.local).collect();
        let (messages, trim) = trim(&messages, budget.max_history_messages, budget.tool_rounds_kept_in_full);

        let tools = if tools.is_empty() { block.default_tools } else { tools };

        Prepared {
            request: ProviderRequest {
                model: String::new(),
                system: assembled.system_text.clone(),
                messages,
                tools,
                max_tokens: None,
                temperature: None,
            },
            assembled,
            trim,
        }
    }
}

fn rate_limit_notice(retry_after_secs: u64) -> String {
    format!(
        "The model provider is receiving too many requests right now. \
         Please wait about {retry_after_secs} seconds and send your message again."
    )
}

/// Send events in order; false once the client is gone.
async fn send_all(tx: &mpsc::Sender<StreamEvent>, events: Vec<StreamEvent>) -> bool {
    for event in events {
        if tx.send(event).await.is_err() {
            return false;
        }
    }
    true
}

/// Send encoder output; false when the stream is over for any reason.
///
/// An encoder invariant violation ends this stream with an `error` event.
async fn forward(
    tx: &mpsc::Sender<StreamEvent>,
    encoder: &mut StreamEncoder,
    encoded: Result<Vec<StreamEvent>, ProtocolError>,
) -> bool {
    let events = match encoded {
        Ok(events) => events,
        Err(e) => {
            error!(error = %e, "Stream invariant violated, ending stream");
            send_all(tx, encoder.fail(format!("Internal stream error: {e}"))).await;
            return false;
        }
    };
    send_all(tx, events).await && !encoder.is_terminated()
}
