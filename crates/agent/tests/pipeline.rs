//! End-to-end pipeline behavior against a scripted provider.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use chatrelay_agent::{ChatPipeline, ChatRequest, RequestContext, StaticContextSource};
use chatrelay_config::{AppConfig, BudgetConfig, ProviderConfig};
use chatrelay_core::{
    ContextBlock, EventReceiver, FinishReason, Provider, ProviderError, ProviderEvent,
    ProviderFamily, ProviderRequest, SkillExcerpt, StreamEvent, StreamValidator, UserContext,
};
use chatrelay_providers::ProviderRouter;
use serde_json::{Value, json};
use tokio::sync::Notify;

/// Replays a fixed script and records what it was asked.
struct ScriptedProvider {
    name: String,
    open_error: Option<ProviderError>,
    events: Vec<Result<ProviderEvent, ProviderError>>,
    calls: AtomicUsize,
    last_request: Mutex<Option<ProviderRequest>>,
}

impl ScriptedProvider {
    fn new(events: Vec<Result<ProviderEvent, ProviderError>>) -> Arc<Self> {
        Arc::new(Self {
            name: "scripted".into(),
            open_error: None,
            events,
            calls: AtomicUsize::new(0),
            last_request: Mutex::new(None),
        })
    }

    fn failing(error: ProviderError) -> Arc<Self> {
        Arc::new(Self {
            name: "scripted".into(),
            open_error: Some(error),
            events: Vec::new(),
            calls: AtomicUsize::new(0),
            last_request: Mutex::new(None),
        })
    }

    fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }

    fn last_request(&self) -> ProviderRequest {
        self.last_request.lock().unwrap().clone().expect("provider was not called")
    }
}

#[async_trait::async_trait]
impl Provider for ScriptedProvider {
    fn name(&self) -> &str {
        &self.name
    }

    fn family(&self) -> ProviderFamily {
        ProviderFamily::ChatCompletions
    }

    fn model(&self) -> &str {
        "scripted-model"
    }

    async fn stream(&self, request: ProviderRequest) -> Result<EventReceiver, ProviderError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        *self.last_request.lock().unwrap() = Some(request);
        if let Some(e) = &self.open_error {
            return Err(e.clone());
        }
        let (tx, rx) = tokio::sync::mpsc::channel(16);
        let events = self.events.clone();
        tokio::spawn(async move {
            for ev in events {
                if tx.send(ev).await.is_err() {
                    return;
                }
            }
        });
        Ok(rx)
    }
}

/// Never finishes on its own; signals once the pipeline lets go of it.
struct StallingProvider {
    before_open: bool,
    released: Arc<Notify>,
}

impl StallingProvider {
    fn new(before_open: bool) -> Arc<Self> {
        Arc::new(Self {
            before_open,
            released: Arc::new(Notify::new()),
        })
    }
}

struct NotifyOnDrop(Arc<Notify>);

impl Drop for NotifyOnDrop {
    fn drop(&mut self) {
        self.0.notify_one();
    }
}

#[async_trait::async_trait]
impl Provider for StallingProvider {
    fn name(&self) -> &str {
        "stalling"
    }

    fn family(&self) -> ProviderFamily {
        ProviderFamily::ChatCompletions
    }

    fn model(&self) -> &str {
        "stalling-model"
    }

    async fn stream(&self, _request: ProviderRequest) -> Result<EventReceiver, ProviderError> {
        if self.before_open {
            let _guard = NotifyOnDrop(self.released.clone());
            return std::future::pending().await;
        }
        let (tx, rx) = tokio::sync::mpsc::channel(16);
        let released = self.released.clone();
        tokio::spawn(async move {
            let _ = tx.send(Ok(ProviderEvent::TextDelta("partial".into()))).await;
            tx.closed().await;
            released.notify_one();
        });
        Ok(rx)
    }
}

fn context() -> ContextBlock {
    ContextBlock {
        base_instructions: "You edit shader graphs.".into(),
        environment_summary: "Scene has 3 nodes.".into(),
        user_context: UserContext {
            rules: vec!["Never delete nodes".into()],
            skills: vec![SkillExcerpt::new("noise", "Noise", "layered noise", "Use fbm with 5 octaves.")],
            ..UserContext::default()
        },
        default_tools: Vec::new(),
    }
}

fn pipeline_with(provider: Arc<dyn Provider>, budget: BudgetConfig) -> ChatPipeline {
    let mut config = AppConfig::default();
    config.active_provider = "main".into();
    config.providers.clear();
    config
        .providers
        .insert("main".into(), ProviderConfig::new(ProviderFamily::ChatCompletions));
    config
        .providers
        .insert("backup".into(), ProviderConfig::new(ProviderFamily::ChatCompletions));
    config.budget = budget;

    let mut router = ProviderRouter::new();
    router.register("main", provider);
    router.register("backup", ScriptedProvider::new(vec![]));

    ChatPipeline::new(Arc::new(config), router, Arc::new(StaticContextSource::new(context())))
}

fn pipeline(provider: Arc<ScriptedProvider>) -> ChatPipeline {
    pipeline_with(provider, BudgetConfig::default())
}

async fn collect(pipeline: &ChatPipeline, messages: Vec<Value>) -> Vec<StreamEvent> {
    let mut rx = pipeline.run(ChatRequest::new(messages), RequestContext::default());
    let mut out = Vec::new();
    while let Some(ev) = rx.recv().await {
        out.push(ev);
    }
    out
}

fn text_of(events: &[StreamEvent]) -> String {
    events
        .iter()
        .filter_map(|e| match e {
            StreamEvent::TextDelta { delta, .. } => Some(delta.as_str()),
            _ => None,
        })
        .collect()
}

fn finish_of(events: &[StreamEvent]) -> Option<FinishReason> {
    events.iter().find_map(|e| match e {
        StreamEvent::Finish { finish_reason } => Some(*finish_reason),
        _ => None,
    })
}

#[tokio::test]
async fn text_answer_streams_and_stops() {
    let provider = ScriptedProvider::new(vec![
        Ok(ProviderEvent::ReasoningDelta("thinking".into())),
        Ok(ProviderEvent::TextDelta("Hello".into())),
        Ok(ProviderEvent::TextDelta(" there".into())),
        Ok(ProviderEvent::Finish(FinishReason::Stop)),
    ]);
    let p = pipeline(provider.clone());
    let events = collect(&p, vec![json!({"role": "user", "content": "hi"})]).await;

    StreamValidator::validate(&events).unwrap();
    assert_eq!(text_of(&events), "Hello there");
    assert_eq!(finish_of(&events), Some(FinishReason::Stop));
    assert_eq!(provider.calls(), 1);

    let request = provider.last_request();
    assert!(request.system.starts_with("You edit shader graphs."));
    assert!(request.system.contains("Scene has 3 nodes."));
    assert!(request.system.contains("Never delete nodes"));
}

#[tokio::test]
async fn tool_call_turn_finishes_with_tool_calls() {
    let provider = ScriptedProvider::new(vec![
        Ok(ProviderEvent::TextDelta("Adding a node.".into())),
        Ok(ProviderEvent::ToolCall {
            id: "call_1".into(),
            name: "add_node".into(),
            arguments: json!({"kind": "noise"}),
        }),
        // Upstream said stop; the emitted call decides
        Ok(ProviderEvent::Finish(FinishReason::Stop)),
    ]);
    let p = pipeline(provider);
    let events = collect(&p, vec![json!({"role": "user", "content": "add noise"})]).await;

    StreamValidator::validate(&events).unwrap();
    assert!(events.iter().any(|e| matches!(
        e,
        StreamEvent::ToolInputAvailable { tool_name, .. } if tool_name == "add_node"
    )));
    assert_eq!(finish_of(&events), Some(FinishReason::ToolCalls));
}

#[tokio::test]
async fn resubmitted_history_with_results_reaches_provider() {
    let provider = ScriptedProvider::new(vec![
        Ok(ProviderEvent::TextDelta("Done, node 7 added.".into())),
        Ok(ProviderEvent::Finish(FinishReason::Stop)),
    ]);
    let p = pipeline(provider.clone());
    let events = collect(
        &p,
        vec![
            json!({"role": "user", "content": "add noise"}),
            json!({"role": "assistant", "parts": [
                {"type": "tool-add_node", "toolCallId": "call_1", "state": "output-available",
                 "input": {"kind": "noise"}, "output": {"id": 7}}
            ]}),
        ],
    )
    .await;

    assert_eq!(finish_of(&events), Some(FinishReason::Stop));
    let request = provider.last_request();
    assert_eq!(request.messages.len(), 3);
    let results: Vec<_> = request.messages[2].tool_results().collect();
    assert_eq!(results, vec![("call_1", &json!({"id": 7}))]);
}

#[tokio::test]
async fn history_is_trimmed_to_budget() {
    let provider = ScriptedProvider::new(vec![Ok(ProviderEvent::Finish(FinishReason::Stop))]);
    let p = pipeline(provider.clone());
    let messages: Vec<Value> = (0..30)
        .map(|i| {
            let role = if i % 2 == 0 { "user" } else { "assistant" };
            json!({"role": role, "content": format!("m{i}")})
        })
        .chain(std::iter::once(json!({"role": "user", "content": "latest"})))
        .collect();
    collect(&p, messages).await;

    let request = provider.last_request();
    assert_eq!(request.messages.len(), 24);
    assert_eq!(request.messages.last().unwrap().text(), "latest");
}

#[tokio::test]
async fn local_command_makes_no_provider_call() {
    let provider = ScriptedProvider::new(vec![]);
    let p = pipeline(provider.clone());
    let events = collect(&p, vec![json!({"role": "user", "content": "/status"})]).await;

    assert_eq!(provider.calls(), 0);
    StreamValidator::validate(&events).unwrap();
    match &events[0] {
        StreamEvent::Start { message_metadata, .. } => {
            let meta = message_metadata.as_ref().unwrap();
            assert_eq!(meta["local"], true);
            assert_eq!(meta["command"], "status");
        }
        other => panic!("unexpected first event {other:?}"),
    }
    assert!(text_of(&events).contains("Provider: main"));
    assert_eq!(finish_of(&events), Some(FinishReason::Stop));
}

#[tokio::test]
async fn provider_switch_applies_to_next_request() {
    let provider = ScriptedProvider::new(vec![Ok(ProviderEvent::Finish(FinishReason::Stop))]);
    let p = pipeline(provider.clone());

    let events = collect(&p, vec![json!({"role": "user", "content": "/provider backup"})]).await;
    assert!(text_of(&events).contains("Switched to provider `backup`"));
    assert_eq!(p.status().active_provider, "backup");

    collect(&p, vec![json!({"role": "user", "content": "hello"})]).await;
    // "main" was not asked
    assert_eq!(provider.calls(), 0);
}

#[tokio::test]
async fn unknown_command_falls_through_to_provider() {
    let provider = ScriptedProvider::new(vec![
        Ok(ProviderEvent::TextDelta("ok".into())),
        Ok(ProviderEvent::Finish(FinishReason::Stop)),
    ]);
    let p = pipeline(provider.clone());
    collect(&p, vec![json!({"role": "user", "content": "/frobnicate now"})]).await;
    assert_eq!(provider.calls(), 1);
    assert_eq!(provider.last_request().messages[0].text(), "/frobnicate now");
}

#[tokio::test]
async fn activated_skill_is_pinned_in_system_text() {
    let provider = ScriptedProvider::new(vec![Ok(ProviderEvent::Finish(FinishReason::Stop))]);
    let budget = BudgetConfig {
        skill_full_text_threshold: 1,
        ..BudgetConfig::default()
    };
    let p = pipeline_with(provider.clone(), budget);

    collect(&p, vec![json!({"role": "user", "content": "hi"})]).await;
    assert!(!provider.last_request().system.contains("Use fbm with 5 octaves."));

    collect(&p, vec![json!({"role": "user", "content": "/skill noise"})]).await;
    collect(&p, vec![json!({"role": "user", "content": "hi again"})]).await;
    assert!(provider.last_request().system.contains("Use fbm with 5 octaves."));
}

#[tokio::test]
async fn rate_limit_becomes_friendly_stop() {
    let provider = ScriptedProvider::failing(ProviderError::RateLimited { retry_after_secs: 7 });
    let p = pipeline(provider);
    let events = collect(&p, vec![json!({"role": "user", "content": "hi"})]).await;

    StreamValidator::validate(&events).unwrap();
    assert!(text_of(&events).contains("7 seconds"));
    assert_eq!(finish_of(&events), Some(FinishReason::Stop));
    assert!(!events.iter().any(|e| matches!(e, StreamEvent::Error { .. })));
}

#[tokio::test]
async fn mid_stream_failure_closes_parts_and_errors() {
    let provider = ScriptedProvider::new(vec![
        Ok(ProviderEvent::TextDelta("partial".into())),
        Err(ProviderError::StreamInterrupted("connection reset".into())),
    ]);
    let p = pipeline(provider);
    let events = collect(&p, vec![json!({"role": "user", "content": "hi"})]).await;

    StreamValidator::validate(&events).unwrap();
    assert_eq!(finish_of(&events), None);
    match events.last() {
        Some(StreamEvent::Error { error_text }) => assert!(error_text.contains("connection reset")),
        other => panic!("unexpected last event {other:?}"),
    }
}

#[tokio::test]
async fn auth_failure_is_error_event() {
    let provider = ScriptedProvider::failing(ProviderError::AuthenticationFailed("bad key".into()));
    let p = pipeline(provider);
    let events = collect(&p, vec![json!({"role": "user", "content": "hi"})]).await;
    StreamValidator::validate(&events).unwrap();
    assert!(matches!(events.last(), Some(StreamEvent::Error { .. })));
}

#[tokio::test]
async fn stream_without_finish_ends_in_error() {
    let provider = ScriptedProvider::new(vec![Ok(ProviderEvent::TextDelta("cut".into()))]);
    let p = pipeline(provider);
    let events = collect(&p, vec![json!({"role": "user", "content": "hi"})]).await;
    StreamValidator::validate(&events).unwrap();
    assert!(matches!(events.last(), Some(StreamEvent::Error { .. })));
}

#[tokio::test]
async fn duplicate_tool_call_ids_end_only_that_stream() {
    let call = || {
        Ok(ProviderEvent::ToolCall {
            id: "same".into(),
            name: "t".into(),
            arguments: json!({}),
        })
    };
    let provider = ScriptedProvider::new(vec![call(), call(), Ok(ProviderEvent::Finish(FinishReason::Stop))]);
    let p = pipeline(provider);
    let events = collect(&p, vec![json!({"role": "user", "content": "hi"})]).await;
    StreamValidator::validate(&events).unwrap();
    assert!(matches!(events.last(), Some(StreamEvent::Error { .. })));

    // The pipeline still serves the next request
    let events = collect(&p, vec![json!({"role": "user", "content": "/help"})]).await;
    StreamValidator::validate(&events).unwrap();
}

#[tokio::test(start_paused = true)]
async fn rate_limit_delay_precedes_provider_call() {
    let provider = ScriptedProvider::new(vec![Ok(ProviderEvent::Finish(FinishReason::Stop))]);
    let mut config = AppConfig::default();
    config.active_provider = "main".into();
    config.rate_limit_delay_ms = 5_000;
    let mut router = ProviderRouter::new();
    router.register("main", provider.clone());
    let p = ChatPipeline::new(Arc::new(config), router, Arc::new(StaticContextSource::new(context())));

    let mut rx = p.run(
        ChatRequest::new(vec![json!({"role": "user", "content": "hi"})]),
        RequestContext::default(),
    );
    assert!(matches!(rx.recv().await, Some(StreamEvent::Start { .. })));
    tokio::time::sleep(Duration::from_millis(4_000)).await;
    assert_eq!(provider.calls(), 0);

    while rx.recv().await.is_some() {}
    assert_eq!(provider.calls(), 1);
}

#[tokio::test]
async fn preview_shows_provider_shape() {
    let provider = ScriptedProvider::new(vec![]);
    let p = pipeline(provider.clone());
    let preview = p
        .preview(&ChatRequest::new(vec![json!({"role": "user", "content": "hi"})]))
        .await
        .unwrap();
    assert_eq!(preview.provider, "main");
    assert_eq!(preview.messages.len(), 1);
    assert!(preview.system_text.contains("## Environment"));
    let shaped = serde_json::to_value(&preview.provider_messages).unwrap();
    assert_eq!(shaped["family"], "chat-completions");
    assert_eq!(shaped["messages"][0]["role"], "system");
    assert_eq!(provider.calls(), 0);
}

#[tokio::test]
async fn dropping_the_stream_releases_the_provider() {
    let provider = StallingProvider::new(false);
    let p = pipeline_with(provider.clone(), BudgetConfig::default());
    let mut rx = p.run(
        ChatRequest::new(vec![json!({"role": "user", "content": "hi"})]),
        RequestContext::default(),
    );
    assert!(matches!(rx.recv().await, Some(StreamEvent::Start { .. })));
    drop(rx);

    tokio::time::timeout(Duration::from_secs(5), provider.released.notified())
        .await
        .expect("provider stream still held after the client left");
}

#[tokio::test]
async fn dropping_the_stream_abandons_a_pending_provider_open() {
    let provider = StallingProvider::new(true);
    let p = pipeline_with(provider.clone(), BudgetConfig::default());
    let mut rx = p.run(
        ChatRequest::new(vec![json!({"role": "user", "content": "hi"})]),
        RequestContext::default(),
    );
    assert!(matches!(rx.recv().await, Some(StreamEvent::Start { .. })));
    drop(rx);

    tokio::time::timeout(Duration::from_secs(5), provider.released.notified())
        .await
        .expect("provider open still pending after the client left");
}
