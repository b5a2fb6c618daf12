//! HTTP API v1.
//!
//! Endpoints:
//!
//! - `POST /v1/chat`: Full history in, UI message stream (SSE) out
//! - `GET  /v1/status`: Active provider, budgets, uptime
//! - `GET  /v1/providers`: Registered providers
//! - `GET  /v1/config`: Effective configuration, secrets redacted
//! - `POST /v1/context/debug`: What a chat request would send upstream

use std::convert::Infallible;

use axum::{
    Router,
    extract::State,
    http::{HeaderMap, HeaderName, HeaderValue, StatusCode, header},
    response::sse::{Event as SseEvent, Sse},
    response::{IntoResponse, Json},
    routing::{get, post},
};
use chatrelay_agent::{ChatRequest, ContextPreview, PipelineStatus, RequestContext};
use chatrelay_core::DONE_SENTINEL;
use serde::{Deserialize, Serialize};
use tokio_stream::StreamExt;
use tokio_stream::wrappers::ReceiverStream;
use tracing::{info, warn};

use crate::SharedState;

/// Marks the response body as a UI message stream.
pub const UI_STREAM_HEADER: &str = "x-vercel-ai-ui-message-stream";

/// Correlates gateway logs with the client's request.
pub const REQUEST_ID_HEADER: &str = "x-request-id";

// ── Router ────────────────────────────────────────────────────────────────

/// Build the v1 API router. Nest this under "/v1" in the main router.
pub fn v1_router(state: SharedState) -> Router {
    Router::new()
        .route("/chat", post(chat_handler))
        .route("/status", get(status_handler))
        .route("/providers", get(list_providers_handler))
        .route("/config", get(get_config_handler))
        .route("/context/debug", post(context_debug_handler))
        .with_state(state)
}

#[derive(Debug, Serialize, Deserialize)]
struct ErrorResponse {
    error: String,
}

fn error_response(status: StatusCode, error: impl Into<String>) -> (StatusCode, Json<ErrorResponse>) {
    (status, Json(ErrorResponse { error: error.into() }))
}

// ── Chat ──────────────────────────────────────────────────────────────────

/// `POST /v1/chat`: stream the answer to a full conversation history.
///
/// The body is one `data:` line per event, then `data: [DONE]`. Failures
/// after the stream has started arrive as an `error` event, never as an
/// HTTP status.
async fn chat_handler(
    State(state): State<SharedState>,
    headers: HeaderMap,
    Json(payload): Json<ChatRequest>,
) -> Result<impl IntoResponse, (StatusCode, Json<ErrorResponse>)> {
    if payload.messages.is_empty() {
        return Err(error_response(StatusCode::BAD_REQUEST, "messages must not be empty"));
    }

    let ctx = request_context(&headers);
    info!(
        request_id = %ctx.request_id,
        messages = payload.messages.len(),
        tools = payload.tools.len(),
        "v1/chat SSE request"
    );

    let mut response_headers = stream_headers();
    if let Ok(v) = HeaderValue::from_str(&ctx.request_id) {
        response_headers.insert(HeaderName::from_static(REQUEST_ID_HEADER), v);
    }

    let rx = state.pipeline.run(payload, ctx);
    let events = ReceiverStream::new(rx).map(|event| Ok::<_, Infallible>(SseEvent::default().data(event.to_data())));
    let done = tokio_stream::once(Ok(SseEvent::default().data(DONE_SENTINEL)));

    Ok((response_headers, Sse::new(events.chain(done))))
}

fn request_context(headers: &HeaderMap) -> RequestContext {
    headers
        .get(REQUEST_ID_HEADER)
        .and_then(|v| v.to_str().ok())
        .map(str::trim)
        .filter(|id| !id.is_empty() && id.len() <= 128)
        .map(|id| RequestContext {
            request_id: id.to_string(),
        })
        .unwrap_or_default()
}

fn stream_headers() -> HeaderMap {
    let mut headers = HeaderMap::new();
    headers.insert(header::CACHE_CONTROL, HeaderValue::from_static("no-cache"));
    headers.insert(header::CONNECTION, HeaderValue::from_static("keep-alive"));
    headers.insert(HeaderName::from_static(UI_STREAM_HEADER), HeaderValue::from_static("v1"));
    headers
}

// ── Context debug ─────────────────────────────────────────────────────────

/// `POST /v1/context/debug`: assemble and trim without calling a provider.
async fn context_debug_handler(
    State(state): State<SharedState>,
    Json(payload): Json<ChatRequest>,
) -> Result<Json<ContextPreview>, (StatusCode, Json<ErrorResponse>)> {
    state.pipeline.preview(&payload).await.map(Json).map_err(|e| {
        warn!(error = %e, "Context preview unavailable");
        error_response(StatusCode::SERVICE_UNAVAILABLE, e.to_string())
    })
}

// ── Providers ─────────────────────────────────────────────────────────────

#[derive(Serialize, Deserialize)]
struct ProviderInfo {
    name: String,
    family: String,
    model: String,
    active: bool,
}

async fn list_providers_handler(State(state): State<SharedState>) -> Json<Vec<ProviderInfo>> {
    let active = state.pipeline.settings().snapshot().active_provider;
    let providers = state.pipeline.providers();
    let list = providers
        .names()
        .into_iter()
        .filter_map(|name| {
            let p = providers.get(&name)?;
            Some(ProviderInfo {
                active: name == active,
                family: p.family().to_string(),
                model: p.model().to_string(),
                name,
            })
        })
        .collect();
    Json(list)
}

// ── Config ────────────────────────────────────────────────────────────────

#[derive(Serialize, Deserialize)]
struct ConfigResponse {
    config: serde_json::Value,
}

async fn get_config_handler(State(state): State<SharedState>) -> Json<ConfigResponse> {
    let mut value = serde_json::to_value(state.pipeline.config()).unwrap_or(serde_json::json!({}));
    redact_secrets(&mut value);
    Json(ConfigResponse { config: value })
}

fn redact_secrets(value: &mut serde_json::Value) {
    match value {
        serde_json::Value::Object(map) => {
            for (key, val) in map.iter_mut() {
                let key_lower = key.to_lowercase();
                if key_lower.contains("key") || key_lower.contains("secret") || key_lower.contains("token") {
                    if val.as_str().is_some_and(|s| !s.is_empty()) {
                        *val = serde_json::json!("***REDACTED***");
                    }
                } else {
                    redact_secrets(val);
                }
            }
        }
        serde_json::Value::Array(arr) => arr.iter_mut().for_each(redact_secrets),
        _ => {}
    }
}

// ── Status ────────────────────────────────────────────────────────────────

#[derive(Serialize)]
struct StatusResponse {
    status: &'static str,
    version: &'static str,
    uptime_secs: u64,
    #[serde(flatten)]
    pipeline: PipelineStatus,
}

async fn status_handler(State(state): State<SharedState>) -> Json<StatusResponse> {
    let uptime = chrono::Utc::now()
        .signed_duration_since(state.start_time)
        .num_seconds()
        .max(0) as u64;

    Json(StatusResponse {
        status: "healthy",
        version: env!("CARGO_PKG_VERSION"),
        uptime_secs: uptime,
        pipeline: state.pipeline.status(),
    })
}

// ── Tests ─────────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    use axum::body::Body;
    use axum::http::Request;
    use chatrelay_agent::{ChatPipeline, StaticContextSource};
    use chatrelay_config::{AppConfig, ProviderConfig};
    use chatrelay_core::error::ProviderError;
    use chatrelay_core::provider::{
        EventReceiver, FinishReason, Provider, ProviderEvent, ProviderFamily, ProviderRequest,
    };
    use chatrelay_core::{ContextBlock, StreamEvent, StreamValidator};
    use chatrelay_providers::ProviderRouter;
    use http_body_util::BodyExt;
    use serde_json::{Value, json};
    use tower::ServiceExt;

    use crate::GatewayState;

    /// Lightweight mock provider for gateway tests.
    struct MockProvider {
        response_text: String,
    }

    #[async_trait::async_trait]
    impl Provider for MockProvider {
        fn name(&self) -> &str {
            "gateway_mock"
        }

        fn family(&self) -> ProviderFamily {
            ProviderFamily::ChatCompletions
        }

        fn model(&self) -> &str {
            "mock-model"
        }

        async fn stream(&self, _request: ProviderRequest) -> Result<EventReceiver, ProviderError> {
            let (tx, rx) = tokio::sync::mpsc::channel(4);
            let text = self.response_text.clone();
            tokio::spawn(async move {
                let _ = tx.send(Ok(ProviderEvent::TextDelta(text))).await;
                let _ = tx.send(Ok(ProviderEvent::Finish(FinishReason::Stop))).await;
            });
            Ok(rx)
        }
    }

    fn test_config() -> AppConfig {
        let mut config = AppConfig::default();
        config.active_provider = "mock".into();
        config.providers.clear();
        let mut provider = ProviderConfig::new(ProviderFamily::ChatCompletions);
        provider.api_key = Some("sk-test-secret".into());
        config.providers.insert("mock".into(), provider);
        config
    }

    fn test_state() -> SharedState {
        let mut router = ProviderRouter::new();
        router.register(
            "mock",
            Arc::new(MockProvider {
                response_text: "Mock response from provider".into(),
            }),
        );
        let block = ContextBlock {
            base_instructions: "Be brief.".into(),
            environment_summary: "Two nodes.".into(),
            ..ContextBlock::default()
        };
        let pipeline = ChatPipeline::new(
            Arc::new(test_config()),
            router,
            Arc::new(StaticContextSource::new(block)),
        );
        Arc::new(GatewayState::new(pipeline))
    }

    fn post_json(uri: &str, body: Value) -> Request<Body> {
        Request::builder()
            .method("POST")
            .uri(uri)
            .header("content-type", "application/json")
            .body(Body::from(body.to_string()))
            .unwrap()
    }

    /// Split an SSE body into its `data:` payloads.
    fn data_lines(body: &str) -> Vec<String> {
        body.lines()
            .filter_map(|l| l.strip_prefix("data: "))
            .map(str::to_string)
            .collect()
    }

    fn decode_events(lines: &[String]) -> Vec<StreamEvent> {
        lines
            .iter()
            .filter(|l| l.as_str() != DONE_SENTINEL)
            .map(|l| serde_json::from_str(l).unwrap())
            .collect()
    }

    // ── Chat ───────────────────────────────────────────────────────────

    #[tokio::test]
    async fn chat_streams_ui_message_protocol() {
        let app = v1_router(test_state());
        let req = post_json("/chat", json!({"messages": [{"role": "user", "content": "hi"}]}));

        let response = app.oneshot(req).await.unwrap();
        assert_eq!(response.status(), StatusCode::OK);

        let headers = response.headers();
        assert!(
            headers["content-type"].to_str().unwrap().contains("text/event-stream"),
            "unexpected content type {:?}",
            headers["content-type"]
        );
        assert_eq!(headers["cache-control"], "no-cache");
        assert_eq!(headers[UI_STREAM_HEADER], "v1");
        assert!(headers.contains_key(REQUEST_ID_HEADER));

        let body = response.into_body().collect().await.unwrap().to_bytes();
        let text = String::from_utf8_lossy(&body);
        let lines = data_lines(&text);
        assert_eq!(lines.last().map(String::as_str), Some(DONE_SENTINEL));

        let events = decode_events(&lines);
        StreamValidator::validate(&events).unwrap();
        assert!(events.iter().any(|e| matches!(
            e,
            StreamEvent::TextDelta { delta, .. } if delta == "Mock response from provider"
        )));
        assert!(text.contains(r#""type":"finish","finishReason":"stop""#));
    }

    #[tokio::test]
    async fn chat_echoes_request_id() {
        let app = v1_router(test_state());
        let mut req = post_json("/chat", json!({"messages": [{"role": "user", "content": "hi"}]}));
        req.headers_mut()
            .insert(REQUEST_ID_HEADER, HeaderValue::from_static("req-42"));

        let response = app.oneshot(req).await.unwrap();
        assert_eq!(response.headers()[REQUEST_ID_HEADER], "req-42");
    }

    #[tokio::test]
    async fn chat_command_is_answered_locally() {
        let app = v1_router(test_state());
        let req = post_json("/chat", json!({"messages": [{"role": "user", "content": "/help"}]}));

        let response = app.oneshot(req).await.unwrap();
        let body = response.into_body().collect().await.unwrap().to_bytes();
        let events = decode_events(&data_lines(&String::from_utf8_lossy(&body)));

        StreamValidator::validate(&events).unwrap();
        match &events[0] {
            StreamEvent::Start { message_metadata, .. } => {
                assert_eq!(message_metadata.as_ref().unwrap()["local"], true);
            }
            other => panic!("unexpected first event {other:?}"),
        }
        assert!(!events.iter().any(|e| matches!(
            e,
            StreamEvent::TextDelta { delta, .. } if delta.contains("Mock response")
        )));
    }

    #[tokio::test]
    async fn chat_rejects_empty_history() {
        let app = v1_router(test_state());
        let response = app.oneshot(post_json("/chat", json!({"messages": []}))).await.unwrap();
        assert_eq!(response.status(), StatusCode::BAD_REQUEST);

        let body = response.into_body().collect().await.unwrap().to_bytes();
        let err: ErrorResponse = serde_json::from_slice(&body).unwrap();
        assert!(err.error.contains("messages"));
    }

    #[tokio::test]
    async fn chat_rejects_malformed_body() {
        let app = v1_router(test_state());
        let req = Request::builder()
            .method("POST")
            .uri("/chat")
            .header("content-type", "application/json")
            .body(Body::from("{not json"))
            .unwrap();
        let response = app.oneshot(req).await.unwrap();
        assert!(response.status().is_client_error());
    }

    // ── Inspection ─────────────────────────────────────────────────────

    #[tokio::test]
    async fn context_debug_endpoint() {
        let app = v1_router(test_state());
        let req = post_json(
            "/context/debug",
            json!({"messages": [
                {"role": "user", "content": "hi"},
                {"role": "assistant", "content": "hello"},
                {"role": "user", "content": "/status", "metadata": {"local": true}}
            ]}),
        );

        let response = app.oneshot(req).await.unwrap();
        assert_eq!(response.status(), StatusCode::OK);

        let body = response.into_body().collect().await.unwrap().to_bytes();
        let preview: Value = serde_json::from_slice(&body).unwrap();
        assert_eq!(preview["provider"], "mock");
        assert_eq!(preview["family"], "chat-completions");
        assert!(preview["system_text"].as_str().unwrap().starts_with("Be brief."));
        assert_eq!(preview["messages"].as_array().unwrap().len(), 2);
        assert_eq!(preview["provider_messages"]["family"], "chat-completions");
    }

    #[tokio::test]
    async fn status_endpoint() {
        let app = v1_router(test_state());
        let req = Request::builder().uri("/status").body(Body::empty()).unwrap();

        let response = app.oneshot(req).await.unwrap();
        assert_eq!(response.status(), StatusCode::OK);

        let body = response.into_body().collect().await.unwrap().to_bytes();
        let status: Value = serde_json::from_slice(&body).unwrap();
        assert_eq!(status["status"], "healthy");
        assert_eq!(status["active_provider"], "mock");
        assert_eq!(status["model"], "mock-model");
        assert_eq!(status["budget"]["max_history_messages"], 24);
        assert!(status["uptime_secs"].is_u64());
    }

    #[tokio::test]
    async fn providers_endpoint_marks_active() {
        let app = v1_router(test_state());
        let req = Request::builder().uri("/providers").body(Body::empty()).unwrap();

        let response = app.oneshot(req).await.unwrap();
        let body = response.into_body().collect().await.unwrap().to_bytes();
        let list: Vec<ProviderInfo> = serde_json::from_slice(&body).unwrap();
        assert_eq!(list.len(), 1);
        assert!(list[0].active);
        assert_eq!(list[0].family, "chat-completions");
    }

    #[tokio::test]
    async fn get_config_redacted() {
        let app = v1_router(test_state());
        let req = Request::builder().uri("/config").body(Body::empty()).unwrap();

        let response = app.oneshot(req).await.unwrap();
        assert_eq!(response.status(), StatusCode::OK);

        let body = response.into_body().collect().await.unwrap().to_bytes();
        let text = String::from_utf8_lossy(&body);
        assert!(!text.contains("sk-test-secret"));
        assert!(text.contains("***REDACTED***"));
    }

    #[test]
    fn redaction_keeps_unset_keys() {
        let mut v = json!({"providers": {"a": {"api_key": null, "model": "m"}, "b": {"api_key": "x"}}});
        redact_secrets(&mut v);
        assert_eq!(v["providers"]["a"]["api_key"], Value::Null);
        assert_eq!(v["providers"]["a"]["model"], "m");
        assert_eq!(v["providers"]["b"]["api_key"], "***REDACTED***");
    }
}
