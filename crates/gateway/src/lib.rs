//! HTTP gateway for ChatRelay.
//!
//! Serves the chat endpoint as a UI message stream over SSE, plus health,
//! status and context inspection routes. All request handling lives in
//! [`chatrelay_agent::ChatPipeline`]; this crate only adapts it to HTTP.

pub mod api_v1;

use std::sync::Arc;

use axum::extract::DefaultBodyLimit;
use axum::http::{HeaderValue, Method, header};
use axum::{Router, response::Json, routing::get};
use chatrelay_agent::ChatPipeline;
use chatrelay_config::{AppConfig, GatewayConfig};
use serde::Serialize;
use tower_http::cors::{AllowOrigin, CorsLayer};
use tracing::{info, warn};

/// Shared application state for the gateway.
pub struct GatewayState {
    pub pipeline: ChatPipeline,
    pub start_time: chrono::DateTime<chrono::Utc>,
}

impl GatewayState {
    pub fn new(pipeline: ChatPipeline) -> Self {
        Self {
            pipeline,
            start_time: chrono::Utc::now(),
        }
    }
}

pub type SharedState = Arc<GatewayState>;

/// Build the full router: `/health` plus the v1 API under `/v1`.
///
/// Layers applied:
/// - CORS, restricted to `gateway.allowed_origins` when set
/// - Request body size limit (`gateway.max_body_bytes`)
/// - HTTP trace logging
pub fn build_router(state: SharedState) -> Router {
    let gateway = state.pipeline.config().gateway.clone();

    Router::new()
        .route("/health", get(health_handler))
        .nest("/v1", api_v1::v1_router(state))
        .layer(DefaultBodyLimit::max(gateway.max_body_bytes))
        .layer(cors_layer(&gateway))
        .layer(tower_http::trace::TraceLayer::new_for_http())
}

fn cors_layer(gateway: &GatewayConfig) -> CorsLayer {
    let origins: Vec<HeaderValue> = gateway
        .allowed_origins
        .iter()
        .filter_map(|o| match HeaderValue::from_str(o) {
            Ok(v) => Some(v),
            Err(_) => {
                warn!(origin = %o, "Ignoring invalid CORS origin");
                None
            }
        })
        .collect();

    let allow_origin = if origins.is_empty() {
        AllowOrigin::any()
    } else {
        AllowOrigin::list(origins)
    };

    CorsLayer::new()
        .allow_origin(allow_origin)
        .allow_methods([Method::GET, Method::POST])
        .allow_headers([header::CONTENT_TYPE, header::AUTHORIZATION])
        .expose_headers([header::HeaderName::from_static(api_v1::UI_STREAM_HEADER)])
        .max_age(std::time::Duration::from_secs(3600))
}

/// Start the gateway HTTP server and run until Ctrl-C.
pub async fn start(config: AppConfig) -> Result<(), Box<dyn std::error::Error>> {
    let addr = format!("{}:{}", config.gateway.host, config.gateway.port);
    let config = Arc::new(config);

    let pipeline = ChatPipeline::from_config(config.clone())?;
    info!(
        provider = %config.active_provider,
        providers = ?pipeline.providers().names(),
        context_dir = %config.context_dir().display(),
        "Pipeline ready"
    );

    let app = build_router(Arc::new(GatewayState::new(pipeline)));

    info!(addr = %addr, "Gateway starting");
    let listener = tokio::net::TcpListener::bind(&addr).await?;
    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await?;

    info!("Gateway stopped");
    Ok(())
}

async fn shutdown_signal() {
    if let Err(e) = tokio::signal::ctrl_c().await {
        warn!(error = %e, "Could not listen for Ctrl-C");
        std::future::pending::<()>().await;
    }
}

// --- Handlers ---

#[derive(Serialize)]
struct HealthResponse {
    status: &'static str,
    version: &'static str,
}

async fn health_handler() -> Json<HealthResponse> {
    Json(HealthResponse {
        status: "ok",
        version: env!("CARGO_PKG_VERSION"),
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::body::Body;
    use axum::http::{Request, StatusCode};
    use chatrelay_agent::StaticContextSource;
    use chatrelay_core::ContextBlock;
    use chatrelay_providers::ProviderRouter;
    use http_body_util::BodyExt;
    use tower::ServiceExt;

    fn empty_state(config: AppConfig) -> SharedState {
        let pipeline = ChatPipeline::new(
            Arc::new(config),
            ProviderRouter::new(),
            Arc::new(StaticContextSource::new(ContextBlock::default())),
        );
        Arc::new(GatewayState::new(pipeline))
    }

    #[tokio::test]
    async fn health_endpoint() {
        let app = build_router(empty_state(AppConfig::default()));

        let req = Request::builder().uri("/health").body(Body::empty()).unwrap();
        let response = app.oneshot(req).await.unwrap();
        assert_eq!(response.status(), StatusCode::OK);

        let body = response.into_body().collect().await.unwrap().to_bytes();
        let json: serde_json::Value = serde_json::from_slice(&body).unwrap();
        assert_eq!(json["status"], "ok");
    }

    #[tokio::test]
    async fn oversized_body_is_rejected() {
        let mut config = AppConfig::default();
        config.gateway.max_body_bytes = 64;
        let app = build_router(empty_state(config));

        let big = serde_json::json!({
            "messages": [{"role": "user", "content": "x".repeat(500)}]
        });
        let req = Request::builder()
            .method("POST")
            .uri("/v1/chat")
            .header("content-type", "application/json")
            .body(Body::from(big.to_string()))
            .unwrap();
        let response = app.oneshot(req).await.unwrap();
        assert_eq!(response.status(), StatusCode::PAYLOAD_TOO_LARGE);
    }

    #[tokio::test]
    async fn cors_preflight_honors_allowed_origins() {
        let mut config = AppConfig::default();
        config.gateway.allowed_origins = vec!["http://localhost:3000".into()];
        let app = build_router(empty_state(config));

        let req = Request::builder()
            .method("OPTIONS")
            .uri("/v1/chat")
            .header("origin", "http://localhost:3000")
            .header("access-control-request-method", "POST")
            .body(Body::empty())
            .unwrap();
        let response = app.oneshot(req).await.unwrap();
        assert_eq!(
            response.headers().get("access-control-allow-origin").unwrap(),
            "http://localhost:3000"
        );
    }
}
