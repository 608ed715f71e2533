//! HTTP server startup and routing.
//!
//! One dispatcher serves every route; backend work is pushed to the worker
//! pool by the handlers. On Ctrl-C the listener stops and every slot is
//! unloaded so no llama-server process outlives the daemon.

use std::time::Duration;

use axum::{
    extract::{MatchedPath, Request},
    middleware::{self, Next},
    response::Response,
    routing::{get, post},
    Json, Router,
};
use serde_json::json;
use tower_http::{
    cors::{Any, CorsLayer},
    timeout::TimeoutLayer,
    trace::TraceLayer,
};
use tracing::{info, warn};

use crate::{api, config::Config, metrics, shared_state::AppState};

/// Run the daemon until Ctrl-C.
pub async fn run_server(cfg: Config) -> anyhow::Result<()> {
    crate::telemetry::init_tracing();
    crate::metrics::init_metrics();
    cfg.print_config();

    let state = AppState::from_config(&cfg);
    let manager = state.manager.clone();

    let addr = cfg.api_addr()?;
    info!("Starting HTTP server on {}", addr);
    let listener = tokio::net::TcpListener::bind(addr).await?;

    let app = build_router(state, cfg.request_timeout());

    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await?;

    info!("Server stopped, unloading {} slot(s)", manager.list_slots().len());
    manager.shutdown().await;
    Ok(())
}

async fn shutdown_signal() {
    match tokio::signal::ctrl_c().await {
        Ok(()) => info!("Shutdown signal received"),
        Err(e) => warn!("Failed to listen for shutdown signal: {}", e),
    }
}

async fn track_requests(req: Request, next: Next) -> Response {
    let route = req
        .extensions()
        .get::<MatchedPath>()
        .map(|p| p.as_str().to_owned())
        .unwrap_or_else(|| req.uri().path().to_owned());
    let response = next.run(req).await;
    metrics::inc_request(&route, response.status().as_str());
    response
}

/// Router with the control API, the OpenAI-compatible API, `/health` and `/metrics`.
pub fn build_router(state: AppState, request_timeout: Duration) -> Router {
    let cors = CorsLayer::new()
        .allow_origin(Any)
        .allow_methods([axum::http::Method::GET, axum::http::Method::POST])
        .allow_headers(Any);

    Router::new()
        // Control API
        .route("/api/slots", get(api::list_slots))
        .route("/api/load", post(api::load_model))
        .route("/api/unload", post(api::unload_model))
        .route("/api/status", get(api::status))
        .route("/api/devices", get(api::list_devices))
        .route("/api/configure", post(api::configure))
        // OpenAI-compatible API
        .route("/v1/models", get(api::list_models))
        .route("/v1/chat/completions", post(api::chat_completions))
        .route("/v1/completions", post(api::completions))
        .route("/health", get(|| async { Json(json!({"status": "ok"})) }))
        .route("/metrics", get(metrics::get_metrics))
        .route_layer(middleware::from_fn(track_requests))
        .layer(cors)
        .layer(TraceLayer::new_for_http())
        .layer(TimeoutLayer::new(request_timeout))
        .with_state(state)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_support::{test_state, StubLoader};
    use axum::{
        body::{to_bytes, Body},
        http::{Request, StatusCode},
    };
    use std::sync::Arc;
    use tower::ServiceExt;

    fn app() -> Router {
        build_router(test_state(Arc::new(StubLoader::new()), 1), Duration::from_secs(30))
    }

    #[tokio::test]
    async fn test_health() {
        let response = app()
            .oneshot(Request::builder().uri("/health").body(Body::empty()).unwrap())
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        let bytes = to_bytes(response.into_body(), usize::MAX).await.unwrap();
        let body: serde_json::Value = serde_json::from_slice(&bytes).unwrap();
        assert_eq!(body, json!({"status": "ok"}));
    }

    #[tokio::test]
    async fn test_metrics_route() {
        crate::metrics::init_metrics();
        let app = app();
        app.clone()
            .oneshot(Request::builder().uri("/health").body(Body::empty()).unwrap())
            .await
            .unwrap();
        let response = app
            .oneshot(Request::builder().uri("/metrics").body(Body::empty()).unwrap())
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        let bytes = to_bytes(response.into_body(), usize::MAX).await.unwrap();
        let text = String::from_utf8(bytes.to_vec()).unwrap();
        assert!(text.contains("requests_total{route=\"/health\",status=\"200\"}"));
    }

    #[tokio::test]
    async fn test_unknown_route_is_404() {
        let response = app()
            .oneshot(Request::builder().uri("/nope").body(Body::empty()).unwrap())
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::NOT_FOUND);
    }
}
