//! HTTP API for the scheduled-task feature and tool-server settings.
//!
//! Task routes are thin proxies: each one calls a named tool on the cron
//! server and returns the unwrapped result as the body, or a 500 with the
//! error message.

use axum::{
    extract::{Path, State},
    http::{header, StatusCode},
    response::{IntoResponse, Response},
    routing::{get, post},
    Json, Router,
};
use serde_json::{json, Map, Value};
use std::sync::Arc;
use tower::ServiceBuilder;
use tower_http::cors::{Any, CorsLayer};
use tower_http::trace::TraceLayer;
use tracing::{info, warn};

use crate::bridge::CronBridge;
use crate::config::{Config, SettingsStore, ToolServerConfig};
use crate::error::{Error, Result};
use crate::metrics::Metrics;

/// HTTP server state.
#[derive(Clone)]
pub struct HttpState {
    bridge: Arc<CronBridge>,
    settings: Arc<SettingsStore>,
    metrics: Arc<Metrics>,
}

impl HttpState {
    pub fn new(bridge: Arc<CronBridge>, settings: Arc<SettingsStore>, metrics: Arc<Metrics>) -> Self {
        Self {
            bridge,
            settings,
            metrics,
        }
    }
}

/// Build the application router.
pub fn router(state: HttpState) -> Router {
    Router::new()
        .route("/health", get(health_check))
        .route("/metrics", get(metrics))
        .route("/api/cron/status", get(cron_status))
        .route("/api/tasks", get(list_tasks).post(add_task))
        .route("/api/tasks/ai", post(add_ai_task))
        .route(
            "/api/tasks/{id}",
            get(get_task).put(update_task).delete(remove_task),
        )
        .route("/api/tasks/{id}/run", post(run_task))
        .route("/api/tasks/{id}/enable", post(enable_task))
        .route("/api/tasks/{id}/disable", post(disable_task))
        .route("/api/tasks/{id}/result", get(get_task_result))
        .route("/api/mcp-servers", get(list_servers))
        .route(
            "/api/mcp-servers/{key}",
            axum::routing::put(save_server).delete(delete_server),
        )
        .layer(
            ServiceBuilder::new()
                .layer(TraceLayer::new_for_http())
                .layer(
                    CorsLayer::new()
                        .allow_origin(Any)
                        .allow_methods(Any)
                        .allow_headers(Any),
                ),
        )
        .with_state(state)
}

/// Start the HTTP server and run until Ctrl-C.
pub async fn start_server(config: &Config, state: HttpState) -> Result<()> {
    let bridge = state.bridge.clone();
    let app = router(state);

    let addr = config.bind_addr();
    info!("Starting HTTP server on {}", addr);

    let listener = tokio::net::TcpListener::bind(&addr).await?;
    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await
        .map_err(|e| Error::HttpServer(e.to_string()))?;

    bridge.stop().await;
    info!("HTTP server stopped");
    Ok(())
}

async fn shutdown_signal() {
    if let Err(e) = tokio::signal::ctrl_c().await {
        warn!("Failed to listen for Ctrl-C: {}", e);
        std::future::pending::<()>().await;
    }
}

fn error_response(e: Error) -> Response {
    (e.status_code(), Json(json!({ "error": e.to_string() }))).into_response()
}

async fn proxy(state: &HttpState, tool: &str, args: Value) -> Response {
    match state.bridge.call_tool(tool, args).await {
        Ok(output) => (StatusCode::OK, Json(output)).into_response(),
        Err(e) => error_response(e),
    }
}

fn with_id(id: String, mut body: Map<String, Value>) -> Value {
    body.insert("id".to_string(), Value::String(id));
    Value::Object(body)
}

/// Health check endpoint.
async fn health_check(State(state): State<HttpState>) -> impl IntoResponse {
    Json(json!({
        "status": "ok",
        "version": crate::VERSION,
        "cron": state.bridge.state(),
    }))
}

async fn metrics(State(state): State<HttpState>) -> impl IntoResponse {
    (
        [(header::CONTENT_TYPE, "text/plain; version=0.0.4")],
        state.metrics.to_prometheus(),
    )
}

async fn cron_status(State(state): State<HttpState>) -> impl IntoResponse {
    Json(json!({
        "running": state.bridge.is_running(),
        "state": state.bridge.state(),
        "pid": state.bridge.supervisor().pid(),
    }))
}

// ===== Task Routes =====

/// List tasks. A disabled task feature reads as an empty list.
async fn list_tasks(State(state): State<HttpState>) -> Response {
    match state.bridge.call_tool("list_tasks", json!({})).await {
        Ok(output) => (StatusCode::OK, Json(output)).into_response(),
        Err(e) if e.is_not_running() => (StatusCode::OK, Json(json!([]))).into_response(),
        Err(e) => error_response(e),
    }
}

async fn add_task(State(state): State<HttpState>, Json(body): Json<Map<String, Value>>) -> Response {
    proxy(&state, "add_task", Value::Object(body)).await
}

async fn add_ai_task(State(state): State<HttpState>, Json(body): Json<Map<String, Value>>) -> Response {
    proxy(&state, "add_ai_task", Value::Object(body)).await
}

async fn get_task(State(state): State<HttpState>, Path(id): Path<String>) -> Response {
    proxy(&state, "get_task", json!({ "id": id })).await
}

async fn update_task(
    State(state): State<HttpState>,
    Path(id): Path<String>,
    Json(body): Json<Map<String, Value>>,
) -> Response {
    proxy(&state, "update_task", with_id(id, body)).await
}

async fn remove_task(State(state): State<HttpState>, Path(id): Path<String>) -> Response {
    proxy(&state, "remove_task", json!({ "id": id })).await
}

async fn run_task(State(state): State<HttpState>, Path(id): Path<String>) -> Response {
    proxy(&state, "run_task", json!({ "id": id })).await
}

async fn enable_task(State(state): State<HttpState>, Path(id): Path<String>) -> Response {
    proxy(&state, "enable_task", json!({ "id": id })).await
}

async fn disable_task(State(state): State<HttpState>, Path(id): Path<String>) -> Response {
    proxy(&state, "disable_task", json!({ "id": id })).await
}

async fn get_task_result(State(state): State<HttpState>, Path(id): Path<String>) -> Response {
    proxy(&state, "get_task_result", json!({ "id": id })).await
}

// ===== Settings Routes =====

async fn list_servers(State(state): State<HttpState>) -> impl IntoResponse {
    Json(state.settings.list().await)
}

/// Apply saved settings to the bridge and describe the outcome.
async fn reload(state: &HttpState) -> Value {
    match state.bridge.restart().await {
        Ok(()) => json!({ "running": state.bridge.is_running() }),
        Err(e) => {
            warn!("Tool server restart after settings change failed: {}", e);
            json!({ "running": state.bridge.is_running(), "error": e.to_string() })
        }
    }
}

async fn save_server(
    State(state): State<HttpState>,
    Path(key): Path<String>,
    Json(config): Json<ToolServerConfig>,
) -> Response {
    if let Err(e) = state.settings.upsert(&key, config).await {
        return error_response(e);
    }
    let bridge = reload(&state).await;
    (StatusCode::OK, Json(json!({ "saved": key, "bridge": bridge }))).into_response()
}

async fn delete_server(State(state): State<HttpState>, Path(key): Path<String>) -> Response {
    match state.settings.remove(&key).await {
        Ok(true) => {
            let bridge = reload(&state).await;
            (StatusCode::OK, Json(json!({ "removed": key, "bridge": bridge }))).into_response()
        }
        Ok(false) => (
            StatusCode::NOT_FOUND,
            Json(json!({ "error": format!("No tool server named '{}'", key) })),
        )
            .into_response(),
        Err(e) => error_response(e),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bridge::{Supervisor, SupervisorOptions};
    use crate::config::Settings;
    use axum::body::Body;
    use axum::http::Request;
    use tower::ServiceExt;

    fn stopped_state() -> HttpState {
        let settings = Arc::new(SettingsStore::in_memory(Settings::default()));
        let metrics = Metrics::new();
        let supervisor = Supervisor::new(
            "cron",
            settings.clone(),
            SupervisorOptions::default(),
            metrics.clone(),
        );
        HttpState::new(Arc::new(CronBridge::new(supervisor)), settings, metrics)
    }

    async fn body_json(response: Response) -> Value {
        let bytes = axum::body::to_bytes(response.into_body(), usize::MAX)
            .await
            .unwrap();
        serde_json::from_slice(&bytes).unwrap()
    }

    #[tokio::test]
    async fn test_list_tasks_when_stopped_is_empty() {
        let app = router(stopped_state());
        let response = app
            .oneshot(Request::get("/api/tasks").body(Body::empty()).unwrap())
            .await
            .unwrap();

        assert_eq!(response.status(), StatusCode::OK);
        assert_eq!(body_json(response).await, json!([]));
    }

    #[tokio::test]
    async fn test_other_task_routes_fail_when_stopped() {
        let app = router(stopped_state());
        let response = app
            .oneshot(Request::get("/api/tasks/42").body(Body::empty()).unwrap())
            .await
            .unwrap();

        assert_eq!(response.status(), StatusCode::INTERNAL_SERVER_ERROR);
        let body = body_json(response).await;
        assert!(body["error"].as_str().unwrap().contains("is not running"));
    }

    #[tokio::test]
    async fn test_health_reports_cron_state() {
        let app = router(stopped_state());
        let response = app
            .oneshot(Request::get("/health").body(Body::empty()).unwrap())
            .await
            .unwrap();

        let body = body_json(response).await;
        assert_eq!(body["status"], "ok");
        assert_eq!(body["cron"], "stopped");
    }

    #[tokio::test]
    async fn test_save_rejects_blank_command() {
        let app = router(stopped_state());
        let response = app
            .oneshot(
                Request::put("/api/mcp-servers/cron")
                    .header(header::CONTENT_TYPE, "application/json")
                    .body(Body::from(r#"{"command":""}"#))
                    .unwrap(),
            )
            .await
            .unwrap();

        assert_eq!(response.status(), StatusCode::BAD_REQUEST);
    }

    #[tokio::test]
    async fn test_delete_unknown_server_is_404() {
        let app = router(stopped_state());
        let response = app
            .oneshot(
                Request::delete("/api/mcp-servers/cron")
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();

        assert_eq!(response.status(), StatusCode::NOT_FOUND);
    }

    #[tokio::test]
    async fn test_metrics_endpoint_is_prometheus_text() {
        let app = router(stopped_state());
        let response = app
            .oneshot(Request::get("/metrics").body(Body::empty()).unwrap())
            .await
            .unwrap();

        assert_eq!(response.status(), StatusCode::OK);
        let bytes = axum::body::to_bytes(response.into_body(), usize::MAX)
            .await
            .unwrap();
        let text = String::from_utf8(bytes.to_vec()).unwrap();
        assert!(text.contains("assistant_bridge_process_spawns_total 0"));
    }
}
