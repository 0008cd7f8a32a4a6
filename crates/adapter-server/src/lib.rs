//! HTTP adapter exposing engine status and rollback controls to operators.
//!
//! Read-only status and history plus three control endpoints: manual
//! trigger (409 when cooldown gates it), rollback, and administrative
//! history clearing. Everything is JSON over axum.

use axum::extract::{Path, Query, State};
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use axum::{Json, Router};
use common::Error;
use engine_core::EngineHandle;
use serde::Deserialize;
use serde_json::json;
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::sync::watch;
use tower_http::cors::CorsLayer;
use tower_http::trace::TraceLayer;
use tracing::info;

struct AppState {
    engine: EngineHandle,
}

/// Build the adapter router over an engine handle.
pub fn router(engine: EngineHandle) -> Router {
    let state = Arc::new(AppState { engine });
    Router::new()
        .route("/health", get(health_check))
        .route("/api/v1/status", get(status))
        .route("/api/v1/trends", get(trends))
        .route("/api/v1/changes", get(history))
        .route("/api/v1/trigger", post(trigger))
        .route("/api/v1/rollback", post(rollback))
        .route("/api/v1/changes/clear", post(clear_history))
        .route("/api/v1/abtest", get(list_experiments).post(create_experiment))
        .route("/api/v1/abtest/:id/results", post(record_ab_result))
        .route("/api/v1/abtest/:id/evaluate", post(evaluate_experiment))
        .layer(TraceLayer::new_for_http())
        .layer(CorsLayer::permissive())
        .with_state(state)
}

/// Serve the adapter until the shutdown signal flips.
pub async fn serve(
    engine: EngineHandle,
    bind: &str,
    mut shutdown: watch::Receiver<bool>,
) -> anyhow::Result<()> {
    let addr: SocketAddr = bind.parse()?;
    let app = router(engine);

    info!("adapter listening on {}", addr);
    let listener = tokio::net::TcpListener::bind(addr).await?;
    axum::serve(listener, app)
        .with_graceful_shutdown(async move {
            loop {
                if shutdown.changed().await.is_err() || *shutdown.borrow() {
                    return;
                }
            }
        })
        .await?;
    Ok(())
}

async fn health_check() -> impl IntoResponse {
    (StatusCode::OK, "OK")
}

async fn status(State(state): State<Arc<AppState>>) -> Response {
    let status = state.engine.status().await;
    Json(status).into_response()
}

async fn trends(State(state): State<Arc<AppState>>) -> Response {
    Json(state.engine.trends()).into_response()
}

#[derive(Debug, Deserialize)]
struct HistoryParams {
    #[serde(default = "default_history_limit")]
    limit: usize,
}

fn default_history_limit() -> usize {
    20
}

async fn history(
    State(state): State<Arc<AppState>>,
    Query(params): Query<HistoryParams>,
) -> Response {
    let (changes, summary) = state.engine.history(params.limit).await;
    Json(json!({
        "changes": changes,
        "summary": summary,
        "current_quality": state.engine.current_quality(),
    }))
    .into_response()
}

#[derive(Debug, Deserialize)]
struct TriggerBody {
    #[serde(default = "default_trigger_reason")]
    reason: String,
    #[serde(default)]
    override_cooldown: bool,
}

fn default_trigger_reason() -> String {
    "Manual trigger".to_string()
}

async fn trigger(
    State(state): State<Arc<AppState>>,
    body: Option<Json<TriggerBody>>,
) -> Response {
    let Json(body) = body.unwrap_or_else(|| {
        Json(TriggerBody {
            reason: default_trigger_reason(),
            override_cooldown: false,
        })
    });

    match state.engine.trigger(&body.reason, body.override_cooldown) {
        Ok(outcome) if outcome.success => Json(outcome).into_response(),
        Ok(outcome) => (StatusCode::CONFLICT, Json(outcome)).into_response(),
        Err(e) => error_response(e),
    }
}

#[derive(Debug, Default, Deserialize)]
struct RollbackBody {
    target_cycle_id: Option<String>,
}

async fn rollback(
    State(state): State<Arc<AppState>>,
    body: Option<Json<RollbackBody>>,
) -> Response {
    let Json(body) = body.unwrap_or_default();
    match state.engine.rollback(body.target_cycle_id).await {
        Ok(result) => Json(result).into_response(),
        Err(e) => error_response(e),
    }
}

async fn clear_history(State(state): State<Arc<AppState>>) -> Response {
    match state.engine.clear_history().await {
        Ok(cleared) => Json(json!({ "success": true, "records_cleared": cleared })).into_response(),
        Err(e) => error_response(e),
    }
}

async fn list_experiments(State(state): State<Arc<AppState>>) -> Response {
    Json(json!({ "experiments": state.engine.ab_experiments() })).into_response()
}

#[derive(Debug, Deserialize)]
struct CreateExperimentBody {
    name: String,
    variant_a: serde_json::Value,
    variant_b: serde_json::Value,
    #[serde(default = "default_traffic_split")]
    traffic_split: f64,
}

fn default_traffic_split() -> f64 {
    0.5
}

async fn create_experiment(
    State(state): State<Arc<AppState>>,
    Json(body): Json<CreateExperimentBody>,
) -> Response {
    match state
        .engine
        .create_ab_experiment(&body.name, body.variant_a, body.variant_b, body.traffic_split)
        .await
    {
        Ok(experiment) => Json(experiment).into_response(),
        Err(e) => error_response(e),
    }
}

#[derive(Debug, Deserialize)]
struct AbResultBody {
    variant: String,
    quality_score: f64,
}

async fn record_ab_result(
    State(state): State<Arc<AppState>>,
    Path(experiment_id): Path<String>,
    Json(body): Json<AbResultBody>,
) -> Response {
    match state
        .engine
        .record_ab_result(&experiment_id, &body.variant, body.quality_score)
        .await
    {
        Ok(()) => Json(json!({ "success": true })).into_response(),
        Err(e) => error_response(e),
    }
}

async fn evaluate_experiment(
    State(state): State<Arc<AppState>>,
    Path(experiment_id): Path<String>,
) -> Response {
    match state.engine.evaluate_ab_experiment(&experiment_id).await {
        Ok(result) => Json(result).into_response(),
        Err(e) => error_response(e),
    }
}

fn error_response(error: Error) -> Response {
    let status = match &error {
        Error::Degraded(_) => StatusCode::SERVICE_UNAVAILABLE,
        Error::NotFound(_) => StatusCode::NOT_FOUND,
        Error::Validation(_) => StatusCode::BAD_REQUEST,
        _ => StatusCode::INTERNAL_SERVER_ERROR,
    };
    (
        status,
        Json(json!({ "success": false, "error": error.to_string() })),
    )
        .into_response()
}

#[cfg(test)]
mod tests {
    use super::*;
    use engine_config::EngineConfig;
    use engine_core::QualityEngine;

    async fn test_handle(dir: &tempfile::TempDir) -> EngineHandle {
        let mut config = EngineConfig::default();
        config.observability.api_key = "test-key".to_string();
        config.observability.organization_id = "test-org".to_string();
        config.observability.base_url = "http://127.0.0.1:1".to_string();
        config.observability.max_retries = 0;
        config.audit.path = dir.path().join("history.json");
        let engine = QualityEngine::new(config).await.unwrap();
        // Leaked so the trigger channel's receiver stays alive for the life of the test.
        Box::leak(Box::new(engine)).handle()
    }

    async fn request(
        app: &Router,
        method: &str,
        uri: &str,
        body: Option<serde_json::Value>,
    ) -> (StatusCode, serde_json::Value) {
        use axum::body::Body;
        use axum::http::Request;
        use tower::ServiceExt;

        let request = match body {
            Some(body) => Request::builder()
                .method(method)
                .uri(uri)
                .header("content-type", "application/json")
                .body(Body::from(body.to_string()))
                .unwrap(),
            None => Request::builder()
                .method(method)
                .uri(uri)
                .body(Body::empty())
                .unwrap(),
        };

        let response = app.clone().oneshot(request).await.unwrap();
        let status = response.status();
        let bytes = axum::body::to_bytes(response.into_body(), usize::MAX)
            .await
            .unwrap();
        let json = if bytes.is_empty() {
            serde_json::Value::Null
        } else {
            serde_json::from_slice(&bytes).unwrap_or(serde_json::Value::Null)
        };
        (status, json)
    }

    #[tokio::test]
    async fn test_status_endpoint() {
        let dir = tempfile::tempdir().unwrap();
        let app = router(test_handle(&dir).await);

        let (status, body) = request(&app, "GET", "/api/v1/status", None).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["monitoring_active"], false);
        assert_eq!(body["current_quality"], 0.0);
        assert!(body["thresholds"]["low"].as_f64().is_some());
    }

    #[tokio::test]
    async fn test_history_endpoint_defaults() {
        let dir = tempfile::tempdir().unwrap();
        let app = router(test_handle(&dir).await);

        let (status, body) = request(&app, "GET", "/api/v1/changes", None).await;
        assert_eq!(status, StatusCode::OK);
        assert!(body["changes"].as_array().unwrap().is_empty());
        assert_eq!(body["summary"]["total"], 0);
    }

    #[tokio::test]
    async fn test_trigger_enqueues_manual_request() {
        let dir = tempfile::tempdir().unwrap();
        let handle = test_handle(&dir).await;
        let app = router(handle.clone());

        let (status, body) = request(
            &app,
            "POST",
            "/api/v1/trigger",
            Some(json!({ "reason": "operator check" })),
        )
        .await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["success"], true);
    }

    #[tokio::test]
    async fn test_rollback_without_history() {
        let dir = tempfile::tempdir().unwrap();
        let app = router(test_handle(&dir).await);

        let (status, body) = request(&app, "POST", "/api/v1/rollback", Some(json!({}))).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["success"], false);
        assert_eq!(body["configurations_rolled_back"], 0);
    }

    #[tokio::test]
    async fn test_clear_history_reports_count() {
        let dir = tempfile::tempdir().unwrap();
        let app = router(test_handle(&dir).await);

        let (status, body) = request(&app, "POST", "/api/v1/changes/clear", None).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["success"], true);
        assert_eq!(body["records_cleared"], 0);
    }

    #[tokio::test]
    async fn test_trends_endpoint() {
        let dir = tempfile::tempdir().unwrap();
        let app = router(test_handle(&dir).await);

        let (status, body) = request(&app, "GET", "/api/v1/trends", None).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["quality"]["trend"], "insufficient_data");
        // No data yet: the only factor is low confidence
        assert_eq!(body["risk"]["risk_level"], "low");
        assert_eq!(
            body["risk"]["risk_factors"][0],
            "insufficient_data_confidence"
        );
    }

    #[tokio::test]
    async fn test_abtest_listing_starts_empty() {
        let dir = tempfile::tempdir().unwrap();
        let app = router(test_handle(&dir).await);

        let (status, body) = request(&app, "GET", "/api/v1/abtest", None).await;
        assert_eq!(status, StatusCode::OK);
        assert!(body["experiments"].as_array().unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_abtest_unknown_experiment_is_404() {
        let dir = tempfile::tempdir().unwrap();
        let app = router(test_handle(&dir).await);

        let (status, body) =
            request(&app, "POST", "/api/v1/abtest/exp-missing/evaluate", None).await;
        assert_eq!(status, StatusCode::NOT_FOUND);
        assert_eq!(body["success"], false);

        let (status, _) = request(
            &app,
            "POST",
            "/api/v1/abtest/exp-missing/results",
            Some(json!({ "variant": "a", "quality_score": 0.9 })),
        )
        .await;
        assert_eq!(status, StatusCode::NOT_FOUND);
    }

    #[tokio::test]
    async fn test_abtest_invalid_variant_is_400() {
        let dir = tempfile::tempdir().unwrap();
        let app = router(test_handle(&dir).await);

        let (status, body) = request(
            &app,
            "POST",
            "/api/v1/abtest/exp-1/results",
            Some(json!({ "variant": "c", "quality_score": 0.9 })),
        )
        .await;
        assert_eq!(status, StatusCode::BAD_REQUEST);
        assert_eq!(body["success"], false);
    }

    #[tokio::test]
    async fn test_health_endpoint() {
        let dir = tempfile::tempdir().unwrap();
        let app = router(test_handle(&dir).await);
        let (status, _) = request(&app, "GET", "/health", None).await;
        assert_eq!(status, StatusCode::OK);
    }
}
