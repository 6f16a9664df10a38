//! Health check handlers for worker deployments.
//!
//! Reusable Axum handlers for:
//! - Liveness probes (`/health`, `/healthz`)
//! - Readiness probes (`/ready`, `/readyz`)
//! - Queue monitoring (`/queue/info`)
//! - Prometheus metrics (`/metrics`)

use axum::{
    Json, Router,
    extract::State,
    http::{StatusCode, header},
    response::IntoResponse,
    routing::get,
};
use serde::{Deserialize, Serialize};
use serde_json::{Value, json};

use crate::metrics;
use crate::queue::Queue;

/// Shared state for health endpoints.
#[derive(Clone)]
pub struct HealthState {
    /// The queue this deployment works on.
    pub queue: Queue,
    /// Application name.
    pub app_name: String,
    /// Application version.
    pub app_version: String,
}

impl HealthState {
    pub fn new(
        queue: Queue,
        app_name: impl Into<String>,
        app_version: impl Into<String>,
    ) -> Self {
        Self {
            queue,
            app_name: app_name.into(),
            app_version: app_version.into(),
        }
    }
}

/// Health response for liveness probes.
#[derive(Debug, Serialize, Deserialize)]
pub struct HealthResponse {
    /// Status (always "healthy" if responding).
    pub status: &'static str,
    /// Application name.
    pub name: String,
    /// Application version.
    pub version: String,
}

/// Liveness probe handler.
///
/// Always returns OK if the server is running.
pub async fn health_handler(State(state): State<HealthState>) -> Json<HealthResponse> {
    Json(HealthResponse {
        status: "healthy",
        name: state.app_name,
        version: state.app_version,
    })
}

/// Readiness probe handler.
///
/// Checks that Redis answers PING.
pub async fn ready_handler(
    State(state): State<HealthState>,
) -> Result<(StatusCode, Json<Value>), (StatusCode, Json<Value>)> {
    let mut conn = state.queue.store().redis();

    match database::redis::check_health(&mut conn).await {
        Ok(()) => Ok((
            StatusCode::OK,
            Json(json!({
                "status": "ready",
                "checks": {
                    "redis": "ok"
                }
            })),
        )),
        Err(e) => Err((
            StatusCode::SERVICE_UNAVAILABLE,
            Json(json!({
                "status": "not_ready",
                "checks": {
                    "redis": format!("error: {}", e)
                }
            })),
        )),
    }
}

/// Queue info handler for monitoring.
///
/// Returns per-state counts and the paused flag.
pub async fn queue_info_handler(
    State(state): State<HealthState>,
) -> Result<Json<Value>, (StatusCode, Json<Value>)> {
    match state.queue.job_counts().await {
        Ok(counts) => Ok(Json(json!({
            "queue": state.queue.name(),
            "waiting": counts.waiting,
            "delayed": counts.delayed,
            "active": counts.active,
            "completed": counts.completed,
            "failed": counts.failed,
            "paused": counts.paused,
        }))),
        Err(e) => Err((
            StatusCode::INTERNAL_SERVER_ERROR,
            Json(json!({
                "error": format!("Failed to get queue info: {}", e)
            })),
        )),
    }
}

/// Prometheus metrics endpoint handler.
///
/// Returns metrics in Prometheus text format for scraping.
pub async fn metrics_handler() -> impl IntoResponse {
    match metrics::prometheus_handle() {
        Some(handle) => {
            let metrics_output = handle.render();
            (
                StatusCode::OK,
                [(header::CONTENT_TYPE, "text/plain; charset=utf-8")],
                metrics_output,
            )
                .into_response()
        }
        None => (
            StatusCode::SERVICE_UNAVAILABLE,
            [(header::CONTENT_TYPE, "text/plain; charset=utf-8")],
            "Metrics not initialized. Call metrics::init_metrics() at startup.".to_string(),
        )
            .into_response(),
    }
}

/// Router with every health endpoint wired up.
pub fn health_router(state: HealthState) -> Router {
    Router::new()
        .route("/health", get(health_handler))
        .route("/healthz", get(health_handler))
        .route("/ready", get(ready_handler))
        .route("/readyz", get(ready_handler))
        .route("/queue/info", get(queue_info_handler))
        .route("/metrics", get(metrics_handler))
        .with_state(state)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_health_response_serialize() {
        let response = HealthResponse {
            status: "healthy",
            name: "queue-admin".to_string(),
            version: "0.1.0".to_string(),
        };
        let value = serde_json::to_value(&response).unwrap();
        assert_eq!(value["status"], "healthy");
        assert_eq!(value["name"], "queue-admin");
    }
}
