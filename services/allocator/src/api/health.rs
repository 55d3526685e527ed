//! Health check endpoints.

use axum::{extract::State, http::StatusCode, response::IntoResponse, routing::get, Json, Router};
use chrono::Utc;
use serde::Serialize;

use crate::state::AppState;

const SERVICE: &str = "rackalloc-allocator";

/// Health check response.
#[derive(Debug, Serialize)]
#[cfg_attr(test, derive(serde::Deserialize))]
pub struct HealthResponse {
    /// Service status: "ok" or "degraded".
    pub status: String,

    pub service: String,

    pub version: String,

    /// Current timestamp (ISO 8601).
    pub timestamp: String,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub rack: Option<RackHealth>,
}

/// Engine counters reported by the readiness probe.
#[derive(Debug, Serialize)]
#[cfg_attr(test, derive(serde::Deserialize))]
pub struct RackHealth {
    pub hosts: usize,
    pub free_hosts: usize,
    pub active_allocations: usize,
}

/// Create health check routes.
pub fn routes() -> Router<AppState> {
    Router::new()
        .route("/healthz", get(healthz))
        .route("/readyz", get(readyz))
        .route("/livez", get(livez))
}

fn response(status: &str, rack: Option<RackHealth>) -> HealthResponse {
    HealthResponse {
        status: status.to_string(),
        service: SERVICE.to_string(),
        version: env!("CARGO_PKG_VERSION").to_string(),
        timestamp: Utc::now().to_rfc3339(),
        rack,
    }
}

/// Is the process up? Does not touch the engine.
async fn healthz() -> impl IntoResponse {
    Json(response("ok", None))
}

/// Ready once the rack inventory is loaded. An empty rack can never satisfy
/// an allocation, so it reports 503.
async fn readyz(State(state): State<AppState>) -> impl IntoResponse {
    let rack = state
        .with_engine(|engine, _| RackHealth {
            hosts: engine.hosts().len(),
            free_hosts: engine.pool().len(),
            active_allocations: engine.allocations().active_count(),
        })
        .await;

    if rack.hosts > 0 {
        (StatusCode::OK, Json(response("ok", Some(rack))))
    } else {
        (
            StatusCode::SERVICE_UNAVAILABLE,
            Json(response("degraded", Some(rack))),
        )
    }
}

async fn livez() -> impl IntoResponse {
    StatusCode::OK
}
