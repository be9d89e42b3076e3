//! Health check endpoint for load balancers and monitoring.
//!
//! Returns 200 OK if the backing store answers PING, 503 otherwise. The most
//! recent premium expiry report is included when one exists.

use axum::{Json, Router, extract::State, http::StatusCode, response::IntoResponse, routing::get};
use matrimony_store::services::ExpiryReport;
use serde::Serialize;

use crate::state::AppState;

pub fn router() -> Router<AppState> {
    Router::new().route("/", get(health_check))
}

#[derive(Serialize)]
struct HealthResponse {
    status: &'static str,
    redis: bool,
    last_expiry_run: Option<ExpiryReport>,
}

async fn health_check(State(state): State<AppState>) -> impl IntoResponse {
    let redis_ok = state.kv.ping().await.unwrap_or_else(|err| {
        tracing::warn!(error = %err, "health check ping failed");
        false
    });
    let last_expiry_run = state.last_expiry_run.read().await.clone();

    let response = HealthResponse {
        status: if redis_ok { "ok" } else { "unhealthy" },
        redis: redis_ok,
        last_expiry_run,
    };

    let status = if redis_ok {
        StatusCode::OK
    } else {
        StatusCode::SERVICE_UNAVAILABLE
    };

    (status, Json(response))
}
