use std::sync::Arc;

use axum::{extract::State, http::StatusCode, response::IntoResponse, Json};
use serde::Serialize;

use crate::AppState;

#[derive(Serialize)]
pub struct HealthResponse {
    pub status: String,
    pub version: String,
    pub timestamp: String,
}

/// Liveness plus store reachability. A store outage degrades the status
/// (claims halt, no data loss) but never terminates the process.
pub async fn health_check(State(state): State<Arc<AppState>>) -> impl IntoResponse {
    let store_ok = sqlx::query("SELECT 1").execute(&state.db).await.is_ok();

    let (code, status) = if store_ok {
        (StatusCode::OK, "healthy")
    } else {
        (StatusCode::SERVICE_UNAVAILABLE, "degraded")
    };

    let response = HealthResponse {
        status: status.to_string(),
        version: env!("CARGO_PKG_VERSION").to_string(),
        timestamp: chrono::Utc::now().to_rfc3339(),
    };

    (code, Json(response))
}
