use std::sync::Arc;

use axum::{extract::State, http::StatusCode, response::IntoResponse, Json};
use serde::Serialize;

use crate::services::queue::QueueStats;
use crate::AppState;

#[derive(Serialize)]
pub struct HealthResponse {
    pub status: String,
    pub version: String,
    pub timestamp: String,
    pub queue: QueueHealth,
}

#[derive(Serialize)]
pub struct QueueHealth {
    pub name: String,
    pub transport: String,
    pub connected: bool,
    pub stats: Option<QueueStats>,
}

/// Liveness plus queue lane counts. A queue that is offline degrades the
/// status but never fails the check, since delivery falls back to inline.
pub async fn health_check(State(state): State<Arc<AppState>>) -> impl IntoResponse {
    let connected = state.queue.is_connected();
    let stats = match state.queue.stats().await {
        Ok(stats) => Some(stats),
        Err(e) => {
            tracing::warn!("Failed to read queue stats: {}", e);
            None
        }
    };

    let status = if connected && stats.is_some() {
        "healthy"
    } else {
        "degraded"
    };

    let response = HealthResponse {
        status: status.to_string(),
        version: env!("CARGO_PKG_VERSION").to_string(),
        timestamp: chrono::Utc::now().to_rfc3339(),
        queue: QueueHealth {
            name: state.config.queue.name.clone(),
            transport: state.queue.transport_name().to_string(),
            connected,
            stats,
        },
    };

    (StatusCode::OK, Json(response))
}
