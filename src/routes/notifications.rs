use std::sync::Arc;

use axum::{
    extract::{rejection::JsonRejection, Path, State},
    http::StatusCode,
    routing::{get, post},
    Json, Router,
};
use uuid::Uuid;

use crate::db::{CreateNotificationRequest, Notification};
use crate::error::{AppError, AppResult};
use crate::AppState;

pub fn router() -> Router<Arc<AppState>> {
    Router::new()
        .route("/", post(create_notification))
        .route("/users/:user_id", get(list_user_notifications))
        .route("/:id", get(get_notification))
}

// ============================================================================
// Handlers
// ============================================================================

/// Create a notification and queue it for delivery
async fn create_notification(
    State(state): State<Arc<AppState>>,
    payload: Result<Json<CreateNotificationRequest>, JsonRejection>,
) -> AppResult<(StatusCode, Json<Notification>)> {
    let Json(request) = payload.map_err(|e| AppError::Validation(e.body_text()))?;

    let notification = state.notifications.create(request).await?;
    Ok((StatusCode::CREATED, Json(notification)))
}

/// List a user's notifications, oldest first
async fn list_user_notifications(
    State(state): State<Arc<AppState>>,
    Path(user_id): Path<String>,
) -> Json<Vec<Notification>> {
    Json(state.notifications.list_for_user(&user_id).await)
}

async fn get_notification(
    State(state): State<Arc<AppState>>,
    Path(id): Path<String>,
) -> AppResult<Json<Notification>> {
    let id = Uuid::parse_str(&id)
        .map_err(|_| AppError::NotFound(format!("notification {}", id)))?;
    Ok(Json(state.notifications.get(id).await?))
}
