//! Notification status lookup.

use axum::extract::{Path, State};
use axum::routing::get;
use axum::{Json, Router};
use uuid::Uuid;

use relay_common::error::AppError;
use relay_common::types::Notification;

use crate::middleware::auth::AuthService;
use crate::state::AppState;

pub fn router() -> Router<AppState> {
    Router::new().route("/api/notifications/{id}", get(get_notification))
}

/// GET /api/notifications/:id — A notification owned by the calling service.
async fn get_notification(
    State(state): State<AppState>,
    auth: AuthService,
    Path(id): Path<Uuid>,
) -> Result<Json<Notification>, AppError> {
    let notification = state
        .ledger
        .get_by_id(id)
        .await?
        .ok_or_else(|| AppError::NotFound(format!("Notification {} not found", id)))?;

    if notification.service_id != auth.service_id {
        tracing::warn!(
            notification_id = %id,
            service_id = %auth.service_id,
            "Service requested another service's notification"
        );
        return Err(AppError::Forbidden(
            "Notification belongs to another service".to_string(),
        ));
    }

    Ok(Json(notification))
}
