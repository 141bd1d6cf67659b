//! Inbound provider delivery receipts.

use axum::extract::State;
use axum::routing::post;
use axum::{Json, Router};
use serde_json::json;

use relay_common::error::AppError;
use relay_engine::receipts::{DeliveryReceipt, ReceiptOutcome};

use crate::middleware::auth::ReceiptKey;
use crate::state::AppState;

pub fn router() -> Router<AppState> {
    Router::new().route("/api/receipts", post(post_receipt))
}

/// POST /api/receipts — Apply a provider's status report.
///
/// Unknown references answer 404 so the provider retries later.
async fn post_receipt(
    State(state): State<AppState>,
    _key: ReceiptKey,
    Json(receipt): Json<DeliveryReceipt>,
) -> Result<Json<serde_json::Value>, AppError> {
    if receipt.reference.trim().is_empty() {
        return Err(AppError::Validation("reference must not be empty".to_string()));
    }

    let reference = receipt.reference.clone();
    let body = match state.receipts.process(receipt).await? {
        ReceiptOutcome::Applied {
            notification,
            callback_queued,
        } => json!({
            "id": notification.id,
            "status": notification.status,
            "applied": true,
            "callback_queued": callback_queued
        }),
        ReceiptOutcome::Unchanged { current } => {
            tracing::debug!(reference = %reference, status = %current, "Receipt left status unchanged");
            json!({
                "status": current,
                "applied": false,
                "callback_queued": false
            })
        }
    };

    Ok(Json(body))
}
