use std::sync::Arc;

use axum::{
    extract::{Path, State},
    http::StatusCode,
    routing::{delete, post},
    Json, Router,
};

use crate::db::models::{CreateWebhook, WebhookSubscription};
use crate::error::{AppError, AppResult};
use crate::AppState;

pub fn router() -> Router<Arc<AppState>> {
    Router::new()
        .route("/", post(register_webhook).get(list_webhooks))
        .route("/:id", delete(unregister_webhook))
}

async fn register_webhook(
    State(state): State<Arc<AppState>>,
    Json(request): Json<CreateWebhook>,
) -> AppResult<(StatusCode, Json<WebhookSubscription>)> {
    if url::Url::parse(&request.url).is_err() {
        return Err(AppError::Validation(format!(
            "invalid webhook url: {}",
            request.url
        )));
    }
    if request.secret.is_empty() {
        return Err(AppError::Validation("secret must not be empty".to_string()));
    }
    let subscription = state.webhooks.register(request).await?;
    Ok((StatusCode::CREATED, Json(subscription)))
}

async fn list_webhooks(
    State(state): State<Arc<AppState>>,
) -> AppResult<Json<Vec<WebhookSubscription>>> {
    Ok(Json(state.webhooks.list().await?))
}

async fn unregister_webhook(
    State(state): State<Arc<AppState>>,
    Path(id): Path<String>,
) -> AppResult<StatusCode> {
    if state.webhooks.unregister(&id).await? {
        Ok(StatusCode::NO_CONTENT)
    } else {
        Err(AppError::NotFound(format!("webhook {}", id)))
    }
}
