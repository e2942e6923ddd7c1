//! Webhook registration handlers

use axum::{
    extract::{Path, State},
    http::StatusCode,
    Json,
};
use clinicomm_core::RegisterWebhook;
use clinicomm_storage::models::WebhookRegistration;
use serde::Serialize;
use std::sync::Arc;
use uuid::Uuid;

use crate::auth::AppState;
use crate::error::ApiResult;

/// Creation response; the only time the secret is returned
#[derive(Debug, Serialize)]
pub struct CreatedWebhook {
    #[serde(flatten)]
    pub webhook: WebhookRegistration,
    pub secret: String,
}

pub async fn list_webhooks(
    State(state): State<Arc<AppState>>,
) -> ApiResult<Json<Vec<WebhookRegistration>>> {
    Ok(Json(state.webhooks.list().await?))
}

pub async fn create_webhook(
    State(state): State<Arc<AppState>>,
    Json(input): Json<RegisterWebhook>,
) -> ApiResult<(StatusCode, Json<CreatedWebhook>)> {
    let webhook = state.webhooks.register(input).await?;
    let secret = webhook.secret.clone();
    Ok((StatusCode::CREATED, Json(CreatedWebhook { webhook, secret })))
}

pub async fn delete_webhook(
    State(state): State<Arc<AppState>>,
    Path(id): Path<Uuid>,
) -> ApiResult<StatusCode> {
    state.webhooks.delete(id).await?;
    Ok(StatusCode::NO_CONTENT)
}

pub async fn activate_webhook(
    State(state): State<Arc<AppState>>,
    Path(id): Path<Uuid>,
) -> ApiResult<StatusCode> {
    state.webhooks.set_active(id, true).await?;
    Ok(StatusCode::NO_CONTENT)
}

pub async fn deactivate_webhook(
    State(state): State<Arc<AppState>>,
    Path(id): Path<Uuid>,
) -> ApiResult<StatusCode> {
    state.webhooks.set_active(id, false).await?;
    Ok(StatusCode::NO_CONTENT)
}
