//! Message handlers

use axum::{
    extract::{Path, Query, State},
    http::StatusCode,
    Json,
};
use clinicomm_common::{Channel, Error};
use clinicomm_core::{compose, MessageRequest, ScheduleOutcome};
use clinicomm_storage::models::{DeliveryStatus, Message};
use clinicomm_storage::repository::MessageFilter;
use serde::Deserialize;
use std::sync::Arc;
use uuid::Uuid;

use crate::auth::AppState;
use crate::error::{ApiError, ApiResult};

/// Query parameters for listing messages
#[derive(Debug, Clone, Deserialize)]
pub struct ListMessagesQuery {
    pub status: Option<DeliveryStatus>,
    pub channel: Option<Channel>,
    pub entity_id: Option<String>,
    #[serde(default = "default_limit")]
    pub limit: i64,
    #[serde(default)]
    pub offset: i64,
}

fn default_limit() -> i64 {
    50
}

/// Schedule a message directly.
///
/// A message rejected at scheduling (opted out, invalid address, disabled
/// channel) is still stored and returned with its failure reason.
pub async fn create_message(
    State(state): State<Arc<AppState>>,
    Json(request): Json<MessageRequest>,
) -> ApiResult<(StatusCode, Json<Message>)> {
    let draft = compose(request, &state.catalog).await?;

    match state.scheduler.schedule(draft).await? {
        ScheduleOutcome::Scheduled(message) | ScheduleOutcome::Failed(message) => {
            Ok((StatusCode::CREATED, Json(message)))
        }
        ScheduleOutcome::Duplicate(message) => Ok((StatusCode::OK, Json(message))),
    }
}

pub async fn list_messages(
    State(state): State<Arc<AppState>>,
    Query(query): Query<ListMessagesQuery>,
) -> ApiResult<Json<Vec<Message>>> {
    let filter = MessageFilter {
        status: query.status,
        channel: query.channel,
        trigger_entity_id: query.entity_id,
    };

    let messages = state
        .messages
        .list(&filter, query.limit.clamp(1, 500), query.offset.max(0))
        .await
        .map_err(|e| Error::Database(e.to_string()))?;

    Ok(Json(messages))
}

pub async fn get_message(
    State(state): State<Arc<AppState>>,
    Path(id): Path<Uuid>,
) -> ApiResult<Json<Message>> {
    state
        .messages
        .get(id)
        .await
        .map_err(|e| Error::Database(e.to_string()))?
        .map(Json)
        .ok_or_else(|| ApiError(Error::NotFound(format!("Message {} not found", id))))
}

pub async fn cancel_message(
    State(state): State<Arc<AppState>>,
    Path(id): Path<Uuid>,
) -> ApiResult<Json<Message>> {
    Ok(Json(state.scheduler.cancel(id).await?))
}
