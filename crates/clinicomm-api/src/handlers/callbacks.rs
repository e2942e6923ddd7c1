//! Provider status callbacks

use axum::{
    extract::{Path, State},
    Json,
};
use clinicomm_common::{Channel, Error};
use clinicomm_core::ProviderCallback;
use clinicomm_storage::models::DeliveryStatus;
use serde::Serialize;
use std::sync::Arc;
use tracing::debug;
use uuid::Uuid;

use crate::auth::AppState;
use crate::error::ApiResult;

#[derive(Debug, Serialize)]
pub struct CallbackResponse {
    pub applied: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub message_id: Option<Uuid>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub status: Option<DeliveryStatus>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub reason: Option<String>,
}

/// Apply a provider callback.
///
/// Late or repeated events that no longer fit the message status are
/// acknowledged with `applied: false` so providers stop redelivering them.
pub async fn provider_callback(
    State(state): State<Arc<AppState>>,
    Path(channel): Path<Channel>,
    Json(callback): Json<ProviderCallback>,
) -> ApiResult<Json<CallbackResponse>> {
    match state.tracker.record(channel, &callback).await {
        Ok(message) => Ok(Json(CallbackResponse {
            applied: true,
            message_id: Some(message.id),
            status: Some(message.status),
            reason: None,
        })),
        Err(Error::InvalidTransition(reason)) => {
            debug!(tracking_id = %callback.tracking_id, %reason, "Callback ignored");
            Ok(Json(CallbackResponse {
                applied: false,
                message_id: None,
                status: None,
                reason: Some(reason),
            }))
        }
        Err(e) => Err(e.into()),
    }
}
