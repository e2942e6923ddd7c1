//! Domain event trigger handler

use axum::{extract::State, Json};
use chrono::Utc;
use clinicomm_core::{TriggerReport, TriggerRequest};
use std::sync::Arc;

use crate::auth::AppState;
use crate::error::ApiResult;

/// Fire a domain event and report what was scheduled
pub async fn trigger_event(
    State(state): State<Arc<AppState>>,
    Json(request): Json<TriggerRequest>,
) -> ApiResult<Json<TriggerReport>> {
    Ok(Json(state.triggers.fire(request, Utc::now()).await?))
}
