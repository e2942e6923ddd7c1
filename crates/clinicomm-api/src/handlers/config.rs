//! Delivery settings handlers

use axum::{extract::State, Json};
use clinicomm_common::DeliveryConfig;
use clinicomm_core::ChannelCheck;
use std::sync::Arc;

use crate::auth::AppState;
use crate::error::ApiResult;

pub async fn get_config(State(state): State<Arc<AppState>>) -> Json<DeliveryConfig> {
    Json((*state.settings.snapshot()).clone())
}

pub async fn update_config(
    State(state): State<Arc<AppState>>,
    Json(config): Json<DeliveryConfig>,
) -> ApiResult<Json<DeliveryConfig>> {
    let snapshot = state.settings.update(config).await?;
    Ok(Json((*snapshot).clone()))
}

/// One verdict per channel
pub async fn test_config(State(state): State<Arc<AppState>>) -> Json<Vec<ChannelCheck>> {
    Json(state.settings.test_channels(&state.adapters).await)
}
