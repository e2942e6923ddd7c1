//! Template handlers

use axum::{
    extract::{Path, Query, State},
    http::StatusCode,
    Json,
};
use clinicomm_common::types::ClinicianId;
use clinicomm_common::Channel;
use clinicomm_core::{CreateTemplate, UpdateTemplate};
use clinicomm_storage::models::{EventCategory, Template};
use clinicomm_storage::repository::TemplateFilter;
use serde::Deserialize;
use std::sync::Arc;
use uuid::Uuid;

use crate::auth::AppState;
use crate::error::ApiResult;

/// Query parameters for listing templates
#[derive(Debug, Clone, Deserialize)]
pub struct ListTemplatesQuery {
    pub owner_id: Option<ClinicianId>,
    pub channel: Option<Channel>,
    pub category: Option<EventCategory>,
    #[serde(default)]
    pub active_only: bool,
}

pub async fn list_templates(
    State(state): State<Arc<AppState>>,
    Query(query): Query<ListTemplatesQuery>,
) -> ApiResult<Json<Vec<Template>>> {
    let filter = TemplateFilter {
        owner_id: query.owner_id,
        channel: query.channel,
        category: query.category,
        active_only: query.active_only,
    };
    Ok(Json(state.catalog.list(&filter).await?))
}

pub async fn create_template(
    State(state): State<Arc<AppState>>,
    Json(input): Json<CreateTemplate>,
) -> ApiResult<(StatusCode, Json<Template>)> {
    let template = state.catalog.create(input).await?;
    Ok((StatusCode::CREATED, Json(template)))
}

pub async fn get_template(
    State(state): State<Arc<AppState>>,
    Path(id): Path<Uuid>,
) -> ApiResult<Json<Template>> {
    Ok(Json(state.catalog.get(id).await?))
}

pub async fn update_template(
    State(state): State<Arc<AppState>>,
    Path(id): Path<Uuid>,
    Json(input): Json<UpdateTemplate>,
) -> ApiResult<Json<Template>> {
    Ok(Json(state.catalog.update(id, input).await?))
}

pub async fn delete_template(
    State(state): State<Arc<AppState>>,
    Path(id): Path<Uuid>,
) -> ApiResult<StatusCode> {
    state.catalog.delete(id).await?;
    Ok(StatusCode::NO_CONTENT)
}

pub async fn duplicate_template(
    State(state): State<Arc<AppState>>,
    Path(id): Path<Uuid>,
) -> ApiResult<(StatusCode, Json<Template>)> {
    let copy = state.catalog.duplicate(id).await?;
    Ok((StatusCode::CREATED, Json(copy)))
}

pub async fn set_default_template(
    State(state): State<Arc<AppState>>,
    Path(id): Path<Uuid>,
) -> ApiResult<Json<Template>> {
    Ok(Json(state.catalog.set_default(id).await?))
}
