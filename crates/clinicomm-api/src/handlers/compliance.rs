//! Opt-out list and unsubscribe link handlers

use axum::{
    extract::{Path, Query, State},
    http::StatusCode,
    response::Html,
    Json,
};
use clinicomm_storage::models::ComplianceEntry;
use serde::Deserialize;
use std::sync::Arc;
use tracing::warn;

use crate::auth::AppState;
use crate::error::ApiResult;

#[derive(Debug, Clone, Deserialize)]
pub struct ListOptOutsQuery {
    #[serde(default = "default_limit")]
    pub limit: i64,
    #[serde(default)]
    pub offset: i64,
}

fn default_limit() -> i64 {
    100
}

/// Request body for recording an opt-out
#[derive(Debug, Clone, Deserialize)]
pub struct OptOutRequest {
    pub address: String,
    #[serde(default)]
    pub reason: Option<String>,
    #[serde(default = "default_source")]
    pub source: String,
}

fn default_source() -> String {
    "api".to_string()
}

pub async fn list_opt_outs(
    State(state): State<Arc<AppState>>,
    Query(query): Query<ListOptOutsQuery>,
) -> ApiResult<Json<Vec<ComplianceEntry>>> {
    let entries = state
        .compliance
        .list(query.limit.clamp(1, 1000), query.offset.max(0))
        .await?;
    Ok(Json(entries))
}

pub async fn create_opt_out(
    State(state): State<Arc<AppState>>,
    Json(request): Json<OptOutRequest>,
) -> ApiResult<(StatusCode, Json<ComplianceEntry>)> {
    let country_code = state.settings.snapshot().default_country_code.clone();
    let entry = state
        .compliance
        .opt_out(
            &request.address,
            request.reason.as_deref(),
            &request.source,
            &country_code,
        )
        .await?;
    Ok((StatusCode::CREATED, Json(entry)))
}

/// Re-subscribe an address
pub async fn delete_opt_out(
    State(state): State<Arc<AppState>>,
    Path(address): Path<String>,
) -> ApiResult<StatusCode> {
    let country_code = state.settings.snapshot().default_country_code.clone();
    state.compliance.opt_in(&address, &country_code).await?;
    Ok(StatusCode::NO_CONTENT)
}

const UNSUBSCRIBED_PAGE: &str = "<!DOCTYPE html><html lang=\"pt-BR\"><head><meta charset=\"utf-8\">\
<title>Inscrição cancelada</title></head><body><h1>Inscrição cancelada</h1>\
<p>Você não receberá mais mensagens neste endereço.</p></body></html>";

const INVALID_LINK_PAGE: &str = "<!DOCTYPE html><html lang=\"pt-BR\"><head><meta charset=\"utf-8\">\
<title>Link inválido</title></head><body><h1>Link inválido</h1>\
<p>Este link de cancelamento não é válido.</p></body></html>";

/// One-click unsubscribe from the signed email link
pub async fn unsubscribe(
    State(state): State<Arc<AppState>>,
    Path(token): Path<String>,
) -> ApiResult<(StatusCode, Html<&'static str>)> {
    let Some(address) = state
        .unsubscribe
        .as_ref()
        .and_then(|links| links.verify(&token))
    else {
        warn!("Rejected unsubscribe token");
        return Ok((StatusCode::NOT_FOUND, Html(INVALID_LINK_PAGE)));
    };

    let country_code = state.settings.snapshot().default_country_code.clone();
    state
        .compliance
        .opt_out(&address, None, "unsubscribe_link", &country_code)
        .await?;

    Ok((StatusCode::OK, Html(UNSUBSCRIBED_PAGE)))
}
