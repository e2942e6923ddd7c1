//! Analytics handlers

use axum::{
    extract::{Query, State},
    Json,
};
use chrono::{DateTime, Utc};
use clinicomm_core::{AnalyticsWindow, DailyPoint};
use serde::Deserialize;
use std::sync::Arc;

use crate::auth::AppState;
use crate::error::ApiResult;

/// Period by scheduled time, `[start, end)`
#[derive(Debug, Clone, Deserialize)]
pub struct PeriodQuery {
    pub start: DateTime<Utc>,
    pub end: DateTime<Utc>,
}

pub async fn get_analytics(
    State(state): State<Arc<AppState>>,
    Query(period): Query<PeriodQuery>,
) -> ApiResult<Json<AnalyticsWindow>> {
    Ok(Json(state.analytics.window(period.start, period.end).await?))
}

pub async fn get_analytics_series(
    State(state): State<Arc<AppState>>,
    Query(period): Query<PeriodQuery>,
) -> ApiResult<Json<Vec<DailyPoint>>> {
    Ok(Json(state.analytics.series(period.start, period.end).await?))
}
