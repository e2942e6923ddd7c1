//! Prometheus exposition

use axum::{extract::State, http::header, response::IntoResponse};
use std::sync::Arc;

use crate::auth::AppState;
use crate::error::ApiResult;

pub async fn metrics(State(state): State<Arc<AppState>>) -> ApiResult<impl IntoResponse> {
    state.metrics.set_pending(state.scheduler.pending_len());
    let body = state.metrics.render()?;
    Ok((
        [(header::CONTENT_TYPE, "text/plain; version=0.0.4")],
        body,
    ))
}
