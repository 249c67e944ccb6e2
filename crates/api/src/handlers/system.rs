use axum::{
    extract::State,
    http::{header, StatusCode},
    response::IntoResponse,
};

use crate::{
    error::{ApiError, ApiResult},
    response::success,
    routes::AppState,
};

pub async fn get_system_stats(State(state): State<AppState>) -> ApiResult<impl IntoResponse> {
    let stats = state.dispatcher.system_stats().await;
    Ok(success(stats))
}

/// Prometheus文本格式的指标
pub async fn render_metrics(State(state): State<AppState>) -> ApiResult<impl IntoResponse> {
    let handle = state
        .metrics_handle
        .as_ref()
        .ok_or_else(|| ApiError::NotFound("metrics exporter is disabled".to_string()))?;

    Ok((
        StatusCode::OK,
        [(header::CONTENT_TYPE, "text/plain; version=0.0.4")],
        handle.render(),
    ))
}
