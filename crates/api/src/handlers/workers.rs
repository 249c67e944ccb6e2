use axum::{
    extract::{Path, Query, State},
    response::IntoResponse,
    Json,
};
use serde::Deserialize;
use serde_json::json;

use coordinator_core::{WorkerFilter, WorkerHeartbeat, WorkerRegistration, WorkerStatus};

use crate::{
    error::{ApiError, ApiResult},
    handlers::messages::{consume, ensure_not_core_inbox, MailboxQuery},
    response::{created, success, success_with_message},
    routes::AppState,
};

#[derive(Debug, Deserialize)]
pub struct WorkerQueryParams {
    pub status: Option<String>,
    pub role: Option<String>,
    pub capability: Option<String>,
}

#[derive(Debug, Deserialize)]
pub struct HeartbeatRequest {
    pub status: WorkerStatus,
    #[serde(default)]
    pub current_load: u32,
}

pub async fn register_worker(
    State(state): State<AppState>,
    Json(registration): Json<WorkerRegistration>,
) -> ApiResult<impl IntoResponse> {
    let outcome = state.dispatcher.register_worker(registration).await?;
    Ok(created(outcome))
}

pub async fn list_workers(
    State(state): State<AppState>,
    Query(params): Query<WorkerQueryParams>,
) -> ApiResult<impl IntoResponse> {
    let status = params
        .status
        .as_deref()
        .map(str::parse::<WorkerStatus>)
        .transpose()
        .map_err(|e| ApiError::BadRequest(e.to_string()))?;

    let filter = WorkerFilter {
        status,
        role: params.role,
        capability: params.capability,
    };
    Ok(success(state.dispatcher.list_workers(&filter).await))
}

pub async fn get_worker(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> ApiResult<impl IntoResponse> {
    Ok(success(state.dispatcher.get_worker(&id).await?))
}

pub async fn heartbeat(
    State(state): State<AppState>,
    Path(id): Path<String>,
    Json(request): Json<HeartbeatRequest>,
) -> ApiResult<impl IntoResponse> {
    let heartbeat = WorkerHeartbeat::new(id, request.status, request.current_load);
    Ok(success(state.dispatcher.heartbeat(&heartbeat).await?))
}

pub async fn deregister_worker(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> ApiResult<impl IntoResponse> {
    let requeued = state.dispatcher.deregister_worker(&id).await?;
    let message = format!("Worker {} 已注销，{} 个任务重新排队", id, requeued.len());
    Ok(success_with_message(json!({ "requeued_tasks": requeued }), message))
}

/// 拉取Worker邮箱中的消息，Worker处理后应调用确认接口
pub async fn poll_worker_messages(
    State(state): State<AppState>,
    Path(id): Path<String>,
    Query(query): Query<MailboxQuery>,
) -> ApiResult<impl IntoResponse> {
    ensure_not_core_inbox(&state, &id)?;
    state.dispatcher.get_worker(&id).await?;
    Ok(success(consume(&state, &id, &query).await?))
}
