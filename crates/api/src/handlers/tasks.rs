use axum::{
    extract::{Path, Query, State},
    response::IntoResponse,
    Json,
};
use serde::Deserialize;
use serde_json::json;
use tracing::info;

use coordinator_core::{TaskFilter, TaskState, TaskSubmission};

use crate::{
    error::{ApiError, ApiResult},
    response::{created, success},
    routes::AppState,
};

#[derive(Debug, Deserialize)]
pub struct TaskQueryParams {
    pub state: Option<String>,
    pub worker_id: Option<String>,
    pub capability: Option<String>,
    pub parent_id: Option<String>,
    pub limit: Option<usize>,
}

#[derive(Debug, Deserialize)]
pub struct WorkerRef {
    pub worker_id: String,
}

#[derive(Debug, Deserialize)]
pub struct ProgressRequest {
    pub worker_id: String,
    #[serde(default)]
    pub note: Option<String>,
}

#[derive(Debug, Deserialize)]
pub struct CompleteRequest {
    pub worker_id: String,
    #[serde(default)]
    pub result: serde_json::Value,
}

#[derive(Debug, Deserialize)]
pub struct FailRequest {
    pub worker_id: String,
    pub error: String,
}

pub async fn submit_task(
    State(state): State<AppState>,
    Json(submission): Json<TaskSubmission>,
) -> ApiResult<impl IntoResponse> {
    let task_id = state.dispatcher.submit_task(submission).await?;
    let children = state.dispatcher.get_task_status(&task_id).await?.children;
    info!("通过API提交任务 {}", task_id);
    Ok(created(json!({ "task_id": task_id, "children": children })))
}

pub async fn list_tasks(
    State(state): State<AppState>,
    Query(params): Query<TaskQueryParams>,
) -> ApiResult<impl IntoResponse> {
    let state_filter = params
        .state
        .as_deref()
        .map(str::parse::<TaskState>)
        .transpose()
        .map_err(|e| ApiError::BadRequest(e.to_string()))?;

    let filter = TaskFilter {
        state: state_filter,
        worker_id: params.worker_id,
        capability: params.capability,
        parent_id: params.parent_id,
        limit: params.limit,
    };
    let tasks = state.dispatcher.list_tasks(&filter).await;
    Ok(success(tasks))
}

pub async fn get_task(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> ApiResult<impl IntoResponse> {
    Ok(success(state.dispatcher.get_task_status(&id).await?))
}

pub async fn cancel_task(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> ApiResult<impl IntoResponse> {
    Ok(success(state.dispatcher.cancel_task(&id).await?))
}

pub async fn acknowledge_cancel(
    State(state): State<AppState>,
    Path(id): Path<String>,
    Json(request): Json<WorkerRef>,
) -> ApiResult<impl IntoResponse> {
    let status = state
        .dispatcher
        .acknowledge_cancel(&id, &request.worker_id)
        .await?;
    Ok(success(status))
}

pub async fn report_progress(
    State(state): State<AppState>,
    Path(id): Path<String>,
    Json(request): Json<ProgressRequest>,
) -> ApiResult<impl IntoResponse> {
    let status = state
        .dispatcher
        .report_progress(&id, &request.worker_id, request.note)
        .await?;
    Ok(success(status))
}

pub async fn report_complete(
    State(state): State<AppState>,
    Path(id): Path<String>,
    Json(request): Json<CompleteRequest>,
) -> ApiResult<impl IntoResponse> {
    let status = state
        .dispatcher
        .report_complete(&id, &request.worker_id, request.result)
        .await?;
    Ok(success(status))
}

pub async fn report_failed(
    State(state): State<AppState>,
    Path(id): Path<String>,
    Json(request): Json<FailRequest>,
) -> ApiResult<impl IntoResponse> {
    let status = state
        .dispatcher
        .report_failed(&id, &request.worker_id, request.error)
        .await?;
    Ok(success(status))
}
