use axum::{extract::State, Json};
use serde_json::{json, Value};

use crate::routes::AppState;

/// 存活探针，附带在线Worker数与待调度任务数
pub async fn health_check(State(state): State<AppState>) -> Json<Value> {
    let stats = state.dispatcher.system_stats().await;
    let pending = stats.tasks_by_state.get("PENDING").copied().unwrap_or(0);

    Json(json!({
        "status": "ok",
        "service": "coordinator",
        "version": env!("CARGO_PKG_VERSION"),
        "workers": stats.workers,
        "pending_tasks": pending,
        "checked_at": stats.timestamp,
    }))
}
