use axum::{
    routing::{get, post},
    Router,
};
use std::sync::Arc;

use coordinator_core::MessageBus;
use coordinator_dispatcher::TaskDispatcher;
use metrics_exporter_prometheus::PrometheusHandle;

use crate::handlers::{
    health::health_check,
    messages::{ack_message, get_message_status, poll_mailbox},
    system::{get_system_stats, render_metrics},
    tasks::{
        acknowledge_cancel, cancel_task, get_task, list_tasks, report_complete, report_failed,
        report_progress, submit_task,
    },
    workers::{
        deregister_worker, get_worker, heartbeat, list_workers, poll_worker_messages, register_worker,
    },
};

#[derive(Clone)]
pub struct AppState {
    pub dispatcher: Arc<TaskDispatcher>,
    pub bus: Arc<dyn MessageBus>,
    pub metrics_handle: Option<PrometheusHandle>,
}

pub fn create_routes(state: AppState) -> Router {
    Router::new()
        // 健康检查与指标
        .route("/health", get(health_check))
        .route("/metrics", get(render_metrics))
        // 任务
        .route("/api/tasks", get(list_tasks).post(submit_task))
        .route("/api/tasks/{id}", get(get_task))
        .route("/api/tasks/{id}/cancel", post(cancel_task))
        .route("/api/tasks/{id}/cancel-ack", post(acknowledge_cancel))
        .route("/api/tasks/{id}/progress", post(report_progress))
        .route("/api/tasks/{id}/complete", post(report_complete))
        .route("/api/tasks/{id}/fail", post(report_failed))
        // Worker
        .route("/api/workers", get(list_workers).post(register_worker))
        .route("/api/workers/{id}", get(get_worker))
        .route("/api/workers/{id}/heartbeat", post(heartbeat))
        .route("/api/workers/{id}/deregister", post(deregister_worker))
        .route("/api/workers/{id}/messages", get(poll_worker_messages))
        // 邮箱
        .route("/api/mailboxes/{recipient}/messages", get(poll_mailbox))
        .route("/api/messages/{id}", get(get_message_status))
        .route("/api/messages/{id}/ack", post(ack_message))
        // 系统
        .route("/api/system/stats", get(get_system_stats))
        .with_state(state)
}
