//! # Coordinator API
//!
//! 协调核心的HTTP接口，基于Axum构建。
//!
//! ## API 端点
//!
//! ### 任务
//! - `POST /api/tasks` - 提交任务（可携带子任务）
//! - `GET /api/tasks` - 按状态、Worker、能力、父任务过滤任务列表
//! - `GET /api/tasks/{id}` - 查询任务状态
//! - `POST /api/tasks/{id}/cancel` - 取消任务
//! - `POST /api/tasks/{id}/cancel-ack` - Worker确认取消
//! - `POST /api/tasks/{id}/progress` | `complete` | `fail` - Worker上报
//!
//! ### Worker
//! - `POST /api/workers` - 注册Worker
//! - `GET /api/workers` - Worker列表
//! - `GET /api/workers/{id}` - Worker详情
//! - `POST /api/workers/{id}/heartbeat` - 心跳
//! - `POST /api/workers/{id}/deregister` - 注销
//! - `GET /api/workers/{id}/messages` - 拉取Worker邮箱中的消息
//!
//! ### 邮箱与系统
//! - `GET /api/mailboxes/{recipient}/messages` - 拉取任意邮箱（如 `escalations`）
//! - `POST /api/messages/{id}/ack` - 确认消息
//! - `GET /api/system/stats` - 系统统计
//! - `GET /health`、`GET /metrics`

pub mod error;
pub mod handlers;
pub mod middleware;
pub mod response;
pub mod routes;

use axum::Router;
use tower::ServiceBuilder;

use coordinator_core::ApiConfig;
use middleware::{cors_layer, request_logging, timeout_layer, trace_layer};
pub use routes::{create_routes, AppState};

/// 创建完整的API应用
pub fn create_app(state: AppState, api_config: &ApiConfig) -> Router {
    let router = create_routes(state);
    let router = if api_config.cors_enabled {
        router.layer(cors_layer(&api_config.cors_origins))
    } else {
        router
    };

    router.layer(
        ServiceBuilder::new()
            .layer(trace_layer())
            .layer(timeout_layer(api_config.request_timeout_seconds))
            .layer(axum::middleware::from_fn(request_logging)),
    )
}
