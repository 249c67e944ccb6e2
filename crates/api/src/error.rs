use axum::{
    http::StatusCode,
    response::{IntoResponse, Response},
    Json,
};
use coordinator_core::CoordinatorError;
use serde_json::json;
use tracing::error;

#[derive(Debug, thiserror::Error)]
pub enum ApiError {
    #[error("{0}")]
    Coordinator(#[from] CoordinatorError),

    #[error("请求参数错误: {0}")]
    BadRequest(String),

    #[error("未找到资源: {0}")]
    NotFound(String),

    #[error("禁止访问: {0}")]
    Forbidden(String),

    #[error("内部服务器错误: {0}")]
    Internal(String),
}

impl ApiError {
    fn status_and_code(&self) -> (StatusCode, &'static str) {
        match self {
            ApiError::Coordinator(err) => {
                let status = match err {
                    CoordinatorError::UnknownTask { .. }
                    | CoordinatorError::UnknownWorker { .. }
                    | CoordinatorError::UnknownMessage { .. } => {
                        StatusCode::NOT_FOUND
                    }
                    CoordinatorError::Validation(_)
                    | CoordinatorError::InvalidDependencyGraph(_)
                    | CoordinatorError::Serialization(_) => StatusCode::BAD_REQUEST,
                    CoordinatorError::DuplicateIdentity { .. }
                    | CoordinatorError::AlreadyTerminal { .. }
                    | CoordinatorError::StaleReport { .. }
                    | CoordinatorError::InvalidStateTransition { .. } => StatusCode::CONFLICT,
                    _ => StatusCode::INTERNAL_SERVER_ERROR,
                };
                (status, err.kind())
            }
            ApiError::BadRequest(_) => (StatusCode::BAD_REQUEST, "BAD_REQUEST"),
            ApiError::NotFound(_) => (StatusCode::NOT_FOUND, "NOT_FOUND"),
            ApiError::Forbidden(_) => (StatusCode::FORBIDDEN, "FORBIDDEN"),
            ApiError::Internal(_) => (StatusCode::INTERNAL_SERVER_ERROR, "INTERNAL_ERROR"),
        }
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let (status, code) = self.status_and_code();
        if status.is_server_error() {
            error!("请求处理失败: {}", self);
        }

        let body = Json(json!({
            "success": false,
            "error": {
                "code": code,
                "message": self.to_string(),
            },
            "timestamp": chrono::Utc::now().to_rfc3339(),
        }));

        (status, body).into_response()
    }
}

pub type ApiResult<T> = Result<T, ApiError>;
