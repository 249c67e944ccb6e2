use thiserror::Error;

/// 协调核心错误类型定义
#[derive(Debug, Error)]
pub enum CoordinatorError {
    #[error("参数校验失败: {0}")]
    Validation(String),

    #[error("Worker未注册: {id}")]
    UnknownWorker { id: String },

    #[error("任务未找到: {id}")]
    UnknownTask { id: String },

    #[error("消息未找到: {id}")]
    UnknownMessage { id: String },

    #[error("Worker标识已被占用: {id}")]
    DuplicateIdentity { id: String },

    #[error("子任务依赖图无效: {0}")]
    InvalidDependencyGraph(String),

    #[error("任务 {id} 已处于终止状态: {state}")]
    AlreadyTerminal { id: String, state: String },

    #[error("任务 {id} 不允许从 {from} 转换到 {to}")]
    InvalidStateTransition {
        id: String,
        from: String,
        to: String,
    },

    #[error("任务 {task_id} 不再由Worker {worker_id} 持有")]
    StaleReport { task_id: String, worker_id: String },

    #[error("任务 {id} 已达到重试上限 ({attempts} 次)")]
    RetryCeilingExceeded { id: String, attempts: u32 },

    #[error("Worker {worker_id} 基础设施故障: {reason}")]
    InfrastructureFailure { worker_id: String, reason: String },

    #[error("任务 {task_id} 等待资源超时 ({waited_seconds} 秒): {keys:?}")]
    LockWaitTimeout {
        task_id: String,
        keys: Vec<String>,
        waited_seconds: i64,
    },

    #[error("消息总线错误: {0}")]
    MessageBus(String),

    #[error("升级通知错误: {0}")]
    Escalation(String),

    #[error("序列化错误: {0}")]
    Serialization(String),

    #[error("配置错误: {0}")]
    Configuration(String),

    #[error("内部错误: {0}")]
    Internal(String),
}

impl CoordinatorError {
    /// 错误类别标识，用于日志与HTTP错误码
    pub fn kind(&self) -> &'static str {
        match self {
            CoordinatorError::Validation(_) => "VALIDATION_ERROR",
            CoordinatorError::UnknownWorker { .. } => "UNKNOWN_WORKER",
            CoordinatorError::UnknownTask { .. } => "UNKNOWN_TASK",
            CoordinatorError::UnknownMessage { .. } => "UNKNOWN_MESSAGE",
            CoordinatorError::DuplicateIdentity { .. } => "DUPLICATE_IDENTITY",
            CoordinatorError::InvalidDependencyGraph(_) => "INVALID_DEPENDENCY_GRAPH",
            CoordinatorError::AlreadyTerminal { .. } => "ALREADY_TERMINAL",
            CoordinatorError::InvalidStateTransition { .. } => "INVALID_STATE_TRANSITION",
            CoordinatorError::StaleReport { .. } => "STALE_REPORT",
            CoordinatorError::RetryCeilingExceeded { .. } => "RETRY_CEILING_EXCEEDED",
            CoordinatorError::InfrastructureFailure { .. } => "INFRASTRUCTURE_FAILURE",
            CoordinatorError::LockWaitTimeout { .. } => "LOCK_WAIT_TIMEOUT",
            CoordinatorError::MessageBus(_) => "MESSAGE_BUS_ERROR",
            CoordinatorError::Escalation(_) => "ESCALATION_ERROR",
            CoordinatorError::Serialization(_) => "SERIALIZATION_ERROR",
            CoordinatorError::Configuration(_) => "CONFIGURATION_ERROR",
            CoordinatorError::Internal(_) => "INTERNAL_ERROR",
        }
    }
}

impl From<serde_json::Error> for CoordinatorError {
    fn from(err: serde_json::Error) -> Self {
        CoordinatorError::Serialization(err.to_string())
    }
}

/// 统一的Result类型
pub type CoordinatorResult<T> = std::result::Result<T, CoordinatorError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_display_contains_identifiers() {
        let err = CoordinatorError::UnknownTask {
            id: "task-1".to_string(),
        };
        assert!(err.to_string().contains("task-1"));
        assert_eq!(err.kind(), "UNKNOWN_TASK");

        let err = CoordinatorError::LockWaitTimeout {
            task_id: "task-2".to_string(),
            keys: vec!["branch:main".to_string()],
            waited_seconds: 700,
        };
        assert!(err.to_string().contains("branch:main"));
        assert_eq!(err.kind(), "LOCK_WAIT_TIMEOUT");
    }

    #[test]
    fn test_serde_error_conversion() {
        let parse_err = serde_json::from_str::<serde_json::Value>("{not json").unwrap_err();
        let err: CoordinatorError = parse_err.into();
        assert!(matches!(err, CoordinatorError::Serialization(_)));
    }
}
