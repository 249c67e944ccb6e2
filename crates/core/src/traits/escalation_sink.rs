use async_trait::async_trait;

use crate::{models::EscalationRecord, CoordinatorResult};

/// 升级通知外部通道（聊天、邮件、日志等）
#[async_trait]
pub trait EscalationSink: Send + Sync {
    /// 投递一条升级记录，失败时由调用方重试
    async fn notify(&self, record: &EscalationRecord) -> CoordinatorResult<()>;

    /// 通道名称，用于日志
    fn name(&self) -> &str;
}
