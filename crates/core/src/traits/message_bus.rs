use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};

use crate::{
    models::{Message, MessageStatus},
    CoordinatorResult,
};

/// 事件总线抽象接口
///
/// 每个接收方拥有独立的FIFO邮箱；广播消息投递到除发送方以外的所有已注册邮箱。
/// 同一消息ID重复发布视为无操作。
#[async_trait]
pub trait MessageBus: Send + Sync {
    /// 注册接收方邮箱（幂等）
    async fn register_recipient(&self, recipient: &str) -> CoordinatorResult<()>;

    /// 注销接收方邮箱，未消费的消息一并丢弃
    async fn unregister_recipient(&self, recipient: &str) -> CoordinatorResult<()>;

    /// 发布消息
    async fn publish_message(&self, message: &Message) -> CoordinatorResult<()>;

    /// 按FIFO顺序取出至多 `limit` 条消息，取出的消息在确认前处于投递中
    async fn consume_messages(&self, recipient: &str, limit: usize) -> CoordinatorResult<Vec<Message>>;

    /// 确认消息处理完成
    async fn ack_message(&self, message_id: &str) -> CoordinatorResult<()>;

    /// 拒绝消息，`requeue` 为true时放回邮箱头部
    async fn nack_message(&self, message_id: &str, requeue: bool) -> CoordinatorResult<()>;

    /// 获取邮箱中待消费的消息数量
    async fn pending_count(&self, recipient: &str) -> CoordinatorResult<usize>;

    /// 等待邮箱出现新消息，超时返回false
    async fn wait_for_messages(&self, recipient: &str, timeout: Duration) -> CoordinatorResult<bool>;

    /// 查询消息投递状态，未知或已过期的消息返回 `UnknownMessage`
    async fn message_status(&self, message_id: &str) -> CoordinatorResult<MessageStatus>;

    /// 把取出后超时未确认的消息放回邮箱，返回重新投递的数量
    async fn redeliver_unacked(&self, now: DateTime<Utc>) -> CoordinatorResult<usize>;
}
