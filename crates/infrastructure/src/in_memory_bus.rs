use std::collections::{HashMap, VecDeque};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Duration as ChronoDuration, Utc};
use coordinator_core::{
    CoordinatorError, CoordinatorResult, DeliveryState, Message, MessageBus, MessageBusConfig,
    MessageDeduplicator, MessageStatus, Recipient,
};
use serde::Serialize;
use tokio::sync::{Mutex, Notify, RwLock};
use tracing::{debug, info, warn};

/// 内存事件总线实现
///
/// 每个接收方一个FIFO邮箱，取出的消息进入投递中状态，直到被确认或拒绝。
/// 同一消息ID只会被接受一次，重复发布直接忽略。
#[derive(Debug)]
pub struct InMemoryMessageBus {
    /// 邮箱存储：接收方 -> 邮箱
    mailboxes: RwLock<HashMap<String, Arc<Mailbox>>>,
    /// 投递中的消息：消息ID -> 取出记录
    in_flight: Mutex<HashMap<String, InFlight>>,
    /// 最近确认的消息，容量与去重窗口一致
    acknowledged: Mutex<AckLog>,
    /// 已接受的消息ID窗口
    published: Mutex<MessageDeduplicator>,
    config: InMemoryBusConfig,
}

#[derive(Debug)]
struct InFlight {
    recipient: String,
    message: Message,
    consumed_at: DateTime<Utc>,
}

#[derive(Debug)]
struct AckLog {
    capacity: usize,
    entries: HashMap<String, MessageStatus>,
    order: VecDeque<String>,
}

impl AckLog {
    fn new(capacity: usize) -> Self {
        Self {
            capacity: capacity.max(1),
            entries: HashMap::new(),
            order: VecDeque::new(),
        }
    }

    fn record(&mut self, status: MessageStatus) {
        if self.order.len() >= self.capacity {
            if let Some(oldest) = self.order.pop_front() {
                self.entries.remove(&oldest);
            }
        }
        self.order.push_back(status.message_id.clone());
        self.entries.insert(status.message_id.clone(), status);
    }
}

#[derive(Debug)]
struct Mailbox {
    queue: Mutex<VecDeque<Message>>,
    notify: Notify,
}

impl Mailbox {
    fn new() -> Self {
        Self {
            queue: Mutex::new(VecDeque::new()),
            notify: Notify::new(),
        }
    }
}

#[derive(Debug, Clone)]
pub struct InMemoryBusConfig {
    /// 单个邮箱最大消息数
    pub max_mailbox_size: usize,
    /// 发布去重窗口大小
    pub dedup_window: usize,
    /// 未确认消息的重新投递时限（秒）
    pub ack_timeout_seconds: u64,
    pub max_redeliveries: u32,
}

impl Default for InMemoryBusConfig {
    fn default() -> Self {
        Self {
            max_mailbox_size: 10000, // 默认最大10000条消息
            dedup_window: 10000,
            ack_timeout_seconds: 300,
            max_redeliveries: 5,
        }
    }
}

impl From<&MessageBusConfig> for InMemoryBusConfig {
    fn from(config: &MessageBusConfig) -> Self {
        Self {
            max_mailbox_size: config.max_mailbox_size,
            dedup_window: config.dedup_window,
            ack_timeout_seconds: config.ack_timeout_seconds,
            max_redeliveries: config.max_redeliveries,
        }
    }
}

/// 总线统计信息
#[derive(Debug, Default, Clone, Serialize)]
pub struct BusStats {
    pub total_mailboxes: usize,
    pub total_pending: usize,
    pub in_flight: usize,
    pub mailboxes: Vec<MailboxDetail>,
}

#[derive(Debug, Clone, Serialize)]
pub struct MailboxDetail {
    pub recipient: String,
    pub pending: usize,
}

impl InMemoryMessageBus {
    pub fn new() -> Self {
        Self::with_config(InMemoryBusConfig::default())
    }

    pub fn with_config(config: InMemoryBusConfig) -> Self {
        info!("Creating in-memory message bus with config: {:?}", config);
        Self {
            mailboxes: RwLock::new(HashMap::new()),
            in_flight: Mutex::new(HashMap::new()),
            acknowledged: Mutex::new(AckLog::new(config.dedup_window)),
            published: Mutex::new(MessageDeduplicator::new(config.dedup_window)),
            config,
        }
    }

    /// 获取或创建邮箱
    async fn get_or_create_mailbox(&self, recipient: &str) -> Arc<Mailbox> {
        if let Some(mailbox) = self.mailboxes.read().await.get(recipient) {
            return mailbox.clone();
        }

        let mut mailboxes = self.mailboxes.write().await;
        mailboxes
            .entry(recipient.to_string())
            .or_insert_with(|| {
                debug!("Creating mailbox: {}", recipient);
                Arc::new(Mailbox::new())
            })
            .clone()
    }

    /// 投递到单个邮箱，超出容量返回错误
    async fn deliver(&self, recipient: &str, mailbox: &Mailbox, message: Message) -> CoordinatorResult<()> {
        {
            let mut queue = mailbox.queue.lock().await;
            if queue.len() >= self.config.max_mailbox_size {
                warn!(
                    "Mailbox '{}' is full ({} messages), rejecting message {}",
                    recipient,
                    queue.len(),
                    message.id
                );
                return Err(CoordinatorError::MessageBus(format!(
                    "Mailbox '{}' is full",
                    recipient
                )));
            }
            queue.push_back(message);
        }
        mailbox.notify.notify_one();
        Ok(())
    }

    /// 获取总线统计信息
    pub async fn get_bus_stats(&self) -> BusStats {
        let mailboxes: Vec<(String, Arc<Mailbox>)> = self
            .mailboxes
            .read()
            .await
            .iter()
            .map(|(name, mailbox)| (name.clone(), mailbox.clone()))
            .collect();

        let mut stats = BusStats::default();
        for (recipient, mailbox) in mailboxes {
            let pending = mailbox.queue.lock().await.len();
            stats.total_mailboxes += 1;
            stats.total_pending += pending;
            stats.mailboxes.push(MailboxDetail { recipient, pending });
        }
        stats.mailboxes.sort_by(|a, b| a.recipient.cmp(&b.recipient));
        stats.in_flight = self.in_flight.lock().await.len();
        stats
    }
}

impl Default for InMemoryMessageBus {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl MessageBus for InMemoryMessageBus {
    async fn register_recipient(&self, recipient: &str) -> CoordinatorResult<()> {
        self.get_or_create_mailbox(recipient).await;
        Ok(())
    }

    async fn unregister_recipient(&self, recipient: &str) -> CoordinatorResult<()> {
        let removed = self.mailboxes.write().await.remove(recipient);
        if let Some(mailbox) = removed {
            let dropped = mailbox.queue.lock().await.len();
            info!("Removed mailbox '{}' ({} undelivered messages dropped)", recipient, dropped);
        }
        self.in_flight
            .lock()
            .await
            .retain(|_, entry| entry.recipient != recipient);
        Ok(())
    }

    async fn publish_message(&self, message: &Message) -> CoordinatorResult<()> {
        if !self.published.lock().await.check_and_record(&message.id) {
            debug!("Duplicate message {} ignored", message.id);
            return Ok(());
        }

        match &message.recipient {
            Recipient::Worker(recipient) => {
                let mailbox = self.get_or_create_mailbox(recipient).await;
                self.deliver(recipient, &mailbox, message.clone()).await?;
                debug!(
                    "Published {} message {} to '{}'",
                    message.message_type_str(),
                    message.id,
                    recipient
                );
            }
            Recipient::Broadcast => {
                let targets: Vec<(String, Arc<Mailbox>)> = self
                    .mailboxes
                    .read()
                    .await
                    .iter()
                    .filter(|(name, _)| **name != message.sender)
                    .map(|(name, mailbox)| (name.clone(), mailbox.clone()))
                    .collect();

                // 广播对单个满邮箱的失败不影响其他接收方
                for (recipient, mailbox) in &targets {
                    if let Err(e) = self.deliver(recipient, mailbox, message.clone()).await {
                        warn!("Broadcast to '{}' skipped: {}", recipient, e);
                    }
                }
                debug!(
                    "Broadcast {} message {} to {} mailboxes",
                    message.message_type_str(),
                    message.id,
                    targets.len()
                );
            }
        }
        Ok(())
    }

    async fn consume_messages(&self, recipient: &str, limit: usize) -> CoordinatorResult<Vec<Message>> {
        let mailbox = self.get_or_create_mailbox(recipient).await;
        let messages: Vec<Message> = {
            let mut queue = mailbox.queue.lock().await;
            let count = limit.min(queue.len());
            queue.drain(..count).collect()
        };

        if !messages.is_empty() {
            let consumed_at = Utc::now();
            let mut in_flight = self.in_flight.lock().await;
            for message in &messages {
                in_flight.insert(
                    message.id.clone(),
                    InFlight {
                        recipient: recipient.to_string(),
                        message: message.clone(),
                        consumed_at,
                    },
                );
            }
            debug!("Consumed {} messages from '{}'", messages.len(), recipient);
        }
        Ok(messages)
    }

    async fn ack_message(&self, message_id: &str) -> CoordinatorResult<()> {
        let entry = self.in_flight.lock().await.remove(message_id);
        match entry {
            Some(entry) => {
                self.acknowledged.lock().await.record(MessageStatus::new(
                    &entry.message,
                    &entry.recipient,
                    DeliveryState::Acknowledged,
                ));
            }
            None => debug!("Ack for unknown or already acknowledged message: {}", message_id),
        }
        Ok(())
    }

    async fn nack_message(&self, message_id: &str, requeue: bool) -> CoordinatorResult<()> {
        let entry = self.in_flight.lock().await.remove(message_id);
        let Some(InFlight {
            recipient,
            mut message,
            ..
        }) = entry
        else {
            debug!("Nack for unknown message: {}", message_id);
            return Ok(());
        };

        if requeue {
            message.increment_retry();
            let mailbox = self.get_or_create_mailbox(&recipient).await;
            mailbox.queue.lock().await.push_front(message);
            mailbox.notify.notify_one();
            debug!("Message {} requeued to '{}'", message_id, recipient);
        } else {
            warn!("Message {} rejected by '{}' and dropped", message_id, recipient);
        }
        Ok(())
    }

    async fn pending_count(&self, recipient: &str) -> CoordinatorResult<usize> {
        let mailbox = self.mailboxes.read().await.get(recipient).cloned();
        match mailbox {
            Some(mailbox) => Ok(mailbox.queue.lock().await.len()),
            None => Ok(0),
        }
    }

    async fn wait_for_messages(&self, recipient: &str, timeout: Duration) -> CoordinatorResult<bool> {
        let mailbox = self.get_or_create_mailbox(recipient).await;
        let notified = mailbox.notify.notified();
        if !mailbox.queue.lock().await.is_empty() {
            return Ok(true);
        }
        Ok(tokio::time::timeout(timeout, notified).await.is_ok())
    }

    async fn message_status(&self, message_id: &str) -> CoordinatorResult<MessageStatus> {
        if let Some(entry) = self.in_flight.lock().await.get(message_id) {
            return Ok(MessageStatus::new(&entry.message, &entry.recipient, DeliveryState::InFlight));
        }
        if let Some(status) = self.acknowledged.lock().await.entries.get(message_id) {
            return Ok(status.clone());
        }

        let mailboxes: Vec<(String, Arc<Mailbox>)> = self
            .mailboxes
            .read()
            .await
            .iter()
            .map(|(name, mailbox)| (name.clone(), mailbox.clone()))
            .collect();
        for (recipient, mailbox) in mailboxes {
            let queue = mailbox.queue.lock().await;
            if let Some(message) = queue.iter().find(|m| m.id == message_id) {
                return Ok(MessageStatus::new(message, &recipient, DeliveryState::Pending));
            }
        }

        Err(CoordinatorError::UnknownMessage {
            id: message_id.to_string(),
        })
    }

    async fn redeliver_unacked(&self, now: DateTime<Utc>) -> CoordinatorResult<usize> {
        let cutoff = now - ChronoDuration::seconds(self.config.ack_timeout_seconds as i64);
        let expired: Vec<InFlight> = {
            let mut in_flight = self.in_flight.lock().await;
            let ids: Vec<String> = in_flight
                .iter()
                .filter(|(_, entry)| entry.consumed_at <= cutoff)
                .map(|(id, _)| id.clone())
                .collect();
            ids.iter().filter_map(|id| in_flight.remove(id)).collect()
        };

        let mut redelivered = 0;
        for InFlight {
            recipient,
            mut message,
            ..
        } in expired
        {
            if message.retry_count >= self.config.max_redeliveries {
                warn!(
                    "Message {} to '{}' was never acknowledged after {} redeliveries, dropped",
                    message.id, recipient, message.retry_count
                );
                continue;
            }
            message.increment_retry();
            let mailbox = self.get_or_create_mailbox(&recipient).await;
            mailbox.queue.lock().await.push_front(message);
            mailbox.notify.notify_one();
            redelivered += 1;
        }

        if redelivered > 0 {
            info!("Redelivered {} unacknowledged messages", redelivered);
        }
        Ok(redelivered)
    }
}
