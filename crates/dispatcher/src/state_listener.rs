use std::sync::Arc;
use std::time::Duration;

use tokio::sync::{broadcast, Mutex, RwLock};
use tracing::{debug, error, info, warn};

use coordinator_core::{CoordinatorResult, Message, MessageBus, MessageDeduplicator, MessageType};
use coordinator_infrastructure::StructuredLogger;

use crate::dispatcher::TaskDispatcher;

/// 状态监听器：消费核心邮箱中的Worker上报消息
///
/// 同一消息ID只处理一次；处理失败的消息同样确认，错误只记录日志。
pub struct StateListener {
    dispatcher: Arc<TaskDispatcher>,
    bus: Arc<dyn MessageBus>,
    inbox: String,
    batch_size: usize,
    seen: Mutex<MessageDeduplicator>,
    running: Arc<RwLock<bool>>,
}

impl StateListener {
    pub fn new(
        dispatcher: Arc<TaskDispatcher>,
        bus: Arc<dyn MessageBus>,
        inbox: impl Into<String>,
        batch_size: usize,
        dedup_window: usize,
    ) -> Self {
        Self {
            dispatcher,
            bus,
            inbox: inbox.into(),
            batch_size: batch_size.max(1),
            seen: Mutex::new(MessageDeduplicator::new(dedup_window)),
            running: Arc::new(RwLock::new(false)),
        }
    }

    pub async fn stop(&self) {
        *self.running.write().await = false;
        info!("状态监听器停止信号已发送");
    }

    pub async fn is_running(&self) -> bool {
        *self.running.read().await
    }

    /// 处理单条消息，返回是否实际执行了处理（重复消息返回false）
    pub async fn process_message(&self, message: &Message) -> CoordinatorResult<bool> {
        if !self.seen.lock().await.check_and_record(&message.id) {
            debug!("消息 {} 已处理过，跳过", message.id);
            return Ok(false);
        }

        match &message.message_type {
            MessageType::StatusUpdate(update) => {
                self.dispatcher
                    .report_progress(&update.task_id, &update.worker_id, update.note.clone())
                    .await?;
            }
            MessageType::TaskComplete(complete) => {
                self.dispatcher
                    .report_complete(&complete.task_id, &complete.worker_id, complete.result.clone())
                    .await?;
            }
            MessageType::TaskFailed(failed) => {
                self.dispatcher
                    .report_failed(&failed.task_id, &failed.worker_id, failed.error.clone())
                    .await?;
            }
            MessageType::WorkerHeartbeat(heartbeat) => {
                self.dispatcher.heartbeat(heartbeat).await?;
            }
            MessageType::TaskCancellation(ack) => {
                self.dispatcher
                    .acknowledge_cancel(&ack.task_id, &ack.worker_id)
                    .await?;
            }
            _ => {
                debug!(
                    "状态监听器忽略 {} 类型的消息 {}",
                    message.message_type_str(),
                    message.id
                );
            }
        }
        Ok(true)
    }

    /// 消费并处理一批消息，返回处理的消息数量
    pub async fn process_batch(&self) -> CoordinatorResult<usize> {
        let messages = self.bus.consume_messages(&self.inbox, self.batch_size).await?;
        let mut processed = 0;
        for message in &messages {
            match self.process_message(message).await {
                Ok(true) => processed += 1,
                Ok(false) => {}
                Err(e) => {
                    warn!(
                        "处理消息 {} ({}) 失败: {}",
                        message.id,
                        message.routing_key(),
                        e
                    );
                }
            }
            if let Err(e) = self.bus.ack_message(&message.id).await {
                error!("确认消息 {} 失败: {}", message.id, e);
            }
        }
        Ok(processed)
    }

    /// 持续监听核心邮箱，直到收到关闭信号或被停止
    pub async fn listen_for_updates(&self, mut shutdown_rx: broadcast::Receiver<()>) -> CoordinatorResult<()> {
        self.bus.register_recipient(&self.inbox).await?;
        *self.running.write().await = true;
        info!("状态监听器已启动，监听邮箱: {}", self.inbox);

        loop {
            if !self.is_running().await {
                info!("收到停止信号，退出邮箱 {} 的监听", self.inbox);
                break;
            }

            tokio::select! {
                result = self.bus.wait_for_messages(&self.inbox, Duration::from_secs(1)) => {
                    match result {
                        Ok(true) => {
                            if let Err(e) = self.process_batch().await {
                                StructuredLogger::log_system_error("state_listener", "process_batch", &e);
                                tokio::time::sleep(Duration::from_secs(1)).await;
                            }
                        }
                        Ok(false) => {}
                        Err(e) => {
                            error!("等待邮箱 {} 消息时出错: {}", self.inbox, e);
                            tokio::time::sleep(Duration::from_secs(1)).await;
                        }
                    }
                }
                _ = shutdown_rx.recv() => {
                    info!("状态监听器收到关闭信号");
                    break;
                }
            }
        }

        *self.running.write().await = false;
        Ok(())
    }
}
