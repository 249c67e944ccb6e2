use std::collections::{HashSet, VecDeque};
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::{broadcast, Mutex, Notify};
use tokio::time::Instant;
use tracing::{debug, error, info, warn};

use coordinator_core::{EscalationConfig, EscalationRecord, EscalationSink, Message, MessageBus};
use coordinator_infrastructure::{MetricsCollector, StructuredLogger};

/// 升级通知通道
///
/// `escalate` 只负责去重和入队，投递由后台循环完成，调度路径不会因外部通道缓慢而阻塞。
/// 一轮尝试全部失败的记录延迟后重新排队，直到投递成功；期间幂等键保持有效。
pub struct EscalationChannel {
    sink: Arc<dyn EscalationSink>,
    bus: Option<Arc<dyn MessageBus>>,
    config: EscalationConfig,
    sender_id: String,
    outbox: Mutex<VecDeque<QueuedEscalation>>,
    seen: Mutex<HashSet<String>>,
    notify: Notify,
    metrics: MetricsCollector,
}

struct QueuedEscalation {
    record: EscalationRecord,
    ready_at: Instant,
    /// 已镜像到事件总线，重新投递时不再发布
    published: bool,
}

impl EscalationChannel {
    pub fn new(
        sink: Arc<dyn EscalationSink>,
        bus: Option<Arc<dyn MessageBus>>,
        config: EscalationConfig,
        sender_id: impl Into<String>,
    ) -> Self {
        Self {
            sink,
            bus,
            config,
            sender_id: sender_id.into(),
            outbox: Mutex::new(VecDeque::new()),
            seen: Mutex::new(HashSet::new()),
            notify: Notify::new(),
            metrics: MetricsCollector::new(),
        }
    }

    /// 提交升级记录，返回是否为新的升级
    pub async fn escalate(&self, record: EscalationRecord) -> bool {
        let accepted = self.seen.lock().await.insert(record.idempotency_key());
        StructuredLogger::log_escalation(&record.task_id, record.reason.as_str(), accepted);
        if !accepted {
            return false;
        }

        self.metrics.record_escalation(record.reason.as_str());
        self.outbox.lock().await.push_back(QueuedEscalation {
            record,
            ready_at: Instant::now(),
            published: false,
        });
        self.notify.notify_one();
        true
    }

    /// 投递当前已到期的记录，返回成功投递的数量
    ///
    /// 只处理调用时已在队列中的记录；失败的记录按 `redelivery_delay_ms` 延迟后重新排队。
    pub async fn flush(&self) -> usize {
        let batch: Vec<QueuedEscalation> = self.outbox.lock().await.drain(..).collect();
        let now = Instant::now();
        let mut delivered = 0;
        let mut retained = Vec::new();

        for mut queued in batch {
            if queued.ready_at > now {
                retained.push(queued);
                continue;
            }
            if !queued.published {
                self.publish(&queued.record).await;
                queued.published = true;
            }
            if self.deliver(&queued.record).await {
                delivered += 1;
            } else {
                queued.ready_at =
                    Instant::now() + Duration::from_millis(self.config.redelivery_delay_ms);
                retained.push(queued);
            }
        }

        if !retained.is_empty() {
            let mut outbox = self.outbox.lock().await;
            for queued in retained.into_iter().rev() {
                outbox.push_front(queued);
            }
        }
        delivered
    }

    async fn publish(&self, record: &EscalationRecord) {
        if let Some(bus) = &self.bus {
            let message = Message::escalation(&self.sender_id, &self.config.bus_recipient, record.clone());
            if let Err(e) = bus.publish_message(&message).await {
                warn!("升级消息 {} 发布到事件总线失败: {}", record.idempotency_key(), e);
            }
        }
    }

    async fn deliver(&self, record: &EscalationRecord) -> bool {
        let max_attempts = self.config.max_delivery_attempts.max(1);
        for attempt in 1..=max_attempts {
            match self.sink.notify(record).await {
                Ok(()) => {
                    debug!(
                        "升级记录 {} 已通过 {} 通道投递 (第{}次尝试)",
                        record.idempotency_key(),
                        self.sink.name(),
                        attempt
                    );
                    return true;
                }
                Err(e) => {
                    warn!(
                        "升级记录 {} 第{}/{}次投递失败: {}",
                        record.idempotency_key(),
                        attempt,
                        max_attempts,
                        e
                    );
                    if attempt < max_attempts {
                        tokio::time::sleep(Duration::from_millis(self.config.retry_interval_ms)).await;
                    }
                }
            }
        }

        error!(
            "升级记录 {} 本轮投递失败，{}ms 后重新投递 (通道: {})",
            record.idempotency_key(),
            self.config.redelivery_delay_ms,
            self.sink.name()
        );
        self.metrics.record_escalation_delivery_failure();
        false
    }

    /// 后台投递循环，关闭前投递剩余记录
    pub async fn run_delivery_loop(&self, mut shutdown_rx: broadcast::Receiver<()>) {
        info!("升级通知投递循环已启动 (通道: {})", self.sink.name());
        let mut redelivery =
            tokio::time::interval(Duration::from_millis(self.config.redelivery_delay_ms.max(100)));
        loop {
            tokio::select! {
                _ = self.notify.notified() => {
                    self.flush().await;
                }
                _ = redelivery.tick() => {
                    self.flush().await;
                }
                _ = shutdown_rx.recv() => {
                    let delivered = self.flush().await;
                    info!("升级通知投递循环已停止，关闭前投递 {} 条记录", delivered);
                    break;
                }
            }
        }
    }

    /// 任务被清理后移除其去重记录
    pub async fn forget(&self, task_id: &str) {
        let prefix = format!("{task_id}:");
        self.seen.lock().await.retain(|key| !key.starts_with(&prefix));
    }

    pub async fn pending(&self) -> usize {
        self.outbox.lock().await.len()
    }

    /// 升级消息镜像到的邮箱
    pub fn bus_recipient(&self) -> &str {
        &self.config.bus_recipient
    }

    pub fn sink_name(&self) -> &str {
        self.sink.name()
    }
}
