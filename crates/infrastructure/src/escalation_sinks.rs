use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use coordinator_core::{CoordinatorError, CoordinatorResult, EscalationConfig, EscalationRecord, EscalationSink};
use tokio::sync::Mutex;
use tracing::{debug, warn};

/// 以结构化日志形式输出升级记录
#[derive(Debug, Default)]
pub struct LogEscalationSink;

#[async_trait]
impl EscalationSink for LogEscalationSink {
    async fn notify(&self, record: &EscalationRecord) -> CoordinatorResult<()> {
        warn!(
            event = "escalation",
            task.id = %record.task_id,
            escalation.reason = %record.reason,
            escalation.key = %record.idempotency_key(),
            escalation.context = %record.context,
            "需要人工介入"
        );
        Ok(())
    }

    fn name(&self) -> &str {
        "log"
    }
}

/// 通过HTTP POST把升级记录推送到外部Webhook
#[derive(Debug)]
pub struct WebhookEscalationSink {
    client: reqwest::Client,
    url: String,
}

impl WebhookEscalationSink {
    pub fn new(url: impl Into<String>, timeout: Duration) -> CoordinatorResult<Self> {
        let client = reqwest::Client::builder()
            .timeout(timeout)
            .build()
            .map_err(|e| CoordinatorError::Escalation(format!("创建HTTP客户端失败: {e}")))?;
        Ok(Self {
            client,
            url: url.into(),
        })
    }
}

#[async_trait]
impl EscalationSink for WebhookEscalationSink {
    async fn notify(&self, record: &EscalationRecord) -> CoordinatorResult<()> {
        let response = self
            .client
            .post(&self.url)
            .header("Idempotency-Key", record.idempotency_key())
            .json(record)
            .send()
            .await
            .map_err(|e| CoordinatorError::Escalation(format!("Webhook请求失败: {e}")))?;

        let status = response.status();
        if !status.is_success() {
            return Err(CoordinatorError::Escalation(format!(
                "Webhook返回非成功状态码: {status}"
            )));
        }
        debug!("升级记录 {} 已推送到Webhook", record.idempotency_key());
        Ok(())
    }

    fn name(&self) -> &str {
        "webhook"
    }
}

/// 在内存中保存收到的升级记录，可模拟前若干次投递失败
#[derive(Debug, Default, Clone)]
pub struct MemoryEscalationSink {
    records: Arc<Mutex<Vec<EscalationRecord>>>,
    failures_remaining: Arc<Mutex<u32>>,
}

impl MemoryEscalationSink {
    pub fn new() -> Self {
        Self::default()
    }

    /// 前 `count` 次投递返回错误
    pub fn failing_first(count: u32) -> Self {
        Self {
            records: Arc::default(),
            failures_remaining: Arc::new(Mutex::new(count)),
        }
    }

    pub async fn records(&self) -> Vec<EscalationRecord> {
        self.records.lock().await.clone()
    }
}

#[async_trait]
impl EscalationSink for MemoryEscalationSink {
    async fn notify(&self, record: &EscalationRecord) -> CoordinatorResult<()> {
        {
            let mut remaining = self.failures_remaining.lock().await;
            if *remaining > 0 {
                *remaining -= 1;
                return Err(CoordinatorError::Escalation("模拟投递失败".to_string()));
            }
        }
        self.records.lock().await.push(record.clone());
        Ok(())
    }

    fn name(&self) -> &str {
        "memory"
    }
}

/// 按配置创建升级通知通道
pub fn build_escalation_sink(config: &EscalationConfig) -> CoordinatorResult<Arc<dyn EscalationSink>> {
    match config.sink.as_str() {
        "log" => Ok(Arc::new(LogEscalationSink)),
        "memory" => Ok(Arc::new(MemoryEscalationSink::new())),
        "webhook" => {
            let url = config.webhook_url.clone().ok_or_else(|| {
                CoordinatorError::Configuration("escalation.webhook_url is required for the webhook sink".to_string())
            })?;
            Ok(Arc::new(WebhookEscalationSink::new(url, Duration::from_secs(10))?))
        }
        other => Err(CoordinatorError::Configuration(format!(
            "Unsupported escalation sink: {other}"
        ))),
    }
}
