use serde::{Deserialize, Serialize};

use crate::config::validation::{ConfigValidator, ValidationUtils};
use crate::CoordinatorResult;

/// 存活监控配置
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LivenessConfig {
    /// 巡检间隔（秒）
    pub sweep_interval_seconds: u64,
    /// 心跳超时（秒），超时后标记为Degraded
    pub heartbeat_timeout_seconds: u64,
    /// 离线阈值（秒），超时后标记为Offline并回收任务
    pub offline_timeout_seconds: u64,
    /// 离线Worker持续无心跳超过该时间（秒）后注销
    pub deregister_after_seconds: u64,
    /// Running任务无状态更新超过该时间（秒）视为卡住
    pub stuck_task_seconds: u64,
    /// 心跳请求的回复宽限期（秒）
    pub heartbeat_grace_seconds: u64,
    /// 取消请求等待Worker确认的期限（秒）
    pub cancel_ack_timeout_seconds: u64,
}

impl Default for LivenessConfig {
    fn default() -> Self {
        Self {
            sweep_interval_seconds: 10,      // 10秒巡检一次
            heartbeat_timeout_seconds: 120,  // 2分钟无心跳降级
            offline_timeout_seconds: 300,    // 5分钟无心跳离线
            deregister_after_seconds: 3600,  // 离线1小时后注销
            stuck_task_seconds: 900,         // 15分钟无进度视为卡住
            heartbeat_grace_seconds: 60,     // 1分钟回复宽限
            cancel_ack_timeout_seconds: 120, // 2分钟取消确认期限
        }
    }
}

impl ConfigValidator for LivenessConfig {
    fn validate(&self) -> CoordinatorResult<()> {
        ValidationUtils::validate_positive(self.sweep_interval_seconds, "liveness.sweep_interval_seconds")?;
        ValidationUtils::validate_positive(
            self.heartbeat_timeout_seconds,
            "liveness.heartbeat_timeout_seconds",
        )?;
        ValidationUtils::validate_ordered(
            self.heartbeat_timeout_seconds,
            "liveness.heartbeat_timeout_seconds",
            self.offline_timeout_seconds,
            "liveness.offline_timeout_seconds",
        )?;
        ValidationUtils::validate_ordered(
            self.offline_timeout_seconds,
            "liveness.offline_timeout_seconds",
            self.deregister_after_seconds,
            "liveness.deregister_after_seconds",
        )?;
        ValidationUtils::validate_positive(self.stuck_task_seconds, "liveness.stuck_task_seconds")?;
        ValidationUtils::validate_positive(
            self.heartbeat_grace_seconds,
            "liveness.heartbeat_grace_seconds",
        )?;
        ValidationUtils::validate_positive(
            self.cancel_ack_timeout_seconds,
            "liveness.cancel_ack_timeout_seconds",
        )
    }
}

/// 升级通知配置
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct EscalationConfig {
    /// 通知通道: log / webhook / memory
    pub sink: String,
    pub webhook_url: Option<String>,
    /// 单次投递的最大尝试次数
    pub max_delivery_attempts: u32,
    /// 投递重试间隔（毫秒）
    pub retry_interval_ms: u64,
    /// 一轮尝试全部失败后，记录重新排队的延迟（毫秒）
    pub redelivery_delay_ms: u64,
    /// 升级消息在事件总线上的邮箱名
    pub bus_recipient: String,
}

impl Default for EscalationConfig {
    fn default() -> Self {
        Self {
            sink: "log".to_string(),
            webhook_url: None,
            max_delivery_attempts: 5,
            retry_interval_ms: 500,
            redelivery_delay_ms: 30_000,
            bus_recipient: "escalations".to_string(),
        }
    }
}

impl ConfigValidator for EscalationConfig {
    fn validate(&self) -> CoordinatorResult<()> {
        ValidationUtils::validate_one_of(&self.sink, &["log", "webhook", "memory"], "escalation.sink")?;
        if self.sink == "webhook" {
            ValidationUtils::validate_url(
                self.webhook_url.as_deref().unwrap_or_default(),
                "escalation.webhook_url",
            )?;
        }
        ValidationUtils::validate_positive(
            self.max_delivery_attempts as u64,
            "escalation.max_delivery_attempts",
        )?;
        ValidationUtils::validate_not_empty(&self.bus_recipient, "escalation.bus_recipient")
    }
}

/// 终止任务审计保留配置
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct AuditConfig {
    /// 终止任务保留时长（秒），之后从内存中清除
    pub retention_seconds: u64,
}

impl Default for AuditConfig {
    fn default() -> Self {
        Self {
            retention_seconds: 3600, // 保留1小时
        }
    }
}

impl ConfigValidator for AuditConfig {
    fn validate(&self) -> CoordinatorResult<()> {
        ValidationUtils::validate_positive(self.retention_seconds, "audit.retention_seconds")
    }
}
