use serde::{Deserialize, Serialize};

use crate::config::validation::{ConfigValidator, ValidationUtils};
use crate::{CoordinatorError, CoordinatorResult};

/// 调度器配置
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct DispatcherConfig {
    pub enabled: bool,
    /// 调度tick间隔（毫秒）
    pub tick_interval_ms: u64,
    /// 单次tick最多分配的任务数
    pub max_dispatch_per_tick: usize,
    /// Assigned状态等待Worker首次响应的期限（秒）
    pub assignment_timeout_seconds: u64,
    /// 优先级老化阈值（秒），每等待一个周期提升一级
    pub aging_threshold_seconds: u64,
    /// 核心自身在事件总线上的邮箱名
    pub inbox: String,
    /// 候选Worker排序策略
    pub selection_strategy: String,
}

impl Default for DispatcherConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            tick_interval_ms: 1000,                       // 每秒调度一次
            max_dispatch_per_tick: 100,                   // 单次最多分配100个任务
            assignment_timeout_seconds: 60,               // 1分钟内必须开始执行
            aging_threshold_seconds: 300,                 // 每等待5分钟提升一级
            inbox: "dispatcher".to_string(),              // 核心邮箱
            selection_strategy: "capability_affinity".to_string(), // 能力亲和优先
        }
    }
}

impl ConfigValidator for DispatcherConfig {
    fn validate(&self) -> CoordinatorResult<()> {
        ValidationUtils::validate_positive(self.tick_interval_ms, "dispatcher.tick_interval_ms")?;
        ValidationUtils::validate_positive(
            self.max_dispatch_per_tick as u64,
            "dispatcher.max_dispatch_per_tick",
        )?;
        ValidationUtils::validate_positive(
            self.assignment_timeout_seconds,
            "dispatcher.assignment_timeout_seconds",
        )?;
        ValidationUtils::validate_positive(
            self.aging_threshold_seconds,
            "dispatcher.aging_threshold_seconds",
        )?;
        ValidationUtils::validate_not_empty(&self.inbox, "dispatcher.inbox")?;
        ValidationUtils::validate_one_of(
            &self.selection_strategy,
            &["capability_affinity", "least_loaded"],
            "dispatcher.selection_strategy",
        )
    }
}

/// 重试策略配置
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RetryConfig {
    /// 最大尝试次数（含首次执行）
    pub max_attempts: u32,
    /// 基础重试间隔（秒）
    pub base_interval_seconds: u64,
    /// 最大重试间隔（秒）
    pub max_interval_seconds: u64,
    /// 指数退避倍数
    pub backoff_multiplier: f64,
    /// 重试间隔的随机抖动范围（0.0-1.0）
    pub jitter_factor: f64,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_attempts: 3,           // 最多执行3次
            base_interval_seconds: 5,  // 5秒
            max_interval_seconds: 300, // 5分钟
            backoff_multiplier: 2.0,   // 每次翻倍
            jitter_factor: 0.1,        // 10%的随机抖动
        }
    }
}

impl ConfigValidator for RetryConfig {
    fn validate(&self) -> CoordinatorResult<()> {
        ValidationUtils::validate_positive(self.max_attempts as u64, "retry.max_attempts")?;
        ValidationUtils::validate_positive(self.base_interval_seconds, "retry.base_interval_seconds")?;
        if self.max_interval_seconds < self.base_interval_seconds {
            return Err(CoordinatorError::Configuration(
                "retry.max_interval_seconds must not be less than retry.base_interval_seconds"
                    .to_string(),
            ));
        }
        if self.backoff_multiplier < 1.0 {
            return Err(CoordinatorError::Configuration(
                "retry.backoff_multiplier must be at least 1.0".to_string(),
            ));
        }
        if !(0.0..=1.0).contains(&self.jitter_factor) {
            return Err(CoordinatorError::Configuration(
                "retry.jitter_factor must be within 0.0..=1.0".to_string(),
            ));
        }
        Ok(())
    }
}

/// 资源锁配置
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LockConfig {
    /// 等待超过该时间（秒）即升级通知，任务仍保留在等待队列
    pub max_wait_seconds: u64,
    /// 估算等待时间时假设的单个持有者占用时长（秒）
    pub estimated_hold_seconds: u64,
}

impl Default for LockConfig {
    fn default() -> Self {
        Self {
            max_wait_seconds: 600,      // 10分钟
            estimated_hold_seconds: 60, // 每个排在前面的任务按1分钟估算
        }
    }
}

impl ConfigValidator for LockConfig {
    fn validate(&self) -> CoordinatorResult<()> {
        ValidationUtils::validate_positive(self.max_wait_seconds, "locks.max_wait_seconds")?;
        ValidationUtils::validate_positive(self.estimated_hold_seconds, "locks.estimated_hold_seconds")
    }
}
