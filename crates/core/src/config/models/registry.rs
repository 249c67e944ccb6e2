use std::collections::HashMap;

use serde::{Deserialize, Serialize};

use crate::config::validation::{ConfigValidator, ValidationUtils};
use crate::{CoordinatorError, CoordinatorResult};

/// 角色默认配置，注册请求省略能力或并发数时使用
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct RoleConfig {
    pub capabilities: Vec<String>,
    pub max_concurrency: Option<u32>,
}

/// Worker注册表配置
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RegistryConfig {
    pub default_max_concurrency: u32,
    /// 重复标识处理策略: disambiguate / reject
    pub duplicate_policy: String,
    pub roles: HashMap<String, RoleConfig>,
}

impl Default for RegistryConfig {
    fn default() -> Self {
        Self {
            default_max_concurrency: 3,
            duplicate_policy: "disambiguate".to_string(),
            roles: HashMap::new(),
        }
    }
}

impl RegistryConfig {
    pub fn rejects_duplicates(&self) -> bool {
        self.duplicate_policy == "reject"
    }
}

impl ConfigValidator for RegistryConfig {
    fn validate(&self) -> CoordinatorResult<()> {
        ValidationUtils::validate_positive(
            self.default_max_concurrency as u64,
            "registry.default_max_concurrency",
        )?;
        ValidationUtils::validate_one_of(
            &self.duplicate_policy,
            &["disambiguate", "reject"],
            "registry.duplicate_policy",
        )?;
        for (role, role_config) in &self.roles {
            if role_config.max_concurrency == Some(0) {
                return Err(CoordinatorError::Configuration(format!(
                    "registry.roles.{role}.max_concurrency must be greater than 0"
                )));
            }
        }
        Ok(())
    }
}

/// 事件总线配置
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct MessageBusConfig {
    /// 单个邮箱最大消息数
    pub max_mailbox_size: usize,
    /// 去重窗口大小（记住的消息ID数量）
    pub dedup_window: usize,
    /// 状态监听器每批消费的消息数
    pub consume_batch_size: usize,
    /// 取出后超过该时长未确认的消息重新投递（秒）
    pub ack_timeout_seconds: u64,
    /// 单条消息最多重新投递次数，超过后丢弃
    pub max_redeliveries: u32,
}

impl Default for MessageBusConfig {
    fn default() -> Self {
        Self {
            max_mailbox_size: 10000, // 默认最大10000条消息
            dedup_window: 10000,
            consume_batch_size: 100,
            ack_timeout_seconds: 300,
            max_redeliveries: 5,
        }
    }
}

impl ConfigValidator for MessageBusConfig {
    fn validate(&self) -> CoordinatorResult<()> {
        ValidationUtils::validate_positive(self.max_mailbox_size as u64, "message_bus.max_mailbox_size")?;
        ValidationUtils::validate_positive(self.dedup_window as u64, "message_bus.dedup_window")?;
        ValidationUtils::validate_positive(
            self.consume_batch_size as u64,
            "message_bus.consume_batch_size",
        )?;
        ValidationUtils::validate_positive(self.ack_timeout_seconds, "message_bus.ack_timeout_seconds")
    }
}
