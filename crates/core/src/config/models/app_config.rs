use std::path::Path;

use anyhow::{Context, Result};
use config::{Config as ConfigBuilder, Environment, File, FileFormat};
use serde::{Deserialize, Serialize};

use super::{
    api_observability::{ApiConfig, ObservabilityConfig},
    dispatcher::{DispatcherConfig, LockConfig, RetryConfig},
    liveness::{AuditConfig, EscalationConfig, LivenessConfig},
    registry::{MessageBusConfig, RegistryConfig},
};
use crate::config::validation::ConfigValidator;
use crate::CoordinatorResult;

/// 默认配置文件搜索路径
pub const DEFAULT_CONFIG_PATHS: [&str; 2] = ["config/coordinator.toml", "coordinator.toml"];

/// 环境变量前缀，层级分隔符为 `__`
pub const ENV_PREFIX: &str = "COORDINATOR";

/// System configuration
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct AppConfig {
    pub dispatcher: DispatcherConfig,
    pub retry: RetryConfig,
    pub locks: LockConfig,
    pub liveness: LivenessConfig,
    pub escalation: EscalationConfig,
    pub registry: RegistryConfig,
    pub audit: AuditConfig,
    pub message_bus: MessageBusConfig,
    pub api: ApiConfig,
    pub observability: ObservabilityConfig,
}

impl AppConfig {
    /// Load configuration from config file and environment variables
    ///
    /// Load order:
    /// 1. Built-in defaults (every section is `#[serde(default)]`)
    /// 2. Config file (TOML format); an explicit path must exist, default paths are optional
    /// 3. Environment variable overrides (e.g. `COORDINATOR__RETRY__MAX_ATTEMPTS=5`)
    pub fn load(config_path: Option<&str>) -> Result<Self> {
        let mut builder = ConfigBuilder::builder();

        if let Some(path) = Self::resolve_path(config_path)? {
            builder = builder.add_source(File::new(&path, FileFormat::Toml));
        }

        builder = builder.add_source(
            Environment::with_prefix(ENV_PREFIX)
                .separator("__")
                .try_parsing(true),
        );

        let config: AppConfig = builder
            .build()
            .context("构建配置失败")?
            .try_deserialize()
            .context("反序列化配置失败")?;

        config.validate().context("配置校验失败")?;

        Ok(config)
    }

    /// 确定要读取的配置文件：显式路径必须存在，否则按默认路径查找，都没有时返回None
    pub fn resolve_path(config_path: Option<&str>) -> Result<Option<String>> {
        match config_path {
            Some(path) if !Path::new(path).exists() => {
                Err(anyhow::anyhow!("配置文件不存在: {}", path))
            }
            Some(path) => Ok(Some(path.to_string())),
            None => Ok(DEFAULT_CONFIG_PATHS
                .iter()
                .find(|p| Path::new(p).exists())
                .map(|p| p.to_string())),
        }
    }

    pub fn from_toml(toml_str: &str) -> Result<Self> {
        let config: AppConfig = toml::from_str(toml_str).context("解析TOML配置失败")?;
        config.validate().context("配置校验失败")?;
        Ok(config)
    }

    pub fn to_toml(&self) -> Result<String> {
        toml::to_string_pretty(self).context("序列化配置为TOML失败")
    }
}

impl ConfigValidator for AppConfig {
    fn validate(&self) -> CoordinatorResult<()> {
        self.dispatcher.validate()?;
        self.retry.validate()?;
        self.locks.validate()?;
        self.liveness.validate()?;
        self.escalation.validate()?;
        self.registry.validate()?;
        self.audit.validate()?;
        self.message_bus.validate()?;
        self.api.validate()?;
        self.observability.validate()?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_app_config_default() {
        let config = AppConfig::default();
        assert_eq!(config.dispatcher.aging_threshold_seconds, 300);
        assert_eq!(config.liveness.heartbeat_timeout_seconds, 120);
        assert_eq!(config.liveness.stuck_task_seconds, 900);
        assert_eq!(config.locks.max_wait_seconds, 600);
        assert_eq!(config.retry.max_attempts, 3);
        assert_eq!(config.registry.default_max_concurrency, 3);
        assert_eq!(config.api.bind_address, "0.0.0.0:8080");
    }

    #[test]
    fn test_app_config_validation() {
        let config = AppConfig::default();
        assert!(config.validate().is_ok());

        let mut config = AppConfig::default();
        config.liveness.offline_timeout_seconds = 60;
        assert!(config.validate().is_err());

        let mut config = AppConfig::default();
        config.escalation.sink = "webhook".to_string();
        assert!(config.validate().is_err());
        config.escalation.webhook_url = Some("https://hooks.example.com/notify".to_string());
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_app_config_from_partial_toml() {
        let toml_str = r#"
[dispatcher]
aging_threshold_seconds = 120

[retry]
max_attempts = 5

[registry.roles.deployer]
capabilities = ["deploy", "rollback"]
max_concurrency = 1
"#;
        let config = AppConfig::from_toml(toml_str).unwrap();
        assert_eq!(config.dispatcher.aging_threshold_seconds, 120);
        assert_eq!(config.dispatcher.tick_interval_ms, 1000);
        assert_eq!(config.retry.max_attempts, 5);
        assert_eq!(config.retry.base_interval_seconds, 5);
        let role = &config.registry.roles["deployer"];
        assert_eq!(role.capabilities, vec!["deploy", "rollback"]);
        assert_eq!(role.max_concurrency, Some(1));
    }

    #[test]
    fn test_app_config_toml_round_trip() {
        let config = AppConfig::default();
        let serialized = config.to_toml().unwrap();
        let parsed = AppConfig::from_toml(&serialized).unwrap();
        assert_eq!(
            parsed.liveness.offline_timeout_seconds,
            config.liveness.offline_timeout_seconds
        );
    }

    #[test]
    fn test_invalid_toml_is_rejected() {
        assert!(AppConfig::from_toml("[retry]\nmax_attempts = 0\n").is_err());
        assert!(AppConfig::from_toml("[dispatcher\n").is_err());
    }
}
