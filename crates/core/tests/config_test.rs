#[cfg(test)]
mod tests {
    use std::io::Write;

    use coordinator_core::config::{AppConfig, ConfigValidator};

    fn write_config(content: &str) -> tempfile::NamedTempFile {
        let mut file = tempfile::Builder::new()
            .suffix(".toml")
            .tempfile()
            .expect("create temp config");
        file.write_all(content.as_bytes()).expect("write temp config");
        file
    }

    #[test]
    fn test_load_from_explicit_file() {
        let file = write_config(
            r#"
[liveness]
heartbeat_timeout_seconds = 30
offline_timeout_seconds = 90

[locks]
max_wait_seconds = 45

[escalation]
sink = "memory"
"#,
        );

        let config = AppConfig::load(file.path().to_str()).unwrap();
        assert_eq!(config.liveness.heartbeat_timeout_seconds, 30);
        assert_eq!(config.liveness.offline_timeout_seconds, 90);
        assert_eq!(config.locks.max_wait_seconds, 45);
        assert_eq!(config.escalation.sink, "memory");
        // 未配置的部分保持默认值
        assert_eq!(config.liveness.stuck_task_seconds, 900);
        assert_eq!(config.retry.max_attempts, 3);
    }

    #[test]
    fn test_load_missing_explicit_file_fails() {
        let result = AppConfig::load(Some("/definitely/not/here/coordinator.toml"));
        assert!(result.is_err());
        assert!(result.unwrap_err().to_string().contains("配置文件不存在"));
    }

    #[test]
    fn test_resolve_path_reports_chosen_file() {
        let file = write_config("[retry]\nmax_attempts = 4\n");
        let path = file.path().to_str().unwrap();
        assert_eq!(AppConfig::resolve_path(Some(path)).unwrap().as_deref(), Some(path));
        assert!(AppConfig::resolve_path(Some("/definitely/not/here/coordinator.toml")).is_err());
    }

    #[test]
    fn test_message_bus_redelivery_defaults() {
        let config = AppConfig::default();
        assert_eq!(config.message_bus.ack_timeout_seconds, 300);
        assert_eq!(config.message_bus.max_redeliveries, 5);
        assert_eq!(config.escalation.redelivery_delay_ms, 30_000);
    }

    #[test]
    fn test_load_rejects_invalid_values() {
        let file = write_config(
            r#"
[liveness]
heartbeat_timeout_seconds = 600
offline_timeout_seconds = 300
"#,
        );
        assert!(AppConfig::load(file.path().to_str()).is_err());
    }

    #[test]
    fn test_default_config_is_valid() {
        let config = AppConfig::default();
        assert!(config.validate().is_ok());
        assert_eq!(config.dispatcher.inbox, "dispatcher");
        assert_eq!(config.escalation.bus_recipient, "escalations");
    }
}
