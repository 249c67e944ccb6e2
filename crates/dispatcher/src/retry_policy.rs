use chrono::{DateTime, Duration, Utc};

use coordinator_core::{RetryConfig, Task};

/// 重试策略：尝试次数上限和指数退避
#[derive(Debug, Clone)]
pub struct RetryPolicy {
    config: RetryConfig,
}

impl RetryPolicy {
    pub fn new(config: RetryConfig) -> Self {
        Self { config }
    }

    /// 任务自身的上限优先于全局配置
    pub fn max_attempts_for(&self, task: &Task) -> u32 {
        task.max_attempts.unwrap_or(self.config.max_attempts)
    }

    /// 当前尝试失败后是否还能再试一次
    pub fn should_retry(&self, task: &Task) -> bool {
        task.attempt < self.max_attempts_for(task)
    }

    /// 第 `attempt` 次尝试失败后的等待时间
    pub fn backoff(&self, attempt: u32) -> Duration {
        let base_interval = self.config.base_interval_seconds as f64;
        let multiplier = self.config.backoff_multiplier;
        let max_interval = self.config.max_interval_seconds as f64;
        let jitter_factor = self.config.jitter_factor;

        let exponent = attempt.saturating_sub(1).min(i32::MAX as u32) as i32;
        let exponential_interval = base_interval * multiplier.powi(exponent);
        let capped_interval = exponential_interval.min(max_interval);

        // 随机抖动，避免同时失败的任务同时重试
        let jitter = capped_interval * jitter_factor * (rand::random::<f64>() - 0.5) * 2.0;
        let final_interval = (capped_interval + jitter).min(max_interval).max(base_interval);

        Duration::milliseconds((final_interval * 1000.0) as i64)
    }

    pub fn next_eligible_at(&self, attempt: u32, now: DateTime<Utc>) -> DateTime<Utc> {
        now + self.backoff(attempt)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use coordinator_core::TaskPriority;
    use serde_json::json;
    use std::collections::BTreeSet;

    fn policy(jitter_factor: f64) -> RetryPolicy {
        RetryPolicy::new(RetryConfig {
            max_attempts: 3,
            base_interval_seconds: 5,
            max_interval_seconds: 60,
            backoff_multiplier: 2.0,
            jitter_factor,
        })
    }

    #[test]
    fn test_backoff_grows_exponentially_and_caps() {
        let policy = policy(0.0);
        assert_eq!(policy.backoff(1), Duration::seconds(5));
        assert_eq!(policy.backoff(2), Duration::seconds(10));
        assert_eq!(policy.backoff(3), Duration::seconds(20));
        assert_eq!(policy.backoff(10), Duration::seconds(60));
    }

    #[test]
    fn test_jitter_stays_within_bounds() {
        let policy = policy(0.5);
        for _ in 0..50 {
            let backoff = policy.backoff(2);
            assert!(backoff >= Duration::seconds(5));
            assert!(backoff <= Duration::seconds(15));
        }
    }

    #[test]
    fn test_task_override_of_max_attempts() {
        let policy = policy(0.0);
        let mut task = Task::new(json!({}), BTreeSet::new(), TaskPriority::Normal, Utc::now());
        task.attempt = 3;
        assert!(!policy.should_retry(&task));

        task.max_attempts = Some(5);
        assert_eq!(policy.max_attempts_for(&task), 5);
        assert!(policy.should_retry(&task));
    }
}
