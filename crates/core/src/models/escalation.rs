use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// 升级原因
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
pub enum EscalationReason {
    #[serde(rename = "REPEATED_FAILURE")]
    RepeatedFailure,
    #[serde(rename = "APPROVAL_REQUIRED")]
    ApprovalRequired,
    #[serde(rename = "UNRESOLVABLE_CONFLICT")]
    UnresolvableConflict,
    #[serde(rename = "STUCK_BEYOND_THRESHOLD")]
    StuckBeyondThreshold,
}

impl EscalationReason {
    pub fn as_str(&self) -> &'static str {
        match self {
            EscalationReason::RepeatedFailure => "REPEATED_FAILURE",
            EscalationReason::ApprovalRequired => "APPROVAL_REQUIRED",
            EscalationReason::UnresolvableConflict => "UNRESOLVABLE_CONFLICT",
            EscalationReason::StuckBeyondThreshold => "STUCK_BEYOND_THRESHOLD",
        }
    }
}

impl fmt::Display for EscalationReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// 升级记录，交给外部通知通道处理
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct EscalationRecord {
    pub task_id: String,
    pub reason: EscalationReason,
    pub context: serde_json::Value,
    pub raised_at: DateTime<Utc>,
}

impl EscalationRecord {
    pub fn new(task_id: impl Into<String>, reason: EscalationReason, context: serde_json::Value) -> Self {
        Self {
            task_id: task_id.into(),
            reason,
            context,
            raised_at: Utc::now(),
        }
    }

    /// 幂等键：同一任务同一原因只通知一次
    pub fn idempotency_key(&self) -> String {
        format!("{}:{}", self.task_id, self.reason)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_idempotency_key_ignores_context() {
        let a = EscalationRecord::new("t-1", EscalationReason::RepeatedFailure, json!({"n": 1}));
        let b = EscalationRecord::new("t-1", EscalationReason::RepeatedFailure, json!({"n": 2}));
        let c = EscalationRecord::new("t-1", EscalationReason::StuckBeyondThreshold, json!({}));
        assert_eq!(a.idempotency_key(), b.idempotency_key());
        assert_ne!(a.idempotency_key(), c.idempotency_key());
        assert_eq!(a.idempotency_key(), "t-1:REPEATED_FAILURE");
    }
}
