use std::collections::BTreeSet;
use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::{CoordinatorError, CoordinatorResult};

/// Worker节点信息
///
/// `active_tasks` 是调度器视角的负载（权威值），`reported_load` 仅记录Worker在心跳中自报的负载。
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WorkerInfo {
    pub id: String,
    pub role: String,
    pub capabilities: BTreeSet<String>,
    pub status: WorkerStatus,
    pub active_tasks: BTreeSet<String>,
    pub max_concurrency: u32,
    pub reported_load: u32,
    pub last_heartbeat: DateTime<Utc>,
    pub registered_at: DateTime<Utc>,
    pub completed_count: u64,
    pub failed_count: u64,
    #[serde(default)]
    pub metadata: serde_json::Value,
}

/// Worker状态
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum WorkerStatus {
    #[serde(rename = "STARTING")]
    Starting,
    #[serde(rename = "IDLE")]
    Idle,
    #[serde(rename = "BUSY")]
    Busy,
    #[serde(rename = "DEGRADED")]
    Degraded,
    #[serde(rename = "OFFLINE")]
    Offline,
}

impl WorkerStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            WorkerStatus::Starting => "STARTING",
            WorkerStatus::Idle => "IDLE",
            WorkerStatus::Busy => "BUSY",
            WorkerStatus::Degraded => "DEGRADED",
            WorkerStatus::Offline => "OFFLINE",
        }
    }

    /// 是否可以接收新任务
    pub fn accepts_work(&self) -> bool {
        matches!(self, WorkerStatus::Idle | WorkerStatus::Busy)
    }
}

impl fmt::Display for WorkerStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for WorkerStatus {
    type Err = CoordinatorError;

    fn from_str(s: &str) -> CoordinatorResult<Self> {
        match s.to_ascii_uppercase().as_str() {
            "STARTING" => Ok(WorkerStatus::Starting),
            "IDLE" => Ok(WorkerStatus::Idle),
            "BUSY" => Ok(WorkerStatus::Busy),
            "DEGRADED" => Ok(WorkerStatus::Degraded),
            "OFFLINE" => Ok(WorkerStatus::Offline),
            _ => Err(CoordinatorError::Validation(format!(
                "无效的Worker状态: {s}"
            ))),
        }
    }
}

/// Worker注册请求
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WorkerRegistration {
    pub worker_id: String,
    #[serde(default = "default_role")]
    pub role: String,
    /// 为空时使用角色配置中的默认能力
    #[serde(default)]
    pub capabilities: Vec<String>,
    /// 为空时使用角色配置或全局默认并发数
    #[serde(default)]
    pub max_concurrency: Option<u32>,
    #[serde(default)]
    pub metadata: Option<serde_json::Value>,
}

fn default_role() -> String {
    "general".to_string()
}

impl WorkerRegistration {
    pub fn new(worker_id: impl Into<String>, capabilities: &[&str], max_concurrency: u32) -> Self {
        Self {
            worker_id: worker_id.into(),
            role: default_role(),
            capabilities: capabilities.iter().map(|c| c.to_string()).collect(),
            max_concurrency: Some(max_concurrency),
            metadata: None,
        }
    }

    pub fn with_role(mut self, role: impl Into<String>) -> Self {
        self.role = role.into();
        self
    }
}

/// Worker心跳信息
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WorkerHeartbeat {
    pub worker_id: String,
    pub status: WorkerStatus,
    #[serde(default)]
    pub current_load: u32,
    #[serde(default = "Utc::now")]
    pub timestamp: DateTime<Utc>,
}

impl WorkerHeartbeat {
    pub fn new(worker_id: impl Into<String>, status: WorkerStatus, current_load: u32) -> Self {
        Self {
            worker_id: worker_id.into(),
            status,
            current_load,
            timestamp: Utc::now(),
        }
    }
}

/// 注册结果，`disambiguated` 为true时表示原标识冲突后被重新分配
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct RegistrationOutcome {
    pub worker_id: String,
    pub requested_id: String,
    pub disambiguated: bool,
}

/// Worker列表过滤条件
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct WorkerFilter {
    pub status: Option<WorkerStatus>,
    pub role: Option<String>,
    pub capability: Option<String>,
}

impl WorkerFilter {
    pub fn matches(&self, worker: &WorkerInfo) -> bool {
        self.status.map_or(true, |s| worker.status == s)
            && self.role.as_deref().map_or(true, |r| worker.role == r)
            && self
                .capability
                .as_deref()
                .map_or(true, |c| worker.capabilities.contains(c))
    }
}

impl WorkerInfo {
    /// 根据注册请求创建Worker信息，能力与并发数须已解析完成
    pub fn new(
        id: String,
        role: String,
        capabilities: BTreeSet<String>,
        max_concurrency: u32,
        metadata: Option<serde_json::Value>,
        now: DateTime<Utc>,
    ) -> Self {
        Self {
            id,
            role,
            capabilities,
            status: WorkerStatus::Starting,
            active_tasks: BTreeSet::new(),
            max_concurrency,
            reported_load: 0,
            last_heartbeat: now,
            registered_at: now,
            completed_count: 0,
            failed_count: 0,
            metadata: metadata.unwrap_or(serde_json::Value::Null),
        }
    }

    pub fn current_load(&self) -> u32 {
        self.active_tasks.len() as u32
    }

    pub fn has_headroom(&self) -> bool {
        self.current_load() < self.max_concurrency
    }

    /// 能力集合是否覆盖所需能力
    pub fn covers(&self, required: &BTreeSet<String>) -> bool {
        required.is_subset(&self.capabilities)
    }

    pub fn is_exact_match(&self, required: &BTreeSet<String>) -> bool {
        &self.capabilities == required
    }

    /// 是否可作为候选Worker：能力覆盖、状态可用、且仍有空闲并发槽
    pub fn is_candidate_for(&self, required: &BTreeSet<String>) -> bool {
        self.status.accepts_work() && self.has_headroom() && self.covers(required)
    }

    /// 历史成功率（拉普拉斯平滑，无历史记录时为0.5）
    pub fn success_rate(&self) -> f64 {
        (self.completed_count as f64 + 1.0)
            / (self.completed_count as f64 + self.failed_count as f64 + 2.0)
    }

    pub fn load_ratio(&self) -> f64 {
        if self.max_concurrency == 0 {
            return 1.0;
        }
        self.current_load() as f64 / self.max_concurrency as f64
    }

    /// 负载变化后同步Idle/Busy状态，其他状态保持不变
    pub fn refresh_busy_status(&mut self) {
        match self.status {
            WorkerStatus::Idle if !self.active_tasks.is_empty() => {
                self.status = WorkerStatus::Busy;
            }
            WorkerStatus::Busy if self.active_tasks.is_empty() => {
                self.status = WorkerStatus::Idle;
            }
            _ => {}
        }
    }
}
