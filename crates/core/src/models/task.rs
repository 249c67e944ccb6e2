use std::collections::BTreeSet;
use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::{CoordinatorError, CoordinatorResult};

/// 任务优先级，比较顺序为 Low < Normal < High < Urgent
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash, PartialOrd, Ord, Default)]
pub enum TaskPriority {
    #[serde(rename = "LOW")]
    Low,
    #[serde(rename = "NORMAL")]
    #[default]
    Normal,
    #[serde(rename = "HIGH")]
    High,
    #[serde(rename = "URGENT")]
    Urgent,
}

impl TaskPriority {
    fn level(self) -> u32 {
        match self {
            TaskPriority::Low => 0,
            TaskPriority::Normal => 1,
            TaskPriority::High => 2,
            TaskPriority::Urgent => 3,
        }
    }

    fn from_level(level: u32) -> Self {
        match level {
            0 => TaskPriority::Low,
            1 => TaskPriority::Normal,
            2 => TaskPriority::High,
            _ => TaskPriority::Urgent,
        }
    }

    /// 提升若干级，最高为Urgent
    pub fn promoted_by(self, levels: u32) -> Self {
        Self::from_level(self.level().saturating_add(levels))
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            TaskPriority::Low => "LOW",
            TaskPriority::Normal => "NORMAL",
            TaskPriority::High => "HIGH",
            TaskPriority::Urgent => "URGENT",
        }
    }
}

impl fmt::Display for TaskPriority {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// 任务状态
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
pub enum TaskState {
    #[serde(rename = "PENDING")]
    Pending,
    #[serde(rename = "ASSIGNED")]
    Assigned,
    #[serde(rename = "RUNNING")]
    Running,
    #[serde(rename = "COMPLETED")]
    Completed,
    #[serde(rename = "FAILED")]
    Failed,
    #[serde(rename = "ABANDONED")]
    Abandoned,
    #[serde(rename = "CANCELLED")]
    Cancelled,
}

impl TaskState {
    pub fn as_str(&self) -> &'static str {
        match self {
            TaskState::Pending => "PENDING",
            TaskState::Assigned => "ASSIGNED",
            TaskState::Running => "RUNNING",
            TaskState::Completed => "COMPLETED",
            TaskState::Failed => "FAILED",
            TaskState::Abandoned => "ABANDONED",
            TaskState::Cancelled => "CANCELLED",
        }
    }

    /// 终止状态（Failed是单次尝试的终点，随后立即转为Pending或Abandoned）
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            TaskState::Completed | TaskState::Failed | TaskState::Abandoned | TaskState::Cancelled
        )
    }

    /// 已分配给Worker、计入Worker负载的状态
    pub fn is_live(&self) -> bool {
        matches!(self, TaskState::Assigned | TaskState::Running)
    }

    pub fn can_transition_to(&self, next: TaskState) -> bool {
        use TaskState::*;
        matches!(
            (self, next),
            (Pending, Assigned)
                | (Pending, Running)
                | (Pending, Cancelled)
                | (Pending, Abandoned)
                | (Assigned, Running)
                | (Assigned, Completed)
                | (Assigned, Failed)
                | (Assigned, Pending)
                | (Assigned, Cancelled)
                | (Running, Completed)
                | (Running, Failed)
                | (Running, Pending)
                | (Running, Cancelled)
                | (Running, Abandoned)
                | (Failed, Pending)
                | (Failed, Abandoned)
        )
    }
}

impl fmt::Display for TaskState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for TaskState {
    type Err = CoordinatorError;

    fn from_str(s: &str) -> CoordinatorResult<Self> {
        match s.to_ascii_uppercase().as_str() {
            "PENDING" => Ok(TaskState::Pending),
            "ASSIGNED" => Ok(TaskState::Assigned),
            "RUNNING" => Ok(TaskState::Running),
            "COMPLETED" => Ok(TaskState::Completed),
            "FAILED" => Ok(TaskState::Failed),
            "ABANDONED" => Ok(TaskState::Abandoned),
            "CANCELLED" => Ok(TaskState::Cancelled),
            _ => Err(CoordinatorError::Validation(format!("无效的任务状态: {s}"))),
        }
    }
}

/// 子任务之间的先后约束
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Default)]
#[serde(rename_all = "snake_case")]
pub enum ChildOrdering {
    /// 阻塞其后的所有兄弟任务
    MustPrecede,
    #[default]
    MayParallelize,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ChildLink {
    pub task_id: String,
    pub ordering: ChildOrdering,
}

/// 任务暂未被分配的原因
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum BlockedReason {
    /// 没有满足能力要求且有空闲槽位的Worker
    CapacityExhausted,
    ResourceQueued {
        position: usize,
        estimated_wait_seconds: u64,
    },
    AwaitingDependencies,
    Backoff { until: DateTime<Utc> },
}

/// 任务定义
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Task {
    pub id: String,
    pub description: serde_json::Value,
    pub required_capabilities: BTreeSet<String>,
    pub priority: TaskPriority,
    pub deadline: Option<DateTime<Utc>>,
    pub resource_keys: BTreeSet<String>,
    pub state: TaskState,
    pub assigned_worker: Option<String>,
    /// 从1开始计数，仅在任务自身失败后递增
    pub attempt: u32,
    pub max_attempts: Option<u32>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    pub parent_id: Option<String>,
    pub children: Vec<ChildLink>,
    /// 必须先完成的兄弟任务
    pub depends_on: Vec<String>,
    /// 最近一次进入Pending的时间，用于优先级老化
    pub waiting_since: DateTime<Utc>,
    pub not_before: Option<DateTime<Utc>>,
    pub response_deadline: Option<DateTime<Utc>>,
    pub last_status_at: Option<DateTime<Utc>>,
    pub heartbeat_requested_at: Option<DateTime<Utc>>,
    pub cancel_requested_at: Option<DateTime<Utc>>,
    pub blocked_reason: Option<BlockedReason>,
    pub progress_note: Option<String>,
    pub result: Option<serde_json::Value>,
    pub last_error: Option<String>,
    pub finished_at: Option<DateTime<Utc>>,
}

impl Task {
    pub fn new(
        description: serde_json::Value,
        required_capabilities: BTreeSet<String>,
        priority: TaskPriority,
        now: DateTime<Utc>,
    ) -> Self {
        Self {
            id: Uuid::new_v4().to_string(),
            description,
            required_capabilities,
            priority,
            deadline: None,
            resource_keys: BTreeSet::new(),
            state: TaskState::Pending,
            assigned_worker: None,
            attempt: 1,
            max_attempts: None,
            created_at: now,
            updated_at: now,
            parent_id: None,
            children: Vec::new(),
            depends_on: Vec::new(),
            waiting_since: now,
            not_before: None,
            response_deadline: None,
            last_status_at: None,
            heartbeat_requested_at: None,
            cancel_requested_at: None,
            blocked_reason: None,
            progress_note: None,
            result: None,
            last_error: None,
            finished_at: None,
        }
    }

    /// 组合任务只用于聚合子任务状态，本身不会被分配
    pub fn is_composite(&self) -> bool {
        !self.children.is_empty()
    }

    pub fn cancel_requested(&self) -> bool {
        self.cancel_requested_at.is_some()
    }

    /// 计算老化后的有效优先级：每等待一个阈值周期提升一级，已过截止时间的任务视为Urgent
    pub fn effective_priority(&self, now: DateTime<Utc>, aging_threshold_seconds: u64) -> TaskPriority {
        if self.deadline.is_some_and(|d| d <= now) {
            return TaskPriority::Urgent;
        }
        if aging_threshold_seconds == 0 {
            return self.priority;
        }
        let waited = (now - self.waiting_since).num_seconds().max(0) as u64;
        let levels = (waited / aging_threshold_seconds).min(u32::MAX as u64) as u32;
        self.priority.promoted_by(levels)
    }

    /// 是否已到可重新分配的时间（退避期已过）
    pub fn is_backoff_elapsed(&self, now: DateTime<Utc>) -> bool {
        self.not_before.map_or(true, |t| t <= now)
    }

    /// 状态转换，非法转换返回错误
    pub fn transition_to(&mut self, next: TaskState, now: DateTime<Utc>) -> CoordinatorResult<()> {
        if !self.state.can_transition_to(next) {
            return Err(CoordinatorError::InvalidStateTransition {
                id: self.id.clone(),
                from: self.state.to_string(),
                to: next.to_string(),
            });
        }
        self.state = next;
        self.updated_at = now;
        if matches!(
            next,
            TaskState::Completed | TaskState::Abandoned | TaskState::Cancelled
        ) {
            self.finished_at = Some(now);
        }
        Ok(())
    }

    /// 回到Pending等待重新调度，清理本次分配的运行期字段
    pub fn reset_to_pending(&mut self, now: DateTime<Utc>) -> CoordinatorResult<()> {
        self.transition_to(TaskState::Pending, now)?;
        self.assigned_worker = None;
        self.waiting_since = now;
        self.response_deadline = None;
        self.last_status_at = None;
        self.heartbeat_requested_at = None;
        self.blocked_reason = None;
        Ok(())
    }

    pub fn status(&self) -> TaskStatusView {
        TaskStatusView {
            task_id: self.id.clone(),
            state: self.state,
            assigned_worker: self.assigned_worker.clone(),
            attempt: self.attempt,
            last_update: self.updated_at,
            priority: self.priority,
            blocked_reason: self.blocked_reason.clone(),
            cancel_requested: self.cancel_requested(),
            progress_note: self.progress_note.clone(),
            last_error: self.last_error.clone(),
            result: self.result.clone(),
            parent_id: self.parent_id.clone(),
            children: self.children.iter().map(|c| c.task_id.clone()).collect(),
        }
    }
}

/// GetTaskStatus 的返回视图
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TaskStatusView {
    pub task_id: String,
    pub state: TaskState,
    pub assigned_worker: Option<String>,
    pub attempt: u32,
    pub last_update: DateTime<Utc>,
    pub priority: TaskPriority,
    pub blocked_reason: Option<BlockedReason>,
    pub cancel_requested: bool,
    pub progress_note: Option<String>,
    pub last_error: Option<String>,
    pub result: Option<serde_json::Value>,
    pub parent_id: Option<String>,
    pub children: Vec<String>,
}

/// 任务提交请求
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TaskSubmission {
    pub description: serde_json::Value,
    #[serde(default)]
    pub priority: TaskPriority,
    #[serde(default)]
    pub required_capabilities: Vec<String>,
    #[serde(default)]
    pub resource_keys: Vec<String>,
    #[serde(default)]
    pub deadline: Option<DateTime<Utc>>,
    #[serde(default)]
    pub max_attempts: Option<u32>,
    #[serde(default)]
    pub subtasks: Vec<SubtaskSubmission>,
}

impl TaskSubmission {
    pub fn new(description: serde_json::Value, capabilities: &[&str]) -> Self {
        Self {
            description,
            priority: TaskPriority::Normal,
            required_capabilities: capabilities.iter().map(|c| c.to_string()).collect(),
            resource_keys: Vec::new(),
            deadline: None,
            max_attempts: None,
            subtasks: Vec::new(),
        }
    }

    pub fn with_priority(mut self, priority: TaskPriority) -> Self {
        self.priority = priority;
        self
    }

    pub fn with_resources(mut self, keys: &[&str]) -> Self {
        self.resource_keys = keys.iter().map(|k| k.to_string()).collect();
        self
    }

    pub fn with_deadline(mut self, deadline: DateTime<Utc>) -> Self {
        self.deadline = Some(deadline);
        self
    }

    pub fn with_max_attempts(mut self, max_attempts: u32) -> Self {
        self.max_attempts = Some(max_attempts);
        self
    }

    pub fn with_subtask(mut self, subtask: SubtaskSubmission) -> Self {
        self.subtasks.push(subtask);
        self
    }

    /// 校验提交内容（不含子任务依赖图，依赖图由调度器单独校验）
    pub fn validate(&self, now: DateTime<Utc>) -> CoordinatorResult<()> {
        if self.description.is_null() {
            return Err(CoordinatorError::Validation("任务描述不能为空".to_string()));
        }
        validate_tags("能力标签", &self.required_capabilities)?;
        validate_tags("资源键", &self.resource_keys)?;
        if self.max_attempts == Some(0) {
            return Err(CoordinatorError::Validation(
                "最大尝试次数必须大于0".to_string(),
            ));
        }
        if let Some(deadline) = self.deadline {
            if deadline <= now - Duration::seconds(1) {
                return Err(CoordinatorError::Validation(format!(
                    "截止时间已过: {deadline}"
                )));
            }
        }
        for subtask in &self.subtasks {
            subtask.validate()?;
        }
        Ok(())
    }
}

/// 子任务提交内容，`key` 仅在本次提交内唯一
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SubtaskSubmission {
    pub key: String,
    pub description: serde_json::Value,
    #[serde(default)]
    pub priority: Option<TaskPriority>,
    #[serde(default)]
    pub required_capabilities: Vec<String>,
    #[serde(default)]
    pub resource_keys: Vec<String>,
    #[serde(default)]
    pub ordering: ChildOrdering,
    #[serde(default)]
    pub depends_on: Vec<String>,
    #[serde(default)]
    pub max_attempts: Option<u32>,
}

impl SubtaskSubmission {
    pub fn new(key: impl Into<String>, capabilities: &[&str]) -> Self {
        let key = key.into();
        Self {
            description: serde_json::json!({ "step": key }),
            key,
            priority: None,
            required_capabilities: capabilities.iter().map(|c| c.to_string()).collect(),
            resource_keys: Vec::new(),
            ordering: ChildOrdering::MayParallelize,
            depends_on: Vec::new(),
            max_attempts: None,
        }
    }

    pub fn must_precede(mut self) -> Self {
        self.ordering = ChildOrdering::MustPrecede;
        self
    }

    pub fn after(mut self, keys: &[&str]) -> Self {
        self.depends_on = keys.iter().map(|k| k.to_string()).collect();
        self
    }

    pub fn with_resources(mut self, keys: &[&str]) -> Self {
        self.resource_keys = keys.iter().map(|k| k.to_string()).collect();
        self
    }

    fn validate(&self) -> CoordinatorResult<()> {
        if self.key.trim().is_empty() {
            return Err(CoordinatorError::Validation("子任务key不能为空".to_string()));
        }
        if self.description.is_null() {
            return Err(CoordinatorError::Validation(format!(
                "子任务 {} 的描述不能为空",
                self.key
            )));
        }
        if self.max_attempts == Some(0) {
            return Err(CoordinatorError::Validation(format!(
                "子任务 {} 的最大尝试次数必须大于0",
                self.key
            )));
        }
        validate_tags("能力标签", &self.required_capabilities)?;
        validate_tags("资源键", &self.resource_keys)
    }
}

fn validate_tags(kind: &str, tags: &[String]) -> CoordinatorResult<()> {
    if tags.iter().any(|t| t.trim().is_empty()) {
        return Err(CoordinatorError::Validation(format!("{kind}不能为空字符串")));
    }
    Ok(())
}

/// ListTasks 过滤条件
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct TaskFilter {
    pub state: Option<TaskState>,
    pub worker_id: Option<String>,
    pub capability: Option<String>,
    pub parent_id: Option<String>,
    pub limit: Option<usize>,
}

impl TaskFilter {
    pub fn matches(&self, task: &Task) -> bool {
        self.state.map_or(true, |s| task.state == s)
            && self
                .worker_id
                .as_deref()
                .map_or(true, |w| task.assigned_worker.as_deref() == Some(w))
            && self
                .capability
                .as_deref()
                .map_or(true, |c| task.required_capabilities.contains(c))
            && self
                .parent_id
                .as_deref()
                .map_or(true, |p| task.parent_id.as_deref() == Some(p))
    }
}
