use std::collections::{HashSet, VecDeque};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use super::{EscalationRecord, Task, TaskPriority, WorkerHeartbeat};

/// 消息接收方：指定Worker（或任意命名邮箱）或广播
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(tag = "kind", content = "id", rename_all = "snake_case")]
pub enum Recipient {
    Worker(String),
    Broadcast,
}

impl Recipient {
    pub fn worker(id: impl Into<String>) -> Self {
        Recipient::Worker(id.into())
    }
}

/// 总线消息，发布后不可变
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Message {
    pub id: String,
    pub message_type: MessageType,
    pub sender: String,
    pub recipient: Recipient,
    pub timestamp: DateTime<Utc>,
    pub retry_count: u32,
    pub correlation_id: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type")]
pub enum MessageType {
    TaskAssignment(TaskAssignmentMessage),
    StatusUpdate(StatusUpdateMessage),
    TaskComplete(TaskCompleteMessage),
    TaskFailed(TaskFailedMessage),
    HeartbeatRequest(HeartbeatRequestMessage),
    Escalation(EscalationRecord),
    TaskCancellation(TaskCancellationMessage),
    ResourceAvailable(ResourceAvailableMessage),
    WorkerHeartbeat(WorkerHeartbeat),
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TaskAssignmentMessage {
    pub task_id: String,
    pub description: serde_json::Value,
    pub required_capabilities: Vec<String>,
    pub resource_keys: Vec<String>,
    pub priority: TaskPriority,
    pub attempt: u32,
    pub deadline: Option<DateTime<Utc>>,
    pub respond_by: Option<DateTime<Utc>>,
}

impl TaskAssignmentMessage {
    pub fn from_task(task: &Task) -> Self {
        Self {
            task_id: task.id.clone(),
            description: task.description.clone(),
            required_capabilities: task.required_capabilities.iter().cloned().collect(),
            resource_keys: task.resource_keys.iter().cloned().collect(),
            priority: task.priority,
            attempt: task.attempt,
            deadline: task.deadline,
            respond_by: task.response_deadline,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StatusUpdateMessage {
    pub task_id: String,
    pub worker_id: String,
    pub note: Option<String>,
    pub timestamp: DateTime<Utc>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TaskCompleteMessage {
    pub task_id: String,
    pub worker_id: String,
    pub result: serde_json::Value,
    pub timestamp: DateTime<Utc>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TaskFailedMessage {
    pub task_id: String,
    pub worker_id: String,
    pub error: String,
    pub timestamp: DateTime<Utc>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HeartbeatRequestMessage {
    pub task_id: String,
    pub worker_id: String,
    pub reply_by: DateTime<Utc>,
}

/// 取消请求（核心→Worker）与取消确认（Worker→核心）共用
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TaskCancellationMessage {
    pub task_id: String,
    pub worker_id: String,
    pub timestamp: DateTime<Utc>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ResourceAvailableMessage {
    pub resource_keys: Vec<String>,
    pub granted_to: String,
    pub timestamp: DateTime<Utc>,
}

impl Message {
    fn new(sender: &str, recipient: Recipient, message_type: MessageType) -> Self {
        Self {
            id: Uuid::new_v4().to_string(),
            message_type,
            sender: sender.to_string(),
            recipient,
            timestamp: Utc::now(),
            retry_count: 0,
            correlation_id: None,
        }
    }

    pub fn task_assignment(sender: &str, worker_id: &str, message: TaskAssignmentMessage) -> Self {
        let correlation_id = message.task_id.clone();
        Self::new(sender, Recipient::worker(worker_id), MessageType::TaskAssignment(message))
            .with_correlation_id(correlation_id)
    }

    pub fn status_update(recipient: &str, message: StatusUpdateMessage) -> Self {
        let sender = message.worker_id.clone();
        Self::new(&sender, Recipient::worker(recipient), MessageType::StatusUpdate(message))
    }

    pub fn task_complete(recipient: &str, message: TaskCompleteMessage) -> Self {
        let sender = message.worker_id.clone();
        Self::new(&sender, Recipient::worker(recipient), MessageType::TaskComplete(message))
    }

    pub fn task_failed(recipient: &str, message: TaskFailedMessage) -> Self {
        let sender = message.worker_id.clone();
        Self::new(&sender, Recipient::worker(recipient), MessageType::TaskFailed(message))
    }

    pub fn heartbeat_request(sender: &str, message: HeartbeatRequestMessage) -> Self {
        let recipient = Recipient::worker(message.worker_id.clone());
        let correlation_id = message.task_id.clone();
        Self::new(sender, recipient, MessageType::HeartbeatRequest(message))
            .with_correlation_id(correlation_id)
    }

    pub fn escalation(sender: &str, recipient: &str, record: EscalationRecord) -> Self {
        let correlation_id = record.idempotency_key();
        Self::new(sender, Recipient::worker(recipient), MessageType::Escalation(record))
            .with_correlation_id(correlation_id)
    }

    pub fn task_cancellation(sender: &str, recipient: &str, message: TaskCancellationMessage) -> Self {
        let correlation_id = message.task_id.clone();
        Self::new(sender, Recipient::worker(recipient), MessageType::TaskCancellation(message))
            .with_correlation_id(correlation_id)
    }

    pub fn resource_available(sender: &str, message: ResourceAvailableMessage) -> Self {
        Self::new(sender, Recipient::Broadcast, MessageType::ResourceAvailable(message))
    }

    pub fn worker_heartbeat(recipient: &str, heartbeat: WorkerHeartbeat) -> Self {
        let sender = heartbeat.worker_id.clone();
        Self::new(&sender, Recipient::worker(recipient), MessageType::WorkerHeartbeat(heartbeat))
    }

    pub fn increment_retry(&mut self) {
        self.retry_count += 1;
    }

    pub fn with_correlation_id(mut self, correlation_id: String) -> Self {
        self.correlation_id = Some(correlation_id);
        self
    }

    pub fn serialize(&self) -> Result<String, serde_json::Error> {
        serde_json::to_string(self)
    }

    pub fn deserialize(json: &str) -> Result<Self, serde_json::Error> {
        serde_json::from_str(json)
    }

    pub fn message_type_str(&self) -> &'static str {
        match &self.message_type {
            MessageType::TaskAssignment(_) => "task_assignment",
            MessageType::StatusUpdate(_) => "status_update",
            MessageType::TaskComplete(_) => "task_complete",
            MessageType::TaskFailed(_) => "task_failed",
            MessageType::HeartbeatRequest(_) => "heartbeat_request",
            MessageType::Escalation(_) => "escalation",
            MessageType::TaskCancellation(_) => "task_cancellation",
            MessageType::ResourceAvailable(_) => "resource_available",
            MessageType::WorkerHeartbeat(_) => "worker_heartbeat",
        }
    }

    pub fn routing_key(&self) -> String {
        match &self.message_type {
            MessageType::TaskAssignment(msg) => format!("task.assignment.{}", msg.task_id),
            MessageType::StatusUpdate(msg) => format!("task.status.{}", msg.task_id),
            MessageType::TaskComplete(msg) => format!("task.complete.{}", msg.task_id),
            MessageType::TaskFailed(msg) => format!("task.failed.{}", msg.task_id),
            MessageType::HeartbeatRequest(msg) => format!("worker.heartbeat_request.{}", msg.worker_id),
            MessageType::Escalation(record) => {
                format!("escalation.{}", record.reason.as_str().to_lowercase())
            }
            MessageType::TaskCancellation(msg) => format!("task.cancel.{}", msg.task_id),
            MessageType::ResourceAvailable(msg) => format!("resource.available.{}", msg.granted_to),
            MessageType::WorkerHeartbeat(hb) => format!("worker.heartbeat.{}", hb.worker_id),
        }
    }
}

/// 消息在总线上的投递状态
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DeliveryState {
    /// 在邮箱中等待消费
    Pending,
    /// 已取出，等待确认
    InFlight,
    Acknowledged,
}

/// 单条消息的状态查询结果
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MessageStatus {
    pub message_id: String,
    pub state: DeliveryState,
    pub sender: String,
    /// 消息所在（或最后所在）的邮箱
    pub recipient: String,
    pub message_type: String,
    pub retry_count: u32,
    pub published_at: DateTime<Utc>,
}

impl MessageStatus {
    pub fn new(message: &Message, recipient: &str, state: DeliveryState) -> Self {
        Self {
            message_id: message.id.clone(),
            state,
            sender: message.sender.clone(),
            recipient: recipient.to_string(),
            message_type: message.message_type_str().to_string(),
            retry_count: message.retry_count,
            published_at: message.timestamp,
        }
    }
}

/// 按消息ID去重，保留最近 `capacity` 个ID
#[derive(Debug)]
pub struct MessageDeduplicator {
    capacity: usize,
    seen: HashSet<String>,
    order: VecDeque<String>,
}

impl MessageDeduplicator {
    pub fn new(capacity: usize) -> Self {
        Self {
            capacity: capacity.max(1),
            seen: HashSet::new(),
            order: VecDeque::new(),
        }
    }

    /// 首次出现返回true，重复出现返回false
    pub fn check_and_record(&mut self, message_id: &str) -> bool {
        if self.seen.contains(message_id) {
            return false;
        }
        if self.order.len() >= self.capacity {
            if let Some(oldest) = self.order.pop_front() {
                self.seen.remove(&oldest);
            }
        }
        self.seen.insert(message_id.to_string());
        self.order.push_back(message_id.to_string());
        true
    }

    pub fn len(&self) -> usize {
        self.order.len()
    }

    pub fn is_empty(&self) -> bool {
        self.order.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::{EscalationReason, WorkerStatus};
    use serde_json::json;

    #[test]
    fn test_task_assignment_message() {
        let mut task = Task::new(
            json!({"action": "deploy"}),
            ["deploy".to_string()].into_iter().collect(),
            TaskPriority::High,
            Utc::now(),
        );
        task.resource_keys.insert("env:prod".to_string());

        let message = Message::task_assignment(
            "dispatcher",
            "worker-1",
            TaskAssignmentMessage::from_task(&task),
        );

        assert!(!message.id.is_empty());
        assert_eq!(message.sender, "dispatcher");
        assert_eq!(message.recipient, Recipient::worker("worker-1"));
        assert_eq!(message.correlation_id.as_deref(), Some(task.id.as_str()));
        assert_eq!(message.message_type_str(), "task_assignment");

        if let MessageType::TaskAssignment(msg) = &message.message_type {
            assert_eq!(msg.resource_keys, vec!["env:prod".to_string()]);
            assert_eq!(msg.priority, TaskPriority::High);
            assert_eq!(msg.attempt, 1);
        } else {
            panic!("Expected TaskAssignment message type");
        }
    }

    #[test]
    fn test_worker_reports_are_addressed_to_dispatcher() {
        let message = Message::task_complete(
            "dispatcher",
            TaskCompleteMessage {
                task_id: "t-1".to_string(),
                worker_id: "w-1".to_string(),
                result: json!({"ok": true}),
                timestamp: Utc::now(),
            },
        );
        assert_eq!(message.sender, "w-1");
        assert_eq!(message.recipient, Recipient::worker("dispatcher"));
        assert_eq!(message.routing_key(), "task.complete.t-1");

        let heartbeat = Message::worker_heartbeat(
            "dispatcher",
            WorkerHeartbeat::new("w-1", WorkerStatus::Idle, 0),
        );
        assert_eq!(heartbeat.routing_key(), "worker.heartbeat.w-1");
    }

    #[test]
    fn test_message_serialization_round_trip() {
        let record = EscalationRecord::new("t-9", EscalationReason::ApprovalRequired, json!({}));
        let message = Message::escalation("dispatcher", "escalations", record);
        let json = message.serialize().unwrap();
        assert!(json.contains("\"type\":\"Escalation\""));

        let parsed = Message::deserialize(&json).unwrap();
        assert_eq!(parsed.id, message.id);
        assert_eq!(parsed.routing_key(), "escalation.approval_required");
    }

    #[test]
    fn test_broadcast_recipient_serialization() {
        let message = Message::resource_available(
            "dispatcher",
            ResourceAvailableMessage {
                resource_keys: vec!["branch:main".to_string()],
                granted_to: "t-2".to_string(),
                timestamp: Utc::now(),
            },
        );
        let value = serde_json::to_value(&message).unwrap();
        assert_eq!(value["recipient"]["kind"], "broadcast");
    }

    #[test]
    fn test_deduplicator_window() {
        let mut dedup = MessageDeduplicator::new(2);
        assert!(dedup.check_and_record("a"));
        assert!(!dedup.check_and_record("a"));
        assert!(dedup.check_and_record("b"));
        assert!(dedup.check_and_record("c"));
        // "a" 已被挤出窗口
        assert!(dedup.check_and_record("a"));
        assert_eq!(dedup.len(), 2);
    }
}
