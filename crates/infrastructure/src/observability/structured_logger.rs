//! Structured logging utilities
//!
//! Event-shaped log records for task and worker lifecycle transitions.

use chrono::{DateTime, Utc};
use tracing::{debug, error, info, warn};

/// Structured logging utilities
pub struct StructuredLogger;

impl StructuredLogger {
    /// Log task submission
    pub fn log_task_submitted(task_id: &str, priority: &str, capabilities: &[String], children: usize) {
        info!(
            event = "task_submitted",
            task.id = task_id,
            task.priority = priority,
            task.capabilities = ?capabilities,
            task.children = children,
            "Task submitted"
        );
    }

    /// Log task assignment
    pub fn log_task_assigned(task_id: &str, worker_id: &str, attempt: u32, respond_by: DateTime<Utc>) {
        info!(
            event = "task_assigned",
            task.id = task_id,
            worker.id = worker_id,
            task.attempt = attempt,
            task.respond_by = %respond_by,
            "Task assigned to worker"
        );
    }

    /// Log task state transition
    pub fn log_task_state_change(task_id: &str, from: &str, to: &str, worker_id: Option<&str>) {
        info!(
            event = "task_state_change",
            task.id = task_id,
            task.from = from,
            task.to = to,
            worker.id = worker_id,
            "Task state changed"
        );
    }

    /// Log task retry
    pub fn log_task_retry(task_id: &str, attempt: u32, max_attempts: u32, not_before: DateTime<Utc>, reason: &str) {
        warn!(
            event = "task_retry",
            task.id = task_id,
            task.attempt = attempt,
            task.max_attempts = max_attempts,
            task.not_before = %not_before,
            task.retry_reason = reason,
            "Task retry scheduled"
        );
    }

    /// Log infrastructure requeue
    pub fn log_task_requeued(task_id: &str, worker_id: Option<&str>, reason: &str) {
        warn!(
            event = "task_requeued",
            task.id = task_id,
            worker.id = worker_id,
            task.requeue_reason = reason,
            "Task returned to pending without consuming an attempt"
        );
    }

    /// Log worker registration
    pub fn log_worker_registered(worker_id: &str, role: &str, capabilities: &[String], max_concurrency: u32) {
        info!(
            event = "worker_registered",
            worker.id = worker_id,
            worker.role = role,
            worker.capabilities = ?capabilities,
            worker.max_concurrency = max_concurrency,
            "Worker registered with coordinator"
        );
    }

    /// Log worker heartbeat
    pub fn log_worker_heartbeat(worker_id: &str, status: &str, reported_load: u32, active_tasks: usize) {
        debug!(
            event = "worker_heartbeat",
            worker.id = worker_id,
            worker.status = status,
            worker.reported_load = reported_load,
            worker.active_tasks = active_tasks,
            "Worker heartbeat received"
        );
    }

    /// Log worker status change
    pub fn log_worker_status_change(worker_id: &str, from: &str, to: &str, reason: &str) {
        warn!(
            event = "worker_status_change",
            worker.id = worker_id,
            worker.from = from,
            worker.to = to,
            worker.reason = reason,
            "Worker status changed"
        );
    }

    /// Log resource lock event
    pub fn log_lock_event(task_id: &str, keys: &[String], outcome: &str) {
        debug!(
            event = "resource_lock",
            task.id = task_id,
            lock.keys = ?keys,
            lock.outcome = outcome,
            "Resource lock event"
        );
    }

    /// Log escalation
    pub fn log_escalation(task_id: &str, reason: &str, accepted: bool) {
        if accepted {
            warn!(
                event = "escalation_raised",
                task.id = task_id,
                escalation.reason = reason,
                "Escalation raised"
            );
        } else {
            debug!(
                event = "escalation_deduplicated",
                task.id = task_id,
                escalation.reason = reason,
                "Escalation already pending for this condition"
            );
        }
    }

    /// Log system error
    pub fn log_system_error(component: &str, operation: &str, error: &dyn std::error::Error) {
        error!(
            event = "system_error",
            error.component = component,
            error.operation = operation,
            error.message = %error,
            "System error occurred"
        );
    }
}
