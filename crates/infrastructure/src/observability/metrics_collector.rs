//! Metrics collector for the task coordinator
//!
//! Thin wrapper over the `metrics` facade. Without an installed recorder every
//! call is a no-op, so components can always hold a collector.

use metrics::{counter, gauge, histogram, Counter, Gauge, Histogram};
use tracing::debug;

/// Metrics collector for the task coordinator
#[derive(Clone)]
pub struct MetricsCollector {
    // Task lifecycle metrics
    tasks_submitted_total: Counter,
    tasks_dispatched_total: Counter,
    tasks_completed_total: Counter,
    tasks_failed_total: Counter,
    tasks_retried_total: Counter,
    tasks_abandoned_total: Counter,
    tasks_requeued_total: Counter,
    tasks_cancelled_total: Counter,

    // Escalation metrics
    escalations_total: Counter,
    escalation_delivery_failures_total: Counter,

    // System metrics
    pending_tasks: Gauge,
    lock_waiters: Gauge,
    active_workers: Gauge,
    dispatch_tick_duration: Histogram,
}

impl MetricsCollector {
    pub fn new() -> Self {
        Self {
            tasks_submitted_total: counter!("coordinator_tasks_submitted_total"),
            tasks_dispatched_total: counter!("coordinator_tasks_dispatched_total"),
            tasks_completed_total: counter!("coordinator_tasks_completed_total"),
            tasks_failed_total: counter!("coordinator_tasks_failed_total"),
            tasks_retried_total: counter!("coordinator_tasks_retried_total"),
            tasks_abandoned_total: counter!("coordinator_tasks_abandoned_total"),
            tasks_requeued_total: counter!("coordinator_tasks_requeued_total"),
            tasks_cancelled_total: counter!("coordinator_tasks_cancelled_total"),
            escalations_total: counter!("coordinator_escalations_total"),
            escalation_delivery_failures_total: counter!(
                "coordinator_escalation_delivery_failures_total"
            ),
            pending_tasks: gauge!("coordinator_pending_tasks"),
            lock_waiters: gauge!("coordinator_lock_waiters"),
            active_workers: gauge!("coordinator_active_workers"),
            dispatch_tick_duration: histogram!("coordinator_dispatch_tick_duration_seconds"),
        }
    }

    // Task lifecycle metrics

    pub fn record_task_submitted(&self) {
        self.tasks_submitted_total.increment(1);
    }

    pub fn record_task_dispatched(&self, task_id: &str, worker_id: &str) {
        self.tasks_dispatched_total.increment(1);
        debug!(task_id = task_id, worker_id = worker_id, "Task dispatch recorded");
    }

    pub fn record_task_completed(&self) {
        self.tasks_completed_total.increment(1);
    }

    /// Record a failed attempt (regardless of whether it will be retried)
    pub fn record_task_failed(&self) {
        self.tasks_failed_total.increment(1);
    }

    pub fn record_task_retry(&self, attempt: u32) {
        self.tasks_retried_total.increment(1);
        debug!(attempt = attempt, "Task retry recorded");
    }

    pub fn record_task_abandoned(&self) {
        self.tasks_abandoned_total.increment(1);
    }

    /// Record an infrastructure requeue (does not consume a retry attempt)
    pub fn record_task_requeued(&self, reason: &str) {
        self.tasks_requeued_total.increment(1);
        debug!(reason = reason, "Task requeue recorded");
    }

    pub fn record_task_cancelled(&self) {
        self.tasks_cancelled_total.increment(1);
    }

    // Escalation metrics

    pub fn record_escalation(&self, reason: &str) {
        self.escalations_total.increment(1);
        debug!(reason = reason, "Escalation recorded");
    }

    pub fn record_escalation_delivery_failure(&self) {
        self.escalation_delivery_failures_total.increment(1);
    }

    // System metrics

    pub fn update_pending_tasks(&self, count: f64) {
        self.pending_tasks.set(count);
    }

    pub fn update_lock_waiters(&self, count: f64) {
        self.lock_waiters.set(count);
    }

    pub fn update_active_workers(&self, count: f64) {
        self.active_workers.set(count);
    }

    pub fn record_dispatch_tick(&self, duration_seconds: f64) {
        self.dispatch_tick_duration.record(duration_seconds);
    }
}

impl Default for MetricsCollector {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Debug for MetricsCollector {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MetricsCollector").finish_non_exhaustive()
    }
}
