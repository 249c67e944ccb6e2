use std::sync::Arc;
use std::time::Duration as StdDuration;

use chrono::{DateTime, Duration, Utc};
use serde::Serialize;
use serde_json::json;
use tokio::sync::broadcast;
use tracing::{debug, info, warn};

use coordinator_core::{
    CoordinatorError, CoordinatorResult, EscalationReason, EscalationRecord, LivenessConfig, TaskState,
};
use coordinator_infrastructure::StructuredLogger;

use crate::dispatcher::{StuckAction, TaskDispatcher};

/// 一次巡检的结果
#[derive(Debug, Clone, Default, Serialize)]
pub struct SweepReport {
    pub degraded_workers: Vec<String>,
    pub offline_workers: Vec<String>,
    pub deregistered_workers: Vec<String>,
    pub requeued_tasks: usize,
    pub heartbeat_requests: usize,
    pub stuck_tasks_requeued: usize,
    pub cancels_finalized: usize,
    pub lock_wait_escalations: usize,
    pub purged_tasks: usize,
    pub redelivered_messages: usize,
}

/// 存活监控：Worker心跳超时、任务响应超时、卡住任务、取消确认超时和资源等待超时
pub struct LivenessMonitor {
    dispatcher: Arc<TaskDispatcher>,
    config: LivenessConfig,
}

impl LivenessMonitor {
    pub fn new(dispatcher: Arc<TaskDispatcher>, config: LivenessConfig) -> Self {
        Self { dispatcher, config }
    }

    pub async fn sweep(&self) -> SweepReport {
        self.sweep_at(Utc::now()).await
    }

    pub async fn sweep_at(&self, now: DateTime<Utc>) -> SweepReport {
        let mut report = SweepReport::default();

        if let Err(e) = self.sweep_workers(now, &mut report).await {
            StructuredLogger::log_system_error("liveness", "sweep_workers", &e);
        }
        if let Err(e) = self.sweep_tasks(now, &mut report).await {
            StructuredLogger::log_system_error("liveness", "sweep_tasks", &e);
        }
        self.sweep_lock_waiters(now, &mut report).await;

        match self.dispatcher.bus().redeliver_unacked(now).await {
            Ok(count) => report.redelivered_messages = count,
            Err(e) => StructuredLogger::log_system_error("liveness", "redeliver_unacked", &e),
        }

        report.purged_tasks = self.dispatcher.purge_terminal_at(now).await;
        let compacted = self.dispatcher.locks().compact().await;
        if compacted > 0 {
            debug!("清理了 {} 个空闲资源键", compacted);
        }

        if !report.offline_workers.is_empty() || report.requeued_tasks > 0 {
            info!(
                "巡检完成: 离线Worker {:?}，重新排队任务 {} 个",
                report.offline_workers, report.requeued_tasks
            );
        }
        report
    }

    async fn sweep_workers(&self, now: DateTime<Utc>, report: &mut SweepReport) -> CoordinatorResult<()> {
        let registry = self.dispatcher.registry();
        let offline_cutoff = now - Duration::seconds(self.config.offline_timeout_seconds as i64);
        let degraded_cutoff = now - Duration::seconds(self.config.heartbeat_timeout_seconds as i64);
        let deregister_cutoff = now - Duration::seconds(self.config.deregister_after_seconds as i64);

        for worker_id in registry.worker_ids().await {
            if let Some(tasks) = registry.mark_offline_if_silent(&worker_id, offline_cutoff).await {
                warn!(
                    "Worker {} 超过 {} 秒无心跳，标记为离线，回收 {} 个任务",
                    worker_id,
                    self.config.offline_timeout_seconds,
                    tasks.len()
                );
                report.offline_workers.push(worker_id.clone());
                for task_id in &tasks {
                    if self
                        .dispatcher
                        .requeue_for_infrastructure(task_id, Some(&worker_id), "heartbeat_lost", now)
                        .await?
                    {
                        report.requeued_tasks += 1;
                    }
                }
            } else if registry.mark_degraded_if_silent(&worker_id, degraded_cutoff).await {
                report.degraded_workers.push(worker_id.clone());
            }

            if let Some(tasks) = registry.deregister_if_silent(&worker_id, deregister_cutoff).await {
                info!("Worker {} 持续离线，已注销", worker_id);
                for task_id in &tasks {
                    self.dispatcher
                        .requeue_for_infrastructure(task_id, Some(&worker_id), "worker_deregistered", now)
                        .await?;
                }
                self.dispatcher.bus().unregister_recipient(&worker_id).await?;
                report.deregistered_workers.push(worker_id);
            }
        }
        Ok(())
    }

    async fn sweep_tasks(&self, now: DateTime<Utc>, report: &mut SweepReport) -> CoordinatorResult<()> {
        let stuck_after = Duration::seconds(self.config.stuck_task_seconds as i64);
        let grace = Duration::seconds(self.config.heartbeat_grace_seconds as i64);
        let ack_timeout = Duration::seconds(self.config.cancel_ack_timeout_seconds as i64);

        for handle in self.dispatcher.store().handles().await {
            let (state, cancel_requested) = {
                let task = handle.lock().await;
                (task.state, task.cancel_requested())
            };
            if !state.is_live() {
                continue;
            }

            if cancel_requested {
                if self.dispatcher.expire_cancel_at(&handle.id, ack_timeout, now).await? {
                    report.cancels_finalized += 1;
                }
                continue;
            }

            match state {
                TaskState::Assigned => {
                    if self.dispatcher.expire_assignment_at(&handle.id, now).await? {
                        report.requeued_tasks += 1;
                    }
                }
                TaskState::Running => {
                    match self
                        .dispatcher
                        .check_stuck_at(&handle.id, stuck_after, grace, now)
                        .await?
                    {
                        StuckAction::HeartbeatRequested => report.heartbeat_requests += 1,
                        StuckAction::Requeued => {
                            report.stuck_tasks_requeued += 1;
                            report.requeued_tasks += 1;
                        }
                        StuckAction::None => {}
                    }
                }
                _ => {}
            }
        }
        Ok(())
    }

    /// 资源等待超时只升级通知，任务保留在等待队列中
    async fn sweep_lock_waiters(&self, now: DateTime<Utc>, report: &mut SweepReport) {
        let locks = self.dispatcher.locks();
        for waiter in locks.overdue_waiters(now, locks.max_wait_seconds()).await {
            let mut holders = Vec::new();
            for key in &waiter.resource_keys {
                if let Some(holder) = locks.holder_of(key).await {
                    holders.push(json!({ "resource_key": key, "holder": holder }));
                }
            }
            let timeout = CoordinatorError::LockWaitTimeout {
                task_id: waiter.task_id.clone(),
                keys: waiter.resource_keys.clone(),
                waited_seconds: waiter.waited_seconds,
            };
            let record = EscalationRecord::new(
                waiter.task_id.clone(),
                EscalationReason::UnresolvableConflict,
                json!({
                    "error": timeout.to_string(),
                    "resource_keys": waiter.resource_keys,
                    "waited_seconds": waiter.waited_seconds,
                    "holders": holders,
                }),
            );
            if self.dispatcher.escalation().escalate(record).await {
                report.lock_wait_escalations += 1;
            }
        }
    }

    /// 按配置间隔周期巡检，直到收到关闭信号
    pub async fn run(&self, mut shutdown_rx: broadcast::Receiver<()>) {
        let period = StdDuration::from_secs(self.config.sweep_interval_seconds.max(1));
        let mut interval = tokio::time::interval(period);
        info!("存活监控已启动，巡检间隔 {:?}", period);

        loop {
            tokio::select! {
                _ = interval.tick() => {
                    self.sweep().await;
                }
                _ = shutdown_rx.recv() => {
                    info!("存活监控收到关闭信号");
                    break;
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use coordinator_core::{AppConfig, MessageBus, TaskSubmission, WorkerHeartbeat, WorkerRegistration, WorkerStatus};
    use coordinator_infrastructure::{InMemoryMessageBus, MemoryEscalationSink};

    use crate::escalation::EscalationChannel;

    fn dispatcher() -> Arc<TaskDispatcher> {
        let config = AppConfig::default();
        let bus: Arc<dyn MessageBus> = Arc::new(InMemoryMessageBus::new());
        let escalation = Arc::new(EscalationChannel::new(
            Arc::new(MemoryEscalationSink::new()),
            None,
            config.escalation.clone(),
            "dispatcher",
        ));
        Arc::new(TaskDispatcher::new(&config, bus, escalation))
    }

    #[tokio::test]
    async fn test_silent_worker_degrades_then_goes_offline() {
        let dispatcher = dispatcher();
        let monitor = LivenessMonitor::new(dispatcher.clone(), LivenessConfig::default());
        let start = Utc::now();

        dispatcher
            .register_worker(WorkerRegistration::new("w-1", &["build"], 1))
            .await
            .unwrap();
        dispatcher
            .heartbeat_at(&WorkerHeartbeat::new("w-1", WorkerStatus::Idle, 0), start)
            .await
            .unwrap();

        let report = monitor.sweep_at(start + Duration::seconds(121)).await;
        assert_eq!(report.degraded_workers, vec!["w-1".to_string()]);

        let report = monitor.sweep_at(start + Duration::seconds(301)).await;
        assert_eq!(report.offline_workers, vec!["w-1".to_string()]);

        let report = monitor.sweep_at(start + Duration::seconds(3601)).await;
        assert_eq!(report.deregistered_workers, vec!["w-1".to_string()]);
        assert!(!dispatcher.registry().contains("w-1").await);
    }

    #[tokio::test]
    async fn test_unstarted_assignment_is_requeued_after_deadline() {
        let dispatcher = dispatcher();
        let monitor = LivenessMonitor::new(dispatcher.clone(), LivenessConfig::default());
        let start = Utc::now();

        dispatcher
            .register_worker(WorkerRegistration::new("w-1", &["build"], 1))
            .await
            .unwrap();
        dispatcher
            .heartbeat_at(&WorkerHeartbeat::new("w-1", WorkerStatus::Idle, 0), start)
            .await
            .unwrap();
        let task_id = dispatcher
            .submit_task_at(TaskSubmission::new(json!({}), &["build"]), start)
            .await
            .unwrap();
        dispatcher.dispatch_tick_at(start).await;

        let report = monitor.sweep_at(start + Duration::seconds(61)).await;
        assert_eq!(report.requeued_tasks, 1);

        let status = dispatcher.get_task_status(&task_id).await.unwrap();
        assert_eq!(status.state, TaskState::Pending);
        assert_eq!(status.attempt, 1);
    }
}
