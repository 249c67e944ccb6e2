use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Instant;

use chrono::{DateTime, Duration, Utc};
use serde::Serialize;
use serde_json::json;
use tokio::sync::Notify;
use tracing::{debug, error, info, warn};

use coordinator_core::{
    AppConfig, AuditConfig, BlockedReason, ChildLink, CoordinatorError, CoordinatorResult,
    DispatcherConfig, EscalationReason, EscalationRecord, HeartbeatRequestMessage, Message,
    MessageBus, RegistrationOutcome, ResourceAvailableMessage, Task, TaskAssignmentMessage,
    TaskCancellationMessage, TaskFilter, TaskPriority, TaskState, TaskStatusView, TaskSubmission,
    WorkerFilter, WorkerHeartbeat, WorkerInfo, WorkerRegistration,
};
use coordinator_infrastructure::{MetricsCollector, StructuredLogger};

use crate::dependency_checker::{DependencyCheckResult, DependencyChecker};
use crate::escalation::EscalationChannel;
use crate::lock_table::{Grant, LockOutcome, LockView, ResourceLockTable};
use crate::registry::{HeartbeatOutcome, RegistryStats, SlotRelease, WorkerRegistry};
use crate::retry_policy::RetryPolicy;
use crate::strategies::strategy_from_name;
use crate::task_store::{TaskHandle, TaskStore};

/// 一次调度tick的统计
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct DispatchReport {
    pub examined: usize,
    pub assigned: usize,
    pub blocked: usize,
}

/// 卡住检测的处理结果
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StuckAction {
    None,
    HeartbeatRequested,
    Requeued,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum DispatchAttempt {
    Assigned,
    Blocked,
    Skipped,
}

/// 系统统计信息
#[derive(Debug, Clone, Serialize)]
pub struct SystemStats {
    pub workers: RegistryStats,
    pub tasks_by_state: BTreeMap<String, usize>,
    pub total_tasks: usize,
    pub resource_locks: Vec<LockView>,
    pub lock_waiters: usize,
    pub escalations_pending: usize,
    pub timestamp: DateTime<Utc>,
}

/// 释放任务锁之后才执行的后续动作
#[derive(Debug, Default)]
struct FollowUp {
    grants: Vec<Grant>,
    parent: Option<String>,
    escalation: Option<EscalationRecord>,
}

/// 任务调度器
///
/// 持有任务表、Worker注册表和资源锁表，负责任务状态机的全部转换。
/// 加锁顺序固定为 任务 → 资源键（字典序） → Worker，任何时候最多持有一个任务锁。
pub struct TaskDispatcher {
    store: TaskStore,
    registry: WorkerRegistry,
    locks: ResourceLockTable,
    retry: RetryPolicy,
    escalation: Arc<EscalationChannel>,
    bus: Arc<dyn MessageBus>,
    config: DispatcherConfig,
    audit: AuditConfig,
    metrics: MetricsCollector,
    trigger: Notify,
}

impl TaskDispatcher {
    pub fn new(
        config: &AppConfig,
        bus: Arc<dyn MessageBus>,
        escalation: Arc<EscalationChannel>,
    ) -> Self {
        let strategy = strategy_from_name(&config.dispatcher.selection_strategy);
        Self {
            store: TaskStore::new(),
            registry: WorkerRegistry::new(config.registry.clone(), strategy),
            locks: ResourceLockTable::new(config.locks.clone()),
            retry: RetryPolicy::new(config.retry.clone()),
            escalation,
            bus,
            config: config.dispatcher.clone(),
            audit: config.audit.clone(),
            metrics: MetricsCollector::new(),
            trigger: Notify::new(),
        }
    }

    pub fn registry(&self) -> &WorkerRegistry {
        &self.registry
    }

    pub fn locks(&self) -> &ResourceLockTable {
        &self.locks
    }

    pub fn store(&self) -> &TaskStore {
        &self.store
    }

    pub fn escalation(&self) -> &Arc<EscalationChannel> {
        &self.escalation
    }

    pub fn bus(&self) -> &Arc<dyn MessageBus> {
        &self.bus
    }

    pub fn config(&self) -> &DispatcherConfig {
        &self.config
    }

    /// 等待下一次事件触发（新任务提交、资源释放、Worker恢复等）
    pub async fn dispatch_requested(&self) {
        self.trigger.notified().await;
    }

    fn request_dispatch(&self) {
        self.trigger.notify_one();
    }

    // ---------------------------------------------------------------------
    // 任务提交
    // ---------------------------------------------------------------------

    pub async fn submit_task(&self, submission: TaskSubmission) -> CoordinatorResult<String> {
        self.submit_task_at(submission, Utc::now()).await
    }

    /// 校验并提交任务；带子任务时父任务只做状态聚合，子任务按依赖图进入调度
    pub async fn submit_task_at(
        &self,
        submission: TaskSubmission,
        now: DateTime<Utc>,
    ) -> CoordinatorResult<String> {
        submission.validate(now)?;

        let graph = if submission.subtasks.is_empty() {
            None
        } else {
            if !submission.resource_keys.is_empty() {
                return Err(CoordinatorError::Validation(
                    "带子任务的组合任务不能声明资源键".to_string(),
                ));
            }
            Some(DependencyChecker::build_precedence(&submission.subtasks)?)
        };

        let mut parent = Task::new(
            submission.description,
            submission.required_capabilities.into_iter().collect(),
            submission.priority,
            now,
        );
        parent.deadline = submission.deadline;
        parent.resource_keys = submission.resource_keys.into_iter().collect();
        parent.max_attempts = submission.max_attempts;

        let mut children: Vec<Task> = Vec::with_capacity(submission.subtasks.len());
        for subtask in &submission.subtasks {
            let mut child = Task::new(
                subtask.description.clone(),
                subtask.required_capabilities.iter().cloned().collect(),
                subtask.priority.unwrap_or(parent.priority),
                now,
            );
            child.deadline = parent.deadline;
            child.resource_keys = subtask.resource_keys.iter().cloned().collect();
            child.max_attempts = subtask.max_attempts.or(parent.max_attempts);
            child.parent_id = Some(parent.id.clone());
            children.push(child);
        }

        if let Some(graph) = &graph {
            let ids: Vec<String> = children.iter().map(|c| c.id.clone()).collect();
            for (child, preds) in children.iter_mut().zip(&graph.predecessors) {
                child.depends_on = preds.iter().map(|&p| ids[p].clone()).collect();
            }
            parent.children = submission
                .subtasks
                .iter()
                .zip(&ids)
                .map(|(subtask, id)| ChildLink {
                    task_id: id.clone(),
                    ordering: subtask.ordering,
                })
                .collect();
        }

        let task_id = parent.id.clone();
        let capabilities: Vec<String> = parent.required_capabilities.iter().cloned().collect();
        StructuredLogger::log_task_submitted(
            &task_id,
            parent.priority.as_str(),
            &capabilities,
            children.len(),
        );

        let child_count = children.len();
        let mut tasks = Vec::with_capacity(child_count + 1);
        tasks.push(parent);
        tasks.extend(children);
        self.store.insert_all(tasks).await?;

        for _ in 0..=child_count {
            self.metrics.record_task_submitted();
        }
        self.request_dispatch();
        Ok(task_id)
    }

    // ---------------------------------------------------------------------
    // 调度
    // ---------------------------------------------------------------------

    pub async fn dispatch_tick(&self) -> DispatchReport {
        self.dispatch_tick_at(Utc::now()).await
    }

    /// 按有效优先级（老化后）降序、提交顺序升序遍历Pending任务并尝试分配
    pub async fn dispatch_tick_at(&self, now: DateTime<Utc>) -> DispatchReport {
        let started = Instant::now();

        let mut queue: Vec<(TaskPriority, u64, Arc<TaskHandle>)> = Vec::new();
        for handle in self.store.handles().await {
            let task = handle.lock().await;
            if task.state == TaskState::Pending && !task.is_composite() && !task.cancel_requested() {
                let priority = task.effective_priority(now, self.config.aging_threshold_seconds);
                drop(task);
                queue.push((priority, handle.seq, handle));
            }
        }
        queue.sort_by(|a, b| b.0.cmp(&a.0).then_with(|| a.1.cmp(&b.1)));

        let mut report = DispatchReport::default();
        for (priority, _, handle) in queue {
            if report.assigned >= self.config.max_dispatch_per_tick {
                break;
            }
            report.examined += 1;
            match self.try_dispatch(&handle, priority, now).await {
                Ok(DispatchAttempt::Assigned) => report.assigned += 1,
                Ok(DispatchAttempt::Blocked) => report.blocked += 1,
                Ok(DispatchAttempt::Skipped) => {}
                Err(e) => StructuredLogger::log_system_error("dispatcher", "dispatch_task", &e),
            }
        }

        self.refresh_gauges().await;
        self.metrics.record_dispatch_tick(started.elapsed().as_secs_f64());
        if report.assigned > 0 {
            debug!(
                "调度tick完成: 检查 {} 个任务，分配 {} 个，阻塞 {} 个",
                report.examined, report.assigned, report.blocked
            );
        }
        report
    }

    async fn refresh_gauges(&self) {
        let pending = self
            .store
            .count_by_state()
            .await
            .get(TaskState::Pending.as_str())
            .copied()
            .unwrap_or(0);
        self.metrics.update_pending_tasks(pending as f64);
        self.metrics.update_lock_waiters(self.locks.waiter_count().await as f64);
        self.metrics
            .update_active_workers(self.registry.available_count().await as f64);
    }

    async fn dependency_states(&self, depends_on: &[String]) -> Vec<(String, TaskState)> {
        let mut states = Vec::with_capacity(depends_on.len());
        for id in depends_on {
            // 前置任务已被清理说明它早已结束，按完成处理
            let state = match self.store.get(id).await {
                Some(handle) => handle.lock().await.state,
                None => TaskState::Completed,
            };
            states.push((id.clone(), state));
        }
        states
    }

    async fn try_dispatch(
        &self,
        handle: &Arc<TaskHandle>,
        priority: TaskPriority,
        now: DateTime<Utc>,
    ) -> CoordinatorResult<DispatchAttempt> {
        let depends_on = handle.lock().await.depends_on.clone();
        let dependency_states = self.dependency_states(&depends_on).await;
        let dependencies = DependencyChecker::check_dependencies(
            dependency_states.iter().map(|(id, state)| (id.as_str(), *state)),
        );

        let mut task = handle.lock().await;
        if task.state != TaskState::Pending || task.cancel_requested() || task.is_composite() {
            return Ok(DispatchAttempt::Skipped);
        }

        match dependencies {
            DependencyCheckResult::Satisfied => {}
            DependencyCheckResult::Waiting { .. } => {
                task.blocked_reason = Some(BlockedReason::AwaitingDependencies);
                return Ok(DispatchAttempt::Blocked);
            }
            DependencyCheckResult::Broken { dependency, state } => {
                warn!(
                    "任务 {} 的前置任务 {} 以 {} 状态结束，任务将被取消",
                    task.id, dependency, state
                );
                task.last_error = Some(format!("前置任务 {dependency} 以 {state} 状态结束"));
                let follow_up = self.finalize_cancel(&mut task, now).await?;
                drop(task);
                self.apply(follow_up, now).await;
                return Ok(DispatchAttempt::Skipped);
            }
        }

        if !task.is_backoff_elapsed(now) {
            if let Some(until) = task.not_before {
                task.blocked_reason = Some(BlockedReason::Backoff { until });
            }
            return Ok(DispatchAttempt::Blocked);
        }

        let candidates = self.registry.find_candidates(&task.required_capabilities).await;
        if candidates.is_empty() {
            task.blocked_reason = Some(BlockedReason::CapacityExhausted);
            let grants = self.locks.release(&task.id, &task.resource_keys).await;
            drop(task);
            self.publish_grants(grants).await;
            return Ok(DispatchAttempt::Blocked);
        }

        match self
            .locks
            .acquire(&task.id, &task.resource_keys, priority, handle.seq, now)
            .await
        {
            LockOutcome::Reserved => {}
            LockOutcome::Queued {
                position,
                estimated_wait_seconds,
            } => {
                task.blocked_reason = Some(BlockedReason::ResourceQueued {
                    position,
                    estimated_wait_seconds,
                });
                return Ok(DispatchAttempt::Blocked);
            }
        }

        let mut chosen = None;
        for worker_id in candidates {
            match self.registry.reserve_slot(&worker_id, &task.id).await {
                Ok(true) => {
                    chosen = Some(worker_id);
                    break;
                }
                Ok(false) => continue,
                Err(e) => debug!("Worker {} 预留槽位失败: {}", worker_id, e),
            }
        }
        let Some(worker_id) = chosen else {
            task.blocked_reason = Some(BlockedReason::CapacityExhausted);
            let grants = self.locks.release(&task.id, &task.resource_keys).await;
            drop(task);
            self.publish_grants(grants).await;
            return Ok(DispatchAttempt::Blocked);
        };

        let waiting_since = task.waiting_since;
        task.transition_to(TaskState::Assigned, now)?;
        task.assigned_worker = Some(worker_id.clone());
        task.response_deadline =
            Some(now + Duration::seconds(self.config.assignment_timeout_seconds as i64));
        task.last_status_at = None;
        task.heartbeat_requested_at = None;
        task.blocked_reason = None;
        task.not_before = None;

        let message = Message::task_assignment(
            &self.config.inbox,
            &worker_id,
            TaskAssignmentMessage::from_task(&task),
        );
        if let Err(e) = self.bus.publish_message(&message).await {
            error!("任务 {} 的分配消息发布失败，回滚分配: {}", task.id, e);
            self.registry
                .release_slot(&worker_id, &task.id, SlotRelease::Released)
                .await;
            let grants = self.locks.release(&task.id, &task.resource_keys).await;
            task.reset_to_pending(now)?;
            task.waiting_since = waiting_since;
            drop(task);
            self.publish_grants(grants).await;
            return Err(e);
        }

        if let Some(respond_by) = task.response_deadline {
            StructuredLogger::log_task_assigned(&task.id, &worker_id, task.attempt, respond_by);
        }
        StructuredLogger::log_task_state_change(
            &task.id,
            TaskState::Pending.as_str(),
            TaskState::Assigned.as_str(),
            Some(&worker_id),
        );
        self.metrics.record_task_dispatched(&task.id, &worker_id);

        let parent = task.parent_id.clone();
        drop(task);
        if let Some(parent_id) = parent {
            self.aggregate_parent(&parent_id, now).await;
        }
        Ok(DispatchAttempt::Assigned)
    }

    // ---------------------------------------------------------------------
    // Worker上报
    // ---------------------------------------------------------------------

    fn ensure_assignee(task: &Task, worker_id: &str) -> CoordinatorResult<()> {
        if task.assigned_worker.as_deref() != Some(worker_id) {
            return Err(CoordinatorError::StaleReport {
                task_id: task.id.clone(),
                worker_id: worker_id.to_string(),
            });
        }
        Ok(())
    }

    pub async fn report_progress(
        &self,
        task_id: &str,
        worker_id: &str,
        note: Option<String>,
    ) -> CoordinatorResult<TaskStatusView> {
        self.report_progress_at(task_id, worker_id, note, Utc::now()).await
    }

    /// 进度上报：Assigned首次上报转为Running，同时作为心跳请求的回复
    pub async fn report_progress_at(
        &self,
        task_id: &str,
        worker_id: &str,
        note: Option<String>,
        now: DateTime<Utc>,
    ) -> CoordinatorResult<TaskStatusView> {
        let handle = self.store.require(task_id).await?;
        let mut task = handle.lock().await;
        if !task.state.is_live() {
            debug!("任务 {} 处于 {} 状态，忽略进度上报", task_id, task.state);
            return Ok(task.status());
        }
        Self::ensure_assignee(&task, worker_id)?;

        if task.state == TaskState::Assigned {
            task.transition_to(TaskState::Running, now)?;
            StructuredLogger::log_task_state_change(
                task_id,
                TaskState::Assigned.as_str(),
                TaskState::Running.as_str(),
                Some(worker_id),
            );
        }
        task.response_deadline = None;
        task.last_status_at = Some(now);
        task.heartbeat_requested_at = None;
        task.updated_at = now;
        if note.is_some() {
            task.progress_note = note;
        }
        Ok(task.status())
    }

    pub async fn report_complete(
        &self,
        task_id: &str,
        worker_id: &str,
        result: serde_json::Value,
    ) -> CoordinatorResult<TaskStatusView> {
        self.report_complete_at(task_id, worker_id, result, Utc::now()).await
    }

    /// 完成上报；重复上报是无操作，不会重复累计Worker的完成数
    pub async fn report_complete_at(
        &self,
        task_id: &str,
        worker_id: &str,
        result: serde_json::Value,
        now: DateTime<Utc>,
    ) -> CoordinatorResult<TaskStatusView> {
        let handle = self.store.require(task_id).await?;
        let mut task = handle.lock().await;
        if !task.state.is_live() {
            debug!("任务 {} 处于 {} 状态，忽略完成上报", task_id, task.state);
            return Ok(task.status());
        }
        Self::ensure_assignee(&task, worker_id)?;

        task.result = Some(result);
        if task.cancel_requested() {
            let follow_up = self.finalize_cancel(&mut task, now).await?;
            let status = task.status();
            drop(task);
            self.apply(follow_up, now).await;
            return Ok(status);
        }

        let from = task.state;
        task.transition_to(TaskState::Completed, now)?;
        task.response_deadline = None;
        task.heartbeat_requested_at = None;
        task.last_status_at = Some(now);
        self.registry
            .release_slot(worker_id, task_id, SlotRelease::Completed)
            .await;
        let grants = self.locks.release(&task.id, &task.resource_keys).await;

        self.metrics.record_task_completed();
        StructuredLogger::log_task_state_change(
            task_id,
            from.as_str(),
            TaskState::Completed.as_str(),
            Some(worker_id),
        );

        let follow_up = FollowUp {
            grants,
            parent: task.parent_id.clone(),
            escalation: None,
        };
        let status = task.status();
        drop(task);
        self.apply(follow_up, now).await;
        Ok(status)
    }

    pub async fn report_failed(
        &self,
        task_id: &str,
        worker_id: &str,
        error: String,
    ) -> CoordinatorResult<TaskStatusView> {
        self.report_failed_at(task_id, worker_id, error, Utc::now()).await
    }

    /// 失败上报：未达上限则带退避重新排队，否则放弃并升级
    pub async fn report_failed_at(
        &self,
        task_id: &str,
        worker_id: &str,
        error: String,
        now: DateTime<Utc>,
    ) -> CoordinatorResult<TaskStatusView> {
        let handle = self.store.require(task_id).await?;
        let mut task = handle.lock().await;
        if !task.state.is_live() {
            debug!("任务 {} 处于 {} 状态，忽略失败上报", task_id, task.state);
            return Ok(task.status());
        }
        Self::ensure_assignee(&task, worker_id)?;

        task.last_error = Some(error.clone());
        if task.cancel_requested() {
            let follow_up = self.finalize_cancel(&mut task, now).await?;
            let status = task.status();
            drop(task);
            self.apply(follow_up, now).await;
            return Ok(status);
        }

        let from = task.state;
        task.transition_to(TaskState::Failed, now)?;
        self.registry
            .release_slot(worker_id, task_id, SlotRelease::Failed)
            .await;
        let grants = self.locks.release(&task.id, &task.resource_keys).await;
        self.metrics.record_task_failed();
        StructuredLogger::log_task_state_change(
            task_id,
            from.as_str(),
            TaskState::Failed.as_str(),
            Some(worker_id),
        );

        let max_attempts = self.retry.max_attempts_for(&task);
        let mut follow_up = FollowUp {
            grants,
            parent: None,
            escalation: None,
        };

        if self.retry.should_retry(&task) {
            let failed_attempt = task.attempt;
            task.attempt += 1;
            task.reset_to_pending(now)?;
            let not_before = self.retry.next_eligible_at(failed_attempt, now);
            task.not_before = Some(not_before);
            task.blocked_reason = Some(BlockedReason::Backoff { until: not_before });

            self.metrics.record_task_retry(task.attempt);
            StructuredLogger::log_task_retry(task_id, task.attempt, max_attempts, not_before, &error);
        } else {
            task.transition_to(TaskState::Abandoned, now)?;
            self.metrics.record_task_abandoned();
            StructuredLogger::log_task_state_change(
                task_id,
                TaskState::Failed.as_str(),
                TaskState::Abandoned.as_str(),
                Some(worker_id),
            );

            let ceiling = CoordinatorError::RetryCeilingExceeded {
                id: task.id.clone(),
                attempts: task.attempt,
            };
            follow_up.escalation = Some(EscalationRecord::new(
                task.id.clone(),
                EscalationReason::RepeatedFailure,
                json!({
                    "error": ceiling.to_string(),
                    "last_error": error,
                    "attempts": task.attempt,
                    "max_attempts": max_attempts,
                    "worker_id": worker_id,
                    "description": task.description,
                }),
            ));
            follow_up.parent = task.parent_id.clone();
        }

        let status = task.status();
        drop(task);
        self.apply(follow_up, now).await;
        Ok(status)
    }

    pub async fn acknowledge_cancel(&self, task_id: &str, worker_id: &str) -> CoordinatorResult<TaskStatusView> {
        self.acknowledge_cancel_at(task_id, worker_id, Utc::now()).await
    }

    /// Worker确认已停止执行被取消的任务
    pub async fn acknowledge_cancel_at(
        &self,
        task_id: &str,
        worker_id: &str,
        now: DateTime<Utc>,
    ) -> CoordinatorResult<TaskStatusView> {
        let handle = self.store.require(task_id).await?;
        let mut task = handle.lock().await;
        if task.state.is_terminal() {
            return Ok(task.status());
        }
        if !task.cancel_requested() {
            return Err(CoordinatorError::Validation(format!(
                "任务 {task_id} 没有待确认的取消请求"
            )));
        }
        Self::ensure_assignee(&task, worker_id)?;

        let follow_up = self.finalize_cancel(&mut task, now).await?;
        let status = task.status();
        drop(task);
        self.apply(follow_up, now).await;
        Ok(status)
    }

    // ---------------------------------------------------------------------
    // 取消
    // ---------------------------------------------------------------------

    pub async fn cancel_task(&self, task_id: &str) -> CoordinatorResult<TaskStatusView> {
        self.cancel_task_at(task_id, Utc::now()).await
    }

    /// 取消任务：Pending立即取消；已分配的任务发送取消请求，等待Worker确认或超时
    pub async fn cancel_task_at(&self, task_id: &str, now: DateTime<Utc>) -> CoordinatorResult<TaskStatusView> {
        let handle = self.store.require(task_id).await?;

        let children: Vec<String> = {
            let task = handle.lock().await;
            if task.state.is_terminal() {
                return Err(CoordinatorError::AlreadyTerminal {
                    id: task_id.to_string(),
                    state: task.state.to_string(),
                });
            }
            task.children.iter().map(|c| c.task_id.clone()).collect()
        };

        if !children.is_empty() {
            return self.cancel_composite(&handle, &children, now).await;
        }

        let mut task = handle.lock().await;
        if task.state.is_terminal() {
            return Err(CoordinatorError::AlreadyTerminal {
                id: task_id.to_string(),
                state: task.state.to_string(),
            });
        }
        let follow_up = self.cancel_locked(&mut task, now).await?;
        let status = task.status();
        drop(task);
        self.apply(follow_up, now).await;
        Ok(status)
    }

    async fn cancel_composite(
        &self,
        handle: &Arc<TaskHandle>,
        children: &[String],
        now: DateTime<Utc>,
    ) -> CoordinatorResult<TaskStatusView> {
        self.cancel_children(children, now).await;

        let mut parent = handle.lock().await;
        if !parent.state.is_terminal() {
            let from = parent.state;
            parent.transition_to(TaskState::Cancelled, now)?;
            parent.blocked_reason = None;
            self.metrics.record_task_cancelled();
            StructuredLogger::log_task_state_change(
                &parent.id,
                from.as_str(),
                TaskState::Cancelled.as_str(),
                None,
            );
        }
        Ok(parent.status())
    }

    /// 取消一组子任务；不触发父任务聚合，由调用方负责父任务状态
    async fn cancel_children(&self, children: &[String], now: DateTime<Utc>) {
        for child_id in children {
            let Some(child) = self.store.get(child_id).await else {
                continue;
            };
            let mut task = child.lock().await;
            if task.state.is_terminal() {
                continue;
            }
            match self.cancel_locked(&mut task, now).await {
                Ok(follow_up) => {
                    drop(task);
                    self.emit(follow_up.grants, follow_up.escalation).await;
                }
                Err(e) => StructuredLogger::log_system_error("dispatcher", "cancel_child", &e),
            }
        }
    }

    async fn cancel_locked(&self, task: &mut Task, now: DateTime<Utc>) -> CoordinatorResult<FollowUp> {
        match task.state {
            TaskState::Pending => self.finalize_cancel(task, now).await,
            TaskState::Assigned | TaskState::Running => {
                if task.cancel_requested() {
                    debug!("任务 {} 已在等待取消确认", task.id);
                    return Ok(FollowUp::default());
                }
                task.cancel_requested_at = Some(now);
                task.updated_at = now;
                if let Some(worker_id) = task.assigned_worker.clone() {
                    let message = Message::task_cancellation(
                        &self.config.inbox,
                        &worker_id,
                        TaskCancellationMessage {
                            task_id: task.id.clone(),
                            worker_id: worker_id.clone(),
                            timestamp: now,
                        },
                    );
                    if let Err(e) = self.bus.publish_message(&message).await {
                        warn!("任务 {} 的取消消息发布失败: {}", task.id, e);
                    }
                }
                info!("已请求取消任务 {}，等待Worker确认", task.id);
                Ok(FollowUp::default())
            }
            _ => Ok(FollowUp::default()),
        }
    }

    /// 最终取消：释放Worker槽位和资源，转为Cancelled
    async fn finalize_cancel(&self, task: &mut Task, now: DateTime<Utc>) -> CoordinatorResult<FollowUp> {
        let from = task.state;
        if from.is_live() {
            if let Some(worker_id) = task.assigned_worker.clone() {
                self.registry
                    .release_slot(&worker_id, &task.id, SlotRelease::Released)
                    .await;
            }
        }
        let grants = self.locks.release(&task.id, &task.resource_keys).await;

        task.transition_to(TaskState::Cancelled, now)?;
        task.response_deadline = None;
        task.heartbeat_requested_at = None;
        task.blocked_reason = None;

        self.metrics.record_task_cancelled();
        StructuredLogger::log_task_state_change(
            &task.id,
            from.as_str(),
            TaskState::Cancelled.as_str(),
            task.assigned_worker.as_deref(),
        );
        Ok(FollowUp {
            grants,
            parent: task.parent_id.clone(),
            escalation: None,
        })
    }

    // ---------------------------------------------------------------------
    // 基础设施故障与存活检测
    // ---------------------------------------------------------------------

    /// Worker失联等基础设施故障：任务回到Pending，不消耗尝试次数
    ///
    /// `expected_worker` 不为空时，只有任务仍分配给该Worker才会处理。
    pub async fn requeue_for_infrastructure(
        &self,
        task_id: &str,
        expected_worker: Option<&str>,
        reason: &str,
        now: DateTime<Utc>,
    ) -> CoordinatorResult<bool> {
        let Some(handle) = self.store.get(task_id).await else {
            return Ok(false);
        };
        let mut task = handle.lock().await;
        if !task.state.is_live() {
            return Ok(false);
        }
        if let Some(worker_id) = expected_worker {
            if task.assigned_worker.as_deref() != Some(worker_id) {
                return Ok(false);
            }
        }
        let follow_up = self.requeue_locked(&mut task, reason, now).await?;
        drop(task);
        self.apply(follow_up, now).await;
        Ok(true)
    }

    async fn requeue_locked(&self, task: &mut Task, reason: &str, now: DateTime<Utc>) -> CoordinatorResult<FollowUp> {
        if task.cancel_requested() {
            return self.finalize_cancel(task, now).await;
        }

        let from = task.state;
        let worker_id = task.assigned_worker.clone();
        if let Some(worker_id) = &worker_id {
            self.registry
                .release_slot(worker_id, &task.id, SlotRelease::Released)
                .await;
        }
        let grants = self.locks.release(&task.id, &task.resource_keys).await;

        let failure = CoordinatorError::InfrastructureFailure {
            worker_id: worker_id.clone().unwrap_or_default(),
            reason: reason.to_string(),
        };
        task.reset_to_pending(now)?;
        task.last_error = Some(failure.to_string());
        task.not_before = None;

        self.metrics.record_task_requeued(reason);
        StructuredLogger::log_task_requeued(&task.id, worker_id.as_deref(), reason);
        StructuredLogger::log_task_state_change(
            &task.id,
            from.as_str(),
            TaskState::Pending.as_str(),
            None,
        );
        Ok(FollowUp {
            grants,
            parent: None,
            escalation: None,
        })
    }

    /// Assigned任务超过响应期限仍未开始执行，重新排队
    pub async fn expire_assignment_at(&self, task_id: &str, now: DateTime<Utc>) -> CoordinatorResult<bool> {
        let Some(handle) = self.store.get(task_id).await else {
            return Ok(false);
        };
        let mut task = handle.lock().await;
        let expired = task.state == TaskState::Assigned
            && !task.cancel_requested()
            && task.response_deadline.is_some_and(|d| d <= now);
        if !expired {
            return Ok(false);
        }
        warn!("任务 {} 超过响应期限未开始执行，重新排队", task_id);
        let follow_up = self.requeue_locked(&mut task, "assignment_timeout", now).await?;
        drop(task);
        self.apply(follow_up, now).await;
        Ok(true)
    }

    /// 卡住检测：长时间无状态更新先发心跳请求，宽限期内仍无回复则重新分配并升级
    pub async fn check_stuck_at(
        &self,
        task_id: &str,
        stuck_after: Duration,
        grace: Duration,
        now: DateTime<Utc>,
    ) -> CoordinatorResult<StuckAction> {
        let Some(handle) = self.store.get(task_id).await else {
            return Ok(StuckAction::None);
        };
        let mut task = handle.lock().await;
        if task.state != TaskState::Running || task.cancel_requested() {
            return Ok(StuckAction::None);
        }

        match task.heartbeat_requested_at {
            None => {
                let last_update = task.last_status_at.unwrap_or(task.updated_at);
                if now - last_update < stuck_after {
                    return Ok(StuckAction::None);
                }
                let Some(worker_id) = task.assigned_worker.clone() else {
                    return Ok(StuckAction::None);
                };
                task.heartbeat_requested_at = Some(now);
                let message = Message::heartbeat_request(
                    &self.config.inbox,
                    HeartbeatRequestMessage {
                        task_id: task.id.clone(),
                        worker_id: worker_id.clone(),
                        reply_by: now + grace,
                    },
                );
                if let Err(e) = self.bus.publish_message(&message).await {
                    warn!("任务 {} 的心跳请求发布失败: {}", task_id, e);
                }
                info!("任务 {} 长时间无进度，已向Worker {} 发送心跳请求", task_id, worker_id);
                Ok(StuckAction::HeartbeatRequested)
            }
            Some(requested_at) => {
                if now - requested_at < grace {
                    return Ok(StuckAction::None);
                }
                let worker_id = task.assigned_worker.clone();
                let last_update = task.last_status_at.unwrap_or(task.updated_at);
                let mut follow_up = self
                    .requeue_locked(&mut task, "heartbeat_request_unanswered", now)
                    .await?;
                follow_up.escalation = Some(EscalationRecord::new(
                    task.id.clone(),
                    EscalationReason::StuckBeyondThreshold,
                    json!({
                        "worker_id": worker_id,
                        "last_update": last_update,
                        "heartbeat_requested_at": requested_at,
                        "attempt": task.attempt,
                    }),
                ));
                drop(task);
                self.apply(follow_up, now).await;
                Ok(StuckAction::Requeued)
            }
        }
    }

    /// 取消请求超过确认期限，直接完成取消
    pub async fn expire_cancel_at(
        &self,
        task_id: &str,
        ack_timeout: Duration,
        now: DateTime<Utc>,
    ) -> CoordinatorResult<bool> {
        let Some(handle) = self.store.get(task_id).await else {
            return Ok(false);
        };
        let mut task = handle.lock().await;
        let expired = task.state.is_live()
            && task
                .cancel_requested_at
                .is_some_and(|requested| now - requested >= ack_timeout);
        if !expired {
            return Ok(false);
        }
        warn!("任务 {} 的取消请求未在期限内确认，直接完成取消", task_id);
        let follow_up = self.finalize_cancel(&mut task, now).await?;
        drop(task);
        self.apply(follow_up, now).await;
        Ok(true)
    }

    // ---------------------------------------------------------------------
    // Worker管理
    // ---------------------------------------------------------------------

    pub async fn register_worker(&self, registration: WorkerRegistration) -> CoordinatorResult<RegistrationOutcome> {
        let outcome = self.registry.register(registration).await?;
        self.bus.register_recipient(&outcome.worker_id).await?;
        Ok(outcome)
    }

    pub async fn heartbeat(&self, heartbeat: &WorkerHeartbeat) -> CoordinatorResult<HeartbeatOutcome> {
        self.heartbeat_at(heartbeat, Utc::now()).await
    }

    /// 心跳；报告Offline的Worker的任务按基础设施故障重新排队
    pub async fn heartbeat_at(
        &self,
        heartbeat: &WorkerHeartbeat,
        now: DateTime<Utc>,
    ) -> CoordinatorResult<HeartbeatOutcome> {
        let outcome = self.registry.heartbeat_at(heartbeat, now).await?;
        for task_id in &outcome.orphaned_tasks {
            self.requeue_for_infrastructure(task_id, Some(&heartbeat.worker_id), "worker_reported_offline", now)
                .await?;
        }
        if outcome.status.accepts_work() && outcome.previous_status != outcome.status {
            self.request_dispatch();
        }
        Ok(outcome)
    }

    /// 注销Worker，其任务重新排队；未知Worker是无操作
    pub async fn deregister_worker(&self, worker_id: &str) -> CoordinatorResult<Vec<String>> {
        let tasks = self.registry.deregister(worker_id).await;
        self.requeue_worker_tasks(worker_id, &tasks, "worker_deregistered").await?;
        self.bus.unregister_recipient(worker_id).await?;
        Ok(tasks)
    }

    pub async fn mark_worker_offline(&self, worker_id: &str) -> CoordinatorResult<Vec<String>> {
        let tasks = self.registry.mark_offline(worker_id).await?;
        self.requeue_worker_tasks(worker_id, &tasks, "worker_offline").await?;
        Ok(tasks)
    }

    pub(crate) async fn requeue_worker_tasks(
        &self,
        worker_id: &str,
        tasks: &[String],
        reason: &str,
    ) -> CoordinatorResult<()> {
        let now = Utc::now();
        for task_id in tasks {
            self.requeue_for_infrastructure(task_id, Some(worker_id), reason, now)
                .await?;
        }
        Ok(())
    }

    pub async fn list_workers(&self, filter: &WorkerFilter) -> Vec<WorkerInfo> {
        self.registry.list_workers(filter).await
    }

    pub async fn get_worker(&self, worker_id: &str) -> CoordinatorResult<WorkerInfo> {
        self.registry
            .get_worker(worker_id)
            .await
            .ok_or_else(|| CoordinatorError::UnknownWorker {
                id: worker_id.to_string(),
            })
    }

    // ---------------------------------------------------------------------
    // 查询
    // ---------------------------------------------------------------------

    pub async fn get_task_status(&self, task_id: &str) -> CoordinatorResult<TaskStatusView> {
        let handle = self.store.require(task_id).await?;
        let task = handle.lock().await;
        Ok(task.status())
    }

    pub async fn get_task(&self, task_id: &str) -> CoordinatorResult<Task> {
        let handle = self.store.require(task_id).await?;
        Ok(handle.snapshot().await)
    }

    pub async fn list_tasks(&self, filter: &TaskFilter) -> Vec<Task> {
        self.store.list(filter).await
    }

    pub async fn system_stats(&self) -> SystemStats {
        SystemStats {
            workers: self.registry.stats().await,
            tasks_by_state: self.store.count_by_state().await,
            total_tasks: self.store.len().await,
            resource_locks: self.locks.snapshot().await,
            lock_waiters: self.locks.waiter_count().await,
            escalations_pending: self.escalation.pending().await,
            timestamp: Utc::now(),
        }
    }

    /// 清理超过保留期的终态任务；组合任务在全部子任务结束后连同子任务一起清理
    pub async fn purge_terminal_at(&self, now: DateTime<Utc>) -> usize {
        let cutoff = now - Duration::seconds(self.audit.retention_seconds as i64);

        let mut roots: Vec<(String, Vec<String>)> = Vec::new();
        for handle in self.store.handles().await {
            let task = handle.lock().await;
            let expired = task.parent_id.is_none()
                && task.state.is_terminal()
                && task.finished_at.is_some_and(|t| t <= cutoff);
            if expired {
                roots.push((task.id.clone(), task.children.iter().map(|c| c.task_id.clone()).collect()));
            }
        }

        let mut purged = 0;
        for (root_id, children) in roots {
            let mut all_done = true;
            for child_id in &children {
                if let Some(child) = self.store.get(child_id).await {
                    if !child.lock().await.state.is_terminal() {
                        all_done = false;
                        break;
                    }
                }
            }
            if !all_done {
                continue;
            }
            for id in std::iter::once(&root_id).chain(children.iter()) {
                if self.store.remove(id).await.is_some() {
                    self.escalation.forget(id).await;
                    purged += 1;
                }
            }
        }
        if purged > 0 {
            info!("已清理 {} 个超过保留期的终态任务", purged);
        }
        purged
    }

    // ---------------------------------------------------------------------
    // 后续动作
    // ---------------------------------------------------------------------

    async fn apply(&self, follow_up: FollowUp, now: DateTime<Utc>) {
        self.emit(follow_up.grants, follow_up.escalation).await;
        if let Some(parent_id) = follow_up.parent {
            self.aggregate_parent(&parent_id, now).await;
        }
        self.request_dispatch();
    }

    async fn emit(&self, grants: Vec<Grant>, escalation: Option<EscalationRecord>) {
        self.publish_grants(grants).await;
        if let Some(record) = escalation {
            self.escalation.escalate(record).await;
        }
    }

    /// 资源转交后广播通知，并触发一次调度让获得资源的任务尽快分配
    async fn publish_grants(&self, grants: Vec<Grant>) {
        if grants.is_empty() {
            return;
        }
        for grant in grants {
            let message = Message::resource_available(
                &self.config.inbox,
                ResourceAvailableMessage {
                    resource_keys: grant.resource_keys,
                    granted_to: grant.task_id,
                    timestamp: Utc::now(),
                },
            );
            if let Err(e) = self.bus.publish_message(&message).await {
                warn!("资源可用消息发布失败: {}", e);
            }
        }
        self.request_dispatch();
    }

    /// 根据子任务状态推进组合任务
    pub(crate) async fn aggregate_parent(&self, parent_id: &str, now: DateTime<Utc>) {
        let Some(handle) = self.store.get(parent_id).await else {
            return;
        };
        let children: Vec<String> = {
            let parent = handle.lock().await;
            if parent.state.is_terminal() {
                return;
            }
            parent.children.iter().map(|c| c.task_id.clone()).collect()
        };

        let mut states = Vec::with_capacity(children.len());
        for child_id in &children {
            if let Some(child) = self.store.get(child_id).await {
                states.push(child.lock().await.state);
            }
        }

        let any_abandoned = states.contains(&TaskState::Abandoned);
        if any_abandoned {
            self.cancel_children(&children, now).await;
        }
        let all_completed = states.iter().all(|s| *s == TaskState::Completed);
        let all_terminal = states
            .iter()
            .all(|s| s.is_terminal() && *s != TaskState::Failed);
        let any_live = states.iter().any(|s| s.is_live());

        let mut parent = handle.lock().await;
        if parent.state.is_terminal() {
            return;
        }
        let from = parent.state;
        let target = if any_abandoned {
            Some(TaskState::Abandoned)
        } else if all_completed {
            Some(TaskState::Completed)
        } else if all_terminal {
            Some(TaskState::Cancelled)
        } else if any_live && from == TaskState::Pending {
            Some(TaskState::Running)
        } else {
            None
        };
        let Some(target) = target else { return };

        if target == TaskState::Completed && from == TaskState::Pending {
            if let Err(e) = parent.transition_to(TaskState::Running, now) {
                StructuredLogger::log_system_error("dispatcher", "aggregate_parent", &e);
                return;
            }
        }
        if let Err(e) = parent.transition_to(target, now) {
            StructuredLogger::log_system_error("dispatcher", "aggregate_parent", &e);
            return;
        }
        parent.blocked_reason = None;
        match target {
            TaskState::Completed => self.metrics.record_task_completed(),
            TaskState::Abandoned => self.metrics.record_task_abandoned(),
            TaskState::Cancelled => self.metrics.record_task_cancelled(),
            _ => {}
        }
        StructuredLogger::log_task_state_change(parent_id, from.as_str(), target.as_str(), None);
    }
}
