#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use chrono::{DateTime, Duration, Utc};
    use coordinator_core::{
        AppConfig, BlockedReason, CoordinatorError, EscalationReason, MessageBus, MessageType,
        SubtaskSubmission, TaskFilter, TaskPriority, TaskState, TaskSubmission, WorkerHeartbeat,
        WorkerRegistration, WorkerStatus,
    };
    use coordinator_dispatcher::{EscalationChannel, LivenessMonitor, TaskDispatcher};
    use coordinator_infrastructure::{InMemoryMessageBus, MemoryEscalationSink};
    use serde_json::json;

    struct Harness {
        dispatcher: Arc<TaskDispatcher>,
        bus: Arc<InMemoryMessageBus>,
        sink: MemoryEscalationSink,
        config: AppConfig,
    }

    fn test_config() -> AppConfig {
        let mut config = AppConfig::default();
        config.retry.jitter_factor = 0.0;
        config.escalation.retry_interval_ms = 1;
        config
    }

    fn harness_with(config: AppConfig) -> Harness {
        harness_with_sink(config, MemoryEscalationSink::new())
    }

    fn harness_with_sink(config: AppConfig, sink: MemoryEscalationSink) -> Harness {
        let bus = Arc::new(InMemoryMessageBus::new());
        let shared_bus: Arc<dyn MessageBus> = bus.clone();
        let escalation = Arc::new(EscalationChannel::new(
            Arc::new(sink.clone()),
            Some(shared_bus.clone()),
            config.escalation.clone(),
            "dispatcher",
        ));
        let dispatcher = Arc::new(TaskDispatcher::new(&config, shared_bus, escalation));
        Harness {
            dispatcher,
            bus,
            sink,
            config,
        }
    }

    fn harness() -> Harness {
        harness_with(test_config())
    }

    async fn online(h: &Harness, id: &str, caps: &[&str], max: u32, now: DateTime<Utc>) {
        h.dispatcher
            .register_worker(WorkerRegistration::new(id, caps, max))
            .await
            .unwrap();
        h.dispatcher
            .heartbeat_at(&WorkerHeartbeat::new(id, WorkerStatus::Idle, 0), now)
            .await
            .unwrap();
    }

    async fn submit(h: &Harness, submission: TaskSubmission, now: DateTime<Utc>) -> String {
        h.dispatcher.submit_task_at(submission, now).await.unwrap()
    }

    async fn state_of(h: &Harness, task_id: &str) -> TaskState {
        h.dispatcher.get_task_status(task_id).await.unwrap().state
    }

    async fn assignee_of(h: &Harness, task_id: &str) -> String {
        h.dispatcher
            .get_task_status(task_id)
            .await
            .unwrap()
            .assigned_worker
            .expect("task should be assigned")
    }

    #[tokio::test]
    async fn test_no_capable_worker_keeps_task_pending() {
        let h = harness();
        let now = Utc::now();
        online(&h, "builder", &["build"], 2, now).await;

        let task_id = submit(&h, TaskSubmission::new(json!({"target": "prod"}), &["deploy"]), now).await;
        for i in 0..3 {
            h.dispatcher.dispatch_tick_at(now + Duration::seconds(i)).await;
        }

        let status = h.dispatcher.get_task_status(&task_id).await.unwrap();
        assert_eq!(status.state, TaskState::Pending);
        assert_eq!(status.blocked_reason, Some(BlockedReason::CapacityExhausted));
        assert!(status.assigned_worker.is_none());
    }

    #[tokio::test]
    async fn test_branch_contention_hands_over_within_one_tick() {
        let h = harness();
        let now = Utc::now();
        online(&h, "w-1", &["build"], 1, now).await;
        online(&h, "w-2", &["build"], 1, now).await;

        let first = submit(
            &h,
            TaskSubmission::new(json!({"n": 1}), &["build"]).with_resources(&["branch:main"]),
            now,
        )
        .await;
        let second = submit(
            &h,
            TaskSubmission::new(json!({"n": 2}), &["build"]).with_resources(&["branch:main"]),
            now,
        )
        .await;

        h.dispatcher.dispatch_tick_at(now).await;
        assert_eq!(state_of(&h, &first).await, TaskState::Assigned);
        let queued = h.dispatcher.get_task_status(&second).await.unwrap();
        assert_eq!(queued.state, TaskState::Pending);
        assert_eq!(
            queued.blocked_reason,
            Some(BlockedReason::ResourceQueued {
                position: 1,
                estimated_wait_seconds: 60
            })
        );
        assert_eq!(
            h.dispatcher.locks().holder_of("branch:main").await.as_deref(),
            Some(first.as_str())
        );

        let worker = assignee_of(&h, &first).await;
        h.dispatcher
            .report_progress_at(&first, &worker, Some("compiling".to_string()), now)
            .await
            .unwrap();
        h.dispatcher
            .report_complete_at(&first, &worker, json!({"ok": true}), now)
            .await
            .unwrap();
        assert_eq!(
            h.dispatcher.locks().holder_of("branch:main").await.as_deref(),
            Some(second.as_str())
        );

        let report = h.dispatcher.dispatch_tick_at(now + Duration::seconds(1)).await;
        assert_eq!(report.assigned, 1);
        assert_eq!(state_of(&h, &second).await, TaskState::Assigned);
    }

    #[tokio::test]
    async fn test_offline_worker_task_moves_to_another_worker() {
        let h = harness();
        let start = Utc::now();
        online(&h, "w-1", &["deploy"], 1, start).await;

        let task_id = submit(
            &h,
            TaskSubmission::new(json!({"env": "prod"}), &["deploy"]).with_resources(&["env:prod"]),
            start,
        )
        .await;
        h.dispatcher.dispatch_tick_at(start).await;
        h.dispatcher
            .report_progress_at(&task_id, "w-1", None, start)
            .await
            .unwrap();
        assert_eq!(state_of(&h, &task_id).await, TaskState::Running);

        online(&h, "w-2", &["deploy"], 1, start + Duration::seconds(250)).await;

        let monitor = LivenessMonitor::new(h.dispatcher.clone(), h.config.liveness.clone());
        let later = start + Duration::seconds(301);
        let report = monitor.sweep_at(later).await;
        assert_eq!(report.offline_workers, vec!["w-1".to_string()]);

        let status = h.dispatcher.get_task_status(&task_id).await.unwrap();
        assert_eq!(status.state, TaskState::Pending);
        assert_eq!(status.attempt, 1);
        assert!(status.last_error.unwrap().contains("w-1"));
        assert_eq!(h.dispatcher.locks().holder_of("env:prod").await, None);

        h.dispatcher.dispatch_tick_at(later).await;
        assert_eq!(assignee_of(&h, &task_id).await, "w-2");
        let w1 = h.dispatcher.get_worker("w-1").await.unwrap();
        assert_eq!(w1.status, WorkerStatus::Offline);
        assert_eq!(w1.current_load(), 0);
    }

    #[tokio::test]
    async fn test_duplicate_completion_is_noop() {
        let h = harness();
        let now = Utc::now();
        online(&h, "w-1", &["test"], 1, now).await;

        let task_id = submit(&h, TaskSubmission::new(json!({}), &["test"]), now).await;
        h.dispatcher.dispatch_tick_at(now).await;

        h.dispatcher
            .report_complete_at(&task_id, "w-1", json!({"passed": 10}), now)
            .await
            .unwrap();
        let replay = h
            .dispatcher
            .report_complete_at(&task_id, "w-1", json!({"passed": 10}), now)
            .await
            .unwrap();
        assert_eq!(replay.state, TaskState::Completed);

        let worker = h.dispatcher.get_worker("w-1").await.unwrap();
        assert_eq!(worker.completed_count, 1);
        assert_eq!(worker.current_load(), 0);
        assert_eq!(worker.status, WorkerStatus::Idle);
    }

    #[tokio::test]
    async fn test_aging_prevents_low_priority_starvation() {
        let h = harness();
        let start = Utc::now();
        online(&h, "w-1", &["lint"], 1, start).await;

        let low = submit(
            &h,
            TaskSubmission::new(json!({"kind": "low"}), &["lint"]).with_priority(TaskPriority::Low),
            start,
        )
        .await;

        let mut dispatched_at_step = None;
        for step in 0..10 {
            let now = start + Duration::seconds(60 * step);
            h.dispatcher
                .heartbeat_at(&WorkerHeartbeat::new("w-1", WorkerStatus::Idle, 0), now)
                .await
                .unwrap();
            submit(&h, TaskSubmission::new(json!({"step": step}), &["lint"]), now).await;
            h.dispatcher.dispatch_tick_at(now).await;

            let assigned = h
                .dispatcher
                .list_tasks(&TaskFilter {
                    state: Some(TaskState::Assigned),
                    ..Default::default()
                })
                .await;
            assert_eq!(assigned.len(), 1);
            if assigned[0].id == low {
                dispatched_at_step = Some(step);
                break;
            }
            h.dispatcher
                .report_complete_at(&assigned[0].id, "w-1", json!({}), now)
                .await
                .unwrap();
        }

        assert_eq!(dispatched_at_step, Some(5));
    }

    #[tokio::test]
    async fn test_retry_backoff_then_abandon_and_escalate() {
        let h = harness();
        let t0 = Utc::now();
        online(&h, "w-1", &["build"], 1, t0).await;

        let task_id = submit(&h, TaskSubmission::new(json!({"cmd": "make"}), &["build"]), t0).await;
        h.dispatcher.dispatch_tick_at(t0).await;

        let status = h
            .dispatcher
            .report_failed_at(&task_id, "w-1", "exit 1".to_string(), t0)
            .await
            .unwrap();
        assert_eq!(status.state, TaskState::Pending);
        assert_eq!(status.attempt, 2);
        assert_eq!(
            status.blocked_reason,
            Some(BlockedReason::Backoff {
                until: t0 + Duration::seconds(5)
            })
        );

        h.dispatcher.dispatch_tick_at(t0 + Duration::seconds(1)).await;
        assert_eq!(state_of(&h, &task_id).await, TaskState::Pending);

        let t1 = t0 + Duration::seconds(5);
        h.dispatcher.dispatch_tick_at(t1).await;
        assert_eq!(state_of(&h, &task_id).await, TaskState::Assigned);
        let status = h
            .dispatcher
            .report_failed_at(&task_id, "w-1", "exit 2".to_string(), t1)
            .await
            .unwrap();
        assert_eq!(status.attempt, 3);

        let t2 = t1 + Duration::seconds(10);
        h.dispatcher.dispatch_tick_at(t2).await;
        let status = h
            .dispatcher
            .report_failed_at(&task_id, "w-1", "exit 3".to_string(), t2)
            .await
            .unwrap();
        assert_eq!(status.state, TaskState::Abandoned);
        assert_eq!(status.attempt, 3);

        h.dispatcher.escalation().flush().await;
        let records = h.sink.records().await;
        assert_eq!(records.len(), 1);
        assert_eq!(records[0].reason, EscalationReason::RepeatedFailure);
        assert_eq!(records[0].task_id, task_id);

        let worker = h.dispatcher.get_worker("w-1").await.unwrap();
        assert_eq!(worker.failed_count, 3);

        let escalations = h.bus.consume_messages("escalations", 10).await.unwrap();
        assert_eq!(escalations.len(), 1);
    }

    #[tokio::test]
    async fn test_repeated_failure_escalation_survives_sink_outage() {
        let mut config = test_config();
        config.escalation.max_delivery_attempts = 3;
        config.escalation.redelivery_delay_ms = 0;
        let h = harness_with_sink(config, MemoryEscalationSink::failing_first(3));
        let now = Utc::now();
        online(&h, "w-1", &["build"], 1, now).await;

        let task_id = submit(
            &h,
            TaskSubmission::new(json!({}), &["build"]).with_max_attempts(1),
            now,
        )
        .await;
        h.dispatcher.dispatch_tick_at(now).await;
        let status = h
            .dispatcher
            .report_failed_at(&task_id, "w-1", "exit 1".to_string(), now)
            .await
            .unwrap();
        assert_eq!(status.state, TaskState::Abandoned);

        // 通道整轮失败后记录保留在队列中，恢复后送达
        assert_eq!(h.dispatcher.escalation().flush().await, 0);
        assert_eq!(h.dispatcher.escalation().pending().await, 1);
        assert_eq!(h.dispatcher.escalation().flush().await, 1);

        let records = h.sink.records().await;
        assert_eq!(records.len(), 1);
        assert_eq!(records[0].reason, EscalationReason::RepeatedFailure);

        // 总线镜像只发布一次
        let escalations = h.bus.consume_messages("escalations", 10).await.unwrap();
        assert_eq!(escalations.len(), 1);
    }

    #[tokio::test]
    async fn test_cancel_pending_and_running_tasks() {
        let h = harness();
        let now = Utc::now();
        online(&h, "w-1", &["build"], 1, now).await;

        let running = submit(&h, TaskSubmission::new(json!({"n": 1}), &["build"]), now).await;
        let pending = submit(&h, TaskSubmission::new(json!({"n": 2}), &["build"]), now).await;
        h.dispatcher.dispatch_tick_at(now).await;
        h.dispatcher
            .report_progress_at(&running, "w-1", None, now)
            .await
            .unwrap();

        let status = h.dispatcher.cancel_task_at(&pending, now).await.unwrap();
        assert_eq!(status.state, TaskState::Cancelled);
        let err = h.dispatcher.cancel_task_at(&pending, now).await.unwrap_err();
        assert!(matches!(err, CoordinatorError::AlreadyTerminal { .. }));

        let status = h.dispatcher.cancel_task_at(&running, now).await.unwrap();
        assert_eq!(status.state, TaskState::Running);
        assert!(status.cancel_requested);
        // 重复取消是无操作
        assert!(h.dispatcher.cancel_task_at(&running, now).await.unwrap().cancel_requested);

        let inbox = h.bus.consume_messages("w-1", 10).await.unwrap();
        let cancellations = inbox
            .iter()
            .filter(|m| matches!(m.message_type, MessageType::TaskCancellation(_)))
            .count();
        assert_eq!(cancellations, 1);

        let status = h
            .dispatcher
            .acknowledge_cancel_at(&running, "w-1", now)
            .await
            .unwrap();
        assert_eq!(status.state, TaskState::Cancelled);
        assert_eq!(h.dispatcher.get_worker("w-1").await.unwrap().current_load(), 0);
    }

    #[tokio::test]
    async fn test_unacknowledged_cancel_is_finalized_after_timeout() {
        let h = harness();
        let now = Utc::now();
        online(&h, "w-1", &["build"], 1, now).await;

        let task_id = submit(&h, TaskSubmission::new(json!({}), &["build"]), now).await;
        h.dispatcher.dispatch_tick_at(now).await;
        h.dispatcher.cancel_task_at(&task_id, now).await.unwrap();

        let timeout = Duration::seconds(120);
        assert!(!h
            .dispatcher
            .expire_cancel_at(&task_id, timeout, now + Duration::seconds(60))
            .await
            .unwrap());
        assert!(h
            .dispatcher
            .expire_cancel_at(&task_id, timeout, now + Duration::seconds(120))
            .await
            .unwrap());
        assert_eq!(state_of(&h, &task_id).await, TaskState::Cancelled);
    }

    #[tokio::test]
    async fn test_subtasks_follow_precedence_and_complete_parent() {
        let h = harness();
        let now = Utc::now();
        online(&h, "w-1", &["build", "test", "lint"], 3, now).await;

        let parent = submit(
            &h,
            TaskSubmission::new(json!({"goal": "ship"}), &[])
                .with_subtask(SubtaskSubmission::new("build", &["build"]).must_precede())
                .with_subtask(SubtaskSubmission::new("test", &["test"]))
                .with_subtask(SubtaskSubmission::new("lint", &["lint"])),
            now,
        )
        .await;
        let children = h.dispatcher.get_task_status(&parent).await.unwrap().children;
        assert_eq!(children.len(), 3);

        h.dispatcher.dispatch_tick_at(now).await;
        assert_eq!(state_of(&h, &children[0]).await, TaskState::Assigned);
        let waiting = h.dispatcher.get_task_status(&children[1]).await.unwrap();
        assert_eq!(waiting.blocked_reason, Some(BlockedReason::AwaitingDependencies));
        assert_eq!(state_of(&h, &parent).await, TaskState::Running);

        h.dispatcher
            .report_complete_at(&children[0], "w-1", json!({}), now)
            .await
            .unwrap();
        h.dispatcher.dispatch_tick_at(now).await;
        assert_eq!(state_of(&h, &children[1]).await, TaskState::Assigned);
        assert_eq!(state_of(&h, &children[2]).await, TaskState::Assigned);

        for child in &children[1..] {
            h.dispatcher
                .report_complete_at(child, "w-1", json!({}), now)
                .await
                .unwrap();
        }
        assert_eq!(state_of(&h, &parent).await, TaskState::Completed);
    }

    #[tokio::test]
    async fn test_cyclic_subtasks_are_rejected() {
        let h = harness();
        let err = h
            .dispatcher
            .submit_task(
                TaskSubmission::new(json!({}), &[])
                    .with_subtask(SubtaskSubmission::new("a", &["build"]).after(&["b"]))
                    .with_subtask(SubtaskSubmission::new("b", &["build"]).after(&["a"])),
            )
            .await
            .unwrap_err();
        assert!(matches!(err, CoordinatorError::InvalidDependencyGraph(_)));
        assert!(h.dispatcher.store().is_empty().await);
    }

    #[tokio::test]
    async fn test_abandoned_child_abandons_parent() {
        let h = harness();
        let now = Utc::now();
        online(&h, "w-1", &["build", "deploy"], 2, now).await;

        let parent = submit(
            &h,
            TaskSubmission::new(json!({}), &[])
                .with_max_attempts(1)
                .with_subtask(SubtaskSubmission::new("build", &["build"]).must_precede())
                .with_subtask(SubtaskSubmission::new("deploy", &["deploy"])),
            now,
        )
        .await;
        let children = h.dispatcher.get_task_status(&parent).await.unwrap().children;

        h.dispatcher.dispatch_tick_at(now).await;
        h.dispatcher
            .report_failed_at(&children[0], "w-1", "compile error".to_string(), now)
            .await
            .unwrap();

        assert_eq!(state_of(&h, &children[0]).await, TaskState::Abandoned);
        assert_eq!(state_of(&h, &children[1]).await, TaskState::Cancelled);
        assert_eq!(state_of(&h, &parent).await, TaskState::Abandoned);
    }

    #[tokio::test]
    async fn test_worker_load_never_exceeds_max_concurrency() {
        let h = harness();
        let now = Utc::now();
        online(&h, "w-1", &["build"], 2, now).await;

        for n in 0..5 {
            submit(&h, TaskSubmission::new(json!({"n": n}), &["build"]), now).await;
        }
        let report = h.dispatcher.dispatch_tick_at(now).await;
        assert_eq!(report.assigned, 2);
        assert_eq!(report.blocked, 3);

        let worker = h.dispatcher.get_worker("w-1").await.unwrap();
        assert_eq!(worker.current_load(), 2);

        let live = h
            .dispatcher
            .list_tasks(&TaskFilter {
                worker_id: Some("w-1".to_string()),
                ..Default::default()
            })
            .await;
        assert_eq!(live.len(), 2);
        assert!(live.iter().all(|t| worker.active_tasks.contains(&t.id)));
    }

    #[tokio::test]
    async fn test_terminal_tasks_are_purged_after_retention() {
        let h = harness();
        let now = Utc::now();
        online(&h, "w-1", &["build"], 1, now).await;

        let task_id = submit(&h, TaskSubmission::new(json!({}), &["build"]), now).await;
        h.dispatcher.dispatch_tick_at(now).await;
        h.dispatcher
            .report_complete_at(&task_id, "w-1", json!({}), now)
            .await
            .unwrap();

        assert_eq!(h.dispatcher.purge_terminal_at(now + Duration::seconds(60)).await, 0);
        assert_eq!(h.dispatcher.purge_terminal_at(now + Duration::seconds(3600)).await, 1);
        let err = h.dispatcher.get_task_status(&task_id).await.unwrap_err();
        assert!(matches!(err, CoordinatorError::UnknownTask { .. }));
    }
}
