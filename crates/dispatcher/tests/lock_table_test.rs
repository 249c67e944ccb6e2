#[cfg(test)]
mod tests {
    use std::collections::BTreeSet;
    use std::sync::Arc;

    use chrono::{Duration, Utc};
    use coordinator_core::{LockConfig, TaskPriority};
    use coordinator_dispatcher::{LockOutcome, ResourceLockTable};

    fn keys(items: &[&str]) -> BTreeSet<String> {
        items.iter().map(|s| s.to_string()).collect()
    }

    #[tokio::test]
    async fn test_concurrent_acquire_grants_single_holder() {
        let table = Arc::new(ResourceLockTable::new(LockConfig::default()));
        let now = Utc::now();

        let mut handles = Vec::new();
        for seq in 0..16u64 {
            let table = table.clone();
            handles.push(tokio::spawn(async move {
                let outcome = table
                    .acquire(
                        &format!("t-{seq}"),
                        &keys(&["branch:main"]),
                        TaskPriority::Normal,
                        seq,
                        now,
                    )
                    .await;
                outcome == LockOutcome::Reserved
            }));
        }

        let mut reserved = 0;
        for handle in handles {
            if handle.await.unwrap() {
                reserved += 1;
            }
        }
        assert_eq!(reserved, 1);
        assert_eq!(table.waiter_count().await, 15);
    }

    #[tokio::test]
    async fn test_release_chain_hands_key_to_each_waiter_in_turn() {
        let table = ResourceLockTable::new(LockConfig::default());
        let now = Utc::now();
        let branch = keys(&["branch:main"]);

        for seq in 0..3u64 {
            table
                .acquire(&format!("t-{seq}"), &branch, TaskPriority::Normal, seq, now)
                .await;
        }

        let grants = table.release("t-0", &branch).await;
        assert_eq!(grants.len(), 1);
        assert_eq!(grants[0].task_id, "t-1");

        let grants = table.release("t-1", &branch).await;
        assert_eq!(grants[0].task_id, "t-2");
        assert_eq!(table.holder_of("branch:main").await.as_deref(), Some("t-2"));
        assert_eq!(table.waiter_count().await, 0);
    }

    #[tokio::test]
    async fn test_multi_key_waiter_is_not_starved_by_single_key_tasks() {
        let table = ResourceLockTable::new(LockConfig::default());
        let now = Utc::now();

        table.acquire("holder", &keys(&["db"]), TaskPriority::Normal, 0, now).await;
        let outcome = table
            .acquire("both", &keys(&["cache", "db"]), TaskPriority::Normal, 1, now)
            .await;
        assert!(matches!(outcome, LockOutcome::Queued { .. }));

        // 后提交的任务不能越过排在前面的等待者拿走 cache
        let outcome = table
            .acquire("late", &keys(&["cache"]), TaskPriority::Normal, 2, now)
            .await;
        assert!(matches!(outcome, LockOutcome::Queued { .. }));

        let grants = table.release("holder", &keys(&["db"])).await;
        assert_eq!(grants.len(), 1);
        assert_eq!(grants[0].task_id, "both");
        assert_eq!(grants[0].resource_keys, vec!["cache".to_string(), "db".to_string()]);
    }

    #[tokio::test]
    async fn test_snapshot_lists_holder_and_waiters() {
        let table = ResourceLockTable::new(LockConfig::default());
        let now = Utc::now();
        table.acquire("t-1", &keys(&["env:prod"]), TaskPriority::Normal, 0, now).await;
        table.acquire("t-2", &keys(&["env:prod"]), TaskPriority::High, 1, now).await;

        let snapshot = table.snapshot().await;
        assert_eq!(snapshot.len(), 1);
        assert_eq!(snapshot[0].holder.as_deref(), Some("t-1"));
        assert_eq!(snapshot[0].waiters, vec!["t-2".to_string()]);

        let overdue = table.overdue_waiters(now + Duration::seconds(601), 600).await;
        assert_eq!(overdue.len(), 1);
        assert_eq!(overdue[0].task_id, "t-2");
    }
}
