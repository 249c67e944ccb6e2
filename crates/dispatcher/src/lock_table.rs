use std::cmp::Reverse;
use std::collections::{BTreeMap, BTreeSet, HashMap, HashSet};
use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde::Serialize;
use tokio::sync::{Mutex, OwnedMutexGuard, RwLock};
use tracing::debug;

use coordinator_core::{LockConfig, TaskPriority};
use coordinator_infrastructure::StructuredLogger;

/// 资源申请结果
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LockOutcome {
    /// 全部资源键已由该任务持有
    Reserved,
    /// 进入等待队列；`position` 从1开始
    Queued {
        position: usize,
        estimated_wait_seconds: u64,
    },
}

/// 释放资源后转交给等待者的资源
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Grant {
    pub task_id: String,
    pub resource_keys: Vec<String>,
}

/// 等待超时的任务
#[derive(Debug, Clone)]
pub struct OverdueWaiter {
    pub task_id: String,
    pub resource_keys: Vec<String>,
    pub waited_seconds: i64,
}

/// 单个资源键的快照
#[derive(Debug, Clone, Serialize)]
pub struct LockView {
    pub resource_key: String,
    pub holder: Option<String>,
    pub acquired_at: Option<DateTime<Utc>>,
    pub waiters: Vec<String>,
}

#[derive(Debug, Clone)]
struct Holder {
    task_id: String,
    acquired_at: DateTime<Utc>,
}

#[derive(Debug, Clone)]
struct Waiter {
    task_id: String,
    priority: TaskPriority,
    seq: u64,
    resource_keys: Vec<String>,
    enqueued_at: DateTime<Utc>,
}

impl Waiter {
    fn rank(&self) -> (Reverse<TaskPriority>, u64) {
        (Reverse(self.priority), self.seq)
    }
}

#[derive(Debug, Default)]
struct KeyState {
    holder: Option<Holder>,
    /// 按 (优先级降序, 提交顺序升序) 排列
    waiters: Vec<Waiter>,
}

impl KeyState {
    fn is_free_for(&self, task_id: &str) -> bool {
        self.holder.as_ref().map_or(true, |h| h.task_id == task_id)
    }

    fn is_idle(&self) -> bool {
        self.holder.is_none() && self.waiters.is_empty()
    }

    fn remove_waiter(&mut self, task_id: &str) {
        self.waiters.retain(|w| w.task_id != task_id);
    }

    fn upsert_waiter(&mut self, waiter: Waiter) {
        match self.waiters.iter_mut().find(|w| w.task_id == waiter.task_id) {
            Some(existing) => existing.priority = waiter.priority,
            None => self.waiters.push(waiter),
        }
        self.waiters.sort_by_key(Waiter::rank);
    }

    /// 排在 `rank` 前面的其他等待者数量
    fn better_waiters(&self, task_id: &str, rank: (Reverse<TaskPriority>, u64)) -> usize {
        self.waiters
            .iter()
            .filter(|w| w.task_id != task_id && w.rank() < rank)
            .count()
    }
}

/// 按字典序持有的一组资源键
struct LockedKeys {
    guards: BTreeMap<String, OwnedMutexGuard<KeyState>>,
}

impl LockedKeys {
    /// 等待者的某个资源键被其他任务持有
    ///
    /// 只检查当前已加锁的键；未加锁的键视为空闲，因此判断偏保守。
    fn is_blocked(&self, waiter: &Waiter) -> bool {
        waiter
            .resource_keys
            .iter()
            .any(|k| self.guards.get(k).is_some_and(|g| !g.is_free_for(&waiter.task_id)))
    }

    /// 全部资源键空闲，且排在前面的等待者都仍被阻塞
    fn obtainable(&self, waiter: &Waiter) -> bool {
        let rank = waiter.rank();
        waiter.resource_keys.iter().all(|k| {
            let Some(guard) = self.guards.get(k) else {
                return false;
            };
            guard.is_free_for(&waiter.task_id)
                && guard
                    .waiters
                    .iter()
                    .filter(|w| w.task_id != waiter.task_id && w.rank() < rank)
                    .all(|w| self.is_blocked(w))
        })
    }

    fn grant(&mut self, task_id: &str, keys: &[String], now: DateTime<Utc>) {
        for key in keys {
            if let Some(guard) = self.guards.get_mut(key) {
                guard.holder = Some(Holder {
                    task_id: task_id.to_string(),
                    acquired_at: now,
                });
                guard.remove_waiter(task_id);
            }
        }
    }
}

/// 资源锁表
///
/// 一个任务的全部资源键要么一起持有，要么一个都不持有。
/// 每个资源键一个互斥锁，多个键总是按字典序加锁。
pub struct ResourceLockTable {
    keys: RwLock<HashMap<String, Arc<Mutex<KeyState>>>>,
    config: LockConfig,
}

impl ResourceLockTable {
    pub fn new(config: LockConfig) -> Self {
        Self {
            keys: RwLock::new(HashMap::new()),
            config,
        }
    }

    async fn entries_for(&self, keys: &BTreeSet<String>) -> Vec<Arc<Mutex<KeyState>>> {
        {
            let map = self.keys.read().await;
            if keys.iter().all(|k| map.contains_key(k)) {
                return keys.iter().filter_map(|k| map.get(k).cloned()).collect();
            }
        }
        let mut map = self.keys.write().await;
        keys.iter()
            .map(|k| map.entry(k.clone()).or_default().clone())
            .collect()
    }

    async fn lock_in_order(&self, keys: &BTreeSet<String>) -> Vec<OwnedMutexGuard<KeyState>> {
        let mut guards = Vec::with_capacity(keys.len());
        for entry in self.entries_for(keys).await {
            guards.push(entry.lock_owned().await);
        }
        guards
    }

    async fn lock_keys(&self, keys: &BTreeSet<String>) -> LockedKeys {
        let guards = self.lock_in_order(keys).await;
        LockedKeys {
            guards: keys.iter().cloned().zip(guards).collect(),
        }
    }

    /// 给定资源键加上其上所有等待者申请的资源键
    async fn with_waiter_keys(&self, keys: &BTreeSet<String>) -> BTreeSet<String> {
        let mut related = keys.clone();
        for entry in self.entries_for(keys).await {
            let state = entry.lock().await;
            for waiter in &state.waiters {
                related.extend(waiter.resource_keys.iter().cloned());
            }
        }
        related
    }

    /// 申请一组资源键
    ///
    /// 只有当所有键都空闲且没有排名更靠前的等待者时才授予；否则在每个键上排队。
    /// 重复调用会刷新该任务在队列中的优先级。
    pub async fn acquire(
        &self,
        task_id: &str,
        keys: &BTreeSet<String>,
        priority: TaskPriority,
        seq: u64,
        now: DateTime<Utc>,
    ) -> LockOutcome {
        if keys.is_empty() {
            return LockOutcome::Reserved;
        }
        let key_list: Vec<String> = keys.iter().cloned().collect();
        let mut guards = self.lock_in_order(keys).await;

        let already_held = guards
            .iter()
            .all(|g| g.holder.as_ref().is_some_and(|h| h.task_id == task_id));
        if already_held {
            return LockOutcome::Reserved;
        }

        let rank = (Reverse(priority), seq);
        let grantable = guards
            .iter()
            .all(|g| g.is_free_for(task_id) && g.better_waiters(task_id, rank) == 0);

        if grantable {
            for guard in guards.iter_mut() {
                guard.holder = Some(Holder {
                    task_id: task_id.to_string(),
                    acquired_at: now,
                });
                guard.remove_waiter(task_id);
            }
            StructuredLogger::log_lock_event(task_id, &key_list, "reserved");
            return LockOutcome::Reserved;
        }

        let mut position = 0;
        for guard in guards.iter_mut() {
            guard.upsert_waiter(Waiter {
                task_id: task_id.to_string(),
                priority,
                seq,
                resource_keys: key_list.clone(),
                enqueued_at: now,
            });
            let held_by_other = usize::from(!guard.is_free_for(task_id));
            position = position.max(guard.better_waiters(task_id, rank) + held_by_other);
        }
        let position = position.max(1);
        StructuredLogger::log_lock_event(task_id, &key_list, "queued");

        LockOutcome::Queued {
            position,
            estimated_wait_seconds: position as u64 * self.config.estimated_hold_seconds,
        }
    }

    /// 释放任务持有的资源并退出所有等待队列，返回因此被授予资源的等待者
    ///
    /// 按排名依次检查被释放键上的等待者，授予第一个资源键全部可得的任务；
    /// 排在前面但仍被其他键阻塞的等待者不会占住已空闲的键。
    pub async fn release(&self, task_id: &str, keys: &BTreeSet<String>) -> Vec<Grant> {
        if keys.is_empty() {
            return Vec::new();
        }

        let mut freed = Vec::new();
        {
            let mut guards = self.lock_in_order(keys).await;
            for (key, guard) in keys.iter().zip(guards.iter_mut()) {
                if guard.holder.as_ref().is_some_and(|h| h.task_id == task_id) {
                    guard.holder = None;
                    freed.push(key.clone());
                }
                guard.remove_waiter(task_id);
            }
        }
        if freed.is_empty() {
            return Vec::new();
        }
        StructuredLogger::log_lock_event(task_id, &freed, "released");

        // 被释放键上的等待者可能还需要其他键，一并按字典序加锁后再判断
        let freed_set: BTreeSet<String> = freed.iter().cloned().collect();
        let related = self.with_waiter_keys(&freed_set).await;
        let mut locked = self.lock_keys(&related).await;

        let mut candidates: Vec<Waiter> = Vec::new();
        for key in &freed {
            let Some(guard) = locked.guards.get(key) else { continue };
            for waiter in &guard.waiters {
                if !candidates.iter().any(|c| c.task_id == waiter.task_id) {
                    candidates.push(waiter.clone());
                }
            }
        }
        candidates.sort_by_key(Waiter::rank);

        let now = Utc::now();
        let mut grants = Vec::new();
        for waiter in candidates {
            if !locked.obtainable(&waiter) {
                debug!("等待者 {} 暂不满足授予条件", waiter.task_id);
                continue;
            }
            locked.grant(&waiter.task_id, &waiter.resource_keys, now);
            StructuredLogger::log_lock_event(&waiter.task_id, &waiter.resource_keys, "granted");
            grants.push(Grant {
                task_id: waiter.task_id,
                resource_keys: waiter.resource_keys,
            });
        }
        grants
    }

    /// 等待时间达到 `max_wait_seconds` 的任务，每个任务只返回一次
    pub async fn overdue_waiters(&self, now: DateTime<Utc>, max_wait_seconds: u64) -> Vec<OverdueWaiter> {
        let entries: Vec<Arc<Mutex<KeyState>>> = self.keys.read().await.values().cloned().collect();
        let mut seen = HashSet::new();
        let mut overdue = Vec::new();
        for entry in entries {
            let state = entry.lock().await;
            for waiter in &state.waiters {
                let waited = (now - waiter.enqueued_at).num_seconds();
                if waited >= max_wait_seconds as i64 && seen.insert(waiter.task_id.clone()) {
                    overdue.push(OverdueWaiter {
                        task_id: waiter.task_id.clone(),
                        resource_keys: waiter.resource_keys.clone(),
                        waited_seconds: waited,
                    });
                }
            }
        }
        overdue.sort_by(|a, b| a.task_id.cmp(&b.task_id));
        overdue
    }

    pub fn max_wait_seconds(&self) -> u64 {
        self.config.max_wait_seconds
    }

    pub async fn holder_of(&self, key: &str) -> Option<String> {
        let entry = self.keys.read().await.get(key).cloned()?;
        let state = entry.lock().await;
        state.holder.as_ref().map(|h| h.task_id.clone())
    }

    /// 正在等待资源的任务数（去重）
    pub async fn waiter_count(&self) -> usize {
        let entries: Vec<Arc<Mutex<KeyState>>> = self.keys.read().await.values().cloned().collect();
        let mut waiting = HashSet::new();
        for entry in entries {
            let state = entry.lock().await;
            waiting.extend(state.waiters.iter().map(|w| w.task_id.clone()));
        }
        waiting.len()
    }

    pub async fn snapshot(&self) -> Vec<LockView> {
        let entries: Vec<(String, Arc<Mutex<KeyState>>)> = self
            .keys
            .read()
            .await
            .iter()
            .map(|(k, v)| (k.clone(), v.clone()))
            .collect();
        let mut views = Vec::new();
        for (key, entry) in entries {
            let state = entry.lock().await;
            if state.is_idle() {
                continue;
            }
            views.push(LockView {
                resource_key: key,
                holder: state.holder.as_ref().map(|h| h.task_id.clone()),
                acquired_at: state.holder.as_ref().map(|h| h.acquired_at),
                waiters: state.waiters.iter().map(|w| w.task_id.clone()).collect(),
            });
        }
        views.sort_by(|a, b| a.resource_key.cmp(&b.resource_key));
        views
    }

    /// 清理既无持有者也无等待者的资源键
    pub async fn compact(&self) -> usize {
        let mut map = self.keys.write().await;
        let before = map.len();
        // 引用计数为1说明没有其他调用者持有该条目
        map.retain(|_, entry| {
            if Arc::strong_count(entry) > 1 {
                return true;
            }
            match entry.try_lock() {
                Ok(state) => !state.is_idle(),
                Err(_) => true,
            }
        });
        before - map.len()
    }
}
