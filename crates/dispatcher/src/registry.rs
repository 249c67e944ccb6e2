use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde::Serialize;
use tokio::sync::{Mutex, RwLock};
use tracing::{debug, info, warn};

use coordinator_core::{
    CoordinatorError, CoordinatorResult, RegistrationOutcome, RegistryConfig, WorkerFilter,
    WorkerHeartbeat, WorkerInfo, WorkerRegistration, WorkerStatus,
};
use coordinator_infrastructure::StructuredLogger;

use crate::strategies::{CapabilityAffinityStrategy, WorkerSelectionStrategy};

/// Worker槽位释放原因，决定累计计数器的变化
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SlotRelease {
    Completed,
    Failed,
    /// 取消、重新入队等不计入历史成功率的释放
    Released,
}

/// 心跳处理结果
#[derive(Debug, Clone, Serialize)]
pub struct HeartbeatOutcome {
    pub previous_status: WorkerStatus,
    pub status: WorkerStatus,
    /// Worker主动报告Offline时被收回的任务
    pub orphaned_tasks: Vec<String>,
}

/// 注册表统计信息
#[derive(Debug, Clone, Default, Serialize)]
pub struct RegistryStats {
    pub total_workers: usize,
    pub workers_by_status: BTreeMap<String, usize>,
    pub total_capacity: u64,
    pub active_load: u64,
    pub completed_total: u64,
    pub failed_total: u64,
}

/// Worker注册表
///
/// 每个Worker一个独立的互斥锁；表本身的读写锁只在查找、插入和删除时短暂持有。
pub struct WorkerRegistry {
    workers: RwLock<HashMap<String, Arc<Mutex<WorkerInfo>>>>,
    config: RegistryConfig,
    strategy: Arc<dyn WorkerSelectionStrategy>,
}

impl WorkerRegistry {
    pub fn new(config: RegistryConfig, strategy: Arc<dyn WorkerSelectionStrategy>) -> Self {
        Self {
            workers: RwLock::new(HashMap::new()),
            config,
            strategy,
        }
    }

    pub fn with_defaults() -> Self {
        Self::new(
            RegistryConfig::default(),
            Arc::new(CapabilityAffinityStrategy::new()),
        )
    }

    async fn entry(&self, worker_id: &str) -> Option<Arc<Mutex<WorkerInfo>>> {
        self.workers.read().await.get(worker_id).cloned()
    }

    async fn entries(&self) -> Vec<Arc<Mutex<WorkerInfo>>> {
        self.workers.read().await.values().cloned().collect()
    }

    /// 解析注册请求中省略的能力和并发数
    fn resolve_registration(
        &self,
        registration: &WorkerRegistration,
    ) -> CoordinatorResult<(BTreeSet<String>, u32)> {
        if registration.worker_id.trim().is_empty() {
            return Err(CoordinatorError::Validation("Worker标识不能为空".to_string()));
        }
        let role = self.config.roles.get(&registration.role);

        let capabilities: BTreeSet<String> = if registration.capabilities.is_empty() {
            role.map(|r| r.capabilities.iter().cloned().collect())
                .unwrap_or_default()
        } else {
            registration.capabilities.iter().cloned().collect()
        };
        if capabilities.iter().any(|c| c.trim().is_empty()) {
            return Err(CoordinatorError::Validation("能力标签不能为空字符串".to_string()));
        }

        let max_concurrency = registration
            .max_concurrency
            .or_else(|| role.and_then(|r| r.max_concurrency))
            .unwrap_or(self.config.default_max_concurrency);
        if max_concurrency == 0 {
            return Err(CoordinatorError::Validation("最大并发数必须大于0".to_string()));
        }

        Ok((capabilities, max_concurrency))
    }

    /// 注册Worker
    ///
    /// 标识已被活跃Worker占用时，按配置拒绝或分配 `id-2`、`id-3` 等新标识；
    /// 已离线的同名Worker直接复用（保留历史计数）。
    pub async fn register(&self, registration: WorkerRegistration) -> CoordinatorResult<RegistrationOutcome> {
        let now = Utc::now();
        let (capabilities, max_concurrency) = self.resolve_registration(&registration)?;
        let requested_id = registration.worker_id.clone();

        for n in 1u32.. {
            let candidate_id = if n == 1 {
                requested_id.clone()
            } else {
                format!("{requested_id}-{n}")
            };

            let existing = {
                let mut workers = self.workers.write().await;
                match workers.get(&candidate_id) {
                    Some(entry) => entry.clone(),
                    None => {
                        let worker = WorkerInfo::new(
                            candidate_id.clone(),
                            registration.role.clone(),
                            capabilities.clone(),
                            max_concurrency,
                            registration.metadata.clone(),
                            now,
                        );
                        workers.insert(candidate_id.clone(), Arc::new(Mutex::new(worker)));
                        log_registration(&candidate_id, &registration.role, &capabilities, max_concurrency);
                        return Ok(self.outcome(candidate_id, requested_id));
                    }
                }
            };

            let mut worker = existing.lock().await;
            if worker.status == WorkerStatus::Offline {
                worker.role = registration.role.clone();
                worker.capabilities = capabilities.clone();
                worker.max_concurrency = max_concurrency;
                worker.metadata = registration.metadata.clone().unwrap_or(serde_json::Value::Null);
                worker.status = WorkerStatus::Starting;
                worker.active_tasks.clear();
                worker.reported_load = 0;
                worker.last_heartbeat = now;
                info!("离线Worker {} 重新注册，沿用原标识", candidate_id);
                log_registration(&candidate_id, &registration.role, &capabilities, max_concurrency);
                return Ok(self.outcome(candidate_id, requested_id));
            }

            if n == 1 && self.config.rejects_duplicates() {
                warn!("Worker标识 {} 已被活跃Worker占用，拒绝注册", candidate_id);
                return Err(CoordinatorError::DuplicateIdentity { id: candidate_id });
            }
            debug!("Worker标识 {} 已被占用，尝试下一个标识", candidate_id);
        }

        Err(CoordinatorError::Internal("无法分配Worker标识".to_string()))
    }

    fn outcome(&self, worker_id: String, requested_id: String) -> RegistrationOutcome {
        let disambiguated = worker_id != requested_id;
        if disambiguated {
            warn!(
                "Worker标识 {} 冲突，已分配新标识 {}",
                requested_id, worker_id
            );
        }
        RegistrationOutcome {
            worker_id,
            requested_id,
            disambiguated,
        }
    }

    pub async fn heartbeat(&self, heartbeat: &WorkerHeartbeat) -> CoordinatorResult<HeartbeatOutcome> {
        self.heartbeat_at(heartbeat, Utc::now()).await
    }

    /// 处理心跳：更新心跳时间、自报负载和状态
    pub async fn heartbeat_at(
        &self,
        heartbeat: &WorkerHeartbeat,
        now: DateTime<Utc>,
    ) -> CoordinatorResult<HeartbeatOutcome> {
        let entry = self
            .entry(&heartbeat.worker_id)
            .await
            .ok_or_else(|| CoordinatorError::UnknownWorker {
                id: heartbeat.worker_id.clone(),
            })?;
        let mut worker = entry.lock().await;
        let previous_status = worker.status;

        worker.last_heartbeat = now;
        worker.reported_load = heartbeat.current_load;

        let mut orphaned_tasks = Vec::new();
        match heartbeat.status {
            WorkerStatus::Offline => {
                worker.status = WorkerStatus::Offline;
                orphaned_tasks = std::mem::take(&mut worker.active_tasks).into_iter().collect();
            }
            // Idle/Busy 以调度器记录的活跃任务为准
            WorkerStatus::Idle | WorkerStatus::Busy => {
                worker.status = WorkerStatus::Idle;
                worker.refresh_busy_status();
            }
            other => worker.status = other,
        }

        if previous_status != worker.status {
            StructuredLogger::log_worker_status_change(
                &worker.id,
                previous_status.as_str(),
                worker.status.as_str(),
                "heartbeat",
            );
        }
        StructuredLogger::log_worker_heartbeat(
            &worker.id,
            worker.status.as_str(),
            worker.reported_load,
            worker.active_tasks.len(),
        );

        Ok(HeartbeatOutcome {
            previous_status,
            status: worker.status,
            orphaned_tasks,
        })
    }

    /// 查找候选Worker，按排序策略返回Worker标识；没有候选时返回空列表
    pub async fn find_candidates(&self, required: &BTreeSet<String>) -> Vec<String> {
        let mut candidates = Vec::new();
        for entry in self.entries().await {
            let worker = entry.lock().await;
            if worker.is_candidate_for(required) {
                candidates.push(worker.clone());
            }
        }
        self.strategy.rank(required, &mut candidates);
        candidates.into_iter().map(|w| w.id).collect()
    }

    /// 在Worker上预留一个槽位；在Worker锁内重新检查状态和剩余容量
    pub async fn reserve_slot(&self, worker_id: &str, task_id: &str) -> CoordinatorResult<bool> {
        let entry = self
            .entry(worker_id)
            .await
            .ok_or_else(|| CoordinatorError::UnknownWorker {
                id: worker_id.to_string(),
            })?;
        let mut worker = entry.lock().await;

        if worker.active_tasks.contains(task_id) {
            return Ok(true);
        }
        if !worker.status.accepts_work() || !worker.has_headroom() {
            debug!(
                "Worker {} 无法接收任务 {} (状态: {}, 负载: {}/{})",
                worker_id,
                task_id,
                worker.status,
                worker.current_load(),
                worker.max_concurrency
            );
            return Ok(false);
        }

        worker.active_tasks.insert(task_id.to_string());
        worker.refresh_busy_status();
        Ok(true)
    }

    /// 释放槽位；只有任务确实占用该Worker时才更新计数器，重复调用是无操作
    pub async fn release_slot(&self, worker_id: &str, task_id: &str, release: SlotRelease) -> bool {
        let Some(entry) = self.entry(worker_id).await else {
            debug!("释放槽位时Worker {} 已不存在", worker_id);
            return false;
        };
        let mut worker = entry.lock().await;
        if !worker.active_tasks.remove(task_id) {
            return false;
        }
        match release {
            SlotRelease::Completed => worker.completed_count += 1,
            SlotRelease::Failed => worker.failed_count += 1,
            SlotRelease::Released => {}
        }
        worker.refresh_busy_status();
        true
    }

    /// 标记为离线并返回其活跃任务，重复调用返回空列表
    pub async fn mark_offline(&self, worker_id: &str) -> CoordinatorResult<Vec<String>> {
        let entry = self
            .entry(worker_id)
            .await
            .ok_or_else(|| CoordinatorError::UnknownWorker {
                id: worker_id.to_string(),
            })?;
        let mut worker = entry.lock().await;
        Ok(Self::take_offline(&mut worker, "mark_offline"))
    }

    fn take_offline(worker: &mut WorkerInfo, reason: &str) -> Vec<String> {
        if worker.status != WorkerStatus::Offline {
            StructuredLogger::log_worker_status_change(
                &worker.id,
                worker.status.as_str(),
                WorkerStatus::Offline.as_str(),
                reason,
            );
            worker.status = WorkerStatus::Offline;
        }
        std::mem::take(&mut worker.active_tasks).into_iter().collect()
    }

    /// 心跳早于 `cutoff` 的非离线Worker标记为Offline，返回被收回的任务
    pub async fn mark_offline_if_silent(
        &self,
        worker_id: &str,
        cutoff: DateTime<Utc>,
    ) -> Option<Vec<String>> {
        let entry = self.entry(worker_id).await?;
        let mut worker = entry.lock().await;
        if worker.status == WorkerStatus::Offline || worker.last_heartbeat >= cutoff {
            return None;
        }
        Some(Self::take_offline(&mut worker, "heartbeat_lost"))
    }

    /// 心跳早于 `cutoff` 的可用Worker标记为Degraded
    pub async fn mark_degraded_if_silent(&self, worker_id: &str, cutoff: DateTime<Utc>) -> bool {
        let Some(entry) = self.entry(worker_id).await else {
            return false;
        };
        let mut worker = entry.lock().await;
        let eligible = matches!(
            worker.status,
            WorkerStatus::Starting | WorkerStatus::Idle | WorkerStatus::Busy
        );
        if !eligible || worker.last_heartbeat >= cutoff {
            return false;
        }
        StructuredLogger::log_worker_status_change(
            &worker.id,
            worker.status.as_str(),
            WorkerStatus::Degraded.as_str(),
            "heartbeat_timeout",
        );
        worker.status = WorkerStatus::Degraded;
        true
    }

    /// 注销Worker并返回其活跃任务；未知Worker返回空列表
    pub async fn deregister(&self, worker_id: &str) -> Vec<String> {
        let removed = self.workers.write().await.remove(worker_id);
        match removed {
            Some(entry) => {
                let mut worker = entry.lock().await;
                info!("Worker {} 已注销", worker_id);
                std::mem::take(&mut worker.active_tasks).into_iter().collect()
            }
            None => Vec::new(),
        }
    }

    /// 注销持续离线（心跳早于 `cutoff`）的Worker
    pub async fn deregister_if_silent(&self, worker_id: &str, cutoff: DateTime<Utc>) -> Option<Vec<String>> {
        let entry = self.entry(worker_id).await?;
        {
            let worker = entry.lock().await;
            if worker.status != WorkerStatus::Offline || worker.last_heartbeat >= cutoff {
                return None;
            }
        }
        Some(self.deregister(worker_id).await)
    }

    pub async fn get_worker(&self, worker_id: &str) -> Option<WorkerInfo> {
        let entry = self.entry(worker_id).await?;
        let worker = entry.lock().await;
        Some(worker.clone())
    }

    pub async fn contains(&self, worker_id: &str) -> bool {
        self.workers.read().await.contains_key(worker_id)
    }

    pub async fn worker_ids(&self) -> Vec<String> {
        let mut ids: Vec<String> = self.workers.read().await.keys().cloned().collect();
        ids.sort();
        ids
    }

    pub async fn list_workers(&self, filter: &WorkerFilter) -> Vec<WorkerInfo> {
        let mut workers = Vec::new();
        for entry in self.entries().await {
            let worker = entry.lock().await;
            if filter.matches(&worker) {
                workers.push(worker.clone());
            }
        }
        workers.sort_by(|a, b| a.id.cmp(&b.id));
        workers
    }

    pub async fn stats(&self) -> RegistryStats {
        let mut stats = RegistryStats::default();
        for entry in self.entries().await {
            let worker = entry.lock().await;
            stats.total_workers += 1;
            *stats
                .workers_by_status
                .entry(worker.status.as_str().to_string())
                .or_insert(0) += 1;
            if worker.status != WorkerStatus::Offline {
                stats.total_capacity += worker.max_concurrency as u64;
            }
            stats.active_load += worker.current_load() as u64;
            stats.completed_total += worker.completed_count;
            stats.failed_total += worker.failed_count;
        }
        stats
    }

    /// 可接收任务的Worker数量
    pub async fn available_count(&self) -> usize {
        let mut count = 0;
        for entry in self.entries().await {
            if entry.lock().await.status.accepts_work() {
                count += 1;
            }
        }
        count
    }
}

fn log_registration(worker_id: &str, role: &str, capabilities: &BTreeSet<String>, max_concurrency: u32) {
    let capabilities: Vec<String> = capabilities.iter().cloned().collect();
    StructuredLogger::log_worker_registered(worker_id, role, &capabilities, max_concurrency);
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_register_then_heartbeat_makes_worker_available() {
        let registry = WorkerRegistry::with_defaults();
        let outcome = registry
            .register(WorkerRegistration::new("builder-1", &["build"], 2))
            .await
            .unwrap();
        assert_eq!(outcome.worker_id, "builder-1");
        assert!(!outcome.disambiguated);

        let required: BTreeSet<String> = ["build".to_string()].into_iter().collect();
        // Starting状态不参与分配
        assert!(registry.find_candidates(&required).await.is_empty());

        registry
            .heartbeat(&WorkerHeartbeat::new("builder-1", WorkerStatus::Idle, 0))
            .await
            .unwrap();
        assert_eq!(registry.find_candidates(&required).await, vec!["builder-1"]);
    }

    #[tokio::test]
    async fn test_reserve_slot_respects_max_concurrency() {
        let registry = WorkerRegistry::with_defaults();
        registry
            .register(WorkerRegistration::new("w-1", &["build"], 1))
            .await
            .unwrap();
        registry
            .heartbeat(&WorkerHeartbeat::new("w-1", WorkerStatus::Idle, 0))
            .await
            .unwrap();

        assert!(registry.reserve_slot("w-1", "t-1").await.unwrap());
        assert!(registry.reserve_slot("w-1", "t-1").await.unwrap());
        assert!(!registry.reserve_slot("w-1", "t-2").await.unwrap());

        let worker = registry.get_worker("w-1").await.unwrap();
        assert_eq!(worker.current_load(), 1);
        assert_eq!(worker.status, WorkerStatus::Busy);

        assert!(registry.release_slot("w-1", "t-1", SlotRelease::Completed).await);
        assert!(!registry.release_slot("w-1", "t-1", SlotRelease::Completed).await);
        let worker = registry.get_worker("w-1").await.unwrap();
        assert_eq!(worker.completed_count, 1);
        assert_eq!(worker.status, WorkerStatus::Idle);
    }

    #[tokio::test]
    async fn test_unknown_worker_heartbeat() {
        let registry = WorkerRegistry::with_defaults();
        let err = registry
            .heartbeat(&WorkerHeartbeat::new("ghost", WorkerStatus::Idle, 0))
            .await
            .unwrap_err();
        assert!(matches!(err, CoordinatorError::UnknownWorker { .. }));
    }
}
