use std::collections::{BTreeMap, HashMap};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use tokio::sync::{Mutex, MutexGuard, RwLock};

use coordinator_core::{CoordinatorError, CoordinatorResult, Task, TaskFilter};

/// 单个任务的存储单元
///
/// `seq` 是提交顺序，同优先级任务按它先进先出。
#[derive(Debug)]
pub struct TaskHandle {
    pub seq: u64,
    pub id: String,
    task: Mutex<Task>,
}

impl TaskHandle {
    pub async fn lock(&self) -> MutexGuard<'_, Task> {
        self.task.lock().await
    }

    pub async fn snapshot(&self) -> Task {
        self.task.lock().await.clone()
    }
}

/// 内存任务表，每个任务一个互斥锁
#[derive(Debug, Default)]
pub struct TaskStore {
    tasks: RwLock<HashMap<String, Arc<TaskHandle>>>,
    seq: AtomicU64,
}

impl TaskStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// 一次性插入一组任务（父任务及其子任务），任一标识冲突则全部不插入
    pub async fn insert_all(&self, tasks: Vec<Task>) -> CoordinatorResult<()> {
        let mut map = self.tasks.write().await;
        if let Some(dup) = tasks.iter().find(|t| map.contains_key(&t.id)) {
            return Err(CoordinatorError::Internal(format!("任务标识冲突: {}", dup.id)));
        }
        for task in tasks {
            let seq = self.seq.fetch_add(1, Ordering::SeqCst);
            let handle = Arc::new(TaskHandle {
                seq,
                id: task.id.clone(),
                task: Mutex::new(task),
            });
            map.insert(handle.id.clone(), handle);
        }
        Ok(())
    }

    pub async fn get(&self, task_id: &str) -> Option<Arc<TaskHandle>> {
        self.tasks.read().await.get(task_id).cloned()
    }

    /// 获取任务句柄，不存在时返回 UnknownTask
    pub async fn require(&self, task_id: &str) -> CoordinatorResult<Arc<TaskHandle>> {
        self.get(task_id).await.ok_or_else(|| CoordinatorError::UnknownTask {
            id: task_id.to_string(),
        })
    }

    pub async fn snapshot(&self, task_id: &str) -> Option<Task> {
        let handle = self.get(task_id).await?;
        Some(handle.snapshot().await)
    }

    /// 所有任务句柄，按提交顺序排列
    pub async fn handles(&self) -> Vec<Arc<TaskHandle>> {
        let mut handles: Vec<Arc<TaskHandle>> = self.tasks.read().await.values().cloned().collect();
        handles.sort_by_key(|h| h.seq);
        handles
    }

    pub async fn remove(&self, task_id: &str) -> Option<Arc<TaskHandle>> {
        self.tasks.write().await.remove(task_id)
    }

    pub async fn list(&self, filter: &TaskFilter) -> Vec<Task> {
        let limit = filter.limit.unwrap_or(usize::MAX);
        let mut result = Vec::new();
        for handle in self.handles().await {
            if result.len() >= limit {
                break;
            }
            let task = handle.lock().await;
            if filter.matches(&task) {
                result.push(task.clone());
            }
        }
        result
    }

    pub async fn count_by_state(&self) -> BTreeMap<String, usize> {
        let mut counts = BTreeMap::new();
        for handle in self.handles().await {
            let task = handle.lock().await;
            *counts.entry(task.state.as_str().to_string()).or_insert(0) += 1;
        }
        counts
    }

    pub async fn len(&self) -> usize {
        self.tasks.read().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.tasks.read().await.is_empty()
    }
}
