use std::collections::{HashMap, VecDeque};

use tracing::{debug, warn};

use coordinator_core::{ChildOrdering, CoordinatorError, CoordinatorResult, SubtaskSubmission, TaskState};

/// 子任务之间的先后关系
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PrecedenceGraph {
    /// `predecessors[i]` 为第 i 个子任务必须等待的子任务下标（升序）
    pub predecessors: Vec<Vec<usize>>,
    /// 一个合法的拓扑顺序
    pub topo_order: Vec<usize>,
}

/// 前置任务检查结果
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DependencyCheckResult {
    Satisfied,
    /// 仍有前置任务未完成
    Waiting { blocking: Vec<String> },
    /// 前置任务以非Completed状态结束，本任务不可能再执行
    Broken { dependency: String, state: TaskState },
}

pub struct DependencyChecker;

impl DependencyChecker {
    /// 根据子任务的排序约束构建依赖图，检测重复key、未知key和环
    pub fn build_precedence(subtasks: &[SubtaskSubmission]) -> CoordinatorResult<PrecedenceGraph> {
        let mut index: HashMap<&str, usize> = HashMap::new();
        for (i, subtask) in subtasks.iter().enumerate() {
            if index.insert(subtask.key.as_str(), i).is_some() {
                return Err(CoordinatorError::Validation(format!(
                    "子任务key重复: {}",
                    subtask.key
                )));
            }
        }

        let mut predecessors: Vec<Vec<usize>> = vec![Vec::new(); subtasks.len()];
        for (i, subtask) in subtasks.iter().enumerate() {
            if subtask.ordering == ChildOrdering::MustPrecede {
                for later in predecessors.iter_mut().skip(i + 1) {
                    later.push(i);
                }
            }
            for dep in &subtask.depends_on {
                let &j = index.get(dep.as_str()).ok_or_else(|| {
                    CoordinatorError::Validation(format!(
                        "子任务 {} 依赖未知的子任务 {}",
                        subtask.key, dep
                    ))
                })?;
                if j == i {
                    return Err(CoordinatorError::InvalidDependencyGraph(format!(
                        "子任务 {} 依赖自身",
                        subtask.key
                    )));
                }
                predecessors[i].push(j);
            }
        }
        for preds in predecessors.iter_mut() {
            preds.sort_unstable();
            preds.dedup();
        }

        let topo_order = Self::topological_order(&predecessors).map_err(|remaining| {
            let keys: Vec<&str> = remaining.iter().map(|&i| subtasks[i].key.as_str()).collect();
            warn!("检测到子任务循环依赖: {:?}", keys);
            CoordinatorError::InvalidDependencyGraph(format!("子任务存在循环依赖: {}", keys.join(", ")))
        })?;

        debug!("子任务依赖图构建完成，共 {} 个子任务", subtasks.len());
        Ok(PrecedenceGraph {
            predecessors,
            topo_order,
        })
    }

    /// Kahn算法；存在环时返回无法排序的节点
    fn topological_order(predecessors: &[Vec<usize>]) -> Result<Vec<usize>, Vec<usize>> {
        let n = predecessors.len();
        let mut in_degree: Vec<usize> = predecessors.iter().map(Vec::len).collect();
        let mut successors: Vec<Vec<usize>> = vec![Vec::new(); n];
        for (node, preds) in predecessors.iter().enumerate() {
            for &p in preds {
                successors[p].push(node);
            }
        }

        let mut queue: VecDeque<usize> = (0..n).filter(|&i| in_degree[i] == 0).collect();
        let mut order = Vec::with_capacity(n);
        while let Some(node) = queue.pop_front() {
            order.push(node);
            for &next in &successors[node] {
                in_degree[next] -= 1;
                if in_degree[next] == 0 {
                    queue.push_back(next);
                }
            }
        }

        if order.len() < n {
            let remaining = (0..n).filter(|&i| in_degree[i] > 0).collect();
            return Err(remaining);
        }
        Ok(order)
    }

    /// 根据前置任务的当前状态判断任务能否执行
    pub fn check_dependencies<'a, I>(dependencies: I) -> DependencyCheckResult
    where
        I: IntoIterator<Item = (&'a str, TaskState)>,
    {
        let mut blocking = Vec::new();
        for (id, state) in dependencies {
            match state {
                TaskState::Completed => {}
                s if s.is_terminal() && s != TaskState::Failed => {
                    return DependencyCheckResult::Broken {
                        dependency: id.to_string(),
                        state: s,
                    };
                }
                _ => blocking.push(id.to_string()),
            }
        }
        if blocking.is_empty() {
            DependencyCheckResult::Satisfied
        } else {
            DependencyCheckResult::Waiting { blocking }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_must_precede_blocks_later_siblings_only() {
        let subtasks = vec![
            SubtaskSubmission::new("a", &["build"]),
            SubtaskSubmission::new("b", &["build"]).must_precede(),
            SubtaskSubmission::new("c", &["test"]),
            SubtaskSubmission::new("d", &["test"]),
        ];
        let graph = DependencyChecker::build_precedence(&subtasks).unwrap();
        assert!(graph.predecessors[0].is_empty());
        assert!(graph.predecessors[1].is_empty());
        assert_eq!(graph.predecessors[2], vec![1]);
        assert_eq!(graph.predecessors[3], vec![1]);
    }

    #[test]
    fn test_failed_dependency_is_still_waiting() {
        // Failed 是单次尝试的中间状态，随后会被重试或放弃
        let result = DependencyChecker::check_dependencies([("a", TaskState::Failed)]);
        assert_eq!(
            result,
            DependencyCheckResult::Waiting {
                blocking: vec!["a".to_string()]
            }
        );

        let result = DependencyChecker::check_dependencies([
            ("a", TaskState::Completed),
            ("b", TaskState::Abandoned),
        ]);
        assert!(matches!(result, DependencyCheckResult::Broken { .. }));
    }
}
