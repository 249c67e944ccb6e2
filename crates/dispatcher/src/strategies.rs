use std::cmp::Ordering;
use std::collections::BTreeSet;
use std::sync::Arc;

use tracing::{debug, warn};

use coordinator_core::WorkerInfo;

/// 候选Worker排序策略
///
/// 输入已经过滤为能力覆盖、状态可用且有空闲槽位的Worker，策略只负责排序。
pub trait WorkerSelectionStrategy: Send + Sync {
    fn rank(&self, required: &BTreeSet<String>, candidates: &mut Vec<WorkerInfo>);

    fn name(&self) -> &str;
}

/// 能力亲和策略：能力集合完全匹配优先，其次负载升序，再次历史成功率降序
pub struct CapabilityAffinityStrategy;

/// 负载均衡策略：按负载比例升序
pub struct LeastLoadedStrategy;

impl CapabilityAffinityStrategy {
    pub fn new() -> Self {
        Self
    }
}

impl Default for CapabilityAffinityStrategy {
    fn default() -> Self {
        Self::new()
    }
}

impl WorkerSelectionStrategy for CapabilityAffinityStrategy {
    fn rank(&self, required: &BTreeSet<String>, candidates: &mut Vec<WorkerInfo>) {
        candidates.sort_by(|a, b| {
            b.is_exact_match(required)
                .cmp(&a.is_exact_match(required))
                .then_with(|| a.current_load().cmp(&b.current_load()))
                .then_with(|| {
                    b.success_rate()
                        .partial_cmp(&a.success_rate())
                        .unwrap_or(Ordering::Equal)
                })
                .then_with(|| a.id.cmp(&b.id))
        });

        if let Some(first) = candidates.first() {
            debug!(
                "能力亲和策略首选Worker: {} (完全匹配: {}, 负载: {}/{})",
                first.id,
                first.is_exact_match(required),
                first.current_load(),
                first.max_concurrency
            );
        }
    }

    fn name(&self) -> &str {
        "CapabilityAffinity"
    }
}

impl LeastLoadedStrategy {
    pub fn new() -> Self {
        Self
    }
}

impl Default for LeastLoadedStrategy {
    fn default() -> Self {
        Self::new()
    }
}

impl WorkerSelectionStrategy for LeastLoadedStrategy {
    fn rank(&self, _required: &BTreeSet<String>, candidates: &mut Vec<WorkerInfo>) {
        candidates.sort_by(|a, b| {
            a.load_ratio()
                .partial_cmp(&b.load_ratio())
                .unwrap_or(Ordering::Equal)
                .then_with(|| a.id.cmp(&b.id))
        });

        if let Some(first) = candidates.first() {
            debug!(
                "负载均衡策略首选Worker: {} (负载: {:.1}%)",
                first.id,
                first.load_ratio() * 100.0
            );
        }
    }

    fn name(&self) -> &str {
        "LeastLoaded"
    }
}

/// 根据配置名称创建策略，未知名称回退到能力亲和策略
pub fn strategy_from_name(name: &str) -> Arc<dyn WorkerSelectionStrategy> {
    match name {
        "least_loaded" => Arc::new(LeastLoadedStrategy::new()),
        "capability_affinity" => Arc::new(CapabilityAffinityStrategy::new()),
        other => {
            warn!("未知的Worker排序策略 {}，使用 capability_affinity", other);
            Arc::new(CapabilityAffinityStrategy::new())
        }
    }
}
