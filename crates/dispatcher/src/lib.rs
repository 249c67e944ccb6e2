//! 任务协调核心
//!
//! Worker注册表、任务表与状态机、资源锁表、存活监控、升级通道，以及消费
//! Worker上报消息的状态监听器。

pub mod dependency_checker;
pub mod dispatcher;
pub mod escalation;
pub mod liveness;
pub mod lock_table;
pub mod registry;
pub mod retry_policy;
pub mod state_listener;
pub mod strategies;
pub mod task_store;

pub use dependency_checker::{DependencyCheckResult, DependencyChecker, PrecedenceGraph};
pub use dispatcher::{DispatchReport, StuckAction, SystemStats, TaskDispatcher};
pub use escalation::EscalationChannel;
pub use liveness::{LivenessMonitor, SweepReport};
pub use lock_table::{Grant, LockOutcome, LockView, OverdueWaiter, ResourceLockTable};
pub use registry::{HeartbeatOutcome, RegistryStats, SlotRelease, WorkerRegistry};
pub use retry_policy::RetryPolicy;
pub use state_listener::StateListener;
pub use strategies::*;
pub use task_store::{TaskHandle, TaskStore};
