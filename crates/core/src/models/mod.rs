//! # 数据模型
//!
//! 协调核心的全部数据结构：Worker、任务、总线消息与升级记录。
//!
//! ## 任务状态流转
//! ```text
//! Pending → Assigned → Running → Completed
//!    ↑         │          │
//!    │         └──────────┴──→ Failed ──→ Abandoned
//!    └──────────── 重试 ─────────┘
//! Pending/Assigned/Running ──→ Cancelled
//! ```
//!
//! ## Worker状态流转
//! ```text
//! Starting → Idle ⇄ Busy → Degraded → Offline
//! ```
//!
//! 所有时间字段使用 `DateTime<Utc>`，状态字段使用枚举，所有模型都支持serde序列化。

pub mod escalation;
pub mod message;
pub mod task;
pub mod worker;

pub use escalation::*;
pub use message::*;
pub use task::*;
pub use worker::*;
