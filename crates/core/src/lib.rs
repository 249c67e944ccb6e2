//! 协调核心基础库：错误类型、数据模型、配置模型与服务接口。

pub mod config;
pub mod errors;
pub mod models;
pub mod traits;

pub use config::*;
pub use errors::{CoordinatorError, CoordinatorResult};
pub use models::*;
pub use traits::*;
