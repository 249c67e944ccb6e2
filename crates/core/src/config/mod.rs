//! 配置管理
//!
//! `AppConfig` 由内置默认值、TOML配置文件和 `COORDINATOR__` 前缀的环境变量依次覆盖得到。
//! 所有超时、阈值都来自配置，不在代码中写死。

pub mod models;
pub mod validation;

pub use models::*;
pub use validation::{ConfigValidator, ValidationUtils};
