pub mod api_observability;
pub mod app_config;
pub mod dispatcher;
pub mod liveness;
pub mod registry;

pub use api_observability::*;
pub use app_config::*;
pub use dispatcher::*;
pub use liveness::*;
pub use registry::*;
