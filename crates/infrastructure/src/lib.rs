pub mod escalation_sinks;
pub mod in_memory_bus;
pub mod observability;

pub use escalation_sinks::*;
pub use in_memory_bus::*;
pub use observability::*;
