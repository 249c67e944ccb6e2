pub mod escalation_sink;
pub mod message_bus;

pub use escalation_sink::*;
pub use message_bus::*;
