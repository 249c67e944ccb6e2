pub mod health;
pub mod messages;
pub mod system;
pub mod tasks;
pub mod workers;
