//! Observability module
//!
//! - Metrics collection on the `metrics` facade
//! - Structured lifecycle logging
//! - Prometheus recorder installation

pub mod metrics_collector;
pub mod structured_logger;
pub mod telemetry_setup;

// Re-export main types for convenience
pub use metrics_collector::MetricsCollector;
pub use structured_logger::StructuredLogger;
pub use telemetry_setup::install_prometheus_recorder;
