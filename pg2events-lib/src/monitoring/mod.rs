//! Monitoring
//!
//! Statistics sinks beyond the no-op default. The Prometheus sink is only
//! compiled with the `metrics` feature.

#[cfg(feature = "metrics")]
pub mod metrics;

#[cfg(feature = "metrics")]
pub use metrics::{gather_metrics, PrometheusStatistics};
