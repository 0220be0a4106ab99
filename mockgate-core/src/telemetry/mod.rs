//! Metrics for the proxy, snapshot, and reload loop.

pub mod cardinality;
pub mod prom_metrics;

pub use cardinality::CardinalityLimiter;
pub use prom_metrics::MockGateMetrics;
