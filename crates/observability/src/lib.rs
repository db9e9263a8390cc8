//! Tracing and tenant-tagged metrics (shared setup).

/// Initialize process-wide observability (tracing/logging).
///
/// This is safe to call multiple times; subsequent calls become no-ops.
pub fn init() {
    tracing::init();
}

/// Tracing configuration (filters, layers).
pub mod tracing;

/// Tenant-tagged gauges and counters.
pub mod metrics;

pub use crate::metrics::{
    CounterHandle, FacadeMetricsRegistry, GaugeHandle, InMemoryMetricsRegistry, MetricKey,
    MetricKind, MetricsRegistry, SharedMetricsRegistry,
};
