//! liquid-metrics: counters and gauges for the container subsystem.
//!
//! [`Metrics`] is a bag of atomics shared behind an `Arc`; the pool and
//! executor bump it as work happens. [`Metrics::snapshot`] combines the
//! counters with pool and endpoint gauges supplied by the caller, and
//! [`render_prometheus`] turns a snapshot into scrape text.

pub mod collector;
pub mod prometheus;

pub use collector::{
    EndpointGauge, ExecutionLatency, LATENCY_WINDOW, Metrics, MetricsSnapshot, PoolGauge,
    initialize_metrics,
};
pub use prometheus::render_prometheus;
