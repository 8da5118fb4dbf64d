//! Execution and pool counters.
//!
//! Counters are lock-free atomics. Latency samples live in a bounded
//! ring behind a mutex so percentiles reflect recent executions only.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;

use serde::Serialize;
use tracing::debug;

/// Number of recent execution latencies kept for percentiles.
pub const LATENCY_WINDOW: usize = 1024;

/// Subsystem-wide counters.
#[derive(Debug, Default)]
pub struct Metrics {
    executions_total: AtomicU64,
    execution_failures_total: AtomicU64,
    execution_timeouts_total: AtomicU64,
    acquire_timeouts_total: AtomicU64,
    containers_created_total: AtomicU64,
    containers_destroyed_total: AtomicU64,
    /// Recent latencies in microseconds.
    latencies: Mutex<VecDeque<u64>>,
}

/// Create the shared counter set.
pub fn initialize_metrics() -> Arc<Metrics> {
    debug!("metrics initialized");
    Arc::new(Metrics::default())
}

/// Pool occupancy at snapshot time.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct PoolGauge {
    pub idle: u32,
    pub busy: u32,
    pub max_total: u32,
}

/// One endpoint's health and load at snapshot time.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct EndpointGauge {
    pub endpoint_id: String,
    pub healthy: bool,
    pub active_containers: u32,
    pub capacity: u32,
    pub avg_latency_ms: f64,
    pub consecutive_failures: u32,
}

/// Point-in-time view of counters and gauges.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct MetricsSnapshot {
    pub executions_total: u64,
    pub execution_failures_total: u64,
    pub execution_timeouts_total: u64,
    pub acquire_timeouts_total: u64,
    pub containers_created_total: u64,
    pub containers_destroyed_total: u64,
    pub latency_p50_ms: f64,
    pub latency_p99_ms: f64,
    pub pool: PoolGauge,
    pub endpoints: Vec<EndpointGauge>,
}

impl Metrics {
    /// Count a finished execution. `failed` covers non-zero exits and faults.
    pub fn record_execution(&self, latency: Duration, failed: bool) {
        self.executions_total.fetch_add(1, Ordering::Relaxed);
        if failed {
            self.execution_failures_total.fetch_add(1, Ordering::Relaxed);
        }
        let micros = u64::try_from(latency.as_micros()).unwrap_or(u64::MAX);
        let mut window = self.latencies.lock().unwrap_or_else(PoisonError::into_inner);
        if window.len() == LATENCY_WINDOW {
            window.pop_front();
        }
        window.push_back(micros);
    }

    /// Count an execution that hit its time limit.
    pub fn record_execution_timeout(&self) {
        self.executions_total.fetch_add(1, Ordering::Relaxed);
        self.execution_failures_total.fetch_add(1, Ordering::Relaxed);
        self.execution_timeouts_total.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_acquire_timeout(&self) {
        self.acquire_timeouts_total.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_container_created(&self) {
        self.containers_created_total.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_container_destroyed(&self) {
        self.containers_destroyed_total.fetch_add(1, Ordering::Relaxed);
    }

    pub fn executions_total(&self) -> u64 {
        self.executions_total.load(Ordering::Relaxed)
    }

    pub fn containers_created_total(&self) -> u64 {
        self.containers_created_total.load(Ordering::Relaxed)
    }

    pub fn containers_destroyed_total(&self) -> u64 {
        self.containers_destroyed_total.load(Ordering::Relaxed)
    }

    /// Combine counters with the supplied gauges.
    pub fn snapshot(&self, pool: PoolGauge, endpoints: Vec<EndpointGauge>) -> MetricsSnapshot {
        let samples: Vec<u64> = self
            .latencies
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .iter()
            .copied()
            .collect();
        let latency = ExecutionLatency::from_samples(&samples);

        MetricsSnapshot {
            executions_total: self.executions_total.load(Ordering::Relaxed),
            execution_failures_total: self.execution_failures_total.load(Ordering::Relaxed),
            execution_timeouts_total: self.execution_timeouts_total.load(Ordering::Relaxed),
            acquire_timeouts_total: self.acquire_timeouts_total.load(Ordering::Relaxed),
            containers_created_total: self.containers_created_total.load(Ordering::Relaxed),
            containers_destroyed_total: self.containers_destroyed_total.load(Ordering::Relaxed),
            latency_p50_ms: latency.p50_ms,
            latency_p99_ms: latency.p99_ms,
            pool,
            endpoints,
        }
    }
}

/// Median and tail of the recent execution window, in milliseconds.
#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct ExecutionLatency {
    pub p50_ms: f64,
    pub p99_ms: f64,
}

impl ExecutionLatency {
    /// Nearest-rank percentiles over microsecond samples. An empty window
    /// reads as zero.
    pub fn from_samples(samples_us: &[u64]) -> Self {
        if samples_us.is_empty() {
            return Self::default();
        }
        let mut sorted = samples_us.to_vec();
        sorted.sort_unstable();
        let at = |quantile: f64| {
            let rank = ((sorted.len() as f64 * quantile) as usize).min(sorted.len() - 1);
            sorted[rank] as f64 / 1000.0
        };
        Self {
            p50_ms: at(0.50),
            p99_ms: at(0.99),
        }
    }
}
