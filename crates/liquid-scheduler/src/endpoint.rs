//! Per-endpoint state: capacity, health, and latency.
//!
//! Health is a small state machine driven by execution outcomes. Three
//! consecutive failures mark an endpoint unhealthy; a single success
//! restores it.

use std::collections::HashMap;

use serde::Serialize;
use tracing::{debug, warn};

use liquid_core::{LOCAL_ENDPOINT_ID, RemoteEndpointConfig};

/// Consecutive failures before an endpoint is excluded from placement.
pub const UNHEALTHY_THRESHOLD: u32 = 3;

/// Smoothing factor of the latency moving average.
pub const LATENCY_EMA_ALPHA: f64 = 0.3;

const LOCAL_DAEMON_URL: &str = "unix:///var/run/docker.sock";

/// Scheduler-owned view of one endpoint. Callers receive clones.
#[derive(Debug, Clone, Serialize)]
pub struct EndpointState {
    pub config: RemoteEndpointConfig,
    pub active_containers: u32,
    pub healthy: bool,
    pub enabled: bool,
    pub consecutive_failures: u32,
    /// Exponential moving average of execution latency.
    pub avg_latency_ms: f64,
    pub latency_samples: u64,
    pub is_local: bool,
}

impl EndpointState {
    /// State for a configured remote endpoint.
    pub fn remote(config: RemoteEndpointConfig) -> Self {
        let enabled = config.enabled;
        Self {
            config,
            active_containers: 0,
            healthy: enabled,
            enabled,
            consecutive_failures: 0,
            avg_latency_ms: 0.0,
            latency_samples: 0,
            is_local: false,
        }
    }

    /// The implicit local endpoint, sized to the pool's `max_total`.
    pub fn local(capacity: u32, labels: HashMap<String, String>) -> Self {
        let config = RemoteEndpointConfig {
            id: LOCAL_ENDPOINT_ID.to_string(),
            url: LOCAL_DAEMON_URL.to_string(),
            max_containers: capacity,
            weight: 1.0,
            labels,
            enabled: true,
            ssh: None,
        };
        Self {
            is_local: true,
            ..Self::remote(config)
        }
    }

    pub fn id(&self) -> &str {
        &self.config.id
    }

    pub fn capacity(&self) -> u32 {
        self.config.max_containers
    }

    pub fn has_capacity(&self) -> bool {
        self.active_containers < self.capacity()
    }

    /// Enabled, healthy, and below capacity.
    pub fn is_available(&self) -> bool {
        self.enabled && self.healthy && self.has_capacity()
    }

    pub(crate) fn record_failure(&mut self) {
        self.consecutive_failures += 1;
        if self.consecutive_failures >= UNHEALTHY_THRESHOLD && self.healthy {
            warn!(
                endpoint = %self.config.id,
                failures = self.consecutive_failures,
                threshold = UNHEALTHY_THRESHOLD,
                "endpoint marked unhealthy"
            );
            self.healthy = false;
        }
    }

    pub(crate) fn record_success(&mut self, latency_ms: f64) {
        if !self.healthy && self.enabled {
            debug!(endpoint = %self.config.id, "endpoint recovered to healthy");
        }
        self.consecutive_failures = 0;
        if self.enabled {
            self.healthy = true;
        }
        self.avg_latency_ms =
            LATENCY_EMA_ALPHA * latency_ms + (1.0 - LATENCY_EMA_ALPHA) * self.avg_latency_ms;
        self.latency_samples += 1;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn endpoint() -> EndpointState {
        EndpointState::remote(RemoteEndpointConfig::new("r1", "tcp://10.0.0.1:2376"))
    }

    #[test]
    fn third_failure_marks_unhealthy() {
        let mut ep = endpoint();
        ep.record_failure();
        ep.record_failure();
        assert!(ep.healthy);
        ep.record_failure();
        assert!(!ep.healthy);
        assert!(!ep.is_available());
    }

    #[test]
    fn success_restores_and_resets() {
        let mut ep = endpoint();
        for _ in 0..5 {
            ep.record_failure();
        }
        ep.record_success(10.0);
        assert!(ep.healthy);
        assert_eq!(ep.consecutive_failures, 0);
    }

    #[test]
    fn latency_blends_from_zero() {
        let mut ep = endpoint();
        ep.record_success(100.0);
        assert!((ep.avg_latency_ms - 30.0).abs() < 1e-9);
        ep.record_success(200.0);
        assert!((ep.avg_latency_ms - 81.0).abs() < 1e-9);
        assert_eq!(ep.latency_samples, 2);
    }

    #[test]
    fn success_does_not_reenable_disabled_endpoint() {
        let mut ep = endpoint();
        ep.enabled = false;
        ep.healthy = false;
        ep.record_success(5.0);
        assert!(!ep.healthy);
    }

    #[test]
    fn disabled_config_starts_unhealthy() {
        let mut cfg = RemoteEndpointConfig::new("r2", "tcp://10.0.0.2:2376");
        cfg.enabled = false;
        let ep = EndpointState::remote(cfg);
        assert!(!ep.enabled);
        assert!(!ep.is_available());
    }

    #[test]
    fn local_endpoint_capacity() {
        let mut ep = EndpointState::local(2, HashMap::new());
        assert!(ep.is_local);
        assert_eq!(ep.id(), LOCAL_ENDPOINT_ID);
        ep.active_containers = 2;
        assert!(!ep.has_capacity());
    }
}
