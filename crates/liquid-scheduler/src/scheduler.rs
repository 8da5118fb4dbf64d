//! Endpoint registry and placement.
//!
//! The registry is a map keyed by endpoint id guarded by a synchronous
//! `RwLock`. No lock is ever held across an `.await`; every method here
//! is synchronous and short.

use std::collections::HashMap;
use std::sync::{PoisonError, RwLock, RwLockReadGuard, RwLockWriteGuard};

use rand::Rng;
use serde::Serialize;
use tracing::{debug, info, warn};

use liquid_core::{
    AffinityRule, LOCAL_ENDPOINT_ID, PlacementKind, PoolConfig, RemoteEndpointConfig, matches_all,
};

use crate::endpoint::EndpointState;
use crate::error::{SchedulerError, SchedulerResult};
use crate::selector::{pick_weighted, placement_weights};

/// Aggregate registry gauges.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct SchedulerMetrics {
    pub total_endpoints: usize,
    pub healthy_endpoints: usize,
    /// Enabled, healthy endpoints the placement kind can choose from.
    pub placeable_endpoints: usize,
    pub total_active_containers: u32,
    pub total_capacity: u32,
}

/// Places containers on endpoints and tracks their health.
pub struct Scheduler {
    kind: PlacementKind,
    local_weight: f64,
    endpoints: RwLock<HashMap<String, EndpointState>>,
}

impl Scheduler {
    /// Registry seeded with the local endpoint and every configured remote.
    ///
    /// Remote configs whose id is already registered are skipped with a
    /// warning; validation reports them separately.
    pub fn new(pool: &PoolConfig) -> Self {
        let placement = &pool.placement;
        let mut endpoints = HashMap::new();
        endpoints.insert(
            LOCAL_ENDPOINT_ID.to_string(),
            EndpointState::local(pool.max_total, placement.local_labels.clone()),
        );
        for remote in &placement.remote_endpoints {
            if endpoints.contains_key(&remote.id) {
                warn!(endpoint = %remote.id, "duplicate endpoint id in config, skipping");
                continue;
            }
            endpoints.insert(remote.id.clone(), EndpointState::remote(remote.clone()));
        }

        info!(
            placement = ?placement.kind,
            endpoints = endpoints.len(),
            "scheduler initialized"
        );

        Self {
            kind: placement.kind,
            local_weight: placement.local_weight,
            endpoints: RwLock::new(endpoints),
        }
    }

    pub fn placement_kind(&self) -> PlacementKind {
        self.kind
    }

    fn read(&self) -> RwLockReadGuard<'_, HashMap<String, EndpointState>> {
        self.endpoints.read().unwrap_or_else(PoisonError::into_inner)
    }

    fn write(&self) -> RwLockWriteGuard<'_, HashMap<String, EndpointState>> {
        self.endpoints.write().unwrap_or_else(PoisonError::into_inner)
    }

    fn allowed_by_placement(&self, endpoint: &EndpointState) -> bool {
        match self.kind {
            PlacementKind::Local => endpoint.is_local,
            PlacementKind::Remote => !endpoint.is_local,
            PlacementKind::Hybrid => true,
        }
    }

    fn choose<'a>(
        &self,
        endpoints: &'a HashMap<String, EndpointState>,
        affinity: &[AffinityRule],
    ) -> SchedulerResult<&'a EndpointState> {
        let mut candidates: Vec<&EndpointState> = endpoints
            .values()
            .filter(|ep| self.allowed_by_placement(ep))
            .filter(|ep| ep.is_available())
            .filter(|ep| matches_all(affinity, &ep.config.labels))
            .collect();
        candidates.sort_by(|a, b| a.id().cmp(b.id()));

        if candidates.is_empty() {
            return Err(SchedulerError::EndpointUnavailable(format!(
                "no healthy endpoint with capacity matches {} affinity rule(s) under {:?} placement",
                affinity.len(),
                self.kind
            )));
        }

        let weights = placement_weights(self.kind, self.local_weight, &candidates);
        let draw: f64 = rand::thread_rng().r#gen();
        let idx = pick_weighted(&weights, draw).unwrap_or(0);
        Ok(candidates[idx])
    }

    /// Pick an endpoint for a new container.
    ///
    /// Only enabled, healthy endpoints below capacity that satisfy every
    /// affinity rule and the placement kind are considered.
    pub fn select_endpoint(&self, affinity: &[AffinityRule]) -> SchedulerResult<EndpointState> {
        let endpoints = self.read();
        let chosen = self.choose(&endpoints, affinity)?;
        debug!(endpoint = %chosen.id(), "endpoint selected");
        Ok(chosen.clone())
    }

    /// Select an endpoint and count a container against it in one step,
    /// so concurrent callers cannot overshoot its capacity.
    pub fn reserve_endpoint(&self, affinity: &[AffinityRule]) -> SchedulerResult<EndpointState> {
        let mut endpoints = self.write();
        let id = self.choose(&endpoints, affinity)?.id().to_string();
        match endpoints.get_mut(&id) {
            Some(ep) => {
                ep.active_containers += 1;
                debug!(endpoint = %id, active = ep.active_containers, "endpoint reserved");
                Ok(ep.clone())
            }
            None => Err(SchedulerError::UnknownEndpoint(id)),
        }
    }

    fn update(&self, id: &str, op: &str, f: impl FnOnce(&mut EndpointState)) {
        match self.write().get_mut(id) {
            Some(ep) => f(ep),
            None => debug!(endpoint = %id, op, "ignoring bookkeeping for unknown endpoint"),
        }
    }

    pub fn record_acquire(&self, id: &str) {
        self.update(id, "acquire", |ep| ep.active_containers += 1);
    }

    /// Decrement the active count, never below zero.
    pub fn record_release(&self, id: &str) {
        self.update(id, "release", |ep| {
            ep.active_containers = ep.active_containers.saturating_sub(1);
        });
    }

    pub fn record_success(&self, id: &str, latency_ms: f64) {
        self.update(id, "success", |ep| ep.record_success(latency_ms));
    }

    pub fn record_failure(&self, id: &str) {
        self.update(id, "failure", |ep| ep.record_failure());
    }

    /// Exclude an endpoint from placement until re-enabled.
    pub fn disable_endpoint(&self, id: &str) -> SchedulerResult<()> {
        let mut endpoints = self.write();
        let ep = endpoints
            .get_mut(id)
            .ok_or_else(|| SchedulerError::UnknownEndpoint(id.to_string()))?;
        ep.enabled = false;
        ep.healthy = false;
        info!(endpoint = %id, "endpoint disabled");
        Ok(())
    }

    /// Re-admit an endpoint as healthy with its failure count cleared.
    pub fn enable_endpoint(&self, id: &str) -> SchedulerResult<()> {
        let mut endpoints = self.write();
        let ep = endpoints
            .get_mut(id)
            .ok_or_else(|| SchedulerError::UnknownEndpoint(id.to_string()))?;
        ep.enabled = true;
        ep.healthy = true;
        ep.consecutive_failures = 0;
        info!(endpoint = %id, "endpoint enabled");
        Ok(())
    }

    pub fn add_endpoint(&self, config: RemoteEndpointConfig) -> SchedulerResult<()> {
        let mut endpoints = self.write();
        if endpoints.contains_key(&config.id) {
            return Err(SchedulerError::DuplicateEndpoint(config.id));
        }
        info!(endpoint = %config.id, url = %config.url, "endpoint added");
        endpoints.insert(config.id.clone(), EndpointState::remote(config));
        Ok(())
    }

    /// Remove an endpoint. Returns whether it was registered.
    pub fn remove_endpoint(&self, id: &str) -> bool {
        let removed = self.write().remove(id).is_some();
        if removed {
            info!(endpoint = %id, "endpoint removed");
        }
        removed
    }

    pub fn get_endpoint(&self, id: &str) -> Option<EndpointState> {
        self.read().get(id).cloned()
    }

    /// Snapshot of every endpoint, sorted by id.
    pub fn endpoints(&self) -> Vec<EndpointState> {
        let mut all: Vec<EndpointState> = self.read().values().cloned().collect();
        all.sort_by(|a, b| a.id().cmp(b.id()));
        all
    }

    pub fn get_metrics(&self) -> SchedulerMetrics {
        let endpoints = self.read();
        SchedulerMetrics {
            total_endpoints: endpoints.len(),
            healthy_endpoints: endpoints.values().filter(|e| e.healthy).count(),
            placeable_endpoints: endpoints
                .values()
                .filter(|e| e.enabled && e.healthy && self.allowed_by_placement(e))
                .count(),
            total_active_containers: endpoints.values().map(|e| e.active_containers).sum(),
            total_capacity: endpoints.values().map(|e| e.capacity()).sum(),
        }
    }
}
