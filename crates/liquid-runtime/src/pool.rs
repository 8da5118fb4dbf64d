//! Warm container pool.
//!
//! Keeps up to `max_total` containers across all endpoints, at least
//! `min_idle` of them idle when possible. Acquisitions are admitted one at
//! a time in FIFO order; a caller that finds neither an idle container nor
//! spare capacity waits for a release until `acquire_timeout` runs out.
//!
//! ```text
//! acquire ──► admission (FIFO) ──► idle? ──► busy
//!                                   │
//!                                   ├─ capacity? ──► create (spawned) ──► busy
//!                                   └─ wait for release / destroy
//! ```

use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use serde::Serialize;
use tokio::sync::{Notify, oneshot, watch};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};
use uuid::Uuid;

use liquid_core::{AffinityRule, PoolConfig, matches_all};
use liquid_metrics::{EndpointGauge, Metrics, MetricsSnapshot, PoolGauge};
use liquid_scheduler::{Scheduler, SchedulerError};
use liquid_secrets::{SecretValue, SecretsProvider, redact, resolve_secrets};

use crate::backend::ContainerSpec;
use crate::client::ContainerClient;
use crate::container::{Container, ContainerState};
use crate::error::{RuntimeError, RuntimeResult};

/// Label recording which endpoint a container was placed on.
pub const ENDPOINT_LABEL: &str = "liquid.endpoint";

/// Secrets resolved and injected into every new container.
#[derive(Clone)]
pub struct SecretInjection {
    pub provider: Arc<dyn SecretsProvider>,
    pub names: Vec<String>,
}

/// Pool occupancy.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct PoolStats {
    pub idle: u32,
    pub busy: u32,
    pub creating: u32,
    pub total: u32,
    pub max_total: u32,
}

/// What one maintenance pass did.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct MaintenanceReport {
    pub checked: u32,
    pub unhealthy: u32,
    pub evicted: u32,
    pub created: u32,
}

#[derive(Default)]
struct PoolState {
    idle: VecDeque<Container>,
    /// Checked-out or in-flight containers: id → endpoint id.
    busy: HashMap<String, String>,
    creating: u32,
}

impl PoolState {
    fn total(&self) -> u32 {
        self.idle.len() as u32 + self.busy.len() as u32 + self.creating
    }

    fn checkout(&mut self, mut container: Container) -> Container {
        container.set_state(ContainerState::Busy);
        self.busy
            .insert(container.id().to_string(), container.endpoint_id().to_string());
        container
    }
}

enum Admission {
    Ready(Container),
    Create,
    /// Capacity is full of idle containers that fail the affinity rules;
    /// this one is dropped to make room.
    Replace(Container),
    /// No endpoint can take the affinity rules and nothing busy could
    /// come back to satisfy them.
    Unplaceable(SchedulerError),
    Full,
}

struct MaintenanceTask {
    shutdown_tx: watch::Sender<bool>,
    handle: JoinHandle<()>,
}

struct PoolInner {
    config: PoolConfig,
    client: ContainerClient,
    secrets: Option<SecretInjection>,
    metrics: Arc<Metrics>,
    state: Mutex<PoolState>,
    /// Injected values per live container, for output redaction.
    known_secrets: Mutex<HashMap<String, Vec<SecretValue>>>,
    admission: tokio::sync::Mutex<()>,
    available: Notify,
    shutting_down: AtomicBool,
}

pub struct ContainerPool {
    inner: Arc<PoolInner>,
    maintenance: Mutex<Option<MaintenanceTask>>,
}

impl ContainerPool {
    pub fn new(
        config: PoolConfig,
        client: ContainerClient,
        metrics: Arc<Metrics>,
        secrets: Option<SecretInjection>,
    ) -> Self {
        Self {
            inner: Arc::new(PoolInner {
                config,
                client,
                secrets,
                metrics,
                state: Mutex::new(PoolState::default()),
                known_secrets: Mutex::new(HashMap::new()),
                admission: tokio::sync::Mutex::new(()),
                available: Notify::new(),
                shutting_down: AtomicBool::new(false),
            }),
            maintenance: Mutex::new(None),
        }
    }

    pub fn config(&self) -> &PoolConfig {
        &self.inner.config
    }

    pub fn client(&self) -> &ContainerClient {
        &self.inner.client
    }

    pub fn scheduler(&self) -> &Arc<Scheduler> {
        self.inner.client.scheduler()
    }

    pub fn metrics(&self) -> &Arc<Metrics> {
        &self.inner.metrics
    }

    pub fn is_shut_down(&self) -> bool {
        self.inner.shutting_down.load(Ordering::Acquire)
    }

    /// Check out a container, creating one if there is room.
    ///
    /// Fails with an acquisition timeout (`container_id == None`) when
    /// nothing frees up within `acquire_timeout`.
    pub async fn acquire(&self) -> RuntimeResult<Container> {
        self.acquire_with_affinity(&[]).await
    }

    /// Like [`acquire`](Self::acquire), restricted to endpoints whose
    /// labels satisfy every rule.
    pub async fn acquire_with_affinity(&self, affinity: &[AffinityRule]) -> RuntimeResult<Container> {
        let timeout = self.inner.config.acquire_timeout;
        match tokio::time::timeout(timeout, self.inner.acquire(affinity)).await {
            Ok(result) => result,
            Err(_) => {
                self.inner.metrics.record_acquire_timeout();
                warn!(timeout_ms = timeout.as_millis() as u64, "container acquisition timed out");
                Err(RuntimeError::ContainerTimeout {
                    container_id: None,
                    timeout,
                })
            }
        }
    }

    /// Check out a container without waiting for capacity.
    pub async fn try_acquire(&self) -> RuntimeResult<Container> {
        if self.is_shut_down() {
            return Err(RuntimeError::ShutDown);
        }
        match self.inner.try_admit(&[]) {
            Admission::Ready(container) => Ok(container),
            Admission::Create => self.inner.spawn_creation(&[]).await.unwrap_or(Err(RuntimeError::ShutDown)),
            Admission::Replace(stale) => {
                self.inner.destroy_in_background(stale);
                self.inner.spawn_creation(&[]).await.unwrap_or(Err(RuntimeError::ShutDown))
            }
            Admission::Unplaceable(e) => Err(e.into()),
            Admission::Full => Err(RuntimeError::PoolExhausted {
                max_total: self.inner.config.max_total,
            }),
        }
    }

    /// Return a container. Faulty containers, and any container released
    /// after shutdown, are destroyed instead of pooled.
    pub async fn release(&self, container: Container) {
        self.inner.release(container).await;
    }

    /// Create idle containers up to `min_idle`.
    pub async fn warm_up(&self) -> RuntimeResult<u32> {
        let (created, error) = self.inner.fill_to_min_idle().await;
        info!(min_idle = self.inner.config.min_idle, created, "container pool warmed");
        match error {
            Some(e) => Err(e),
            None => Ok(created),
        }
    }

    /// Run one health/eviction/top-up pass now.
    pub async fn run_maintenance(&self) -> MaintenanceReport {
        self.inner.run_maintenance().await
    }

    /// Spawn the periodic maintenance task. Calling twice is a no-op.
    pub fn start_maintenance(&self) {
        let mut slot = self.maintenance.lock().unwrap_or_else(PoisonError::into_inner);
        if slot.is_some() || self.is_shut_down() {
            return;
        }
        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let inner = Arc::clone(&self.inner);
        let handle = tokio::spawn(async move { inner.maintenance_loop(shutdown_rx).await });
        *slot = Some(MaintenanceTask {
            shutdown_tx,
            handle,
        });
        info!(
            interval_ms = self.inner.config.health_check_interval.as_millis() as u64,
            "pool maintenance started"
        );
    }

    pub fn stats(&self) -> PoolStats {
        let st = self.inner.lock_state();
        PoolStats {
            idle: st.idle.len() as u32,
            busy: st.busy.len() as u32,
            creating: st.creating,
            total: st.total(),
            max_total: self.inner.config.max_total,
        }
    }

    /// Counters plus current pool and endpoint gauges.
    pub fn metrics_snapshot(&self) -> MetricsSnapshot {
        let stats = self.stats();
        let endpoints = self
            .scheduler()
            .endpoints()
            .into_iter()
            .map(|e| EndpointGauge {
                endpoint_id: e.config.id.clone(),
                healthy: e.healthy,
                active_containers: e.active_containers,
                capacity: e.capacity(),
                avg_latency_ms: e.avg_latency_ms,
                consecutive_failures: e.consecutive_failures,
            })
            .collect();
        self.inner.metrics.snapshot(
            PoolGauge {
                idle: stats.idle,
                busy: stats.busy,
                max_total: stats.max_total,
            },
            endpoints,
        )
    }

    /// Replace every secret value held by a live container with `***`.
    pub fn redact(&self, text: &str) -> String {
        let mut values: Vec<SecretValue> = Vec::new();
        {
            let known = self
                .inner
                .known_secrets
                .lock()
                .unwrap_or_else(PoisonError::into_inner);
            for value in known.values().flatten() {
                if !values.contains(value) {
                    values.push(value.clone());
                }
            }
        }
        redact(text, &values)
    }

    /// Stop maintenance, destroy idle containers, and close all tunnels.
    /// Busy containers are destroyed when released.
    pub async fn shutdown(&self) {
        if self.inner.shutting_down.swap(true, Ordering::AcqRel) {
            return;
        }

        let task = self
            .maintenance
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take();
        if let Some(task) = task {
            let _ = task.shutdown_tx.send(true);
            if let Err(e) = task.handle.await {
                warn!(error = %e, "maintenance task ended abnormally");
            }
        }

        let idle: Vec<Container> = {
            let mut st = self.inner.lock_state();
            let drained: Vec<Container> = st.idle.drain(..).collect();
            drained.into_iter().map(|c| st.checkout(c)).collect()
        };
        let destroyed = idle.len();
        for container in idle {
            self.inner.destroy(container).await;
        }

        self.inner.available.notify_waiters();
        self.inner.client.tunnels().close_all().await;

        let busy = self.stats().busy;
        info!(destroyed, busy, "container pool shut down");
    }
}

impl Drop for ContainerPool {
    fn drop(&mut self) {
        let task = self
            .maintenance
            .get_mut()
            .unwrap_or_else(PoisonError::into_inner)
            .take();
        if let Some(task) = task {
            task.handle.abort();
        }
    }
}

impl PoolInner {
    fn lock_state(&self) -> MutexGuard<'_, PoolState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn is_shutting_down(&self) -> bool {
        self.shutting_down.load(Ordering::Acquire)
    }

    fn matches_affinity(&self, container: &Container, affinity: &[AffinityRule]) -> bool {
        if affinity.is_empty() {
            return true;
        }
        self.client
            .scheduler()
            .get_endpoint(container.endpoint_id())
            .is_some_and(|ep| matches_all(affinity, &ep.config.labels))
    }

    fn try_admit(&self, affinity: &[AffinityRule]) -> Admission {
        let mut st = self.lock_state();

        let pos = st
            .idle
            .iter()
            .position(|c| self.matches_affinity(c, affinity));
        if let Some(container) = pos.and_then(|p| st.idle.remove(p)) {
            debug!(container_id = %container.id(), "acquired idle container");
            return Admission::Ready(st.checkout(container));
        }

        if st.total() < self.config.max_total {
            st.creating += 1;
            return Admission::Create;
        }

        if st.idle.is_empty() {
            return Admission::Full;
        }

        let scheduler = self.client.scheduler();
        if let Err(e) = scheduler.select_endpoint(affinity) {
            let may_return = st.busy.values().any(|endpoint_id| {
                scheduler
                    .get_endpoint(endpoint_id)
                    .is_some_and(|ep| matches_all(affinity, &ep.config.labels))
            });
            return if may_return {
                Admission::Full
            } else {
                Admission::Unplaceable(e)
            };
        }

        match st.idle.pop_front() {
            Some(stale) => {
                st.creating += 1;
                Admission::Replace(stale)
            }
            None => Admission::Full,
        }
    }

    async fn acquire(self: &Arc<Self>, affinity: &[AffinityRule]) -> RuntimeResult<Container> {
        let pending = {
            let _turn = self.admission.lock().await;
            loop {
                if self.is_shutting_down() {
                    return Err(RuntimeError::ShutDown);
                }

                let notified = self.available.notified();
                tokio::pin!(notified);
                notified.as_mut().enable();

                match self.try_admit(affinity) {
                    Admission::Ready(container) => return Ok(container),
                    Admission::Create => break self.spawn_creation(affinity),
                    Admission::Replace(stale) => {
                        debug!(container_id = %stale.id(), "replacing idle container that fails affinity");
                        self.destroy_in_background(stale);
                        break self.spawn_creation(affinity);
                    }
                    Admission::Unplaceable(e) => return Err(e.into()),
                    Admission::Full => {
                        debug!(max_total = self.config.max_total, "pool at capacity, waiting");
                        notified.await;
                    }
                }
            }
        };

        pending.await.unwrap_or(Err(RuntimeError::ShutDown))
    }

    /// Create a container in a detached task holding one `creating` slot.
    /// If the receiver is gone by the time it is ready, it is destroyed.
    fn spawn_creation(
        self: &Arc<Self>,
        affinity: &[AffinityRule],
    ) -> oneshot::Receiver<RuntimeResult<Container>> {
        let (tx, rx) = oneshot::channel();
        let inner = Arc::clone(self);
        let affinity = affinity.to_vec();

        tokio::spawn(async move {
            let created = inner.create_container(&affinity).await;
            let result = {
                let mut st = inner.lock_state();
                st.creating = st.creating.saturating_sub(1);
                created.map(|c| st.checkout(c))
            };
            if result.is_err() {
                inner.available.notify_one();
            }
            if let Err(Ok(orphan)) = tx.send(result) {
                debug!(container_id = %orphan.id(), "acquirer gave up, destroying late container");
                inner.destroy(orphan).await;
            }
        });

        rx
    }

    async fn create_container(&self, affinity: &[AffinityRule]) -> RuntimeResult<Container> {
        let scheduler = self.client.scheduler();
        let endpoint = scheduler.reserve_endpoint(affinity)?;
        let endpoint_id = endpoint.config.id;

        match self.provision(&endpoint_id).await {
            Ok((id, secrets)) => {
                if !secrets.is_empty() {
                    self.known_secrets
                        .lock()
                        .unwrap_or_else(PoisonError::into_inner)
                        .insert(id.clone(), secrets);
                }
                self.metrics.record_container_created();
                info!(container_id = %id, endpoint = %endpoint_id, "container created");
                Ok(Container::new(id, endpoint_id))
            }
            Err(e) => {
                scheduler.record_release(&endpoint_id);
                warn!(endpoint = %endpoint_id, error = %e, "container creation failed");
                Err(e)
            }
        }
    }

    /// Create the container and return its id with the secret values it
    /// was given.
    async fn provision(&self, endpoint_id: &str) -> RuntimeResult<(String, Vec<SecretValue>)> {
        let secrets = match &self.secrets {
            Some(injection) if !injection.names.is_empty() => {
                resolve_secrets(injection.provider.as_ref(), &injection.names).await?
            }
            _ => Vec::new(),
        };
        let values: Vec<SecretValue> = secrets.iter().map(|(_, v)| v.clone()).collect();

        let spec = ContainerSpec {
            name: format!("liquid-{}", Uuid::new_v4().simple()),
            image: self.config.image.clone(),
            resources: self.config.resources.clone(),
            network: self.config.network.clone(),
            secrets,
            labels: vec![(ENDPOINT_LABEL.to_string(), endpoint_id.to_string())],
        };
        let id = self.client.create_container(endpoint_id, &spec).await?;
        Ok((id, values))
    }

    async fn release(&self, mut container: Container) {
        if container.is_faulty() {
            debug!(container_id = %container.id(), "destroying faulty container");
            self.destroy(container).await;
            return;
        }

        let rejected = {
            let mut st = self.lock_state();
            if st.busy.remove(container.id()).is_none() {
                warn!(container_id = %container.id(), "release of a container that is not checked out");
                return;
            }
            if self.is_shutting_down() {
                st.busy
                    .insert(container.id().to_string(), container.endpoint_id().to_string());
                Some(container)
            } else {
                container.touch();
                container.set_state(ContainerState::Idle);
                debug!(container_id = %container.id(), "container returned to pool");
                st.idle.push_back(container);
                None
            }
        };

        match rejected {
            Some(container) => self.destroy(container).await,
            None => self.available.notify_one(),
        }
    }

    /// Stop and remove a checked-out container and free its slot.
    ///
    /// A faulty container already cost its endpoint a failure, so a failed
    /// teardown is not counted again.
    async fn destroy(&self, mut container: Container) {
        container.set_state(ContainerState::Terminating);
        let endpoint_id = container.endpoint_id().to_string();
        let result = if container.is_faulty() {
            self.client.discard(&endpoint_id, container.id()).await
        } else {
            self.client.destroy(&endpoint_id, container.id()).await
        };
        if let Err(e) = result {
            warn!(container_id = %container.id(), error = %e, "container teardown failed");
        }
        self.known_secrets
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .remove(container.id());
        self.client.scheduler().record_release(&endpoint_id);
        self.metrics.record_container_destroyed();
        self.lock_state().busy.remove(container.id());
        self.available.notify_one();
        debug!(container_id = %container.id(), endpoint = %endpoint_id, "container destroyed");
    }

    /// Tear down a container that has already left the pool's accounting.
    fn destroy_in_background(self: &Arc<Self>, container: Container) {
        let inner = Arc::clone(self);
        tokio::spawn(async move { inner.destroy(container).await });
    }

    /// Returns how many containers were created and the first error, if any.
    async fn fill_to_min_idle(&self) -> (u32, Option<RuntimeError>) {
        let needed = {
            let mut st = self.lock_state();
            if self.is_shutting_down() {
                0
            } else {
                let warm = st.idle.len() as u32 + st.creating;
                let want = self.config.min_idle.saturating_sub(warm);
                let room = self.config.max_total.saturating_sub(st.total());
                let n = want.min(room);
                st.creating += n;
                n
            }
        };

        let mut created = 0;
        let mut first_error = None;
        for _ in 0..needed {
            let result = self.create_container(&[]).await;
            let late = {
                let mut st = self.lock_state();
                st.creating = st.creating.saturating_sub(1);
                match result {
                    Ok(container) if self.is_shutting_down() => Some(st.checkout(container)),
                    Ok(container) => {
                        st.idle.push_back(container);
                        created += 1;
                        None
                    }
                    Err(e) => {
                        if first_error.is_none() {
                            first_error = Some(e);
                        }
                        None
                    }
                }
            };
            self.available.notify_one();
            if let Some(container) = late {
                self.destroy(container).await;
            }
        }

        (created, first_error)
    }

    /// Ping idle containers in place. Only the ones that fail are taken
    /// out, and only if nobody acquired them in the meantime.
    async fn check_idle_health(&self, report: &mut MaintenanceReport) {
        let snapshot: Vec<(String, String)> = self
            .lock_state()
            .idle
            .iter()
            .map(|c| (c.id().to_string(), c.endpoint_id().to_string()))
            .collect();

        for (container_id, endpoint_id) in snapshot {
            if self.is_shutting_down() {
                return;
            }
            report.checked += 1;
            let healthy = match self.client.ping(&endpoint_id, &container_id).await {
                Ok(true) => true,
                Ok(false) => {
                    self.client.scheduler().record_failure(&endpoint_id);
                    false
                }
                Err(_) => false,
            };
            if healthy {
                continue;
            }

            report.unhealthy += 1;
            warn!(container_id = %container_id, endpoint = %endpoint_id, "idle container failed health check");
            let dead = {
                let mut st = self.lock_state();
                let pos = st.idle.iter().position(|c| c.id() == container_id);
                pos.and_then(|p| st.idle.remove(p)).map(|c| st.checkout(c))
            };
            match dead {
                Some(mut container) => {
                    container.mark_faulty();
                    self.destroy(container).await;
                }
                None => debug!(container_id = %container_id, "container left the idle set during its health check"),
            }
        }
    }

    async fn evict_idle(&self, report: &mut MaintenanceReport) {
        let evicted: Vec<Container> = {
            let mut st = self.lock_state();
            let mut out = Vec::new();
            while st.idle.len() as u32 > self.config.min_idle {
                let expired = st
                    .idle
                    .front()
                    .is_some_and(|c| c.idle_for() > self.config.idle_timeout);
                if !expired {
                    break;
                }
                if let Some(container) = st.idle.pop_front() {
                    out.push(st.checkout(container));
                }
            }
            out
        };

        for container in evicted {
            report.evicted += 1;
            debug!(container_id = %container.id(), "evicting idle container");
            self.destroy(container).await;
        }
    }

    async fn run_maintenance(&self) -> MaintenanceReport {
        let mut report = MaintenanceReport::default();
        if self.is_shutting_down() {
            return report;
        }

        self.check_idle_health(&mut report).await;
        self.evict_idle(&mut report).await;

        let (created, error) = self.fill_to_min_idle().await;
        report.created = created;
        if let Some(e) = error {
            warn!(error = %e, "failed to top up idle containers");
        }

        if report != MaintenanceReport::default() {
            debug!(?report, "pool maintenance pass");
        }
        report
    }

    async fn maintenance_loop(self: Arc<Self>, mut shutdown: watch::Receiver<bool>) {
        let interval = self.config.health_check_interval;
        loop {
            tokio::select! {
                _ = tokio::time::sleep(interval) => {
                    self.run_maintenance().await;
                }
                _ = shutdown.changed() => {
                    debug!("pool maintenance shutting down");
                    break;
                }
            }
        }
    }
}
