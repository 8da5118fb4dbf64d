//! Endpoint-aware container client.
//!
//! Resolves an endpoint id to a daemon address (local socket, direct TCP,
//! or SSH tunnel) and forwards the call to the backend. Any backend or
//! tunnel failure is recorded against the endpoint before it is returned.

use std::sync::Arc;

use tracing::{debug, warn};

use liquid_scheduler::{Scheduler, SchedulerError};

use crate::backend::{ContainerRuntime, ContainerSpec, DaemonAddress, ExecOutput, ExecRequest};
use crate::error::{BackendResult, RuntimeError, RuntimeResult, TunnelError};
use crate::tunnel::TunnelManager;

#[derive(Clone)]
pub struct ContainerClient {
    runtime: Arc<dyn ContainerRuntime>,
    scheduler: Arc<Scheduler>,
    tunnels: Arc<TunnelManager>,
}

impl ContainerClient {
    pub fn new(
        runtime: Arc<dyn ContainerRuntime>,
        scheduler: Arc<Scheduler>,
        tunnels: Arc<TunnelManager>,
    ) -> Self {
        Self {
            runtime,
            scheduler,
            tunnels,
        }
    }

    pub fn scheduler(&self) -> &Arc<Scheduler> {
        &self.scheduler
    }

    pub fn tunnels(&self) -> &Arc<TunnelManager> {
        &self.tunnels
    }

    /// Daemon address for an endpoint, opening a tunnel if it needs one.
    pub async fn resolve(&self, endpoint_id: &str) -> RuntimeResult<DaemonAddress> {
        self.locate(endpoint_id, true).await
    }

    async fn locate(&self, endpoint_id: &str, report: bool) -> RuntimeResult<DaemonAddress> {
        let endpoint = self
            .scheduler
            .get_endpoint(endpoint_id)
            .ok_or_else(|| SchedulerError::UnknownEndpoint(endpoint_id.to_string()))?;

        if endpoint.is_local {
            return Ok(DaemonAddress::Local);
        }

        if endpoint.config.ssh.is_some() {
            return match self.tunnels.acquire(&endpoint.config).await {
                Ok(tunnel) => Ok(tunnel.address()),
                Err(e) => {
                    warn!(endpoint = %endpoint_id, error = %e, "tunnel unavailable");
                    if report {
                        self.scheduler.record_failure(endpoint_id);
                    }
                    Err(e.into())
                }
            };
        }

        match endpoint.config.address() {
            Some((host, port)) => Ok(DaemonAddress::tcp(host, port)),
            None => {
                if report {
                    self.scheduler.record_failure(endpoint_id);
                }
                Err(TunnelError::InvalidUrl {
                    endpoint_id: endpoint_id.to_string(),
                    url: endpoint.config.url.clone(),
                }
                .into())
            }
        }
    }

    fn check<T>(&self, endpoint_id: &str, result: BackendResult<T>) -> RuntimeResult<T> {
        result.map_err(|source| {
            warn!(endpoint = %endpoint_id, error = %source, "container backend failure");
            self.scheduler.record_failure(endpoint_id);
            RuntimeError::Backend {
                endpoint_id: endpoint_id.to_string(),
                source,
            }
        })
    }

    /// Create and start a container. A container that fails to start is
    /// removed again.
    pub async fn create_container(
        &self,
        endpoint_id: &str,
        spec: &ContainerSpec,
    ) -> RuntimeResult<String> {
        let daemon = self.resolve(endpoint_id).await?;
        let id = self.check(endpoint_id, self.runtime.create(&daemon, spec).await)?;

        if let Err(e) = self.runtime.start(&daemon, &id).await {
            if let Err(cleanup) = self.runtime.remove(&daemon, &id).await {
                debug!(container_id = %id, error = %cleanup, "cleanup after failed start");
            }
            return self.check(endpoint_id, Err(e));
        }

        debug!(endpoint = %endpoint_id, container_id = %id, name = %spec.name, "container started");
        Ok(id)
    }

    pub async fn exec(
        &self,
        endpoint_id: &str,
        container_id: &str,
        request: &ExecRequest,
    ) -> RuntimeResult<ExecOutput> {
        let daemon = self.resolve(endpoint_id).await?;
        let result = self.runtime.exec(&daemon, container_id, request).await;
        self.check(endpoint_id, result)
    }

    /// Stop then remove. Removal is forced, so a failed stop is only logged.
    pub async fn destroy(&self, endpoint_id: &str, container_id: &str) -> RuntimeResult<()> {
        let daemon = self.resolve(endpoint_id).await?;
        let result = self.teardown(&daemon, container_id).await;
        self.check(endpoint_id, result)
    }

    /// Like [`destroy`](Self::destroy), for a container whose failure was
    /// already recorded. Errors are returned without a second strike
    /// against the endpoint.
    pub async fn discard(&self, endpoint_id: &str, container_id: &str) -> RuntimeResult<()> {
        let daemon = self.locate(endpoint_id, false).await?;
        self.teardown(&daemon, container_id)
            .await
            .map_err(|source| RuntimeError::Backend {
                endpoint_id: endpoint_id.to_string(),
                source,
            })
    }

    async fn teardown(&self, daemon: &DaemonAddress, container_id: &str) -> BackendResult<()> {
        if let Err(e) = self.runtime.stop(daemon, container_id).await {
            debug!(container_id, error = %e, "stop failed, forcing removal");
        }
        self.runtime.remove(daemon, container_id).await
    }

    pub async fn ping(&self, endpoint_id: &str, container_id: &str) -> RuntimeResult<bool> {
        let daemon = self.resolve(endpoint_id).await?;
        let result = self.runtime.ping(&daemon, container_id).await;
        self.check(endpoint_id, result)
    }
}
