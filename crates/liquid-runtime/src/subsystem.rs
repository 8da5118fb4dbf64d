//! Wiring for a complete container subsystem.

use std::sync::Arc;

use tracing::info;

use liquid_core::Config;
use liquid_metrics::{Metrics, initialize_metrics};
use liquid_scheduler::Scheduler;
use liquid_secrets::create_secrets_provider;

use crate::backend::ContainerRuntime;
use crate::client::ContainerClient;
use crate::docker::DockerCli;
use crate::error::RuntimeResult;
use crate::executor::Executor;
use crate::pool::{ContainerPool, SecretInjection};
use crate::tunnel::{SshTunnelOpener, TunnelManager, TunnelOpener};

/// Scheduler, tunnels, pool, and executor built from one [`Config`].
pub struct Subsystem {
    pub scheduler: Arc<Scheduler>,
    pub tunnels: Arc<TunnelManager>,
    pub pool: Arc<ContainerPool>,
    pub executor: Executor,
    pub metrics: Arc<Metrics>,
}

impl Subsystem {
    /// Build against the `docker` CLI and system `ssh`.
    pub fn docker(config: &Config) -> RuntimeResult<Self> {
        Self::build(
            config,
            Arc::new(DockerCli::new()),
            Arc::new(SshTunnelOpener::default()),
        )
    }

    /// The secrets provider is only constructed when `secrets.inject`
    /// names something.
    pub fn build(
        config: &Config,
        runtime: Arc<dyn ContainerRuntime>,
        opener: Arc<dyn TunnelOpener>,
    ) -> RuntimeResult<Self> {
        let scheduler = Arc::new(Scheduler::new(&config.pool));
        let tunnels = Arc::new(TunnelManager::new(opener));
        let metrics = initialize_metrics();

        let secrets = if config.secrets.inject.is_empty() {
            None
        } else {
            let provider = create_secrets_provider(&config.secrets)?;
            info!(
                backend = provider.backend(),
                count = config.secrets.inject.len(),
                "secret injection enabled"
            );
            Some(SecretInjection {
                provider,
                names: config.secrets.inject.clone(),
            })
        };

        let client = ContainerClient::new(runtime, Arc::clone(&scheduler), Arc::clone(&tunnels));
        let pool = Arc::new(ContainerPool::new(
            config.pool.clone(),
            client,
            Arc::clone(&metrics),
            secrets,
        ));
        let executor = Executor::new(Arc::clone(&pool));

        info!(
            placement = ?config.pool.placement.kind,
            endpoints = scheduler.endpoints().len(),
            min_idle = config.pool.min_idle,
            max_total = config.pool.max_total,
            image = %config.pool.image,
            "container subsystem ready"
        );

        Ok(Self {
            scheduler,
            tunnels,
            pool,
            executor,
            metrics,
        })
    }
}
