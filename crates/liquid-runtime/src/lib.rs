//! liquid-runtime: container lifecycle for the Liquid subsystem.
//!
//! - **`backend`**: the [`ContainerRuntime`] trait and daemon addressing
//! - **`docker`**: [`DockerCli`], the backend that shells out to `docker`
//! - **`tunnel`**: SSH port-forwards to remote daemons, one per endpoint
//! - **`client`**: endpoint-aware calls that report failures to the scheduler
//! - **`pool`**: the warm [`ContainerPool`] and its maintenance task
//! - **`executor`**: runs a [`Workload`] with a time limit and releases
//!   the container
//!
//! ```text
//! Executor ──► ContainerPool ──► ContainerClient ──► ContainerRuntime
//!                   │                  ├── Scheduler (placement, health)
//!                   └── Metrics        └── TunnelManager (ssh -L)
//! ```

pub mod backend;
pub mod client;
pub mod container;
pub mod docker;
pub mod error;
pub mod executor;
pub mod pool;
pub mod subsystem;
pub mod tunnel;

pub use backend::{ContainerRuntime, ContainerSpec, DaemonAddress, ExecOutput, ExecRequest, MANAGED_LABEL};
pub use client::ContainerClient;
pub use container::{Container, ContainerState};
pub use docker::DockerCli;
pub use error::{BackendError, BackendResult, RuntimeError, RuntimeResult, TunnelError};
pub use executor::{
    ExecutionCallback, ExecutionEvent, ExecutionOutcome, ExecutionStatus, Executor, Workload,
};
pub use pool::{ContainerPool, ENDPOINT_LABEL, MaintenanceReport, PoolStats, SecretInjection};
pub use subsystem::Subsystem;
pub use tunnel::{SshTunnelOpener, Tunnel, TunnelManager, TunnelOpener};
