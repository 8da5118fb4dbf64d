//! Runtime error types.

use std::time::Duration;

use thiserror::Error;

use liquid_scheduler::SchedulerError;
use liquid_secrets::SecretsError;

/// Failure talking to a Docker daemon. Counts against the endpoint's
/// health, once per failed operation.
#[derive(Debug, Error)]
pub enum BackendError {
    #[error("failed to run {program}: {message}")]
    Spawn { program: String, message: String },

    #[error("docker {operation} failed (exit {code:?}): {stderr}")]
    Command {
        operation: &'static str,
        code: Option<i32>,
        stderr: String,
    },

    #[error("daemon unreachable: {0}")]
    Unreachable(String),
}

pub type BackendResult<T> = Result<T, BackendError>;

#[derive(Debug, Error)]
pub enum TunnelError {
    #[error("endpoint {0} has no ssh configuration")]
    NotConfigured(String),

    #[error("endpoint {endpoint_id} has an invalid url: {url}")]
    InvalidUrl { endpoint_id: String, url: String },

    #[error("failed to start ssh for {endpoint_id}: {message}")]
    Spawn { endpoint_id: String, message: String },

    #[error("ssh for {endpoint_id} exited before the tunnel was ready ({status})")]
    Exited { endpoint_id: String, status: String },

    #[error("tunnel for {endpoint_id} not ready after {timeout:?}")]
    NotReady {
        endpoint_id: String,
        timeout: Duration,
    },
}

#[derive(Debug, Error)]
pub enum RuntimeError {
    #[error("container pool exhausted ({max_total} containers in use)")]
    PoolExhausted { max_total: u32 },

    #[error("{}", timeout_message(.container_id, .timeout))]
    ContainerTimeout {
        container_id: Option<String>,
        timeout: Duration,
    },

    #[error("execution in container {container_id} failed: {message}")]
    ContainerExecution {
        container_id: String,
        exit_code: Option<i32>,
        message: String,
    },

    #[error(transparent)]
    Scheduler(#[from] SchedulerError),

    #[error("secret resolution failed: {0}")]
    Secret(#[from] SecretsError),

    #[error("endpoint {endpoint_id}: {source}")]
    Backend {
        endpoint_id: String,
        source: BackendError,
    },

    #[error("endpoint tunnel: {0}")]
    Tunnel(#[from] TunnelError),

    #[error("container pool is shut down")]
    ShutDown,
}

fn timeout_message(container_id: &Option<String>, timeout: &Duration) -> String {
    match container_id {
        Some(id) => format!("container {id} exceeded execution time limit of {timeout:?}"),
        None => format!("timed out after {timeout:?} waiting for a container"),
    }
}

impl RuntimeError {
    /// Acquisition timed out before any container was assigned.
    pub fn is_acquire_timeout(&self) -> bool {
        matches!(self, Self::ContainerTimeout { container_id: None, .. })
    }

    /// No endpoint could take a new container.
    pub fn is_endpoint_unavailable(&self) -> bool {
        matches!(self, Self::Scheduler(SchedulerError::EndpointUnavailable(_)))
    }

    /// Exit code of a workload that ran and failed.
    pub fn exit_code(&self) -> Option<i32> {
        match self {
            Self::ContainerExecution { exit_code, .. } => *exit_code,
            _ => None,
        }
    }
}

pub type RuntimeResult<T> = Result<T, RuntimeError>;
