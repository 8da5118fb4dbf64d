//! The container backend interface.
//!
//! A [`ContainerRuntime`] drives one kind of daemon (Docker via its CLI in
//! production). Every call names the daemon it targets, so one backend
//! instance serves the local socket, direct TCP endpoints, and tunnels.

use std::fmt;

use async_trait::async_trait;

use liquid_core::{NetworkPolicy, ResourceLimits};
use liquid_secrets::SecretValue;

use crate::error::BackendResult;

/// Label set on every container this subsystem creates.
pub const MANAGED_LABEL: &str = "liquid.managed";

/// Where a daemon listens.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum DaemonAddress {
    /// The default local socket.
    Local,
    Tcp { host: String, port: u16 },
}

impl DaemonAddress {
    pub fn tcp(host: impl Into<String>, port: u16) -> Self {
        Self::Tcp {
            host: host.into(),
            port,
        }
    }

    /// Value for `docker -H`, or `None` for the default socket.
    pub fn docker_host(&self) -> Option<String> {
        match self {
            Self::Local => None,
            Self::Tcp { host, port } => Some(format!("tcp://{host}:{port}")),
        }
    }
}

impl fmt::Display for DaemonAddress {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Local => f.write_str("local"),
            Self::Tcp { host, port } => write!(f, "tcp://{host}:{port}"),
        }
    }
}

/// Everything needed to create one pooled container.
#[derive(Debug, Clone)]
pub struct ContainerSpec {
    pub name: String,
    pub image: String,
    pub resources: ResourceLimits,
    pub network: NetworkPolicy,
    /// Injected secrets, keyed by environment variable name.
    pub secrets: Vec<(String, SecretValue)>,
    pub labels: Vec<(String, String)>,
}

/// One command run inside a running container.
#[derive(Debug, Clone, Default)]
pub struct ExecRequest {
    pub command: Vec<String>,
    pub stdin: Option<Vec<u8>>,
    pub env: Vec<(String, String)>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ExecOutput {
    pub exit_code: i32,
    pub stdout: String,
    pub stderr: String,
}

/// Container lifecycle operations against a daemon.
///
/// Errors mean the daemon could not be driven. A command that ran and
/// exited non-zero is a successful [`ContainerRuntime::exec`].
#[async_trait]
pub trait ContainerRuntime: Send + Sync {
    /// Create a container and return its id. It is not started.
    async fn create(&self, daemon: &DaemonAddress, spec: &ContainerSpec) -> BackendResult<String>;

    async fn start(&self, daemon: &DaemonAddress, container_id: &str) -> BackendResult<()>;

    async fn exec(
        &self,
        daemon: &DaemonAddress,
        container_id: &str,
        request: &ExecRequest,
    ) -> BackendResult<ExecOutput>;

    async fn stop(&self, daemon: &DaemonAddress, container_id: &str) -> BackendResult<()>;

    async fn remove(&self, daemon: &DaemonAddress, container_id: &str) -> BackendResult<()>;

    /// Whether the container is running.
    async fn ping(&self, daemon: &DaemonAddress, container_id: &str) -> BackendResult<bool>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn docker_host_values() {
        assert_eq!(DaemonAddress::Local.docker_host(), None);
        assert_eq!(
            DaemonAddress::tcp("10.0.0.5", 2376).docker_host().as_deref(),
            Some("tcp://10.0.0.5:2376")
        );
        assert_eq!(DaemonAddress::tcp("127.0.0.1", 40123).to_string(), "tcp://127.0.0.1:40123");
    }
}
