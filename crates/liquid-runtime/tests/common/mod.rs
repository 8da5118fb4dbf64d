//! In-memory container backend and tunnel opener for runtime tests.
//!
//! `FakeRuntime::exec` understands a handful of commands:
//! `echo ARGS..`, `exit N`, `sleep MS`, `cat` (echo stdin), `env NAME`.

#![allow(dead_code)]

use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicBool, AtomicU16, AtomicU32, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;

use liquid_core::{Config, PlacementKind, PoolConfig, RemoteEndpointConfig, SshConfig, default_config};
use liquid_runtime::{
    BackendError, BackendResult, ContainerRuntime, ContainerSpec, DaemonAddress, ExecOutput,
    ExecRequest, Subsystem, Tunnel, TunnelError, TunnelOpener,
};

#[derive(Debug, Clone)]
pub struct FakeContainer {
    pub daemon: DaemonAddress,
    pub env: HashMap<String, String>,
    pub labels: Vec<(String, String)>,
    pub running: bool,
}

#[derive(Default)]
pub struct FakeRuntime {
    next_id: AtomicU32,
    containers: Mutex<HashMap<String, FakeContainer>>,
    removed: Mutex<Vec<String>>,
    unreachable: AtomicBool,
    fail_creates: AtomicBool,
    ping_delay: Mutex<Duration>,
}

impl FakeRuntime {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// Every call fails as if the daemon were down.
    pub fn set_unreachable(&self, down: bool) {
        self.unreachable.store(down, Ordering::SeqCst);
    }

    /// Make every health check take this long.
    pub fn set_ping_delay(&self, delay: Duration) {
        *self.ping_delay.lock().unwrap() = delay;
    }

    pub fn set_fail_creates(&self, fail: bool) {
        self.fail_creates.store(fail, Ordering::SeqCst);
    }

    /// Simulate a container dying behind the pool's back.
    pub fn kill(&self, id: &str) {
        if let Some(c) = self.containers.lock().unwrap().get_mut(id) {
            c.running = false;
        }
    }

    pub fn created_count(&self) -> u32 {
        self.next_id.load(Ordering::SeqCst)
    }

    pub fn live_count(&self) -> usize {
        self.containers.lock().unwrap().len()
    }

    pub fn removed(&self) -> Vec<String> {
        self.removed.lock().unwrap().clone()
    }

    pub fn container(&self, id: &str) -> Option<FakeContainer> {
        self.containers.lock().unwrap().get(id).cloned()
    }

    fn check_reachable(&self, daemon: &DaemonAddress) -> BackendResult<()> {
        if self.unreachable.load(Ordering::SeqCst) {
            return Err(BackendError::Unreachable(daemon.to_string()));
        }
        Ok(())
    }

    fn missing(operation: &'static str, id: &str) -> BackendError {
        BackendError::Command {
            operation,
            code: Some(1),
            stderr: format!("No such container: {id}"),
        }
    }
}

#[async_trait]
impl ContainerRuntime for FakeRuntime {
    async fn create(&self, daemon: &DaemonAddress, spec: &ContainerSpec) -> BackendResult<String> {
        self.check_reachable(daemon)?;
        if self.fail_creates.load(Ordering::SeqCst) {
            return Err(BackendError::Command {
                operation: "create",
                code: Some(125),
                stderr: "image not found".to_string(),
            });
        }
        let n = self.next_id.fetch_add(1, Ordering::SeqCst) + 1;
        let id = format!("fake-{n}");
        let env = spec
            .secrets
            .iter()
            .map(|(k, v)| (k.clone(), v.expose().to_string()))
            .collect();
        self.containers.lock().unwrap().insert(
            id.clone(),
            FakeContainer {
                daemon: daemon.clone(),
                env,
                labels: spec.labels.clone(),
                running: false,
            },
        );
        Ok(id)
    }

    async fn start(&self, daemon: &DaemonAddress, container_id: &str) -> BackendResult<()> {
        self.check_reachable(daemon)?;
        let mut containers = self.containers.lock().unwrap();
        let c = containers
            .get_mut(container_id)
            .ok_or_else(|| Self::missing("start", container_id))?;
        c.running = true;
        Ok(())
    }

    async fn exec(
        &self,
        daemon: &DaemonAddress,
        container_id: &str,
        request: &ExecRequest,
    ) -> BackendResult<ExecOutput> {
        self.check_reachable(daemon)?;
        let env = self
            .container(container_id)
            .ok_or_else(|| Self::missing("exec", container_id))?
            .env;

        let ok = |stdout: String| ExecOutput {
            exit_code: 0,
            stdout,
            stderr: String::new(),
        };
        let args: Vec<&str> = request.command.iter().map(String::as_str).collect();
        let output = match args.as_slice() {
            ["echo", rest @ ..] => ok(format!("{}\n", rest.join(" "))),
            ["exit", code] => ExecOutput {
                exit_code: code.parse().unwrap_or(1),
                stdout: String::new(),
                stderr: "boom\n".to_string(),
            },
            ["sleep", ms] => {
                tokio::time::sleep(Duration::from_millis(ms.parse().unwrap_or(0))).await;
                ok(String::new())
            }
            ["cat"] => ok(String::from_utf8_lossy(request.stdin.as_deref().unwrap_or_default()).into_owned()),
            ["env", name] => ok(env.get(*name).cloned().unwrap_or_default()),
            _ => ExecOutput {
                exit_code: 127,
                stdout: String::new(),
                stderr: "command not found\n".to_string(),
            },
        };
        Ok(output)
    }

    async fn stop(&self, daemon: &DaemonAddress, container_id: &str) -> BackendResult<()> {
        self.check_reachable(daemon)?;
        if let Some(c) = self.containers.lock().unwrap().get_mut(container_id) {
            c.running = false;
        }
        Ok(())
    }

    async fn remove(&self, daemon: &DaemonAddress, container_id: &str) -> BackendResult<()> {
        self.check_reachable(daemon)?;
        self.containers.lock().unwrap().remove(container_id);
        self.removed.lock().unwrap().push(container_id.to_string());
        Ok(())
    }

    async fn ping(&self, daemon: &DaemonAddress, container_id: &str) -> BackendResult<bool> {
        let delay = *self.ping_delay.lock().unwrap();
        if !delay.is_zero() {
            tokio::time::sleep(delay).await;
        }
        self.check_reachable(daemon)?;
        Ok(self
            .container(container_id)
            .is_some_and(|c| c.running))
    }
}

/// Opener that hands out detached tunnels on increasing local ports.
#[derive(Default)]
pub struct FakeOpener {
    opens: AtomicU32,
    next_port: AtomicU16,
    failing: Mutex<HashSet<String>>,
}

impl FakeOpener {
    pub fn new() -> Arc<Self> {
        Arc::new(Self {
            next_port: AtomicU16::new(40_000),
            ..Default::default()
        })
    }

    pub fn opens(&self) -> u32 {
        self.opens.load(Ordering::SeqCst)
    }

    pub fn fail_for(&self, endpoint_id: &str) {
        self.failing.lock().unwrap().insert(endpoint_id.to_string());
    }
}

#[async_trait]
impl TunnelOpener for FakeOpener {
    async fn open(
        &self,
        endpoint_id: &str,
        _remote_host: &str,
        _remote_port: u16,
        _ssh: &SshConfig,
    ) -> Result<Tunnel, TunnelError> {
        if self.failing.lock().unwrap().contains(endpoint_id) {
            return Err(TunnelError::Spawn {
                endpoint_id: endpoint_id.to_string(),
                message: "connection refused".to_string(),
            });
        }
        self.opens.fetch_add(1, Ordering::SeqCst);
        let port = self.next_port.fetch_add(1, Ordering::SeqCst);
        Ok(Tunnel::detached(endpoint_id, port))
    }
}

/// Small local-only pool with short timers.
pub fn pool_config(min_idle: u32, max_total: u32) -> PoolConfig {
    let mut pool = default_config().pool;
    pool.min_idle = min_idle;
    pool.max_total = max_total;
    pool.acquire_timeout = Duration::from_millis(200);
    pool.idle_timeout = Duration::from_secs(60);
    pool.health_check_interval = Duration::from_secs(3600);
    pool.resources.max_execution_time = Duration::from_millis(500);
    pool
}

pub fn config(min_idle: u32, max_total: u32) -> Config {
    Config {
        pool: pool_config(min_idle, max_total),
        ..default_config()
    }
}

/// Remote-only placement on one SSH-tunneled endpoint.
pub fn ssh_config(max_total: u32) -> Config {
    let mut config = config(0, max_total);
    config.pool.placement.kind = PlacementKind::Remote;
    config.pool.placement.remote_endpoints = vec![
        RemoteEndpointConfig::new("build-1", "tcp://build-1.internal:2375")
            .with_max_containers(max_total)
            .with_ssh(SshConfig {
                user: "deploy".to_string(),
                port: 22,
                identity_file: None,
            }),
    ];
    config
}

pub fn build(config: &Config, runtime: &Arc<FakeRuntime>, opener: &Arc<FakeOpener>) -> Subsystem {
    Subsystem::build(config, runtime.clone(), opener.clone()).unwrap()
}
