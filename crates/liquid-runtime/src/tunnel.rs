//! SSH port-forwards to remote Docker daemons.
//!
//! One tunnel per endpoint, opened on first use and shared afterwards.
//! A tunnel whose ssh process has exited is reopened on the next
//! acquire. The ssh child is `kill_on_drop`, so dropping the last
//! handle tears the forward down even without an explicit close.

use std::collections::HashMap;
use std::process::Stdio;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use std::time::{Duration, Instant};

use async_trait::async_trait;
use tokio::net::{TcpListener, TcpStream};
use tokio::process::{Child, Command};
use tracing::{debug, info, warn};

use liquid_core::{RemoteEndpointConfig, SshConfig};

use crate::backend::DaemonAddress;
use crate::error::TunnelError;

const LOOPBACK: &str = "127.0.0.1";
const READY_POLL_INTERVAL: Duration = Duration::from_millis(100);

/// A live local port forwarded to a remote daemon.
#[derive(Debug)]
pub struct Tunnel {
    endpoint_id: String,
    local_port: u16,
    child: Mutex<Option<Child>>,
    closed: AtomicBool,
}

impl Tunnel {
    /// Tunnel backed by an ssh process.
    pub fn with_process(endpoint_id: impl Into<String>, local_port: u16, child: Child) -> Self {
        Self {
            endpoint_id: endpoint_id.into(),
            local_port,
            child: Mutex::new(Some(child)),
            closed: AtomicBool::new(false),
        }
    }

    /// Tunnel for a forward managed outside this process.
    pub fn detached(endpoint_id: impl Into<String>, local_port: u16) -> Self {
        Self {
            endpoint_id: endpoint_id.into(),
            local_port,
            child: Mutex::new(None),
            closed: AtomicBool::new(false),
        }
    }

    pub fn endpoint_id(&self) -> &str {
        &self.endpoint_id
    }

    pub fn local_port(&self) -> u16 {
        self.local_port
    }

    /// Daemon address reachable through this tunnel.
    pub fn address(&self) -> DaemonAddress {
        DaemonAddress::tcp(LOOPBACK, self.local_port)
    }

    /// Not closed, and the ssh process (if any) is still running.
    pub fn is_alive(&self) -> bool {
        if self.closed.load(Ordering::Acquire) {
            return false;
        }
        let mut child = self.child.lock().unwrap_or_else(PoisonError::into_inner);
        match child.as_mut() {
            Some(c) => matches!(c.try_wait(), Ok(None)),
            None => true,
        }
    }

    /// Kill the forward. Idempotent.
    pub fn close(&self) {
        if self.closed.swap(true, Ordering::AcqRel) {
            return;
        }
        let child = self
            .child
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take();
        if let Some(mut child) = child {
            if let Err(e) = child.start_kill() {
                debug!(endpoint = %self.endpoint_id, error = %e, "ssh already exited");
            }
        }
        debug!(endpoint = %self.endpoint_id, port = self.local_port, "tunnel closed");
    }
}

/// Opens a forward from a local port to `remote_host:remote_port`.
#[async_trait]
pub trait TunnelOpener: Send + Sync {
    async fn open(
        &self,
        endpoint_id: &str,
        remote_host: &str,
        remote_port: u16,
        ssh: &SshConfig,
    ) -> Result<Tunnel, TunnelError>;
}

/// Production opener: `ssh -N -L 127.0.0.1:<local>:127.0.0.1:<remote>`.
#[derive(Debug, Clone)]
pub struct SshTunnelOpener {
    binary: String,
    ready_timeout: Duration,
}

impl Default for SshTunnelOpener {
    fn default() -> Self {
        Self {
            binary: "ssh".to_string(),
            ready_timeout: Duration::from_secs(10),
        }
    }
}

impl SshTunnelOpener {
    pub fn with_ready_timeout(mut self, timeout: Duration) -> Self {
        self.ready_timeout = timeout;
        self
    }

    pub fn with_binary(mut self, binary: impl Into<String>) -> Self {
        self.binary = binary.into();
        self
    }

    /// Arguments passed to ssh for one forward.
    pub fn ssh_args(local_port: u16, remote_host: &str, remote_port: u16, ssh: &SshConfig) -> Vec<String> {
        let mut args = vec![
            "-N".to_string(),
            "-o".to_string(),
            "ExitOnForwardFailure=yes".to_string(),
            "-o".to_string(),
            "BatchMode=yes".to_string(),
            "-L".to_string(),
            format!("{LOOPBACK}:{local_port}:{LOOPBACK}:{remote_port}"),
            "-p".to_string(),
            ssh.port.to_string(),
        ];
        if let Some(identity) = &ssh.identity_file {
            args.extend(["-i".to_string(), identity.display().to_string()]);
        }
        args.push(format!("{}@{}", ssh.user, remote_host));
        args
    }
}

async fn free_local_port() -> std::io::Result<u16> {
    let listener = TcpListener::bind((LOOPBACK, 0)).await?;
    Ok(listener.local_addr()?.port())
}

#[async_trait]
impl TunnelOpener for SshTunnelOpener {
    async fn open(
        &self,
        endpoint_id: &str,
        remote_host: &str,
        remote_port: u16,
        ssh: &SshConfig,
    ) -> Result<Tunnel, TunnelError> {
        let spawn_err = |e: std::io::Error| TunnelError::Spawn {
            endpoint_id: endpoint_id.to_string(),
            message: e.to_string(),
        };

        let local_port = free_local_port().await.map_err(spawn_err)?;
        let args = Self::ssh_args(local_port, remote_host, remote_port, ssh);
        debug!(endpoint = %endpoint_id, command = %args.join(" "), "starting ssh tunnel");

        let mut child = Command::new(&self.binary)
            .args(&args)
            .stdin(Stdio::null())
            .stdout(Stdio::null())
            .stderr(Stdio::null())
            .kill_on_drop(true)
            .spawn()
            .map_err(spawn_err)?;

        let deadline = Instant::now() + self.ready_timeout;
        loop {
            if let Ok(Some(status)) = child.try_wait() {
                return Err(TunnelError::Exited {
                    endpoint_id: endpoint_id.to_string(),
                    status: status.to_string(),
                });
            }
            if TcpStream::connect((LOOPBACK, local_port)).await.is_ok() {
                break;
            }
            if Instant::now() >= deadline {
                return Err(TunnelError::NotReady {
                    endpoint_id: endpoint_id.to_string(),
                    timeout: self.ready_timeout,
                });
            }
            tokio::time::sleep(READY_POLL_INTERVAL).await;
        }

        info!(endpoint = %endpoint_id, local_port, remote = %remote_host, "ssh tunnel ready");
        Ok(Tunnel::with_process(endpoint_id, local_port, child))
    }
}

type TunnelSlot = Arc<tokio::sync::Mutex<Option<Arc<Tunnel>>>>;

/// Shares one tunnel per endpoint.
///
/// Each endpoint has its own slot, so a slow handshake only holds up
/// callers of that endpoint.
pub struct TunnelManager {
    opener: Arc<dyn TunnelOpener>,
    slots: Mutex<HashMap<String, TunnelSlot>>,
}

impl TunnelManager {
    pub fn new(opener: Arc<dyn TunnelOpener>) -> Self {
        Self {
            opener,
            slots: Mutex::new(HashMap::new()),
        }
    }

    fn slot(&self, endpoint_id: &str) -> TunnelSlot {
        let mut slots = self.slots.lock().unwrap_or_else(PoisonError::into_inner);
        Arc::clone(slots.entry(endpoint_id.to_string()).or_default())
    }

    fn snapshot(&self) -> Vec<TunnelSlot> {
        self.slots
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .values()
            .cloned()
            .collect()
    }

    /// Tunnel for `endpoint`, opening or reopening it as needed.
    pub async fn acquire(&self, endpoint: &RemoteEndpointConfig) -> Result<Arc<Tunnel>, TunnelError> {
        let ssh = endpoint
            .ssh
            .as_ref()
            .ok_or_else(|| TunnelError::NotConfigured(endpoint.id.clone()))?;
        let (host, port) = endpoint.address().ok_or_else(|| TunnelError::InvalidUrl {
            endpoint_id: endpoint.id.clone(),
            url: endpoint.url.clone(),
        })?;

        let slot = self.slot(&endpoint.id);
        let mut current = slot.lock().await;
        if let Some(existing) = current.as_ref() {
            if existing.is_alive() {
                return Ok(Arc::clone(existing));
            }
            warn!(endpoint = %endpoint.id, "tunnel died, reopening");
            existing.close();
            *current = None;
        }

        let tunnel = Arc::new(self.opener.open(&endpoint.id, &host, port, ssh).await?);
        *current = Some(Arc::clone(&tunnel));
        Ok(tunnel)
    }

    /// Close one endpoint's tunnel. Returns whether one was open.
    pub async fn close(&self, endpoint_id: &str) -> bool {
        let slot = self
            .slots
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .remove(endpoint_id);
        let Some(slot) = slot else {
            return false;
        };
        let tunnel = slot.lock().await.take();
        match tunnel {
            Some(tunnel) => {
                tunnel.close();
                true
            }
            None => false,
        }
    }

    pub async fn close_all(&self) {
        let slots: Vec<TunnelSlot> = self
            .slots
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .drain()
            .map(|(_, slot)| slot)
            .collect();
        let mut count = 0usize;
        for slot in slots {
            if let Some(tunnel) = slot.lock().await.take() {
                tunnel.close();
                count += 1;
            }
        }
        if count > 0 {
            info!(count, "all tunnels closed");
        }
    }

    pub async fn open_count(&self) -> usize {
        let mut count = 0;
        for slot in self.snapshot() {
            if slot.lock().await.is_some() {
                count += 1;
            }
        }
        count
    }
}

#[cfg(test)]
mod tests {
    use std::path::PathBuf;
    use std::sync::atomic::AtomicU32;

    use super::*;

    #[derive(Default)]
    struct CountingOpener {
        opens: AtomicU32,
    }

    #[async_trait]
    impl TunnelOpener for CountingOpener {
        async fn open(
            &self,
            endpoint_id: &str,
            _remote_host: &str,
            remote_port: u16,
            _ssh: &SshConfig,
        ) -> Result<Tunnel, TunnelError> {
            self.opens.fetch_add(1, Ordering::SeqCst);
            Ok(Tunnel::detached(endpoint_id, remote_port + 10_000))
        }
    }

    /// Never finishes opening "stuck"; everything else opens at once.
    struct StuckOpener;

    #[async_trait]
    impl TunnelOpener for StuckOpener {
        async fn open(
            &self,
            endpoint_id: &str,
            _remote_host: &str,
            remote_port: u16,
            _ssh: &SshConfig,
        ) -> Result<Tunnel, TunnelError> {
            if endpoint_id == "stuck" {
                std::future::pending::<()>().await;
            }
            Ok(Tunnel::detached(endpoint_id, remote_port + 10_000))
        }
    }

    fn ssh_endpoint(id: &str) -> RemoteEndpointConfig {
        RemoteEndpointConfig::new(id, "tcp://build-1.internal:2375").with_ssh(SshConfig {
            user: "deploy".to_string(),
            port: 2222,
            identity_file: Some(PathBuf::from("/keys/id_ed25519")),
        })
    }

    #[test]
    fn ssh_args_forward_loopback() {
        let ep = ssh_endpoint("r1");
        let ssh = ep.ssh.as_ref().unwrap();
        let args = SshTunnelOpener::ssh_args(40000, "build-1.internal", 2375, ssh);
        assert!(args.contains(&"-N".to_string()));
        assert!(args.contains(&"127.0.0.1:40000:127.0.0.1:2375".to_string()));
        assert!(args.windows(2).any(|w| w[0] == "-p" && w[1] == "2222"));
        assert!(args.windows(2).any(|w| w[0] == "-i" && w[1] == "/keys/id_ed25519"));
        assert_eq!(args.last().unwrap(), "deploy@build-1.internal");
    }

    #[tokio::test]
    async fn tunnels_are_reused_per_endpoint() {
        let opener = Arc::new(CountingOpener::default());
        let manager = TunnelManager::new(opener.clone());

        let a = manager.acquire(&ssh_endpoint("r1")).await.unwrap();
        let b = manager.acquire(&ssh_endpoint("r1")).await.unwrap();
        assert!(Arc::ptr_eq(&a, &b));
        assert_eq!(a.address(), DaemonAddress::tcp("127.0.0.1", 12375));

        manager.acquire(&ssh_endpoint("r2")).await.unwrap();
        assert_eq!(opener.opens.load(Ordering::SeqCst), 2);
        assert_eq!(manager.open_count().await, 2);
    }

    #[tokio::test]
    async fn slow_handshake_does_not_block_other_endpoints() {
        let manager = Arc::new(TunnelManager::new(Arc::new(StuckOpener)));
        let open = manager.acquire(&ssh_endpoint("good")).await.unwrap();

        let stuck = {
            let manager = Arc::clone(&manager);
            tokio::spawn(async move { manager.acquire(&ssh_endpoint("stuck")).await })
        };
        tokio::task::yield_now().await;

        let again = tokio::time::timeout(
            Duration::from_millis(500),
            manager.acquire(&ssh_endpoint("good")),
        )
        .await
        .expect("open tunnel waited on another endpoint's handshake")
        .unwrap();
        assert!(Arc::ptr_eq(&open, &again));

        let fresh = tokio::time::timeout(
            Duration::from_millis(500),
            manager.acquire(&ssh_endpoint("other")),
        )
        .await
        .expect("new endpoint waited on another endpoint's handshake");
        assert!(fresh.is_ok());

        stuck.abort();
    }

    #[tokio::test]
    async fn closed_tunnel_is_reopened() {
        let opener = Arc::new(CountingOpener::default());
        let manager = TunnelManager::new(opener.clone());

        let first = manager.acquire(&ssh_endpoint("r1")).await.unwrap();
        first.close();
        assert!(!first.is_alive());

        let second = manager.acquire(&ssh_endpoint("r1")).await.unwrap();
        assert!(!Arc::ptr_eq(&first, &second));
        assert!(second.is_alive());
        assert_eq!(opener.opens.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn close_and_close_all() {
        let manager = TunnelManager::new(Arc::new(CountingOpener::default()));
        let t1 = manager.acquire(&ssh_endpoint("r1")).await.unwrap();
        let t2 = manager.acquire(&ssh_endpoint("r2")).await.unwrap();

        assert!(manager.close("r1").await);
        assert!(!manager.close("r1").await);
        assert!(!t1.is_alive());

        manager.close_all().await;
        assert!(!t2.is_alive());
        assert_eq!(manager.open_count().await, 0);
    }

    #[tokio::test]
    async fn endpoint_without_ssh_is_rejected() {
        let manager = TunnelManager::new(Arc::new(CountingOpener::default()));
        let ep = RemoteEndpointConfig::new("direct", "tcp://10.0.0.1:2376");
        assert!(matches!(
            manager.acquire(&ep).await,
            Err(TunnelError::NotConfigured(_))
        ));
    }

    #[tokio::test]
    async fn ssh_process_that_exits_early_is_reported() {
        let opener = SshTunnelOpener::default()
            .with_binary("false")
            .with_ready_timeout(Duration::from_secs(5));
        let ep = ssh_endpoint("r1");
        let err = opener
            .open("r1", "build-1.internal", 2375, ep.ssh.as_ref().unwrap())
            .await
            .unwrap_err();
        assert!(matches!(
            err,
            TunnelError::Exited { .. } | TunnelError::NotReady { .. }
        ));
    }
}
