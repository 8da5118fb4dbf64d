//! Docker backend that shells out to the `docker` CLI.
//!
//! Secrets are passed as bare `-e NAME` arguments with the value set in
//! the CLI process environment, so values never appear in argv or logs.

use std::path::PathBuf;
use std::process::Stdio;

use async_trait::async_trait;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWriteExt};
use tokio::process::Command;
use tracing::{debug, warn};

use liquid_core::NetworkMode;

use crate::backend::{
    ContainerRuntime, ContainerSpec, DaemonAddress, ExecOutput, ExecRequest, MANAGED_LABEL,
};
use crate::error::{BackendError, BackendResult};

/// Label carrying the egress allow-list for restricted networking.
pub const EGRESS_ALLOW_LABEL: &str = "liquid.egress-allow";

/// Environment variable read by the in-container egress filter.
pub const ALLOWED_HOSTS_ENV: &str = "LIQUID_ALLOWED_HOSTS";

/// `docker exec` exits with 125 when the daemon itself failed.
const DOCKER_EXEC_DAEMON_ERROR: i32 = 125;

/// Bytes kept from each of a workload's stdout and stderr.
pub const DEFAULT_OUTPUT_LIMIT: usize = 1024 * 1024;

const TRUNCATED_MARKER: &[u8] = b"\n[output truncated]\n";

#[derive(Debug, Clone)]
pub struct DockerCli {
    binary: PathBuf,
    output_limit: usize,
}

impl Default for DockerCli {
    fn default() -> Self {
        Self::new()
    }
}

impl DockerCli {
    pub fn new() -> Self {
        Self::with_binary("docker")
    }

    pub fn with_binary(binary: impl Into<PathBuf>) -> Self {
        Self {
            binary: binary.into(),
            output_limit: DEFAULT_OUTPUT_LIMIT,
        }
    }

    pub fn with_output_limit(mut self, limit: usize) -> Self {
        self.output_limit = limit;
        self
    }

    fn command(&self, daemon: &DaemonAddress) -> Command {
        let mut cmd = Command::new(&self.binary);
        if let Some(host) = daemon.docker_host() {
            cmd.arg("-H").arg(host);
        }
        cmd.stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);
        cmd
    }

    async fn run(
        &self,
        operation: &'static str,
        daemon: &DaemonAddress,
        args: &[String],
        envs: &[(String, String)],
    ) -> BackendResult<String> {
        debug!(%daemon, command = %args.join(" "), "docker {operation}");
        let output = self
            .command(daemon)
            .args(args)
            .envs(envs.iter().map(|(k, v)| (k.as_str(), v.as_str())))
            .output()
            .await
            .map_err(|e| self.spawn_error(e))?;

        if !output.status.success() {
            return Err(BackendError::Command {
                operation,
                code: output.status.code(),
                stderr: String::from_utf8_lossy(&output.stderr).trim().to_string(),
            });
        }
        Ok(String::from_utf8_lossy(&output.stdout).trim().to_string())
    }

    fn spawn_error(&self, e: std::io::Error) -> BackendError {
        BackendError::Spawn {
            program: self.binary.display().to_string(),
            message: e.to_string(),
        }
    }
}

/// Arguments for `docker create`. Secret values are not included.
pub fn create_args(spec: &ContainerSpec) -> Vec<String> {
    let mut args = vec![
        "create".to_string(),
        "--name".to_string(),
        spec.name.clone(),
        "--label".to_string(),
        format!("{MANAGED_LABEL}=true"),
        "--memory".to_string(),
        spec.resources.memory.to_string(),
        "--cpus".to_string(),
        spec.resources.cpu_quota.to_string(),
        "--pids-limit".to_string(),
        spec.resources.pids_limit.to_string(),
    ];

    for (key, value) in &spec.labels {
        args.extend(["--label".to_string(), format!("{key}={value}")]);
    }

    match spec.network.mode {
        NetworkMode::None => args.extend(["--network".to_string(), "none".to_string()]),
        NetworkMode::Bridge => args.extend(["--network".to_string(), "bridge".to_string()]),
        NetworkMode::Restricted => {
            let hosts = spec.network.allowed_hosts.join(",");
            args.extend([
                "--network".to_string(),
                "bridge".to_string(),
                "--label".to_string(),
                format!("{EGRESS_ALLOW_LABEL}={hosts}"),
                "-e".to_string(),
                format!("{ALLOWED_HOSTS_ENV}={hosts}"),
            ]);
        }
    }

    for (name, _) in &spec.secrets {
        args.extend(["-e".to_string(), name.clone()]);
    }

    args.extend([
        spec.image.clone(),
        "sleep".to_string(),
        "infinity".to_string(),
    ]);
    args
}

/// Arguments for `docker exec`.
pub fn exec_args(container_id: &str, request: &ExecRequest) -> Vec<String> {
    let mut args = vec!["exec".to_string()];
    if request.stdin.is_some() {
        args.push("-i".to_string());
    }
    for (k, v) in &request.env {
        args.extend(["-e".to_string(), format!("{k}={v}")]);
    }
    args.push(container_id.to_string());
    args.extend(request.command.iter().cloned());
    args
}

#[async_trait]
impl ContainerRuntime for DockerCli {
    async fn create(&self, daemon: &DaemonAddress, spec: &ContainerSpec) -> BackendResult<String> {
        let envs: Vec<(String, String)> = spec
            .secrets
            .iter()
            .map(|(k, v)| (k.clone(), v.expose().to_string()))
            .collect();
        let id = self.run("create", daemon, &create_args(spec), &envs).await?;
        if id.is_empty() {
            return Err(BackendError::Command {
                operation: "create",
                code: Some(0),
                stderr: "docker create printed no container id".to_string(),
            });
        }
        Ok(id)
    }

    async fn start(&self, daemon: &DaemonAddress, container_id: &str) -> BackendResult<()> {
        let args = ["start".to_string(), container_id.to_string()];
        self.run("start", daemon, &args, &[]).await.map(|_| ())
    }

    async fn exec(
        &self,
        daemon: &DaemonAddress,
        container_id: &str,
        request: &ExecRequest,
    ) -> BackendResult<ExecOutput> {
        let args = exec_args(container_id, request);
        debug!(%daemon, container_id, argc = request.command.len(), "docker exec");

        let mut cmd = self.command(daemon);
        cmd.args(&args);
        if request.stdin.is_some() {
            cmd.stdin(Stdio::piped());
        }
        let mut child = cmd.spawn().map_err(|e| self.spawn_error(e))?;

        if let (Some(input), Some(mut pipe)) = (request.stdin.clone(), child.stdin.take()) {
            tokio::spawn(async move {
                if let Err(e) = pipe.write_all(&input).await {
                    warn!(error = %e, "failed to write workload stdin");
                }
            });
        }

        let limit = self.output_limit;
        let stdout_pipe = child.stdout.take();
        let stderr_pipe = child.stderr.take();
        let (stdout, stderr) = tokio::join!(
            read_capped(stdout_pipe, limit),
            read_capped(stderr_pipe, limit)
        );
        let (stdout, stderr) = (
            stdout.map_err(|e| self.spawn_error(e))?,
            stderr.map_err(|e| self.spawn_error(e))?,
        );
        let status = child.wait().await.map_err(|e| self.spawn_error(e))?;
        let stderr = String::from_utf8_lossy(&stderr).into_owned();

        match status.code() {
            Some(DOCKER_EXEC_DAEMON_ERROR) | None => Err(BackendError::Command {
                operation: "exec",
                code: status.code(),
                stderr: stderr.trim().to_string(),
            }),
            Some(exit_code) => Ok(ExecOutput {
                exit_code,
                stdout: String::from_utf8_lossy(&stdout).into_owned(),
                stderr,
            }),
        }
    }

    async fn stop(&self, daemon: &DaemonAddress, container_id: &str) -> BackendResult<()> {
        let args = [
            "stop".to_string(),
            "-t".to_string(),
            "1".to_string(),
            container_id.to_string(),
        ];
        self.run("stop", daemon, &args, &[]).await.map(|_| ())
    }

    async fn remove(&self, daemon: &DaemonAddress, container_id: &str) -> BackendResult<()> {
        let args = ["rm".to_string(), "-f".to_string(), container_id.to_string()];
        self.run("rm", daemon, &args, &[]).await.map(|_| ())
    }

    async fn ping(&self, daemon: &DaemonAddress, container_id: &str) -> BackendResult<bool> {
        let args = [
            "inspect".to_string(),
            "--format".to_string(),
            "{{.State.Running}}".to_string(),
            container_id.to_string(),
        ];
        let out = self.run("inspect", daemon, &args, &[]).await?;
        Ok(out == "true")
    }
}

/// Read at most `limit` bytes, then drain the rest so the writer never
/// blocks on a full pipe. Truncated output ends with a marker.
async fn read_capped<R>(reader: Option<R>, limit: usize) -> std::io::Result<Vec<u8>>
where
    R: AsyncRead + Unpin,
{
    let Some(mut reader) = reader else {
        return Ok(Vec::new());
    };
    let mut buf = Vec::new();
    (&mut reader).take(limit as u64).read_to_end(&mut buf).await?;
    let dropped = tokio::io::copy(&mut reader, &mut tokio::io::sink()).await?;
    if dropped > 0 {
        debug!(kept = buf.len(), dropped, "workload output truncated");
        buf.extend_from_slice(TRUNCATED_MARKER);
    }
    Ok(buf)
}
