//! Workload execution inside pooled containers.
//!
//! The executor owns the bookkeeping around one `docker exec`: the time
//! limit, endpoint health and latency, subsystem metrics, output
//! redaction, and the optional event callback. The container always goes
//! back to the pool afterwards; faults mark it so the pool destroys it.

use std::sync::Arc;
use std::time::{Duration, Instant};

use serde::Serialize;
use tracing::{debug, info, warn};

use liquid_core::AffinityRule;

use crate::backend::ExecRequest;
use crate::container::Container;
use crate::error::{RuntimeError, RuntimeResult};
use crate::pool::ContainerPool;

/// Callback invoked after every execution, e.g. to broadcast the event.
pub type ExecutionCallback = Arc<dyn Fn(ExecutionEvent) -> BoxFuture + Send + Sync>;

type BoxFuture = std::pin::Pin<Box<dyn std::future::Future<Output = ()> + Send>>;

/// A command to run in a pooled container.
#[derive(Debug, Clone, Default)]
pub struct Workload {
    pub command: Vec<String>,
    pub stdin: Option<Vec<u8>>,
    pub env: Vec<(String, String)>,
    /// Tighter limit than the pool's `max_execution_time`. Larger values
    /// are capped.
    pub timeout: Option<Duration>,
}

impl Workload {
    pub fn new<I, S>(command: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            command: command.into_iter().map(Into::into).collect(),
            ..Default::default()
        }
    }

    pub fn with_stdin(mut self, stdin: impl Into<Vec<u8>>) -> Self {
        self.stdin = Some(stdin.into());
        self
    }

    pub fn with_env(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.env.push((key.into(), value.into()));
        self
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }

    fn request(&self) -> ExecRequest {
        ExecRequest {
            command: self.command.clone(),
            stdin: self.stdin.clone(),
            env: self.env.clone(),
        }
    }
}

/// Output of a workload that exited zero.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ExecutionOutcome {
    pub container_id: String,
    pub endpoint_id: String,
    pub exit_code: i32,
    pub stdout: String,
    pub stderr: String,
    pub duration: Duration,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ExecutionStatus {
    Succeeded,
    Failed,
    TimedOut,
    Faulted,
}

#[derive(Debug, Clone, Serialize)]
pub struct ExecutionEvent {
    pub container_id: String,
    pub endpoint_id: String,
    pub status: ExecutionStatus,
    pub exit_code: Option<i32>,
    pub duration_ms: u64,
}

pub struct Executor {
    pool: Arc<ContainerPool>,
    on_event: Option<ExecutionCallback>,
}

impl Executor {
    pub fn new(pool: Arc<ContainerPool>) -> Self {
        Self {
            pool,
            on_event: None,
        }
    }

    pub fn with_callback(mut self, callback: ExecutionCallback) -> Self {
        self.on_event = Some(callback);
        self
    }

    pub fn pool(&self) -> &Arc<ContainerPool> {
        &self.pool
    }

    /// Acquire a container and run the workload in it.
    pub async fn run(&self, workload: &Workload) -> RuntimeResult<ExecutionOutcome> {
        let container = self.pool.acquire().await?;
        self.execute(container, workload).await
    }

    pub async fn run_with_affinity(
        &self,
        workload: &Workload,
        affinity: &[AffinityRule],
    ) -> RuntimeResult<ExecutionOutcome> {
        let container = self.pool.acquire_with_affinity(affinity).await?;
        self.execute(container, workload).await
    }

    /// Run the workload in an already acquired container and release it.
    pub async fn execute(
        &self,
        mut container: Container,
        workload: &Workload,
    ) -> RuntimeResult<ExecutionOutcome> {
        let limit = self.time_limit(workload);
        let container_id = container.id().to_string();
        let endpoint_id = container.endpoint_id().to_string();
        let scheduler = Arc::clone(self.pool.scheduler());
        let metrics = Arc::clone(self.pool.metrics());

        debug!(
            container_id = %container_id,
            endpoint = %endpoint_id,
            limit_ms = limit.as_millis() as u64,
            "executing workload"
        );

        let start = Instant::now();
        let request = workload.request();
        let result = tokio::time::timeout(
            limit,
            self.pool.client().exec(&endpoint_id, &container_id, &request),
        )
        .await;
        let duration = start.elapsed();

        let (status, outcome) = match result {
            Err(_) => {
                container.mark_faulty();
                scheduler.record_failure(&endpoint_id);
                metrics.record_execution_timeout();
                warn!(container_id = %container_id, endpoint = %endpoint_id, "workload exceeded time limit");
                (
                    ExecutionStatus::TimedOut,
                    Err(RuntimeError::ContainerTimeout {
                        container_id: Some(container_id.clone()),
                        timeout: limit,
                    }),
                )
            }
            Ok(Err(e)) => {
                // The client already recorded the endpoint failure.
                container.mark_faulty();
                metrics.record_execution(duration, true);
                warn!(container_id = %container_id, error = %e, "workload transport failure");
                (
                    ExecutionStatus::Faulted,
                    Err(RuntimeError::ContainerExecution {
                        container_id: container_id.clone(),
                        exit_code: None,
                        message: self.pool.redact(&e.to_string()),
                    }),
                )
            }
            Ok(Ok(output)) => {
                scheduler.record_success(&endpoint_id, duration.as_secs_f64() * 1000.0);
                let stdout = self.pool.redact(&output.stdout);
                let stderr = self.pool.redact(&output.stderr);

                if output.exit_code == 0 {
                    metrics.record_execution(duration, false);
                    info!(
                        container_id = %container_id,
                        endpoint = %endpoint_id,
                        latency_ms = duration.as_millis() as u64,
                        "workload completed"
                    );
                    (
                        ExecutionStatus::Succeeded,
                        Ok(ExecutionOutcome {
                            container_id: container_id.clone(),
                            endpoint_id: endpoint_id.clone(),
                            exit_code: 0,
                            stdout,
                            stderr,
                            duration,
                        }),
                    )
                } else {
                    metrics.record_execution(duration, true);
                    info!(container_id = %container_id, exit_code = output.exit_code, "workload exited non-zero");
                    let message = match stderr.trim() {
                        "" => format!("exit code {}", output.exit_code),
                        trimmed => trimmed.to_string(),
                    };
                    (
                        ExecutionStatus::Failed,
                        Err(RuntimeError::ContainerExecution {
                            container_id: container_id.clone(),
                            exit_code: Some(output.exit_code),
                            message,
                        }),
                    )
                }
            }
        };

        self.pool.release(container).await;

        if let Some(callback) = &self.on_event {
            let event = ExecutionEvent {
                container_id,
                endpoint_id,
                status,
                exit_code: match &outcome {
                    Ok(o) => Some(o.exit_code),
                    Err(e) => e.exit_code(),
                },
                duration_ms: duration.as_millis() as u64,
            };
            callback(event).await;
        }

        outcome
    }

    fn time_limit(&self, workload: &Workload) -> Duration {
        let max = self.pool.config().resources.max_execution_time;
        workload.timeout.map_or(max, |t| t.min(max))
    }
}
