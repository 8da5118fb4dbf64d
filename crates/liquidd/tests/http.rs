//! HTTP surface of the daemon, served from an in-memory backend.

use std::sync::Arc;
use std::sync::atomic::{AtomicU32, Ordering};

use async_trait::async_trait;
use axum::body::{Body, to_bytes};
use axum::http::{Request, StatusCode};
use tower::ServiceExt;

use liquid_core::{Config, PlacementKind, RemoteEndpointConfig, SshConfig, default_config};
use liquid_runtime::{
    BackendResult, ContainerRuntime, ContainerSpec, DaemonAddress, ExecOutput, ExecRequest,
    Subsystem, Tunnel, TunnelError, TunnelOpener,
};
use liquidd::{AppState, build_router};

#[derive(Default)]
struct StubRuntime {
    next: AtomicU32,
}

#[async_trait]
impl ContainerRuntime for StubRuntime {
    async fn create(&self, _: &DaemonAddress, _: &ContainerSpec) -> BackendResult<String> {
        Ok(format!("stub-{}", self.next.fetch_add(1, Ordering::SeqCst)))
    }

    async fn start(&self, _: &DaemonAddress, _: &str) -> BackendResult<()> {
        Ok(())
    }

    async fn exec(&self, _: &DaemonAddress, _: &str, _: &ExecRequest) -> BackendResult<ExecOutput> {
        Ok(ExecOutput {
            exit_code: 0,
            stdout: String::new(),
            stderr: String::new(),
        })
    }

    async fn stop(&self, _: &DaemonAddress, _: &str) -> BackendResult<()> {
        Ok(())
    }

    async fn remove(&self, _: &DaemonAddress, _: &str) -> BackendResult<()> {
        Ok(())
    }

    async fn ping(&self, _: &DaemonAddress, _: &str) -> BackendResult<bool> {
        Ok(true)
    }
}

struct NoTunnels;

#[async_trait]
impl TunnelOpener for NoTunnels {
    async fn open(&self, endpoint_id: &str, _: &str, _: u16, _: &SshConfig) -> Result<Tunnel, TunnelError> {
        Err(TunnelError::NotConfigured(endpoint_id.to_string()))
    }
}

fn subsystem(min_idle: u32) -> Subsystem {
    let mut config: Config = default_config();
    config.pool.min_idle = min_idle;
    config.pool.max_total = 4;
    Subsystem::build(&config, Arc::new(StubRuntime::default()), Arc::new(NoTunnels)).unwrap()
}

async fn get(sub: &Subsystem, uri: &str) -> (StatusCode, String) {
    let router = build_router(AppState {
        pool: Arc::clone(&sub.pool),
    });
    let resp = router
        .oneshot(Request::builder().uri(uri).body(Body::empty()).unwrap())
        .await
        .unwrap();
    let status = resp.status();
    let body = to_bytes(resp.into_body(), usize::MAX).await.unwrap();
    (status, String::from_utf8(body.to_vec()).unwrap())
}

#[tokio::test]
async fn metrics_reports_pool_gauges() {
    let sub = subsystem(2);
    sub.pool.warm_up().await.unwrap();

    let (status, body) = get(&sub, "/metrics").await;
    assert_eq!(status, StatusCode::OK);
    assert!(body.contains("liquid_pool_idle 2"));
    assert!(body.contains("liquid_pool_max_total 4"));
    assert!(body.contains("liquid_containers_created_total 2"));
    assert!(body.contains("liquid_endpoint_healthy{endpoint=\"local\"} 1"));
}

#[tokio::test]
async fn healthz_is_ok_while_running() {
    let sub = subsystem(0);

    let (status, body) = get(&sub, "/healthz").await;
    assert_eq!(status, StatusCode::OK);
    let json: serde_json::Value = serde_json::from_str(&body).unwrap();
    assert_eq!(json["status"], "ok");
    assert_eq!(json["healthy_endpoints"], 1);
    assert_eq!(json["pool"]["max_total"], 4);
}

#[tokio::test]
async fn healthz_is_unavailable_after_shutdown() {
    let sub = subsystem(1);
    sub.pool.warm_up().await.unwrap();
    sub.pool.shutdown().await;

    let (status, body) = get(&sub, "/healthz").await;
    assert_eq!(status, StatusCode::SERVICE_UNAVAILABLE);
    let json: serde_json::Value = serde_json::from_str(&body).unwrap();
    assert_eq!(json["status"], "shutting_down");
    assert_eq!(json["pool"]["idle"], 0);
}

#[tokio::test]
async fn healthz_ignores_local_endpoint_under_remote_placement() {
    let mut config: Config = default_config();
    config.pool.min_idle = 0;
    config.pool.max_total = 4;
    config.pool.placement.kind = PlacementKind::Remote;
    config.pool.placement.remote_endpoints =
        vec![RemoteEndpointConfig::new("build-1", "tcp://build-1.internal:2375")];
    let sub = Subsystem::build(&config, Arc::new(StubRuntime::default()), Arc::new(NoTunnels)).unwrap();

    let (status, _) = get(&sub, "/healthz").await;
    assert_eq!(status, StatusCode::OK);

    for _ in 0..3 {
        sub.scheduler.record_failure("build-1");
    }
    let (status, body) = get(&sub, "/healthz").await;
    assert_eq!(status, StatusCode::SERVICE_UNAVAILABLE);
    let json: serde_json::Value = serde_json::from_str(&body).unwrap();
    assert_eq!(json["status"], "degraded");
    assert_eq!(json["healthy_endpoints"], 0);
    assert_eq!(json["total_endpoints"], 2);
}

#[tokio::test]
async fn endpoints_lists_local_daemon() {
    let sub = subsystem(0);

    let (status, body) = get(&sub, "/endpoints").await;
    assert_eq!(status, StatusCode::OK);
    let json: serde_json::Value = serde_json::from_str(&body).unwrap();
    let endpoints = json.as_array().unwrap();
    assert_eq!(endpoints.len(), 1);
    assert_eq!(endpoints[0]["config"]["id"], "local");
    assert_eq!(endpoints[0]["is_local"], true);
}
