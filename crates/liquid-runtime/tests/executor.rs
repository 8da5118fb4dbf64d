//! Workload execution against the in-memory backend.

mod common;

use std::future::Future;
use std::pin::Pin;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use liquid_core::{AffinityRule, LOCAL_ENDPOINT_ID, PlacementKind, RemoteEndpointConfig};
use liquid_runtime::{ExecutionCallback, ExecutionEvent, ExecutionStatus, Executor, RuntimeError, Workload};

use common::{FakeOpener, FakeRuntime, build, config};

#[tokio::test]
async fn successful_run_returns_output_and_reuses_container() {
    let runtime = FakeRuntime::new();
    let sub = build(&config(0, 2), &runtime, &FakeOpener::new());

    let out = sub
        .executor
        .run(&Workload::new(["echo", "hello", "world"]))
        .await
        .unwrap();
    assert_eq!(out.exit_code, 0);
    assert_eq!(out.stdout, "hello world\n");
    assert_eq!(out.endpoint_id, LOCAL_ENDPOINT_ID);

    let second = sub.executor.run(&Workload::new(["echo", "again"])).await.unwrap();
    assert_eq!(second.container_id, out.container_id);
    assert_eq!(runtime.created_count(), 1);

    let snapshot = sub.pool.metrics_snapshot();
    assert_eq!(snapshot.executions_total, 2);
    assert_eq!(snapshot.execution_failures_total, 0);
    assert_eq!(snapshot.pool.idle, 1);

    let local = sub.scheduler.get_endpoint(LOCAL_ENDPOINT_ID).unwrap();
    assert_eq!(local.latency_samples, 2);
    assert_eq!(local.consecutive_failures, 0);
}

#[tokio::test]
async fn stdin_is_streamed_to_the_workload() {
    let runtime = FakeRuntime::new();
    let sub = build(&config(0, 1), &runtime, &FakeOpener::new());

    let out = sub
        .executor
        .run(&Workload::new(["cat"]).with_stdin("print('hi')\n"))
        .await
        .unwrap();
    assert_eq!(out.stdout, "print('hi')\n");
}

#[tokio::test]
async fn non_zero_exit_keeps_container_and_endpoint_healthy() {
    let runtime = FakeRuntime::new();
    let sub = build(&config(0, 1), &runtime, &FakeOpener::new());

    let err = sub.executor.run(&Workload::new(["exit", "3"])).await.unwrap_err();
    match &err {
        RuntimeError::ContainerExecution {
            exit_code, message, ..
        } => {
            assert_eq!(*exit_code, Some(3));
            assert_eq!(message, "boom");
        }
        other => panic!("expected execution error, got {other:?}"),
    }
    assert_eq!(err.exit_code(), Some(3));

    assert!(runtime.removed().is_empty());
    assert_eq!(sub.pool.stats().idle, 1);
    let local = sub.scheduler.get_endpoint(LOCAL_ENDPOINT_ID).unwrap();
    assert_eq!(local.consecutive_failures, 0);
    assert!(local.healthy);
    assert_eq!(sub.pool.metrics_snapshot().execution_failures_total, 1);
}

#[tokio::test(start_paused = true)]
async fn timeout_destroys_container_and_reports_its_id() {
    let runtime = FakeRuntime::new();
    let sub = build(&config(0, 1), &runtime, &FakeOpener::new());

    let container = sub.pool.acquire().await.unwrap();
    let id = container.id().to_string();
    let err = sub
        .executor
        .execute(container, &Workload::new(["sleep", "5000"]))
        .await
        .unwrap_err();

    match &err {
        RuntimeError::ContainerTimeout {
            container_id,
            timeout,
        } => {
            assert_eq!(container_id.as_deref(), Some(id.as_str()));
            assert_eq!(*timeout, Duration::from_millis(500));
        }
        other => panic!("expected execution timeout, got {other:?}"),
    }
    assert!(!err.is_acquire_timeout());

    assert_eq!(runtime.removed(), vec![id]);
    assert_eq!(sub.pool.stats().total, 0);
    assert_eq!(
        sub.scheduler
            .get_endpoint(LOCAL_ENDPOINT_ID)
            .unwrap()
            .consecutive_failures,
        1
    );
    assert_eq!(sub.pool.metrics_snapshot().execution_timeouts_total, 1);
}

#[tokio::test(start_paused = true)]
async fn workload_timeout_is_capped_by_max_execution_time() {
    let runtime = FakeRuntime::new();
    let sub = build(&config(0, 2), &runtime, &FakeOpener::new());

    let tighter = Workload::new(["sleep", "200"]).with_timeout(Duration::from_millis(50));
    let err = sub.executor.run(&tighter).await.unwrap_err();
    assert!(matches!(
        err,
        RuntimeError::ContainerTimeout { timeout, .. } if timeout == Duration::from_millis(50)
    ));

    let looser = Workload::new(["sleep", "2000"]).with_timeout(Duration::from_secs(60));
    let err = sub.executor.run(&looser).await.unwrap_err();
    assert!(matches!(
        err,
        RuntimeError::ContainerTimeout { timeout, .. } if timeout == Duration::from_millis(500)
    ));

    let fits = Workload::new(["sleep", "100"]).with_timeout(Duration::from_millis(300));
    assert!(sub.executor.run(&fits).await.is_ok());
}

#[tokio::test]
async fn transport_fault_marks_container_faulty() {
    let runtime = FakeRuntime::new();
    let sub = build(&config(0, 1), &runtime, &FakeOpener::new());

    let container = sub.pool.acquire().await.unwrap();
    runtime.set_unreachable(true);
    let err = sub
        .executor
        .execute(container, &Workload::new(["echo", "hi"]))
        .await
        .unwrap_err();
    assert!(matches!(err, RuntimeError::ContainerExecution { exit_code: None, .. }));

    // The faulty container left the pool even though teardown failed.
    assert_eq!(sub.pool.stats().total, 0);
    let local = sub.scheduler.get_endpoint(LOCAL_ENDPOINT_ID).unwrap();
    // One failed exec is one strike, even though teardown failed too.
    assert_eq!(local.consecutive_failures, 1);
    assert_eq!(local.active_containers, 0);
}

#[tokio::test]
async fn callback_receives_one_event_per_execution() {
    let runtime = FakeRuntime::new();
    let sub = build(&config(0, 1), &runtime, &FakeOpener::new());

    let events: Arc<Mutex<Vec<ExecutionEvent>>> = Arc::default();
    let sink = Arc::clone(&events);
    let callback: ExecutionCallback = Arc::new(move |event: ExecutionEvent| {
        let sink = Arc::clone(&sink);
        Box::pin(async move {
            sink.lock().unwrap().push(event);
        }) as Pin<Box<dyn Future<Output = ()> + Send>>
    });
    let executor = Executor::new(Arc::clone(&sub.pool)).with_callback(callback);

    executor.run(&Workload::new(["echo", "ok"])).await.unwrap();
    executor.run(&Workload::new(["exit", "2"])).await.unwrap_err();

    let events = events.lock().unwrap();
    assert_eq!(events.len(), 2);
    assert_eq!(events[0].status, ExecutionStatus::Succeeded);
    assert_eq!(events[0].exit_code, Some(0));
    assert_eq!(events[1].status, ExecutionStatus::Failed);
    assert_eq!(events[1].exit_code, Some(2));
    assert_eq!(events[1].endpoint_id, LOCAL_ENDPOINT_ID);
}

#[tokio::test]
async fn run_with_affinity_uses_matching_endpoint() {
    let runtime = FakeRuntime::new();
    let mut cfg = config(0, 4);
    cfg.pool.placement.kind = PlacementKind::Hybrid;
    cfg.pool.placement.remote_endpoints = vec![
        RemoteEndpointConfig::new("eu-1", "tcp://eu-1.internal:2375").with_label("region", "eu-west"),
        RemoteEndpointConfig::new("us-1", "tcp://us-1.internal:2375").with_label("region", "us-east"),
    ];
    let sub = build(&cfg, &runtime, &FakeOpener::new());

    let out = sub
        .executor
        .run_with_affinity(
            &Workload::new(["echo", "placed"]),
            &[AffinityRule::is_in("region", &["eu-west"])],
        )
        .await
        .unwrap();
    assert_eq!(out.endpoint_id, "eu-1");
    assert!(sub.scheduler.get_endpoint("eu-1").unwrap().avg_latency_ms >= 0.0);
}
