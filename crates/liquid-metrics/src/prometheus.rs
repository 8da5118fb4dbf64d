//! Prometheus text exposition format.

use std::fmt::Write;

use crate::collector::MetricsSnapshot;

fn header(out: &mut String, name: &str, kind: &str, help: &str) {
    let _ = writeln!(out, "# HELP {name} {help}");
    let _ = writeln!(out, "# TYPE {name} {kind}");
}

fn scalar(out: &mut String, name: &str, kind: &str, help: &str, value: impl std::fmt::Display) {
    header(out, name, kind, help);
    let _ = writeln!(out, "{name} {value}");
}

/// Render a snapshot into Prometheus text format.
///
/// Subsystem counters are unlabelled; endpoint gauges carry an
/// `endpoint` label.
pub fn render_prometheus(s: &MetricsSnapshot) -> String {
    let mut out = String::new();

    scalar(&mut out, "liquid_executions_total", "counter", "Workload executions.", s.executions_total);
    scalar(
        &mut out,
        "liquid_execution_failures_total",
        "counter",
        "Executions that failed, including timeouts.",
        s.execution_failures_total,
    );
    scalar(
        &mut out,
        "liquid_execution_timeouts_total",
        "counter",
        "Executions that exceeded their time limit.",
        s.execution_timeouts_total,
    );
    scalar(
        &mut out,
        "liquid_acquire_timeouts_total",
        "counter",
        "Pool acquisitions that timed out.",
        s.acquire_timeouts_total,
    );
    scalar(
        &mut out,
        "liquid_containers_created_total",
        "counter",
        "Containers created.",
        s.containers_created_total,
    );
    scalar(
        &mut out,
        "liquid_containers_destroyed_total",
        "counter",
        "Containers destroyed.",
        s.containers_destroyed_total,
    );
    scalar(
        &mut out,
        "liquid_execution_latency_p50_ms",
        "gauge",
        "P50 execution latency in milliseconds.",
        format!("{:.2}", s.latency_p50_ms),
    );
    scalar(
        &mut out,
        "liquid_execution_latency_p99_ms",
        "gauge",
        "P99 execution latency in milliseconds.",
        format!("{:.2}", s.latency_p99_ms),
    );
    scalar(&mut out, "liquid_pool_idle", "gauge", "Idle pooled containers.", s.pool.idle);
    scalar(&mut out, "liquid_pool_busy", "gauge", "Containers executing workloads.", s.pool.busy);
    scalar(&mut out, "liquid_pool_max_total", "gauge", "Pool capacity.", s.pool.max_total);

    header(&mut out, "liquid_endpoint_healthy", "gauge", "1 if the endpoint is healthy.");
    for e in &s.endpoints {
        let _ = writeln!(
            out,
            "liquid_endpoint_healthy{{endpoint=\"{}\"}} {}",
            e.endpoint_id,
            u8::from(e.healthy)
        );
    }

    header(&mut out, "liquid_endpoint_active_containers", "gauge", "Containers placed on the endpoint.");
    for e in &s.endpoints {
        let _ = writeln!(
            out,
            "liquid_endpoint_active_containers{{endpoint=\"{}\"}} {}",
            e.endpoint_id, e.active_containers
        );
    }

    header(&mut out, "liquid_endpoint_capacity", "gauge", "Maximum containers on the endpoint.");
    for e in &s.endpoints {
        let _ = writeln!(
            out,
            "liquid_endpoint_capacity{{endpoint=\"{}\"}} {}",
            e.endpoint_id, e.capacity
        );
    }

    header(&mut out, "liquid_endpoint_latency_ms", "gauge", "Moving average execution latency.");
    for e in &s.endpoints {
        let _ = writeln!(
            out,
            "liquid_endpoint_latency_ms{{endpoint=\"{}\"}} {:.2}",
            e.endpoint_id, e.avg_latency_ms
        );
    }

    header(
        &mut out,
        "liquid_endpoint_consecutive_failures",
        "gauge",
        "Consecutive failures since the last success.",
    );
    for e in &s.endpoints {
        let _ = writeln!(
            out,
            "liquid_endpoint_consecutive_failures{{endpoint=\"{}\"}} {}",
            e.endpoint_id, e.consecutive_failures
        );
    }

    out
}
