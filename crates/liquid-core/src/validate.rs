//! Configuration validation.
//!
//! Validation never fails: it collects one message per violated
//! invariant and leaves it to the caller to decide whether to abort.

use std::collections::HashSet;

use serde::Serialize;

use crate::config::{PartialConfig, PlacementKind, SecretsBackend};
use crate::types::{LOCAL_ENDPOINT_ID, parse_tcp_url};

/// Outcome of validating a configuration.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Validation {
    pub valid: bool,
    pub errors: Vec<String>,
}

impl Validation {
    fn from_errors(errors: Vec<String>) -> Self {
        Self {
            valid: errors.is_empty(),
            errors,
        }
    }
}

/// Check a partial configuration against every pool and secrets invariant.
pub fn validate_config(config: &PartialConfig) -> Validation {
    let mut errors = Vec::new();
    let pool = &config.pool;

    if let Some(min_idle) = pool.min_idle {
        if min_idle < 0 {
            errors.push(format!("pool.min_idle must be >= 0 (got {min_idle})"));
        }
    }
    if let Some(max_total) = pool.max_total {
        if max_total <= 0 {
            errors.push(format!("pool.max_total must be > 0 (got {max_total})"));
        }
    }
    if let (Some(min_idle), Some(max_total)) = (pool.min_idle, pool.max_total) {
        if min_idle > max_total && max_total > 0 {
            errors.push(format!(
                "pool.min_idle ({min_idle}) must not exceed pool.max_total ({max_total})"
            ));
        }
    }

    positive_ms(&mut errors, "pool.idle_timeout_ms", pool.idle_timeout_ms);
    positive_ms(&mut errors, "pool.acquire_timeout_ms", pool.acquire_timeout_ms);
    positive_ms(
        &mut errors,
        "pool.health_check_interval_ms",
        pool.health_check_interval_ms,
    );

    let requires_resources = pool.max_total.is_some_and(|m| m > 0);

    match pool.image.as_deref() {
        Some(image) if image.trim().is_empty() => {
            errors.push("pool.image must not be empty".to_string());
        }
        None if requires_resources => {
            errors.push("pool.image is required when pool.max_total > 0".to_string());
        }
        _ => {}
    }

    match &pool.resources {
        Some(res) => {
            match res.memory {
                Some(m) if m <= 0 => {
                    errors.push(format!("pool.resources.memory must be > 0 (got {m})"));
                }
                None if requires_resources => {
                    errors.push("pool.resources.memory is required".to_string());
                }
                _ => {}
            }
            match res.cpu_quota {
                Some(q) if !(q > 0.0 && q.is_finite()) => {
                    errors.push(format!("pool.resources.cpu_quota must be > 0 (got {q})"));
                }
                None if requires_resources => {
                    errors.push("pool.resources.cpu_quota is required".to_string());
                }
                _ => {}
            }
            if let Some(p) = res.pids_limit {
                if p <= 0 {
                    errors.push(format!("pool.resources.pids_limit must be > 0 (got {p})"));
                }
            }
            positive_ms(
                &mut errors,
                "pool.resources.max_execution_time_ms",
                res.max_execution_time_ms,
            );
        }
        None if requires_resources => {
            errors.push("pool.resources is required when pool.max_total > 0".to_string());
        }
        None => {}
    }

    if let Some(placement) = &pool.placement {
        if let Some(w) = placement.local_weight {
            if !(0.0..=1.0).contains(&w) {
                errors.push(format!("pool.placement.local_weight must be within [0, 1] (got {w})"));
            }
        }

        let endpoints = placement.remote_endpoints.as_deref().unwrap_or_default();
        if placement.kind == Some(PlacementKind::Remote) && endpoints.is_empty() {
            errors.push("remote placement requires at least one remote endpoint".to_string());
        }

        let mut seen = HashSet::new();
        for ep in endpoints {
            if ep.id.trim().is_empty() {
                errors.push("remote endpoint id must not be empty".to_string());
                continue;
            }
            if ep.id == LOCAL_ENDPOINT_ID {
                errors.push(format!("remote endpoint id '{LOCAL_ENDPOINT_ID}' is reserved"));
            }
            if !seen.insert(ep.id.as_str()) {
                errors.push(format!("duplicate remote endpoint id '{}'", ep.id));
            }
            if parse_tcp_url(&ep.url).is_none() {
                errors.push(format!(
                    "remote endpoint '{}' url must look like tcp://host:port (got '{}')",
                    ep.id, ep.url
                ));
            }
            if ep.max_containers == 0 {
                errors.push(format!("remote endpoint '{}' max_containers must be > 0", ep.id));
            }
            if !(ep.weight >= 0.0 && ep.weight.is_finite()) {
                errors.push(format!(
                    "remote endpoint '{}' weight must be >= 0 (got {})",
                    ep.id, ep.weight
                ));
            }
        }
    }

    if config.secrets.backend == Some(SecretsBackend::Vault) {
        let has_address = config
            .secrets
            .vault
            .as_ref()
            .is_some_and(|v| !v.address.trim().is_empty());
        if !has_address {
            errors.push("secrets.vault.address is required for the vault backend".to_string());
        }
    }

    Validation::from_errors(errors)
}

fn positive_ms(errors: &mut Vec<String>, field: &str, value: Option<i64>) {
    if let Some(v) = value {
        if v <= 0 {
            errors.push(format!("{field} must be > 0 (got {v})"));
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{
        PartialPlacement, PartialPoolConfig, PartialResources, PartialSecretsConfig,
    };
    use crate::types::RemoteEndpointConfig;

    fn full_pool() -> PartialPoolConfig {
        PartialPoolConfig {
            min_idle: Some(2),
            max_total: Some(10),
            idle_timeout_ms: Some(60_000),
            acquire_timeout_ms: Some(5_000),
            health_check_interval_ms: Some(10_000),
            image: Some("python:3.12-slim".to_string()),
            resources: Some(PartialResources {
                memory: Some(268_435_456),
                cpu_quota: Some(1.0),
                pids_limit: Some(64),
                max_execution_time_ms: Some(15_000),
            }),
            placement: None,
            network: None,
        }
    }

    fn with_pool(pool: PartialPoolConfig) -> PartialConfig {
        PartialConfig {
            pool,
            ..Default::default()
        }
    }

    #[test]
    fn fully_specified_config_is_valid() {
        let v = validate_config(&with_pool(full_pool()));
        assert!(v.valid);
        assert!(v.errors.is_empty());
    }

    #[test]
    fn negative_min_idle_and_zero_max_total_are_invalid() {
        let v = validate_config(&with_pool(PartialPoolConfig {
            min_idle: Some(-1),
            max_total: Some(0),
            ..Default::default()
        }));
        assert!(!v.valid);
        assert!(!v.errors.is_empty());
        assert!(v.errors.iter().any(|e| e.contains("min_idle")));
        assert!(v.errors.iter().any(|e| e.contains("max_total")));
    }

    #[test]
    fn min_idle_above_max_total() {
        let mut pool = full_pool();
        pool.min_idle = Some(11);
        let v = validate_config(&with_pool(pool));
        assert_eq!(v.errors.len(), 1);
        assert!(v.errors[0].contains("must not exceed"));
    }

    #[test]
    fn missing_resources_when_max_total_positive() {
        let mut pool = full_pool();
        pool.resources = None;
        pool.image = None;
        let v = validate_config(&with_pool(pool));
        assert!(!v.valid);
        assert_eq!(v.errors.len(), 2);
    }

    #[test]
    fn missing_resource_fields_are_reported_individually() {
        let mut pool = full_pool();
        pool.resources = Some(PartialResources {
            pids_limit: Some(0),
            ..Default::default()
        });
        let v = validate_config(&with_pool(pool));
        assert!(v.errors.iter().any(|e| e.contains("memory is required")));
        assert!(v.errors.iter().any(|e| e.contains("cpu_quota is required")));
        assert!(v.errors.iter().any(|e| e.contains("pids_limit")));
    }

    #[test]
    fn non_positive_durations() {
        let mut pool = full_pool();
        pool.idle_timeout_ms = Some(0);
        pool.acquire_timeout_ms = Some(-5);
        let v = validate_config(&with_pool(pool));
        assert_eq!(v.errors.len(), 2);
    }

    #[test]
    fn placement_errors() {
        let mut pool = full_pool();
        pool.placement = Some(PartialPlacement {
            kind: Some(PlacementKind::Hybrid),
            local_weight: Some(1.5),
            local_labels: None,
            remote_endpoints: Some(vec![
                RemoteEndpointConfig::new("remote-1", "tcp://10.0.0.5:2376"),
                RemoteEndpointConfig::new("remote-1", "tcp://10.0.0.6:2376"),
                RemoteEndpointConfig::new("local", "http://nope").with_weight(-1.0),
            ]),
        });
        let v = validate_config(&with_pool(pool));
        assert!(v.errors.iter().any(|e| e.contains("local_weight")));
        assert!(v.errors.iter().any(|e| e.contains("duplicate")));
        assert!(v.errors.iter().any(|e| e.contains("reserved")));
        assert!(v.errors.iter().any(|e| e.contains("tcp://host:port")));
        assert!(v.errors.iter().any(|e| e.contains("weight must be >= 0")));
    }

    #[test]
    fn remote_placement_needs_endpoints() {
        let mut pool = full_pool();
        pool.placement = Some(PartialPlacement {
            kind: Some(PlacementKind::Remote),
            ..Default::default()
        });
        let v = validate_config(&with_pool(pool));
        assert_eq!(v.errors.len(), 1);
    }

    #[test]
    fn vault_backend_requires_address() {
        let config = PartialConfig {
            pool: full_pool(),
            secrets: PartialSecretsConfig {
                backend: Some(SecretsBackend::Vault),
                ..Default::default()
            },
        };
        let v = validate_config(&config);
        assert!(!v.valid);
        assert!(v.errors[0].contains("vault.address"));
    }
}
