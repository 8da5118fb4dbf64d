//! Shared domain types for the container subsystem.
//!
//! Endpoint configuration and affinity rules are used by the scheduler,
//! the pool, and the configuration layer alike, so they live here.

use std::collections::HashMap;
use std::path::PathBuf;

use serde::{Deserialize, Serialize};

/// Identifier of the implicit local endpoint.
pub const LOCAL_ENDPOINT_ID: &str = "local";

/// Conventional Docker TLS port used when a remote url omits one.
pub const DEFAULT_DOCKER_PORT: u16 = 2376;

// ── Remote endpoints ───────────────────────────────────────────────

/// SSH settings for reaching a remote endpoint through a tunnel.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct SshConfig {
    /// Remote login user.
    pub user: String,
    /// SSH port on the remote host.
    #[serde(default = "default_ssh_port")]
    pub port: u16,
    /// Private key passed to `ssh -i`.
    #[serde(default)]
    pub identity_file: Option<PathBuf>,
}

fn default_ssh_port() -> u16 {
    22
}

/// Static configuration of a remote Docker-capable host.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct RemoteEndpointConfig {
    /// Unique endpoint id.
    pub id: String,
    /// Daemon address, `tcp://host:port`.
    pub url: String,
    /// Maximum containers this endpoint may host at once.
    #[serde(default = "default_max_containers")]
    pub max_containers: u32,
    /// Relative placement weight among remote endpoints.
    #[serde(default = "default_weight")]
    pub weight: f64,
    #[serde(default)]
    pub labels: HashMap<String, String>,
    #[serde(default = "default_enabled")]
    pub enabled: bool,
    /// When present the daemon is reached through an SSH port forward.
    #[serde(default)]
    pub ssh: Option<SshConfig>,
}

fn default_max_containers() -> u32 {
    10
}

fn default_weight() -> f64 {
    1.0
}

fn default_enabled() -> bool {
    true
}

impl RemoteEndpointConfig {
    /// Minimal endpoint config with default capacity and weight.
    pub fn new(id: impl Into<String>, url: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            url: url.into(),
            max_containers: default_max_containers(),
            weight: default_weight(),
            labels: HashMap::new(),
            enabled: true,
            ssh: None,
        }
    }

    pub fn with_weight(mut self, weight: f64) -> Self {
        self.weight = weight;
        self
    }

    pub fn with_max_containers(mut self, max: u32) -> Self {
        self.max_containers = max;
        self
    }

    pub fn with_label(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.labels.insert(key.into(), value.into());
        self
    }

    pub fn with_ssh(mut self, ssh: SshConfig) -> Self {
        self.ssh = Some(ssh);
        self
    }

    /// Host and port parsed from `url`.
    pub fn address(&self) -> Option<(String, u16)> {
        parse_tcp_url(&self.url)
    }
}

/// Parse a `tcp://host:port` daemon url.
///
/// A missing port defaults to 2376. Returns `None` for any other scheme
/// or an empty host.
pub fn parse_tcp_url(url: &str) -> Option<(String, u16)> {
    let rest = url.strip_prefix("tcp://")?;
    let rest = rest.trim_end_matches('/');
    if rest.is_empty() || rest.contains('/') {
        return None;
    }

    match rest.rsplit_once(':') {
        Some((host, port)) => {
            if host.is_empty() {
                return None;
            }
            let port = port.parse::<u16>().ok()?;
            Some((host.to_string(), port))
        }
        None => Some((rest.to_string(), DEFAULT_DOCKER_PORT)),
    }
}

// ── Affinity ───────────────────────────────────────────────────────

/// Label match operator for an affinity rule.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum AffinityOperator {
    In,
    NotIn,
    Exists,
    DoesNotExist,
}

/// A label-based filter applied to endpoints for one placement request.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AffinityRule {
    pub key: String,
    pub operator: AffinityOperator,
    #[serde(default)]
    pub values: Vec<String>,
}

impl AffinityRule {
    pub fn is_in(key: impl Into<String>, values: &[&str]) -> Self {
        Self {
            key: key.into(),
            operator: AffinityOperator::In,
            values: values.iter().map(|v| v.to_string()).collect(),
        }
    }

    pub fn not_in(key: impl Into<String>, values: &[&str]) -> Self {
        Self {
            key: key.into(),
            operator: AffinityOperator::NotIn,
            values: values.iter().map(|v| v.to_string()).collect(),
        }
    }

    pub fn exists(key: impl Into<String>) -> Self {
        Self {
            key: key.into(),
            operator: AffinityOperator::Exists,
            values: Vec::new(),
        }
    }

    pub fn does_not_exist(key: impl Into<String>) -> Self {
        Self {
            key: key.into(),
            operator: AffinityOperator::DoesNotExist,
            values: Vec::new(),
        }
    }

    /// Whether this rule accepts an endpoint with the given labels.
    pub fn matches(&self, labels: &HashMap<String, String>) -> bool {
        let value = labels.get(&self.key);
        match self.operator {
            AffinityOperator::In => value.is_some_and(|v| self.values.contains(v)),
            AffinityOperator::NotIn => value.is_none_or(|v| !self.values.contains(v)),
            AffinityOperator::Exists => value.is_some(),
            AffinityOperator::DoesNotExist => value.is_none(),
        }
    }
}

/// Whether every rule accepts the labels. An empty rule set matches.
pub fn matches_all(rules: &[AffinityRule], labels: &HashMap<String, String>) -> bool {
    rules.iter().all(|rule| rule.matches(labels))
}
