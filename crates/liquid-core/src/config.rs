//! Typed pool and secrets configuration.
//!
//! [`Config`] is the immutable object the rest of the subsystem consumes.
//! Files and overrides deserialize into [`PartialConfig`] first, where every
//! field is optional and numbers are signed so that invalid input can be
//! represented and reported by [`validate_config`](crate::validate_config)
//! instead of failing at parse time.

use std::collections::HashMap;
use std::path::Path;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::{debug, warn};

use crate::types::RemoteEndpointConfig;
use crate::validate::{Validation, validate_config};

/// Default environment prefix for secrets.
pub const DEFAULT_SECRET_PREFIX: &str = "LIQUID_SECRET_";

// ── Typed configuration ────────────────────────────────────────────

/// Where containers may be placed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum PlacementKind {
    #[default]
    Local,
    Remote,
    Hybrid,
}

#[derive(Debug, Clone, PartialEq)]
pub struct PlacementStrategy {
    pub kind: PlacementKind,
    /// Probability mass given to the local endpoint under `Hybrid`.
    pub local_weight: f64,
    /// Labels of the implicit local endpoint, matched by affinity rules.
    pub local_labels: HashMap<String, String>,
    pub remote_endpoints: Vec<RemoteEndpointConfig>,
}

/// Per-container resource limits.
#[derive(Debug, Clone, PartialEq)]
pub struct ResourceLimits {
    /// Memory limit in bytes.
    pub memory: u64,
    /// CPU quota as a fraction of one core.
    pub cpu_quota: f64,
    pub pids_limit: u32,
    pub max_execution_time: Duration,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum NetworkMode {
    /// No network at all.
    #[default]
    None,
    /// Default bridge network, unrestricted egress.
    Bridge,
    /// Bridge network with egress limited to `allowed_hosts`.
    Restricted,
}

#[derive(Debug, Clone, PartialEq, Default)]
pub struct NetworkPolicy {
    pub mode: NetworkMode,
    pub allowed_hosts: Vec<String>,
}

/// Warm pool sizing, limits, placement and network policy.
#[derive(Debug, Clone, PartialEq)]
pub struct PoolConfig {
    pub min_idle: u32,
    pub max_total: u32,
    pub idle_timeout: Duration,
    pub acquire_timeout: Duration,
    pub health_check_interval: Duration,
    pub image: String,
    pub resources: ResourceLimits,
    pub placement: PlacementStrategy,
    pub network: NetworkPolicy,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum SecretsBackend {
    #[default]
    Env,
    Vault,
}

/// Connection settings for the Vault KV v2 backend.
#[derive(Clone, PartialEq, Serialize, Deserialize)]
pub struct VaultConfig {
    pub address: String,
    #[serde(default)]
    pub token: Option<String>,
    #[serde(default = "default_vault_mount")]
    pub mount: String,
    #[serde(default = "default_vault_prefix")]
    pub path_prefix: String,
    #[serde(default)]
    pub namespace: Option<String>,
}

fn default_vault_mount() -> String {
    "secret".to_string()
}

fn default_vault_prefix() -> String {
    "liquid".to_string()
}

impl VaultConfig {
    pub fn new(address: impl Into<String>, token: Option<String>) -> Self {
        Self {
            address: address.into(),
            token,
            mount: default_vault_mount(),
            path_prefix: default_vault_prefix(),
            namespace: None,
        }
    }
}

// The token never appears in debug output.
impl std::fmt::Debug for VaultConfig {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("VaultConfig")
            .field("address", &self.address)
            .field("token", &self.token.as_ref().map(|_| "***"))
            .field("mount", &self.mount)
            .field("path_prefix", &self.path_prefix)
            .field("namespace", &self.namespace)
            .finish()
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct SecretsConfig {
    pub backend: SecretsBackend,
    pub env_prefix: String,
    pub vault: Option<VaultConfig>,
    /// Secret names injected into every container as environment.
    pub inject: Vec<String>,
}

/// Complete subsystem configuration.
#[derive(Debug, Clone, PartialEq)]
pub struct Config {
    pub pool: PoolConfig,
    pub secrets: SecretsConfig,
}

impl Default for Config {
    fn default() -> Self {
        default_config()
    }
}

/// The fixed defaults every partial configuration is layered on.
pub fn default_config() -> Config {
    Config {
        pool: PoolConfig {
            min_idle: 3,
            max_total: 20,
            idle_timeout: Duration::from_millis(300_000),
            acquire_timeout: Duration::from_millis(30_000),
            health_check_interval: Duration::from_millis(30_000),
            image: "python:3.12-slim".to_string(),
            resources: ResourceLimits {
                memory: 536_870_912,
                cpu_quota: 0.5,
                pids_limit: 100,
                max_execution_time: Duration::from_millis(30_000),
            },
            placement: PlacementStrategy {
                kind: PlacementKind::Local,
                local_weight: 0.5,
                local_labels: HashMap::new(),
                remote_endpoints: Vec::new(),
            },
            network: NetworkPolicy::default(),
        },
        secrets: SecretsConfig {
            backend: SecretsBackend::Env,
            env_prefix: DEFAULT_SECRET_PREFIX.to_string(),
            vault: None,
            inject: Vec::new(),
        },
    }
}

// ── Partial configuration ──────────────────────────────────────────

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct PartialConfig {
    pub pool: PartialPoolConfig,
    pub secrets: PartialSecretsConfig,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct PartialPoolConfig {
    pub min_idle: Option<i64>,
    pub max_total: Option<i64>,
    pub idle_timeout_ms: Option<i64>,
    pub acquire_timeout_ms: Option<i64>,
    pub health_check_interval_ms: Option<i64>,
    pub image: Option<String>,
    pub resources: Option<PartialResources>,
    pub placement: Option<PartialPlacement>,
    pub network: Option<PartialNetwork>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct PartialResources {
    pub memory: Option<i64>,
    pub cpu_quota: Option<f64>,
    pub pids_limit: Option<i64>,
    pub max_execution_time_ms: Option<i64>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct PartialPlacement {
    pub kind: Option<PlacementKind>,
    pub local_weight: Option<f64>,
    pub local_labels: Option<HashMap<String, String>>,
    pub remote_endpoints: Option<Vec<RemoteEndpointConfig>>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct PartialNetwork {
    pub mode: Option<NetworkMode>,
    pub allowed_hosts: Option<Vec<String>>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct PartialSecretsConfig {
    pub backend: Option<SecretsBackend>,
    pub env_prefix: Option<String>,
    pub vault: Option<VaultConfig>,
    pub inject: Option<Vec<String>>,
}

impl From<&Config> for PartialConfig {
    fn from(config: &Config) -> Self {
        let pool = &config.pool;
        let secrets = &config.secrets;
        PartialConfig {
            pool: PartialPoolConfig {
                min_idle: Some(i64::from(pool.min_idle)),
                max_total: Some(i64::from(pool.max_total)),
                idle_timeout_ms: Some(duration_ms(pool.idle_timeout)),
                acquire_timeout_ms: Some(duration_ms(pool.acquire_timeout)),
                health_check_interval_ms: Some(duration_ms(pool.health_check_interval)),
                image: Some(pool.image.clone()),
                resources: Some(PartialResources {
                    memory: Some(i64::try_from(pool.resources.memory).unwrap_or(i64::MAX)),
                    cpu_quota: Some(pool.resources.cpu_quota),
                    pids_limit: Some(i64::from(pool.resources.pids_limit)),
                    max_execution_time_ms: Some(duration_ms(pool.resources.max_execution_time)),
                }),
                placement: Some(PartialPlacement {
                    kind: Some(pool.placement.kind),
                    local_weight: Some(pool.placement.local_weight),
                    local_labels: Some(pool.placement.local_labels.clone()),
                    remote_endpoints: Some(pool.placement.remote_endpoints.clone()),
                }),
                network: Some(PartialNetwork {
                    mode: Some(pool.network.mode),
                    allowed_hosts: Some(pool.network.allowed_hosts.clone()),
                }),
            },
            secrets: PartialSecretsConfig {
                backend: Some(secrets.backend),
                env_prefix: Some(secrets.env_prefix.clone()),
                vault: secrets.vault.clone(),
                inject: Some(secrets.inject.clone()),
            },
        }
    }
}

impl PartialConfig {
    /// Parse a TOML document.
    pub fn from_toml_str(content: &str) -> Result<Self, ConfigError> {
        toml::from_str(content).map_err(|e| ConfigError::Parse(e.to_string()))
    }

    /// Layer `other` on top of `self`; fields set in `other` win.
    pub fn overlay(self, other: PartialConfig) -> PartialConfig {
        PartialConfig {
            pool: self.pool.overlay(other.pool),
            secrets: PartialSecretsConfig {
                backend: other.secrets.backend.or(self.secrets.backend),
                env_prefix: other.secrets.env_prefix.or(self.secrets.env_prefix),
                vault: other.secrets.vault.or(self.secrets.vault),
                inject: other.secrets.inject.or(self.secrets.inject),
            },
        }
    }

    /// Overlay this partial on the defaults, validate, and build a [`Config`].
    ///
    /// Returns the collected validation errors when the merged result is
    /// invalid.
    pub fn resolve(self) -> Result<Config, Validation> {
        let merged = PartialConfig::from(&default_config()).overlay(self);
        let validation = validate_config(&merged);
        if !validation.valid {
            return Err(validation);
        }
        Ok(merged.build())
    }

    // Every field is populated after overlaying on the defaults; the
    // fallbacks only guard against a caller skipping that step.
    fn build(self) -> Config {
        let defaults = default_config();
        let pool = self.pool;
        let resources = pool.resources.unwrap_or_default();
        let placement = pool.placement.unwrap_or_default();
        let network = pool.network.unwrap_or_default();
        let d = &defaults.pool;

        Config {
            pool: PoolConfig {
                min_idle: pool.min_idle.map_or(d.min_idle, to_u32),
                max_total: pool.max_total.map_or(d.max_total, to_u32),
                idle_timeout: pool.idle_timeout_ms.map_or(d.idle_timeout, to_duration),
                acquire_timeout: pool.acquire_timeout_ms.map_or(d.acquire_timeout, to_duration),
                health_check_interval: pool
                    .health_check_interval_ms
                    .map_or(d.health_check_interval, to_duration),
                image: pool.image.unwrap_or_else(|| d.image.clone()),
                resources: ResourceLimits {
                    memory: resources
                        .memory
                        .map_or(d.resources.memory, |v| u64::try_from(v).unwrap_or(0)),
                    cpu_quota: resources.cpu_quota.unwrap_or(d.resources.cpu_quota),
                    pids_limit: resources.pids_limit.map_or(d.resources.pids_limit, to_u32),
                    max_execution_time: resources
                        .max_execution_time_ms
                        .map_or(d.resources.max_execution_time, to_duration),
                },
                placement: PlacementStrategy {
                    kind: placement.kind.unwrap_or(d.placement.kind),
                    local_weight: placement.local_weight.unwrap_or(d.placement.local_weight),
                    local_labels: placement.local_labels.unwrap_or_default(),
                    remote_endpoints: placement.remote_endpoints.unwrap_or_default(),
                },
                network: NetworkPolicy {
                    mode: network.mode.unwrap_or_default(),
                    allowed_hosts: network.allowed_hosts.unwrap_or_default(),
                },
            },
            secrets: SecretsConfig {
                backend: self.secrets.backend.unwrap_or_default(),
                env_prefix: self
                    .secrets
                    .env_prefix
                    .unwrap_or_else(|| DEFAULT_SECRET_PREFIX.to_string()),
                vault: self.secrets.vault,
                inject: self.secrets.inject.unwrap_or_default(),
            },
        }
    }
}

impl PartialPoolConfig {
    fn overlay(self, other: PartialPoolConfig) -> PartialPoolConfig {
        PartialPoolConfig {
            min_idle: other.min_idle.or(self.min_idle),
            max_total: other.max_total.or(self.max_total),
            idle_timeout_ms: other.idle_timeout_ms.or(self.idle_timeout_ms),
            acquire_timeout_ms: other.acquire_timeout_ms.or(self.acquire_timeout_ms),
            health_check_interval_ms: other
                .health_check_interval_ms
                .or(self.health_check_interval_ms),
            image: other.image.or(self.image),
            resources: merge_nested(self.resources, other.resources, |base, top| {
                PartialResources {
                    memory: top.memory.or(base.memory),
                    cpu_quota: top.cpu_quota.or(base.cpu_quota),
                    pids_limit: top.pids_limit.or(base.pids_limit),
                    max_execution_time_ms: top.max_execution_time_ms.or(base.max_execution_time_ms),
                }
            }),
            placement: merge_nested(self.placement, other.placement, |base, top| {
                PartialPlacement {
                    kind: top.kind.or(base.kind),
                    local_weight: top.local_weight.or(base.local_weight),
                    local_labels: top.local_labels.or(base.local_labels),
                    remote_endpoints: top.remote_endpoints.or(base.remote_endpoints),
                }
            }),
            network: merge_nested(self.network, other.network, |base, top| PartialNetwork {
                mode: top.mode.or(base.mode),
                allowed_hosts: top.allowed_hosts.or(base.allowed_hosts),
            }),
        }
    }
}

fn merge_nested<T>(base: Option<T>, top: Option<T>, merge: impl FnOnce(T, T) -> T) -> Option<T> {
    match (base, top) {
        (Some(b), Some(t)) => Some(merge(b, t)),
        (b, t) => t.or(b),
    }
}

fn duration_ms(d: Duration) -> i64 {
    i64::try_from(d.as_millis()).unwrap_or(i64::MAX)
}

fn to_duration(ms: i64) -> Duration {
    Duration::from_millis(u64::try_from(ms).unwrap_or(0))
}

fn to_u32(v: i64) -> u32 {
    u32::try_from(v.max(0)).unwrap_or(u32::MAX)
}

// ── Loading ────────────────────────────────────────────────────────

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to read config file {path}: {message}")]
    Io { path: String, message: String },

    #[error("failed to parse config: {0}")]
    Parse(String),

    #[error("invalid configuration: {}", .0.errors.join("; "))]
    Invalid(Validation),
}

/// Read a TOML file, apply environment overrides, and resolve it.
pub fn load_config(path: &Path) -> Result<Config, ConfigError> {
    let content = std::fs::read_to_string(path).map_err(|e| ConfigError::Io {
        path: path.display().to_string(),
        message: e.to_string(),
    })?;
    let mut partial = PartialConfig::from_toml_str(&content)?;
    apply_env_overrides(&mut partial);
    debug!(path = %path.display(), "configuration file loaded");
    partial.resolve().map_err(ConfigError::Invalid)
}

/// Apply `LIQUID_*` and `VAULT_*` process environment overrides.
pub fn apply_env_overrides(partial: &mut PartialConfig) {
    apply_overrides_from(partial, |key| std::env::var(key).ok());
}

/// Apply overrides using an arbitrary variable lookup.
///
/// Unparseable numeric values are logged and ignored.
pub fn apply_overrides_from(partial: &mut PartialConfig, lookup: impl Fn(&str) -> Option<String>) {
    let number = |key: &str| -> Option<i64> {
        let raw = lookup(key)?;
        match raw.trim().parse::<i64>() {
            Ok(v) => Some(v),
            Err(_) => {
                warn!(variable = key, value = %raw, "ignoring non-numeric override");
                None
            }
        }
    };

    if let Some(v) = number("LIQUID_MIN_IDLE") {
        partial.pool.min_idle = Some(v);
    }
    if let Some(v) = number("LIQUID_MAX_TOTAL") {
        partial.pool.max_total = Some(v);
    }
    if let Some(image) = lookup("LIQUID_IMAGE") {
        partial.pool.image = Some(image);
    }
    if let Some(backend) = lookup("LIQUID_SECRETS_BACKEND") {
        match backend.trim().to_ascii_lowercase().as_str() {
            "env" => partial.secrets.backend = Some(SecretsBackend::Env),
            "vault" => partial.secrets.backend = Some(SecretsBackend::Vault),
            other => warn!(value = %other, "ignoring unknown secrets backend override"),
        }
    }

    let addr = lookup("VAULT_ADDR");
    let token = lookup("VAULT_TOKEN");
    if addr.is_some() || token.is_some() {
        let vault = partial
            .secrets
            .vault
            .get_or_insert_with(|| VaultConfig::new(String::new(), None));
        if let Some(addr) = addr {
            vault.address = addr;
        }
        if token.is_some() {
            vault.token = token;
        }
    }
}
