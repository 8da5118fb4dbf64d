//! liquid-core: shared types and configuration for the Liquid container
//! subsystem.
//!
//! - **`config`**: typed [`Config`], [`PartialConfig`] overlays, TOML and
//!   environment loading
//! - **`validate`**: invariant checks that collect errors instead of failing
//! - **`types`**: remote endpoint config, affinity rules, daemon urls
//! - **`format`**: display helpers for sizes and durations

pub mod config;
pub mod format;
pub mod types;
pub mod validate;

pub use config::{
    Config, ConfigError, DEFAULT_SECRET_PREFIX, NetworkMode, NetworkPolicy, PartialConfig,
    PartialNetwork, PartialPlacement, PartialPoolConfig, PartialResources, PartialSecretsConfig,
    PlacementKind, PlacementStrategy, PoolConfig, ResourceLimits, SecretsBackend, SecretsConfig,
    VaultConfig, apply_env_overrides, apply_overrides_from, default_config, load_config,
};
pub use format::{format_bytes, format_duration};
pub use types::{
    AffinityOperator, AffinityRule, DEFAULT_DOCKER_PORT, LOCAL_ENDPOINT_ID, RemoteEndpointConfig,
    SshConfig, matches_all, parse_tcp_url,
};
pub use validate::{Validation, validate_config};
