//! liquid-secrets: secret sources for container environment injection.
//!
//! Two backends sit behind [`SecretsProvider`]: process environment
//! variables ([`EnvSecretsProvider`]) and Vault KV v2 over HTTP
//! ([`VaultSecretsProvider`]). Values travel as [`SecretValue`], which
//! redacts itself in `Debug` and `Display`.

pub mod env;
pub mod error;
pub mod factory;
pub mod provider;
pub mod vault;

pub use env::EnvSecretsProvider;
pub use error::{SecretsError, SecretsResult};
pub use factory::create_secrets_provider;
pub use provider::{SecretValue, SecretsProvider, env_var_name, redact, resolve_secrets};
pub use vault::VaultSecretsProvider;
