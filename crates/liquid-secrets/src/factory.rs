//! Backend dispatch from configuration.

use std::sync::Arc;

use tracing::info;

use liquid_core::{SecretsBackend, SecretsConfig};

use crate::env::EnvSecretsProvider;
use crate::error::{SecretsError, SecretsResult};
use crate::provider::SecretsProvider;
use crate::vault::VaultSecretsProvider;

/// Build the provider selected by `config.backend`.
pub fn create_secrets_provider(config: &SecretsConfig) -> SecretsResult<Arc<dyn SecretsProvider>> {
    let provider: Arc<dyn SecretsProvider> = match config.backend {
        SecretsBackend::Env => Arc::new(EnvSecretsProvider::with_prefix(&config.env_prefix)),
        SecretsBackend::Vault => {
            let vault = config.vault.clone().ok_or_else(|| {
                SecretsError::Config("secrets.vault is required for the vault backend".into())
            })?;
            Arc::new(VaultSecretsProvider::new(vault)?)
        }
    };
    info!(backend = provider.backend(), "secrets provider initialized");
    Ok(provider)
}
