//! The provider interface and the redacting secret value type.

use async_trait::async_trait;

use crate::error::{SecretsError, SecretsResult};

/// A secret value that never prints its contents.
///
/// `Debug` and `Display` render `***`; the raw value is only reachable via
/// [`SecretValue::expose`], which callers use at the point of injection.
#[derive(Clone, PartialEq, Eq)]
pub struct SecretValue(String);

impl SecretValue {
    pub fn new(value: impl Into<String>) -> Self {
        Self(value.into())
    }

    /// The raw secret. Never pass the result to a log macro.
    pub fn expose(&self) -> &str {
        &self.0
    }
}

impl std::fmt::Debug for SecretValue {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str("SecretValue(***)")
    }
}

impl std::fmt::Display for SecretValue {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str("***")
    }
}

/// Source of secret values injected into container environments.
#[async_trait]
pub trait SecretsProvider: Send + Sync {
    /// Fetch a secret by name. Fails with [`SecretsError::NotFound`] if absent.
    async fn get_secret(&self, name: &str) -> SecretsResult<SecretValue>;

    /// Whether the secret exists. Backend failures are still errors.
    async fn has_secret(&self, name: &str) -> SecretsResult<bool> {
        match self.get_secret(name).await {
            Ok(_) => Ok(true),
            Err(SecretsError::NotFound(_)) => Ok(false),
            Err(e) => Err(e),
        }
    }

    /// Names of all secrets visible to this provider.
    async fn list_secrets(&self) -> SecretsResult<Vec<String>>;

    /// Short backend name for log fields.
    fn backend(&self) -> &'static str;
}

/// Environment variable name a secret is injected under.
///
/// `api-key` → `API_KEY`.
pub fn env_var_name(secret_name: &str) -> String {
    secret_name.to_uppercase().replace('-', "_")
}

/// Resolve `names` into `(ENV_NAME, value)` pairs for container injection.
///
/// The first missing secret aborts resolution.
pub async fn resolve_secrets(
    provider: &dyn SecretsProvider,
    names: &[String],
) -> SecretsResult<Vec<(String, SecretValue)>> {
    let mut resolved = Vec::with_capacity(names.len());
    for name in names {
        let value = provider.get_secret(name).await?;
        resolved.push((env_var_name(name), value));
    }
    tracing::debug!(
        backend = provider.backend(),
        count = resolved.len(),
        "secrets resolved for injection"
    );
    Ok(resolved)
}

/// Replace every occurrence of a secret value in `text` with `***`.
///
/// Used on workload output before it reaches logs or events.
pub fn redact(text: &str, secrets: &[SecretValue]) -> String {
    let mut out = text.to_string();
    for secret in secrets {
        if !secret.expose().is_empty() {
            out = out.replace(secret.expose(), "***");
        }
    }
    out
}
