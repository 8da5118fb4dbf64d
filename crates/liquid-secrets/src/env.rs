//! Environment-variable secrets backend.
//!
//! A secret named `api-key` is read from `LIQUID_SECRET_API_KEY`.

use std::collections::HashMap;

use async_trait::async_trait;
use tracing::debug;

use liquid_core::DEFAULT_SECRET_PREFIX;

use crate::error::{SecretsError, SecretsResult};
use crate::provider::{SecretValue, SecretsProvider};

enum EnvSource {
    Process,
    Fixed(HashMap<String, String>),
}

pub struct EnvSecretsProvider {
    prefix: String,
    source: EnvSource,
}

impl EnvSecretsProvider {
    /// Read from the process environment with the default prefix.
    pub fn new() -> Self {
        Self::with_prefix(DEFAULT_SECRET_PREFIX)
    }

    /// Read from the process environment with a custom prefix.
    pub fn with_prefix(prefix: impl Into<String>) -> Self {
        Self {
            prefix: prefix.into(),
            source: EnvSource::Process,
        }
    }

    /// Read from a fixed variable set instead of the process environment.
    pub fn from_vars<I, K, V>(prefix: impl Into<String>, vars: I) -> Self
    where
        I: IntoIterator<Item = (K, V)>,
        K: Into<String>,
        V: Into<String>,
    {
        Self {
            prefix: prefix.into(),
            source: EnvSource::Fixed(
                vars.into_iter()
                    .map(|(k, v)| (k.into(), v.into()))
                    .collect(),
            ),
        }
    }

    pub fn prefix(&self) -> &str {
        &self.prefix
    }

    /// `api-key` → `<PREFIX>API_KEY`.
    pub fn variable_name(&self, name: &str) -> String {
        format!("{}{}", self.prefix, name.to_uppercase().replace('-', "_"))
    }

    /// `<PREFIX>API_KEY` → `api-key`, or `None` if the prefix does not match.
    fn secret_name(&self, variable: &str) -> Option<String> {
        let rest = variable.strip_prefix(&self.prefix)?;
        if rest.is_empty() {
            return None;
        }
        Some(rest.to_lowercase().replace('_', "-"))
    }

    fn lookup(&self, variable: &str) -> Option<String> {
        match &self.source {
            EnvSource::Process => std::env::var(variable).ok(),
            EnvSource::Fixed(vars) => vars.get(variable).cloned(),
        }
    }

    fn variables(&self) -> Vec<String> {
        match &self.source {
            EnvSource::Process => std::env::vars_os()
                .filter_map(|(k, _)| k.into_string().ok())
                .collect(),
            EnvSource::Fixed(vars) => vars.keys().cloned().collect(),
        }
    }
}

impl Default for EnvSecretsProvider {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl SecretsProvider for EnvSecretsProvider {
    async fn get_secret(&self, name: &str) -> SecretsResult<SecretValue> {
        let variable = self.variable_name(name);
        match self.lookup(&variable) {
            Some(value) => {
                debug!(secret = %name, %variable, "secret resolved from environment");
                Ok(SecretValue::new(value))
            }
            None => Err(SecretsError::NotFound(name.to_string())),
        }
    }

    async fn list_secrets(&self) -> SecretsResult<Vec<String>> {
        let mut names: Vec<String> = self
            .variables()
            .iter()
            .filter_map(|v| self.secret_name(v))
            .collect();
        names.sort();
        names.dedup();
        Ok(names)
    }

    fn backend(&self) -> &'static str {
        "env"
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn provider() -> EnvSecretsProvider {
        EnvSecretsProvider::from_vars(
            DEFAULT_SECRET_PREFIX,
            [
                ("LIQUID_SECRET_API_KEY", "test-api-key"),
                ("LIQUID_SECRET_DB_PASSWORD", "pw"),
                ("PATH", "/usr/bin"),
            ],
        )
    }

    #[test]
    fn variable_name_transform() {
        let p = EnvSecretsProvider::new();
        assert_eq!(p.variable_name("api-key"), "LIQUID_SECRET_API_KEY");
        assert_eq!(p.variable_name("Db-Password"), "LIQUID_SECRET_DB_PASSWORD");
    }

    #[tokio::test]
    async fn get_existing_secret() {
        let value = provider().get_secret("api-key").await.unwrap();
        assert_eq!(value.expose(), "test-api-key");
    }

    #[tokio::test]
    async fn missing_secret_is_not_found() {
        let p = provider();
        let err = p.get_secret("missing").await.unwrap_err();
        assert!(matches!(err, SecretsError::NotFound(ref n) if n == "missing"));
        assert!(!p.has_secret("missing").await.unwrap());
        assert!(p.has_secret("db-password").await.unwrap());
    }

    #[tokio::test]
    async fn list_reverses_the_transform() {
        let names = provider().list_secrets().await.unwrap();
        assert_eq!(names, vec!["api-key".to_string(), "db-password".to_string()]);
    }

    #[tokio::test]
    async fn custom_prefix() {
        let p = EnvSecretsProvider::from_vars(
            "APP_",
            [("APP_TOKEN", "t"), ("LIQUID_SECRET_TOKEN", "other")],
        );
        assert_eq!(p.get_secret("token").await.unwrap().expose(), "t");
        assert_eq!(p.list_secrets().await.unwrap(), vec!["token".to_string()]);
    }

    #[tokio::test]
    async fn bare_prefix_is_not_a_secret() {
        let p = EnvSecretsProvider::from_vars(DEFAULT_SECRET_PREFIX, [("LIQUID_SECRET_", "x")]);
        assert!(p.list_secrets().await.unwrap().is_empty());
    }
}
