//! HashiCorp Vault KV v2 secrets backend over HTTP.

use std::collections::HashMap;
use std::time::Duration;

use async_trait::async_trait;
use reqwest::header::{HeaderMap, HeaderValue};
use reqwest::{Client, Method, StatusCode};
use serde::Deserialize;
use tracing::{debug, warn};

use liquid_core::VaultConfig;

use crate::error::{SecretsError, SecretsResult};
use crate::provider::{SecretValue, SecretsProvider};

const DEFAULT_MAX_ATTEMPTS: u32 = 3;
const DEFAULT_INITIAL_BACKOFF: Duration = Duration::from_millis(100);
const SECRET_FIELD: &str = "value";

#[derive(Debug, Deserialize)]
struct KvReadResponse {
    data: KvReadData,
}

#[derive(Debug, Deserialize)]
struct KvReadData {
    data: Option<HashMap<String, serde_json::Value>>,
}

#[derive(Debug, Deserialize)]
struct KvListResponse {
    data: KvListData,
}

#[derive(Debug, Deserialize)]
struct KvListData {
    #[serde(default)]
    keys: Vec<String>,
}

pub struct VaultSecretsProvider {
    client: Client,
    address: String,
    mount: String,
    path_prefix: String,
    headers: HeaderMap,
    max_attempts: u32,
    initial_backoff: Duration,
}

impl std::fmt::Debug for VaultSecretsProvider {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("VaultSecretsProvider")
            .field("address", &self.address)
            .field("mount", &self.mount)
            .field("path_prefix", &self.path_prefix)
            .finish_non_exhaustive()
    }
}

impl VaultSecretsProvider {
    /// Build a provider. Fails without touching the network if the token is
    /// absent or the address is not http(s).
    pub fn new(config: VaultConfig) -> SecretsResult<Self> {
        let token = config
            .token
            .as_deref()
            .filter(|t| !t.is_empty())
            .ok_or(SecretsError::MissingToken)?;

        let address = config.address.trim_end_matches('/').to_string();
        if !address.starts_with("http://") && !address.starts_with("https://") {
            return Err(SecretsError::Config(format!(
                "invalid vault address '{address}': must start with http:// or https://"
            )));
        }

        let mut headers = HeaderMap::new();
        let token = HeaderValue::from_str(token)
            .map_err(|_| SecretsError::Config("vault token is not a valid header value".into()))?;
        headers.insert("X-Vault-Token", token);
        if let Some(ns) = config.namespace.as_deref() {
            let ns = HeaderValue::from_str(ns).map_err(|_| {
                SecretsError::Config("vault namespace is not a valid header value".into())
            })?;
            headers.insert("X-Vault-Namespace", ns);
        }

        let client = Client::builder()
            .timeout(Duration::from_secs(30))
            .connect_timeout(Duration::from_secs(10))
            .build()
            .map_err(|e| SecretsError::Config(format!("failed to build http client: {e}")))?;

        Ok(Self {
            client,
            address,
            mount: config.mount.trim_matches('/').to_string(),
            path_prefix: config.path_prefix.trim_matches('/').to_string(),
            headers,
            max_attempts: DEFAULT_MAX_ATTEMPTS,
            initial_backoff: DEFAULT_INITIAL_BACKOFF,
        })
    }

    /// Override the retry policy for transient failures.
    pub fn with_retry(mut self, max_attempts: u32, initial_backoff: Duration) -> Self {
        self.max_attempts = max_attempts.max(1);
        self.initial_backoff = initial_backoff;
        self
    }

    fn data_url(&self, name: &str) -> String {
        if self.path_prefix.is_empty() {
            format!("{}/v1/{}/data/{}", self.address, self.mount, name)
        } else {
            format!(
                "{}/v1/{}/data/{}/{}",
                self.address, self.mount, self.path_prefix, name
            )
        }
    }

    fn metadata_url(&self) -> String {
        format!(
            "{}/v1/{}/metadata/{}",
            self.address, self.mount, self.path_prefix
        )
    }

    /// Send a request, retrying 5xx responses and transport errors with
    /// exponential backoff. Any other status is returned to the caller.
    async fn send_with_retry(&self, method: Method, url: &str) -> SecretsResult<reqwest::Response> {
        let mut backoff = self.initial_backoff;
        let mut last_error = None;

        for attempt in 1..=self.max_attempts {
            let result = self
                .client
                .request(method.clone(), url)
                .headers(self.headers.clone())
                .send()
                .await;

            match result {
                Ok(resp) if !resp.status().is_server_error() => return Ok(resp),
                Ok(resp) => {
                    last_error = Some(SecretsError::Backend(format!(
                        "vault returned {}",
                        resp.status()
                    )));
                }
                Err(e) => {
                    last_error = Some(SecretsError::Backend(format!("vault request failed: {e}")));
                }
            }

            if attempt < self.max_attempts {
                debug!(attempt, backoff_ms = backoff.as_millis() as u64, %method, "vault request failed, retrying");
                tokio::time::sleep(backoff).await;
                backoff *= 2;
            }
        }

        let err = last_error
            .unwrap_or_else(|| SecretsError::Backend("all retry attempts exhausted".into()));
        warn!(attempts = self.max_attempts, error = %err, "vault request gave up");
        Err(err)
    }
}

fn status_error(status: StatusCode, name: &str) -> SecretsError {
    match status {
        StatusCode::NOT_FOUND => SecretsError::NotFound(name.to_string()),
        StatusCode::UNAUTHORIZED | StatusCode::FORBIDDEN => {
            SecretsError::Auth(format!("vault returned {status}"))
        }
        other => SecretsError::Backend(format!("unexpected vault status {other}")),
    }
}

#[async_trait]
impl SecretsProvider for VaultSecretsProvider {
    async fn get_secret(&self, name: &str) -> SecretsResult<SecretValue> {
        let url = self.data_url(name);
        debug!(secret = %name, "reading secret from vault");

        let resp = self.send_with_retry(Method::GET, &url).await?;
        let status = resp.status();
        if !status.is_success() {
            return Err(status_error(status, name));
        }

        let body: KvReadResponse = resp
            .json()
            .await
            .map_err(|e| SecretsError::InvalidResponse(format!("failed to parse vault response: {e}")))?;

        match body.data.data.as_ref().and_then(|d| d.get(SECRET_FIELD)) {
            Some(serde_json::Value::String(s)) => Ok(SecretValue::new(s.clone())),
            Some(other) => Ok(SecretValue::new(other.to_string())),
            None => Err(SecretsError::InvalidResponse(format!(
                "secret '{name}' has no '{SECRET_FIELD}' field"
            ))),
        }
    }

    async fn list_secrets(&self) -> SecretsResult<Vec<String>> {
        let list = Method::from_bytes(b"LIST")
            .map_err(|e| SecretsError::Config(format!("invalid http method: {e}")))?;
        let resp = self.send_with_retry(list, &self.metadata_url()).await?;
        let status = resp.status();
        if status == StatusCode::NOT_FOUND {
            return Ok(Vec::new());
        }
        if !status.is_success() {
            return Err(status_error(status, &self.path_prefix));
        }

        let body: KvListResponse = resp
            .json()
            .await
            .map_err(|e| SecretsError::InvalidResponse(format!("failed to parse vault list: {e}")))?;

        let mut names: Vec<String> = body
            .data
            .keys
            .into_iter()
            .filter(|k| !k.ends_with('/'))
            .collect();
        names.sort();
        Ok(names)
    }

    fn backend(&self) -> &'static str {
        "vault"
    }
}
