//! Secrets error types.

use thiserror::Error;

pub type SecretsResult<T> = Result<T, SecretsError>;

#[derive(Debug, Error)]
pub enum SecretsError {
    #[error("secret not found: {0}")]
    NotFound(String),

    #[error("Vault token required")]
    MissingToken,

    #[error("secrets configuration error: {0}")]
    Config(String),

    #[error("secrets backend authentication failed: {0}")]
    Auth(String),

    #[error("secrets backend request failed: {0}")]
    Backend(String),

    #[error("invalid secrets backend response: {0}")]
    InvalidResponse(String),
}
