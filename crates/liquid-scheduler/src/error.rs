//! Scheduler error types.

use thiserror::Error;

/// Errors surfaced by placement and registry changes.
///
/// Bookkeeping calls (`record_*`) never return these.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum SchedulerError {
    #[error("no endpoint available: {0}")]
    EndpointUnavailable(String),

    #[error("endpoint already registered: {0}")]
    DuplicateEndpoint(String),

    #[error("endpoint not found: {0}")]
    UnknownEndpoint(String),
}

pub type SchedulerResult<T> = Result<T, SchedulerError>;
