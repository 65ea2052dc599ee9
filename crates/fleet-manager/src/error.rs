//! Manager error types.

use thiserror::Error;

use fleet_core::{SourceError, ValidationError};
use fleet_runtime::{BuildError, RuntimeError};
use fleet_state::StateError;

/// Errors returned by the service manager's synchronous paths.
///
/// Failures inside background builds never surface here; they are recorded
/// on the service record instead.
#[derive(Debug, Error)]
pub enum ManagerError {
    #[error("service not found: {0}")]
    NotFound(String),

    #[error("invalid service: {0}")]
    InvalidService(#[from] ValidationError),

    #[error("source error: {0}")]
    Source(#[from] SourceError),

    #[error("state store error: {0}")]
    State(#[from] StateError),

    #[error("runtime error: {0}")]
    Runtime(#[from] RuntimeError),

    #[error("build error: {0}")]
    Build(#[from] BuildError),
}

pub type ManagerResult<T> = Result<T, ManagerError>;

impl From<ManagerError> for RuntimeError {
    fn from(err: ManagerError) -> Self {
        match err {
            ManagerError::NotFound(key) => RuntimeError::NotFound(key),
            ManagerError::InvalidService(e) => RuntimeError::InvalidService(e.to_string()),
            ManagerError::Runtime(e) => e,
            other => RuntimeError::Backend(anyhow::Error::new(other)),
        }
    }
}
