//! Runtime and builder error types.

use thiserror::Error;

pub type RuntimeResult<T> = Result<T, RuntimeError>;

/// Closed set of outcomes every execution backend maps its native errors onto.
///
/// `AlreadyExists` and `NotFound` are distinguishable so callers can treat
/// them as non-fatal where appropriate.
#[derive(Debug, Error)]
pub enum RuntimeError {
    #[error("service already exists: {0}")]
    AlreadyExists(String),

    #[error("service not found: {0}")]
    NotFound(String),

    #[error("invalid service: {0}")]
    InvalidService(String),

    #[error("backend error: {0}")]
    Backend(#[from] anyhow::Error),
}

impl RuntimeError {
    pub fn is_already_exists(&self) -> bool {
        matches!(self, RuntimeError::AlreadyExists(_))
    }

    pub fn is_not_found(&self) -> bool {
        matches!(self, RuntimeError::NotFound(_))
    }
}

/// Errors reported by a builder.
#[derive(Debug, Error)]
pub enum BuildError {
    #[error("build failed: {0}")]
    Failed(String),

    #[error("unsupported build target: {0}")]
    UnsupportedTarget(String),
}
