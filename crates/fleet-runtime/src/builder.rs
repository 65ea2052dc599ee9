//! Builder contract.

use async_trait::async_trait;

use fleet_core::{CreateOptions, Service};

use crate::error::BuildError;

/// Output of a build: a reference the execution backend can run.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Artifact {
    pub reference: String,
}

impl Artifact {
    pub fn new(reference: impl Into<String>) -> Self {
        Self {
            reference: reference.into(),
        }
    }
}

/// Compiles or packages a service's resolved source.
///
/// When a builder is configured the control plane builds asynchronously and
/// runs the artifact; without one, services run straight from source.
#[async_trait]
pub trait Builder: Send + Sync {
    async fn build(&self, service: &Service, options: &CreateOptions)
    -> Result<Artifact, BuildError>;

    fn name(&self) -> &str;
}
