//! fleet-runtime — execution backends for Fleet service units.
//!
//! The [`Runtime`] trait is the contract every backend implements: create,
//! read, update and delete service instances, plus start/stop of the backend
//! itself. Backends report live status; the control plane owns desired state.
//!
//! # Architecture
//!
//! ```text
//! CachedRuntime (read-through, TTL + LRU bounded)
//!   └── dyn Runtime
//!       ├── ProcessRuntime (one child process per service)
//!       └── MemoryRuntime  (in-process bookkeeping, test profile)
//! ```
//!
//! The optional [`Builder`] turns a service's source into a runnable
//! [`Artifact`] before it is handed to a backend.

pub mod builder;
pub mod cache;
pub mod error;
pub mod memory;
pub mod process;

use async_trait::async_trait;

use fleet_core::{CreateOptions, DeleteOptions, ReadOptions, Service, UpdateOptions};

pub use builder::{Artifact, Builder};
pub use cache::{CacheConfig, CachedRuntime};
pub use error::{BuildError, RuntimeError, RuntimeResult};
pub use memory::MemoryRuntime;
pub use process::ProcessRuntime;

/// An execution backend for service units.
///
/// Options arrive with their namespace already resolved.
#[async_trait]
pub trait Runtime: Send + Sync {
    /// Start an instance of `service`. Fails with
    /// [`RuntimeError::AlreadyExists`] if one exists.
    async fn create(&self, service: &Service, options: &CreateOptions) -> RuntimeResult<()>;

    /// Live instances matching the filter, with backend-reported status.
    async fn read(&self, options: &ReadOptions) -> RuntimeResult<Vec<Service>>;

    /// Replace a running instance with one built from `service.source`.
    async fn update(&self, service: &Service, options: &UpdateOptions) -> RuntimeResult<()>;

    /// Stop and forget an instance. Fails with [`RuntimeError::NotFound`] if
    /// there is none.
    async fn delete(&self, service: &Service, options: &DeleteOptions) -> RuntimeResult<()>;

    async fn start(&self) -> RuntimeResult<()>;

    async fn stop(&self) -> RuntimeResult<()>;

    fn name(&self) -> &str;
}
