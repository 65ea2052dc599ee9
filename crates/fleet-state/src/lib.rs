//! fleet-state — durable desired state for Fleet.
//!
//! Backed by [redb](https://docs.rs/redb), the [`StateStore`] persists one
//! [`ServiceRecord`] per `(namespace, name, version)`. Blob stores hold
//! source archives and build artifacts referenced by those records.
//!
//! The `StateStore` is `Clone` + `Send` + `Sync` (backed by `Arc<Database>`)
//! and can be shared across async tasks.

pub mod blob;
pub mod error;
pub mod store;
pub mod tables;
pub mod types;

pub use blob::{BlobStore, FsBlobStore, MemoryBlobStore};
pub use error::{StateError, StateResult};
pub use store::{RecordStore, StateStore};
pub use types::*;
