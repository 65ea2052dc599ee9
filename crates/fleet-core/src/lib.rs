//! fleet-core — types shared by every Fleet crate.
//!
//! Holds the service description ([`Service`]), its lifecycle status, the
//! option sets taken by create/read/update/delete, source reference parsing,
//! and the `fleet.toml` configuration.

pub mod config;
pub mod options;
pub mod source;
pub mod types;

pub use config::{DEFAULT_NAMESPACE, FleetConfig};
pub use options::{CreateOptions, DeleteOptions, Namespaced, ReadOptions, UpdateOptions};
pub use source::{SourceError, SourceRef};
pub use types::*;
