//! fleet-manager — the Fleet service manager.
//!
//! [`Manager`] keeps a durable record of every service's desired state in a
//! [`RecordStore`](fleet_state::RecordStore) and drives an execution backend
//! ([`Runtime`](fleet_runtime::Runtime)) to match it:
//!
//! - **create / update / delete** persist intent first, then act on the
//!   backend, synchronously or through a background build when a
//!   [`Builder`](fleet_runtime::Builder) is configured;
//! - **read** merges stored records with the backend's live status;
//! - **reconciliation** periodically recreates services that should be
//!   running but are not.
//!
//! The manager implements `Runtime` itself, so callers can treat it as a
//! durable, reconciled backend.

pub mod config;
pub mod error;
pub mod manager;
pub mod reconcile;
pub mod source;
pub mod tasks;

pub use config::{MIN_RECONCILE_INTERVAL, ManagerConfig};
pub use error::{ManagerError, ManagerResult};
pub use manager::Manager;
pub use reconcile::ReconcileReport;
pub use source::{DefaultResolver, SourceResolver};
pub use tasks::TaskTracker;
