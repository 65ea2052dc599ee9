//! redb table definitions for the Fleet state store.
//!
//! Values are JSON-serialized [`ServiceRecord`](crate::ServiceRecord)s.

use redb::TableDefinition;

/// Service records keyed by `{namespace}/{name}:{version}`.
pub const SERVICES: TableDefinition<&str, &[u8]> = TableDefinition::new("services");
