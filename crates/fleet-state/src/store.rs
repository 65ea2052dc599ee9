//! StateStore — redb-backed persistence for service records.
//!
//! Records are JSON-serialized into redb's `&[u8]` value column under the
//! composite key `{namespace}/{name}:{version}`, so a namespace is a key
//! prefix and iteration order is the store order returned by reads.

use std::collections::BTreeSet;
use std::path::Path;
use std::sync::Arc;

use redb::{Database, ReadableDatabase, ReadableTable};
use tracing::debug;

use crate::error::{StateError, StateResult};
use crate::tables::SERVICES;
use crate::types::{GuardedWrite, RecordFilter, ServiceRecord, table_key};

/// Convert any `Display` error into a `StateError` variant via a closure factory.
macro_rules! map_err {
    ($variant:ident) => {
        |e| StateError::$variant(e.to_string())
    };
}

/// Durable store of desired-state service records.
///
/// Implementations must tolerate concurrent access to independent keys; no
/// cross-key transactions are required.
pub trait RecordStore: Send + Sync {
    /// Records in `namespace` matching `filter`, in store order.
    fn read(&self, namespace: &str, filter: &RecordFilter) -> StateResult<Vec<ServiceRecord>>;

    /// Insert or replace a record.
    fn write(&self, record: &ServiceRecord) -> StateResult<()>;

    /// Replace a record only if the stored copy still carries the same
    /// revision. Never creates a record.
    fn write_guarded(&self, record: &ServiceRecord) -> StateResult<GuardedWrite>;

    /// Delete a record. Returns true if it existed.
    fn delete(&self, record: &ServiceRecord) -> StateResult<bool>;

    /// Every namespace holding at least one record.
    fn namespaces(&self) -> StateResult<Vec<String>>;
}

/// Thread-safe record store backed by redb.
#[derive(Clone)]
pub struct StateStore {
    db: Arc<Database>,
}

impl StateStore {
    /// Open (or create) a persistent state store at the given path.
    pub fn open(path: &Path) -> StateResult<Self> {
        let db = Database::create(path).map_err(map_err!(Open))?;
        let store = Self { db: Arc::new(db) };
        store.ensure_tables()?;
        debug!(?path, "state store opened");
        Ok(store)
    }

    /// Create an ephemeral in-memory state store.
    pub fn open_in_memory() -> StateResult<Self> {
        let backend = redb::backends::InMemoryBackend::new();
        let db = Database::builder()
            .create_with_backend(backend)
            .map_err(map_err!(Open))?;
        let store = Self { db: Arc::new(db) };
        store.ensure_tables()?;
        debug!("in-memory state store opened");
        Ok(store)
    }

    fn ensure_tables(&self) -> StateResult<()> {
        let txn = self.db.begin_write().map_err(map_err!(Transaction))?;
        // Opening a table in a write transaction creates it if absent.
        txn.open_table(SERVICES).map_err(map_err!(Table))?;
        txn.commit().map_err(map_err!(Transaction))?;
        Ok(())
    }

    /// Insert or update a service record.
    pub fn put_record(&self, record: &ServiceRecord) -> StateResult<()> {
        let key = record.table_key();
        let value = serde_json::to_vec(record).map_err(map_err!(Serialize))?;
        let txn = self.db.begin_write().map_err(map_err!(Transaction))?;
        {
            let mut table = txn.open_table(SERVICES).map_err(map_err!(Table))?;
            table
                .insert(key.as_str(), value.as_slice())
                .map_err(map_err!(Write))?;
        }
        txn.commit().map_err(map_err!(Transaction))?;
        debug!(%key, status = %record.service.status, "service record stored");
        Ok(())
    }

    /// Replace a record if the stored revision matches, within one write
    /// transaction so a concurrent delete cannot be overwritten.
    pub fn put_record_guarded(&self, record: &ServiceRecord) -> StateResult<GuardedWrite> {
        let key = record.table_key();
        let value = serde_json::to_vec(record).map_err(map_err!(Serialize))?;
        let txn = self.db.begin_write().map_err(map_err!(Transaction))?;
        let outcome = {
            let mut table = txn.open_table(SERVICES).map_err(map_err!(Table))?;
            let stored_revision = match table.get(key.as_str()).map_err(map_err!(Read))? {
                Some(guard) => {
                    let stored: ServiceRecord =
                        serde_json::from_slice(guard.value()).map_err(map_err!(Deserialize))?;
                    Some(stored.revision)
                }
                None => None,
            };
            match stored_revision {
                None => GuardedWrite::Deleted,
                Some(revision) if revision != record.revision => GuardedWrite::Superseded,
                Some(_) => {
                    table
                        .insert(key.as_str(), value.as_slice())
                        .map_err(map_err!(Write))?;
                    GuardedWrite::Written
                }
            }
        };
        txn.commit().map_err(map_err!(Transaction))?;
        debug!(%key, ?outcome, "guarded record write");
        Ok(outcome)
    }

    /// Get a record by its identity.
    pub fn get_record(
        &self,
        namespace: &str,
        name: &str,
        version: &str,
    ) -> StateResult<Option<ServiceRecord>> {
        let key = table_key(namespace, name, version);
        let txn = self.db.begin_read().map_err(map_err!(Transaction))?;
        let table = txn.open_table(SERVICES).map_err(map_err!(Table))?;
        match table.get(key.as_str()).map_err(map_err!(Read))? {
            Some(guard) => {
                let record: ServiceRecord =
                    serde_json::from_slice(guard.value()).map_err(map_err!(Deserialize))?;
                Ok(Some(record))
            }
            None => Ok(None),
        }
    }

    /// List records in a namespace matching a filter.
    pub fn list_records(
        &self,
        namespace: &str,
        filter: &RecordFilter,
    ) -> StateResult<Vec<ServiceRecord>> {
        // An exact identity is a point lookup.
        if let (Some(name), Some(version)) = (&filter.name, &filter.version) {
            if !name.is_empty() && !version.is_empty() {
                return Ok(self
                    .get_record(namespace, name, version)?
                    .into_iter()
                    .collect());
            }
        }

        let prefix = format!("{namespace}/");
        let txn = self.db.begin_read().map_err(map_err!(Transaction))?;
        let table = txn.open_table(SERVICES).map_err(map_err!(Table))?;
        let mut results = Vec::new();
        for entry in table.iter().map_err(map_err!(Read))? {
            let (key, value) = entry.map_err(map_err!(Read))?;
            if !key.value().starts_with(&prefix) {
                continue;
            }
            let record: ServiceRecord =
                serde_json::from_slice(value.value()).map_err(map_err!(Deserialize))?;
            if filter.matches(&record) {
                results.push(record);
            }
        }
        Ok(results)
    }

    /// Delete a record by identity. Returns true if it existed.
    pub fn delete_record(&self, namespace: &str, name: &str, version: &str) -> StateResult<bool> {
        let key = table_key(namespace, name, version);
        let txn = self.db.begin_write().map_err(map_err!(Transaction))?;
        let existed;
        {
            let mut table = txn.open_table(SERVICES).map_err(map_err!(Table))?;
            existed = table.remove(key.as_str()).map_err(map_err!(Write))?.is_some();
        }
        txn.commit().map_err(map_err!(Transaction))?;
        debug!(%key, existed, "service record deleted");
        Ok(existed)
    }

    /// Distinct namespaces, sorted.
    pub fn list_namespaces(&self) -> StateResult<Vec<String>> {
        let txn = self.db.begin_read().map_err(map_err!(Transaction))?;
        let table = txn.open_table(SERVICES).map_err(map_err!(Table))?;
        let mut namespaces = BTreeSet::new();
        for entry in table.iter().map_err(map_err!(Read))? {
            let (key, _) = entry.map_err(map_err!(Read))?;
            if let Some((ns, _)) = key.value().split_once('/') {
                namespaces.insert(ns.to_string());
            }
        }
        Ok(namespaces.into_iter().collect())
    }
}

impl RecordStore for StateStore {
    fn read(&self, namespace: &str, filter: &RecordFilter) -> StateResult<Vec<ServiceRecord>> {
        self.list_records(namespace, filter)
    }

    fn write(&self, record: &ServiceRecord) -> StateResult<()> {
        self.put_record(record)
    }

    fn write_guarded(&self, record: &ServiceRecord) -> StateResult<GuardedWrite> {
        self.put_record_guarded(record)
    }

    fn delete(&self, record: &ServiceRecord) -> StateResult<bool> {
        self.delete_record(
            &record.namespace,
            &record.service.name,
            &record.service.version,
        )
    }

    fn namespaces(&self) -> StateResult<Vec<String>> {
        self.list_namespaces()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use fleet_core::{CreateOptions, Service, ServiceStatus};

    fn test_record(namespace: &str, name: &str, version: &str) -> ServiceRecord {
        let svc = Service::new(name)
            .with_version(version)
            .with_source(format!("./services/{name}"));
        ServiceRecord::new(namespace, svc, CreateOptions::in_namespace(namespace))
    }

    #[test]
    fn record_put_and_get() {
        let store = StateStore::open_in_memory().unwrap();
        let record = test_record("default", "billing", "latest");

        store.put_record(&record).unwrap();
        let retrieved = store.get_record("default", "billing", "latest").unwrap();

        assert_eq!(retrieved, Some(record));
    }

    #[test]
    fn record_get_nonexistent_returns_none() {
        let store = StateStore::open_in_memory().unwrap();
        assert!(store.get_record("nope", "nothing", "latest").unwrap().is_none());
    }

    #[test]
    fn identity_is_unique() {
        let store = StateStore::open_in_memory().unwrap();
        let mut record = test_record("default", "billing", "latest");
        store.put_record(&record).unwrap();

        record.service.status = ServiceStatus::Running;
        record.revision = 1;
        store.put_record(&record).unwrap();

        let all = store.list_records("default", &RecordFilter::all()).unwrap();
        assert_eq!(all.len(), 1);
        assert_eq!(all[0].service.status, ServiceStatus::Running);
        assert_eq!(all[0].revision, 1);
    }

    #[test]
    fn list_scopes_to_namespace_and_filter() {
        let store = StateStore::open_in_memory().unwrap();
        store.put_record(&test_record("default", "billing", "latest")).unwrap();
        store.put_record(&test_record("default", "billing", "v2")).unwrap();
        store.put_record(&test_record("default", "search", "latest")).unwrap();
        store.put_record(&test_record("team-a", "billing", "latest")).unwrap();

        let all = store.list_records("default", &RecordFilter::all()).unwrap();
        assert_eq!(all.len(), 3);

        let by_name = RecordFilter {
            name: Some("billing".into()),
            version: None,
        };
        let billing = store.list_records("default", &by_name).unwrap();
        assert_eq!(billing.len(), 2);

        let exact = store
            .list_records("default", &RecordFilter::exact("billing", "v2"))
            .unwrap();
        assert_eq!(exact.len(), 1);
        assert_eq!(exact[0].service.version, "v2");

        let other = store.list_records("team-a", &RecordFilter::all()).unwrap();
        assert_eq!(other.len(), 1);
    }

    #[test]
    fn namespace_prefix_does_not_leak() {
        let store = StateStore::open_in_memory().unwrap();
        store.put_record(&test_record("dev", "api", "latest")).unwrap();
        store.put_record(&test_record("dev-2", "api", "latest")).unwrap();

        assert_eq!(store.list_records("dev", &RecordFilter::all()).unwrap().len(), 1);
    }

    #[test]
    fn record_delete() {
        let store = StateStore::open_in_memory().unwrap();
        store.put_record(&test_record("default", "billing", "latest")).unwrap();

        assert!(store.delete_record("default", "billing", "latest").unwrap());
        assert!(!store.delete_record("default", "billing", "latest").unwrap());
        assert!(store.get_record("default", "billing", "latest").unwrap().is_none());
    }

    #[test]
    fn guarded_write_checks_revision() {
        let store = StateStore::open_in_memory().unwrap();
        let mut record = test_record("default", "billing", "latest");
        assert_eq!(store.put_record_guarded(&record).unwrap(), GuardedWrite::Deleted);
        assert!(store.get_record("default", "billing", "latest").unwrap().is_none());

        store.put_record(&record).unwrap();
        record.service.status = ServiceStatus::Building;
        assert_eq!(store.put_record_guarded(&record).unwrap(), GuardedWrite::Written);

        let mut newer = record.clone();
        newer.revision = 1;
        newer.service.status = ServiceStatus::Pending;
        store.put_record(&newer).unwrap();

        record.service.status = ServiceStatus::Running;
        assert_eq!(store.put_record_guarded(&record).unwrap(), GuardedWrite::Superseded);
        let stored = store.get_record("default", "billing", "latest").unwrap().unwrap();
        assert_eq!(stored.service.status, ServiceStatus::Pending);
    }

    #[test]
    fn namespaces_are_distinct_and_sorted() {
        let store = StateStore::open_in_memory().unwrap();
        store.put_record(&test_record("zeta", "a", "latest")).unwrap();
        store.put_record(&test_record("alpha", "a", "latest")).unwrap();
        store.put_record(&test_record("alpha", "b", "latest")).unwrap();

        assert_eq!(store.list_namespaces().unwrap(), vec!["alpha", "zeta"]);
    }

    #[test]
    fn trait_object_round_trip() {
        let store: Arc<dyn RecordStore> = Arc::new(StateStore::open_in_memory().unwrap());
        let record = test_record("default", "billing", "latest");

        store.write(&record).unwrap();
        assert_eq!(store.read("default", &RecordFilter::all()).unwrap().len(), 1);
        assert!(store.delete(&record).unwrap());
        assert!(store.namespaces().unwrap().is_empty());
    }

    #[test]
    fn persistence_survives_reopen() {
        let dir = tempfile::tempdir().unwrap();
        let db_path = dir.path().join("fleet.redb");

        {
            let store = StateStore::open(&db_path).unwrap();
            store.put_record(&test_record("prod", "billing", "latest")).unwrap();
        }

        let store = StateStore::open(&db_path).unwrap();
        let record = store.get_record("prod", "billing", "latest").unwrap();
        assert_eq!(record.unwrap().service.name, "billing");
    }

    #[test]
    fn empty_store_operations() {
        let store = StateStore::open_in_memory().unwrap();

        assert!(store.list_records("any", &RecordFilter::all()).unwrap().is_empty());
        assert!(store.list_namespaces().unwrap().is_empty());
        assert!(!store.delete_record("any", "nope", "latest").unwrap());
    }
}
