//! Persisted record types.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use fleet_core::{CreateOptions, Service, ServiceKey};

/// Desired-state record for one service unit.
///
/// The embedded [`Service`] carries the persisted status and error; live
/// status comes from the execution backend and is merged in on read.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ServiceRecord {
    pub namespace: String,
    pub service: Service,
    pub options: CreateOptions,
    /// Runnable reference produced by source resolution or a build.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub artifact: Option<String>,
    /// Bumped on every update so background work can detect it was superseded.
    #[serde(default)]
    pub revision: u64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub updated_at: Option<DateTime<Utc>>,
}

impl ServiceRecord {
    pub fn new(namespace: &str, service: Service, options: CreateOptions) -> Self {
        Self {
            namespace: namespace.to_string(),
            service,
            options,
            artifact: None,
            revision: 0,
            updated_at: Some(Utc::now()),
        }
    }

    pub fn key(&self) -> ServiceKey {
        ServiceKey::new(&self.namespace, &self.service)
    }

    /// Build the composite key for the services table.
    pub fn table_key(&self) -> String {
        table_key(&self.namespace, &self.service.name, &self.service.version)
    }

    /// Reference the backend should run: the artifact if one was produced,
    /// otherwise the raw source.
    pub fn runnable_source(&self) -> &str {
        self.artifact.as_deref().unwrap_or(&self.service.source)
    }

    /// Copy of the service pointing at its runnable source.
    pub fn runnable_service(&self) -> Service {
        let mut service = self.service.clone();
        service.source = self.runnable_source().to_string();
        service
    }
}

/// Composite key `{namespace}/{name}:{version}`.
pub fn table_key(namespace: &str, name: &str, version: &str) -> String {
    format!("{namespace}/{name}:{version}")
}

/// Outcome of a revision-guarded write.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum GuardedWrite {
    Written,
    /// The stored record carries a newer revision.
    Superseded,
    /// No record is stored under this identity anymore.
    Deleted,
}

/// Filter for reading records within a namespace. Unset fields match all.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RecordFilter {
    pub name: Option<String>,
    pub version: Option<String>,
}

impl RecordFilter {
    pub fn all() -> Self {
        Self::default()
    }

    pub fn exact(name: &str, version: &str) -> Self {
        Self {
            name: Some(name.to_string()),
            version: Some(version.to_string()),
        }
    }

    pub fn matches(&self, record: &ServiceRecord) -> bool {
        self.name
            .as_deref()
            .is_none_or(|n| n.is_empty() || n == record.service.name)
            && self
                .version
                .as_deref()
                .is_none_or(|v| v.is_empty() || v == record.service.version)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn runnable_source_prefers_artifact() {
        let svc = Service::new("billing").with_version("latest").with_source("./billing");
        let mut record = ServiceRecord::new("default", svc, CreateOptions::default());
        assert_eq!(record.runnable_source(), "./billing");

        record.artifact = Some("blob://default/billing/bin".into());
        assert_eq!(record.runnable_service().source, "blob://default/billing/bin");
        assert_eq!(record.service.source, "./billing");
    }

    #[test]
    fn filter_matches_by_name_and_version() {
        let svc = Service::new("billing").with_version("v1");
        let record = ServiceRecord::new("default", svc, CreateOptions::default());

        assert!(RecordFilter::all().matches(&record));
        assert!(RecordFilter::exact("billing", "v1").matches(&record));
        assert!(!RecordFilter::exact("billing", "v2").matches(&record));
        let by_name = RecordFilter {
            name: Some("billing".into()),
            version: None,
        };
        assert!(by_name.matches(&record));
        assert_eq!(record.table_key(), "default/billing:v1");
    }
}
