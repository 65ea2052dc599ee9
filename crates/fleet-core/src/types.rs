//! Shared service types used across Fleet crates.

use std::collections::HashMap;
use std::fmt;

use chrono::{DateTime, SecondsFormat, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Version assigned to services that do not specify one.
pub const DEFAULT_VERSION: &str = "latest";

/// Metadata key mirroring [`Service::error`] for metadata-only consumers.
pub const METADATA_ERROR: &str = "error";

/// Metadata key mirroring [`Service::started_at`] (RFC 3339).
pub const METADATA_STARTED: &str = "started";

/// Lifecycle status of a service unit.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ServiceStatus {
    #[default]
    Unknown,
    Pending,
    Building,
    Starting,
    Running,
    Stopping,
    Stopped,
    Error,
}

impl ServiceStatus {
    /// Statuses the reconciler leaves alone: the service is not running on
    /// purpose (failed, mid-build, or stopped by an operator).
    pub fn is_intentionally_down(&self) -> bool {
        matches!(
            self,
            ServiceStatus::Error | ServiceStatus::Building | ServiceStatus::Stopped
        )
    }

    pub fn label(&self) -> &'static str {
        match self {
            ServiceStatus::Unknown => "unknown",
            ServiceStatus::Pending => "pending",
            ServiceStatus::Building => "building",
            ServiceStatus::Starting => "starting",
            ServiceStatus::Running => "running",
            ServiceStatus::Stopping => "stopping",
            ServiceStatus::Stopped => "stopped",
            ServiceStatus::Error => "error",
        }
    }
}

impl fmt::Display for ServiceStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.label())
    }
}

/// A service unit as described by a client and reported by backends.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Service {
    pub name: String,
    #[serde(default)]
    pub version: String,
    /// Local path, `file://`, `blob://`, `git://` or `https://` reference.
    #[serde(default)]
    pub source: String,
    #[serde(default)]
    pub metadata: HashMap<String, String>,
    #[serde(default)]
    pub status: ServiceStatus,
    /// Last failure reported for this service, if any.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    /// When the service was last (re)started by the control plane.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub started_at: Option<DateTime<Utc>>,
}

#[derive(Debug, Error, PartialEq, Eq)]
pub enum ValidationError {
    #[error("service name must not be empty")]
    EmptyName,
    #[error("service {field} {value:?} contains a reserved character ('/' or ':')")]
    ReservedCharacter { field: &'static str, value: String },
}

impl Service {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            ..Self::default()
        }
    }

    pub fn with_version(mut self, version: impl Into<String>) -> Self {
        self.version = version.into();
        self
    }

    pub fn with_source(mut self, source: impl Into<String>) -> Self {
        self.source = source.into();
        self
    }

    /// Fill in the version default.
    pub fn apply_defaults(&mut self) {
        if self.version.is_empty() {
            self.version = DEFAULT_VERSION.to_string();
        }
    }

    /// Reject identities that would corrupt composite store keys.
    pub fn validate(&self) -> Result<(), ValidationError> {
        if self.name.is_empty() {
            return Err(ValidationError::EmptyName);
        }
        for (field, value) in [("name", &self.name), ("version", &self.version)] {
            if value.contains('/') || value.contains(':') {
                return Err(ValidationError::ReservedCharacter {
                    field,
                    value: value.clone(),
                });
            }
        }
        Ok(())
    }

    /// Key used to match stored services against live backend services.
    pub fn live_key(&self) -> String {
        format!("{}:{}", self.name, self.version)
    }

    /// Set the typed error and mirror it into metadata.
    pub fn annotate_error(&mut self, error: impl Into<String>) {
        let error = error.into();
        self.metadata
            .insert(METADATA_ERROR.to_string(), error.clone());
        self.error = Some(error);
    }

    /// Set the typed start time and mirror it into metadata as RFC 3339.
    pub fn annotate_started(&mut self, at: DateTime<Utc>) {
        self.metadata.insert(
            METADATA_STARTED.to_string(),
            at.to_rfc3339_opts(SecondsFormat::Secs, true),
        );
        self.started_at = Some(at);
    }

    /// Drop the error and start annotations that reads derive, so a
    /// service read back and resubmitted carries only desired state.
    pub fn clear_annotations(&mut self) {
        self.metadata.remove(METADATA_ERROR);
        self.metadata.remove(METADATA_STARTED);
        self.error = None;
        self.started_at = None;
    }

    /// Error annotation reported by a backend, typed field first.
    pub fn reported_error(&self) -> Option<&str> {
        self.error
            .as_deref()
            .or_else(|| self.metadata.get(METADATA_ERROR).map(String::as_str))
            .filter(|e| !e.is_empty())
    }
}

/// Namespaces prefix store keys, so they share the name restrictions.
pub fn validate_namespace(namespace: &str) -> Result<(), ValidationError> {
    if namespace.contains('/') || namespace.contains(':') {
        return Err(ValidationError::ReservedCharacter {
            field: "namespace",
            value: namespace.to_string(),
        });
    }
    Ok(())
}

/// Identity of a service within the control plane.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct ServiceKey {
    pub namespace: String,
    pub name: String,
    pub version: String,
}

impl ServiceKey {
    pub fn new(namespace: &str, service: &Service) -> Self {
        Self {
            namespace: namespace.to_string(),
            name: service.name.clone(),
            version: service.version.clone(),
        }
    }
}

impl fmt::Display for ServiceKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}:{}", self.namespace, self.name, self.version)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    #[test]
    fn version_defaults_to_latest() {
        let mut svc = Service::new("billing");
        svc.apply_defaults();
        assert_eq!(svc.version, "latest");

        let mut pinned = Service::new("billing").with_version("v2");
        pinned.apply_defaults();
        assert_eq!(pinned.version, "v2");
    }

    #[test]
    fn validate_rejects_reserved_characters() {
        assert_eq!(Service::new("").validate(), Err(ValidationError::EmptyName));
        assert!(matches!(
            Service::new("a/b").validate(),
            Err(ValidationError::ReservedCharacter { field: "name", .. })
        ));
        assert!(matches!(
            Service::new("ok").with_version("1:2").validate(),
            Err(ValidationError::ReservedCharacter { field: "version", .. })
        ));
        assert!(Service::new("billing").with_version("latest").validate().is_ok());
        assert!(validate_namespace("team-a").is_ok());
        assert!(validate_namespace("team/a").is_err());
    }

    #[test]
    fn intentionally_down_statuses() {
        assert!(ServiceStatus::Error.is_intentionally_down());
        assert!(ServiceStatus::Building.is_intentionally_down());
        assert!(ServiceStatus::Stopped.is_intentionally_down());
        assert!(!ServiceStatus::Pending.is_intentionally_down());
        assert!(!ServiceStatus::Running.is_intentionally_down());
        assert!(!ServiceStatus::Unknown.is_intentionally_down());
    }

    #[test]
    fn annotate_started_formats_rfc3339() {
        let at = Utc.with_ymd_and_hms(2024, 3, 1, 12, 30, 0).unwrap();
        let mut svc = Service::new("billing");
        svc.annotate_started(at);
        assert_eq!(svc.metadata["started"], "2024-03-01T12:30:00Z");
        assert_eq!(svc.started_at, Some(at));
    }

    #[test]
    fn reported_error_prefers_typed_field() {
        let mut svc = Service::new("billing");
        assert_eq!(svc.reported_error(), None);

        svc.metadata.insert("error".into(), "from metadata".into());
        assert_eq!(svc.reported_error(), Some("from metadata"));

        svc.error = Some("typed".into());
        assert_eq!(svc.reported_error(), Some("typed"));
    }

    #[test]
    fn clear_annotations_keeps_user_metadata() {
        let mut svc = Service::new("billing");
        svc.metadata.insert("team".into(), "payments".into());
        svc.annotate_error("crashed");
        svc.annotate_started(Utc::now());

        svc.clear_annotations();
        assert_eq!(svc.error, None);
        assert_eq!(svc.started_at, None);
        assert_eq!(svc.metadata.len(), 1);
        assert_eq!(svc.metadata["team"], "payments");
    }

    #[test]
    fn status_serializes_snake_case() {
        let json = serde_json::to_string(&ServiceStatus::Running).unwrap();
        assert_eq!(json, "\"running\"");
    }

    #[test]
    fn key_display() {
        let svc = Service::new("billing").with_version("latest");
        assert_eq!(ServiceKey::new("default", &svc).to_string(), "default/billing:latest");
        assert_eq!(svc.live_key(), "billing:latest");
    }
}
