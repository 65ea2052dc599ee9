//! Options accepted by the lifecycle operations.
//!
//! Every option set carries a namespace. An empty namespace means "use the
//! control plane's default", which callers fill in with [`Namespaced::default_namespace`].

use std::collections::HashMap;

use serde::{Deserialize, Serialize};

/// Option sets scoped to a namespace.
pub trait Namespaced {
    fn namespace(&self) -> &str;
    fn set_namespace(&mut self, namespace: String);

    /// Apply the default namespace when none was given.
    fn default_namespace(&mut self, default: &str) {
        if self.namespace().is_empty() {
            self.set_namespace(default.to_string());
        }
    }
}

macro_rules! namespaced {
    ($ty:ty) => {
        impl Namespaced for $ty {
            fn namespace(&self) -> &str {
                &self.namespace
            }

            fn set_namespace(&mut self, namespace: String) {
                self.namespace = namespace;
            }
        }
    };
}

/// How a service is created and what the backend should run.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct CreateOptions {
    #[serde(default)]
    pub namespace: String,
    /// Entrypoint run by process backends, relative to the resolved source.
    #[serde(default)]
    pub command: Vec<String>,
    #[serde(default)]
    pub args: Vec<String>,
    #[serde(default)]
    pub env: HashMap<String, String>,
    /// Build target handed to the builder (e.g. a language or image type).
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub target: Option<String>,
}

impl CreateOptions {
    pub fn in_namespace(namespace: impl Into<String>) -> Self {
        Self {
            namespace: namespace.into(),
            ..Self::default()
        }
    }

    pub fn with_command<I, S>(mut self, command: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.command = command.into_iter().map(Into::into).collect();
        self
    }
}

/// Filter for read operations. Unset fields match everything.
#[derive(Debug, Clone, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ReadOptions {
    #[serde(default)]
    pub namespace: String,
    #[serde(default)]
    pub service: Option<String>,
    #[serde(default)]
    pub version: Option<String>,
}

impl ReadOptions {
    pub fn in_namespace(namespace: impl Into<String>) -> Self {
        Self {
            namespace: namespace.into(),
            ..Self::default()
        }
    }

    pub fn service(mut self, name: impl Into<String>) -> Self {
        self.service = Some(name.into());
        self
    }

    pub fn version(mut self, version: impl Into<String>) -> Self {
        self.version = Some(version.into());
        self
    }

    /// Whether a service name/version pair passes this filter.
    pub fn matches(&self, name: &str, version: &str) -> bool {
        self.service.as_deref().is_none_or(|s| s.is_empty() || s == name)
            && self.version.as_deref().is_none_or(|v| v.is_empty() || v == version)
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct UpdateOptions {
    #[serde(default)]
    pub namespace: String,
}

impl UpdateOptions {
    pub fn in_namespace(namespace: impl Into<String>) -> Self {
        Self {
            namespace: namespace.into(),
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct DeleteOptions {
    #[serde(default)]
    pub namespace: String,
}

impl DeleteOptions {
    pub fn in_namespace(namespace: impl Into<String>) -> Self {
        Self {
            namespace: namespace.into(),
        }
    }
}

namespaced!(CreateOptions);
namespaced!(ReadOptions);
namespaced!(UpdateOptions);
namespaced!(DeleteOptions);

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_namespace_only_fills_empty() {
        let mut opts = ReadOptions::default();
        opts.default_namespace("default");
        assert_eq!(opts.namespace, "default");

        let mut opts = DeleteOptions::in_namespace("team-a");
        opts.default_namespace("default");
        assert_eq!(opts.namespace, "team-a");
    }

    #[test]
    fn read_filter_matching() {
        let all = ReadOptions::in_namespace("default");
        assert!(all.matches("billing", "latest"));

        let by_name = ReadOptions::default().service("billing");
        assert!(by_name.matches("billing", "v1"));
        assert!(!by_name.matches("search", "v1"));

        let exact = ReadOptions::default().service("billing").version("v1");
        assert!(exact.matches("billing", "v1"));
        assert!(!exact.matches("billing", "v2"));
    }

    #[test]
    fn create_options_builder() {
        let opts = CreateOptions::in_namespace("ns").with_command(["./run.sh", "--port"]);
        assert_eq!(opts.namespace, "ns");
        assert_eq!(opts.command, vec!["./run.sh", "--port"]);
    }
}
