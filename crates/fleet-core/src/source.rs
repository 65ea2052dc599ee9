//! Service source reference parsing.

use serde::{Deserialize, Serialize};
use thiserror::Error;

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub enum SourceRef {
    /// Blob store object: blob://services/billing.tar.gz
    Blob { key: String },
    /// Git: git://github.com/org/repo.git#ref
    Git { url: String, reference: String },
    /// HTTPS archive: https://releases.example.com/billing.tar.gz
    Https { url: String },
    /// Local path: file:///srv/billing, ./billing or /srv/billing
    File { path: String },
}

#[derive(Debug, Error)]
pub enum SourceError {
    #[error("unsupported source scheme: {0}")]
    UnsupportedScheme(String),
    #[error("invalid source reference: {0}")]
    InvalidRef(String),
    #[error("source not found: {0}")]
    NotFound(String),
    #[error("source checkout failed: {0}")]
    Checkout(String),
}

impl SourceRef {
    pub fn parse(source: &str) -> Result<Self, SourceError> {
        if source.is_empty() {
            return Err(SourceError::InvalidRef("empty source".to_string()));
        }
        if let Some(key) = source.strip_prefix("blob://") {
            if key.is_empty() {
                return Err(SourceError::InvalidRef(source.to_string()));
            }
            Ok(SourceRef::Blob { key: key.to_string() })
        } else if source.starts_with("git://") {
            let (url, reference) = source.rsplit_once('#').unwrap_or((source, "main"));
            Ok(SourceRef::Git {
                url: url.to_string(),
                reference: reference.to_string(),
            })
        } else if source.starts_with("https://") || source.starts_with("http://") {
            Ok(SourceRef::Https { url: source.to_string() })
        } else if let Some(path) = source.strip_prefix("file://") {
            Ok(SourceRef::File { path: path.to_string() })
        } else if let Some((scheme, _)) = source.split_once("://") {
            Err(SourceError::UnsupportedScheme(scheme.to_string()))
        } else {
            Ok(SourceRef::File { path: source.to_string() })
        }
    }

    pub fn scheme(&self) -> &'static str {
        match self {
            SourceRef::Blob { .. } => "blob",
            SourceRef::Git { .. } => "git",
            SourceRef::Https { .. } => "https",
            SourceRef::File { .. } => "file",
        }
    }

    /// The blob key, for references that live in the blob store.
    pub fn blob_key(&self) -> Option<&str> {
        match self {
            SourceRef::Blob { key } => Some(key),
            _ => None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parse_blob() {
        let src = SourceRef::parse("blob://default/billing.tar.gz").unwrap();
        assert_eq!(src.scheme(), "blob");
        assert_eq!(src.blob_key(), Some("default/billing.tar.gz"));
    }

    #[test]
    fn parse_git_with_default_ref() {
        let src = SourceRef::parse("git://github.com/acme/billing.git").unwrap();
        assert_eq!(
            src,
            SourceRef::Git {
                url: "git://github.com/acme/billing.git".into(),
                reference: "main".into()
            }
        );
    }

    #[test]
    fn parse_local_paths() {
        assert_eq!(SourceRef::parse("./billing").unwrap().scheme(), "file");
        assert_eq!(
            SourceRef::parse("file:///srv/billing").unwrap(),
            SourceRef::File { path: "/srv/billing".into() }
        );
    }

    #[test]
    fn parse_rejects_unknown_scheme_and_empty() {
        assert!(matches!(
            SourceRef::parse("ftp://host/x"),
            Err(SourceError::UnsupportedScheme(s)) if s == "ftp"
        ));
        assert!(matches!(SourceRef::parse(""), Err(SourceError::InvalidRef(_))));
        assert!(matches!(SourceRef::parse("blob://"), Err(SourceError::InvalidRef(_))));
    }
}
