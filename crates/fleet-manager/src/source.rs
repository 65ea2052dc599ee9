//! Source resolution: turning a service's source reference into something a
//! builder or execution backend can run.

use std::sync::Arc;

use async_trait::async_trait;
use tracing::debug;

use fleet_core::{Service, SourceError, SourceRef};
use fleet_state::BlobStore;

#[async_trait]
pub trait SourceResolver: Send + Sync {
    /// Resolve `service.source` for a service in `namespace`.
    async fn resolve(&self, namespace: &str, service: &Service) -> Result<String, SourceError>;
}

/// Resolves local paths and blob references; remote references pass through.
///
/// Resolution order:
/// 1. `file://` and bare paths: canonicalized, must exist
/// 2. `blob://`: must exist in the blob store; replaced by its on-disk path
///    when the store keeps one
/// 3. `git://` and `https://`: returned unchanged for the builder to fetch
pub struct DefaultResolver {
    blobs: Arc<dyn BlobStore>,
}

impl DefaultResolver {
    pub fn new(blobs: Arc<dyn BlobStore>) -> Self {
        Self { blobs }
    }
}

#[async_trait]
impl SourceResolver for DefaultResolver {
    async fn resolve(&self, namespace: &str, service: &Service) -> Result<String, SourceError> {
        let resolved = match SourceRef::parse(&service.source)? {
            SourceRef::File { path } => {
                let canonical = tokio::fs::canonicalize(&path)
                    .await
                    .map_err(|e| SourceError::NotFound(format!("{path}: {e}")))?;
                canonical.to_string_lossy().into_owned()
            }
            SourceRef::Blob { key } => {
                let present = self
                    .blobs
                    .contains(&key)
                    .map_err(|e| SourceError::Checkout(e.to_string()))?;
                if !present {
                    return Err(SourceError::NotFound(service.source.clone()));
                }
                match self
                    .blobs
                    .local_path(&key)
                    .map_err(|e| SourceError::Checkout(e.to_string()))?
                {
                    Some(path) => path.to_string_lossy().into_owned(),
                    None => service.source.clone(),
                }
            }
            SourceRef::Git { .. } | SourceRef::Https { .. } => service.source.clone(),
        };
        debug!(%namespace, service = %service.live_key(), %resolved, "source resolved");
        Ok(resolved)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use fleet_state::{FsBlobStore, MemoryBlobStore};

    fn svc(source: &str) -> Service {
        Service::new("billing").with_version("latest").with_source(source)
    }

    #[tokio::test]
    async fn local_paths_are_canonicalized() {
        let dir = tempfile::tempdir().unwrap();
        let resolver = DefaultResolver::new(Arc::new(MemoryBlobStore::new()));

        let source = format!("file://{}", dir.path().display());
        let resolved = resolver.resolve("default", &svc(&source)).await.unwrap();
        let expected = dir.path().canonicalize().unwrap();
        assert_eq!(resolved, expected.to_string_lossy());
    }

    #[tokio::test]
    async fn missing_path_is_not_found() {
        let resolver = DefaultResolver::new(Arc::new(MemoryBlobStore::new()));
        let err = resolver
            .resolve("default", &svc("/definitely/not/here"))
            .await
            .unwrap_err();
        assert!(matches!(err, SourceError::NotFound(_)));
    }

    #[tokio::test]
    async fn blob_resolves_to_local_path_when_on_disk() {
        let dir = tempfile::tempdir().unwrap();
        let blobs = Arc::new(FsBlobStore::open(dir.path()).unwrap());
        blobs.put("default/billing/src.tar", b"archive").unwrap();
        let resolver = DefaultResolver::new(blobs.clone());

        let resolved = resolver
            .resolve("default", &svc("blob://default/billing/src.tar"))
            .await
            .unwrap();
        assert!(resolved.ends_with("src.tar"));
        assert!(!resolved.starts_with("blob://"));
    }

    #[tokio::test]
    async fn blob_in_memory_keeps_reference() {
        let blobs = Arc::new(MemoryBlobStore::new());
        blobs.put("default/billing/src.tar", b"archive").unwrap();
        let resolver = DefaultResolver::new(blobs);

        let resolved = resolver
            .resolve("default", &svc("blob://default/billing/src.tar"))
            .await
            .unwrap();
        assert_eq!(resolved, "blob://default/billing/src.tar");

        let err = resolver
            .resolve("default", &svc("blob://default/other"))
            .await
            .unwrap_err();
        assert!(matches!(err, SourceError::NotFound(_)));
    }

    #[tokio::test]
    async fn remote_references_pass_through() {
        let resolver = DefaultResolver::new(Arc::new(MemoryBlobStore::new()));
        for source in ["git://github.com/acme/billing.git#v2", "https://example.com/b.tar.gz"] {
            assert_eq!(resolver.resolve("default", &svc(source)).await.unwrap(), source);
        }
        assert!(matches!(
            resolver.resolve("default", &svc("s3://bucket/key")).await,
            Err(SourceError::UnsupportedScheme(_))
        ));
    }
}
