//! Service manager: durable, reconciled lifecycle on top of a [`Runtime`].
//!
//! The manager persists desired state before it touches the execution
//! backend. Without a builder every operation runs synchronously; with one,
//! create and update persist `pending` and hand the rest to a background
//! build task:
//!
//! ```text
//! create ─┬─ no builder ─► resolve ─► backend create ─► persist live status
//!         └─ builder ────► persist pending ─► [task] building ─► resolve
//!                          ─► build ─► backend create ─► running | error
//! ```
//!
//! Background tasks carry the revision of the record they were spawned for
//! and write through [`RecordStore::write_guarded`], so a record deleted or
//! updated while a build is in flight is never overwritten or resurrected.

use std::collections::HashMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use async_trait::async_trait;
use chrono::Utc;
use tokio::sync::{Mutex, watch};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

use fleet_core::{
    CreateOptions, DeleteOptions, Namespaced, ReadOptions, Service, ServiceKey, ServiceStatus,
    SourceRef, UpdateOptions, validate_namespace,
};
use fleet_runtime::{Builder, CachedRuntime, Runtime, RuntimeError, RuntimeResult};
use fleet_state::{BlobStore, GuardedWrite, RecordFilter, RecordStore, ServiceRecord};

use crate::config::ManagerConfig;
use crate::error::{ManagerError, ManagerResult};
use crate::reconcile;
use crate::source::{DefaultResolver, SourceResolver};
use crate::tasks::TaskTracker;

/// Which backend call brings an instance in line with its record.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Deploy {
    /// Create; an existing instance is left as is.
    Create,
    /// Replace the instance, creating it if the backend has none.
    Update,
}

struct Lifecycle {
    running: AtomicBool,
    reconciler: Mutex<Option<(watch::Sender<bool>, JoinHandle<()>)>>,
}

/// The service manager. Cheap to clone; clones share all state.
#[derive(Clone)]
pub struct Manager {
    pub(crate) runtime: Arc<CachedRuntime>,
    pub(crate) store: Arc<dyn RecordStore>,
    blobs: Arc<dyn BlobStore>,
    pub(crate) builder: Option<Arc<dyn Builder>>,
    resolver: Arc<dyn SourceResolver>,
    pub(crate) config: Arc<ManagerConfig>,
    pub(crate) tasks: Arc<TaskTracker>,
    lifecycle: Arc<Lifecycle>,
}

impl Manager {
    /// Build a manager over `runtime`, which is wrapped in a read cache.
    pub fn new(
        runtime: Arc<dyn Runtime>,
        store: Arc<dyn RecordStore>,
        blobs: Arc<dyn BlobStore>,
        config: ManagerConfig,
    ) -> Self {
        let runtime = Arc::new(CachedRuntime::new(runtime, config.cache.clone()));
        let resolver = Arc::new(DefaultResolver::new(Arc::clone(&blobs)));
        Self {
            runtime,
            store,
            blobs,
            builder: None,
            resolver,
            tasks: Arc::new(TaskTracker::new(config.max_concurrent_tasks)),
            config: Arc::new(config),
            lifecycle: Arc::new(Lifecycle {
                running: AtomicBool::new(false),
                reconciler: Mutex::new(None),
            }),
        }
    }

    /// Build services asynchronously with `builder` before running them.
    pub fn with_builder(mut self, builder: Arc<dyn Builder>) -> Self {
        self.builder = Some(builder);
        self
    }

    pub fn with_resolver(mut self, resolver: Arc<dyn SourceResolver>) -> Self {
        self.resolver = resolver;
        self
    }

    pub fn config(&self) -> &ManagerConfig {
        &self.config
    }

    /// The cached backend shared by all operations.
    pub fn runtime(&self) -> &CachedRuntime {
        &self.runtime
    }

    pub fn is_running(&self) -> bool {
        self.lifecycle.running.load(Ordering::SeqCst)
    }

    /// Wait for every in-flight build and cleanup task to finish.
    pub async fn wait_for_tasks(&self) {
        self.tasks.wait_idle().await;
    }

    fn resolve_namespace<O: Namespaced>(&self, options: &mut O) -> ManagerResult<String> {
        options.default_namespace(&self.config.default_namespace);
        validate_namespace(options.namespace())?;
        Ok(options.namespace().to_string())
    }

    fn prepare(service: &Service) -> ManagerResult<Service> {
        let mut service = service.clone();
        service.apply_defaults();
        service.validate()?;
        service.clear_annotations();
        Ok(service)
    }

    fn load(&self, namespace: &str, service: &Service) -> ManagerResult<ServiceRecord> {
        self.store
            .read(namespace, &RecordFilter::exact(&service.name, &service.version))?
            .into_iter()
            .next()
            .ok_or_else(|| {
                ManagerError::NotFound(ServiceKey::new(namespace, service).to_string())
            })
    }

    // -- Create -------------------------------------------------------------

    pub async fn create(&self, service: &Service, options: &CreateOptions) -> ManagerResult<()> {
        let mut options = options.clone();
        let namespace = self.resolve_namespace(&mut options)?;
        let mut service = Self::prepare(service)?;
        service.status = ServiceStatus::Unknown;

        let previous = self
            .store
            .read(&namespace, &RecordFilter::exact(&service.name, &service.version))?
            .into_iter()
            .next();
        let mut record = ServiceRecord::new(&namespace, service, options);
        record.revision = previous.map_or(0, |p| p.revision + 1);

        if self.builder.is_some() {
            record.service.status = ServiceStatus::Pending;
            self.store.write(&record)?;
            info!(%namespace, service = %record.service.live_key(), "service pending build");
            self.spawn_build(record, Deploy::Create);
            return Ok(());
        }

        let resolved = self.resolver.resolve(&namespace, &record.service).await?;
        record.artifact = Some(resolved);
        self.deploy(&record, Deploy::Create).await?;

        record.service.status = self.live_status(&record).await;
        self.store.write(&record)?;
        info!(
            %namespace,
            service = %record.service.live_key(),
            status = %record.service.status,
            "service created"
        );
        Ok(())
    }

    /// Status the backend reports for a record's instance, `starting` when it
    /// reports none yet.
    async fn live_status(&self, record: &ServiceRecord) -> ServiceStatus {
        let filter = ReadOptions::in_namespace(&record.namespace)
            .service(&record.service.name)
            .version(&record.service.version);
        match self.runtime.read(&filter).await {
            Ok(live) => live
                .into_iter()
                .find(|s| s.live_key() == record.service.live_key())
                .map(|s| s.status)
                .filter(|status| *status != ServiceStatus::Unknown)
                .unwrap_or(ServiceStatus::Starting),
            Err(e) => {
                warn!(
                    namespace = %record.namespace,
                    service = %record.service.live_key(),
                    error = %e,
                    "reading back live status failed"
                );
                ServiceStatus::Starting
            }
        }
    }

    /// Drive the backend toward `record`.
    pub(crate) async fn deploy(&self, record: &ServiceRecord, mode: Deploy) -> ManagerResult<()> {
        let runnable = record.runnable_service();
        let live_key = runnable.live_key();
        if mode == Deploy::Update {
            let options = UpdateOptions::in_namespace(&record.namespace);
            match self.runtime.update(&runnable, &options).await {
                Ok(()) => return Ok(()),
                Err(e) if e.is_not_found() => {
                    debug!(namespace = %record.namespace, service = %live_key, "no live instance to update, creating");
                }
                Err(e) => return Err(e.into()),
            }
        }
        match self.runtime.create(&runnable, &record.options).await {
            Ok(()) => Ok(()),
            Err(e) if e.is_already_exists() => {
                debug!(namespace = %record.namespace, service = %live_key, "instance already exists");
                Ok(())
            }
            Err(e) => Err(e.into()),
        }
    }

    // -- Read ---------------------------------------------------------------

    pub async fn read(&self, options: &ReadOptions) -> ManagerResult<Vec<Service>> {
        let mut options = options.clone();
        self.resolve_namespace(&mut options)?;
        let filter = RecordFilter {
            name: options.service.clone(),
            version: options.version.clone(),
        };
        let records = self.store.read(&options.namespace, &filter)?;
        if records.is_empty() {
            return Ok(Vec::new());
        }

        let live: HashMap<String, Service> = self
            .runtime
            .read(&options)
            .await?
            .into_iter()
            .map(|s| (s.live_key(), s))
            .collect();

        Ok(records
            .into_iter()
            .map(|record| {
                let instance = live.get(&record.service.live_key());
                merge(record, instance)
            })
            .collect())
    }

    // -- Update -------------------------------------------------------------

    pub async fn update(&self, service: &Service, options: &UpdateOptions) -> ManagerResult<()> {
        let mut options = options.clone();
        let namespace = self.resolve_namespace(&mut options)?;
        let service = Self::prepare(service)?;
        let mut record = self.load(&namespace, &service)?;

        record.service.source = service.source.clone();
        record.service.metadata.extend(service.metadata);
        record.revision += 1;
        record.updated_at = Some(Utc::now());
        record.service.error = None;

        if self.builder.is_some() {
            record.service.status = ServiceStatus::Pending;
            record.artifact = None;
            self.store.write(&record)?;
            info!(%namespace, service = %record.service.live_key(), revision = record.revision, "update pending build");
            self.spawn_build(record, Deploy::Update);
            return Ok(());
        }

        let resolved = self.resolver.resolve(&namespace, &record.service).await?;
        record.artifact = Some(resolved);
        self.deploy(&record, Deploy::Update).await?;

        record.service.status = ServiceStatus::Starting;
        self.store.write(&record)?;
        info!(%namespace, service = %record.service.live_key(), revision = record.revision, "service updated");
        Ok(())
    }

    // -- Delete -------------------------------------------------------------

    pub async fn delete(&self, service: &Service, options: &DeleteOptions) -> ManagerResult<()> {
        let mut options = options.clone();
        let namespace = self.resolve_namespace(&mut options)?;
        let mut service = service.clone();
        service.apply_defaults();
        let record = self.load(&namespace, &service)?;
        let key = record.key();

        if self.tasks.cancel(&key).await {
            info!(%key, "in-flight build cancelled");
        }

        match self.runtime.delete(&record.runnable_service(), &options).await {
            Ok(()) => {}
            Err(e) if e.is_not_found() => {
                debug!(%key, "no live instance to delete");
            }
            Err(e) => return Err(e.into()),
        }

        self.store.delete(&record)?;
        info!(%key, "service deleted");
        self.spawn_cleanup(&record);
        Ok(())
    }

    /// Remove the blobs a deleted record referenced, retrying with a linear
    /// backoff. Failures are logged only.
    fn spawn_cleanup(&self, record: &ServiceRecord) {
        let mut keys: Vec<String> = [Some(record.service.source.as_str()), record.artifact.as_deref()]
            .into_iter()
            .flatten()
            .filter_map(|reference| SourceRef::parse(reference).ok())
            .filter_map(|reference| reference.blob_key().map(str::to_string))
            .collect();
        keys.dedup();
        if keys.is_empty() {
            return;
        }

        let blobs = Arc::clone(&self.blobs);
        let attempts = self.config.cleanup_retries.max(1);
        let backoff = self.config.cleanup_backoff;
        let owner = record.key();
        self.tasks.spawn_detached(async move {
            for key in keys {
                for attempt in 1..=attempts {
                    match blobs.delete(&key) {
                        Ok(existed) => {
                            debug!(service = %owner, blob = %key, existed, "blob removed");
                            break;
                        }
                        Err(e) if attempt < attempts => {
                            warn!(service = %owner, blob = %key, attempt, error = %e, "blob cleanup failed, retrying");
                            tokio::time::sleep(backoff * attempt).await;
                        }
                        Err(e) => {
                            error!(service = %owner, blob = %key, attempts, error = %e, "blob cleanup gave up");
                        }
                    }
                }
            }
        });
    }

    // -- Background builds --------------------------------------------------

    pub(crate) fn spawn_build(&self, record: ServiceRecord, mode: Deploy) {
        let manager = self.clone();
        self.tasks
            .spawn_keyed(record.key(), async move { manager.build_and_run(record, mode).await });
    }

    async fn build_and_run(&self, mut record: ServiceRecord, mode: Deploy) {
        let key = record.key();
        let revision = record.revision;

        record.service.status = ServiceStatus::Building;
        record.service.error = None;
        if !self.persist_current(&record) {
            return;
        }

        let deployed = match self.build_artifact(&mut record).await {
            Ok(true) => self.deploy(&record, mode).await,
            Ok(false) => return,
            Err(e) => Err(e),
        };

        match deployed {
            Ok(()) => {
                record.service.status = ServiceStatus::Running;
                record.updated_at = Some(Utc::now());
                match self.store.write_guarded(&record) {
                    Ok(GuardedWrite::Written) => {
                        info!(%key, revision, "build complete, service running");
                    }
                    Ok(GuardedWrite::Deleted) => {
                        warn!(%key, "service deleted during build, removing its instance");
                        self.remove_instance(&record).await;
                    }
                    Ok(GuardedWrite::Superseded) => {
                        debug!(%key, revision, "build superseded");
                    }
                    Err(e) => error!(%key, error = %e, "persisting build result failed"),
                }
            }
            Err(e) => {
                warn!(%key, revision, error = %e, "build failed");
                record.service.status = ServiceStatus::Error;
                record.service.error = Some(e.to_string());
                self.persist_current(&record);
            }
        }
    }

    /// Resolve and build, then record the artifact. Returns false if the
    /// record was deleted or superseded meanwhile.
    async fn build_artifact(&self, record: &mut ServiceRecord) -> ManagerResult<bool> {
        let resolved = self.resolver.resolve(&record.namespace, &record.service).await?;
        let artifact = match &self.builder {
            Some(builder) => {
                let mut input = record.service.clone();
                input.source = resolved;
                let artifact = builder.build(&input, &record.options).await?;
                debug!(key = %record.key(), builder = builder.name(), artifact = %artifact.reference, "artifact built");
                artifact.reference
            }
            None => resolved,
        };
        record.artifact = Some(artifact);
        Ok(self.persist_current(record))
    }

    /// Guarded write; true only if the record is still current.
    fn persist_current(&self, record: &ServiceRecord) -> bool {
        let key = record.key();
        match self.store.write_guarded(record) {
            Ok(GuardedWrite::Written) => true,
            Ok(outcome) => {
                debug!(%key, revision = record.revision, ?outcome, "background work abandoned");
                false
            }
            Err(e) => {
                error!(%key, error = %e, "persisting service record failed");
                false
            }
        }
    }

    pub(crate) async fn remove_instance(&self, record: &ServiceRecord) {
        let options = DeleteOptions::in_namespace(&record.namespace);
        match self.runtime.delete(&record.runnable_service(), &options).await {
            Ok(()) => {}
            Err(e) if e.is_not_found() => {}
            Err(e) => warn!(key = %record.key(), error = %e, "removing orphaned instance failed"),
        }
    }

    // -- Start / Stop -------------------------------------------------------

    /// Start the backend and the reconciliation loop. Idempotent.
    pub async fn start(&self) -> ManagerResult<()> {
        if self.lifecycle.running.swap(true, Ordering::SeqCst) {
            return Ok(());
        }
        if let Err(e) = self.runtime.start().await {
            self.lifecycle.running.store(false, Ordering::SeqCst);
            return Err(e.into());
        }

        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let handle = tokio::spawn(reconcile::run(self.clone(), shutdown_rx));
        *self.lifecycle.reconciler.lock().await = Some((shutdown_tx, handle));

        info!(
            runtime = self.runtime.name(),
            interval_secs = self.config.effective_reconcile_interval().as_secs(),
            builder = self.builder.as_ref().map(|b| b.name()).unwrap_or("none"),
            "service manager started"
        );
        Ok(())
    }

    /// Stop the reconciliation loop and the backend. Idempotent.
    pub async fn stop(&self) -> ManagerResult<()> {
        if !self.lifecycle.running.swap(false, Ordering::SeqCst) {
            return Ok(());
        }
        if let Some((shutdown_tx, handle)) = self.lifecycle.reconciler.lock().await.take() {
            let _ = shutdown_tx.send(true);
            if let Err(e) = handle.await {
                warn!(error = %e, "reconciler task ended abnormally");
            }
        }
        self.runtime.stop().await?;
        info!("service manager stopped");
        Ok(())
    }
}

/// Overlay a stored record with the backend's view of its instance.
pub(crate) fn merge(record: ServiceRecord, live: Option<&Service>) -> Service {
    let mut service = record.service;
    if let Some(error) = service.error.clone() {
        service.annotate_error(error);
    }
    if let Some(updated_at) = record.updated_at {
        service.annotate_started(updated_at);
    }
    if let Some(live) = live {
        service.status = live.status;
        if let Some(error) = live.reported_error() {
            service.annotate_error(error);
        }
    }
    service
}

#[async_trait]
impl Runtime for Manager {
    async fn create(&self, service: &Service, options: &CreateOptions) -> RuntimeResult<()> {
        Manager::create(self, service, options).await.map_err(RuntimeError::from)
    }

    async fn read(&self, options: &ReadOptions) -> RuntimeResult<Vec<Service>> {
        Manager::read(self, options).await.map_err(RuntimeError::from)
    }

    async fn update(&self, service: &Service, options: &UpdateOptions) -> RuntimeResult<()> {
        Manager::update(self, service, options).await.map_err(RuntimeError::from)
    }

    async fn delete(&self, service: &Service, options: &DeleteOptions) -> RuntimeResult<()> {
        Manager::delete(self, service, options).await.map_err(RuntimeError::from)
    }

    async fn start(&self) -> RuntimeResult<()> {
        Manager::start(self).await.map_err(RuntimeError::from)
    }

    async fn stop(&self) -> RuntimeResult<()> {
        Manager::stop(self).await.map_err(RuntimeError::from)
    }

    fn name(&self) -> &str {
        "manager"
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;
    use fleet_core::METADATA_ERROR;

    fn record() -> ServiceRecord {
        let svc = Service::new("billing").with_version("latest").with_source("./billing");
        ServiceRecord::new("default", svc, CreateOptions::in_namespace("default"))
    }

    #[test]
    fn merge_prefers_live_status_and_sets_started() {
        let mut rec = record();
        let at = Utc.with_ymd_and_hms(2024, 5, 1, 8, 0, 0).unwrap();
        rec.updated_at = Some(at);
        rec.service.status = ServiceStatus::Starting;

        let mut live = rec.service.clone();
        live.status = ServiceStatus::Running;

        let merged = merge(rec, Some(&live));
        assert_eq!(merged.status, ServiceStatus::Running);
        assert_eq!(merged.metadata["started"], "2024-05-01T08:00:00Z");
        assert_eq!(merged.started_at, Some(at));
        assert!(!merged.metadata.contains_key(METADATA_ERROR));
        assert_eq!(merged.error, None);
    }

    #[test]
    fn merge_exposes_stored_error_without_live_instance() {
        let mut rec = record();
        rec.service.status = ServiceStatus::Error;
        rec.service.error = Some("build failed".into());

        let merged = merge(rec, None);
        assert_eq!(merged.status, ServiceStatus::Error);
        assert_eq!(merged.error.as_deref(), Some("build failed"));
        assert_eq!(merged.metadata[METADATA_ERROR], "build failed");
    }

    #[test]
    fn merge_live_metadata_error_overrides() {
        let mut rec = record();
        rec.service.status = ServiceStatus::Running;

        let mut live = rec.service.clone();
        live.status = ServiceStatus::Error;
        live.metadata.insert(METADATA_ERROR.into(), "oom killed".into());

        let merged = merge(rec, Some(&live));
        assert_eq!(merged.status, ServiceStatus::Error);
        assert_eq!(merged.error.as_deref(), Some("oom killed"));
    }

    #[test]
    fn merge_keeps_description_source() {
        let mut rec = record();
        rec.artifact = Some("/var/lib/fleet/blobs/billing".into());
        let merged = merge(rec, None);
        assert_eq!(merged.source, "./billing");
    }
}
