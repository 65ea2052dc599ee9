//! In-memory execution backend.
//!
//! Tracks instances in a map instead of running anything. Used by the `test`
//! profile and as a controllable backend in tests: instances can be crashed,
//! have their status overridden, or have creates fail on demand.

use std::collections::BTreeMap;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Mutex, MutexGuard};

use async_trait::async_trait;
use chrono::Utc;
use tracing::debug;

use fleet_core::{CreateOptions, DeleteOptions, ReadOptions, Service, ServiceStatus, UpdateOptions};

use crate::Runtime;
use crate::error::{RuntimeError, RuntimeResult};

/// (namespace, name:version)
type InstanceKey = (String, String);

#[derive(Default)]
struct Counters {
    creates: AtomicUsize,
    reads: AtomicUsize,
    updates: AtomicUsize,
    deletes: AtomicUsize,
}

pub struct MemoryRuntime {
    instances: Mutex<BTreeMap<InstanceKey, Service>>,
    /// Status assigned to newly created instances.
    initial_status: ServiceStatus,
    create_error: Mutex<Option<String>>,
    running: AtomicBool,
    counters: Counters,
}

impl Default for MemoryRuntime {
    fn default() -> Self {
        Self::new()
    }
}

impl MemoryRuntime {
    pub fn new() -> Self {
        Self::with_status(ServiceStatus::Running)
    }

    pub fn with_status(initial_status: ServiceStatus) -> Self {
        Self {
            instances: Mutex::new(BTreeMap::new()),
            initial_status,
            create_error: Mutex::new(None),
            running: AtomicBool::new(false),
            counters: Counters::default(),
        }
    }

    fn lock(&self) -> RuntimeResult<MutexGuard<'_, BTreeMap<InstanceKey, Service>>> {
        self.instances
            .lock()
            .map_err(|_| RuntimeError::Backend(anyhow::anyhow!("instance map poisoned")))
    }

    /// Make every subsequent create fail with `message` (or succeed again with `None`).
    pub fn set_create_error(&self, message: Option<&str>) {
        if let Ok(mut err) = self.create_error.lock() {
            *err = message.map(str::to_string);
        }
    }

    /// Drop an instance as if its process died. Returns true if it existed.
    pub fn crash(&self, namespace: &str, name: &str, version: &str) -> bool {
        self.lock()
            .map(|mut m| {
                m.remove(&(namespace.to_string(), format!("{name}:{version}")))
                    .is_some()
            })
            .unwrap_or(false)
    }

    /// Override the live status (and error annotation) of an instance.
    pub fn set_status(
        &self,
        namespace: &str,
        name: &str,
        version: &str,
        status: ServiceStatus,
        error: Option<&str>,
    ) -> bool {
        let Ok(mut instances) = self.lock() else {
            return false;
        };
        match instances.get_mut(&(namespace.to_string(), format!("{name}:{version}"))) {
            Some(svc) => {
                svc.status = status;
                svc.error = error.map(str::to_string);
                true
            }
            None => false,
        }
    }

    /// Live instance by identity.
    pub fn instance(&self, namespace: &str, name: &str, version: &str) -> Option<Service> {
        self.lock()
            .ok()?
            .get(&(namespace.to_string(), format!("{name}:{version}")))
            .cloned()
    }

    pub fn instance_count(&self) -> usize {
        self.lock().map(|m| m.len()).unwrap_or(0)
    }

    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::SeqCst)
    }

    pub fn create_calls(&self) -> usize {
        self.counters.creates.load(Ordering::SeqCst)
    }

    pub fn read_calls(&self) -> usize {
        self.counters.reads.load(Ordering::SeqCst)
    }

    pub fn update_calls(&self) -> usize {
        self.counters.updates.load(Ordering::SeqCst)
    }

    pub fn delete_calls(&self) -> usize {
        self.counters.deletes.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl Runtime for MemoryRuntime {
    async fn create(&self, service: &Service, options: &CreateOptions) -> RuntimeResult<()> {
        self.counters.creates.fetch_add(1, Ordering::SeqCst);
        let injected = self.create_error.lock().ok().and_then(|e| e.clone());
        if let Some(message) = injected {
            return Err(RuntimeError::Backend(anyhow::anyhow!(message)));
        }

        let key = (options.namespace.clone(), service.live_key());
        let mut instances = self.lock()?;
        if instances.contains_key(&key) {
            return Err(RuntimeError::AlreadyExists(service.live_key()));
        }
        let mut live = service.clone();
        live.status = self.initial_status;
        live.error = None;
        live.started_at = Some(Utc::now());
        instances.insert(key, live);
        debug!(namespace = %options.namespace, service = %service.live_key(), "memory instance created");
        Ok(())
    }

    async fn read(&self, options: &ReadOptions) -> RuntimeResult<Vec<Service>> {
        self.counters.reads.fetch_add(1, Ordering::SeqCst);
        let instances = self.lock()?;
        Ok(instances
            .iter()
            .filter(|((ns, _), svc)| {
                ns == &options.namespace && options.matches(&svc.name, &svc.version)
            })
            .map(|(_, svc)| svc.clone())
            .collect())
    }

    async fn update(&self, service: &Service, options: &UpdateOptions) -> RuntimeResult<()> {
        self.counters.updates.fetch_add(1, Ordering::SeqCst);
        let mut instances = self.lock()?;
        let live = instances
            .get_mut(&(options.namespace.clone(), service.live_key()))
            .ok_or_else(|| RuntimeError::NotFound(service.live_key()))?;
        live.source = service.source.clone();
        live.status = self.initial_status;
        live.error = None;
        live.started_at = Some(Utc::now());
        Ok(())
    }

    async fn delete(&self, service: &Service, options: &DeleteOptions) -> RuntimeResult<()> {
        self.counters.deletes.fetch_add(1, Ordering::SeqCst);
        let mut instances = self.lock()?;
        instances
            .remove(&(options.namespace.clone(), service.live_key()))
            .map(|_| ())
            .ok_or_else(|| RuntimeError::NotFound(service.live_key()))
    }

    async fn start(&self) -> RuntimeResult<()> {
        self.running.store(true, Ordering::SeqCst);
        Ok(())
    }

    async fn stop(&self) -> RuntimeResult<()> {
        self.running.store(false, Ordering::SeqCst);
        Ok(())
    }

    fn name(&self) -> &str {
        "memory"
    }
}
