//! Read-through cache in front of an execution backend.
//!
//! Live-status reads are repeated by every control-plane read and by each
//! reconcile pass, so [`CachedRuntime`] keeps `read` results per filter for a
//! short TTL. Entries are bounded and evicted least-recently-used first.
//! Mutations that pass through the wrapper drop the cached reads of their
//! namespace, so callers never have to invalidate anything themselves.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use async_trait::async_trait;
use tracing::debug;

use fleet_core::{CreateOptions, DeleteOptions, ReadOptions, Service, UpdateOptions};

use crate::Runtime;
use crate::error::RuntimeResult;

/// Configuration for the read cache.
#[derive(Clone, Debug)]
pub struct CacheConfig {
    /// Time-to-live for cached reads (default: 5 seconds). Zero disables
    /// caching.
    pub ttl: Duration,
    /// Maximum number of cached filters (default: 256).
    pub max_entries: usize,
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            ttl: Duration::from_secs(5),
            max_entries: 256,
        }
    }
}

struct CacheEntry {
    services: Vec<Service>,
    inserted_at: Instant,
    last_accessed: Instant,
}

#[derive(Default)]
struct CacheState {
    entries: HashMap<ReadOptions, CacheEntry>,
    hits: u64,
    misses: u64,
    evictions: u64,
}

impl CacheState {
    fn evict_lru(&mut self) {
        let lru = self
            .entries
            .iter()
            .min_by_key(|(_, entry)| entry.last_accessed)
            .map(|(key, _)| key.clone());
        if let Some(key) = lru {
            self.entries.remove(&key);
            self.evictions += 1;
        }
    }
}

/// Wraps any [`Runtime`] with a TTL-bounded cache of `read` results.
pub struct CachedRuntime {
    inner: Arc<dyn Runtime>,
    config: CacheConfig,
    state: Mutex<CacheState>,
}

impl CachedRuntime {
    pub fn new(inner: Arc<dyn Runtime>, config: CacheConfig) -> Self {
        Self {
            inner,
            config,
            state: Mutex::new(CacheState::default()),
        }
    }

    /// (hits, misses, evictions)
    pub fn stats(&self) -> (u64, u64, u64) {
        self.state
            .lock()
            .map(|s| (s.hits, s.misses, s.evictions))
            .unwrap_or_default()
    }

    pub fn len(&self) -> usize {
        self.state.lock().map(|s| s.entries.len()).unwrap_or(0)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn lookup(&self, options: &ReadOptions) -> Option<Vec<Service>> {
        let mut state = self.state.lock().ok()?;
        let expired = match state.entries.get(options) {
            Some(entry) => entry.inserted_at.elapsed() > self.config.ttl,
            None => {
                state.misses += 1;
                return None;
            }
        };
        if expired {
            state.entries.remove(options);
            state.misses += 1;
            return None;
        }
        state.hits += 1;
        let entry = state.entries.get_mut(options)?;
        entry.last_accessed = Instant::now();
        Some(entry.services.clone())
    }

    fn store(&self, options: &ReadOptions, services: &[Service]) {
        let Ok(mut state) = self.state.lock() else {
            return;
        };
        if !state.entries.contains_key(options) && state.entries.len() >= self.config.max_entries {
            state.evict_lru();
        }
        let now = Instant::now();
        state.entries.insert(
            options.clone(),
            CacheEntry {
                services: services.to_vec(),
                inserted_at: now,
                last_accessed: now,
            },
        );
    }

    fn invalidate_namespace(&self, namespace: &str) {
        if let Ok(mut state) = self.state.lock() {
            state.entries.retain(|key, _| key.namespace != namespace);
        }
    }

    fn clear(&self) {
        if let Ok(mut state) = self.state.lock() {
            state.entries.clear();
        }
    }
}

#[async_trait]
impl Runtime for CachedRuntime {
    async fn create(&self, service: &Service, options: &CreateOptions) -> RuntimeResult<()> {
        let result = self.inner.create(service, options).await;
        self.invalidate_namespace(&options.namespace);
        result
    }

    async fn read(&self, options: &ReadOptions) -> RuntimeResult<Vec<Service>> {
        if self.config.ttl.is_zero() {
            return self.inner.read(options).await;
        }
        if let Some(services) = self.lookup(options) {
            debug!(namespace = %options.namespace, "runtime read served from cache");
            return Ok(services);
        }
        let services = self.inner.read(options).await?;
        self.store(options, &services);
        Ok(services)
    }

    async fn update(&self, service: &Service, options: &UpdateOptions) -> RuntimeResult<()> {
        let result = self.inner.update(service, options).await;
        self.invalidate_namespace(&options.namespace);
        result
    }

    async fn delete(&self, service: &Service, options: &DeleteOptions) -> RuntimeResult<()> {
        let result = self.inner.delete(service, options).await;
        self.invalidate_namespace(&options.namespace);
        result
    }

    async fn start(&self) -> RuntimeResult<()> {
        self.inner.start().await
    }

    async fn stop(&self) -> RuntimeResult<()> {
        self.clear();
        self.inner.stop().await
    }

    fn name(&self) -> &str {
        self.inner.name()
    }
}
