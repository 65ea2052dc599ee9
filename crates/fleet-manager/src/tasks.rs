//! Background task tracking for builds and blob cleanup.
//!
//! Every detached task the manager launches goes through a [`TaskTracker`]:
//!
//! - concurrency is bounded by a semaphore shared by all tasks;
//! - build tasks are keyed by service, so a newer build for the same key
//!   aborts the older one and a delete can cancel the build in flight;
//! - an in-flight counter lets callers wait until all work has drained.

use std::collections::HashMap;
use std::future::Future;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};

use tokio::sync::{Notify, Semaphore};
use tokio::task::JoinHandle;
use tracing::debug;

use fleet_core::ServiceKey;

#[derive(Default)]
struct InFlight {
    count: AtomicUsize,
    idle: Notify,
}

/// Decrements the in-flight count when a task finishes or is aborted.
struct TaskGuard {
    in_flight: Arc<InFlight>,
}

impl Drop for TaskGuard {
    fn drop(&mut self) {
        if self.in_flight.count.fetch_sub(1, Ordering::SeqCst) == 1 {
            self.in_flight.idle.notify_waiters();
        }
    }
}

type KeyedTasks = HashMap<ServiceKey, (u64, JoinHandle<()>)>;

pub struct TaskTracker {
    keyed: Arc<Mutex<KeyedTasks>>,
    next_id: AtomicU64,
    in_flight: Arc<InFlight>,
    permits: Arc<Semaphore>,
}

impl TaskTracker {
    pub fn new(max_concurrent: usize) -> Self {
        Self {
            keyed: Arc::new(Mutex::new(HashMap::new())),
            next_id: AtomicU64::new(0),
            in_flight: Arc::new(InFlight::default()),
            permits: Arc::new(Semaphore::new(max_concurrent.max(1))),
        }
    }

    fn guard(&self) -> TaskGuard {
        self.in_flight.count.fetch_add(1, Ordering::SeqCst);
        TaskGuard {
            in_flight: Arc::clone(&self.in_flight),
        }
    }

    /// Spawn a task owned by `key`, aborting any task the key already owns.
    pub fn spawn_keyed<F>(&self, key: ServiceKey, task: F)
    where
        F: Future<Output = ()> + Send + 'static,
    {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let guard = self.guard();
        let permits = Arc::clone(&self.permits);
        let keyed = Arc::clone(&self.keyed);
        let owner = key.clone();

        // Hold the map while spawning so the task cannot deregister before
        // it has been registered.
        let Ok(mut tasks) = self.keyed.lock() else {
            return;
        };
        let handle = tokio::spawn(async move {
            let _guard = guard;
            let Ok(_permit) = permits.acquire_owned().await else {
                return;
            };
            task.await;
            if let Ok(mut tasks) = keyed.lock() {
                if tasks.get(&owner).is_some_and(|(current, _)| *current == id) {
                    tasks.remove(&owner);
                }
            }
        });
        if let Some((_, previous)) = tasks.insert(key.clone(), (id, handle)) {
            previous.abort();
            debug!(%key, "superseded in-flight task aborted");
        }
    }

    /// Spawn an unkeyed task.
    pub fn spawn_detached<F>(&self, task: F)
    where
        F: Future<Output = ()> + Send + 'static,
    {
        let guard = self.guard();
        let permits = Arc::clone(&self.permits);
        tokio::spawn(async move {
            let _guard = guard;
            let Ok(_permit) = permits.acquire_owned().await else {
                return;
            };
            task.await;
        });
    }

    /// Abort the task owned by `key` and wait until it has stopped running.
    /// Returns true if there was one.
    pub async fn cancel(&self, key: &ServiceKey) -> bool {
        let entry = self.keyed.lock().ok().and_then(|mut tasks| tasks.remove(key));
        match entry {
            Some((_, handle)) => {
                handle.abort();
                // Either cancelled or already finished; both mean it is no
                // longer touching the backend or the store.
                let _ = handle.await;
                true
            }
            None => false,
        }
    }

    pub fn is_active(&self, key: &ServiceKey) -> bool {
        self.keyed
            .lock()
            .map(|tasks| tasks.contains_key(key))
            .unwrap_or(false)
    }

    pub fn in_flight(&self) -> usize {
        self.in_flight.count.load(Ordering::SeqCst)
    }

    /// Wait until no tracked task is running.
    pub async fn wait_idle(&self) {
        loop {
            let notified = self.in_flight.idle.notified();
            if self.in_flight() == 0 {
                return;
            }
            notified.await;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;
    use tokio::sync::oneshot;

    fn key(name: &str) -> ServiceKey {
        ServiceKey {
            namespace: "default".into(),
            name: name.into(),
            version: "latest".into(),
        }
    }

    #[tokio::test]
    async fn wait_idle_returns_after_tasks_finish() {
        let tracker = TaskTracker::new(2);
        let done = Arc::new(AtomicUsize::new(0));
        for _ in 0..3 {
            let done = Arc::clone(&done);
            tracker.spawn_detached(async move {
                tokio::time::sleep(Duration::from_millis(10)).await;
                done.fetch_add(1, Ordering::SeqCst);
            });
        }

        tracker.wait_idle().await;
        assert_eq!(done.load(Ordering::SeqCst), 3);
        assert_eq!(tracker.in_flight(), 0);
    }

    #[tokio::test]
    async fn keyed_task_deregisters_on_completion() {
        let tracker = TaskTracker::new(1);
        tracker.spawn_keyed(key("billing"), async {});
        tracker.wait_idle().await;
        assert!(!tracker.is_active(&key("billing")));
    }

    #[tokio::test]
    async fn newer_keyed_task_aborts_older() {
        let tracker = TaskTracker::new(4);
        let (tx, rx) = oneshot::channel::<()>();
        let first_finished = Arc::new(AtomicUsize::new(0));

        let flag = Arc::clone(&first_finished);
        tracker.spawn_keyed(key("billing"), async move {
            let _ = rx.await;
            flag.fetch_add(1, Ordering::SeqCst);
        });
        tracker.spawn_keyed(key("billing"), async {});
        drop(tx);

        tracker.wait_idle().await;
        assert_eq!(first_finished.load(Ordering::SeqCst), 0);
        assert!(!tracker.is_active(&key("billing")));
    }

    #[tokio::test]
    async fn cancel_stops_the_task() {
        let tracker = TaskTracker::new(1);
        tracker.spawn_keyed(key("billing"), async {
            tokio::time::sleep(Duration::from_secs(60)).await;
        });
        assert!(tracker.is_active(&key("billing")));

        assert!(tracker.cancel(&key("billing")).await);
        assert!(!tracker.cancel(&key("billing")).await);
        tracker.wait_idle().await;
        assert_eq!(tracker.in_flight(), 0);
    }

    #[tokio::test]
    async fn concurrency_is_bounded() {
        let tracker = TaskTracker::new(1);
        let active = Arc::new(AtomicUsize::new(0));
        let peak = Arc::new(AtomicUsize::new(0));
        for _ in 0..4 {
            let active = Arc::clone(&active);
            let peak = Arc::clone(&peak);
            tracker.spawn_detached(async move {
                let now = active.fetch_add(1, Ordering::SeqCst) + 1;
                peak.fetch_max(now, Ordering::SeqCst);
                tokio::time::sleep(Duration::from_millis(5)).await;
                active.fetch_sub(1, Ordering::SeqCst);
            });
        }
        tracker.wait_idle().await;
        assert_eq!(peak.load(Ordering::SeqCst), 1);
    }
}
