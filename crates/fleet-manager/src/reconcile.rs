//! Re-drives stored services the backend no longer runs.

use std::collections::HashSet;
use std::fmt;

use tokio::sync::watch;
use tracing::{debug, error, info, warn};

use fleet_core::{ReadOptions, ServiceStatus};
use fleet_runtime::Runtime;
use fleet_state::{GuardedWrite, RecordFilter, ServiceRecord};

use crate::error::ManagerResult;
use crate::manager::{Deploy, Manager};

/// Outcome counts of one reconciliation pass.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ReconcileReport {
    /// Records the backend reports live.
    pub running: usize,
    /// Records recreated in the backend.
    pub restarted: usize,
    /// Records whose build was enqueued again.
    pub rebuilt: usize,
    /// Records left alone: intentionally down or with work in flight.
    pub skipped: usize,
    /// Records or namespaces that could not be reconciled.
    pub failed: usize,
}

impl fmt::Display for ReconcileReport {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "running={} restarted={} rebuilt={} skipped={} failed={}",
            self.running, self.restarted, self.rebuilt, self.skipped, self.failed
        )
    }
}

impl Manager {
    /// Run one reconciliation pass over every namespace.
    pub async fn reconcile(&self) -> ManagerResult<ReconcileReport> {
        let mut report = ReconcileReport::default();
        for namespace in self.store.namespaces()? {
            if let Err(e) = self.reconcile_namespace(&namespace, &mut report).await {
                warn!(%namespace, error = %e, "reconciling namespace failed");
                report.failed += 1;
            }
        }
        Ok(report)
    }

    async fn reconcile_namespace(
        &self,
        namespace: &str,
        report: &mut ReconcileReport,
    ) -> ManagerResult<()> {
        let records = self.store.read(namespace, &RecordFilter::all())?;
        let live: HashSet<String> = self
            .runtime
            .read(&ReadOptions::in_namespace(namespace))
            .await?
            .into_iter()
            .map(|s| s.live_key())
            .collect();

        for record in records {
            if live.contains(&record.service.live_key()) {
                report.running += 1;
                continue;
            }
            let key = record.key();
            let status = record.service.status;
            if status.is_intentionally_down() {
                debug!(%key, %status, "not live, left down");
                report.skipped += 1;
                continue;
            }
            if self.tasks.is_active(&key) {
                debug!(%key, "not live, task in flight");
                report.skipped += 1;
                continue;
            }
            if self.builder.is_some()
                && (record.artifact.is_none() || status == ServiceStatus::Pending)
            {
                info!(%key, "not live, re-enqueueing build");
                self.spawn_build(record, Deploy::Create);
                report.rebuilt += 1;
                continue;
            }
            match self.restart(record).await {
                Ok(()) => report.restarted += 1,
                Err(e) => {
                    warn!(%key, error = %e, "restart failed");
                    report.failed += 1;
                }
            }
        }
        Ok(())
    }

    async fn restart(&self, mut record: ServiceRecord) -> ManagerResult<()> {
        let key = record.key();
        self.deploy(&record, Deploy::Create).await?;

        record.service.status = ServiceStatus::Starting;
        record.service.error = None;
        match self.store.write_guarded(&record)? {
            GuardedWrite::Written => info!(%key, "service restarted"),
            GuardedWrite::Deleted => {
                warn!(%key, "service deleted during restart, removing its instance");
                self.remove_instance(&record).await;
            }
            GuardedWrite::Superseded => debug!(%key, "restart superseded by a newer revision"),
        }
        Ok(())
    }
}

/// Reconcile once immediately, then every `reconcile_interval` until
/// `shutdown` changes.
pub(crate) async fn run(manager: Manager, mut shutdown: watch::Receiver<bool>) {
    let interval = manager.config.effective_reconcile_interval();
    if interval != manager.config.reconcile_interval {
        warn!(
            configured_ms = manager.config.reconcile_interval.as_millis() as u64,
            interval_ms = interval.as_millis() as u64,
            "reconcile interval raised to the minimum"
        );
    }
    info!(interval_secs = interval.as_secs(), "reconciler started");

    loop {
        match manager.reconcile().await {
            Ok(report) => debug!(%report, "reconcile pass complete"),
            Err(e) => error!(error = %e, "reconcile pass failed"),
        }
        tokio::select! {
            _ = tokio::time::sleep(interval) => {}
            _ = shutdown.changed() => {
                info!("reconciler shutting down");
                break;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn report_display() {
        let report = ReconcileReport {
            running: 2,
            restarted: 1,
            ..Default::default()
        };
        assert_eq!(
            report.to_string(),
            "running=2 restarted=1 rebuilt=0 skipped=0 failed=0"
        );
    }
}
