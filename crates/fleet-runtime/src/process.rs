//! Local process execution backend.
//!
//! Each service instance is one child process, started from the service's
//! resolved source directory with the entrypoint given in its
//! [`CreateOptions::command`]. Exited children stay listed (as `stopped` or
//! `error`) until they are deleted or recreated.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::process::{ExitStatus, Stdio};
use std::sync::atomic::{AtomicBool, Ordering};

use anyhow::Context;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use tokio::process::{Child, Command};
use tokio::sync::Mutex;
use tracing::{debug, info, warn};

use fleet_core::{CreateOptions, DeleteOptions, ReadOptions, Service, ServiceStatus, UpdateOptions};

use crate::Runtime;
use crate::error::{RuntimeError, RuntimeResult};

/// (namespace, name:version)
type ProcessKey = (String, String);

struct ManagedProcess {
    service: Service,
    options: CreateOptions,
    child: Child,
    started_at: DateTime<Utc>,
}

impl ManagedProcess {
    /// Snapshot of the service with its live status.
    fn observe(&mut self) -> Service {
        let mut live = self.service.clone();
        live.started_at = Some(self.started_at);
        match self.child.try_wait() {
            Ok(None) => live.status = ServiceStatus::Running,
            Ok(Some(status)) if status.success() => live.status = ServiceStatus::Stopped,
            Ok(Some(status)) => {
                live.status = ServiceStatus::Error;
                live.error = Some(describe_exit(status));
            }
            Err(e) => {
                live.status = ServiceStatus::Unknown;
                live.error = Some(e.to_string());
            }
        }
        live
    }

    fn has_exited(&mut self) -> bool {
        !matches!(self.child.try_wait(), Ok(None))
    }

    async fn terminate(&mut self) {
        if let Err(e) = self.child.kill().await {
            // Already reaped children report InvalidInput; nothing to do.
            debug!(service = %self.service.live_key(), error = %e, "kill failed");
        }
    }
}

fn describe_exit(status: ExitStatus) -> String {
    match status.code() {
        Some(code) => format!("exited with code {code}"),
        None => format!("terminated: {status}"),
    }
}

/// Runs services as local child processes.
pub struct ProcessRuntime {
    processes: Mutex<HashMap<ProcessKey, ManagedProcess>>,
    running: AtomicBool,
}

impl Default for ProcessRuntime {
    fn default() -> Self {
        Self::new()
    }
}

impl ProcessRuntime {
    pub fn new() -> Self {
        Self {
            processes: Mutex::new(HashMap::new()),
            running: AtomicBool::new(false),
        }
    }

    fn spawn(service: &Service, options: &CreateOptions) -> RuntimeResult<Child> {
        let Some((program, rest)) = options.command.split_first() else {
            return Err(RuntimeError::InvalidService(format!(
                "{}: no command configured",
                service.live_key()
            )));
        };

        let workdir = Path::new(&service.source);
        let workdir = workdir.is_dir().then(|| workdir.to_path_buf());
        let program = resolve_program(program, workdir.as_deref());

        let mut cmd = Command::new(&program);
        cmd.args(rest)
            .args(&options.args)
            .envs(&options.env)
            .env("FLEET_SERVICE_NAME", &service.name)
            .env("FLEET_SERVICE_VERSION", &service.version)
            .env("FLEET_SERVICE_NAMESPACE", &options.namespace)
            .env("FLEET_SERVICE_SOURCE", &service.source)
            .stdin(Stdio::null())
            .kill_on_drop(true);
        if let Some(dir) = &workdir {
            cmd.current_dir(dir);
        }

        let child = cmd
            .spawn()
            .with_context(|| format!("spawning {} for {}", program.display(), service.live_key()))?;
        info!(
            namespace = %options.namespace,
            service = %service.live_key(),
            pid = child.id(),
            "process started"
        );
        Ok(child)
    }

    async fn launch(&self, service: &Service, options: &CreateOptions) -> RuntimeResult<ManagedProcess> {
        let child = Self::spawn(service, options)?;
        Ok(ManagedProcess {
            service: service.clone(),
            options: options.clone(),
            child,
            started_at: Utc::now(),
        })
    }
}

/// Relative programs with a path component run relative to the workdir.
fn resolve_program(program: &str, workdir: Option<&Path>) -> PathBuf {
    let path = Path::new(program);
    match workdir {
        Some(dir) if path.is_relative() && path.components().count() > 1 => dir.join(path),
        _ => path.to_path_buf(),
    }
}

#[async_trait]
impl Runtime for ProcessRuntime {
    async fn create(&self, service: &Service, options: &CreateOptions) -> RuntimeResult<()> {
        let key = (options.namespace.clone(), service.live_key());
        let mut processes = self.processes.lock().await;
        if let Some(existing) = processes.get_mut(&key) {
            if !existing.has_exited() {
                return Err(RuntimeError::AlreadyExists(service.live_key()));
            }
            debug!(service = %service.live_key(), "replacing exited process");
        }
        let process = self.launch(service, options).await?;
        processes.insert(key, process);
        Ok(())
    }

    async fn read(&self, options: &ReadOptions) -> RuntimeResult<Vec<Service>> {
        let mut processes = self.processes.lock().await;
        let mut services: Vec<Service> = processes
            .iter_mut()
            .filter(|((ns, _), p)| {
                ns == &options.namespace && options.matches(&p.service.name, &p.service.version)
            })
            .map(|(_, p)| p.observe())
            .collect();
        services.sort_by(|a, b| a.live_key().cmp(&b.live_key()));
        Ok(services)
    }

    async fn update(&self, service: &Service, options: &UpdateOptions) -> RuntimeResult<()> {
        let key = (options.namespace.clone(), service.live_key());
        let mut processes = self.processes.lock().await;
        let existing = processes
            .get_mut(&key)
            .ok_or_else(|| RuntimeError::NotFound(service.live_key()))?;
        existing.terminate().await;

        let create_options = existing.options.clone();
        let process = self.launch(service, &create_options).await?;
        processes.insert(key, process);
        info!(namespace = %options.namespace, service = %service.live_key(), "process replaced");
        Ok(())
    }

    async fn delete(&self, service: &Service, options: &DeleteOptions) -> RuntimeResult<()> {
        let key = (options.namespace.clone(), service.live_key());
        let mut process = self
            .processes
            .lock()
            .await
            .remove(&key)
            .ok_or_else(|| RuntimeError::NotFound(service.live_key()))?;
        process.terminate().await;
        info!(namespace = %options.namespace, service = %service.live_key(), "process stopped");
        Ok(())
    }

    async fn start(&self) -> RuntimeResult<()> {
        self.running.store(true, Ordering::SeqCst);
        debug!("process runtime started");
        Ok(())
    }

    async fn stop(&self) -> RuntimeResult<()> {
        if !self.running.swap(false, Ordering::SeqCst) {
            return Ok(());
        }
        let mut processes = self.processes.lock().await;
        let count = processes.len();
        for (_, mut process) in processes.drain() {
            process.terminate().await;
        }
        if count > 0 {
            warn!(count, "process runtime stopped, children terminated");
        }
        Ok(())
    }

    fn name(&self) -> &str {
        "local"
    }
}
