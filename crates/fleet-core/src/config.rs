//! fleet.toml configuration parser.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{Context, bail};
use serde::{Deserialize, Serialize};

use crate::options::CreateOptions;
use crate::types::{DEFAULT_VERSION, Service};

pub const DEFAULT_NAMESPACE: &str = "default";

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct FleetConfig {
    #[serde(default)]
    pub manager: ManagerSection,
    #[serde(default)]
    pub runtime: RuntimeSection,
    #[serde(default)]
    pub store: StoreSection,
    /// Services created at startup when not already stored.
    #[serde(default)]
    pub services: Vec<SeedService>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ManagerSection {
    #[serde(default = "default_namespace")]
    pub default_namespace: String,
    #[serde(default = "default_reconcile_interval")]
    pub reconcile_interval: String,
    #[serde(default = "default_max_concurrent_tasks")]
    pub max_concurrent_tasks: usize,
    #[serde(default = "default_cleanup_retries")]
    pub cleanup_retries: u32,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RuntimeSection {
    /// "local" runs processes, "test" keeps everything in memory.
    #[serde(default = "default_profile")]
    pub profile: String,
    #[serde(default = "default_cache_ttl")]
    pub cache_ttl: String,
    #[serde(default = "default_cache_max_entries")]
    pub cache_max_entries: usize,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StoreSection {
    #[serde(default = "default_data_dir")]
    pub data_dir: PathBuf,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SeedService {
    pub name: String,
    pub version: Option<String>,
    pub namespace: Option<String>,
    pub source: String,
    #[serde(default)]
    pub command: Vec<String>,
    #[serde(default)]
    pub args: Vec<String>,
    #[serde(default)]
    pub env: HashMap<String, String>,
    #[serde(default)]
    pub metadata: HashMap<String, String>,
}

fn default_namespace() -> String {
    DEFAULT_NAMESPACE.to_string()
}

fn default_reconcile_interval() -> String {
    "30s".to_string()
}

fn default_max_concurrent_tasks() -> usize {
    4
}

fn default_cleanup_retries() -> u32 {
    3
}

fn default_profile() -> String {
    "local".to_string()
}

fn default_cache_ttl() -> String {
    "5s".to_string()
}

fn default_cache_max_entries() -> usize {
    256
}

fn default_data_dir() -> PathBuf {
    PathBuf::from("/var/lib/fleet")
}

impl Default for ManagerSection {
    fn default() -> Self {
        Self {
            default_namespace: default_namespace(),
            reconcile_interval: default_reconcile_interval(),
            max_concurrent_tasks: default_max_concurrent_tasks(),
            cleanup_retries: default_cleanup_retries(),
        }
    }
}

impl Default for RuntimeSection {
    fn default() -> Self {
        Self {
            profile: default_profile(),
            cache_ttl: default_cache_ttl(),
            cache_max_entries: default_cache_max_entries(),
        }
    }
}

impl Default for StoreSection {
    fn default() -> Self {
        Self {
            data_dir: default_data_dir(),
        }
    }
}

impl FleetConfig {
    pub fn from_file(path: &Path) -> anyhow::Result<Self> {
        let content = std::fs::read_to_string(path)
            .with_context(|| format!("reading config {}", path.display()))?;
        let config: FleetConfig = toml::from_str(&content)
            .with_context(|| format!("parsing config {}", path.display()))?;
        config.validate()?;
        Ok(config)
    }

    pub fn to_toml_string(&self) -> anyhow::Result<String> {
        Ok(toml::to_string_pretty(self)?)
    }

    /// Check values that serde cannot check on its own.
    pub fn validate(&self) -> anyhow::Result<()> {
        let interval = parse_duration(&self.manager.reconcile_interval)
            .context("manager.reconcile_interval")?;
        if interval.is_zero() {
            bail!("manager.reconcile_interval must be greater than zero");
        }
        parse_duration(&self.runtime.cache_ttl).context("runtime.cache_ttl")?;
        if self.manager.max_concurrent_tasks == 0 {
            bail!("manager.max_concurrent_tasks must be at least 1");
        }
        if self.manager.default_namespace.is_empty() {
            bail!("manager.default_namespace must not be empty");
        }
        for seed in &self.services {
            seed.to_service()
                .validate()
                .with_context(|| format!("services entry {:?}", seed.name))?;
        }
        Ok(())
    }
}

impl ManagerSection {
    pub fn reconcile_interval(&self) -> anyhow::Result<Duration> {
        parse_duration(&self.reconcile_interval)
    }
}

impl RuntimeSection {
    pub fn cache_ttl(&self) -> anyhow::Result<Duration> {
        parse_duration(&self.cache_ttl)
    }
}

impl SeedService {
    pub fn to_service(&self) -> Service {
        let mut service = Service::new(&self.name)
            .with_version(self.version.as_deref().unwrap_or(DEFAULT_VERSION))
            .with_source(&self.source);
        service.metadata = self.metadata.clone();
        service
    }

    pub fn to_options(&self) -> CreateOptions {
        CreateOptions {
            namespace: self.namespace.clone().unwrap_or_default(),
            command: self.command.clone(),
            args: self.args.clone(),
            env: self.env.clone(),
            target: None,
        }
    }
}

/// Parse a duration string like "500ms", "30s", "5m" or "1h".
pub fn parse_duration(s: &str) -> anyhow::Result<Duration> {
    let s = s.trim();
    let (digits, unit) = match s.find(|c: char| !c.is_ascii_digit()) {
        Some(idx) => s.split_at(idx),
        None => (s, "s"),
    };
    let value: u64 = digits
        .parse()
        .with_context(|| format!("invalid duration {s:?}"))?;
    let secs_per_unit = match unit {
        "ms" => return Ok(Duration::from_millis(value)),
        "s" => 1,
        "m" => 60,
        "h" => 3600,
        other => bail!("unknown duration unit {other:?} in {s:?}"),
    };
    let secs = value
        .checked_mul(secs_per_unit)
        .with_context(|| format!("duration {s:?} out of range"))?;
    Ok(Duration::from_secs(secs))
}
