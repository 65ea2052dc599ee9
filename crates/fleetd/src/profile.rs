//! Profiles: which store, blob store and backend a daemon runs with.

use std::fmt;
use std::str::FromStr;
use std::sync::Arc;

use anyhow::{Context, bail};
use tracing::info;

use fleet_core::FleetConfig;
use fleet_manager::{Manager, ManagerConfig};
use fleet_runtime::{MemoryRuntime, ProcessRuntime};
use fleet_state::{FsBlobStore, MemoryBlobStore, StateStore};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Profile {
    /// redb and blobs under the data directory, services as local processes.
    Local,
    /// Everything in memory; nothing is executed.
    Test,
}

impl FromStr for Profile {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> anyhow::Result<Self> {
        match s {
            "local" => Ok(Profile::Local),
            "test" => Ok(Profile::Test),
            other => bail!("unknown profile {other:?} (expected \"local\" or \"test\")"),
        }
    }
}

impl fmt::Display for Profile {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Profile::Local => "local",
            Profile::Test => "test",
        })
    }
}

/// Construct a manager for `profile` from the daemon configuration.
pub fn build(profile: Profile, config: &FleetConfig) -> anyhow::Result<Manager> {
    let manager_config = ManagerConfig::from_fleet(config)?;
    let manager = match profile {
        Profile::Local => {
            let data_dir = &config.store.data_dir;
            std::fs::create_dir_all(data_dir)
                .with_context(|| format!("creating data dir {}", data_dir.display()))?;

            let db_path = data_dir.join("fleet.redb");
            let store = StateStore::open(&db_path)?;
            info!(path = ?db_path, "state store opened");

            let blobs = FsBlobStore::open(data_dir.join("blobs"))?;
            Manager::new(
                Arc::new(ProcessRuntime::new()),
                Arc::new(store),
                Arc::new(blobs),
                manager_config,
            )
        }
        Profile::Test => Manager::new(
            Arc::new(MemoryRuntime::new()),
            Arc::new(StateStore::open_in_memory()?),
            Arc::new(MemoryBlobStore::new()),
            manager_config,
        ),
    };
    info!(%profile, "service manager constructed");
    Ok(manager)
}
