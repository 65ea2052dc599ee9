//! fleetd — the Fleet daemon.
//!
//! Loads `fleet.toml`, builds the service manager for the selected profile,
//! seeds the services declared in the config, and runs until Ctrl-C.
//!
//! # Usage
//!
//! ```text
//! fleetd run --config /etc/fleet/fleet.toml --data-dir /var/lib/fleet
//! fleetd check --config /etc/fleet/fleet.toml
//! fleetd default-config > fleet.toml
//! ```

mod profile;

use std::path::PathBuf;
use std::time::Duration;

use anyhow::Context;
use clap::{Parser, Subcommand, ValueEnum};
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

use fleet_core::{FleetConfig, ReadOptions};
use fleet_manager::Manager;

use crate::profile::Profile;

/// How long shutdown waits for in-flight builds and cleanups.
const DRAIN_TIMEOUT: Duration = Duration::from_secs(30);

#[derive(Parser)]
#[command(name = "fleetd", about = "Fleet service manager daemon")]
struct Cli {
    /// Log output format.
    #[arg(long, value_enum, default_value_t = LogFormat::Text, global = true)]
    log_format: LogFormat,

    #[command(subcommand)]
    command: Command,
}

#[derive(Clone, Copy, ValueEnum)]
enum LogFormat {
    Text,
    Json,
}

#[derive(Subcommand)]
enum Command {
    /// Run the service manager until interrupted.
    Run {
        /// Path to fleet.toml. Defaults apply when omitted.
        #[arg(long)]
        config: Option<PathBuf>,

        /// Profile to run with ("local" or "test"), overriding the config.
        #[arg(long)]
        profile: Option<String>,

        /// Data directory for persistent state, overriding the config.
        #[arg(long)]
        data_dir: Option<PathBuf>,
    },
    /// Validate a configuration file and exit.
    Check {
        #[arg(long)]
        config: PathBuf,
    },
    /// Print the default configuration as TOML.
    DefaultConfig,
}

fn init_tracing(format: LogFormat) {
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new("info,fleetd=debug,fleet=debug"));
    let builder = tracing_subscriber::fmt().with_env_filter(filter);
    match format {
        LogFormat::Text => builder.init(),
        LogFormat::Json => builder.json().init(),
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();
    init_tracing(cli.log_format);

    match cli.command {
        Command::Run {
            config,
            profile,
            data_dir,
        } => {
            let mut fleet = match config {
                Some(path) => FleetConfig::from_file(&path)?,
                None => FleetConfig::default(),
            };
            if let Some(profile) = profile {
                fleet.runtime.profile = profile;
            }
            if let Some(data_dir) = data_dir {
                fleet.store.data_dir = data_dir;
            }
            run(fleet).await
        }
        Command::Check { config } => {
            let fleet = FleetConfig::from_file(&config)?;
            fleet.runtime.profile.parse::<Profile>()?;
            println!(
                "{}: ok ({} seed service(s), profile {})",
                config.display(),
                fleet.services.len(),
                fleet.runtime.profile
            );
            Ok(())
        }
        Command::DefaultConfig => {
            print!("{}", FleetConfig::default().to_toml_string()?);
            Ok(())
        }
    }
}

async fn run(config: FleetConfig) -> anyhow::Result<()> {
    let profile: Profile = config.runtime.profile.parse()?;
    info!(%profile, data_dir = ?config.store.data_dir, "Fleet daemon starting");

    let manager = profile::build(profile, &config)?;
    manager.start().await.context("starting service manager")?;
    seed(&manager, &config).await;

    tokio::signal::ctrl_c()
        .await
        .context("installing Ctrl-C handler")?;
    info!("shutdown signal received");

    if let Err(e) = manager.stop().await {
        warn!(error = %e, "service manager did not stop cleanly");
    }
    if tokio::time::timeout(DRAIN_TIMEOUT, manager.wait_for_tasks())
        .await
        .is_err()
    {
        warn!(timeout_secs = DRAIN_TIMEOUT.as_secs(), "background tasks still running at exit");
    }

    info!("Fleet daemon stopped");
    Ok(())
}

/// Create the services declared in the config that are not stored yet.
async fn seed(manager: &Manager, config: &FleetConfig) {
    for seed in &config.services {
        let service = seed.to_service();
        let options = seed.to_options();
        let namespace = if options.namespace.is_empty() {
            manager.config().default_namespace.clone()
        } else {
            options.namespace.clone()
        };

        let filter = ReadOptions::in_namespace(&namespace)
            .service(&service.name)
            .version(&service.version);
        match manager.read(&filter).await {
            Ok(existing) if !existing.is_empty() => {
                info!(%namespace, service = %service.live_key(), "seed service already stored");
                continue;
            }
            Ok(_) => {}
            Err(e) => {
                warn!(%namespace, service = %service.live_key(), error = %e, "checking seed service failed");
                continue;
            }
        }

        match manager.create(&service, &options).await {
            Ok(()) => info!(%namespace, service = %service.live_key(), "seed service created"),
            Err(e) => warn!(%namespace, service = %service.live_key(), error = %e, "seed service not created"),
        }
    }
}
