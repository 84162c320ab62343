// SPDX-License-Identifier: Apache-2.0
// Copyright 2025 tunnelkeep contributors

// tunnelkeep - Daemon
// Keeps one SSH forwarding session alive across network changes and sleep.

mod backoff;
mod classify;
mod debounce;
mod doctor;
mod known_hosts;
mod last_error;
mod monitor;
mod supervisor;
mod transport;

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use tunnelkeep_common::{Config, DoctorStatus, LogSink, MemoryLogSink, SessionState, TriggerReason};

use debounce::EventDebouncer;
use known_hosts::{HostTrustStore, SharedTrustStore};
use supervisor::Supervisor;
use transport::RusshTransport;

const SHUTDOWN_GRACE: Duration = Duration::from_secs(5);

#[derive(Parser)]
#[command(name = "tunnelkeepd", version, about = "Self-healing SSH tunnel daemon")]
struct Cli {
    /// Path to the config file (defaults to <config_dir>/tunnelkeep/tunnelkeep.toml)
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Option<Command>,
}

#[derive(Subcommand)]
enum Command {
    /// Run the supervisor until interrupted (default)
    Run,
    /// Read-only health sweep of config, key, ports, and remote
    Doctor,
    /// Forget all pinned host keys
    ResetHosts,
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "tunnelkeepd=info".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    let cli = Cli::parse();
    match cli.command.unwrap_or(Command::Run) {
        Command::Run => run(cli.config).await,
        Command::Doctor => run_doctor(cli.config).await,
        Command::ResetHosts => reset_hosts(),
    }
}

fn config_path(override_path: Option<PathBuf>) -> Result<PathBuf> {
    match override_path {
        Some(path) => Ok(path),
        None => Config::default_path().context("Could not determine config directory"),
    }
}

fn load_config(override_path: Option<PathBuf>) -> Result<Config, tunnelkeep_common::Error> {
    let path = config_path(override_path)
        .map_err(|e| tunnelkeep_common::Error::Persistence(e.to_string()))?;
    let text = std::fs::read_to_string(&path)?;
    Ok(Config::parse(&text)?)
}

async fn run(config_override: Option<PathBuf>) -> Result<()> {
    info!("tunnelkeepd {} starting", env!("CARGO_PKG_VERSION"));

    let config = load_config(config_override).context(
        "Failed to load config; run `tunnelkeepd doctor` or create the config file first",
    )?;
    info!(
        "forwarding {} spec(s) through {}@{}:{}",
        config.local_forwards.len(),
        config.remote.user,
        config.remote.host,
        config.remote.port
    );

    let trust_path = HostTrustStore::default_path()?;
    let store = HostTrustStore::load_from(&trust_path)?;
    let verifier = Arc::new(SharedTrustStore::new(store));
    let log: Arc<dyn LogSink> = Arc::new(MemoryLogSink::default());

    let (debouncer, trigger_rx) = EventDebouncer::spawn(config.debounce_window());
    let cancel = CancellationToken::new();
    monitor::spawn_sleep_monitor(
        config.sleep_check(),
        config.sleep_gap(),
        monitor::system_wall_clock(),
        debouncer.clone(),
        cancel.clone(),
    );
    monitor::spawn_network_monitor(
        config.network_poll(),
        monitor::udp_route_probe(),
        debouncer.clone(),
        cancel.clone(),
    );
    monitor::spawn_periodic_refresh(config.periodic_refresh(), debouncer.clone(), cancel.clone());

    let (supervisor, mut status_rx) =
        Supervisor::new(config, Arc::new(RusshTransport), verifier, log, trigger_rx);
    let supervisor = supervisor.with_error_class_file(last_error::default_path()?);
    let supervisor_task = tokio::spawn(supervisor.run());

    debouncer.post(TriggerReason::ManualStart);

    tokio::signal::ctrl_c()
        .await
        .context("Failed to listen for shutdown signal")?;
    info!("shutdown requested");

    debouncer.post(TriggerReason::ManualStop);
    cancel.cancel();
    if tokio::time::timeout(
        SHUTDOWN_GRACE,
        status_rx.wait_for(|s| s.state == SessionState::Stopped),
    )
    .await
    .is_err()
    {
        warn!("session did not stop within {SHUTDOWN_GRACE:?}");
    }

    let final_status = status_rx.borrow().clone();
    for item in final_status.metrics.to_items() {
        info!("{} = {}", item.key, item.value);
    }

    // dropping the producer handle closes the trigger channel and ends run()
    drop(debouncer);
    let _ = tokio::time::timeout(SHUTDOWN_GRACE, supervisor_task).await;
    info!("tunnelkeepd stopped");
    Ok(())
}

async fn run_doctor(config_override: Option<PathBuf>) -> Result<()> {
    let trust_path = HostTrustStore::default_path()?;
    let last_class = last_error::load(&last_error::default_path()?);
    let items = doctor::run(load_config(config_override), &trust_path, last_class).await;

    let mut failed = false;
    for item in &items {
        println!("[{:<5}] {:<24} {}", item.status.to_string(), item.title, item.detail);
        if matches!(item.status, DoctorStatus::Error) {
            failed = true;
        }
    }
    if failed {
        std::process::exit(1);
    }
    Ok(())
}

fn reset_hosts() -> Result<()> {
    let path = HostTrustStore::default_path()?;
    HostTrustStore::reset(&path)?;
    println!("Pinned host keys cleared ({})", path.display());
    Ok(())
}
