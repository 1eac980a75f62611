//! dispatchd — the dispatch daemon.
//!
//! One binary per machine that runs:
//! - the machine agent (liveness lease, load, local units)
//! - the supervisor election, and while leading the failure detector,
//!   global unit propagation and the scheduler
//!
//! # Usage
//!
//! ```text
//! dispatchd run --zone dc --etcd-address http://10.0.0.1:2379
//! dispatchd standalone --data-dir /var/lib/dispatch
//! ```

mod config;

use std::path::PathBuf;
use std::sync::Arc;

use anyhow::Context;
use clap::{Parser, Subcommand, ValueEnum};
use dispatch_machine::MachineAgent;
use dispatch_store::{EmbeddedStore, EtcdStore, SharedStore};
use dispatch_supervisor::Supervisor;
use dispatch_unit::{SystemdSupervisor, UnitContext, UnitFiles};
use tokio::sync::watch;
use tracing::{error, info};
use tracing_subscriber::EnvFilter;

use crate::config::{ConfigArgs, DispatchConfig};

#[derive(Parser)]
#[command(name = "dispatchd", about = "Dispatch cluster daemon")]
struct Cli {
    /// TOML configuration file.
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    /// Log output format.
    #[arg(long, global = true, value_enum, default_value = "text")]
    log_format: LogFormat,

    #[command(flatten)]
    overrides: ConfigArgs,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Join a zone coordinated through etcd.
    Run,

    /// Run a single-machine zone on an embedded store.
    Standalone {
        /// Data directory for the embedded store.
        #[arg(long, default_value = "/var/lib/dispatch")]
        data_dir: PathBuf,
    },
}

#[derive(Debug, Clone, Copy, ValueEnum)]
enum LogFormat {
    Text,
    Json,
}

fn init_tracing(format: LogFormat) {
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new("info,dispatchd=debug,dispatch=debug"));
    match format {
        LogFormat::Text => tracing_subscriber::fmt().with_env_filter(filter).init(),
        LogFormat::Json => tracing_subscriber::fmt()
            .json()
            .with_env_filter(filter)
            .init(),
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();
    init_tracing(cli.log_format);

    let mut config = DispatchConfig::load(cli.config.as_deref())?;
    config.apply(&cli.overrides);
    config.validate()?;

    let store: SharedStore = match cli.command {
        Command::Run => {
            let store = EtcdStore::connect(&config.store_endpoints).await?;
            info!(endpoints = ?config.store_endpoints, "connected to etcd");
            Arc::new(store)
        }
        Command::Standalone { data_dir } => {
            std::fs::create_dir_all(&data_dir)?;
            let path = data_dir.join("dispatch.redb");
            let store = EmbeddedStore::open(&path)?;
            info!(path = ?path, "embedded store opened");
            Arc::new(store)
        }
    };

    run_node(config, store).await
}

async fn run_node(config: DispatchConfig, store: SharedStore) -> anyhow::Result<()> {
    info!(machine = %config.machine_name, zone = %config.zone, "dispatch daemon starting");

    // Nothing useful can happen without the process supervisor.
    let systemd = SystemdSupervisor::connect()
        .await
        .context("cannot reach the local process supervisor")?;

    let ctx = UnitContext::new(
        store,
        config.keyspace(),
        Arc::new(systemd),
        UnitFiles::new(&config.unit_dir),
        &config.machine_name,
    );
    let agent = Arc::new(MachineAgent::new(ctx.clone(), config.agent_config()));
    let supervisor = Arc::new(Supervisor::new(ctx, config.supervisor_config()));

    // ── Shutdown signal ────────────────────────────────────────

    let (shutdown_tx, shutdown_rx) = watch::channel(false);

    // ── Start background tasks ─────────────────────────────────

    let mut agent_handle = tokio::spawn(agent.run(shutdown_rx.clone()));
    let supervisor_handle = tokio::spawn(supervisor.run(shutdown_rx));

    let agent_result = tokio::select! {
        signal = tokio::signal::ctrl_c() => {
            signal.context("failed to install Ctrl-C handler")?;
            info!("shutdown signal received");
            let _ = shutdown_tx.send(true);
            agent_handle.await
        }
        result = &mut agent_handle => {
            let _ = shutdown_tx.send(true);
            result
        }
    };
    let _ = supervisor_handle.await;

    match agent_result {
        Ok(Ok(())) => {
            info!("dispatch daemon stopped");
            Ok(())
        }
        Ok(Err(e)) => {
            error!(error = %e, "machine agent failed");
            Err(e.into())
        }
        Err(e) => Err(anyhow::anyhow!("machine agent task panicked: {e}")),
    }
}
