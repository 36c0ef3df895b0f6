//! Divisora Daemon
//!
//! Keeps every cubicle node in line with the stored desired state: probes
//! node liveness and creates missing networks and cubicles.

use clap::{Parser, Subcommand};
use std::path::PathBuf;
use std::sync::Arc;
use tracing::info;
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

mod agent;
mod config;
mod diff;
mod lock;
mod manifest;
mod output;
mod probe;
mod reconciler;
mod state;

#[cfg(test)]
mod testutil;

use agent::{AgentTimeouts, HttpAgent};
use config::DaemonConfig;
use lock::ReconcileLock;
use output::OutputFormat;
use probe::HttpProber;
use reconciler::Reconciler;
use state::{DesiredStateStore, StateManager};

#[derive(Parser)]
#[command(name = "divisorad")]
#[command(about = "Divisora daemon - cubicle node reconciliation")]
#[command(version)]
struct Cli {
    /// Configuration file path
    #[arg(short, long, global = true)]
    config: Option<PathBuf>,

    /// Store directory
    #[arg(short, long, global = true)]
    store: Option<PathBuf>,

    /// Enable debug logging
    #[arg(short, long, global = true)]
    debug: bool,

    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Subcommand)]
enum Commands {
    /// Reconcile on an interval until interrupted
    Run,

    /// Run a single reconciliation tick and print the result.
    ///
    /// Refuses to start while `run` holds the store's reconcile lock.
    Once {
        #[arg(short, long, value_enum, default_value_t = OutputFormat::Table)]
        format: OutputFormat,
    },

    /// Show stored nodes and their last probe result
    Status {
        #[arg(short, long, value_enum, default_value_t = OutputFormat::Table)]
        format: OutputFormat,
    },

    /// Import nodes, images, users, and cubicles from a TOML manifest
    Import {
        /// Manifest path
        manifest: PathBuf,
    },
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    // Initialize logging
    let filter = if cli.debug {
        EnvFilter::new("debug")
    } else {
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"))
    };

    tracing_subscriber::registry()
        .with(fmt::layer().with_writer(std::io::stderr))
        .with(filter)
        .init();

    // Load or create configuration
    let config_path = cli
        .config
        .unwrap_or_else(divisora_common::default_config_path);
    let mut config = DaemonConfig::load(&config_path)?;
    if let Some(store) = cli.store {
        config.store_path = store;
    }

    // Ensure store directory exists
    tokio::fs::create_dir_all(&config.store_path).await?;
    if !config_path.exists() {
        config.save(&config_path)?;
        info!("Wrote default configuration to {}", config_path.display());
    }

    let state = Arc::new(StateManager::open(&config)?);

    match cli.command.unwrap_or(Commands::Run) {
        Commands::Run => {
            info!("Divisora daemon v{}", divisora_common::VERSION);
            let lock = ReconcileLock::acquire(&config.store_path)?;
            info!("Holding reconcile lock {}", lock.path().display());
            let reconciler = build_reconciler(state, &config)?;
            let reconciler_handle = tokio::spawn(async move { reconciler.run().await });

            // Wait for shutdown signal
            tokio::select! {
                _ = tokio::signal::ctrl_c() => {
                    info!("Received shutdown signal");
                }
                result = reconciler_handle => {
                    if let Err(e) = result {
                        tracing::error!("Reconciler error: {}", e);
                    }
                }
            }

            info!("Daemon shutdown complete");
        }
        Commands::Once { format } => {
            let _lock = ReconcileLock::acquire(&config.store_path)?;
            let reconciler = build_reconciler(state, &config)?;
            let report = reconciler.tick().await;
            output::print_tick(&report, format);
            if let Some(e) = report.error {
                anyhow::bail!("reconciliation failed: {}", e);
            }
        }
        Commands::Status { format } => {
            let nodes = state.list_nodes()?;
            output::print_list(&nodes, format);
        }
        Commands::Import { manifest } => {
            let fleet = manifest::FleetManifest::load(&manifest)?;
            let summary = fleet.apply(&state)?;
            println!(
                "Imported {} nodes, {} images, {} users, {} cubicles",
                summary.nodes, summary.images, summary.users, summary.cubicles
            );
        }
    }

    Ok(())
}

fn build_reconciler(state: Arc<StateManager>, config: &DaemonConfig) -> anyhow::Result<Reconciler> {
    let agent = HttpAgent::new(AgentTimeouts::from(&config.agent))?;
    let prober = HttpProber::new(config.agent.probe_timeout())?;
    Ok(Reconciler::new(state, Arc::new(agent), Arc::new(prober), config))
}
