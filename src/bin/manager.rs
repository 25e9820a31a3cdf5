// EDMP - Device manager process
// Loads the manager configuration, runs the message processor until interrupted
// Run with: cargo run --bin manager -- --config obd.yaml

//! # Manager Binary
//!
//! The generic executable every device manager can be started as. It wires
//! configuration to the engine:
//!
//! ```text
//! main() function
//!   ↓ loads
//! ManagerSettings (file + EDMP__* environment)
//!   ↓ builds
//! MessageProcessor (bus, registry, workers, reactors, cloud cache)
//!   ↓ runs until
//! Ctrl-C / SIGTERM
//!   ↓ then
//! Ordered shutdown
//! ```
//!
//! Concrete managers embed the library instead and register their own hooks
//! between `build` and `start`; this binary only offers the built-ins, which is
//! enough for configured workers, reactors and the cloud uplink.
//!
//! ## Rust Learning Notes:
//!
//! ### anyhow at the Edge
//! The library returns the typed `EdmpError`. The binary converts everything to
//! `anyhow::Error` with `?` and adds context, since at this point the error is
//! only ever printed.

use std::path::PathBuf;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use dotenv::dotenv;
use edmp::{ManagerSettings, MessageProcessor};
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

#[derive(Parser)]
#[command(name = "edmp-manager")]
#[command(about = "Event-driven message processor for telematics device managers")]
#[command(version)]
struct Cli {
    #[command(subcommand)]
    command: Option<Commands>,

    /// Configuration file (YAML, TOML or JSON)
    #[arg(short, long, env = "EDMP_CONFIG")]
    config: Option<PathBuf>,

    /// Override the manager name from the configuration
    #[arg(long)]
    name: Option<String>,

    /// Enable verbose logging
    #[arg(short, long)]
    verbose: bool,
}

#[derive(Subcommand)]
enum Commands {
    /// Run the manager until interrupted (default)
    Run,

    /// Print the effective configuration and exit
    Config,
}

#[tokio::main]
async fn main() -> Result<()> {
    // A missing .env file is fine, the environment may be set by the init system
    let _ = dotenv();

    let cli = Cli::parse();

    // RUST_LOG wins over --verbose when it is set
    let default_level = if cli.verbose { "debug" } else { "info" };
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_level));
    tracing_subscriber::fmt().with_env_filter(filter).init();

    let mut settings = ManagerSettings::load(cli.config.as_deref()).context("failed to load configuration")?;
    if let Some(name) = cli.name {
        settings.name = name;
    }

    match cli.command.unwrap_or(Commands::Run) {
        Commands::Config => {
            println!("{}", serde_json::to_string_pretty(&settings)?);
            Ok(())
        }
        Commands::Run => run(settings).await,
    }
}

async fn run(settings: ManagerSettings) -> Result<()> {
    info!(manager = %settings.name, endpoint = ?settings.cloud_cache.as_ref().and_then(|c| c.endpoint.as_deref()), "starting manager");

    let processor = MessageProcessor::build(settings, None)
        .await
        .context("failed to build message processor")?;
    processor.start().await.context("failed to start message processor")?;

    wait_for_signal().await;

    processor.shutdown().await;
    info!(manager = %processor.name(), "manager stopped");
    Ok(())
}

#[cfg(unix)]
async fn wait_for_signal() {
    use tokio::signal::unix::{signal, SignalKind};

    match signal(SignalKind::terminate()) {
        Ok(mut terminate) => {
            tokio::select! {
                _ = tokio::signal::ctrl_c() => info!("interrupt received"),
                _ = terminate.recv() => info!("terminate received"),
            }
        }
        Err(e) => {
            warn!(error = %e, "cannot listen for SIGTERM, waiting for Ctrl-C only");
            let _ = tokio::signal::ctrl_c().await;
        }
    }
}

#[cfg(not(unix))]
async fn wait_for_signal() {
    let _ = tokio::signal::ctrl_c().await;
    info!("interrupt received");
}
