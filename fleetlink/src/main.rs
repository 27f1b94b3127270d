mod connector;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use std::sync::Arc;
use tracing::{error, info};

use fleetlink_cluster::{Proxy, RedisTransport, Transport, WorkerNode};
use fleetlink_core::{logging, Config};

use connector::LoggingConnector;

#[derive(Parser, Debug)]
#[command(name = "fleetlink")]
#[command(about = "Game-server fleet coordinator", long_about = None)]
struct Args {
    /// Configuration file (TOML, YAML or JSON)
    #[arg(long, short, env = "FLEETLINK_CONFIG", global = true)]
    config: Option<String>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Run the front-end: registry, load balancers and matchmakers
    Proxy,
    /// Run a worker-side magic link
    Worker {
        /// Address announced to the front-end (overrides the config)
        #[arg(long)]
        address: Option<String>,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    let mut config = Config::load(args.config.as_deref())
        .map_err(fleetlink_core::Error::from)
        .context("failed to load configuration")?;
    if let Command::Worker { address: Some(address) } = &args.command {
        config.worker.address.clone_from(address);
    }
    if config.worker.display_name.is_none() {
        config.worker.display_name = hostname::get().ok().and_then(|h| h.into_string().ok());
    }

    if let Err(errors) = config.validate() {
        for e in &errors {
            eprintln!("Config validation error: {e}");
        }
        return Err(fleetlink_core::Error::Validation(errors).into());
    }

    logging::init_logging(&config.logging)?;

    // Without a transport there is nothing to coordinate
    info!(url = %config.redis.url, "Connecting to Redis");
    let transport: Arc<dyn Transport> = Arc::new(
        RedisTransport::connect(
            &config.redis.url,
            std::time::Duration::from_secs(config.redis.connect_timeout_seconds),
        )
        .await
        .context("failed to connect to Redis")?,
    );

    match args.command {
        Command::Proxy => run_proxy(&config, transport).await,
        Command::Worker { .. } => run_worker(&config, transport).await,
    }
}

async fn run_proxy(config: &Config, transport: Arc<dyn Transport>) -> Result<()> {
    info!(families = config.families.len(), "FleetLink front-end starting...");
    let proxy = Proxy::start(config, transport, Arc::new(LoggingConnector))
        .await
        .context("failed to start front-end")?;

    shutdown_signal().await;
    proxy.shutdown().await;
    Ok(())
}

async fn run_worker(config: &Config, transport: Arc<dyn Transport>) -> Result<()> {
    info!(address = %config.worker.address, "FleetLink worker starting...");
    let node = WorkerNode::start(config, transport)
        .await
        .context("failed to start worker magic link")?;

    shutdown_signal().await;
    node.shutdown().await;
    Ok(())
}

/// Wait for a shutdown signal (SIGTERM or SIGINT/Ctrl+C)
async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            error!("Failed to install Ctrl+C handler: {}", e);
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut signal) => {
                signal.recv().await;
            }
            Err(e) => {
                error!("Failed to install SIGTERM handler: {}", e);
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        () = ctrl_c => { info!("Received Ctrl+C"); }
        () = terminate => { info!("Received SIGTERM"); }
    }
}
