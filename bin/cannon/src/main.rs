//! cannon, a daemon that bridges AMQP queues to external handlers.
//!
//! `cannon launch` declares the configured topology, subscribes every
//! consumer and keeps them alive until a shutdown signal arrives.

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use clap::{Args, Parser, Subcommand};
use tokio::signal;
use tracing::{error, info};

use cannon_rabbit::RabbitFactory;
use cannon_supervisor::{Factory, Manager};

#[derive(Parser)]
#[command(name = "cannon", version, about = "Fires AMQP deliveries at subprocess and HTTP handlers")]
struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Start all the consumers from the config file
    Launch(LaunchArgs),
}

#[derive(Args)]
struct LaunchArgs {
    /// Path to the configuration file
    #[arg(long, default_value = ".cannon.yaml")]
    config: PathBuf,

    /// Interval between supervisor aliveness checks
    #[arg(short = 'c', long, default_value = "500ms", value_parser = humantime::parse_duration)]
    interval_checks: Duration,

    /// Human-readable diagnostics instead of JSON
    #[arg(short, long)]
    development: bool,

    /// Capacity of the diagnostic event buffer
    #[arg(short = 'b', long = "log-buffer", alias = "event-buffer", default_value_t = 300)]
    log_buffer: usize,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let _ = dotenvy::dotenv();
    let cli = Cli::parse();

    match cli.command {
        Command::Launch(args) => launch(args).await,
    }
}

async fn launch(args: LaunchArgs) -> anyhow::Result<()> {
    let _guard = cannon_common::logging::init(args.development, args.log_buffer);

    let config = cannon_config::load(&args.config)
        .with_context(|| format!("failed to load the configuration from {:?}", args.config))?;

    let mut factories: Vec<Arc<dyn Factory>> = Vec::new();
    if let Some(rabbit) = config.rabbitmq {
        let factory = RabbitFactory::create(rabbit)
            .await
            .context("failed to create the rabbitmq factory")?;
        factories.push(Arc::new(factory));
    } else {
        info!("no rabbitmq section in the configuration, nothing to supervise");
    }

    let manager = Manager::new(args.interval_checks);
    manager
        .start(factories)
        .await
        .context("failed to start the supervisor")?;

    info!("consumers are running, waiting for a shutdown signal");
    shutdown_signal().await;
    info!("signal received, shutting down");

    if let Err(stop_error) = manager.stop().await {
        error!(error = %stop_error, "shutdown finished with errors");
        return Err(stop_error.into());
    }

    info!("shutdown complete");
    Ok(())
}

async fn shutdown_signal() {
    let ctrl_c = async {
        signal::ctrl_c()
            .await
            .expect("failed to install Ctrl+C handler");
    };

    #[cfg(unix)]
    let terminate = async {
        signal::unix::signal(signal::unix::SignalKind::terminate())
            .expect("failed to install signal handler")
            .recv()
            .await;
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {},
        _ = terminate => {},
    }
}
