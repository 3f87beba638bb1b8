//! Parking Daemon - space monitoring and reservation server
//!
//! Accepts reservation requests, sensor readings and plate-reader streams
//! over a Unix socket, and streams space and reservation updates back.
//!
//! # Usage
//!
//! ```bash
//! # Start the daemon with defaults (SQLite under the state directory)
//! parkd serve
//!
//! # Start with a config file and volatile storage
//! parkd serve --config parkd.toml --memory
//!
//! # Print the effective configuration
//! parkd check-config --config parkd.toml
//! ```

use std::path::PathBuf;
use std::process;
use std::sync::Arc;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use tokio_util::sync::CancellationToken;
use tracing::{error, info};
use tracing_subscriber::EnvFilter;

use parkd::actuator::TracingActuator;
use parkd::config::{DaemonConfig, StorageConfig};
use parkd::coordinator::{spawn_expiry_task, Coordinator};
use parkd::reactor::{spawn_reactor, CoordinatorEndpoints};
use parkd::server::ParkingServer;
use parkd::subscribers::Subscribers;

/// Parking daemon - space monitoring and reservations
#[derive(Parser, Debug)]
#[command(name = "parkd", version, about)]
struct Args {
    #[command(subcommand)]
    command: Option<Command>,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Run the daemon in the foreground
    Serve {
        #[command(flatten)]
        options: ConfigOptions,
    },
    /// Load and validate the configuration, then print it
    CheckConfig {
        #[command(flatten)]
        options: ConfigOptions,
    },
}

#[derive(clap::Args, Debug, Default)]
struct ConfigOptions {
    /// TOML configuration file
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Unix socket path (overrides config and PARKD_SOCKET)
    #[arg(short, long)]
    socket: Option<PathBuf>,

    /// Keep space records in memory only
    #[arg(long)]
    memory: bool,
}

impl ConfigOptions {
    fn load(&self) -> Result<DaemonConfig> {
        let config = match &self.config {
            Some(path) => DaemonConfig::from_file(path)?,
            None => DaemonConfig::default(),
        };

        let mut config = config
            .with_env_overrides()
            .context("Invalid environment override")?;

        if let Some(socket) = &self.socket {
            config.socket_path = socket.clone();
        }
        if self.memory {
            config.storage = StorageConfig::Memory;
        }

        config.validate()?;
        Ok(config)
    }
}

fn main() -> Result<()> {
    let args = Args::parse();

    let command = args.command.unwrap_or(Command::Serve {
        options: ConfigOptions::default(),
    });

    match command {
        Command::Serve { options } => {
            let config = options.load()?;
            run_daemon(config)
        }
        Command::CheckConfig { options } => {
            let config = options.load()?;
            let rendered =
                toml::to_string_pretty(&config).context("Failed to render configuration")?;
            println!("{rendered}");
            Ok(())
        }
    }
}

#[tokio::main]
async fn run_daemon(config: DaemonConfig) -> Result<()> {
    let level = &config.log_level;
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::from_default_env()
                .add_directive(format!("parkd={level}").parse()?)
                .add_directive(format!("park_core={level}").parse()?)
                .add_directive(format!("park_protocol={level}").parse()?),
        )
        .init();

    info!(
        version = env!("CARGO_PKG_VERSION"),
        pid = process::id(),
        "Parking daemon starting"
    );

    let cancel_token = CancellationToken::new();

    let shutdown_token = cancel_token.clone();
    tokio::spawn(async move {
        if let Err(e) = wait_for_shutdown_signal().await {
            error!(error = %e, "Error waiting for shutdown signal");
        }
        info!("Shutdown signal received");
        shutdown_token.cancel();
    });

    let db = config.open_database().context("Failed to open storage")?;
    let coordinator = Arc::new(Coordinator::new(
        db,
        Arc::new(TracingActuator),
        Arc::new(Subscribers::new()),
        config.coordinator_settings(),
    ));

    let reactor = spawn_reactor(CoordinatorEndpoints::new(&coordinator), cancel_token.clone());
    info!("Reactor started");

    let _expiry_handle = spawn_expiry_task(
        Arc::clone(&coordinator),
        config.sweep_interval(),
        cancel_token.clone(),
    );
    info!(
        window_secs = config.reservation_expiry_secs,
        interval_secs = config.sweep_interval_secs,
        "Expiry sweep started"
    );

    let server = ParkingServer::new(&config.socket_path, coordinator, reactor, cancel_token);

    info!(socket = %config.socket_path.display(), "Starting server");

    if let Err(e) = server.run().await {
        error!(error = %e, "Server error");
        return Err(e.into());
    }

    info!("Parking daemon stopped");
    Ok(())
}

async fn wait_for_shutdown_signal() -> Result<()> {
    #[cfg(unix)]
    {
        use tokio::signal::unix::{signal, SignalKind};

        let mut sigterm = signal(SignalKind::terminate())?;
        let mut sigint = signal(SignalKind::interrupt())?;

        tokio::select! {
            _ = sigterm.recv() => {
                info!("Received SIGTERM");
            }
            _ = sigint.recv() => {
                info!("Received SIGINT");
            }
        }
    }

    #[cfg(not(unix))]
    {
        tokio::signal::ctrl_c().await?;
        info!("Received Ctrl+C");
    }

    Ok(())
}
