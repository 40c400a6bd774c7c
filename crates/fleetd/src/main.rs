//! fleetd - fleet control-plane daemon
//!
//! Joins the cluster, runs the scaler, healer and scheduler managers for the
//! work items this member owns, and hands them off on shutdown.

use std::net::IpAddr;
use std::path::PathBuf;

use clap::{Parser, Subcommand};
use fleetd::{DEFAULT_CONFIG_PATH, Daemon, DaemonConfig, LogFormat, SeedFile};
use tracing::{error, info};
use tracing_subscriber::{EnvFilter, fmt, prelude::*};

#[derive(Parser)]
#[command(name = "fleetd")]
#[command(about = "Fleet control-plane daemon")]
#[command(version)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Run the daemon
    Run {
        /// Path to config file
        #[arg(short, long, default_value = DEFAULT_CONFIG_PATH)]
        config: PathBuf,

        /// Seed file loaded into the store before start
        #[arg(long)]
        seed: Option<PathBuf>,

        /// Override the member name
        #[arg(long, env = "FLEETD_NAME")]
        name: Option<String>,

        /// Override the bind address
        #[arg(long, env = "FLEETD_BIND_ADDRESS")]
        bind_address: Option<IpAddr>,
    },

    /// Check a config file and optional seed without starting
    Validate {
        /// Path to config file
        #[arg(short, long, default_value = DEFAULT_CONFIG_PATH)]
        config: PathBuf,

        /// Seed file to check
        #[arg(long)]
        seed: Option<PathBuf>,
    },

    /// Generate a sample config file
    InitConfig {
        /// Path to write config
        #[arg(short, long, default_value = DEFAULT_CONFIG_PATH)]
        output: PathBuf,

        /// Member name
        #[arg(long, default_value = "fleet-1")]
        name: String,

        /// Metrics backend URL
        #[arg(long)]
        metrics_url: Option<String>,

        /// etcd endpoint, repeatable
        #[arg(long = "store-endpoint")]
        store_endpoints: Vec<String>,
    },
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    match cli.command {
        Commands::Run {
            config,
            seed,
            name,
            bind_address,
        } => {
            let mut daemon_config = DaemonConfig::load(&config)?;
            if let Some(name) = name {
                daemon_config.name = name;
            }
            if let Some(address) = bind_address {
                daemon_config.bind_address = address;
            }
            init_tracing(daemon_config.log_format)?;
            info!(config = %config.display(), "starting fleetd");
            run_daemon(daemon_config, seed).await?;
        }

        Commands::Validate { config, seed } => {
            init_tracing(LogFormat::Text)?;
            validate(config, seed)?;
        }

        Commands::InitConfig {
            output,
            name,
            metrics_url,
            store_endpoints,
        } => {
            init_tracing(LogFormat::Text)?;
            init_config(output, name, metrics_url, store_endpoints)?;
        }
    }

    Ok(())
}

fn init_tracing(format: LogFormat) -> anyhow::Result<()> {
    let filter = EnvFilter::from_default_env()
        .add_directive("fleetd=info".parse()?)
        .add_directive("fleet_manager=info".parse()?)
        .add_directive("fleet_cluster=info".parse()?)
        .add_directive("fleet_worker=info".parse()?);
    let registry = tracing_subscriber::registry().with(filter);

    match format {
        LogFormat::Text => registry.with(fmt::layer()).init(),
        LogFormat::Json => registry.with(fmt::layer().json()).init(),
    }
    Ok(())
}

async fn run_daemon(config: DaemonConfig, seed: Option<PathBuf>) -> anyhow::Result<()> {
    let seed = seed.map(SeedFile::load).transpose()?;
    if config.uses_external_store() {
        info!(endpoints = ?config.store_endpoints, "using etcd store");
    } else {
        info!("no store_endpoints configured, running standalone");
    }
    let mut daemon = Daemon::connect(config, seed.as_ref()).await?;

    let fatal = tokio::select! {
        signal = shutdown_signal() => {
            match signal {
                Ok(name) => info!(signal = name, "shutdown requested"),
                Err(e) => error!(error = %e, "signal handler failed"),
            }
            None
        }
        fatal = daemon.fatal() => fatal,
    };

    if let Some(e) = &fatal {
        error!(error = %e, "fatal store error, shutting down");
    }
    daemon.shutdown().await;

    match fatal {
        Some(e) => anyhow::bail!("fatal store error: {e}"),
        None => Ok(()),
    }
}

#[cfg(unix)]
async fn shutdown_signal() -> std::io::Result<&'static str> {
    use tokio::signal::unix::{SignalKind, signal};

    let mut terminate = signal(SignalKind::terminate())?;
    tokio::select! {
        result = tokio::signal::ctrl_c() => result.map(|()| "SIGINT"),
        _ = terminate.recv() => Ok("SIGTERM"),
    }
}

#[cfg(not(unix))]
async fn shutdown_signal() -> std::io::Result<&'static str> {
    tokio::signal::ctrl_c().await.map(|()| "ctrl-c")
}

fn validate(config: PathBuf, seed: Option<PathBuf>) -> anyhow::Result<()> {
    let loaded = DaemonConfig::load(&config)?;
    println!("Config {} is valid (member {})", config.display(), loaded.name);

    if let Some(path) = seed {
        let seed = SeedFile::load(&path)?;
        let writes = seed.plan()?;
        println!("Seed {} is valid ({} entries)", path.display(), writes.len());
    }
    Ok(())
}

fn init_config(
    output: PathBuf,
    name: String,
    metrics_url: Option<String>,
    store_endpoints: Vec<String>,
) -> anyhow::Result<()> {
    let mut config = DaemonConfig::new(name);
    config.metrics_url = metrics_url;
    config.store_endpoints = store_endpoints;
    config.validate()?;
    config.save(&output)?;

    println!("Config written to {}", output.display());
    println!();
    println!("Edit the file to point at your metrics backend and action endpoints, then run:");
    println!("  fleetd run --config {}", output.display());

    Ok(())
}
