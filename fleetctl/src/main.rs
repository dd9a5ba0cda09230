//! fleetctl - operator entry point for the fleet reconciliation engine.
//!
//! `preview`, `canary` and `rollout` drive the orchestrator; `hosts` manages
//! the host records it works from.

mod output;

use anyhow::Result;
use clap::{Args, Parser, Subcommand};
use fleet_engine::config::Config;
use fleet_engine::db::HostStore;
use fleet_engine::lifecycle::{probe_for, HealthPolicy};
use fleet_engine::models::{ApiMode, NewHost};
use fleet_engine::session::{Connector, KeyDirResolver, SshConnector};
use fleet_engine::{utils, ManifestRegistry, Orchestrator, Pipeline};
use std::path::PathBuf;
use std::sync::Arc;
use tokio::signal;
use tokio_util::sync::CancellationToken;

#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
struct Cli {
    /// Path to configuration file
    #[arg(short, long, value_name = "FILE", global = true)]
    config: Option<PathBuf>,

    /// Manifest to apply (overrides config)
    #[arg(short, long, value_name = "FILE", global = true)]
    manifest: Option<PathBuf>,

    /// Log level (trace, debug, info, warn, error)
    #[arg(short, long, global = true)]
    log_level: Option<String>,

    /// Print reports as JSON
    #[arg(long, global = true)]
    json: bool,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Show what a pass would change on one host, without changing it
    Preview {
        /// Host to preview (default: first host below the manifest version)
        #[arg(long)]
        host: Option<String>,
    },
    /// Apply the manifest to one host and verify it
    Canary { host: String },
    /// Apply the manifest to every host below its version, in batches
    Rollout {
        /// Run this canary first and stop unless it passes
        #[arg(long, value_name = "HOST")]
        canary: Option<String>,

        #[arg(long)]
        batch_size: Option<usize>,

        #[arg(long)]
        batch_delay_secs: Option<u64>,
    },
    /// Manage host records
    Hosts {
        #[command(subcommand)]
        command: HostsCommand,
    },
}

#[derive(Subcommand, Debug)]
enum HostsCommand {
    List,
    Add(AddHost),
    Remove { id: String },
}

#[derive(Args, Debug)]
struct AddHost {
    id: String,
    address: String,

    #[arg(long)]
    name: Option<String>,

    #[arg(long, default_value_t = 22)]
    port: i64,

    #[arg(long, default_value = "root")]
    user: String,

    /// Opaque reference resolved to a private key in the keys directory
    #[arg(long)]
    credential_ref: String,

    #[arg(long, value_parser = parse_api_mode, default_value = "managed")]
    api_mode: ApiMode,

    /// Platform-issued token for managed hosts
    #[arg(long)]
    token: Option<String>,

    /// Value for a required environment variable, as NAME=VALUE (repeatable)
    #[arg(long = "env", value_name = "NAME=VALUE", value_parser = parse_env_pair)]
    env: Vec<(String, String)>,
}

fn parse_api_mode(s: &str) -> Result<ApiMode, String> {
    s.parse().map_err(|e: anyhow::Error| e.to_string())
}

fn parse_env_pair(s: &str) -> Result<(String, String), String> {
    match s.split_once('=') {
        Some((name, value)) if !name.is_empty() => Ok((name.to_string(), value.to_string())),
        _ => Err(format!("expected NAME=VALUE, got {s:?}")),
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    // Load configuration
    let mut config = match &cli.config {
        Some(path) => Config::from_file(path)?,
        None => Config::default(),
    }
    .with_env_overrides();
    if let Some(manifest) = &cli.manifest {
        config.manifest.path = manifest.clone();
    }

    // Initialize logging
    let log_level = cli.log_level.as_deref().unwrap_or(&config.log.level);
    utils::logger::init(log_level)?;

    let store = HostStore::open(&config.store.path)?;
    let result = run(cli.command, cli.json, config, &store).await;
    store.close();
    result
}

async fn run(command: Command, json: bool, mut config: Config, store: &HostStore) -> Result<()> {
    match command {
        Command::Hosts { command } => hosts(command, json, store).await,
        Command::Preview { host } => {
            let orchestrator = orchestrator(&config, ssh_connector(&config), store, CancellationToken::new())?;
            let report = orchestrator.preview(host.as_deref()).await?;
            output::emit(json, &report, output::preview)
        }
        Command::Canary { host } => {
            let orchestrator = orchestrator(&config, ssh_connector(&config), store, CancellationToken::new())?;
            let report = orchestrator.canary(&host).await?;
            output::emit(json, &report, output::canary)?;
            if !report.safe {
                anyhow::bail!("Canary {} failed verification", host);
            }
            Ok(())
        }
        Command::Rollout { canary, batch_size, batch_delay_secs } => {
            if let Some(size) = batch_size {
                config.rollout.batch_size = size;
            }
            if let Some(delay) = batch_delay_secs {
                config.rollout.batch_delay_secs = delay;
            }

            let cancel = CancellationToken::new();
            let orchestrator = orchestrator(&config, ssh_connector(&config), store, cancel.clone())?;

            if let Some(host) = canary {
                let report = orchestrator.canary(&host).await?;
                output::emit(json, &report, output::canary)?;
                if !report.safe {
                    anyhow::bail!("Canary {} failed verification; rollout not started", host);
                }
            }

            tokio::spawn(shutdown_signal(cancel));
            let report = orchestrator.rollout().await?;
            output::emit(json, &report, output::rollout)?;

            let failed = report.failed().len();
            if failed > 0 {
                anyhow::bail!("{} host(s) failed", failed);
            }
            Ok(())
        }
    }
}

async fn hosts(command: HostsCommand, json: bool, store: &HostStore) -> Result<()> {
    match command {
        HostsCommand::List => {
            let hosts = store.list().await?;
            output::emit(json, &hosts, |h| output::hosts(h))
        }
        HostsCommand::Add(args) => {
            let host = store
                .create(NewHost {
                    name: args.name.unwrap_or_else(|| args.id.clone()),
                    id: args.id,
                    address: args.address,
                    port: args.port,
                    ssh_user: args.user,
                    credential_ref: args.credential_ref,
                    api_mode: args.api_mode,
                    last_known_token: args.token,
                    environment: args.env.into_iter().collect(),
                })
                .await?;
            tracing::info!(host = %host.id, "host added");
            output::emit(json, &host, |h| output::hosts(std::slice::from_ref(h)))
        }
        HostsCommand::Remove { id } => {
            if !store.remove(&id).await? {
                anyhow::bail!("Unknown host: {}", id);
            }
            tracing::info!(host = %id, "host removed");
            Ok(())
        }
    }
}

fn ssh_connector(config: &Config) -> Arc<dyn Connector> {
    let resolver = Arc::new(KeyDirResolver::new(config.ssh.keys_dir.clone()));
    Arc::new(SshConnector::new(resolver, &config.ssh))
}

/// Load and validate the manifest, then wire the pipeline to `connector`.
fn orchestrator(
    config: &Config,
    connector: Arc<dyn Connector>,
    store: &HostStore,
    cancel: CancellationToken,
) -> Result<Orchestrator> {
    let registry = Arc::new(ManifestRegistry::load(&config.manifest.path)?);
    tracing::info!(
        version = registry.version(),
        "Loaded manifest {}",
        config.manifest.path.display()
    );

    let probe = probe_for(&config.health, &registry.manifest().service)?;
    let pipeline = Pipeline::new(
        registry,
        connector,
        probe,
        config.transfer.clone(),
        HealthPolicy::from(&config.health),
    )?;
    Ok(Orchestrator::new(Arc::new(pipeline), store.clone(), config.rollout.clone(), cancel))
}

async fn shutdown_signal(cancel: CancellationToken) {
    let ctrl_c = async {
        signal::ctrl_c().await.expect("failed to listen for ctrl+c");
    };

    #[cfg(unix)]
    let terminate = async {
        signal::unix::signal(signal::unix::SignalKind::terminate())
            .expect("failed to listen for SIGTERM")
            .recv()
            .await;
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => tracing::info!("Received SIGINT, halting after the current batch"),
        _ = terminate => tracing::info!("Received SIGTERM, halting after the current batch"),
    }

    cancel.cancel();
}
