//! cumulusd: the cumulus daemon.
//!
//! Single binary that assembles every cumulus subsystem:
//! - State store (redb)
//! - Updater (cloud facts, EGI discovery)
//! - Deployer and destroyer dispatchers
//! - Cleaner
//! - Worker lifecycle
//! - Autoscaler
//! - Admission API
//!
//! # Usage
//!
//! ```text
//! cumulusd --config /etc/cumulus/cumulus.toml run
//! ```

mod signal;

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use clap::{Parser, Subcommand};
use tokio::sync::watch;
use tokio::task::JoinSet;
use tracing::{error, info};
use tracing_subscriber::EnvFilter;

use cumulus_autoscale::{Autoscaler, HttpJobSource, JobSource, StaticJobSource};
use cumulus_cleaner::Cleaner;
use cumulus_cloud::egi::EgiDiscovery;
use cumulus_cloud::{CloudCatalog, Connector, TokenManager};
use cumulus_core::Config;
use cumulus_core::cloud::load_cloud_file;
use cumulus_scheduler::{Destroyer, Dispatcher, Provisioner, UserDataTemplate};
use cumulus_state::Store;
use cumulus_updater::{Refresher, Updater};
use cumulus_workers::{HttpWorkerDirectory, StaticWorkerDirectory, WorkerDirectory, WorkerLifecycle};

use crate::signal::Signals;

const DEFAULT_FILTER: &str = "info,cumulusd=debug,cumulus=debug";

#[derive(Parser)]
#[command(name = "cumulusd", about = "cumulus multi-cloud provisioner daemon")]
struct Cli {
    /// Configuration file (TOML).
    #[arg(long, short, default_value = "/etc/cumulus/cumulus.toml")]
    config: PathBuf,

    /// Emit logs as JSON lines.
    #[arg(long)]
    log_json: bool,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Run every loop and the admission API in this process.
    Run,
    /// Print the effective configuration and exit.
    Config,
}

fn init_tracing(json: bool) {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(DEFAULT_FILTER));
    if json {
        tracing_subscriber::fmt().json().with_env_filter(filter).init();
    } else {
        tracing_subscriber::fmt().with_env_filter(filter).init();
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();
    init_tracing(cli.log_json);

    let config = load_config(&cli.config)?;
    match cli.command {
        Command::Run => run(Arc::new(config)).await,
        Command::Config => {
            print!("{}", config.to_toml_string()?);
            Ok(())
        }
    }
}

/// A missing file means defaults; an unreadable or invalid one is fatal.
fn load_config(path: &Path) -> anyhow::Result<Config> {
    if !path.exists() {
        info!(path = ?path, "no configuration file, using defaults");
        return Ok(Config::default());
    }
    Config::from_file(path).with_context(|| format!("loading configuration from {}", path.display()))
}

fn open_store(config: &Config) -> anyhow::Result<Store> {
    let path = &config.database.path;
    if let Some(dir) = path.parent().filter(|d| !d.as_os_str().is_empty()) {
        std::fs::create_dir_all(dir).with_context(|| format!("creating {}", dir.display()))?;
    }
    let store = Store::open(path).with_context(|| format!("opening state store at {}", path.display()))?;
    info!(path = ?path, "state store opened");
    Ok(store)
}

fn load_catalog(config: &Config) -> anyhow::Result<CloudCatalog> {
    let clouds = match &config.clouds.file {
        Some(path) => {
            load_cloud_file(path).with_context(|| format!("loading clouds from {}", path.display()))?
        }
        None => Vec::new(),
    };
    info!(clouds = clouds.len(), "static clouds loaded");
    Ok(CloudCatalog::new(clouds))
}

fn worker_directory(config: &Config) -> anyhow::Result<Arc<dyn WorkerDirectory>> {
    Ok(match &config.workers.directory_url {
        Some(url) => Arc::new(HttpWorkerDirectory::new(url.as_str())?),
        None => {
            info!("no worker directory configured, worker pool is empty");
            Arc::new(StaticWorkerDirectory::default())
        }
    })
}

fn job_source(config: &Config) -> anyhow::Result<Arc<dyn JobSource>> {
    Ok(match &config.scaler.jobs_url {
        Some(url) => Arc::new(HttpJobSource::new(url.as_str())?),
        None => {
            info!("no job feed configured, autoscaler idles");
            Arc::new(StaticJobSource::default())
        }
    })
}

async fn run(config: Arc<Config>) -> anyhow::Result<()> {
    info!("cumulus daemon starting");

    // ── Initialize subsystems ──────────────────────────────────

    let store = open_store(&config)?;
    let catalog = load_catalog(&config)?;
    let tokens = TokenManager::new(store.clone())?;
    let connector = Connector::new(tokens.clone(), config.egi.credentials.clone());
    let userdata = UserDataTemplate::from_config(&config)?;

    let updater = Updater::new(
        Refresher::new(store.clone(), connector.clone()),
        catalog.clone(),
        Arc::clone(&config),
    )
    .with_discovery(EgiDiscovery::new(tokens, config.egi.clone()));

    let provisioner = Provisioner::new(
        store.clone(),
        connector.clone(),
        catalog.clone(),
        Arc::clone(&config),
        userdata,
    );
    let destroyer = Destroyer::new(store.clone(), connector.clone(), catalog.clone(), Arc::clone(&config));
    let deployer_loop = Dispatcher::deployer(store.clone(), Arc::new(provisioner), &config);
    let destroyer_loop = Dispatcher::destroyer(store.clone(), Arc::new(destroyer.clone()), &config);

    let directory = worker_directory(&config)?;
    let cleaner = Cleaner::new(
        store.clone(),
        connector,
        catalog,
        destroyer,
        Arc::clone(&directory),
        Arc::clone(&config),
    );
    let lifecycle = WorkerLifecycle::new(store.clone(), directory, Arc::clone(&config));
    let autoscaler = Autoscaler::new(store.clone(), job_source(&config)?, Arc::clone(&config));

    // ── Start background loops ─────────────────────────────────

    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    let polling = &config.polling;
    let secs = Duration::from_secs;
    let mut loops = JoinSet::new();

    let rx = shutdown_rx.clone();
    let interval = secs(polling.updater);
    loops.spawn(async move { updater.run(interval, rx).await });

    let rx = shutdown_rx.clone();
    let interval = secs(polling.deployer);
    loops.spawn(async move { deployer_loop.run(interval, rx).await });

    let rx = shutdown_rx.clone();
    let interval = secs(polling.destroyer);
    loops.spawn(async move { destroyer_loop.run(interval, rx).await });

    let rx = shutdown_rx.clone();
    let interval = secs(polling.cleaning);
    loops.spawn(async move { cleaner.run(interval, rx).await });

    let rx = shutdown_rx.clone();
    let interval = secs(polling.workers);
    loops.spawn(async move { lifecycle.run(interval, rx).await });

    let rx = shutdown_rx;
    let interval = secs(polling.scaler);
    loops.spawn(async move { autoscaler.run(interval, rx).await });

    // ── Start API server ───────────────────────────────────────

    let router = cumulus_api::build_router(cumulus_api::ApiState::new(store));
    let listener = tokio::net::TcpListener::bind(&config.api.listen)
        .await
        .with_context(|| format!("binding {}", config.api.listen))?;
    info!(addr = %config.api.listen, "admission API listening");

    // Graceful shutdown on SIGINT or SIGTERM.
    let signals = Signals::install().context("installing signal handlers")?;
    axum::serve(listener, router)
        .with_graceful_shutdown(async move {
            signals.wait().await;
            let _ = shutdown_tx.send(true);
        })
        .await?;

    // Loops finish their in-flight work before returning.
    while let Some(joined) = loops.join_next().await {
        if let Err(e) = joined {
            error!(error = %e, "background loop panicked");
        }
    }

    info!("cumulus daemon stopped");
    Ok(())
}
