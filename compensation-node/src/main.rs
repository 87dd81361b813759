//! Compensation Node
//!
//! Opens the persistent store and runs the scheduled binary matching batch
//! until interrupted. With `--run-once` it performs a single manual run and
//! prints the report as JSON.
//!
//! Payouts are committed to the store's pending-credit outbox. Without a
//! wallet attached they stay there for settlement; `--in-memory-wallet`
//! applies them to a process-local wallet for local runs instead.

use anyhow::Context;
use clap::Parser;
use lib_compensation::{
    CompensationConfig, CompensationStore, CompensationSystem, DeferredWallet, InMemoryWallet, SledStore,
    SystemClock, TriggerOutcome, WalletService,
};
use std::env;
use std::path::PathBuf;
use std::sync::Arc;
use tokio::sync::watch;
use tracing::{info, warn};

#[derive(Parser, Debug, Clone)]
#[command(author, version, about, long_about = None)]
#[command(name = "compensation-node")]
struct Cli {
    /// TOML configuration file; built-in defaults when omitted
    #[arg(short, long, env = "COMPENSATION_CONFIG")]
    config: Option<PathBuf>,

    /// Overrides `storage.path` from the configuration
    #[arg(long, env = "COMPENSATION_DATA_DIR")]
    data_dir: Option<PathBuf>,

    /// Log filter used when RUST_LOG is unset
    #[arg(long, default_value = "info", env = "COMPENSATION_LOG_LEVEL")]
    log_level: String,

    /// Run lease holder name for this instance
    #[arg(long, env = "COMPENSATION_INSTANCE")]
    instance: Option<String>,

    /// Run one manual batch, print the report and exit
    #[arg(long)]
    run_once: bool,

    /// Apply credits to a process-local wallet (lost on exit) instead of
    /// leaving them pending in the store
    #[arg(long, env = "COMPENSATION_IN_MEMORY_WALLET")]
    in_memory_wallet: bool,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    let filter = env::var("RUST_LOG").unwrap_or_else(|_| cli.log_level.clone());
    tracing_subscriber::fmt().with_env_filter(filter).init();

    let mut config = match &cli.config {
        Some(path) => CompensationConfig::load_from_file(path)
            .with_context(|| format!("loading configuration from {}", path.display()))?,
        None => {
            info!("No configuration file given, using defaults");
            CompensationConfig::default()
        }
    };
    if let Some(data_dir) = &cli.data_dir {
        config.storage.path = data_dir.clone();
    }

    let store = SledStore::open_with_config(&config.storage.path, config.storage.cache_capacity_bytes)
        .with_context(|| format!("opening store at {}", config.storage.path.display()))?;
    let store = Arc::new(store);

    let wallet: Arc<dyn WalletService> = if cli.in_memory_wallet {
        warn!("Using the in-process wallet; applied credits are lost on exit");
        Arc::new(InMemoryWallet::new())
    } else {
        info!("No wallet attached; payouts stay in the pending-credit outbox");
        // nothing can drain the outbox from here
        config.scheduler.reconcile_after_run = false;
        Arc::new(DeferredWallet)
    };

    let instance = cli
        .instance
        .clone()
        .unwrap_or_else(|| format!("compensation-node-{}", std::process::id()));
    let system = CompensationSystem::new(&config, store.clone(), wallet, Arc::new(SystemClock), instance)
        .context("building compensation engine")?;

    if cli.run_once {
        let outcome = system.scheduler.trigger_manual(None).await?;
        match outcome {
            TriggerOutcome::Completed(report) => println!("{}", serde_json::to_string_pretty(&report)?),
            TriggerOutcome::LeaseHeld { holder, expires_at } => {
                warn!("Run lease held by {} until {}, nothing done", holder, expires_at)
            }
            TriggerOutcome::AlreadyCompleted { period } => info!("Period {} already completed", period),
        }
        store.flush().await?;
        return Ok(());
    }

    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    let scheduler = system.scheduler.clone();
    let runner = tokio::spawn(async move { scheduler.run(shutdown_rx).await });

    tokio::signal::ctrl_c().await.context("waiting for Ctrl-C")?;
    info!("Ctrl-C received, finishing the current node and shutting down");
    let _ = shutdown_tx.send(true);
    runner.await.context("scheduler task panicked")?;

    store.flush().await?;
    info!("Compensation node stopped");
    Ok(())
}
