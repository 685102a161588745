//! Windlass sync daemon
//!
//! Binds the configured contracts over JSON-RPC, backfills every model's
//! objects, then follows new blocks and prints the cache whenever it changes.

use anyhow::{Context, Result};
use clap::Parser;
use std::path::PathBuf;
use std::sync::Arc;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;
use windlass::config::load_config;
use windlass::rpc::{RpcClient, RpcLedger};
use windlass::{SyncEngine, SyncHandle};

/// Keep object caches in sync with on-chain contracts
#[derive(Parser)]
#[command(name = "windlass")]
#[command(about = "Keep object caches in sync with on-chain contracts")]
struct Args {
    /// Path to the JSON config file
    #[arg(short, long, default_value = "windlass.json")]
    config: PathBuf,

    /// RPC endpoint URL, overriding the config file
    #[arg(short, long)]
    rpc_url: Option<String>,

    /// Skip enumerating existing objects at startup
    #[arg(long)]
    no_backfill: bool,
}

async fn backfill(handle: &SyncHandle, models: &[String], limit: u64) {
    for model in models {
        match handle.enumerate_objects(model, limit, 0).await {
            Ok(count) => info!("Backfilled {} {} objects", count, model),
            Err(e) => warn!("Backfill of {} failed: {}", model, e),
        }
    }
}

async fn print_snapshots(handle: SyncHandle) {
    let mut cache = handle.subscribe_cache();
    while cache.changed().await.is_ok() {
        let snapshot = cache.borrow_and_update().clone();
        match serde_json::to_string_pretty(snapshot.as_ref()) {
            Ok(json) => println!("{}", json),
            Err(e) => warn!("Failed to render snapshot: {}", e),
        }
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    let mut config = load_config(&args.config)
        .with_context(|| format!("Failed to load config from {:?}", args.config))?;
    if let Some(url) = args.rpc_url {
        config.chain.rpc_url = url;
    }

    // RUST_LOG wins over the configured level
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(&config.log_level));
    tracing_subscriber::fmt().with_env_filter(filter).init();

    info!("Starting {}", config.system_name);
    info!("RPC URL: {}", config.chain.rpc_url);
    info!("Config: {:?}", args.config);

    let contracts = config.bind_contracts()?;
    let ledger = Arc::new(RpcLedger::new(RpcClient::new(config.chain.rpc_url.clone()), contracts));

    let model_names: Vec<String> = config.models.iter().map(|m| m.name().to_string()).collect();
    let (engine, handle) = SyncEngine::new(ledger, config.engine_config(), config.models)
        .context("Failed to initialize sync engine")?;

    let engine_task = tokio::spawn(engine.run());
    let printer = tokio::spawn(print_snapshots(handle.clone()));

    if !args.no_backfill {
        backfill(&handle, &model_names, config.chain.backfill_limit).await;
    }

    tokio::select! {
        result = engine_task => {
            result.context("Sync engine task failed")?;
        }
        _ = tokio::signal::ctrl_c() => {
            info!("Received Ctrl+C, shutting down gracefully...");
        }
    }

    printer.abort();
    info!("{} stopped", config.system_name);
    Ok(())
}
