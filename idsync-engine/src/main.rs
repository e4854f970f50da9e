//! # idsync
//!
//! Synchronizes identity assets from one source and writes change events as
//! JSON lines to stdout.
//!
//! ## Commands
//!
//! - `run`: run the sync/update loop until interrupted (default)
//! - `sync`: run one full synchronization and exit
//! - `update`: run one incremental update and exit
//! - `status`: print the stored cursors
//!
//! ## Example
//!
//! ```bash
//! idsync --config idsync.toml
//! RUST_LOG=idsync_engine=debug idsync --config idsync.toml --json-logs sync
//! ```

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use idsync_engine::http::{build_router, health, HttpState};
use idsync_engine::provider::Provider;
use idsync_engine::publish::NdjsonPublisher;
use idsync_engine::ratelimit::AdaptiveRateLimiter;
use idsync_engine::registry::ProviderRegistry;
use idsync_engine::storage::Store;
use idsync_engine::{logging, statestore, Config, SyncInput};
use std::path::PathBuf;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;

/// Identity asset synchronization.
#[derive(Parser, Debug)]
#[command(name = "idsync")]
#[command(version, about, long_about = None)]
struct Cli {
    /// Configuration file
    #[arg(long, short, global = true, default_value = "idsync.toml")]
    config: PathBuf,

    /// Log as JSON lines
    #[arg(long, global = true)]
    json_logs: bool,

    /// Log level when RUST_LOG is unset
    #[arg(long, global = true, default_value = "info")]
    log_level: String,

    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Run the sync/update loop until interrupted
    Run,
    /// Run one full synchronization and exit
    Sync,
    /// Run one incremental update and exit
    Update,
    /// Print the stored cursors
    Status,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    logging::init_tracing(&cli.log_level, cli.json_logs);

    let config = Config::from_file(&cli.config)?;
    let store = Store::open(&config.storage.database)
        .await
        .with_context(|| format!("Failed to open {}", config.storage.database.display()))?;

    let command = cli.command.unwrap_or(Commands::Run);
    if let Commands::Status = command {
        return status(&config, &store).await;
    }

    let registry = ProviderRegistry::with_builtin();
    let provider: Arc<dyn Provider> = registry.get(&config.input.provider, &config.provider)?;
    let limiter = Arc::new(AdaptiveRateLimiter::from_config(&config.limits));
    let publisher = Arc::new(NdjsonPublisher::new(tokio::io::stdout()));
    let input = SyncInput::new(
        config.input.id.clone(),
        provider,
        store.clone(),
        publisher,
        &config.sync,
    )
    .with_limiter(limiter);

    let shutdown = CancellationToken::new();
    spawn_signal_handler(shutdown.clone());

    let outcome = match command {
        Commands::Sync => input.sync_once(&shutdown).await.map(|_| ()).map_err(Into::into),
        Commands::Update => input.update_once(&shutdown).await.map(|_| ()).map_err(Into::into),
        _ => run(&config, &input, shutdown).await,
    };
    store.close().await;
    outcome
}

async fn run(config: &Config, input: &SyncInput, shutdown: CancellationToken) -> Result<()> {
    if config.http.enabled {
        health::init_start_time();
        let state = Arc::new(HttpState {
            input_id: config.input.id.clone(),
            metrics: input.metrics(),
        });
        let listener = tokio::net::TcpListener::bind(&config.http.bind_address)
            .await
            .with_context(|| format!("Failed to bind {}", config.http.bind_address))?;
        tracing::info!("HTTP endpoints on {}", config.http.bind_address);

        let token = shutdown.clone();
        tokio::spawn(async move {
            let server = axum::serve(listener, build_router(state))
                .with_graceful_shutdown(async move { token.cancelled().await });
            if let Err(e) = server.await {
                tracing::error!("HTTP server error: {}", e);
            }
        });
    }

    input.run(shutdown).await?;
    Ok(())
}

async fn status(config: &Config, store: &Store) -> Result<()> {
    let cursors = statestore::load_cursors(store).await?;
    let never = || "never".to_string();
    println!("input:       {}", config.input.id);
    println!("provider:    {}", config.input.provider);
    println!(
        "last sync:   {}",
        cursors.last_sync.map_or_else(never, |t| t.to_rfc3339())
    );
    println!(
        "last update: {}",
        cursors.last_update.map_or_else(never, |t| t.to_rfc3339())
    );
    for (key, value) in cursors.tokens.iter() {
        println!("token {key}: {value}");
    }
    store.close().await;
    Ok(())
}

fn spawn_signal_handler(shutdown: CancellationToken) {
    tokio::spawn(async move {
        match tokio::signal::ctrl_c().await {
            Ok(()) => {
                tracing::info!("Shutdown requested");
                shutdown.cancel();
            }
            Err(e) => tracing::error!("Failed to listen for ctrl-c: {}", e),
        }
    });
}
