// packages/engine/src/main.rs
//! Quoll Session Store Engine
//!
//! Runs the background store writer and the HTTP surface until CTRL+C.

use anyhow::{Context, Result};
use quoll_engine::observability::{init_metrics, init_tracing};
use quoll_engine::recording::Store;
use quoll_engine::server::{AppState, EventServer};
use quoll_engine::utils::config::EngineConfig;
use quoll_engine::BuildInfo;
use std::sync::Arc;
use tracing::{error, info};

#[tokio::main]
async fn main() -> Result<()> {
    // Load configuration before logging so the configured level applies
    let config = EngineConfig::load().context("failed to load configuration")?;

    init_tracing(&config.logging)?;
    let metrics = init_metrics()?;

    let build = BuildInfo::current();
    info!(
        "Starting Quoll Session Store Engine v{} ({}, {})",
        build.version, build.git_hash, build.rustc_version
    );
    info!("Configuration loaded: {:?}", config);

    let store = Store::new(config.store.clone()).context("failed to open event store")?;
    let worker = store.start()?;

    let state = Arc::new(AppState::new(&config, store, Some(metrics)));
    let server = EventServer::new(Arc::clone(&state));

    // Graceful shutdown handler
    let shutdown = state.shutdown.clone();
    tokio::spawn(async move {
        match tokio::signal::ctrl_c().await {
            Ok(()) => info!("Received shutdown signal, cleaning up..."),
            Err(e) => error!("Failed to listen for CTRL+C: {}", e),
        }
        shutdown.cancel();
    });

    let served = server.bind(&config.server).await;

    // final flush happens on the writer thread
    tokio::task::spawn_blocking(move || worker.shutdown()).await?;

    match served {
        Ok(()) => {
            info!("Server stopped gracefully");
            Ok(())
        }
        Err(e) => {
            error!("Server error: {}", e);
            Err(e.into())
        }
    }
}
