// Copyright (C) 2026 Windlass Contributors
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Windlass Engine - standalone run orchestration process
//!
//! Wires the engine over the configured database, starts the scheduled-job
//! worker and runs until interrupted. Useful for local development; larger
//! deployments embed [`windlass_engine::RunEngine`] in their own process.

use std::sync::Arc;

use anyhow::Result;
use tracing::{error, info};

use windlass_engine::config::EngineConfig;
use windlass_engine::engine::RunEngine;
use windlass_engine::persistence::{Persistence, PostgresPersistence, SqlitePersistence};
use windlass_keyval::{KeyValueStore, MemoryStore};

#[tokio::main]
async fn main() -> Result<()> {
    // Load .env file (from crate directory or parent directories)
    dotenvy::dotenv().ok();

    // Initialize tracing
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::from_default_env()
                .add_directive("windlass_engine=info".parse()?),
        )
        .init();

    info!("Starting Windlass Engine");

    // Load configuration
    let config = EngineConfig::from_env().map_err(|e| {
        error!("Configuration error: {}", e);
        e
    })?;

    info!(
        poll_interval_ms = config.worker_poll_interval.as_millis() as u64,
        max_dequeues = config.max_dequeues,
        "Configuration loaded"
    );

    // Connect to the database and run migrations
    info!("Connecting to database...");
    let persistence: Arc<dyn Persistence> = if config.database_url.starts_with("sqlite:") {
        let path = config.database_url.trim_start_matches("sqlite:");
        Arc::new(SqlitePersistence::from_path(path).await?)
    } else {
        Arc::new(PostgresPersistence::connect(&config.database_url).await?)
    };
    info!("Database connection established, migrations applied");

    let store = Arc::new(MemoryStore::new()) as Arc<dyn KeyValueStore>;
    let engine = RunEngine::new(persistence, store, config);

    engine.health_check().await?;
    info!("Windlass Engine initialized successfully");

    // Start the scheduled-job worker (delays, TTLs, heartbeats, continuations)
    let worker_handle = engine.spawn_worker();

    // Wait for shutdown signal
    tokio::signal::ctrl_c().await?;
    info!("Shutting down...");

    engine.shutdown();
    let _ = worker_handle.await;
    info!("Shutdown complete");

    Ok(())
}
