// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Keel Control - DBaaS control plane daemon
//!
//! Connects the status store, applies migrations and runs the heartbeat
//! monitor until interrupted. Guest endpoints and the orchestration layer are
//! wired in by the embedding deployment through the library API.

use std::sync::Arc;
use tracing::{info, warn};

use keel_control::config::Config;
use keel_control::heartbeat_monitor::{HeartbeatMonitor, HeartbeatMonitorConfig};
use keel_core::persistence::SqlitePersistence;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Initialize logging
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "keel_control=info".into()),
        )
        .init();

    // Load .env file if present
    if let Err(e) = dotenvy::dotenv() {
        warn!("No .env file loaded: {}", e);
    }

    let config = Config::from_env()?;

    info!(
        database_url = %config.database_url,
        heartbeat_expiry_secs = config.agent_heartbeat_expiry.as_secs(),
        "Starting Keel Control"
    );

    // An in-memory database lives in a single connection
    let max_connections = if config.database_url.contains(":memory:") {
        1
    } else {
        5
    };
    let pool = sqlx::sqlite::SqlitePoolOptions::new()
        .max_connections(max_connections)
        .connect(&config.database_url)
        .await?;

    info!("Connected to database");

    keel_core::migrations::run_sqlite(&pool).await?;

    info!("Database schema verified");

    let persistence = Arc::new(SqlitePersistence::new(pool.clone()));

    let monitor = Arc::new(HeartbeatMonitor::new(
        persistence,
        HeartbeatMonitorConfig::from(&config),
    ));
    let shutdown = monitor.shutdown_handle();
    let monitor_task = tokio::spawn({
        let monitor = monitor.clone();
        async move { monitor.run().await }
    });

    info!("Keel Control ready");

    // Wait for shutdown signal
    tokio::signal::ctrl_c().await?;
    info!("Shutdown signal received");

    shutdown.notify_one();
    if let Err(e) = monitor_task.await {
        warn!(error = %e, "Heartbeat monitor task ended abnormally");
    }
    pool.close().await;

    info!("Keel Control shut down");

    Ok(())
}
