//! Dispatch daemon.
//!
//! Runs the periodic allocation scheduler and the rate-limit retention
//! sweeper against Postgres. The interactive surface (order
//! submission, signups, assignment transitions) is exposed through
//! [`rounds_dispatch::service::DispatchService`] by the embedding API
//! layer.

use std::sync::Arc;

use anyhow::Result;
use rounds_dispatch::{config::Config, service::DispatchService, store::PgStore};
use tracing::{error, info, warn};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

#[tokio::main]
async fn main() -> Result<()> {
    // Load configuration
    let config = Config::from_env()?;

    // Initialize tracing (prefer RUST_LOG, fallback to ROUNDS_LOG_LEVEL)
    tracing_subscriber::registry()
        .with(EnvFilter::try_from_default_env().unwrap_or_else(|_| config.log_level.clone().into()))
        .with(tracing_subscriber::fmt::layer().json())
        .init();

    info!("Starting rounds dispatch daemon");

    // Connect to database
    let store = match PgStore::connect(&config.database).await {
        Ok(store) => {
            info!("Database connection established");
            store
        }
        Err(e) => {
            error!(error = %e, "Failed to connect to database");
            return Err(e.into());
        }
    };

    // Run migrations in dev mode
    if config.dev_mode {
        info!("Running database migrations (dev mode)");
        if let Err(e) = store.run_migrations().await {
            error!(error = %e, "Failed to run migrations");
            return Err(e.into());
        }
    }

    let service = DispatchService::new(Arc::new(store), config.service_config());

    // Create shutdown channel for graceful shutdown
    let (shutdown_tx, shutdown_rx) = tokio::sync::watch::channel(false);

    // Start scheduler worker in background
    let scheduler_worker = service.scheduler_worker();
    let scheduler_handle = tokio::spawn({
        let shutdown_rx = shutdown_rx.clone();
        async move {
            scheduler_worker.run(shutdown_rx).await;
        }
    });

    // Start rate-limit sweep worker in background
    let sweep_worker = service.sweep_worker();
    let sweep_handle = tokio::spawn({
        let shutdown_rx = shutdown_rx.clone();
        async move {
            sweep_worker.run(shutdown_rx).await;
        }
    });

    // Wait for shutdown signal (Ctrl+C)
    tokio::signal::ctrl_c().await?;
    info!("Received shutdown signal");

    // Signal shutdown to all workers and any in-flight pass
    service.request_shutdown();
    let _ = shutdown_tx.send(true);

    info!("Waiting for workers to shut down...");
    let shutdown_timeout = std::time::Duration::from_secs(10);

    if let Err(e) = tokio::time::timeout(shutdown_timeout, scheduler_handle).await {
        warn!(error = %e, "Scheduler worker did not shut down in time");
    }

    if let Err(e) = tokio::time::timeout(shutdown_timeout, sweep_handle).await {
        warn!(error = %e, "Sweep worker did not shut down in time");
    }

    info!("Dispatch daemon shutdown complete");
    Ok(())
}
