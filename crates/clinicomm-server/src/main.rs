//! ClinicComm - Delivery core entry point

use anyhow::Result;
use clinicomm_api::AppState;
use clinicomm_common::config::{Config, LoggingConfig};
use clinicomm_core::AdapterRegistry;
use clinicomm_storage::DatabasePool;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tracing::info;
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

#[tokio::main]
async fn main() -> Result<()> {
    // Load configuration
    let config = Config::load()?;

    // Initialize logging
    init_logging(&config.logging);

    info!("Starting ClinicComm delivery core...");

    // Initialize database
    let db_pool = DatabasePool::new(&config.database).await?;
    info!("Database connection established");

    // Run migrations
    db_pool.migrate().await?;
    info!("Database migrations completed");

    // Channel adapters
    let adapters = AdapterRegistry::from_config(&config.providers)?;

    // Wire services
    let state = Arc::new(AppState::build(&config, db_pool.clone(), adapters).await?);

    // Reload pending messages before accepting new ones
    let recovered = state.scheduler.recover().await?;
    info!(recovered, "Pending messages restored");

    let shutdown = CancellationToken::new();

    // Start scheduler
    let scheduler_handle = {
        let scheduler = Arc::clone(&state.scheduler);
        tokio::spawn(scheduler.run(shutdown.clone()))
    };

    // Start API server
    let addr = format!("{}:{}", config.server.bind_address, config.server.port);
    let listener = tokio::net::TcpListener::bind(&addr).await?;
    info!("Starting API server on {}", addr);

    let app = clinicomm_api::create_router(Arc::clone(&state));
    let server_shutdown = shutdown.clone();
    axum::serve(listener, app)
        .with_graceful_shutdown(async move {
            if tokio::signal::ctrl_c().await.is_ok() {
                info!("Shutdown signal received");
            }
            server_shutdown.cancel();
        })
        .await?;

    // Cleanup
    shutdown.cancel();
    scheduler_handle.await?;
    db_pool.close().await;

    info!("ClinicComm shutdown complete");

    Ok(())
}

fn init_logging(logging: &LoggingConfig) {
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(&logging.level));

    let registry = tracing_subscriber::registry().with(filter);
    if logging.format == "json" {
        registry
            .with(fmt::layer().json().with_target(true).with_level(true))
            .init();
    } else {
        registry
            .with(fmt::layer().with_target(true).with_level(true))
            .init();
    }
}
