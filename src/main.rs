//! Hookline webhook broadcaster.
//!
//! Main entry point for the hookline server. Initializes all subsystems
//! and coordinates graceful startup and shutdown.

use std::{sync::Arc, time::Duration};

use anyhow::{Context, Result};
use hookline_api::{AppState, Config, StorageBackend};
use hookline_core::{storage::run_migrations, Storage};
use hookline_delivery::{Broadcaster, WebhookSender};
use sqlx::postgres::PgPoolOptions;
use tracing::{error, info, warn};

#[tokio::main]
async fn main() -> Result<()> {
    init_tracing();

    info!("Starting hookline webhook broadcaster");

    let config = Config::load()?;
    let server_addr = config.parse_server_addr()?;
    info!(
        storage = ?config.storage_backend,
        database_url = %config.database_url_masked(),
        server_addr = %server_addr,
        max_retries = config.max_retries,
        "Configuration loaded"
    );

    let storage = match config.storage_backend {
        StorageBackend::Postgres => {
            let pool = create_database_pool(&config).await?;
            info!("Database connection pool established");

            run_migrations(&pool).await.context("Failed to run database migrations")?;
            info!("Database migrations completed");

            Storage::postgres(pool)
        },
        StorageBackend::Memory => {
            warn!("Using in-memory storage; endpoints and delivery records are lost on restart");
            Storage::in_memory()
        },
    };

    let retry_policy = config.to_retry_policy();
    retry_policy.validate().context("Invalid retry policy")?;

    let sender = WebhookSender::new(config.to_sender_config(), storage.deliveries.clone())
        .context("Failed to build webhook sender")?;
    let broadcaster = Broadcaster::new(
        storage.endpoints.clone(),
        Arc::new(sender),
        retry_policy,
        config.to_broadcast_config(),
    );

    let state = AppState::new(storage.clone(), broadcaster.clone());
    info!(addr = %server_addr, "hookline is ready to accept events");

    if let Err(e) = hookline_api::start_server(
        state,
        server_addr,
        Duration::from_secs(config.request_timeout),
    )
    .await
    {
        error!(error = %e, "Server failed");
    }

    info!(
        in_flight = broadcaster.in_flight(),
        timeout_secs = config.shutdown_timeout_seconds,
        "Draining webhook deliveries"
    );
    if let Err(e) = broadcaster.shutdown(config.shutdown_timeout()).await {
        warn!(error = %e, "Webhook deliveries did not drain in time");
    }

    if let Some(pool) = storage.pool() {
        pool.close().await;
        info!("Database connections closed");
    }

    info!("hookline shutdown complete");
    Ok(())
}

/// Initializes tracing with environment-based configuration.
fn init_tracing() {
    use tracing_subscriber::{fmt, layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

    let filter = EnvFilter::try_from_default_env()
        .or_else(|_| EnvFilter::try_new("info,hookline=debug,tower_http=debug"))
        .expect("Invalid RUST_LOG environment variable");

    let fmt_layer = fmt::layer()
        .with_target(true)
        .with_thread_ids(true)
        .with_thread_names(true)
        .with_file(true)
        .with_line_number(true);

    tracing_subscriber::registry().with(filter).with(fmt_layer).init();
}

/// Creates the database connection pool with retry logic.
async fn create_database_pool(config: &Config) -> Result<sqlx::PgPool> {
    const MAX_RETRIES: u32 = 5;
    const RETRY_DELAY: Duration = Duration::from_secs(2);
    let mut retries = 0;

    loop {
        match PgPoolOptions::new()
            .max_connections(config.database_max_connections)
            .min_connections(config.database_min_connections)
            .acquire_timeout(Duration::from_secs(config.database_connection_timeout))
            .idle_timeout(Duration::from_secs(600))
            .max_lifetime(Duration::from_secs(1800))
            .connect(&config.database_url)
            .await
        {
            Ok(pool) => {
                sqlx::query("SELECT 1")
                    .execute(&pool)
                    .await
                    .context("Failed to verify database connection")?;

                return Ok(pool);
            },
            Err(e) if retries < MAX_RETRIES => {
                retries += 1;
                info!(
                    attempt = retries,
                    max_retries = MAX_RETRIES,
                    error = %e,
                    "Database connection failed, retrying..."
                );
                tokio::time::sleep(RETRY_DELAY).await;
            },
            Err(e) => {
                return Err(e).context("Failed to create database connection pool after retries");
            },
        }
    }
}
