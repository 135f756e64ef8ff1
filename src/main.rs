//! Encore server
//!
//! Run with: `cargo run` or `encore`
//!
//! Configuration via environment variables:
//! - ENCORE_DATABASE__TYPE: sqlite
//! - ENCORE_DATABASE__PATH: file path (sqlite)
//! - ENCORE_SERVER__PORT: port to listen on (default: 8080)
//! - ENCORE_WORKER__WORKER_ID: stable worker identity for claim leases

use std::sync::Arc;

use encore::{
    api::{self, AppState},
    config::{Config, DatabaseConfig},
    models::QueueDescriptor,
    queue::QueueManager,
    store::SqliteStore,
    JobStore,
};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "encore=info".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    tracing::info!("Starting Encore server...");

    let config = Config::from_env().unwrap_or_else(|_| {
        tracing::warn!("No config found, using SQLite in-memory database");
        Config {
            server: Default::default(),
            database: DatabaseConfig::in_memory(),
            worker: Default::default(),
        }
    });

    let DatabaseConfig::Sqlite { path } = &config.database;
    let url = if path.as_str() == ":memory:" {
        "sqlite::memory:".to_string()
    } else {
        format!("sqlite://{path}?mode=rwc")
    };

    tracing::info!(%url, "Connecting to SQLite...");
    let store = SqliteStore::connect(&url).await?;
    store.migrate().await?;
    tracing::info!("Database migrated");

    let manager = Arc::new(QueueManager::new(store, config.worker.clone()));

    // The standard import queues. Handlers are registered by the embedding
    // application before jobs can be submitted; until then the server only
    // answers status, progress and health reads.
    manager.register_queue(QueueDescriptor::new(encore::importer::ARTIST_QUEUE, 2))?;
    manager.register_queue(QueueDescriptor::new(encore::importer::SHOW_QUEUE, 4))?;
    manager.register_queue(QueueDescriptor::new(encore::importer::CATALOG_QUEUE, 2))?;

    manager.initialize().await?;

    let state = Arc::new(AppState {
        manager: manager.clone(),
    });
    let app = api::router(state);

    let address = config.server.address();
    tracing::info!(%address, "Listening");
    let listener = tokio::net::TcpListener::bind(&address).await?;

    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await?;

    manager.shutdown().await;
    tracing::info!("Encore server stopped");
    Ok(())
}

async fn shutdown_signal() {
    if let Err(e) = tokio::signal::ctrl_c().await {
        tracing::error!(error = %e, "Failed to install shutdown handler");
    }
    tracing::info!("Shutdown signal received");
}
