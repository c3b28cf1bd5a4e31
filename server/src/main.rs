//! Accord Relay - sync server for local-first data synchronization.

use accord_server::config::Config;
use accord_server::websocket::ConnectionManager;
use accord_server::worker::StorageWorker;
use accord_server::{app, db, AppState};
use std::sync::Arc;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    // Initialize tracing
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "accord_server=debug,accord_engine=info,tower_http=debug".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    // Load configuration
    dotenvy::dotenv().ok();
    let config = Config::from_env()?;

    tracing::info!(
        node_id = %config.node_id,
        "Starting Accord Relay on {}:{}",
        config.host,
        config.port
    );

    // Create database pool
    let pool = db::create_pool(&config.database_url).await?;

    // Run migrations
    tracing::info!("Running database migrations...");
    db::run_migrations(&pool).await?;

    // Load the index and start the storage worker
    let worker = StorageWorker::load(pool, &config).await?.spawn();

    // Build application state
    let state = AppState {
        config: Arc::new(config.clone()),
        worker,
        conn_manager: ConnectionManager::new_shared(),
    };

    // Start server
    let addr = format!("{}:{}", config.host, config.port);
    let listener = tokio::net::TcpListener::bind(&addr).await?;
    tracing::info!("Server listening on {}", addr);

    axum::serve(listener, app(state)).await?;

    Ok(())
}
