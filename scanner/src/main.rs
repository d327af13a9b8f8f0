//! Lockpost scanner daemon - main entry point

use std::sync::Arc;
use tracing::info;

use lockpost_scanner::{
    chain_client::HttpChainProvider,
    config::Config,
    database::{Database, SqliteGateway},
    scanner::{ScanCursor, UnifiedScanner},
};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Initialize logging
    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .init();

    info!("Starting lockpost scanner");

    let config = Config::from_env()?;
    info!("Database path: {:?}", config.database_path);

    let database = Database::new(&config.database_path).await?;
    database.migrate().await?;
    info!("Database migrations completed");

    info!("Chain provider: {}", config.provider_url);
    let provider = Arc::new(HttpChainProvider::new(
        &config.provider_url,
        config.fetch_max_retries,
        config.backoff_base,
        config.backoff_cap,
    ));

    let gateway = Arc::new(SqliteGateway::new(database.pool().clone()));
    let cursor = ScanCursor::new(database.pool().clone(), config.genesis_height);

    let (shutdown_tx, shutdown_rx) = tokio::sync::watch::channel(false);
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            info!("SIGINT received, shutting down after the current cycle");
            let _ = shutdown_tx.send(true);
        }
    });

    let mut scanner = UnifiedScanner::new(&config, provider, gateway, cursor, shutdown_rx);
    scanner.run().await?;

    Ok(())
}
