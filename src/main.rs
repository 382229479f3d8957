//! jsondrop server
//!
//! Serves the REST API, runs the expired-database sweep and the stale
//! listener sweep until interrupted.
//!
//! Usage:
//!   cargo run --bin jsondrop -- --port 8080
//!   cargo run --bin load_data        # seed a sample database
//!   # Then use jsondrop-cli or curl against /api

use std::sync::Arc;

use clap::Parser;
use tokio::net::TcpListener;
use tracing::{error, info};

use jsondrop::config::Config;
use jsondrop::events::{Broadcaster, BroadcasterConfig};
use jsondrop::observability::init_logging;
use jsondrop::rest::create_router;
use jsondrop::storage::StoragePool;
use jsondrop::{Catalog, DocumentStore};

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    // .env is optional; real environment variables win.
    let _ = dotenvy::dotenv();
    let config = Config::parse();
    config.validate()?;

    let _log_guard = init_logging(config.log_format, config.log_dir.as_deref());

    let broadcaster = Broadcaster::new(BroadcasterConfig::default());
    let _sweeper = broadcaster.spawn_sweeper();

    let storage = StoragePool::with_capacity(&config.db_base_dir, config.max_open_databases)?;
    let catalog = Arc::new(Catalog::with_storage(
        &config.catalog_db_path,
        storage,
        config.default_quota_bytes(),
        broadcaster,
    )?);

    let expiry = config.expiry();
    let every = config.expiry_check_interval;
    let sweeping = catalog.clone();
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(every);
        loop {
            ticker.tick().await;
            let catalog = sweeping.clone();
            match tokio::task::spawn_blocking(move || catalog.sweep_expired(expiry)).await {
                Ok(Ok(_)) => {}
                Ok(Err(e)) => error!(error = %e, "expiry sweep failed"),
                Err(e) => error!(error = %e, "expiry sweep panicked"),
            }
        }
    });

    let app = create_router(DocumentStore::new(catalog), config.cors_origins.clone());

    let addr = config.listen_addr();
    info!(
        %addr,
        data_dir = %config.db_base_dir.display(),
        quota_mb = config.default_quota_mb,
        expiry_days = config.expiry_days,
        "jsondrop listening"
    );
    let listener = TcpListener::bind(addr).await?;
    axum::serve(listener, app.into_make_service())
        .with_graceful_shutdown(async {
            let _ = tokio::signal::ctrl_c().await;
            info!("shutting down");
        })
        .await?;

    Ok(())
}
