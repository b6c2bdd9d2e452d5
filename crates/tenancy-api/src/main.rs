//! Tenancy API server

use anyhow::Context;
use std::sync::Arc;
use std::time::Duration;
use tenancy_api::sweeper::sweep_task;
use tenancy_api::{build_router, ApiState, AppConfig};
use tenancy_core::{InMemoryStore, TenancyPlatform, TenancyStore};
use tenancy_sqlite::SqliteStore;
use tokio::sync::watch;
use tracing::{info, warn};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::registry()
        .with(tracing_subscriber::EnvFilter::new(
            std::env::var("RUST_LOG").unwrap_or_else(|_| "info".into()),
        ))
        .with(tracing_subscriber::fmt::layer())
        .init();

    let config = AppConfig::load().context("loading configuration")?;
    let addr = config.bind_addr()?;

    let store: Arc<dyn TenancyStore> = match &config.server.database_url {
        Some(url) => Arc::new(
            SqliteStore::connect(url, config.server.max_connections)
                .await
                .with_context(|| format!("opening {url}"))?,
        ),
        None => {
            warn!("No database_url configured, state is kept in memory");
            Arc::new(InMemoryStore::new())
        }
    };

    let platform = Arc::new(TenancyPlatform::new(store, config.tenancy.clone()));
    let seeded = platform.bootstrap().await.context("seeding catalog")?;
    info!(
        features = seeded.features_created,
        plans = seeded.plans_created,
        "Catalog ready"
    );

    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    let sweeper = (config.server.sweep_interval_secs > 0).then(|| {
        tokio::spawn(sweep_task(
            platform.lifecycle.clone(),
            Duration::from_secs(config.server.sweep_interval_secs),
            shutdown_rx,
        ))
    });

    let app = build_router(
        ApiState::new(platform),
        Duration::from_millis(config.server.request_timeout_ms),
    );

    let listener = tokio::net::TcpListener::bind(addr)
        .await
        .with_context(|| format!("binding {addr}"))?;
    info!("Tenancy API listening on {}", addr);

    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await?;

    shutdown_tx.send(true).ok();
    if let Some(handle) = sweeper {
        handle.await?;
    }
    info!("Tenancy API stopped");
    Ok(())
}

async fn shutdown_signal() {
    if let Err(err) = tokio::signal::ctrl_c().await {
        warn!(error = %err, "Failed to listen for shutdown signal");
        std::future::pending::<()>().await;
    }
    info!("Shutdown signal received");
}
