use std::sync::Arc;

use anyhow::{Context, Result};
use clap::Parser;
use tokio::signal;
use tracing::{info, warn};

use console_broker::{
    compute::HttpComputeBackend,
    config::{BrokerConfig, Cli},
    routes::{build_router, metrics_router, AppState},
    telemetry::Telemetry,
    ConsoleBackend, ConsoleBroker, MemorySessionStore, RedisSessionStore, SessionStore,
};

#[tokio::main]
async fn main() -> Result<()> {
    let telemetry = Telemetry::init()?;

    let cli = Cli::parse();
    let config = BrokerConfig::try_from(cli)?;
    info!(
        listen_addr = %config.listen_addr,
        compute_url = %config.compute_url,
        keeper_host = %config.keeper.host,
        keeper_port = %config.keeper.port,
        "starting console broker"
    );

    let backend: Arc<dyn ConsoleBackend> = Arc::new(
        HttpComputeBackend::new(config.compute_url.clone(), config.compute_timeout)
            .context("failed to build compute client")?,
    );
    let store = session_store(&config).await;
    let broker = Arc::new(ConsoleBroker::new(
        backend.clone(),
        store,
        Arc::new(config.keeper.clone()),
    ));

    let app = build_router(AppState::new(broker, backend))
        .merge(metrics_router(telemetry.metrics_handle()));

    let listener = tokio::net::TcpListener::bind(config.listen_addr)
        .await
        .context("failed to bind listener")?;
    info!("console broker listening on {}", config.listen_addr);

    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await
        .context("server shutdown with error")?;

    if !config.shutdown_grace.is_zero() {
        info!(
            grace_seconds = config.shutdown_grace.as_secs(),
            "shutdown signal received; sleeping for graceful period"
        );
        tokio::time::sleep(config.shutdown_grace).await;
    }
    info!("graceful shutdown complete");

    Ok(())
}

/// Redis when configured and reachable, otherwise a process-local store.
async fn session_store(config: &BrokerConfig) -> Arc<dyn SessionStore> {
    let ttl = config.record_ttl();
    match &config.redis_url {
        Some(redis_url) => match RedisSessionStore::new(redis_url, ttl).await {
            Ok(store) => {
                info!(
                    ttl_seconds = ?ttl.map(|ttl| ttl.as_secs()),
                    "session records stored in redis"
                );
                Arc::new(store)
            }
            Err(err) => {
                warn!(
                    error = %err,
                    "failed to connect to redis; continuing with in-memory session store"
                );
                Arc::new(MemorySessionStore::with_capacity(
                    ttl,
                    config.memory_store_capacity,
                ))
            }
        },
        None => {
            warn!("redis url not set; session records kept in memory");
            Arc::new(MemorySessionStore::with_capacity(
                ttl,
                config.memory_store_capacity,
            ))
        }
    }
}

async fn shutdown_signal() {
    let _ = signal::ctrl_c().await;
}
