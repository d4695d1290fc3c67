//! loadplane -- control plane that drives chunked HTTP load tests against
//! deployed workloads.
//!
//! The core is the [`engine`]: a plan is scheduled round-robin, fanned out in
//! bounded waves of workers, and aggregated into the shared [`results`] store.

pub mod api;
pub mod broadcast;
pub mod config;
pub mod engine;
pub mod plan;
pub mod probes;
pub mod results;

use std::time::Duration;

use anyhow::{Context, Result};

use crate::config::LoadplaneConfig;
use crate::engine::{notifier, Engine, EngineSettings};
use crate::results::ResultStore;

/// Start the loadplane daemon: API server, completion broadcaster and result retention.
pub async fn serve(config: LoadplaneConfig) -> Result<()> {
    // 1. Shared result store and completion channel
    let store = ResultStore::new();
    let (notifier, completions) = notifier::channel();

    // 2. Engine
    let engine = Engine::new(EngineSettings::from(&config.engine), store.clone(), notifier)
        .context("Failed to build load-test engine")?;

    // 3. Broadcaster (background task)
    let broadcaster = broadcast::Broadcaster::new(store.clone(), 64);
    tokio::spawn(broadcaster.run(completions));

    // 4. Retention sweeper (background task)
    if config.results.retention_secs > 0 {
        tokio::spawn(results::run_retention_loop(
            store.clone(),
            Duration::from_secs(config.results.retention_secs),
            Duration::from_secs(config.results.sweep_interval_secs.max(1)),
        ));
    }

    // 5. API server
    let addr: std::net::SocketAddr = config
        .server
        .bind
        .parse()
        .with_context(|| format!("Invalid bind address '{}'", config.server.bind))?;
    let app = api::router(api::state::AppState::new(engine));

    tracing::info!(%addr, "loadplane listening");
    let listener = tokio::net::TcpListener::bind(addr)
        .await
        .with_context(|| format!("Failed to bind {addr}"))?;
    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await?;

    tracing::info!("loadplane stopped");
    Ok(())
}

async fn shutdown_signal() {
    if let Err(e) = tokio::signal::ctrl_c().await {
        tracing::error!(error = %e, "Failed to listen for shutdown signal");
        std::future::pending::<()>().await;
    }
    tracing::info!("Shutdown initiated");
}
