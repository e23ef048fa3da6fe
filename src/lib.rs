//! iruka-qa -- automated QA runs and the release gate for game builds.
//!
//! This crate provides the run pipeline (driver process, host-page bridge
//! evaluation, result aggregation, artifact publishing, signed callbacks)
//! and the game-version lifecycle that QC verdicts drive.

pub mod api;
pub mod bridge;
pub mod callback;
pub mod checks;
pub mod config;
pub mod pipeline;
pub mod publish;
pub mod release;
pub mod runner;
pub mod storage;
pub mod summary;

use anyhow::{Context, Result};

use crate::config::ServiceConfig;

/// Start the iruka-qa service: storage, pipeline, and HTTP API.
pub async fn serve(config: ServiceConfig) -> Result<()> {
    // 1. Initialize Storage
    tracing::info!(db_path = %config.server.db_path.display(), "Initializing database");
    let pool = storage::open_pool(&config.server.db_path)?;

    // 2. Initialize Pipeline
    std::fs::create_dir_all(&config.server.runs_dir).with_context(|| {
        format!("failed to create runs dir: {}", config.server.runs_dir.display())
    })?;
    let pipeline = pipeline::Pipeline::from_config(&config, Some(pool.clone()))?;

    // 3. Start API Server
    let addr: std::net::SocketAddr = config
        .server
        .bind
        .parse()
        .with_context(|| format!("invalid bind address: {}", config.server.bind))?;
    let app = api::router(api::state::AppState::new(pool, pipeline));

    tracing::info!(%addr, "iruka-qa listening");
    let listener = tokio::net::TcpListener::bind(addr).await?;
    axum::serve(listener, app)
        .with_graceful_shutdown(async {
            let _ = tokio::signal::ctrl_c().await;
            tracing::info!("shutdown requested");
        })
        .await?;

    Ok(())
}
