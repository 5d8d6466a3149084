use anyhow::{Context, Result};
use std::sync::Arc;
use tracing::{info, warn};

mod api;
mod cache;
mod config;
mod error;
mod jobs;
mod service;
mod sources;
mod storage;

use crate::config::Config;
use crate::service::MusicFinder;
use crate::sources::YtDlpClient;

#[tokio::main]
async fn main() -> Result<()> {
    // Logging
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::from_default_env()
                .add_directive("music_finder=debug".parse()?)
                .add_directive("tower_http=info".parse()?),
        )
        .init();

    info!("🎵 Starting Music Finder v{}", env!("CARGO_PKG_VERSION"));

    // Configuration
    let config = Arc::new(Config::load()?);

    if std::env::args().any(|arg| arg == "--health-check") {
        return health_check(&config).await;
    }

    info!("⚙️ {}", config.summary());

    if let Err(e) = YtDlpClient::new(&config).verify_dependencies().await {
        warn!("⚠️ Missing dependencies, downloads will fail: {:?}", e);
    }

    let finder = Arc::new(MusicFinder::with_ytdlp(Arc::clone(&config)));
    finder.init().await.context("adopting existing downloads")?;
    info!("{}", finder.janitor().stats().await);

    let maintenance = finder.spawn_maintenance();

    let app = api::create_router(Arc::clone(&finder));
    let addr = config.bind_addr();
    let listener = tokio::net::TcpListener::bind(&addr)
        .await
        .with_context(|| format!("binding to {}", addr))?;
    info!("🚀 Listening on http://{}", addr);

    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await
        .context("running HTTP server")?;

    maintenance.stop().await;
    info!("👋 Music Finder stopped");
    Ok(())
}

async fn shutdown_signal() {
    if let Err(e) = tokio::signal::ctrl_c().await {
        warn!("Failed to install Ctrl+C handler: {}", e);
        std::future::pending::<()>().await;
    }
    info!("⚠️ Shutdown signal received, closing...");
}

async fn health_check(config: &Config) -> Result<()> {
    YtDlpClient::new(config)
        .verify_dependencies()
        .await
        .context("missing dependencies")?;
    println!("OK");
    Ok(())
}
