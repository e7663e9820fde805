//! Reel Ingest Server
//!
//! Accepts video uploads, either as numbered chunks merged on request or as
//! a single streamed multipart body, and hands finished artifacts to the
//! processing pipeline.

use std::net::SocketAddr;

use anyhow::Context;
use tokio::signal;
use tokio_util::sync::CancellationToken;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use reel_ingest::config::Config;
use reel_ingest::routes;
use reel_ingest::state::AppState;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Initialize tracing
    tracing_subscriber::registry()
        .with(tracing_subscriber::EnvFilter::try_from_default_env()
            .unwrap_or_else(|_| "reel_ingest=debug,tower_http=debug".into()))
        .with(tracing_subscriber::fmt::layer())
        .init();

    // Load configuration
    dotenvy::dotenv().ok();

    let config = Config::from_env().unwrap_or_else(|e| {
        tracing::warn!("Failed to load config from env: {}, using defaults", e);
        Config::default()
    });

    tracing::info!("Starting Reel Ingest v{}", env!("CARGO_PKG_VERSION"));
    tracing::info!("Chunk directory: {}", config.storage.chunk_dir.display());
    tracing::info!("Artifact directory: {}", config.storage.artifact_dir.display());

    for dir in [&config.storage.chunk_dir, &config.storage.artifact_dir] {
        tokio::fs::create_dir_all(dir)
            .await
            .with_context(|| format!("Failed to create {}", dir.display()))?;
    }

    let shutdown = CancellationToken::new();
    let app_state = AppState::new(config.clone(), shutdown.clone());
    tracing::info!("Processing queue: {}", app_state.jobs().name());

    // Start the orphan sweeper
    let sweeper = app_state
        .sweeper()
        .spawn(config.sweep_interval(), shutdown.child_token());
    tracing::info!(
        "Orphan sweeper started (retention: {}h, interval: {}s)",
        config.sweeper.retention_hours,
        config.sweeper.interval_secs
    );

    let app = routes::app(app_state);

    // Start server with graceful shutdown
    let addr: SocketAddr = format!("{}:{}", config.server.host, config.server.port)
        .parse()
        .with_context(|| format!("Invalid listen address {}:{}", config.server.host, config.server.port))?;
    tracing::info!("Reel Ingest listening on {}", addr);

    let listener = tokio::net::TcpListener::bind(addr)
        .await
        .with_context(|| format!("Failed to bind {}", addr))?;

    let signal_token = shutdown.clone();
    axum::serve(listener, app)
        .with_graceful_shutdown(async move {
            shutdown_signal().await;
            // Abort in-flight direct transfers and stop the sweeper
            signal_token.cancel();
        })
        .await
        .context("Server error")?;

    let _ = sweeper.await;
    tracing::info!("Server shutdown complete");
    Ok(())
}

/// Graceful shutdown signal handler
async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = signal::ctrl_c().await {
            tracing::error!("Failed to install Ctrl+C handler: {}", e);
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match signal::unix::signal(signal::unix::SignalKind::terminate()) {
            Ok(mut stream) => {
                stream.recv().await;
            }
            Err(e) => {
                tracing::error!("Failed to install SIGTERM handler: {}", e);
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {
            tracing::info!("Received Ctrl+C, starting graceful shutdown...");
        },
        _ = terminate => {
            tracing::info!("Received SIGTERM, starting graceful shutdown...");
        },
    }
}
