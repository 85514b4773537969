mod config;
mod events;
mod backend;
mod discoverer;
mod publisher;
mod engine;
mod api;

use std::path::PathBuf;
use std::sync::Arc;
use tokio::sync::Mutex;
use tokio_util::sync::CancellationToken;
use mdns_sd::ServiceDaemon;
use anyhow::{Context, Result};
use crate::backend::mdns::MdnsBackend;
use crate::config::Config;
use crate::engine::{Engine, EngineSettings};
use crate::events::{EventLog, LogSink};

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("mdiscod=info"))
        )
        .init();

    tracing::info!("Starting mdiscod");

    let (config, config_path) = Config::load_or_default(std::env::args().nth(1).map(PathBuf::from))?;
    match &config_path {
        Some(path) => tracing::info!("Loaded config from {}", path.display()),
        None => tracing::info!("No config file, using defaults"),
    }

    let mdns_daemon = ServiceDaemon::new()
        .context("Failed to create mDNS daemon")?;
    if let Some(interface) = &config.mdns.interface {
        mdns_daemon
            .disable_interface(mdns_sd::IfKind::All)
            .context("Failed to disable default interfaces")?;
        mdns_daemon
            .enable_interface(interface.as_str())
            .with_context(|| format!("Failed to enable interface {}", interface))?;
    }

    let backend = Arc::new(MdnsBackend::new(mdns_daemon.clone())?);
    let log = EventLog::new(config.api.log_capacity);

    let engine = Engine::new(
        backend,
        EngineSettings::from_config(&config),
        Arc::new(LogSink::discovery(log.clone())),
        Arc::new(LogSink::service(log.clone())),
    )
    .with_log(log.clone());
    let engine = Arc::new(Mutex::new(engine));
    engine.lock().await.start().await;

    let cancel = CancellationToken::new();

    let app = api::routes::router(api::routes::AppState {
        engine: engine.clone(),
        log,
    });

    let listener = tokio::net::TcpListener::bind(&config.api.listen)
        .await
        .with_context(|| format!("Failed to bind to {}", config.api.listen))?;

    tracing::info!("API listening on {}", config.api.listen);

    let server_cancel = cancel.clone();
    let server_handle = tokio::spawn(async move {
        if let Err(e) = axum::serve(listener, app)
            .with_graceful_shutdown(async move { server_cancel.cancelled().await })
            .await
        {
            tracing::error!("Server error: {}", e);
        }
    });

    tokio::signal::ctrl_c()
        .await
        .context("Failed to listen for ctrl-c")?;

    tracing::info!("Shutdown signal received");

    cancel.cancel();
    let _ = server_handle.await;

    // Discoverer first, then the publisher withdraws its service
    engine.lock().await.shutdown().await;

    if let Err(e) = mdns_daemon.shutdown() {
        tracing::error!("Failed to shutdown mDNS daemon: {}", e);
    }

    tracing::info!("Shutdown complete");
    Ok(())
}
