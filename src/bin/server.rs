//! Mycenae server
//!
//! Wires the query service and the telnet fleet manager behind one HTTP
//! listener. The storage engine, metadata index and collector are external
//! services in production; this standalone binary runs against the
//! in-memory stand-ins so the whole surface can be exercised locally.
//!
//! # Configuration
//!
//! Read from, in order:
//! 1. the `MYCENAE_CONFIG` environment variable (path to a TOML file)
//! 2. `./mycenae.toml` in the current directory
//! 3. built-in defaults

use std::sync::Arc;

use tokio::signal;
use tracing::info;

use mycenae::api::{build_router, AppState};
use mycenae::config::Settings;
use mycenae::stubs::{InMemoryMetadataCache, InMemoryMetadataIndex, InMemoryStorage, LoggingCollector};
use mycenae::telnet::manager::Manager;
use mycenae::QueryService;

fn load_settings() -> mycenae::Result<Settings> {
    if let Ok(path) = std::env::var("MYCENAE_CONFIG") {
        return Settings::from_file(&path);
    }
    if std::path::Path::new("mycenae.toml").exists() {
        return Settings::from_file("mycenae.toml");
    }
    Ok(Settings::default())
}

async fn shutdown_signal() {
    let ctrl_c = async {
        signal::ctrl_c()
            .await
            .expect("failed to install Ctrl+C handler");
    };

    #[cfg(unix)]
    let terminate = async {
        signal::unix::signal(signal::unix::SignalKind::terminate())
            .expect("failed to install signal handler")
            .recv()
            .await;
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {},
        _ = terminate => {},
    }

    info!("shutdown signal received, starting graceful shutdown");
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let settings = load_settings()?;
    settings.validate()?;

    let filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(&settings.server.log_level));

    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(true)
        .init();

    info!("starting mycenae server v{}", env!("CARGO_PKG_VERSION"));

    let index = Arc::new(InMemoryMetadataIndex::new());
    let storage = Arc::new(InMemoryStorage::new());
    let cache = Arc::new(InMemoryMetadataCache::new());

    let query = Arc::new(QueryService::new(
        &settings.query,
        index,
        storage,
        cache,
    )?);

    let manager = Manager::new(
        settings.telnet.clone(),
        settings.server.http_port,
        Arc::new(LoggingCollector),
    )?;
    for server_settings in &settings.telnet.servers {
        manager.add_server(server_settings).await?;
    }

    let state = Arc::new(AppState {
        query,
        manager: manager.clone(),
    });
    let app = build_router(state);

    let listener = tokio::net::TcpListener::bind(&settings.server.http_listen).await?;
    info!(addr = %settings.server.http_listen, "http server listening");

    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await?;

    manager.shutdown().await;
    info!("server shutdown complete");
    Ok(())
}
