//! Main entry point for the rdio server

use anyhow::Context;
use clap::Parser;
use rdio_core::{Config, ConversionMode, init_logging};
use rdio_database::{Database, MemoryStore, Store};
use rdio_server::{
    AppState, AudioConverter, Controller, FfmpegConverter, HttpRelay, Passthrough, build_router,
};
use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tokio::net::TcpListener;
use tracing::{error, info, warn};

/// Command line overrides applied on top of the loaded configuration
#[derive(Debug, Parser)]
#[command(name = "rdio-server", version, about)]
struct Cli {
    /// Configuration file (defaults to `config.*` in the working directory)
    #[arg(short, long, env = "RDIO_CONFIG")]
    config: Option<PathBuf>,

    /// Address to bind
    #[arg(long)]
    host: Option<String>,

    /// Port to bind
    #[arg(short, long)]
    port: Option<u16>,

    /// Log level
    #[arg(long)]
    log_level: Option<String>,

    /// Keep everything in memory instead of PostgreSQL
    #[arg(long)]
    memory_store: bool,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    if let Err(e) = dotenvy::dotenv() {
        eprintln!("Note: .env file not loaded: {e}");
    }

    let cli = Cli::parse();
    let mut config = Config::load_from(cli.config.as_deref()).context("loading configuration")?;
    if let Some(host) = cli.host {
        config.server.host = host;
    }
    if let Some(port) = cli.port {
        config.server.port = port;
    }
    if let Some(level) = cli.log_level {
        config.logging.level = level;
    }

    init_logging(&config.logging).context("initializing logging")?;
    info!(
        "Starting rdio server v{} on {}:{}",
        env!("CARGO_PKG_VERSION"),
        config.server.host,
        config.server.port
    );

    let (store, database): (Arc<dyn Store>, Option<Database>) = if cli.memory_store {
        warn!("Using the in-memory store; nothing survives a restart");
        (Arc::new(MemoryStore::new()), None)
    } else {
        info!("Connecting to database...");
        let database = Database::new(&config)
            .await
            .context("database connection failed")?;
        database.migrate().await.context("migration failed")?;
        let store = database.store();
        store
            .health_check()
            .await
            .context("database health check failed")?;
        info!("Database ready");
        (Arc::new(store), Some(database))
    };

    let relay = HttpRelay::new(Duration::from_secs(config.relay.timeout))
        .context("building relay client")?;
    let converter: Arc<dyn AudioConverter> = if config.audio.conversion == ConversionMode::Disabled
    {
        Arc::new(Passthrough)
    } else {
        info!(ffmpeg = %config.audio.ffmpeg_path.display(), mode = ?config.audio.conversion, "Audio conversion enabled");
        Arc::new(FfmpegConverter::new(config.audio.ffmpeg_path.clone()))
    };

    let addr: SocketAddr = format!("{}:{}", config.server.host, config.server.port)
        .parse()
        .context("invalid server address")?;

    let controller = Controller::new(Arc::new(config), store, Arc::new(relay), converter);
    controller.start().await.context("starting controller")?;

    let app = build_router(Arc::new(AppState::new(Arc::clone(&controller))));
    let listener = TcpListener::bind(&addr)
        .await
        .with_context(|| format!("failed to bind to {addr}"))?;
    info!("Listening on http://{}", addr);

    let served = axum::serve(
        listener,
        app.into_make_service_with_connect_info::<SocketAddr>(),
    )
    .with_graceful_shutdown(shutdown_signal())
    .await;

    controller.stop();
    if let Some(database) = database {
        database.pool().close().await;
    }
    served.context("server error")?;

    info!("Server shutdown complete");
    Ok(())
}

/// Resolve on Ctrl+C or SIGTERM
async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            error!("Failed to listen for Ctrl+C: {}", e);
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut signal) => {
                signal.recv().await;
            }
            Err(e) => {
                error!("Failed to install SIGTERM handler: {}", e);
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        () = ctrl_c => info!("Received Ctrl+C, shutting down"),
        () = terminate => info!("Received terminate signal, shutting down"),
    }
}
