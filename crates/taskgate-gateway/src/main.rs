//! # taskgate-gateway
//!
//! Taskgate server binary — wires settings, the bus connection pool, and
//! the HTTP surface together and runs until interrupted.

#![deny(unsafe_code)]

use std::path::PathBuf;
use std::sync::Arc;
use std::time::{Duration, Instant};

use anyhow::{Context, Result};
use clap::Parser;
use tracing_subscriber::EnvFilter;

use taskgate_bus::MemoryBackend;
use taskgate_bus::pool::ConnectionPool;
use taskgate_core::{KeySpace, TaskIdRules};
use taskgate_server::routes::AppState;
use taskgate_server::{GatewayContext, router};
use taskgate_settings::GatewaySettings;

/// Taskgate gateway server.
#[derive(Parser, Debug)]
#[command(name = "taskgate", about = "Task result gateway server")]
struct Cli {
    /// Host to bind (overrides settings if specified).
    #[arg(long)]
    host: Option<String>,

    /// Port to bind (overrides settings if specified).
    #[arg(long)]
    port: Option<u16>,

    /// Path to the settings file.
    #[arg(long)]
    settings: Option<PathBuf>,
}

fn init_logging(settings: &GatewaySettings) {
    let filter = EnvFilter::try_from_default_env()
        .or_else(|_| EnvFilter::try_new(&settings.logging.level))
        .unwrap_or_else(|_| EnvFilter::new("info"));
    tracing_subscriber::fmt().with_env_filter(filter).init();
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Cli::parse();

    let settings_path = args
        .settings
        .unwrap_or_else(taskgate_settings::loader::settings_path);
    let settings =
        taskgate_settings::load_settings_from_path(&settings_path).unwrap_or_default();
    init_logging(&settings);

    let rules = TaskIdRules::new(
        &settings.query.task_id_pattern,
        settings.query.max_task_id_length,
    )
    .context("invalid task id pattern in settings")?;
    let keyspace = KeySpace::new(settings.bus.key_prefix.clone());

    let prometheus = taskgate_server::metrics::install_recorder();

    // Embedded in-process backend: the store and bus live inside the
    // gateway process. External producers reach it through the same
    // process; a networked backend plugs in behind the same traits.
    let backend = Arc::new(MemoryBackend::new());
    let pool = Arc::new(ConnectionPool::new(
        backend.clone(),
        settings.bus.max_channels,
        Duration::from_secs(settings.bus.ping_interval_secs),
    ));

    let ctx = Arc::new(GatewayContext::new(
        backend.clone(),
        backend,
        pool,
        keyspace,
        rules,
        Duration::from_millis(settings.query.keepalive_interval_ms),
    ));

    let state = AppState {
        ctx,
        start_time: Instant::now(),
        prometheus: Some(prometheus),
    };
    let app = router(state);

    let host = args.host.unwrap_or(settings.server.host);
    let port = args.port.unwrap_or(settings.server.port);
    let listener = tokio::net::TcpListener::bind((host.as_str(), port))
        .await
        .with_context(|| format!("failed to bind {host}:{port}"))?;
    let addr = listener.local_addr().context("no local address")?;
    tracing::info!(
        max_channels = settings.bus.max_channels,
        keepalive_ms = settings.query.keepalive_interval_ms,
        "taskgate listening on http://{addr}"
    );

    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await
        .context("server error")?;

    tracing::info!("shutdown complete");
    Ok(())
}

async fn shutdown_signal() {
    if let Err(e) = tokio::signal::ctrl_c().await {
        tracing::error!(error = %e, "failed to listen for ctrl-c");
        return;
    }
    tracing::info!("shutting down...");
}
