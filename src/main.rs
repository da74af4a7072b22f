//! # tabtrail
//!
//! Local daemon that gives browser tabs and windows stable identities and
//! serves the trail over HTTP to the extension.

#![deny(unsafe_code)]

use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{Context, Result};
use clap::Parser;
use trail_engine::settings::{data_dir as default_data_dir, load_settings_from_path};
use trail_engine::Trail;
use trail_server::shutdown::DEFAULT_GRACE;
use trail_server::{HandlerState, ServerConfig, ShutdownCoordinator};
use trail_telemetry::{init_telemetry, TelemetryConfig};

/// Tab and window identity tracker.
#[derive(Parser, Debug)]
#[command(name = "tabtrail", about = "Tab and window identity tracker")]
struct Cli {
    /// Data directory holding settings, database and working state.
    #[arg(long)]
    data_dir: Option<PathBuf>,

    /// Host to bind (overrides settings).
    #[arg(long)]
    host: Option<String>,

    /// Port to bind, 0 for auto-assign (overrides settings).
    #[arg(long)]
    port: Option<u16>,

    /// Default log level.
    #[arg(long, default_value = "info")]
    log_level: String,

    /// Human-readable logs instead of JSON lines.
    #[arg(long)]
    pretty: bool,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    let log_level: tracing::Level = cli
        .log_level
        .parse()
        .with_context(|| format!("invalid log level: {}", cli.log_level))?;
    let telemetry = Arc::new(init_telemetry(TelemetryConfig {
        log_level,
        json: !cli.pretty,
        ..Default::default()
    }));

    let data_dir = cli.data_dir.clone().unwrap_or_else(default_data_dir);
    std::fs::create_dir_all(&data_dir)
        .with_context(|| format!("Failed to create data directory: {}", data_dir.display()))?;

    let settings = load_settings_from_path(&data_dir.join("settings.json")).context("Failed to load settings")?;
    let config = ServerConfig {
        host: cli.host.unwrap_or_else(|| settings.server.host.clone()),
        port: cli.port.unwrap_or(settings.server.port),
    };

    let trail = Arc::new(Trail::start(settings, &data_dir).await.context("Failed to open trail store")?);

    let mut coordinator = ShutdownCoordinator::new();
    let scheduler = trail.spawn_scheduler(coordinator.token());

    let state = Arc::new(HandlerState::with_telemetry(Arc::clone(&trail), Arc::clone(&telemetry)));
    let handle = trail_server::start(config, state, coordinator.token())
        .await
        .context("Failed to start server")?;
    tracing::info!(port = handle.port, data_dir = %data_dir.display(), "tabtrail ready");
    coordinator.register("server", handle.into_task());

    tokio::signal::ctrl_c().await.context("Failed to listen for ctrl+c")?;
    tracing::info!("shutting down");

    let aborted = coordinator.stop(DEFAULT_GRACE).await;
    if !aborted.is_empty() {
        tracing::warn!(tasks = ?aborted, "tasks aborted during shutdown");
    }
    scheduler.shutdown().await;
    if let Err(e) = trail.settle().await {
        tracing::warn!(error = %e, "pending writes could not be flushed");
    }
    Ok(())
}
