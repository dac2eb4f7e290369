//! timeshift-server - Time-Shifted HLS Radio Relay
//!
//! Ingests a live HLS audio stream into a rolling disk buffer and serves it
//! back at a configurable delay behind live.

mod api;

use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use clap::Parser;
use timeshift_engine::{TimeShiftConfig, TimeShiftPipeline};
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

const SHUTDOWN_DEADLINE: Duration = Duration::from_secs(10);

#[derive(Debug, Parser)]
#[command(name = "timeshift-server", version, about)]
struct Args {
    /// Upstream HLS playlist URL (master or media).
    #[arg(long, env = "UPSTREAM_URL")]
    upstream_url: String,

    /// Playback delay behind live, in milliseconds.
    #[arg(long, env = "DELAY_MS", default_value_t = 8 * 3600 * 1000)]
    delay_ms: u64,

    /// Rolling buffer retention, in milliseconds. Must exceed the delay.
    #[arg(long, env = "BUFFER_DURATION_MS", default_value_t = 8 * 3600 * 1000 + 1_800_000)]
    buffer_duration_ms: u64,

    /// Upstream playlist poll interval, in milliseconds.
    #[arg(long, env = "MONITOR_INTERVAL_MS", default_value_t = 10_000)]
    monitor_interval_ms: u64,

    /// Concurrent segment download cap.
    #[arg(long, env = "MAX_CONCURRENT_DOWNLOADS", default_value_t = 3)]
    max_concurrent_downloads: usize,

    /// Retries per segment download.
    #[arg(long, env = "MAX_RETRIES", default_value_t = 3)]
    max_retries: u32,

    /// Root directory for the segment buffer and manifest.
    #[arg(long, env = "STORAGE_BASE_DIR", default_value = "data")]
    storage_base_dir: PathBuf,

    /// Keep segment bytes on disk (memory-only when false).
    #[arg(long, env = "USE_DISK_STORAGE", default_value_t = true, action = clap::ArgAction::Set)]
    use_disk_storage: bool,

    /// HTTP listen port.
    #[arg(long, env = "PORT", default_value_t = 8080)]
    port: u16,

    /// HTTP bind address.
    #[arg(long, env = "BIND_ADDRESS", default_value = "0.0.0.0")]
    bind_address: String,

    /// Public URL prefix for segment references in generated playlists.
    /// Empty for relative references.
    #[arg(long, env = "PUBLIC_BASE_URL", default_value = "")]
    public_base_url: String,
}

impl Args {
    fn into_config(self) -> TimeShiftConfig {
        let mut config = TimeShiftConfig {
            upstream_url: self.upstream_url,
            delay: Duration::from_millis(self.delay_ms),
            ..Default::default()
        };
        config.cache.buffer_duration = Duration::from_millis(self.buffer_duration_ms);
        config.monitor.interval = Duration::from_millis(self.monitor_interval_ms);
        config.downloader.max_concurrent = self.max_concurrent_downloads;
        config.downloader.max_retries = self.max_retries;
        config.storage.base_dir = self.storage_base_dir;
        config.storage.use_disk = self.use_disk_storage;
        config.generator.base_url = self.public_base_url;
        config
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    dotenvy::dotenv().ok();

    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    let args = Args::parse();
    let bind_address = args.bind_address.clone();
    let port = args.port;

    info!("Starting timeshift-server v{}", env!("CARGO_PKG_VERSION"));

    let config = args.into_config();
    let pipeline = Arc::new(TimeShiftPipeline::init(config).await?);

    let recovery = pipeline.recovery();
    if recovery.restored + recovery.adopted > 0 {
        info!(
            restored = recovery.restored,
            adopted = recovery.adopted,
            "Resumed buffer from previous run"
        );
    }

    pipeline.start(true).await?;

    let addr: SocketAddr = format!("{bind_address}:{port}").parse()?;
    let listener = tokio::net::TcpListener::bind(addr).await?;
    info!("Listening on http://{addr}");

    let router = api::create_router(pipeline.clone());
    axum::serve(listener, router)
        .with_graceful_shutdown(shutdown_signal())
        .await?;

    info!("Shutting down; draining downloads...");
    if !pipeline.stop(SHUTDOWN_DEADLINE).await {
        warn!("Pipeline was not running at shutdown");
    }
    info!("Shutdown complete");
    Ok(())
}

/// Resolve on SIGINT or SIGTERM.
async fn shutdown_signal() {
    tokio::select! {
        _ = tokio::signal::ctrl_c() => {
            info!("Received SIGINT, initiating shutdown");
        }
        _ = wait_for_sigterm() => {
            info!("Received SIGTERM, initiating shutdown");
        }
    }
}

#[cfg(unix)]
async fn wait_for_sigterm() {
    use tokio::signal::unix::{SignalKind, signal};
    let mut sigterm = signal(SignalKind::terminate()).expect("Failed to register SIGTERM handler");
    sigterm.recv().await;
}

#[cfg(not(unix))]
async fn wait_for_sigterm() {
    std::future::pending::<()>().await;
}
