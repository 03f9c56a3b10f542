//! WHIP Ingest Gateway Binary
//!
//! ```bash
//! # Stream the first publisher to stdout
//! ingest-whip --port 8080 > out.ts
//!
//! # Record every session to ./recordings/<session-id>.ts
//! ingest-whip --config whip.toml --output-dir ./recordings
//! ```

use anyhow::{Context, Result};
use clap::Parser;
use std::path::PathBuf;
use std::sync::Arc;
use tokio::net::TcpListener;
use tokio::signal;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

use whip_mpegts_ffmpeg::{FfmpegDemux, FfmpegMux, LogLevel};
use whip_mpegts_server::{
    api::{build_router, AppState},
    config::{Config, OutputMode},
    consumer,
    peer::WebRtcPeerFactory,
    session::SessionManager,
};

/// WHIP to MPEG-TS ingest gateway
#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
struct Args {
    /// TOML configuration file
    #[arg(short, long, env = "WHIP_CONFIG")]
    config: Option<PathBuf>,

    /// HTTP port, overrides the configuration
    #[arg(short, long)]
    port: Option<u16>,

    /// Record sessions into this directory instead of stdout
    #[arg(long)]
    output_dir: Option<PathBuf>,

    /// Emit logs as JSON
    #[arg(long, default_value_t = false, env = "WHIP_LOG_JSON")]
    log_json: bool,

    /// libav log level (quiet, error, warning, info, verbose, debug)
    #[arg(long, default_value = "error", env = "WHIP_FFMPEG_LOG")]
    ffmpeg_log: LogLevel,
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();
    init_tracing(args.log_json);

    tracing::info!(version = env!("CARGO_PKG_VERSION"), "Starting WHIP Ingest Gateway...");

    let mut config = Config::load(args.config.as_ref()).context("loading configuration")?;
    if let Some(port) = args.port {
        config.server.http_port = port;
    }
    if let Some(dir) = args.output_dir {
        config.output.mode = OutputMode::Directory;
        config.output.directory = dir;
    }
    config.validate()?;
    let config = Arc::new(config);

    tracing::info!(
        http_port = config.server.http_port,
        max_sessions = config.limits.max_sessions,
        output = ?config.output.mode,
        "Configuration loaded"
    );

    whip_mpegts_ffmpeg::set_log_level(args.ffmpeg_log);
    whip_mpegts_ffmpeg::init()?;

    let peer_factory = Arc::new(WebRtcPeerFactory::new(
        config.webrtc.clone(),
        config.pipeline.track_queue_capacity,
    ));
    let session_manager = Arc::new(SessionManager::new(
        &config,
        peer_factory,
        Arc::new(FfmpegDemux::default()),
        Arc::new(FfmpegMux::mpegts()),
        consumer::from_config(&config.output),
    ));

    let router = build_router(AppState::new(session_manager.clone(), config.clone()));

    let bind_addr = format!("{}:{}", config.server.host, config.server.http_port);
    let listener = TcpListener::bind(&bind_addr)
        .await
        .with_context(|| format!("binding {}", bind_addr))?;
    tracing::info!("WHIP endpoint listening on {}", bind_addr);

    axum::serve(listener, router)
        .with_graceful_shutdown(async {
            shutdown_signal().await;
            tracing::info!("Shutdown signal received, initiating graceful shutdown...");
        })
        .await?;

    session_manager.shutdown().await;

    tracing::info!("WHIP Ingest Gateway shutdown complete");
    Ok(())
}

fn init_tracing(json: bool) {
    let env_filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new("info,tower_http=debug"));

    // Logs go to stderr; stdout may carry the transport stream
    let registry = tracing_subscriber::registry().with(env_filter);
    if json {
        registry
            .with(tracing_subscriber::fmt::layer().json().with_writer(std::io::stderr))
            .init();
    } else {
        registry
            .with(tracing_subscriber::fmt::layer().with_writer(std::io::stderr))
            .init();
    }
}

/// Wait for shutdown signal (SIGTERM or SIGINT)
async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = signal::ctrl_c().await {
            tracing::error!("Failed to listen for Ctrl+C: {}", e);
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match signal::unix::signal(signal::unix::SignalKind::terminate()) {
            Ok(mut sigterm) => {
                sigterm.recv().await;
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
        _ = ctrl_c => {},
        _ = terminate => {},
    }
}
