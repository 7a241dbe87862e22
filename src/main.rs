//! Voice Stream - an HTTP text-to-speech server.
//!
//! Loads every voice model in a directory at startup, synthesizes requested text with
//! sherpa-onnx, and streams it to the client as ADTS AAC produced by a per-request
//! ffmpeg process.

mod audio;
mod config;
mod error;
mod server;
mod transcode;
mod tts;

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use tokio::net::TcpListener;
use tokio::signal;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};
use tracing_subscriber::EnvFilter;
use tracing_subscriber::fmt::time::LocalTime;

use config::ServerConfig;
use server::{AppState, RateLimiter};
use transcode::{SessionOptions, Transcoder, TranscoderCommand};
use tts::{EngineResources, InvokerOptions, ModelRegistry, SherpaEngine, SpeechEngine};

/// Wait for shutdown signal (Ctrl+C or SIGTERM), then cancel every running session.
async fn wait_for_shutdown(shutdown: CancellationToken) {
    let terminate = async {
        #[cfg(unix)]
        match signal::unix::signal(signal::unix::SignalKind::terminate()) {
            Ok(mut sigterm) => {
                sigterm.recv().await;
            }
            Err(e) => {
                warn!("Failed to register SIGTERM handler: {}", e);
                std::future::pending::<()>().await;
            }
        }
        #[cfg(not(unix))]
        std::future::pending::<()>().await;
    };

    tokio::select! {
        _ = signal::ctrl_c() => {
            info!("🛑 Received Ctrl+C, shutting down...");
        }
        _ = terminate => {
            info!("🛑 Received SIGTERM, shutting down...");
        }
    }

    shutdown.cancel();
}

#[tokio::main]
async fn main() -> Result<()> {
    // Parse command line arguments
    let config = ServerConfig::from_args();

    // Respect RUST_LOG env var, fallback to verbose flag, default to info
    let filter = EnvFilter::try_from_default_env()
        .or_else(|_| EnvFilter::try_new(if config.verbose { "debug" } else { "info" }))
        .context("Invalid log filter")?;

    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .with_timer(LocalTime::new(time::macros::format_description!("[hour]:[minute]:[second]")))
        .init();

    info!("🎙️ Voice Stream v{}", env!("CARGO_PKG_VERSION"));

    if let Err(e) = config.validate() {
        error!("❌ Configuration error: {:#}", e);
        std::process::exit(1);
    }
    config.log_config();

    // Load every voice once; the registry is immutable afterwards
    let resources = EngineResources::from_config(&config);
    let registry = ModelRegistry::initialize(&config.model_dir, |path| {
        let engine: Box<dyn SpeechEngine> = Box::new(SherpaEngine::load(path, &resources)?);
        Ok(engine)
    })
    .with_context(|| format!("Failed to load voice models from {}", config.model_dir.display()))?;

    if registry.is_empty() {
        warn!("⚠️ No voice models loaded from {}", config.model_dir.display());
    } else {
        info!("✅ Loaded {} voice(s): {}", registry.len(), registry.names().join(", "));
    }

    let session_options = SessionOptions { output_capacity: config.channel_capacity, timeout: config.request_timeout(), ..Default::default() };
    let transcoder = Transcoder::new(TranscoderCommand::ffmpeg(&config.ffmpeg, &config.aac_bitrate), session_options);
    match transcoder.preflight() {
        Ok(path) => info!("🎚️ Transcoder: {}", path.display()),
        Err(e) => warn!("⚠️ {}; synthesis requests will fail until it is installed", e),
    }

    let invoker = InvokerOptions { chunk_frames: config.chunk_frames, channel_capacity: config.channel_capacity };
    let limiter = Arc::new(RateLimiter::new(Duration::from_secs(config.rate_limit_window_secs), config.rate_limit_max_requests));

    let shutdown = CancellationToken::new();
    tokio::spawn(limiter.clone().run_pruner(shutdown.clone()));

    let state = AppState::new(registry, transcoder, limiter, invoker, shutdown.clone());
    let app = server::create_router(state);

    let addr = config.bind_addr()?;
    let listener = TcpListener::bind(addr).await.with_context(|| format!("Failed to bind {}", addr))?;
    info!("🚀 Listening on http://{}", addr);

    axum::serve(listener, app.into_make_service_with_connect_info::<SocketAddr>())
        .with_graceful_shutdown(wait_for_shutdown(shutdown))
        .await
        .context("Server error")?;

    info!("✅ Voice Stream stopped");
    Ok(())
}
