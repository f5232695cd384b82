//! # Local Whisper Server - Main Application Entry Point
//!
//! Serves OpenAI-compatible speech-to-text from Whisper checkpoints that
//! run on this machine.
//!
//! ## Application Architecture:
//! - **config**: Defaults, `config.toml`, `APP_*` and `LOCAL_WHISPER_*` variables
//! - **state**: Shared handler state (config, model-name normalizer, transcriber)
//! - **handlers**: `POST /v1/audio/transcriptions`
//! - **health**: `GET /healthz`
//! - **transcription**: Model cache, compute-type fallback and the candle backend
//! - **audio**: Decoding, resampling, mel filters and voice activity detection
//! - **middleware**: Request logging
//! - **error**: HTTP error responses

mod audio;
mod config;
mod device;
mod error;
mod handlers;
mod health;
mod middleware;
mod state;
mod transcription;
mod upload;

use actix_cors::Cors;
use actix_web::{web, App, HttpServer};
use anyhow::{Context, Result};
use config::AppConfig;
use state::AppState;
use std::path::PathBuf;
use std::sync::Arc;
use tracing::{error, info, warn};
use tracing_actix_web::TracingLogger;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};
use transcription::{
    CandleLoader, DecodeOptions, HubOptions, ModelCache, ModelHub, Transcriber, WhisperRunner,
};

/// ## What this function does:
/// 1. **Loads configuration** from files and environment variables
/// 2. **Sets up logging**
/// 3. **Builds the transcription stack** (hub → loader → cache → runner)
/// 4. **Optionally preloads** the default model in the background
/// 5. **Runs the HTTP server** until SIGINT/SIGTERM
#[actix_web::main]
async fn main() -> Result<()> {
    // It's fine if there's no .env file
    dotenv::dotenv().ok();

    init_tracing()?;

    let config = AppConfig::load()?;
    config.validate()?;

    info!("Starting local-whisper-server v{}", env!("CARGO_PKG_VERSION"));
    info!(
        host = %config.server.host,
        port = config.server.port,
        default_model = %config.whisper.default_model,
        device = %config.whisper.device,
        compute_type = %config.whisper.compute_type,
        beam_size = config.whisper.beam_size,
        vad_filter = config.whisper.vad_filter,
        "Configuration loaded"
    );

    let transcriber = build_transcriber(&config);
    let app_state = AppState::new(config.clone(), transcriber);

    if config.whisper.preload {
        spawn_preload(&app_state);
    }

    let bind_addr = format!("{}:{}", config.server.host, config.server.port);
    info!("Starting HTTP server on {}", bind_addr);

    let server = HttpServer::new(move || {
        let cors = Cors::default()
            .allow_any_origin()
            .allow_any_method()
            .allow_any_header()
            .max_age(3600);

        App::new()
            .app_data(web::Data::new(app_state.clone()))
            .wrap(cors)
            .wrap(TracingLogger::default())
            .wrap(middleware::RequestLogging)
            .route(
                "/v1/audio/transcriptions",
                web::post().to(handlers::create_transcription),
            )
            .route("/healthz", web::get().to(health::health_check))
    })
    .bind(&bind_addr)
    .with_context(|| format!("failed to bind {}", bind_addr))?
    .run();

    let server_handle = server.handle();
    let server_task = tokio::spawn(server);

    // Whichever finishes first: the server (usually an error) or a signal
    tokio::select! {
        result = server_task => {
            match result {
                Ok(Err(e)) => error!("Server error: {}", e),
                Err(e) => error!("Server task error: {}", e),
                Ok(Ok(())) => {}
            }
        }
        _ = wait_for_shutdown() => {
            info!("Shutdown signal received, stopping server...");
            server_handle.stop(true).await;
        }
    }

    info!("Server stopped gracefully");
    Ok(())
}

/// ## Environment Variables:
/// - `RUST_LOG`: Controls what gets logged (e.g., "debug", "local_whisper_server=debug")
/// - If not set, defaults to "local_whisper_server=info,actix_web=info"
fn init_tracing() -> Result<()> {
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "local_whisper_server=info,actix_web=info".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .try_init()
        .context("failed to initialise logging")?;

    Ok(())
}

/// Wire the candle backend behind the `Transcriber` seam.
fn build_transcriber(config: &AppConfig) -> Arc<dyn Transcriber> {
    let hub = ModelHub::new(HubOptions {
        cache_dir: config.whisper.cache_dir.as_ref().map(PathBuf::from),
        allow_download: config.whisper.allow_download,
        token: std::env::var("HF_TOKEN").ok().filter(|t| !t.is_empty()),
    });
    info!(cache_dir = %hub.cache_dir().display(), "Using model cache");

    let cache = ModelCache::new(
        CandleLoader::new(hub),
        config.whisper.device.clone(),
        config.whisper.compute_type.clone(),
    );
    let runner = WhisperRunner::new(
        cache,
        DecodeOptions {
            beam_size: config.whisper.beam_size,
            vad_filter: config.whisper.vad_filter,
        },
    );

    Arc::new(runner)
}

/// Load the default model off the async workers; requests are served meanwhile.
fn spawn_preload(state: &AppState) {
    let transcriber = Arc::clone(&state.transcriber);
    let model = state.normalizer.normalize(None);

    tokio::task::spawn_blocking(move || {
        info!(model = %model, "Preloading Whisper model");
        match transcriber.preload(&model) {
            Ok(()) => info!(model = %model, "Preloaded Whisper model"),
            Err(e) => warn!(model = %model, error = %e, "Preloading Whisper model failed"),
        }
    });
}

/// Resolves on SIGINT (Ctrl+C) or, on Unix, SIGTERM.
async fn wait_for_shutdown() {
    let ctrl_c = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            error!("Failed to listen for SIGINT: {}", e);
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut sigterm) => {
                sigterm.recv().await;
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
        _ = ctrl_c => info!("Received SIGINT"),
        _ = terminate => info!("Received SIGTERM"),
    }
}
