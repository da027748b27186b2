//! # voicebridge-backend
//!
//! Real-time speech-to-text streaming server. Clients connect over
//! WebSocket, stream f32 PCM audio at 16 kHz, and receive live partials
//! (`L:` prefix) and committed sentences (`T:` prefix) back as JSON text
//! frames.
//!
//! ## Process layout:
//! - actix HTTP server: WebSocket upgrades plus `/health` and `/metrics`
//! - recognition scheduler: tick loop + bounded decode worker pool
//! - session registry reaper and telemetry sampler in the background
//!
//! Exit codes: 0 normal, 1 model load failure, 2 bind failure.

mod audio;
mod config;
mod dispatch;
mod error;
mod health;
mod ingest;
mod middleware;
mod monitor;
mod postprocess;
mod scheduler;
mod speaker;
mod state;
mod transcription;
mod websocket;

use actix_web::{web, App, HttpServer};
use anyhow::Result;
use clap::Parser;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tracing::{error, info};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use audio::SessionRegistry;
use config::AppConfig;
use monitor::SystemMonitor;
use scheduler::Scheduler;
use speaker::{EnergyGateIdentifier, SpeakerIdentifier};
use state::AppState;
use transcription::{DecoderOptions, RecognitionEngine, WhisperDecoder};

/// Global shutdown flag flipped by the signal handlers.
static SHUTDOWN_SIGNAL: AtomicBool = AtomicBool::new(false);

/// Real-time speech-to-text streaming server.
#[derive(Parser, Debug)]
#[command(name = "voicebridge-backend", version, about)]
struct Cli {
    /// Listen port.
    #[arg(long)]
    port: Option<u16>,

    /// Bind address.
    #[arg(long)]
    host: Option<String>,

    /// Directory with the whisper model files.
    #[arg(long)]
    model: Option<PathBuf>,

    /// Maximum concurrent decodes (0 = auto).
    #[arg(long)]
    workers: Option<u8>,

    /// Compute device: auto, cpu, cuda or metal.
    #[arg(long)]
    device: Option<String>,
}

fn apply_cli(config: &mut AppConfig, cli: &Cli) {
    if let Some(port) = cli.port {
        config.server.port = port;
    }
    if let Some(host) = &cli.host {
        config.server.host = host.clone();
    }
    if let Some(model) = &cli.model {
        config.model.path = model.display().to_string();
    }
    if let Some(workers) = cli.workers {
        config.recognition.workers = workers as usize;
    }
    if let Some(device) = &cli.device {
        config.model.device = device.clone();
    }
}

#[actix_web::main]
async fn main() -> Result<()> {
    dotenv::dotenv().ok();
    init_tracing()?;

    let cli = Cli::parse();
    let mut config = AppConfig::load()?;
    apply_cli(&mut config, &cli);
    config.validate()?;

    info!(
        "Starting voicebridge-backend v{}",
        env!("CARGO_PKG_VERSION")
    );
    info!(
        host = %config.server.host,
        port = config.server.port,
        model = %config.model.path,
        workers = config.effective_workers(),
        "configuration loaded"
    );

    // The model must be usable before any client connects.
    let options = DecoderOptions {
        language: config.model.language.clone(),
        ..DecoderOptions::default()
    };
    let decoder =
        match WhisperDecoder::load(Path::new(&config.model.path), &config.model.device, options) {
            Ok(decoder) => Arc::new(decoder),
            Err(err) => {
                error!(error = %format!("{err:#}"), "model load failed");
                std::process::exit(1);
            }
        };
    let engine = Arc::new(RecognitionEngine::new(decoder, config.audio.sample_rate));

    let state = AppState::new(config.clone());
    let registry = Arc::new(SessionRegistry::new());
    let monitor = Arc::new(SystemMonitor::new());
    let speaker: Arc<dyn SpeakerIdentifier> = Arc::new(EnergyGateIdentifier::default());

    monitor.spawn_sampler(Duration::from_secs(2));
    registry.spawn_reaper(Duration::from_secs(config.recognition.reaper_interval_secs));

    let scheduler = Arc::new(Scheduler::new(
        state.clone(),
        Arc::clone(&registry),
        Arc::clone(&engine),
    ));
    scheduler.spawn();

    setup_signal_handlers();

    let bind_addr = format!("{}:{}", config.server.host, config.server.port);
    info!("Listening on {}", bind_addr);

    let app_state = state.clone();
    let app_registry = Arc::clone(&registry);
    let app_monitor = Arc::clone(&monitor);
    let app_engine = Arc::clone(&engine);
    let app_speaker = Arc::clone(&speaker);

    let server = HttpServer::new(move || {
        App::new()
            .app_data(web::Data::new(app_state.clone()))
            .app_data(web::Data::new(Arc::clone(&app_registry)))
            .app_data(web::Data::new(Arc::clone(&app_monitor)))
            .app_data(web::Data::new(Arc::clone(&app_engine)))
            .app_data(web::Data::new(Arc::clone(&app_speaker)))
            .wrap(middleware::RequestLogging)
            .wrap(middleware::MetricsMiddleware)
            .route("/health", web::get().to(health::health_check))
            .route("/metrics", web::get().to(health::detailed_metrics))
            .route("/sessions", web::get().to(health::list_sessions))
            .route("/sessions/{id}", web::get().to(health::session_detail))
            // Clients may upgrade at any path.
            .default_service(web::get().to(websocket::stream_endpoint))
    })
    .bind(&bind_addr);

    let server = match server {
        Ok(server) => server.run(),
        Err(err) => {
            error!(error = %err, addr = %bind_addr, "bind failed");
            std::process::exit(2);
        }
    };

    let server_handle = server.handle();
    let server_task = tokio::spawn(server);

    tokio::select! {
        result = server_task => {
            match result {
                Ok(Err(err)) => error!(error = %err, "server error"),
                Err(err) => error!(error = %err, "server task error"),
                _ => {}
            }
        }
        _ = wait_for_shutdown() => {
            info!("Shutdown signal received, stopping server...");
            server_handle.stop(true).await;
        }
    }

    info!("Server stopped");
    Ok(())
}

fn init_tracing() -> Result<()> {
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "voicebridge_backend=debug,actix_web=info".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();
    Ok(())
}

fn setup_signal_handlers() {
    tokio::spawn(async {
        let mut sigterm = tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate())
            .expect("Failed to install SIGTERM handler");
        let mut sigint = tokio::signal::unix::signal(tokio::signal::unix::SignalKind::interrupt())
            .expect("Failed to install SIGINT handler");

        tokio::select! {
            _ = sigterm.recv() => info!("Received SIGTERM"),
            _ = sigint.recv() => info!("Received SIGINT"),
        }

        SHUTDOWN_SIGNAL.store(true, Ordering::SeqCst);
    });
}

async fn wait_for_shutdown() {
    while !SHUTDOWN_SIGNAL.load(Ordering::SeqCst) {
        tokio::time::sleep(Duration::from_millis(100)).await;
    }
}
