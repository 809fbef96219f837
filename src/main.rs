//! # Call Relay Backend - Main Application Entry Point
//!
//! Bridges phone calls to a generative-audio service. The telephony provider
//! fetches TwiML from `/incoming-call`, then streams the call's audio over the
//! `/media-stream` WebSocket; every such connection is relayed to its own
//! outbound WebSocket towards the audio peer.
//!
//! ## Application Architecture:
//! - **config**: layered configuration (defaults, `config.toml`, environment)
//! - **state**: shared configuration and metrics
//! - **audio**: μ-law codec, resampling and the transcoding pipeline
//! - **protocol**: typed frames of both WebSocket protocols
//! - **relay**: per-call state machine and the audio peer link
//! - **websocket**: the per-call actor wiring sockets to the state machine
//! - **handlers**, **health**, **middleware**: the HTTP control plane
//! - **error**: HTTP and relay error types

mod audio;
mod config;
mod error;
mod handlers;
mod health;
mod middleware;
mod protocol;
mod relay;
mod state;
mod websocket;

use actix_web::{middleware::Logger, web, App, HttpServer};
use anyhow::Result;
use crate::config::AppConfig;
use crate::state::AppState;
use std::sync::atomic::{AtomicBool, Ordering};
use tracing::{error, info, warn};
use tracing_actix_web::TracingLogger;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

/// Set once SIGTERM or SIGINT has been received.
static SHUTDOWN_SIGNAL: AtomicBool = AtomicBool::new(false);

#[actix_web::main]
async fn main() -> Result<()> {
    // A missing .env file is fine
    dotenv::dotenv().ok();

    init_tracing()?;

    let config = AppConfig::load()?;
    config.validate()?;

    info!("Starting call-relay-backend v{}", env!("CARGO_PKG_VERSION"));
    info!(
        host = %config.server.host,
        port = config.server.port,
        model = %config.audio_peer.model,
        max_sessions = config.performance.max_concurrent_sessions,
        "Configuration loaded"
    );
    if config.audio_peer.api_key.is_empty() {
        warn!("No audio peer API key configured (APP_AUDIO_PEER__API_KEY), connections may be refused");
    }

    let app_state = AppState::new(config.clone());
    let bind_addr = format!("{}:{}", config.server.host, config.server.port);

    setup_signal_handlers();

    info!("Starting HTTP server on {}", bind_addr);

    let server = HttpServer::new(move || {
        App::new()
            .app_data(web::Data::new(app_state.clone()))
            .wrap(Logger::default())
            .wrap(middleware::MetricsMiddleware)
            .wrap(TracingLogger::default())
            .service(
                web::scope("/api/v1")
                    .route("/health", web::get().to(health::health_check))
                    .route("/metrics", web::get().to(health::detailed_metrics))
                    .route("/config", web::get().to(handlers::get_config))
                    .route("/config", web::put().to(handlers::update_config)),
            )
            .route("/incoming-call", web::post().to(handlers::incoming_call))
            .route("/incoming-call", web::get().to(handlers::incoming_call))
            .route("/media-stream", web::get().to(websocket::media_stream))
            .route("/health", web::get().to(health::health_check))
    })
    .bind(&bind_addr)?
    .run();

    let server_handle = server.handle();
    let server_task = tokio::spawn(server);

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
            // Graceful: in-flight calls get the server's shutdown timeout to finish
            server_handle.stop(true).await;
        }
    }

    info!("Server stopped gracefully");
    Ok(())
}

/// Console logging filtered by `RUST_LOG`, defaulting to
/// `call_relay_backend=debug,actix_web=info`.
fn init_tracing() -> Result<()> {
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "call_relay_backend=debug,actix_web=info".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .try_init()?;

    Ok(())
}

/// Raise [`SHUTDOWN_SIGNAL`] on SIGTERM or SIGINT.
fn setup_signal_handlers() {
    use tokio::signal::unix::{signal, SignalKind};

    tokio::spawn(async {
        let (mut sigterm, mut sigint) = match (signal(SignalKind::terminate()), signal(SignalKind::interrupt())) {
            (Ok(term), Ok(int)) => (term, int),
            (Err(e), _) | (_, Err(e)) => {
                error!("Failed to install signal handlers: {}", e);
                return;
            }
        };

        tokio::select! {
            _ = sigterm.recv() => info!("Received SIGTERM"),
            _ = sigint.recv() => info!("Received SIGINT"),
        }

        SHUTDOWN_SIGNAL.store(true, Ordering::SeqCst);
    });
}

/// Resolve once [`SHUTDOWN_SIGNAL`] is raised.
async fn wait_for_shutdown() {
    while !SHUTDOWN_SIGNAL.load(Ordering::SeqCst) {
        tokio::time::sleep(tokio::time::Duration::from_millis(100)).await;
    }
}
