//! # Voice Relay Backend - Main Application Entry Point
//!
//! This is the main entry point for the voice-relay-backend web server.
//! It sets up an Actix-web HTTP server with the following key features:
//!
//! ## Key Rust Concepts Used:
//! - **async/await**: The entire application is asynchronous; every session is a task
//! - **library + binary**: All components live in the `voice_relay_backend` library;
//!   this file only wires them together
//! - **Result<T, E>**: Error handling using Rust's Result type
//! - **static**: Global variables that live for the entire program duration
//!
//! ## Routes:
//! - `GET /ws`: WebSocket upgrade into one voice session
//! - `GET /health`, `GET /api/v1/health`: liveness, uptime, sessions, provider keys
//! - `GET /api/v1/metrics`: relay counters
//! - `GET|PUT /api/v1/config`: runtime configuration (keys redacted)

use actix_cors::Cors;  // Cross-Origin Resource Sharing support
use actix_web::{web, App, HttpServer};  // Web framework
use anyhow::Result;    // Better error handling with context
use std::sync::atomic::{AtomicBool, Ordering};  // Thread-safe boolean for shutdown
use tracing::{error, info, warn};  // Structured logging
use tracing_actix_web::TracingLogger;  // Per-request spans
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};  // Logging setup

use voice_relay_backend::config::AppConfig;
use voice_relay_backend::providers::Providers;
use voice_relay_backend::state::AppState;
use voice_relay_backend::{handlers, health, websocket};

/// Global shutdown signal, set by the signal handler task.
static SHUTDOWN_SIGNAL: AtomicBool = AtomicBool::new(false);

/// The main application entry point.
///
/// ## What this function does:
/// 1. **Loads configuration** from files and environment variables
/// 2. **Sets up logging** for debugging and monitoring
/// 3. **Builds the provider clients** shared by every session
/// 4. **Configures the HTTP server** with middleware and routes
/// 5. **Handles graceful shutdown** when receiving system signals
///
/// ## Error Handling:
/// If any step fails (config loading, server binding, etc.), the function returns an error
/// and the program exits with an error message.
#[actix_web::main]
async fn main() -> Result<()> {
    // .ok() means "ignore errors" - it's fine if there's no .env file
    dotenv::dotenv().ok();

    init_tracing()?;

    let config = AppConfig::load()?;
    config.validate()?;

    info!("Starting voice-relay-backend v{}", env!("CARGO_PKG_VERSION"));
    info!("Configuration loaded: {}:{}", config.server.host, config.server.port);

    // Missing keys are not fatal: sessions report the failing provider on `start`
    for (name, key) in [
        ("GLADIA_API_KEY", &config.providers.stt.api_key),
        ("VENICE_API_KEY", &config.providers.llm.api_key),
        ("CARTESIA_API_KEY", &config.providers.tts.api_key),
    ] {
        if key.is_empty() {
            warn!("{} is not set", name);
        }
    }

    let providers = Providers::from_config(&config);
    info!(
        stt = providers.stt.name(),
        llm = providers.llm.name(),
        tts = providers.tts.name(),
        "Provider clients ready"
    );

    let app_state = AppState::new(config.clone(), providers);
    let bind_addr = format!("{}:{}", config.server.host, config.server.port);

    setup_signal_handlers();

    info!("Starting HTTP server on {}", bind_addr);
    info!("WebSocket endpoint: ws://{}/ws", bind_addr);

    let server = HttpServer::new(move || {
        // Browser clients connect from another origin
        let cors = Cors::default()
            .allow_any_origin()
            .allow_any_method()
            .allow_any_header()
            .max_age(3600);

        App::new()
            .app_data(web::Data::new(app_state.clone()))
            .wrap(cors)
            .wrap(TracingLogger::default())
            .route("/ws", web::get().to(websocket::voice_websocket))
            .service(
                web::scope("/api/v1")
                    .route("/health", web::get().to(health::health_check))
                    .route("/metrics", web::get().to(health::detailed_metrics))
                    .route("/config", web::get().to(handlers::get_config))
                    .route("/config", web::put().to(handlers::update_config)),
            )
            .route("/health", web::get().to(health::health_check))
    })
    .bind(&bind_addr)?
    .run();

    let server_handle = server.handle();
    let server_task = tokio::spawn(server);

    tokio::select! {
        result = server_task => {
            match result {
                Ok(server_result) => {
                    if let Err(e) = server_result {
                        error!("Server error: {}", e);
                    }
                }
                Err(e) => {
                    error!("Server task error: {}", e);
                }
            }
        }
        _ = wait_for_shutdown() => {
            info!("Shutdown signal received, stopping server...");
            // Stopping the workers stops every WebSocket actor, which closes its session
            server_handle.stop(true).await;
        }
    }

    info!("Server stopped gracefully");
    Ok(())
}

/// Initialize the tracing (logging) system.
///
/// ## Environment Variables:
/// - `RUST_LOG`: Controls what gets logged (e.g., "debug", "voice_relay_backend=trace")
/// - If not set, defaults to "voice_relay_backend=debug,actix_web=info"
fn init_tracing() -> Result<()> {
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "voice_relay_backend=debug,actix_web=info".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    Ok(())
}

/// Listen for SIGTERM and SIGINT and raise the shutdown flag.
#[cfg(unix)]
fn setup_signal_handlers() {
    use tokio::signal::unix::{signal, SignalKind};

    tokio::spawn(async {
        let (mut sigterm, mut sigint) = match (signal(SignalKind::terminate()), signal(SignalKind::interrupt())) {
            (Ok(sigterm), Ok(sigint)) => (sigterm, sigint),
            (Err(e), _) | (_, Err(e)) => {
                error!("Failed to install signal handlers: {}", e);
                return;
            }
        };

        tokio::select! {
            _ = sigterm.recv() => {
                info!("Received SIGTERM");
            }
            _ = sigint.recv() => {
                info!("Received SIGINT");
            }
        }

        SHUTDOWN_SIGNAL.store(true, Ordering::SeqCst);
    });
}

#[cfg(not(unix))]
fn setup_signal_handlers() {
    tokio::spawn(async {
        if tokio::signal::ctrl_c().await.is_ok() {
            info!("Received Ctrl+C");
            SHUTDOWN_SIGNAL.store(true, Ordering::SeqCst);
        }
    });
}

/// Wait for the shutdown signal to be set.
///
/// Polls every 100ms; the flag is only written once.
async fn wait_for_shutdown() {
    while !SHUTDOWN_SIGNAL.load(Ordering::SeqCst) {
        tokio::time::sleep(tokio::time::Duration::from_millis(100)).await;
    }
}
