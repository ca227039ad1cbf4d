//! # Voice Counsel Backend - Main Application Entry Point
//!
//! This is the main entry point for the voice-counsel-backend web server.
//! It sets up an Actix-web HTTP server that hosts real-time voice counseling
//! sessions over WebSocket, plus a few monitoring endpoints.
//!
//! ## Key Rust Concepts Used:
//! - **async/await**: The entire application is asynchronous for better performance
//! - **modules**: Code is organized into separate modules (mod statements)
//! - **Result<T, E>**: Error handling using Rust's Result type
//! - **Arc**: Shared ownership of the session registry and collaborators
//! - **static**: Global variables that live for the entire program duration
//!
//! ## Application Architecture:
//! - **config**: Handles application configuration (TOML files + environment variables)
//! - **state**: Shared application state and session counters
//! - **voice**: Session state machine, utterance pipeline, safety gate, registry
//! - **providers**: STT, TTS, LLM, risk classifier, alert and affect collaborators
//! - **agents**: Counselor personas (prompts, voices, greetings)
//! - **audio**: Utterance buffering and audio format handling
//! - **websocket**: The `/ws/voice` endpoint
//! - **health**: Health, metrics and session snapshot endpoints
//! - **error**: Custom error types and HTTP error responses

// Module declarations - These tell Rust about our other source files
mod agents;     // Counselor personas (agents.rs)
mod audio;      // Audio buffering and formats (audio/ directory)
mod config;     // Configuration management (config.rs)
mod error;      // Error handling types (error.rs)
mod health;     // Health check endpoints (health.rs)
mod providers;  // External collaborators (providers/ directory)
mod state;      // Application state management (state.rs)
mod voice;      // Voice sessions (voice/ directory)
mod websocket;  // Voice WebSocket handler (websocket.rs)

// External crate imports - These are dependencies from Cargo.toml
use actix_cors::Cors;  // Cross-Origin Resource Sharing support
use actix_web::{web, App, HttpServer};  // Web framework
use anyhow::Result;    // Better error handling with context
use config::AppConfig; // Our custom configuration struct
use providers::VoiceServices;
use state::{AppState, MetricsHandle};
use std::sync::atomic::{AtomicBool, Ordering};  // Thread-safe boolean for shutdown
use std::sync::Arc;
use tracing::{error, info, warn};  // Structured logging
use tracing_actix_web::TracingLogger;  // Per-request spans
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};  // Logging setup
use voice::pipeline::UtterancePipeline;
use voice::registry::SessionRegistry;
use voice::session::SessionRuntime;

/// Global shutdown signal that can be accessed from anywhere in the program.
/// AtomicBool is thread-safe, meaning multiple threads can safely read/write to it.
static SHUTDOWN_SIGNAL: AtomicBool = AtomicBool::new(false);

/// The main application entry point.
///
/// ## What this function does:
/// 1. **Loads configuration** from files and environment variables
/// 2. **Sets up logging** for debugging and monitoring
/// 3. **Wires the voice collaborators** selected by `providers.mode`
/// 4. **Creates shared application state** (registry, pipeline, counters)
/// 5. **Configures the HTTP server** with middleware and routes
/// 6. **Handles graceful shutdown** when receiving system signals
///
/// ## Key Rust Concepts:
/// - `#[actix_web::main]`: This macro sets up the async runtime
/// - `?`: The question mark operator automatically returns early if there's an error
#[actix_web::main]
async fn main() -> Result<()> {
    // .ok() means "ignore errors" - it's fine if there's no .env file
    dotenv::dotenv().ok();

    init_tracing()?;

    let config = AppConfig::load()?;
    config.validate()?;

    info!("Starting voice-counsel-backend v{}", env!("CARGO_PKG_VERSION"));
    info!("Configuration loaded: {}:{}", config.server.host, config.server.port);

    let services = VoiceServices::from_config(&config)?;
    let runtime = SessionRuntime {
        pipeline: Arc::new(UtterancePipeline::new(services, config.pipeline.clone())),
        registry: Arc::new(SessionRegistry::new(config.session.max_concurrent_sessions)),
        config: config.session.clone(),
        metrics: MetricsHandle::default(),
        demo_mode: !config.session.require_token,
    };
    if runtime.demo_mode {
        warn!("Token check disabled (demo mode)");
    }

    let app_state = AppState::new(config.clone(), runtime);
    let bind_addr = format!("{}:{}", config.server.host, config.server.port);

    // Set up signal handlers for graceful shutdown (Ctrl+C, SIGTERM, etc.)
    setup_signal_handlers();

    info!("Starting HTTP server on {}", bind_addr);

    let server = HttpServer::new(move || {
        // The browser client is served from a different origin
        let cors = Cors::permissive().max_age(3600);

        App::new()
            .app_data(web::Data::new(app_state.clone()))
            .wrap(cors)
            .wrap(TracingLogger::default())
            .service(
                web::scope("/api/v1")
                    .route("/health", web::get().to(health::health_check))
                    .route("/metrics", web::get().to(health::detailed_metrics))
                    .route("/sessions/{session_id}", web::get().to(health::session_snapshot)),
            )
            .route("/ws/voice", web::get().to(websocket::voice_websocket))
            .route("/ws/voice/{session_id}", web::get().to(websocket::voice_websocket_with_id))
            // Also provide health check at root level for convenience
            .route("/health", web::get().to(health::health_check))
    })
    .bind(&bind_addr)?
    .run();

    let server_handle = server.handle();
    let server_task = tokio::spawn(server);

    // Wait for either the server to finish OR a shutdown signal
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
            server_handle.stop(true).await;
        }
    }

    info!("Server stopped gracefully");
    Ok(())
}

/// Initialize the tracing (logging) system for the application.
///
/// ## Environment Variables:
/// - `RUST_LOG`: Controls what gets logged (e.g., "debug", "voice_counsel_backend=debug", "audit=warn")
/// - If not set, defaults to "voice_counsel_backend=debug,actix_web=info"
///
/// Safety escalations are logged on the `audit` target, so they can be
/// filtered or routed separately from the rest.
fn init_tracing() -> Result<()> {
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "voice_counsel_backend=debug,audit=warn,actix_web=info".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .try_init()?;

    Ok(())
}

/// Set up signal handlers for graceful shutdown.
///
/// ## What this does:
/// - Listens for SIGTERM (termination signal from system)
/// - Listens for SIGINT (interrupt signal, usually Ctrl+C)
/// - When either signal is received, sets the global shutdown flag
///
/// If a handler cannot be installed the server keeps running and only stops
/// when its task ends.
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

/// Wait for the shutdown signal to be set.
///
/// Sleeps for 100ms between checks to avoid busy-waiting.
async fn wait_for_shutdown() {
    while !SHUTDOWN_SIGNAL.load(Ordering::SeqCst) {
        tokio::time::sleep(tokio::time::Duration::from_millis(100)).await;
    }
}
