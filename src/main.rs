//! # Room Relay - Main Application Entry Point
//!
//! A room-based live speech translation relay. Participants join a room over
//! WebSocket, stream raw PCM, and hear everyone else translated into their
//! own language.
//!
//! ## Application Architecture:
//! - **config**: layered configuration (defaults, TOML file, environment)
//! - **state**: shared application state and metrics
//! - **protocol**: WebSocket control and event frames
//! - **audio**: per-participant buffering, validation and session lifecycle
//! - **room**: room membership, registry and fan-out
//! - **translation**: translator boundary, HTTP client and worker pool
//! - **websocket**: the per-connection actor and `/ws/{room_id}` endpoint
//! - **health** / **handlers**: control plane and monitoring endpoints
//! - **middleware**: request logging and metrics
//! - **error**: HTTP and relay error types

mod audio;
mod config;
mod error;
mod handlers;
mod health;
mod middleware;
mod protocol;
mod room;
mod state;
mod translation;
mod websocket;

use actix_cors::Cors;
use actix_web::{web, App, HttpServer};
use anyhow::{Context, Result};
use audio::PcmFormat;
use config::AppConfig;
use room::RoomRegistry;
use state::AppState;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tracing::{error, info};
use tracing_actix_web::TracingLogger;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};
use translation::{FlushDispatcher, HttpTranslator};

/// Set once SIGINT or SIGTERM arrives.
static SHUTDOWN_SIGNAL: AtomicBool = AtomicBool::new(false);

/// ## Startup order:
/// 1. Load `.env`, set up tracing, load and validate configuration
/// 2. Connect to the translation service (fatal if unreachable)
/// 3. Build the room registry and the translation worker pool
/// 4. Serve HTTP and WebSocket routes until a shutdown signal arrives
#[actix_web::main]
async fn main() -> Result<()> {
    dotenv::dotenv().ok();
    init_tracing()?;

    let config = AppConfig::load()?;
    config.validate()?;

    info!("Starting {} v{}", env!("CARGO_PKG_NAME"), env!("CARGO_PKG_VERSION"));
    info!("Configuration loaded: {}:{}", config.server.host, config.server.port);

    let format = PcmFormat::from_settings(&config.audio);
    let translator = HttpTranslator::connect(&config.translator, format)
        .await
        .context("Translation service unavailable at startup")?;

    let registry = Arc::new(RoomRegistry::new());
    let dispatcher = Arc::new(FlushDispatcher::new(
        Arc::new(translator),
        registry.clone(),
        config.performance.translation_workers,
        format,
        config.audio.wrap_wav,
    ));
    info!(
        workers = config.performance.translation_workers,
        max_sessions = config.performance.max_concurrent_sessions,
        "Relay core ready"
    );

    let app_state = web::Data::new(AppState::new(config.clone(), registry, dispatcher));
    let bind_addr = format!("{}:{}", config.server.host, config.server.port);

    setup_signal_handlers();

    info!("Starting HTTP server on {}", bind_addr);

    let server = HttpServer::new(move || {
        let cors = Cors::default()
            .allow_any_origin()
            .allow_any_method()
            .allow_any_header()
            .max_age(3600);

        App::new()
            .app_data(app_state.clone())
            // Middleware runs in reverse registration order for responses
            .wrap(cors)
            .wrap(TracingLogger::default())
            .wrap(middleware::MetricsMiddleware)
            .wrap(middleware::RequestLogging)
            .route("/ws/{room_id}", web::get().to(websocket::room_websocket))
            .route("/create-room", web::get().to(handlers::create_room))
            .route("/rooms/{room_id}", web::get().to(handlers::room_info))
            .service(
                web::scope("/api/v1")
                    .route("/health", web::get().to(health::health_check))
                    .route("/metrics", web::get().to(health::detailed_metrics))
                    .route("/config", web::get().to(handlers::get_config))
                    .route("/config", web::put().to(handlers::update_config)),
            )
            .route("/health", web::get().to(health::health_check))
    })
    .bind(&bind_addr)
    .with_context(|| format!("Failed to bind {}", bind_addr))?
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
            server_handle.stop(true).await;
        }
    }

    info!("Server stopped gracefully");
    Ok(())
}

/// `RUST_LOG` controls verbosity; defaults to `room_relay=debug,actix_web=info`.
fn init_tracing() -> Result<()> {
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "room_relay=debug,actix_web=info".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .try_init()
        .context("Failed to initialize tracing")?;

    Ok(())
}

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

async fn wait_for_shutdown() {
    while !SHUTDOWN_SIGNAL.load(Ordering::SeqCst) {
        tokio::time::sleep(tokio::time::Duration::from_millis(100)).await;
    }
}
