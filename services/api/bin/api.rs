//! Main Entrypoint for the Parley API Service
//!
//! This binary is responsible for:
//! 1. Loading configuration from the environment.
//! 2. Choosing the scorer and loading the session prompt and guidance.
//! 3. Starting the session registry and its stale-session reaper.
//! 4. Constructing the Axum router and applying middleware.
//! 5. Serving until Ctrl+C, then shutting every live session down.

use anyhow::Context;
use async_openai::config::OpenAIConfig;
use parley_api::{
    config::{Config, ScorerKind},
    prompts::{load_guidance, load_instructions},
    registry::SessionRegistry,
    reports::ReportStore,
    router::create_router,
    state::AppState,
};
use parley_core::scoring::{MockScoringService, OpenAIScoringService, ScoringService};
use std::{net::SocketAddr, sync::Arc};
use tower_http::cors::{Any, CorsLayer};
use tracing::info;

/// Listens for the `Ctrl+C` signal to gracefully shut down the server.
async fn shutdown_signal() {
    tokio::signal::ctrl_c()
        .await
        .expect("Failed to install Ctrl+C handler");
    info!("Received shutdown signal. Shutting down gracefully...");
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // --- 1. Load Configuration ---
    let config = Config::from_env().context("Failed to load configuration")?;

    tracing_subscriber::fmt()
        .with_max_level(config.log_level)
        .with_timer(tracing_subscriber::fmt::time::ChronoLocal::rfc_3339())
        .init();
    info!("Configuration loaded. Initializing application state...");

    // --- 2. Initialize Shared Services ---
    let instructions = Arc::new(load_instructions(&config.prompts_path)?);
    let guidance = Arc::new(load_guidance(&config.prompts_path)?);

    let scorer: Arc<dyn ScoringService> = match config.scorer {
        ScorerKind::OpenAI => {
            info!(model = %config.scoring_model, "Using OpenAI scorer.");
            let openai_config = OpenAIConfig::new().with_api_key(&config.openai_api_key);
            Arc::new(OpenAIScoringService::new(
                openai_config,
                config.scoring_model.clone(),
            ))
        }
        ScorerKind::Mock => {
            info!("Using mock scorer.");
            Arc::new(MockScoringService)
        }
    };

    // --- 3. Session Registry ---
    let registry = Arc::new(SessionRegistry::new());
    let reaper = registry.spawn_reaper(config.reaper_interval, config.session_idle_timeout);

    let app_state = Arc::new(AppState {
        config: Arc::new(config.clone()),
        registry: registry.clone(),
        scorer,
        reports: Arc::new(ReportStore::new(config.reports_path.clone())),
        instructions,
        guidance,
    });

    // --- 4. Create Router and Apply Middleware ---
    let cors = CorsLayer::new()
        .allow_origin(Any)
        .allow_methods(Any)
        .allow_headers(Any);

    let app = create_router(app_state).layer(cors);

    // --- 5. Start Server ---
    info!(
        realtime_model = %config.realtime_model,
        scorer = ?config.scorer,
        bind_address = %config.bind_address,
        "Service configured. Starting server..."
    );
    let listener = tokio::net::TcpListener::bind(config.bind_address).await?;

    axum::serve(
        listener,
        app.into_make_service_with_connect_info::<SocketAddr>(),
    )
    .with_graceful_shutdown(shutdown_signal())
    .await?;

    let report = registry.shutdown_all(config.shutdown_timeout).await;
    info!(
        sessions = report.sessions,
        tasks = report.tasks,
        aborted = report.aborted,
        "All sessions stopped."
    );
    reaper.abort();

    info!("Server has shut down.");
    Ok(())
}
