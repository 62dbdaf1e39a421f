//! Axum Router Configuration
//!
//! This module defines the HTTP routing for the application: the health
//! endpoint and the WebSocket endpoint.

use crate::{handlers, models::HealthResponse, state::AppState, ws::ws_handler};

use axum::{Router, routing::get};
use std::sync::Arc;
use utoipa::OpenApi;

#[derive(OpenApi)]
#[openapi(
    paths(handlers::health),
    components(schemas(HealthResponse)),
    tags(
        (name = "Parley API", description = "Voice sessions with a closing proficiency assessment")
    )
)]
pub struct ApiDoc;

/// Creates the main Axum router for the application.
pub fn create_router(app_state: Arc<AppState>) -> Router {
    Router::new()
        .route("/health", get(handlers::health))
        .route("/ws", get(ws_handler))
        .with_state(app_state)
}
