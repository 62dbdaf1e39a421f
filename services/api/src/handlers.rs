//! Axum Handlers for the REST API
//!
//! It uses `utoipa` doc comments to generate OpenAPI documentation.

use axum::{extract::State, response::Json};
use std::sync::Arc;

use crate::{models::HealthResponse, state::AppState};

/// Report liveness and the number of live voice sessions.
#[utoipa::path(
    get,
    path = "/health",
    responses(
        (status = 200, description = "Service is up", body = HealthResponse)
    )
)]
pub async fn health(State(state): State<Arc<AppState>>) -> Json<HealthResponse> {
    Json(HealthResponse {
        status: "healthy".to_string(),
        active_sessions: state.registry.len(),
        api_key_configured: !state.config.openai_api_key.is_empty(),
    })
}
