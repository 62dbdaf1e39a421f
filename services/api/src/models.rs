//! Data Transfer Objects for the REST API.

use serde::{Deserialize, Serialize};
use utoipa::ToSchema;

#[derive(Serialize, Deserialize, ToSchema, Debug, Clone, PartialEq, Eq)]
pub struct HealthResponse {
    /// Always `"healthy"` while the server is accepting requests.
    pub status: String,
    pub active_sessions: usize,
    pub api_key_configured: bool,
}
