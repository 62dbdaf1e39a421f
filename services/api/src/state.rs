//! Shared Application State
//!
//! This module defines the `AppState` struct, which holds the shared,
//! clonable resources every handler and session needs.

use crate::{config::Config, registry::SessionRegistry, reports::ReportStore};
use parley_core::scoring::ScoringService;
use std::sync::Arc;

/// The shared application state, created once at startup and passed to all handlers.
#[derive(Clone)]
pub struct AppState {
    pub config: Arc<Config>,
    pub registry: Arc<SessionRegistry>,
    pub scorer: Arc<dyn ScoringService>,
    pub reports: Arc<ReportStore>,
    /// Session prompt for the realtime model.
    pub instructions: Arc<String>,
    /// Interview protocol returned by the guidance tool.
    pub guidance: Arc<String>,
}
