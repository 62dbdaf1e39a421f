//! Parley API Library Crate
//!
//! This library contains the web service logic: configuration, prompt
//! loading, the session registry, report persistence, HTTP handlers and the
//! WebSocket bridge. The `api` binary is a thin wrapper around it.

pub mod config;
pub mod handlers;
pub mod models;
pub mod prompts;
pub mod registry;
pub mod reports;
pub mod router;
pub mod state;
pub mod ws;
