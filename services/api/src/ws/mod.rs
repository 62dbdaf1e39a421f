//! WebSocket Session Management
//!
//! This module contains the logic for bridging a browser voice session to a
//! realtime provider. It is structured into submodules:
//!
//! - `protocol`: The JSON message format between browser and server.
//! - `session`: The WebSocket connection lifecycle, from upgrade to teardown.
//! - `bridge`: The per-session event loop and turn latch decisions.
//! - `relay`: Audio in both directions, gated by the assessment phase.
//! - `port`: How the assessment delivery task talks to the bridge.
//! - `provider`: The connection to the realtime voice API.

pub mod bridge;
pub mod port;
pub mod protocol;
pub mod provider;
pub mod relay;
pub mod session;

pub use session::ws_handler;
