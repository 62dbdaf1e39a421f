//! Manages the realtime WebSocket connection to the voice provider.

pub mod messages;
pub mod openai;

use crate::config::Config;
use parley_core::realtime::{RemoteCommand, RemoteEvent, SessionSettings};
use tokio::{sync::mpsc, task::JoinHandle};
use tokio_util::sync::CancellationToken;
use tracing::{Instrument, error, info};

#[derive(Debug, thiserror::Error)]
pub enum ProviderError {
    #[error("invalid realtime request: {0}")]
    Request(String),
    #[error("realtime connection failed: {0}")]
    Connection(#[from] tokio_tungstenite::tungstenite::Error),
    #[error("failed to encode realtime event: {0}")]
    Encode(#[from] serde_json::Error),
}

/// A live connection to the realtime provider.
///
/// Commands go in through `commands`; normalised events come out of `events`.
/// The last event before the channel closes is always [`RemoteEvent::Closed`].
pub struct RealtimeLink {
    pub commands: mpsc::Sender<RemoteCommand>,
    pub events: mpsc::Receiver<RemoteEvent>,
    pub handle: JoinHandle<()>,
}

/// Connects to the realtime endpoint, configures the session and spawns the
/// task that pumps events in both directions until `shutdown` fires or either
/// side closes.
pub async fn start_realtime_provider(
    config: &Config,
    settings: SessionSettings,
    shutdown: CancellationToken,
) -> Result<RealtimeLink, ProviderError> {
    let stream = openai::connect(config, &settings).await?;
    info!(model = %config.realtime_model, "Connected to realtime endpoint.");

    let (command_tx, command_rx) = mpsc::channel(256);
    let (event_tx, event_rx) = mpsc::channel(256);

    let handle = tokio::spawn(
        async move {
            if let Err(e) = openai::run(stream, command_rx, event_tx, shutdown).await {
                error!(error = %e, "Realtime provider task failed");
            }
        }
        .in_current_span(),
    );

    Ok(RealtimeLink {
        commands: command_tx,
        events: event_rx,
        handle,
    })
}
