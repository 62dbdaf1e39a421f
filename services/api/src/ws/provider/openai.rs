//! Handles the realtime WebSocket connection to the OpenAI Realtime API.

use super::{
    ProviderError,
    messages::{ClientEvent, ServerEvent, SessionConfig},
};
use crate::config::Config;
use futures_util::{SinkExt, StreamExt};
use parley_core::realtime::{RemoteCommand, RemoteEvent, SessionSettings};
use tokio::{net::TcpStream, sync::mpsc};
use tokio_tungstenite::{
    MaybeTlsStream, WebSocketStream, connect_async,
    tungstenite::{client::IntoClientRequest, protocol::Message as WsMessage},
};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

pub type RealtimeStream = WebSocketStream<MaybeTlsStream<TcpStream>>;

/// Opens the WebSocket and sends the initial `session.update`.
pub async fn connect(config: &Config, settings: &SessionSettings) -> Result<RealtimeStream, ProviderError> {
    let url = format!("{}?model={}", config.realtime_url, config.realtime_model);

    let mut request = url.into_client_request()?;
    let auth = format!("Bearer {}", config.openai_api_key)
        .parse()
        .map_err(|e| ProviderError::Request(format!("invalid API key header: {}", e)))?;
    request.headers_mut().insert("Authorization", auth);
    request.headers_mut().insert(
        "OpenAI-Beta",
        "realtime=v1"
            .parse()
            .map_err(|e| ProviderError::Request(format!("invalid beta header: {}", e)))?,
    );

    let (mut ws_stream, _) = connect_async(request).await?;

    let event = ClientEvent::SessionUpdate {
        session: SessionConfig::from_settings(settings),
    };
    ws_stream
        .send(WsMessage::Text(serde_json::to_string(&event)?.into()))
        .await?;
    Ok(ws_stream)
}

/// Pumps commands out and events in until shutdown or disconnect.
pub async fn run(
    stream: RealtimeStream,
    mut commands: mpsc::Receiver<RemoteCommand>,
    events: mpsc::Sender<RemoteEvent>,
    shutdown: CancellationToken,
) -> Result<(), ProviderError> {
    let (mut openai_tx, mut openai_rx) = stream.split();

    let result = loop {
        tokio::select! {
            biased;
            _ = shutdown.cancelled() => {
                debug!("Realtime connection cancelled.");
                let _ = openai_tx.close().await;
                break Ok(());
            }
            command = commands.recv() => {
                let Some(command) = command else {
                    let _ = openai_tx.close().await;
                    break Ok(());
                };
                let event = ClientEvent::from(command);
                let text = match serde_json::to_string(&event) {
                    Ok(text) => text,
                    Err(e) => break Err(e.into()),
                };
                if let Err(e) = openai_tx.send(WsMessage::Text(text.into())).await {
                    break Err(e.into());
                }
            }
            message = openai_rx.next() => match message {
                Some(Ok(WsMessage::Text(text))) => match serde_json::from_str::<ServerEvent>(&text) {
                    Ok(server_event) => {
                        if let Some(event) = server_event.into_remote() {
                            if events.send(event).await.is_err() {
                                break Ok(());
                            }
                        }
                    }
                    Err(e) => warn!("Unparseable realtime event: {}", e),
                },
                Some(Ok(WsMessage::Close(frame))) => {
                    info!(?frame, "Realtime endpoint closed the connection.");
                    break Ok(());
                }
                Some(Ok(_)) => {}
                Some(Err(e)) => break Err(e.into()),
                None => break Ok(()),
            },
        }
    };

    let _ = events.send(RemoteEvent::Closed).await;
    result
}
