//! Manages the primary WebSocket connection lifecycle for a voice session.

use super::{
    bridge::{ClientInput, SessionBridge},
    protocol::{ClientMessage, ServerMessage},
    provider::start_realtime_provider,
};
use crate::{registry::SessionRegistry, state::AppState};
use anyhow::{Context, Result};
use axum::{
    extract::{
        State,
        ws::{Message, WebSocket, WebSocketUpgrade},
    },
    response::Response,
};
use base64::prelude::*;
use bytes::Bytes;
use futures_util::{
    SinkExt, StreamExt,
    stream::{SplitSink, SplitStream},
};
use parley_core::realtime::SessionSettings;
use std::sync::Arc;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{Instrument, debug, error, info, instrument, warn};
use uuid::Uuid;

/// Axum handler to upgrade an HTTP connection to a WebSocket.
pub async fn ws_handler(ws: WebSocketUpgrade, State(state): State<Arc<AppState>>) -> Response {
    ws.on_upgrade(|socket| handle_socket(socket, state))
}

/// Main handler for an individual WebSocket connection.
///
/// Registers the session, connects the realtime provider and spawns the
/// socket reader, socket writer and bridge tasks. All of them are attached to
/// the registry so shutdown can reach them.
#[instrument(name = "ws_session", skip_all, fields(session_id))]
async fn handle_socket(socket: WebSocket, state: Arc<AppState>) {
    let ticket = state.registry.create_session();
    let session_id = ticket.id;
    tracing::Span::current().record("session_id", tracing::field::display(session_id));
    info!("New WebSocket connection.");

    let (socket_tx, socket_rx) = socket.split();
    let (client_tx, client_rx) = mpsc::channel::<ServerMessage>(256);
    let writer = tokio::spawn(write_socket(socket_tx, client_rx).in_current_span());
    state.registry.attach_task(session_id, writer);

    if client_tx
        .send(ServerMessage::SessionCreated { session_id })
        .await
        .is_err()
    {
        state.registry.remove_session(session_id);
        return;
    }

    let settings = SessionSettings {
        instructions: state.instructions.to_string(),
        voice: state.config.voice.clone(),
        ..SessionSettings::default()
    };
    let link = match start_realtime_provider(&state.config, settings, ticket.token.child_token()).await {
        Ok(link) => link,
        Err(e) => {
            error!("Failed to connect to the realtime provider: {}", e);
            let _ = client_tx
                .send(ServerMessage::Error {
                    message: format!("Failed to start voice session: {}", e),
                })
                .await;
            state.registry.remove_session(session_id);
            return;
        }
    };
    state.registry.attach_task(session_id, link.handle);

    let (input_tx, input_rx) = mpsc::channel(256);
    let reader = tokio::spawn(
        read_socket(
            socket_rx,
            input_tx,
            state.registry.clone(),
            session_id,
            ticket.token.clone(),
        )
        .in_current_span(),
    );
    state.registry.attach_task(session_id, reader);

    let bridge = SessionBridge::new(
        session_id,
        client_tx,
        link.commands,
        state.scorer.clone(),
        Some(state.reports.clone()),
        state.config.delivery.clone(),
        ticket.token.clone(),
    )
    .with_guidance(state.guidance.clone());
    let registry = state.registry.clone();
    let events = link.events;
    let session = tokio::spawn(
        async move {
            let exit = bridge.run(input_rx, events).await;
            info!(?exit, "Voice session finished.");
            registry.remove_session(session_id);
        }
        .in_current_span(),
    );
    state.registry.attach_task(session_id, session);
}

/// Decodes browser frames into bridge input until the client leaves or the
/// session is cancelled.
async fn read_socket(
    mut socket_rx: SplitStream<WebSocket>,
    input_tx: mpsc::Sender<ClientInput>,
    registry: Arc<SessionRegistry>,
    session_id: Uuid,
    token: CancellationToken,
) {
    loop {
        let message = tokio::select! {
            _ = token.cancelled() => break,
            message = socket_rx.next() => message,
        };
        let input = match message {
            Some(Ok(Message::Binary(data))) => ClientInput::Audio(data),
            Some(Ok(Message::Text(text))) => match parse_client_text(text.as_str()) {
                Ok(input) => input,
                Err(e) => {
                    warn!("Ignoring client message: {:#}", e);
                    continue;
                }
            },
            Some(Ok(Message::Close(_))) | None => {
                info!("Client closed the connection.");
                ClientInput::EndSession
            }
            Some(Ok(Message::Ping(_) | Message::Pong(_))) => continue,
            Some(Err(e)) => {
                error!("Error receiving from client WebSocket: {:?}", e);
                ClientInput::EndSession
            }
        };

        registry.touch(session_id);
        let end = input == ClientInput::EndSession;
        if input_tx.send(input).await.is_err() || end {
            break;
        }
    }
    debug!("Socket reader stopped.");
}

/// Serializes queued server messages onto the socket until every sender is
/// gone.
async fn write_socket(
    mut socket_tx: SplitSink<WebSocket, Message>,
    mut messages: mpsc::Receiver<ServerMessage>,
) {
    while let Some(message) = messages.recv().await {
        if let Err(e) = send_msg(&mut socket_tx, message).await {
            warn!("Failed to write to client WebSocket: {:#}", e);
            break;
        }
    }
    let _ = socket_tx.close().await;
}

fn parse_client_text(text: &str) -> Result<ClientInput> {
    let message: ClientMessage = serde_json::from_str(text)?;
    Ok(match message {
        ClientMessage::Audio { data } => {
            let pcm = BASE64_STANDARD
                .decode(data)
                .context("Audio payload is not valid base64")?;
            ClientInput::Utterance(Bytes::from(pcm))
        }
        ClientMessage::Commit => ClientInput::Commit,
        ClientMessage::Ping => ClientInput::Ping,
        ClientMessage::EndSession => ClientInput::EndSession,
    })
}

/// A helper function to serialize and send a `ServerMessage` to the client.
pub(crate) async fn send_msg(
    socket_tx: &mut SplitSink<WebSocket, Message>,
    msg: ServerMessage,
) -> Result<()> {
    let serialized = serde_json::to_string(&msg)?;
    socket_tx.send(Message::Text(serialized.into())).await?;
    Ok(())
}
