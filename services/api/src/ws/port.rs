//! Channels between the assessment delivery task and the session bridge.

use super::protocol::ServerMessage;
use anyhow::Context;
use async_trait::async_trait;
use parley_core::{
    delivery::{DeliveryNotice, DeliveryPort, TurnRequestError},
    keepalive::Heartbeat,
    realtime::RemoteCommand,
    tracker::{TurnId, TurnPurpose},
};
use std::time::Duration;
use tokio::sync::{mpsc, oneshot};
use tracing::warn;

pub const KEEPALIVE_MESSAGE: &str = "Assessment in progress...";

/// Requests the delivery task makes of the bridge loop.
#[derive(Debug)]
pub enum PortCommand {
    RequestTurn {
        purpose: TurnPurpose,
        instructions: String,
        reply: oneshot::Sender<Result<TurnId, TurnRequestError>>,
    },
}

/// [`DeliveryPort`] backed by the bridge's command channel.
///
/// The bridge owns the remote connection and the latch, so every turn request
/// is a round trip through its select loop. The reply arrives when the remote
/// side reports the turn as created.
pub struct BridgePort {
    commands: mpsc::Sender<PortCommand>,
    client_tx: mpsc::Sender<ServerMessage>,
    create_timeout: Duration,
}

impl BridgePort {
    pub fn new(
        commands: mpsc::Sender<PortCommand>,
        client_tx: mpsc::Sender<ServerMessage>,
        create_timeout: Duration,
    ) -> Self {
        Self {
            commands,
            client_tx,
            create_timeout,
        }
    }
}

#[async_trait]
impl DeliveryPort for BridgePort {
    async fn request_turn(
        &self,
        purpose: TurnPurpose,
        instructions: String,
    ) -> Result<TurnId, TurnRequestError> {
        let (reply, created) = oneshot::channel();
        self.commands
            .send(PortCommand::RequestTurn {
                purpose,
                instructions,
                reply,
            })
            .await
            .map_err(|_| TurnRequestError::Closed)?;

        match tokio::time::timeout(self.create_timeout, created).await {
            Ok(Ok(result)) => result,
            Ok(Err(_)) => Err(TurnRequestError::Closed),
            Err(_) => Err(TurnRequestError::NotCreated),
        }
    }

    async fn notify(&self, notice: DeliveryNotice) {
        if let Err(e) = self.client_tx.send(notice.into()).await {
            warn!("Failed to send assessment notice: {}", e);
        }
    }
}

/// Keeps both connections warm while the report is generated: clears the
/// remote input buffer and pings the browser.
pub struct BridgeHeartbeat {
    remote_tx: mpsc::Sender<RemoteCommand>,
    client_tx: mpsc::Sender<ServerMessage>,
}

impl BridgeHeartbeat {
    pub fn new(remote_tx: mpsc::Sender<RemoteCommand>, client_tx: mpsc::Sender<ServerMessage>) -> Self {
        Self { remote_tx, client_tx }
    }
}

#[async_trait]
impl Heartbeat for BridgeHeartbeat {
    async fn beat(&self) -> anyhow::Result<()> {
        self.remote_tx
            .send(RemoteCommand::ClearInput)
            .await
            .context("Remote connection closed")?;
        self.client_tx
            .send(ServerMessage::Keepalive {
                message: KEEPALIVE_MESSAGE.to_string(),
            })
            .await
            .context("Client connection closed")?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test(start_paused = true)]
    async fn test_request_resolves_with_created_turn() {
        let (commands, mut rx) = mpsc::channel(4);
        let (client_tx, _client_rx) = mpsc::channel(4);
        let port = BridgePort::new(commands, client_tx, Duration::from_secs(10));

        let bridge = tokio::spawn(async move {
            let Some(PortCommand::RequestTurn { purpose, reply, .. }) = rx.recv().await else {
                panic!("no request");
            };
            assert_eq!(purpose, TurnPurpose::Summary);
            reply.send(Ok("resp_7".to_string())).unwrap();
        });

        let id = port
            .request_turn(TurnPurpose::Summary, "say it".to_string())
            .await
            .unwrap();
        assert_eq!(id, "resp_7");
        bridge.await.unwrap();
    }

    #[tokio::test(start_paused = true)]
    async fn test_request_times_out_when_turn_never_created() {
        let (commands, mut rx) = mpsc::channel(4);
        let (client_tx, _client_rx) = mpsc::channel(4);
        let port = BridgePort::new(commands, client_tx, Duration::from_secs(10));

        // Hold the reply sender without answering.
        let bridge = tokio::spawn(async move {
            let command = rx.recv().await;
            tokio::time::sleep(Duration::from_secs(60)).await;
            drop(command);
        });

        let result = port
            .request_turn(TurnPurpose::Goodbye, "bye".to_string())
            .await;
        assert_eq!(result, Err(TurnRequestError::NotCreated));
        bridge.abort();
    }

    #[tokio::test]
    async fn test_request_fails_when_bridge_is_gone() {
        let (commands, rx) = mpsc::channel(4);
        let (client_tx, _client_rx) = mpsc::channel(4);
        drop(rx);
        let port = BridgePort::new(commands, client_tx, Duration::from_secs(10));
        let result = port
            .request_turn(TurnPurpose::Acknowledgment, "ok".to_string())
            .await;
        assert_eq!(result, Err(TurnRequestError::Closed));
    }

    #[tokio::test]
    async fn test_heartbeat_touches_both_sides() {
        let (remote_tx, mut remote_rx) = mpsc::channel(4);
        let (client_tx, mut client_rx) = mpsc::channel(4);
        let heartbeat = BridgeHeartbeat::new(remote_tx, client_tx);

        heartbeat.beat().await.unwrap();

        assert_eq!(remote_rx.recv().await, Some(RemoteCommand::ClearInput));
        assert_eq!(
            client_rx.recv().await,
            Some(ServerMessage::Keepalive {
                message: KEEPALIVE_MESSAGE.to_string()
            })
        );
    }

    #[tokio::test]
    async fn test_heartbeat_errors_when_remote_closed() {
        let (remote_tx, remote_rx) = mpsc::channel(4);
        let (client_tx, _client_rx) = mpsc::channel(4);
        drop(remote_rx);
        let heartbeat = BridgeHeartbeat::new(remote_tx, client_tx);
        assert!(heartbeat.beat().await.is_err());
    }
}
