//! Duplex audio pump between the browser and the realtime endpoint.

use super::protocol::ServerMessage;
use base64::prelude::*;
use bytes::Bytes;
use parley_core::{
    assessment::AssessmentPhase,
    audio::{AudioFormat, pad_to_frame_boundary},
    realtime::RemoteCommand,
    tracker::TurnTracker,
};
use std::sync::Arc;
use tokio::sync::{mpsc, watch};
use tracing::{debug, warn};

/// Moves audio frames in both directions and feeds byte counts into the
/// tracker of the turn they belong to.
pub struct AudioRelay {
    remote_tx: mpsc::Sender<RemoteCommand>,
    client_tx: mpsc::Sender<ServerMessage>,
    tracker: Arc<TurnTracker>,
    phase: watch::Receiver<AssessmentPhase>,
    format: AudioFormat,
    dropped_frames: u64,
}

impl AudioRelay {
    pub fn new(
        remote_tx: mpsc::Sender<RemoteCommand>,
        client_tx: mpsc::Sender<ServerMessage>,
        tracker: Arc<TurnTracker>,
        phase: watch::Receiver<AssessmentPhase>,
        format: AudioFormat,
    ) -> Self {
        Self {
            remote_tx,
            client_tx,
            tracker,
            phase,
            format,
            dropped_frames: 0,
        }
    }

    /// Forwards a captured frame to the remote input buffer. Returns `false`
    /// if the frame was dropped because user input is closed.
    pub async fn submit_local_frame(&mut self, frame: Bytes) -> bool {
        let phase = *self.phase.borrow();
        if phase.blocks_user_input() {
            self.dropped_frames += 1;
            debug!(%phase, bytes = frame.len(), "Dropping user audio during assessment");
            return false;
        }
        if frame.is_empty() {
            return false;
        }
        if let Err(e) = self.remote_tx.send(RemoteCommand::AppendAudio(frame)).await {
            warn!("Failed to forward user audio: {}", e);
            return false;
        }
        true
    }

    /// Queues a synthesized frame for playback and counts it against its turn.
    pub async fn on_remote_frame(&mut self, turn_id: Option<&str>, frame: Bytes) {
        let frame = pad_to_frame_boundary(frame, &self.format);
        let resolved = self.tracker.resolve(turn_id);
        match &resolved {
            Some(id) => {
                self.tracker.track_audio_bytes(id, frame.len() as u64);
            }
            None => debug!(bytes = frame.len(), "Audio chunk with no turn to attribute it to"),
        }

        let message = ServerMessage::AiAudio {
            audio: BASE64_STANDARD.encode(&frame),
            response_id: resolved,
        };
        if let Err(e) = self.client_tx.send(message).await {
            warn!("Failed to queue AI audio for the client: {}", e);
        }
    }

    pub fn dropped_frames(&self) -> u64 {
        self.dropped_frames
    }
}
