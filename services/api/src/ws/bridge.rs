//! The per-session event loop joining the browser, the realtime endpoint and
//! the assessment delivery task.
//!
//! The bridge is the only writer of remote commands that start or cancel
//! turns. It owns the in-flight latch decisions: user turns are deferred while
//! another turn is generating, and delivery requests are answered with
//! [`TurnRequestError::Busy`] until the latch is free.

use super::{
    port::{BridgeHeartbeat, BridgePort, PortCommand},
    protocol::ServerMessage,
    provider::messages::{INTERVIEW_GUIDANCE_TOOL, TRIGGER_ASSESSMENT_TOOL},
    relay::AudioRelay,
};
use crate::reports::ReportStore;
use bytes::Bytes;
use parley_core::{
    assessment::{AssessmentPhase, AssessmentStateMachine},
    delivery::{AssessmentDelivery, DeliveryConfig, DeliveryOutcome, TurnRequestError},
    realtime::{RemoteCommand, RemoteEvent},
    scoring::{ScoringService, Utterance},
    tracker::{TurnId, TurnPurpose, TurnTracker},
};
use serde_json::json;
use std::sync::Arc;
use std::time::Duration;
use tokio::{
    sync::{mpsc, oneshot, watch},
    task::{JoinError, JoinHandle},
};
use tokio_util::sync::CancellationToken;
use tracing::{Instrument, debug, error, info, warn};
use uuid::Uuid;

const DELIVERY_STOP_TIMEOUT: Duration = Duration::from_secs(1);
const DEFAULT_TRIGGER_REASON: &str = "Linguistic ceiling reached";
/// Instructions for the text-only turn that makes the model load its guidance
/// before it says anything.
const SETUP_INSTRUCTIONS: &str =
    "You MUST call the interview_guidance tool RIGHT NOW before doing anything else. This is mandatory.";
const SETUP_COMPLETE_MESSAGE: &str = "Interview protocol loaded. Ready for conversation!";
/// Error codes with which the remote endpoint refuses a turn request.
const TURN_REJECTION_CODES: &[&str] = &["conversation_already_has_active_response"];

/// Input from the browser, already decoded by the socket reader.
#[derive(Debug, Clone, PartialEq)]
pub enum ClientInput {
    /// Streamed PCM16 that is appended without committing.
    Audio(Bytes),
    /// A complete utterance: appended, committed and answered.
    Utterance(Bytes),
    /// Commit the streamed audio and ask for a reply.
    Commit,
    Ping,
    EndSession,
}

/// Why [`SessionBridge::run`] returned.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BridgeExit {
    Shutdown,
    AssessmentComplete,
    RemoteClosed,
    ClientClosed,
}

struct PendingTurn {
    purpose: TurnPurpose,
    reply: oneshot::Sender<Result<TurnId, TurnRequestError>>,
}

pub struct SessionBridge {
    session_id: Uuid,
    client_tx: mpsc::Sender<ServerMessage>,
    remote_tx: mpsc::Sender<RemoteCommand>,
    tracker: Arc<TurnTracker>,
    relay: AudioRelay,
    /// Handed to the state machine when delivery starts.
    phase_tx: Option<watch::Sender<AssessmentPhase>>,
    phase_rx: watch::Receiver<AssessmentPhase>,
    transcript: Vec<Utterance>,
    ai_transcript: String,
    pending_turn: Option<PendingTurn>,
    /// A user turn is waiting for the in-flight turn to finish.
    deferred_response: bool,
    /// Interview protocol handed to the model through its guidance tool.
    guidance: Option<Arc<String>>,
    setup_requested: bool,
    port_tx: mpsc::Sender<PortCommand>,
    port_rx: mpsc::Receiver<PortCommand>,
    delivery: Option<JoinHandle<DeliveryOutcome>>,
    delivery_token: CancellationToken,
    scorer: Arc<dyn ScoringService>,
    reports: Option<Arc<ReportStore>>,
    config: DeliveryConfig,
    shutdown: CancellationToken,
}

impl SessionBridge {
    pub fn new(
        session_id: Uuid,
        client_tx: mpsc::Sender<ServerMessage>,
        remote_tx: mpsc::Sender<RemoteCommand>,
        scorer: Arc<dyn ScoringService>,
        reports: Option<Arc<ReportStore>>,
        config: DeliveryConfig,
        shutdown: CancellationToken,
    ) -> Self {
        let tracker = Arc::new(TurnTracker::new());
        let (phase_tx, phase_rx) = watch::channel(AssessmentPhase::Inactive);
        let relay = AudioRelay::new(
            remote_tx.clone(),
            client_tx.clone(),
            tracker.clone(),
            phase_rx.clone(),
            config.audio_format,
        );
        let (port_tx, port_rx) = mpsc::channel(8);
        Self {
            session_id,
            client_tx,
            remote_tx,
            tracker,
            relay,
            phase_tx: Some(phase_tx),
            phase_rx,
            transcript: Vec::new(),
            ai_transcript: String::new(),
            pending_turn: None,
            deferred_response: false,
            guidance: None,
            setup_requested: false,
            port_tx,
            port_rx,
            delivery: None,
            delivery_token: shutdown.child_token(),
            scorer,
            reports,
            config,
            shutdown,
        }
    }

    /// Answers the model's guidance tool with `guidance` and opens the
    /// session with a setup turn that asks for it.
    pub fn with_guidance(mut self, guidance: Arc<String>) -> Self {
        self.guidance = Some(guidance);
        self
    }

    pub fn phase(&self) -> AssessmentPhase {
        *self.phase_rx.borrow()
    }

    /// Runs until the client leaves, the remote side closes, the assessment
    /// completes or the session is shut down.
    pub async fn run(
        mut self,
        mut client_rx: mpsc::Receiver<ClientInput>,
        mut remote_rx: mpsc::Receiver<RemoteEvent>,
    ) -> BridgeExit {
        let exit = loop {
            tokio::select! {
                biased;
                _ = self.shutdown.cancelled() => break BridgeExit::Shutdown,
                result = wait_for_delivery(&mut self.delivery) => {
                    self.delivery = None;
                    self.finish_delivery(result).await;
                    break BridgeExit::AssessmentComplete;
                }
                Some(command) = self.port_rx.recv() => self.handle_port_command(command).await,
                event = remote_rx.recv() => match event {
                    Some(RemoteEvent::Closed) | None => break BridgeExit::RemoteClosed,
                    Some(event) => self.handle_remote_event(event).await,
                },
                input = client_rx.recv() => match input {
                    Some(ClientInput::EndSession) | None => break BridgeExit::ClientClosed,
                    Some(input) => self.handle_client_input(input).await,
                },
            }
        };

        info!(?exit, dropped_frames = self.relay.dropped_frames(), "Session bridge stopping");
        self.teardown().await;
        exit
    }

    async fn handle_client_input(&mut self, input: ClientInput) {
        match input {
            ClientInput::Audio(frame) => {
                self.relay.submit_local_frame(frame).await;
            }
            ClientInput::Utterance(frame) => {
                if self.relay.submit_local_frame(frame).await {
                    self.commit_user_turn().await;
                }
            }
            ClientInput::Commit => {
                if !self.phase().blocks_user_input() {
                    self.commit_user_turn().await;
                }
            }
            ClientInput::Ping => self.send_client(ServerMessage::Pong).await,
            ClientInput::EndSession => {}
        }
    }

    async fn commit_user_turn(&mut self) {
        self.send_remote(RemoteCommand::CommitAudio).await;
        self.request_user_turn().await;
    }

    /// Starts a reply to the user, or defers it until the in-flight turn ends.
    async fn request_user_turn(&mut self) {
        if self.start_latched(RemoteCommand::StartTurn { instructions: None }).await {
            return;
        }

        if !self.deferred_response && self.tracker.active_turn().is_some() {
            debug!("User spoke over the AI, cancelling the current turn");
            self.send_remote(RemoteCommand::CancelTurn).await;
        }
        self.deferred_response = true;
    }

    /// Sends a turn-starting command if the latch can be claimed. Returns
    /// `false` if another turn holds the latch.
    async fn start_latched(&mut self, command: RemoteCommand) -> bool {
        if !self.tracker.try_acquire_latch() {
            return false;
        }
        if let Err(e) = self.remote_tx.send(command).await {
            warn!("Failed to send realtime command: {}", e);
            self.tracker.release_latch();
        }
        true
    }

    /// Opens the session with a text-only turn that makes the model call its
    /// guidance tool first.
    async fn request_setup_turn(&mut self) {
        if self.guidance.is_none() || self.setup_requested {
            return;
        }
        self.setup_requested = true;
        let command = RemoteCommand::StartTextTurn {
            instructions: SETUP_INSTRUCTIONS.to_string(),
        };
        if !self.start_latched(command).await {
            debug!("A turn is already in flight, skipping the setup turn");
        }
    }

    async fn handle_port_command(&mut self, command: PortCommand) {
        let PortCommand::RequestTurn {
            purpose,
            instructions,
            reply,
        } = command;

        if self
            .pending_turn
            .as_ref()
            .is_some_and(|pending| pending.reply.is_closed())
        {
            self.drop_abandoned_request();
        }
        if self.pending_turn.is_some() || !self.tracker.try_acquire_latch() {
            let _ = reply.send(Err(TurnRequestError::Busy));
            return;
        }
        if self
            .remote_tx
            .send(RemoteCommand::StartTurn {
                instructions: Some(instructions),
            })
            .await
            .is_err()
        {
            self.tracker.release_latch();
            let _ = reply.send(Err(TurnRequestError::Closed));
            return;
        }
        debug!(?purpose, "Requested assessment turn");
        self.pending_turn = Some(PendingTurn { purpose, reply });
    }

    /// Forgets a request whose requester gave up waiting for the turn.
    fn drop_abandoned_request(&mut self) {
        if let Some(pending) = self.pending_turn.take() {
            debug!(purpose = ?pending.purpose, "Dropping abandoned turn request");
            if self.tracker.active_turn().is_none() {
                self.tracker.release_latch();
            }
        }
    }

    async fn handle_remote_event(&mut self, event: RemoteEvent) {
        match event {
            RemoteEvent::SessionReady => {
                self.send_client(ServerMessage::SessionStarted {
                    message: "Voice session ready".to_string(),
                })
                .await;
                self.request_setup_turn().await;
            }
            RemoteEvent::TurnCreated { turn_id } => {
                // A late turn for an abandoned request is ordinary conversation.
                let pending = self
                    .pending_turn
                    .take()
                    .filter(|pending| !pending.reply.is_closed());
                let purpose = pending
                    .as_ref()
                    .map_or(TurnPurpose::Conversation, |p| p.purpose);
                self.tracker.force_latch();
                self.tracker.register_turn(turn_id.clone(), purpose);
                self.ai_transcript.clear();
                debug!(%turn_id, ?purpose, "Turn created");
                if let Some(pending) = pending {
                    let _ = pending.reply.send(Ok(turn_id));
                }
            }
            RemoteEvent::AudioChunk { turn_id, data } => {
                self.relay.on_remote_frame(turn_id.as_deref(), data).await;
            }
            RemoteEvent::AudioContentComplete { turn_id } => {
                if let Some(id) = self.tracker.resolve(turn_id.as_deref()) {
                    self.tracker.mark_audio_complete(&id);
                }
            }
            RemoteEvent::TranscriptDelta { delta, .. } => self.ai_transcript.push_str(&delta),
            RemoteEvent::TranscriptDone {
                turn_id,
                transcript,
            } => {
                let buffered = std::mem::take(&mut self.ai_transcript);
                let text = transcript.unwrap_or(buffered);
                if !text.is_empty() {
                    if self.phase() == AssessmentPhase::Inactive {
                        self.transcript.push(Utterance::ai(text.clone()));
                    }
                    self.send_client(ServerMessage::AiTranscript { text }).await;
                }
                if let Some(id) = self.tracker.resolve(turn_id.as_deref()) {
                    self.tracker.mark_audio_complete(&id);
                }
            }
            RemoteEvent::TurnComplete { turn_id, status } => {
                self.on_turn_complete(turn_id, status).await;
            }
            RemoteEvent::UserTranscript { text } => {
                if text.trim().is_empty() {
                    return;
                }
                if self.phase() == AssessmentPhase::Inactive {
                    self.transcript.push(Utterance::user(text.clone()));
                }
                self.send_client(ServerMessage::UserTranscript { text }).await;
            }
            RemoteEvent::ToolCall {
                call_id,
                name,
                arguments,
            } => self.handle_tool_call(call_id, name, arguments).await,
            RemoteEvent::Error { message, code } => {
                warn!(?code, "Realtime error: {}", message);
                // Other errors leave the request to be created or to time out.
                let rejects_turn = code
                    .as_deref()
                    .is_some_and(|code| TURN_REJECTION_CODES.contains(&code));
                if rejects_turn {
                    if let Some(pending) = self.pending_turn.take() {
                        let _ = pending.reply.send(Err(TurnRequestError::Rejected(message.clone())));
                        if self.tracker.active_turn().is_none() {
                            self.tracker.release_latch();
                        }
                    }
                }
                self.send_client(ServerMessage::Error { message }).await;
            }
            RemoteEvent::Closed => {}
        }
    }

    async fn on_turn_complete(&mut self, turn_id: Option<TurnId>, status: Option<String>) {
        match self.tracker.resolve(turn_id.as_deref()) {
            Some(id) => {
                let purpose = self.tracker.purpose(&id);
                self.tracker.mark_turn_complete(&id);
                debug!(turn_id = %id, ?status, ?purpose, "Turn complete");
                // Assessment turns are released by delivery after draining.
                if matches!(purpose, None | Some(TurnPurpose::Conversation)) {
                    self.tracker.release(&id);
                }
            }
            None => {
                debug!(?status, "Completion for an unknown turn");
                self.tracker.release_latch();
            }
        }
        self.send_client(ServerMessage::ResponseComplete).await;

        if self.deferred_response {
            self.deferred_response = false;
            if !self.phase().blocks_user_input() {
                self.request_user_turn().await;
            }
        }
    }

    async fn handle_tool_call(&mut self, call_id: Option<String>, name: String, arguments: String) {
        match (name.as_str(), self.guidance.clone()) {
            (TRIGGER_ASSESSMENT_TOOL, _) => self.trigger_assessment(call_id, &arguments).await,
            (INTERVIEW_GUIDANCE_TOOL, Some(guidance)) => self.send_guidance(call_id, &guidance).await,
            _ => {
                warn!(%name, "Unknown tool call");
                if let Some(call_id) = call_id {
                    let output = json!({ "error": format!("Unknown tool: {}", name) }).to_string();
                    self.send_remote(RemoteCommand::ToolOutput { call_id, output }).await;
                }
            }
        }
    }

    /// Returns the interview protocol to the model, then lets it speak once
    /// the setup turn is over.
    async fn send_guidance(&mut self, call_id: Option<String>, guidance: &str) {
        if let Some(call_id) = call_id {
            self.send_remote(RemoteCommand::ToolOutput {
                call_id,
                output: guidance.to_string(),
            })
            .await;
        }
        info!("Interview guidance loaded");
        self.send_client(ServerMessage::SetupComplete {
            message: SETUP_COMPLETE_MESSAGE.to_string(),
        })
        .await;
        if self.phase().blocks_user_input() {
            return;
        }
        if !self.start_latched(RemoteCommand::StartTurn { instructions: None }).await {
            self.deferred_response = true;
        }
    }

    async fn trigger_assessment(&mut self, call_id: Option<String>, arguments: &str) {
        if self.phase_tx.is_none() {
            info!("Assessment already in progress, ignoring trigger");
            if let Some(call_id) = call_id {
                let output = json!({ "status": "Assessment already in progress." }).to_string();
                self.send_remote(RemoteCommand::ToolOutput { call_id, output }).await;
            }
            return;
        }

        let reason = serde_json::from_str::<serde_json::Value>(arguments)
            .ok()
            .and_then(|args| args.get("reason")?.as_str().map(str::to_string))
            .unwrap_or_else(|| DEFAULT_TRIGGER_REASON.to_string());

        self.deferred_response = false;
        self.send_remote(RemoteCommand::ClearInput).await;
        if let Some(call_id) = call_id {
            let output = json!({ "status": "assessment_started" }).to_string();
            self.send_remote(RemoteCommand::ToolOutput { call_id, output }).await;
        }
        self.start_delivery(reason);
    }

    fn start_delivery(&mut self, reason: String) {
        let Some(phase_tx) = self.phase_tx.take() else {
            return;
        };
        let mut machine = AssessmentStateMachine::with_publisher(phase_tx);
        machine.trigger(reason.clone());

        let port = Arc::new(BridgePort::new(
            self.port_tx.clone(),
            self.client_tx.clone(),
            self.config.turn_request_timeout,
        ));
        let heartbeat = Arc::new(BridgeHeartbeat::new(
            self.remote_tx.clone(),
            self.client_tx.clone(),
        ));
        let delivery = AssessmentDelivery::new(
            machine,
            reason,
            self.transcript.clone(),
            self.tracker.clone(),
            port,
            heartbeat,
            self.scorer.clone(),
            self.config.clone(),
            self.delivery_token.clone(),
        );
        info!(utterances = self.transcript.len(), "Starting assessment delivery");
        self.delivery = Some(tokio::spawn(delivery.run().in_current_span()));
    }

    async fn finish_delivery(&mut self, result: Result<DeliveryOutcome, JoinError>) {
        match result {
            Ok(outcome) => {
                info!(
                    phase = %outcome.phase,
                    failed = outcome.failed,
                    turns = outcome.turns.len(),
                    "Assessment delivery finished"
                );
                if let (Some(store), Some(report)) = (&self.reports, &outcome.report) {
                    let summary = outcome.verbal_summary.as_deref().unwrap_or_default();
                    if let Err(e) = store
                        .save(self.session_id, report, summary, self.transcript.len())
                        .await
                    {
                        error!("Failed to save assessment report: {:#}", e);
                    }
                }
            }
            Err(e) => error!("Assessment delivery task failed: {}", e),
        }
        self.send_client(ServerMessage::SessionEnded {
            reason: "assessment_complete".to_string(),
        })
        .await;
    }

    async fn teardown(&mut self) {
        self.delivery_token.cancel();
        if let Some(handle) = self.delivery.take() {
            let abort = handle.abort_handle();
            if tokio::time::timeout(DELIVERY_STOP_TIMEOUT, handle).await.is_err() {
                warn!("Assessment delivery did not stop in time, aborting");
                abort.abort();
            }
        }
        if let Some(pending) = self.pending_turn.take() {
            let _ = pending.reply.send(Err(TurnRequestError::Closed));
        }
        if self.tracker.active_turn().is_some() {
            let _ = self.remote_tx.try_send(RemoteCommand::CancelTurn);
        }
    }

    async fn send_client(&self, message: ServerMessage) {
        if let Err(e) = self.client_tx.send(message).await {
            debug!("Client channel closed: {}", e);
        }
    }

    async fn send_remote(&self, command: RemoteCommand) {
        if let Err(e) = self.remote_tx.send(command).await {
            warn!("Failed to send realtime command: {}", e);
        }
    }
}

async fn wait_for_delivery(
    delivery: &mut Option<JoinHandle<DeliveryOutcome>>,
) -> Result<DeliveryOutcome, JoinError> {
    match delivery {
        Some(handle) => handle.await,
        None => std::future::pending().await,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use parking_lot::Mutex;
    use parley_core::{
        report::AssessmentReport,
        scoring::{MockScoringService, ScoringError, ScoringRequest},
    };
    use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};

    struct Harness {
        client_in: mpsc::Sender<ClientInput>,
        remote_events: mpsc::Sender<RemoteEvent>,
        remote_cmds: mpsc::Receiver<RemoteCommand>,
        client_out: mpsc::Receiver<ServerMessage>,
        port: mpsc::Sender<PortCommand>,
        tracker: Arc<TurnTracker>,
        shutdown: CancellationToken,
        bridge: JoinHandle<BridgeExit>,
    }

    fn spawn_bridge(scorer: Arc<dyn ScoringService>) -> Harness {
        spawn_configured(scorer, None)
    }

    fn spawn_configured(scorer: Arc<dyn ScoringService>, guidance: Option<&str>) -> Harness {
        let (client_in, client_rx) = mpsc::channel(64);
        let (remote_events, remote_rx) = mpsc::channel(64);
        let (remote_tx, remote_cmds) = mpsc::channel(256);
        let (client_tx, client_out) = mpsc::channel(256);
        let shutdown = CancellationToken::new();
        let bridge = SessionBridge::new(
            Uuid::new_v4(),
            client_tx,
            remote_tx,
            scorer,
            None,
            DeliveryConfig::default(),
            shutdown.clone(),
        );
        let bridge = match guidance {
            Some(text) => bridge.with_guidance(Arc::new(text.to_string())),
            None => bridge,
        };
        let port = bridge.port_tx.clone();
        let tracker = bridge.tracker.clone();
        let bridge = tokio::spawn(bridge.run(client_rx, remote_rx));
        Harness {
            client_in,
            remote_events,
            remote_cmds,
            client_out,
            port,
            tracker,
            shutdown,
            bridge,
        }
    }

    impl Harness {
        /// Round-trips a ping so everything sent before it has been handled.
        async fn sync(&mut self) {
            self.client_in.send(ClientInput::Ping).await.unwrap();
            loop {
                match self.client_out.recv().await {
                    Some(ServerMessage::Pong) => return,
                    Some(_) => {}
                    None => panic!("bridge closed"),
                }
            }
        }

        async fn request_turn(
            &self,
            purpose: TurnPurpose,
        ) -> oneshot::Receiver<Result<TurnId, TurnRequestError>> {
            let (reply, created) = oneshot::channel();
            self.port
                .send(PortCommand::RequestTurn {
                    purpose,
                    instructions: format!("{purpose:?} text"),
                    reply,
                })
                .await
                .unwrap();
            created
        }

        async fn remote_error(&self, code: &str) {
            self.remote_events
                .send(RemoteEvent::Error {
                    message: format!("{code} happened"),
                    code: Some(code.to_string()),
                })
                .await
                .unwrap();
        }
    }

    struct SlowScorer(Duration);

    #[async_trait]
    impl ScoringService for SlowScorer {
        async fn score(&self, request: ScoringRequest) -> Result<AssessmentReport, ScoringError> {
            tokio::time::sleep(self.0).await;
            MockScoringService.score(request).await
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_user_turn_deferred_while_ai_speaks() {
        let mut h = spawn_bridge(Arc::new(MockScoringService));

        // The AI is mid-reply.
        h.remote_events
            .send(RemoteEvent::TurnCreated {
                turn_id: "resp_1".to_string(),
            })
            .await
            .unwrap();
        h.sync().await;

        h.client_in
            .send(ClientInput::Utterance(Bytes::from_static(&[1, 2])))
            .await
            .unwrap();
        h.client_in
            .send(ClientInput::Utterance(Bytes::from_static(&[3, 4])))
            .await
            .unwrap();
        h.sync().await;

        let mut seen = Vec::new();
        while let Ok(command) = h.remote_cmds.try_recv() {
            seen.push(command);
        }
        assert_eq!(
            seen,
            vec![
                RemoteCommand::AppendAudio(Bytes::from_static(&[1, 2])),
                RemoteCommand::CommitAudio,
                RemoteCommand::CancelTurn,
                RemoteCommand::AppendAudio(Bytes::from_static(&[3, 4])),
                RemoteCommand::CommitAudio,
            ]
        );

        h.remote_events
            .send(RemoteEvent::TurnComplete {
                turn_id: Some("resp_1".to_string()),
                status: Some("cancelled".to_string()),
            })
            .await
            .unwrap();
        assert_eq!(
            h.remote_cmds.recv().await,
            Some(RemoteCommand::StartTurn { instructions: None })
        );

        h.client_in.send(ClientInput::EndSession).await.unwrap();
        assert_eq!(h.bridge.await.unwrap(), BridgeExit::ClientClosed);
    }

    #[tokio::test(start_paused = true)]
    async fn test_transcript_and_unknown_tool() {
        let mut h = spawn_bridge(Arc::new(MockScoringService));

        h.remote_events
            .send(RemoteEvent::UserTranscript {
                text: "I goed to the store".to_string(),
            })
            .await
            .unwrap();
        h.remote_events
            .send(RemoteEvent::TranscriptDelta {
                turn_id: None,
                delta: "Tell me ".to_string(),
            })
            .await
            .unwrap();
        h.remote_events
            .send(RemoteEvent::TranscriptDelta {
                turn_id: None,
                delta: "more.".to_string(),
            })
            .await
            .unwrap();
        h.remote_events
            .send(RemoteEvent::TranscriptDone {
                turn_id: None,
                transcript: None,
            })
            .await
            .unwrap();
        h.remote_events
            .send(RemoteEvent::ToolCall {
                call_id: Some("call_9".to_string()),
                name: "open_door".to_string(),
                arguments: "{}".to_string(),
            })
            .await
            .unwrap();

        assert_eq!(
            h.client_out.recv().await,
            Some(ServerMessage::UserTranscript {
                text: "I goed to the store".to_string()
            })
        );
        assert_eq!(
            h.client_out.recv().await,
            Some(ServerMessage::AiTranscript {
                text: "Tell me more.".to_string()
            })
        );
        match h.remote_cmds.recv().await {
            Some(RemoteCommand::ToolOutput { call_id, output }) => {
                assert_eq!(call_id, "call_9");
                assert!(output.contains("Unknown tool: open_door"));
            }
            other => panic!("unexpected {other:?}"),
        }

        h.shutdown.cancel();
        assert_eq!(h.bridge.await.unwrap(), BridgeExit::Shutdown);
    }

    #[tokio::test(start_paused = true)]
    async fn test_unrelated_error_keeps_assessment_going() {
        let h = spawn_bridge(Arc::new(MockScoringService));
        let Harness {
            remote_events,
            remote_cmds,
            mut client_out,
            bridge,
            ..
        } = h;
        let open = Arc::new(AtomicBool::new(false));
        // The error lands while the summary turn is being requested.
        let (fake, log, overlaps) = spawn_fake_remote(remote_cmds, remote_events.clone(), open, Some(2));

        remote_events
            .send(RemoteEvent::ToolCall {
                call_id: Some("call_1".to_string()),
                name: TRIGGER_ASSESSMENT_TOOL.to_string(),
                arguments: "{}".to_string(),
            })
            .await
            .unwrap();

        let exit = tokio::time::timeout(Duration::from_secs(120), bridge)
            .await
            .expect("bridge did not finish")
            .unwrap();
        assert_eq!(exit, BridgeExit::AssessmentComplete);
        fake.abort();

        let start_turns = log
            .lock()
            .iter()
            .filter(|c| matches!(c, RemoteCommand::StartTurn { .. }))
            .count();
        assert_eq!(start_turns, 3, "ack, summary and goodbye");
        assert_eq!(overlaps.load(Ordering::SeqCst), 0);

        let mut messages = Vec::new();
        while let Ok(message) = client_out.try_recv() {
            messages.push(message);
        }
        assert!(messages.contains(&ServerMessage::Error {
            message: "Rate limit reached".to_string()
        }));
        assert!(
            messages
                .iter()
                .any(|m| matches!(m, ServerMessage::AssessmentComplete { .. }))
        );
    }

    #[tokio::test(start_paused = true)]
    async fn test_active_response_error_rejects_pending_request() {
        let mut h = spawn_bridge(Arc::new(MockScoringService));

        let created = h.request_turn(TurnPurpose::Summary).await;
        assert_eq!(
            h.remote_cmds.recv().await,
            Some(RemoteCommand::StartTurn {
                instructions: Some("Summary text".to_string())
            })
        );
        h.remote_error("conversation_already_has_active_response").await;

        assert!(matches!(created.await.unwrap(), Err(TurnRequestError::Rejected(_))));
        h.sync().await;
        assert!(!h.tracker.is_in_flight());

        // The retry goes through.
        let created = h.request_turn(TurnPurpose::Summary).await;
        h.remote_events
            .send(RemoteEvent::TurnCreated {
                turn_id: "resp_2".to_string(),
            })
            .await
            .unwrap();
        assert_eq!(created.await.unwrap(), Ok("resp_2".to_string()));

        h.shutdown.cancel();
        assert_eq!(h.bridge.await.unwrap(), BridgeExit::Shutdown);
    }

    #[tokio::test(start_paused = true)]
    async fn test_unrelated_error_leaves_request_pending() {
        let mut h = spawn_bridge(Arc::new(MockScoringService));

        let mut created = h.request_turn(TurnPurpose::Goodbye).await;
        h.remote_cmds.recv().await.unwrap();
        h.remote_error("rate_limit_exceeded").await;
        h.sync().await;
        assert!(created.try_recv().is_err());
        assert!(h.tracker.is_in_flight());

        h.remote_events
            .send(RemoteEvent::TurnCreated {
                turn_id: "resp_1".to_string(),
            })
            .await
            .unwrap();
        assert_eq!(created.await.unwrap(), Ok("resp_1".to_string()));
        assert_eq!(h.tracker.purpose("resp_1"), Some(TurnPurpose::Goodbye));

        h.shutdown.cancel();
        assert_eq!(h.bridge.await.unwrap(), BridgeExit::Shutdown);
    }

    #[tokio::test(start_paused = true)]
    async fn test_abandoned_request_does_not_block_the_next() {
        let mut h = spawn_bridge(Arc::new(MockScoringService));

        // The requester times out before the turn is created.
        let created = h.request_turn(TurnPurpose::Acknowledgment).await;
        h.remote_cmds.recv().await.unwrap();
        drop(created);

        let created = h.request_turn(TurnPurpose::Summary).await;
        assert_eq!(
            h.remote_cmds.recv().await,
            Some(RemoteCommand::StartTurn {
                instructions: Some("Summary text".to_string())
            })
        );
        h.remote_events
            .send(RemoteEvent::TurnCreated {
                turn_id: "resp_2".to_string(),
            })
            .await
            .unwrap();
        assert_eq!(created.await.unwrap(), Ok("resp_2".to_string()));
        assert_eq!(h.tracker.purpose("resp_2"), Some(TurnPurpose::Summary));

        h.shutdown.cancel();
        assert_eq!(h.bridge.await.unwrap(), BridgeExit::Shutdown);
    }

    #[tokio::test(start_paused = true)]
    async fn test_late_turn_for_abandoned_request_is_conversation() {
        let mut h = spawn_bridge(Arc::new(MockScoringService));

        let created = h.request_turn(TurnPurpose::Acknowledgment).await;
        h.remote_cmds.recv().await.unwrap();
        drop(created);

        h.remote_events
            .send(RemoteEvent::TurnCreated {
                turn_id: "resp_late".to_string(),
            })
            .await
            .unwrap();
        h.sync().await;
        assert_eq!(h.tracker.purpose("resp_late"), Some(TurnPurpose::Conversation));

        h.remote_events
            .send(RemoteEvent::TurnComplete {
                turn_id: Some("resp_late".to_string()),
                status: Some("completed".to_string()),
            })
            .await
            .unwrap();
        h.sync().await;
        assert!(h.tracker.is_empty());
        assert!(!h.tracker.is_in_flight());

        h.shutdown.cancel();
        assert_eq!(h.bridge.await.unwrap(), BridgeExit::Shutdown);
    }

    #[tokio::test(start_paused = true)]
    async fn test_setup_turn_loads_guidance_before_speaking() {
        let mut h = spawn_configured(Arc::new(MockScoringService), Some("Ask their name."));

        h.remote_events.send(RemoteEvent::SessionReady).await.unwrap();
        assert_eq!(
            h.remote_cmds.recv().await,
            Some(RemoteCommand::StartTextTurn {
                instructions: SETUP_INSTRUCTIONS.to_string()
            })
        );

        h.remote_events
            .send(RemoteEvent::TurnCreated {
                turn_id: "resp_0".to_string(),
            })
            .await
            .unwrap();
        h.remote_events
            .send(RemoteEvent::ToolCall {
                call_id: Some("call_g".to_string()),
                name: INTERVIEW_GUIDANCE_TOOL.to_string(),
                arguments: "{}".to_string(),
            })
            .await
            .unwrap();
        assert_eq!(
            h.remote_cmds.recv().await,
            Some(RemoteCommand::ToolOutput {
                call_id: "call_g".to_string(),
                output: "Ask their name.".to_string(),
            })
        );

        let mut messages = Vec::new();
        h.client_in.send(ClientInput::Ping).await.unwrap();
        while let Some(message) = h.client_out.recv().await {
            if message == ServerMessage::Pong {
                break;
            }
            messages.push(message);
        }
        assert_eq!(
            messages,
            vec![
                ServerMessage::SessionStarted {
                    message: "Voice session ready".to_string()
                },
                ServerMessage::SetupComplete {
                    message: SETUP_COMPLETE_MESSAGE.to_string()
                },
            ]
        );
        // The setup turn still holds the latch.
        assert!(h.remote_cmds.try_recv().is_err());

        h.remote_events
            .send(RemoteEvent::TurnComplete {
                turn_id: Some("resp_0".to_string()),
                status: Some("completed".to_string()),
            })
            .await
            .unwrap();
        assert_eq!(
            h.remote_cmds.recv().await,
            Some(RemoteCommand::StartTurn { instructions: None })
        );

        // A second session.updated does not repeat the setup turn.
        h.remote_events.send(RemoteEvent::SessionReady).await.unwrap();
        h.sync().await;
        assert!(h.remote_cmds.try_recv().is_err());

        h.client_in.send(ClientInput::EndSession).await.unwrap();
        assert_eq!(h.bridge.await.unwrap(), BridgeExit::ClientClosed);
    }

    /// Answers every StartTurn like the realtime endpoint would, with audio,
    /// content-complete and turn-complete spread over time. Counts StartTurns
    /// issued while a previous turn was still open. The StartTurn numbered
    /// `error_before` is preceded by an unrelated rate-limit error.
    fn spawn_fake_remote(
        mut commands: mpsc::Receiver<RemoteCommand>,
        events: mpsc::Sender<RemoteEvent>,
        open: Arc<AtomicBool>,
        error_before: Option<usize>,
    ) -> (JoinHandle<()>, Arc<Mutex<Vec<RemoteCommand>>>, Arc<AtomicUsize>) {
        let log = Arc::new(Mutex::new(Vec::new()));
        let overlaps = Arc::new(AtomicUsize::new(0));
        let task = {
            let log = log.clone();
            let overlaps = overlaps.clone();
            tokio::spawn(async move {
                let mut next = 1;
                while let Some(command) = commands.recv().await {
                    log.lock().push(command.clone());
                    if !matches!(command, RemoteCommand::StartTurn { .. }) {
                        continue;
                    }
                    if open.swap(true, Ordering::SeqCst) {
                        overlaps.fetch_add(1, Ordering::SeqCst);
                    }
                    let turn_id = format!("resp_{next}");
                    let error = error_before == Some(next);
                    next += 1;
                    let events = events.clone();
                    let open = open.clone();
                    tokio::spawn(async move {
                        let id = Some(turn_id.clone());
                        if error {
                            let _ = events
                                .send(RemoteEvent::Error {
                                    message: "Rate limit reached".to_string(),
                                    code: Some("rate_limit_exceeded".to_string()),
                                })
                                .await;
                        }
                        let _ = events.send(RemoteEvent::TurnCreated { turn_id }).await;
                        tokio::time::sleep(Duration::from_millis(200)).await;
                        let _ = events
                            .send(RemoteEvent::AudioChunk {
                                turn_id: id.clone(),
                                data: Bytes::from(vec![0u8; 48_000]),
                            })
                            .await;
                        let _ = events
                            .send(RemoteEvent::AudioContentComplete { turn_id: id.clone() })
                            .await;
                        tokio::time::sleep(Duration::from_millis(300)).await;
                        open.store(false, Ordering::SeqCst);
                        let _ = events
                            .send(RemoteEvent::TurnComplete {
                                turn_id: id,
                                status: Some("completed".to_string()),
                            })
                            .await;
                    });
                }
            })
        };
        (task, log, overlaps)
    }

    #[tokio::test(start_paused = true)]
    async fn test_assessment_runs_to_completion() {
        let h = spawn_bridge(Arc::new(SlowScorer(Duration::from_secs(9))));
        let Harness {
            client_in,
            remote_events,
            remote_cmds,
            mut client_out,
            bridge,
            ..
        } = h;

        // A conversation turn calls the tool and is still open.
        let open = Arc::new(AtomicBool::new(true));
        let (fake, log, overlaps) = spawn_fake_remote(remote_cmds, remote_events.clone(), open.clone(), None);
        remote_events
            .send(RemoteEvent::UserTranscript {
                text: "I has a dog".to_string(),
            })
            .await
            .unwrap();
        remote_events
            .send(RemoteEvent::TurnCreated {
                turn_id: "resp_0".to_string(),
            })
            .await
            .unwrap();
        remote_events
            .send(RemoteEvent::ToolCall {
                call_id: Some("call_1".to_string()),
                name: TRIGGER_ASSESSMENT_TOOL.to_string(),
                arguments: r#"{"reason":"tense errors"}"#.to_string(),
            })
            .await
            .unwrap();
        // Duplicate trigger is ignored.
        remote_events
            .send(RemoteEvent::ToolCall {
                call_id: Some("call_2".to_string()),
                name: TRIGGER_ASSESSMENT_TOOL.to_string(),
                arguments: "{}".to_string(),
            })
            .await
            .unwrap();
        // User audio after the trigger is dropped.
        client_in
            .send(ClientInput::Utterance(Bytes::from_static(&[9, 9])))
            .await
            .unwrap();

        tokio::time::sleep(Duration::from_millis(500)).await;
        open.store(false, Ordering::SeqCst);
        remote_events
            .send(RemoteEvent::TurnComplete {
                turn_id: Some("resp_0".to_string()),
                status: Some("completed".to_string()),
            })
            .await
            .unwrap();

        let exit = tokio::time::timeout(Duration::from_secs(120), bridge)
            .await
            .expect("bridge did not finish")
            .unwrap();
        assert_eq!(exit, BridgeExit::AssessmentComplete);
        fake.abort();

        let commands = log.lock().clone();
        let start_turns: Vec<_> = commands
            .iter()
            .filter_map(|c| match c {
                RemoteCommand::StartTurn { instructions } => Some(instructions.clone()),
                _ => None,
            })
            .collect();
        assert_eq!(start_turns.len(), 3, "ack, summary and goodbye");
        assert!(start_turns.iter().all(Option::is_some));
        assert_eq!(overlaps.load(Ordering::SeqCst), 0);
        assert!(
            !commands
                .iter()
                .any(|c| matches!(c, RemoteCommand::AppendAudio(_)))
        );
        let clears = commands
            .iter()
            .filter(|c| **c == RemoteCommand::ClearInput)
            .count();
        assert!(clears >= 3, "trigger clear plus heartbeats, got {clears}");
        let outputs: Vec<_> = commands
            .iter()
            .filter_map(|c| match c {
                RemoteCommand::ToolOutput { call_id, .. } => Some(call_id.as_str()),
                _ => None,
            })
            .collect();
        assert_eq!(outputs, vec!["call_1", "call_2"]);

        let mut messages = Vec::new();
        while let Ok(message) = client_out.try_recv() {
            messages.push(message);
        }
        assert!(
            messages
                .iter()
                .any(|m| matches!(m, ServerMessage::AssessmentTriggered { .. }))
        );
        assert!(
            messages
                .iter()
                .filter(|m| matches!(m, ServerMessage::Keepalive { .. }))
                .count()
                >= 2
        );
        let complete = messages
            .iter()
            .position(|m| matches!(m, ServerMessage::AssessmentComplete { .. }))
            .expect("no report sent");
        let ended = messages
            .iter()
            .position(|m| matches!(m, ServerMessage::SessionEnded { .. }))
            .expect("no session end");
        assert!(complete < ended);
        assert_eq!(ended, messages.len() - 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_shutdown_stops_running_assessment() {
        let h = spawn_bridge(Arc::new(SlowScorer(Duration::from_secs(600))));
        let Harness {
            remote_events,
            remote_cmds,
            shutdown,
            bridge,
            ..
        } = h;
        let open = Arc::new(AtomicBool::new(false));
        let (fake, _log, _) = spawn_fake_remote(remote_cmds, remote_events.clone(), open, None);

        remote_events
            .send(RemoteEvent::ToolCall {
                call_id: None,
                name: TRIGGER_ASSESSMENT_TOOL.to_string(),
                arguments: "{}".to_string(),
            })
            .await
            .unwrap();
        tokio::time::sleep(Duration::from_secs(20)).await;

        shutdown.cancel();
        let exit = tokio::time::timeout(Duration::from_secs(5), bridge)
            .await
            .expect("bridge hung on shutdown")
            .unwrap();
        assert_eq!(exit, BridgeExit::Shutdown);
        fake.abort();
    }
}
