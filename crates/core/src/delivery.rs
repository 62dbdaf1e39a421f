//! Sequencing of the post-ceiling assessment turns.
//!
//! [`AssessmentDelivery`] runs as its own task. It never talks to the remote
//! endpoint directly: turns are requested through a [`DeliveryPort`], which
//! resolves once the remote side has created the turn. Audio progress is
//! observed through the shared [`TurnTracker`]. Every step is bounded by a
//! timeout so a silent remote endpoint can delay the session but never hang it.

use async_trait::async_trait;
use serde::Serialize;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tokio_util::task::AbortOnDropHandle;
use tracing::{debug, error, info, warn};

use crate::assessment::{AssessmentPhase, AssessmentStateMachine};
use crate::audio::{AudioFormat, drain_delay, estimate_speech_duration};
use crate::keepalive::{Heartbeat, KeepaliveSupervisor};
use crate::report::AssessmentReport;
use crate::scoring::{ScoringError, ScoringRequest, ScoringService, Utterance};
use crate::tracker::{TurnId, TurnPhase, TurnPurpose, TurnTracker};

/// Spoken while the report is generated.
pub const ACKNOWLEDGMENT_TEXT: &str = "Thank you. Let me prepare your assessment. This will take just a moment.";
/// Spoken instead of a summary when scoring fails.
pub const SCORING_ERROR_TEXT: &str = "I apologize, there was an error generating your assessment. Please try again later.";
pub const GOODBYE_TEXT: &str = "Thank you for completing the interview! Keep practicing, and you'll continue to improve. Goodbye!";

const LATCH_RETRY_DELAY: Duration = Duration::from_millis(50);

/// Wraps `text` in the instructions for a verbatim spoken turn.
pub fn speak_instructions(text: &str) -> String {
    format!(
        "Speak this in natural American English pronunciation, exactly as written: \"{}\"",
        text
    )
}

/// Timing knobs of the delivery sequence.
#[derive(Debug, Clone)]
pub struct DeliveryConfig {
    pub keepalive_interval: Duration,
    pub drain_floor: Duration,
    pub drain_safety_margin: Duration,
    pub ack_audio_timeout: Duration,
    pub summary_audio_timeout: Duration,
    pub goodbye_audio_timeout: Duration,
    /// Upper bound on waiting for the latch and for the remote side to create
    /// a requested turn.
    pub turn_request_timeout: Duration,
    pub audio_format: AudioFormat,
}

impl Default for DeliveryConfig {
    fn default() -> Self {
        Self {
            keepalive_interval: Duration::from_secs(3),
            drain_floor: Duration::ZERO,
            drain_safety_margin: Duration::from_secs(3),
            ack_audio_timeout: Duration::from_secs(10),
            summary_audio_timeout: Duration::from_secs(20),
            goodbye_audio_timeout: Duration::from_secs(10),
            turn_request_timeout: Duration::from_secs(10),
            audio_format: AudioFormat::default(),
        }
    }
}

impl DeliveryConfig {
    fn audio_timeout(&self, purpose: TurnPurpose) -> Duration {
        match purpose {
            TurnPurpose::Acknowledgment => self.ack_audio_timeout,
            TurnPurpose::Summary => self.summary_audio_timeout,
            TurnPurpose::Goodbye | TurnPurpose::Conversation => self.goodbye_audio_timeout,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum TurnRequestError {
    #[error("another turn is in flight")]
    Busy,
    #[error("remote endpoint did not create the turn in time")]
    NotCreated,
    #[error("remote endpoint rejected the turn: {0}")]
    Rejected(String),
    #[error("session closed")]
    Closed,
}

/// Progress notices for the user-facing channel.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub enum DeliveryNotice {
    Triggered { message: String },
    Progress { message: String, progress: f32 },
    ReportReady {
        report: AssessmentReport,
        summary: String,
    },
    Failed { message: String },
}

/// The bridge side of delivery.
#[async_trait]
pub trait DeliveryPort: Send + Sync {
    /// Requests a new turn and resolves with its id once the remote endpoint
    /// has created it. Fails with [`TurnRequestError::Busy`] if another turn
    /// holds the in-flight latch.
    async fn request_turn(
        &self,
        purpose: TurnPurpose,
        instructions: String,
    ) -> Result<TurnId, TurnRequestError>;

    async fn notify(&self, notice: DeliveryNotice);
}

/// What a finished delivery produced.
#[derive(Debug, Clone)]
pub struct DeliveryOutcome {
    pub phase: AssessmentPhase,
    pub report: Option<AssessmentReport>,
    pub verbal_summary: Option<String>,
    pub failed: bool,
    pub cancelled: bool,
    /// Turns that were actually created during delivery.
    pub turns: Vec<(TurnPurpose, TurnId)>,
}

/// One run of the assessment sequence.
pub struct AssessmentDelivery {
    machine: AssessmentStateMachine,
    reason: String,
    transcript: Vec<Utterance>,
    tracker: Arc<TurnTracker>,
    port: Arc<dyn DeliveryPort>,
    heartbeat: Arc<dyn Heartbeat>,
    scorer: Arc<dyn ScoringService>,
    config: DeliveryConfig,
    shutdown: CancellationToken,
    turns: Vec<(TurnPurpose, TurnId)>,
}

impl AssessmentDelivery {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        machine: AssessmentStateMachine,
        reason: impl Into<String>,
        transcript: Vec<Utterance>,
        tracker: Arc<TurnTracker>,
        port: Arc<dyn DeliveryPort>,
        heartbeat: Arc<dyn Heartbeat>,
        scorer: Arc<dyn ScoringService>,
        config: DeliveryConfig,
        shutdown: CancellationToken,
    ) -> Self {
        Self {
            machine,
            reason: reason.into(),
            transcript,
            tracker,
            port,
            heartbeat,
            scorer,
            config,
            shutdown,
            turns: Vec::new(),
        }
    }

    /// Runs the whole sequence to COMPLETE, or until the shutdown token fires.
    pub async fn run(mut self) -> DeliveryOutcome {
        let shutdown = self.shutdown.clone();
        let cancelled = tokio::select! {
            biased;
            _ = shutdown.cancelled() => true,
            _ = self.sequence() => false,
        };
        if cancelled {
            info!(phase = %self.machine.phase(), "Assessment delivery cancelled");
            self.machine.abandon();
        }
        DeliveryOutcome {
            phase: self.machine.phase(),
            report: self.machine.report().cloned(),
            verbal_summary: self.machine.verbal_summary().map(str::to_string),
            failed: self.machine.is_failed(),
            cancelled,
            turns: self.turns,
        }
    }

    async fn sequence(&mut self) {
        // The bridge may trigger before spawning so input closes immediately.
        if self.machine.phase() == AssessmentPhase::Inactive {
            self.machine.trigger(self.reason.clone());
        }
        if self.machine.phase() != AssessmentPhase::Triggered {
            warn!(phase = %self.machine.phase(), "Assessment already under way");
            return;
        }
        self.port
            .notify(DeliveryNotice::Triggered {
                message: "Generating your assessment...".to_string(),
            })
            .await;

        // Acknowledgement. Losing it is not fatal.
        match self
            .speak(TurnPurpose::Acknowledgment, speak_instructions(ACKNOWLEDGMENT_TEXT))
            .await
        {
            Ok(turn_id) => {
                self.tracker.release(&turn_id);
            }
            Err(e) => warn!("Acknowledgment turn skipped: {}", e),
        }
        if let Err(e) = self.machine.transition(AssessmentPhase::ReportGenerating) {
            error!("Cannot start report generation: {}", e);
            self.machine.abandon();
            return;
        }

        self.port
            .notify(DeliveryNotice::Progress {
                message: "Analyzing conversation...".to_string(),
                progress: 0.3,
            })
            .await;

        let summary_text = match self.score().await {
            Ok(report) => {
                let summary = report.verbal_summary();
                self.port
                    .notify(DeliveryNotice::Progress {
                        message: "Generating summary...".to_string(),
                        progress: 0.7,
                    })
                    .await;
                self.port
                    .notify(DeliveryNotice::ReportReady {
                        report: report.clone(),
                        summary: summary.clone(),
                    })
                    .await;
                self.machine.set_report(report, summary.clone());
                summary
            }
            Err(e) => {
                error!("Scoring failed: {}", e);
                self.machine.mark_failed(SCORING_ERROR_TEXT);
                self.port
                    .notify(DeliveryNotice::Failed {
                        message: e.to_string(),
                    })
                    .await;
                SCORING_ERROR_TEXT.to_string()
            }
        };

        if let Err(e) = self.speak_and_drain(TurnPurpose::Summary, &summary_text).await {
            error!("Summary turn failed: {}", e);
            self.machine.abandon();
            return;
        }

        if self.machine.is_failed() {
            self.finish();
            return;
        }

        if let Err(e) = self.speak_and_drain(TurnPurpose::Goodbye, GOODBYE_TEXT).await {
            warn!("Goodbye turn failed: {}", e);
            self.machine.abandon();
            return;
        }
        self.finish();
    }

    fn finish(&mut self) {
        if self.machine.transition(AssessmentPhase::Complete).is_err() {
            self.machine.abandon();
        }
        info!(failed = self.machine.is_failed(), "Assessment delivery complete");
    }

    /// Runs the scorer as a separate task with the keepalive running, so the
    /// caller can be cancelled at any point without leaking either.
    async fn score(&self) -> Result<AssessmentReport, ScoringError> {
        let request = ScoringRequest {
            transcript: self.transcript.clone(),
            reason: self.reason.clone(),
        };
        let scorer = self.scorer.clone();
        let scoring = AbortOnDropHandle::new(tokio::spawn(async move { scorer.score(request).await }));
        let keepalive = KeepaliveSupervisor::start(
            self.heartbeat.clone(),
            self.config.keepalive_interval,
            self.shutdown.child_token(),
        );

        let started = Instant::now();
        let result = scoring.await;
        let beats = keepalive.stop().await;
        debug!(elapsed = ?started.elapsed(), beats, "Scoring finished");

        match result {
            Ok(result) => result,
            Err(e) => Err(ScoringError::Aborted(e.to_string())),
        }
    }

    /// Requests a spoken turn, waits for its audio, then waits out the drain
    /// delay so the client has played everything before the next turn.
    async fn speak_and_drain(&mut self, purpose: TurnPurpose, text: &str) -> Result<(), TurnRequestError> {
        let turn_id = self.speak(purpose, speak_instructions(text)).await?;
        let delay = self.drain_delay_for(&turn_id, text);
        debug!(%turn_id, ?purpose, ?delay, "Draining playback");
        tokio::time::sleep(delay).await;
        self.tracker.release(&turn_id);
        Ok(())
    }

    /// Requests a turn, records it in the machine and waits until its audio
    /// has been fully generated or the purpose's timeout elapses.
    async fn speak(&mut self, purpose: TurnPurpose, instructions: String) -> Result<TurnId, TurnRequestError> {
        let turn_id = self.request_turn(purpose, instructions).await?;
        self.turns.push((purpose, turn_id.clone()));
        if let Err(e) = self.machine.turn_created(purpose, turn_id.clone()) {
            warn!(%turn_id, "Turn does not fit the assessment sequence: {}", e);
        }

        let deadline = Instant::now() + self.config.audio_timeout(purpose);
        let started = self
            .tracker
            .wait_for_phase(&turn_id, TurnPhase::AudioStarted, self.config.audio_timeout(purpose))
            .await;
        if started
            && self
                .tracker
                .snapshot(&turn_id)
                .is_some_and(|s| s.audio_started)
        {
            if let Err(e) = self.machine.audio_started(&turn_id) {
                warn!(%turn_id, "{}", e);
            }
        }

        let remaining = deadline.saturating_duration_since(Instant::now());
        if !self.tracker.wait_for_audio_complete(&turn_id, remaining).await {
            warn!(%turn_id, ?purpose, "Audio did not complete in time, proceeding");
        }
        Ok(turn_id)
    }

    /// Requests a turn once the latch is free. Busy latches and rejected
    /// requests are retried until `turn_request_timeout` runs out.
    async fn request_turn(&self, purpose: TurnPurpose, instructions: String) -> Result<TurnId, TurnRequestError> {
        let deadline = Instant::now() + self.config.turn_request_timeout;
        loop {
            let remaining = deadline.saturating_duration_since(Instant::now());
            if !self.tracker.wait_until_idle(remaining).await {
                return Err(TurnRequestError::Busy);
            }
            match self.port.request_turn(purpose, instructions.clone()).await {
                Err(TurnRequestError::Busy) if Instant::now() < deadline => {
                    debug!(?purpose, "Latch busy, retrying");
                    tokio::time::sleep(LATCH_RETRY_DELAY).await;
                }
                Err(TurnRequestError::Rejected(reason)) if Instant::now() < deadline => {
                    warn!(?purpose, %reason, "Turn request rejected, retrying");
                    tokio::time::sleep(LATCH_RETRY_DELAY).await;
                }
                result => return result,
            }
        }
    }

    fn drain_delay_for(&self, turn_id: &str, text: &str) -> Duration {
        let bytes = self.tracker.audio_bytes(turn_id);
        if bytes > 0 {
            drain_delay(
                bytes,
                &self.config.audio_format,
                self.config.drain_floor,
                self.config.drain_safety_margin,
            )
        } else {
            estimate_speech_duration(text, self.config.drain_safety_margin)
        }
    }
}
