//! Assessment delivery state machine.
//!
//! Once the conversation hits its ceiling the session runs a fixed sequence of
//! turns: a short acknowledgement, report generation, a spoken summary and a
//! goodbye. [`AssessmentStateMachine`] owns the phase of that sequence and
//! rejects any transition that is not an allowed edge. Phase changes are
//! published on a `watch` channel so other tasks can gate on them without
//! touching the machine.

use serde::Serialize;
use std::fmt;
use thiserror::Error;
use tokio::sync::watch;
use tracing::{debug, info, warn};

use crate::report::AssessmentReport;
use crate::tracker::{TurnId, TurnPurpose};

/// Phases of assessment delivery, in the only order they can occur.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum AssessmentPhase {
    Inactive,
    Triggered,
    AckGenerating,
    AckSpeaking,
    ReportGenerating,
    SummarySending,
    SummarySpeaking,
    GoodbyeSending,
    GoodbyeSpeaking,
    Complete,
}

impl AssessmentPhase {
    pub fn as_str(&self) -> &'static str {
        match self {
            AssessmentPhase::Inactive => "INACTIVE",
            AssessmentPhase::Triggered => "TRIGGERED",
            AssessmentPhase::AckGenerating => "ACK_GENERATING",
            AssessmentPhase::AckSpeaking => "ACK_SPEAKING",
            AssessmentPhase::ReportGenerating => "REPORT_GENERATING",
            AssessmentPhase::SummarySending => "SUMMARY_SENDING",
            AssessmentPhase::SummarySpeaking => "SUMMARY_SPEAKING",
            AssessmentPhase::GoodbyeSending => "GOODBYE_SENDING",
            AssessmentPhase::GoodbyeSpeaking => "GOODBYE_SPEAKING",
            AssessmentPhase::Complete => "COMPLETE",
        }
    }

    /// True for every phase in which user audio must not reach the remote side.
    pub fn blocks_user_input(&self) -> bool {
        *self != AssessmentPhase::Inactive
    }

    pub fn is_terminal(&self) -> bool {
        *self == AssessmentPhase::Complete
    }

    /// Phase entered when a turn of `purpose` is created.
    fn sending_phase(purpose: TurnPurpose) -> Option<Self> {
        match purpose {
            TurnPurpose::Acknowledgment => Some(AssessmentPhase::AckGenerating),
            TurnPurpose::Summary => Some(AssessmentPhase::SummarySending),
            TurnPurpose::Goodbye => Some(AssessmentPhase::GoodbyeSending),
            TurnPurpose::Conversation => None,
        }
    }

    /// Phase entered when a turn of `purpose` starts producing audio.
    fn speaking_phase(purpose: TurnPurpose) -> Option<Self> {
        match purpose {
            TurnPurpose::Acknowledgment => Some(AssessmentPhase::AckSpeaking),
            TurnPurpose::Summary => Some(AssessmentPhase::SummarySpeaking),
            TurnPurpose::Goodbye => Some(AssessmentPhase::GoodbyeSpeaking),
            TurnPurpose::Conversation => None,
        }
    }
}

impl fmt::Display for AssessmentPhase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
#[error("invalid assessment transition {from} -> {to}")]
pub struct TransitionError {
    pub from: AssessmentPhase,
    pub to: AssessmentPhase,
}

/// Whether `from -> to` is an allowed edge.
fn edge_allowed(from: AssessmentPhase, to: AssessmentPhase, failed: bool) -> bool {
    use AssessmentPhase::*;
    matches!(
        (from, to),
        (Inactive, Triggered)
            | (Triggered, AckGenerating)
            | (AckGenerating, AckSpeaking)
            | (AckSpeaking, ReportGenerating)
            | (ReportGenerating, SummarySending)
            | (SummarySending, SummarySpeaking)
            | (SummarySpeaking, GoodbyeSending)
            | (GoodbyeSending, GoodbyeSpeaking)
            | (GoodbyeSpeaking, Complete)
            // Turns that never produced audio.
            | (Triggered, ReportGenerating)
            | (AckGenerating, ReportGenerating)
            | (SummarySending, GoodbyeSending)
            | (GoodbyeSending, Complete)
    ) || (failed && matches!((from, to), (SummarySending, Complete) | (SummarySpeaking, Complete)))
}

/// Phase, active turn and results of one assessment delivery.
#[derive(Debug)]
pub struct AssessmentStateMachine {
    phase: AssessmentPhase,
    publisher: Option<watch::Sender<AssessmentPhase>>,
    reason: Option<String>,
    active_turn: Option<(TurnId, TurnPurpose)>,
    verbal_summary: Option<String>,
    report: Option<AssessmentReport>,
    failed: bool,
}

impl Default for AssessmentStateMachine {
    fn default() -> Self {
        Self::new()
    }
}

impl AssessmentStateMachine {
    pub fn new() -> Self {
        Self {
            phase: AssessmentPhase::Inactive,
            publisher: None,
            reason: None,
            active_turn: None,
            verbal_summary: None,
            report: None,
            failed: false,
        }
    }

    /// Creates a machine that mirrors every phase change into `publisher`.
    pub fn with_publisher(publisher: watch::Sender<AssessmentPhase>) -> Self {
        publisher.send_replace(AssessmentPhase::Inactive);
        Self {
            publisher: Some(publisher),
            ..Self::new()
        }
    }

    pub fn phase(&self) -> AssessmentPhase {
        self.phase
    }

    pub fn reason(&self) -> Option<&str> {
        self.reason.as_deref()
    }

    pub fn active_turn(&self) -> Option<&str> {
        self.active_turn.as_ref().map(|(id, _)| id.as_str())
    }

    pub fn verbal_summary(&self) -> Option<&str> {
        self.verbal_summary.as_deref()
    }

    pub fn report(&self) -> Option<&AssessmentReport> {
        self.report.as_ref()
    }

    pub fn is_failed(&self) -> bool {
        self.failed
    }

    /// Starts delivery. Only the first call has any effect.
    pub fn trigger(&mut self, reason: impl Into<String>) -> bool {
        if self.phase != AssessmentPhase::Inactive {
            warn!(phase = %self.phase, "Assessment already triggered");
            return false;
        }
        let reason = reason.into();
        info!(%reason, "Assessment triggered");
        self.reason = Some(reason);
        self.set_phase(AssessmentPhase::Triggered);
        true
    }

    /// Moves to `to` if `phase -> to` is an allowed edge.
    pub fn transition(&mut self, to: AssessmentPhase) -> Result<(), TransitionError> {
        if !edge_allowed(self.phase, to, self.failed) {
            warn!(from = %self.phase, %to, "Rejected assessment transition");
            return Err(TransitionError {
                from: self.phase,
                to,
            });
        }
        self.set_phase(to);
        Ok(())
    }

    /// Records the remote turn created for `purpose` and enters its sending phase.
    pub fn turn_created(
        &mut self,
        purpose: TurnPurpose,
        turn_id: impl Into<TurnId>,
    ) -> Result<(), TransitionError> {
        let Some(to) = AssessmentPhase::sending_phase(purpose) else {
            return Err(TransitionError {
                from: self.phase,
                to: self.phase,
            });
        };
        self.transition(to)?;
        self.active_turn = Some((turn_id.into(), purpose));
        Ok(())
    }

    /// Enters the speaking phase of the active turn once it produces audio.
    /// Events for any other turn are ignored.
    pub fn audio_started(&mut self, turn_id: &str) -> Result<(), TransitionError> {
        let Some((active, purpose)) = &self.active_turn else {
            debug!(%turn_id, "Audio start with no active assessment turn");
            return Ok(());
        };
        if active != turn_id {
            debug!(%turn_id, %active, "Audio start for a stale turn");
            return Ok(());
        }
        match AssessmentPhase::speaking_phase(*purpose) {
            Some(to) => self.transition(to),
            None => Ok(()),
        }
    }

    /// Stores the scoring result and its spoken rendering.
    pub fn set_report(&mut self, report: AssessmentReport, verbal_summary: String) {
        self.report = Some(report);
        self.verbal_summary = Some(verbal_summary);
    }

    /// Marks scoring as failed; `text` is what gets spoken instead of a summary.
    pub fn mark_failed(&mut self, text: impl Into<String>) {
        self.failed = true;
        self.verbal_summary = Some(text.into());
    }

    /// Forces the machine to COMPLETE from any started phase. Used when a
    /// required turn could not be created or the session is shutting down.
    pub fn abandon(&mut self) {
        if self.phase == AssessmentPhase::Inactive || self.phase.is_terminal() {
            return;
        }
        warn!(phase = %self.phase, "Assessment abandoned");
        self.set_phase(AssessmentPhase::Complete);
    }

    fn set_phase(&mut self, to: AssessmentPhase) {
        debug!(from = %self.phase, %to, "Assessment phase change");
        self.phase = to;
        if to == AssessmentPhase::Complete {
            self.active_turn = None;
        }
        if let Some(publisher) = &self.publisher {
            publisher.send_replace(to);
        }
    }
}
