//! Per-turn lifecycle tracking.
//!
//! Every assistant turn gets a [`ResponseTracker`] keyed by its provider id.
//! The tracker records the furthest lifecycle phase the turn has reached and
//! how many audio bytes it produced. Waiters subscribe to a `watch` channel,
//! so a completion that fires before anybody waits is never lost.
//!
//! [`TurnTracker`] also owns the session's in-flight latch: at most one turn
//! may be in flight on a session at any time.

use parking_lot::Mutex;
use serde::Serialize;
use std::collections::HashMap;
use std::time::Duration;
use tokio::sync::watch;
use tracing::{debug, warn};

/// Identifier the realtime provider assigned to a turn.
pub type TurnId = String;

/// Lifecycle of a single turn. Phases only move forward.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum TurnPhase {
    Created,
    AudioStarted,
    AudioComplete,
    TurnComplete,
}

/// Why a turn was requested.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum TurnPurpose {
    /// Regular reply to the user.
    Conversation,
    /// Short spoken acknowledgement while the report is generated.
    Acknowledgment,
    /// Verbal summary of the assessment report.
    Summary,
    /// Closing message.
    Goodbye,
}

/// Lifecycle record of one turn.
#[derive(Debug)]
pub struct ResponseTracker {
    turn_id: TurnId,
    purpose: TurnPurpose,
    phase: watch::Sender<TurnPhase>,
    audio_started: bool,
    audio_bytes: u64,
}

impl ResponseTracker {
    fn new(turn_id: TurnId, purpose: TurnPurpose) -> Self {
        let (phase, _) = watch::channel(TurnPhase::Created);
        Self {
            turn_id,
            purpose,
            phase,
            audio_started: false,
            audio_bytes: 0,
        }
    }

    /// Moves the turn to `target` if it has not already reached it.
    fn advance(&self, target: TurnPhase) -> bool {
        self.phase.send_if_modified(|phase| {
            if *phase < target {
                *phase = target;
                true
            } else {
                false
            }
        })
    }

    fn snapshot(&self) -> TurnSnapshot {
        TurnSnapshot {
            turn_id: self.turn_id.clone(),
            purpose: self.purpose,
            phase: *self.phase.borrow(),
            audio_started: self.audio_started,
            audio_bytes: self.audio_bytes,
        }
    }
}

/// Point-in-time copy of a [`ResponseTracker`].
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct TurnSnapshot {
    pub turn_id: TurnId,
    pub purpose: TurnPurpose,
    pub phase: TurnPhase,
    pub audio_started: bool,
    pub audio_bytes: u64,
}

#[derive(Debug, Default)]
struct Turns {
    by_id: HashMap<TurnId, ResponseTracker>,
    current: Option<TurnId>,
}

/// Registry of live turns plus the session's in-flight latch.
#[derive(Debug)]
pub struct TurnTracker {
    turns: Mutex<Turns>,
    in_flight: watch::Sender<bool>,
}

impl Default for TurnTracker {
    fn default() -> Self {
        Self::new()
    }
}

impl TurnTracker {
    pub fn new() -> Self {
        let (in_flight, _) = watch::channel(false);
        Self {
            turns: Mutex::new(Turns::default()),
            in_flight,
        }
    }

    /// Registers a freshly created turn and makes it the current turn.
    ///
    /// Returns `false` if a turn with the same id is already tracked; the
    /// existing record is left untouched.
    pub fn register_turn(&self, turn_id: impl Into<TurnId>, purpose: TurnPurpose) -> bool {
        let turn_id = turn_id.into();
        let mut turns = self.turns.lock();
        if turns.by_id.contains_key(&turn_id) {
            warn!(%turn_id, "Duplicate turn creation ignored");
            return false;
        }
        debug!(%turn_id, ?purpose, "Turn registered");
        turns
            .by_id
            .insert(turn_id.clone(), ResponseTracker::new(turn_id.clone(), purpose));
        turns.current = Some(turn_id);
        true
    }

    /// Id of the most recently created turn.
    pub fn current_turn(&self) -> Option<TurnId> {
        self.turns.lock().current.clone()
    }

    /// The current turn, if it has not finished yet.
    pub fn active_turn(&self) -> Option<TurnId> {
        let turns = self.turns.lock();
        let current = turns.current.as_ref()?;
        let tracker = turns.by_id.get(current)?;
        (*tracker.phase.borrow() < TurnPhase::TurnComplete).then(|| current.clone())
    }

    /// Resolves the turn an event belongs to, falling back to the current turn
    /// when the provider omitted the id.
    pub fn resolve(&self, turn_id: Option<&str>) -> Option<TurnId> {
        match turn_id {
            Some(id) => Some(id.to_string()),
            None => self.current_turn(),
        }
    }

    pub fn purpose(&self, turn_id: &str) -> Option<TurnPurpose> {
        self.turns.lock().by_id.get(turn_id).map(|t| t.purpose)
    }

    pub fn phase(&self, turn_id: &str) -> Option<TurnPhase> {
        self.turns.lock().by_id.get(turn_id).map(|t| *t.phase.borrow())
    }

    pub fn snapshot(&self, turn_id: &str) -> Option<TurnSnapshot> {
        self.turns.lock().by_id.get(turn_id).map(ResponseTracker::snapshot)
    }

    pub fn audio_bytes(&self, turn_id: &str) -> u64 {
        self.turns
            .lock()
            .by_id
            .get(turn_id)
            .map_or(0, |t| t.audio_bytes)
    }

    pub fn mark_audio_started(&self, turn_id: &str) -> bool {
        let mut turns = self.turns.lock();
        let Some(tracker) = turns.by_id.get_mut(turn_id) else {
            debug!(%turn_id, "Audio start for unknown turn");
            return false;
        };
        tracker.audio_started = true;
        tracker.advance(TurnPhase::AudioStarted)
    }

    /// Adds `bytes` to the turn's audio total, marking audio as started on the
    /// first chunk. Audio arriving after content-complete is still counted.
    pub fn track_audio_bytes(&self, turn_id: &str, bytes: u64) -> bool {
        let mut turns = self.turns.lock();
        let Some(tracker) = turns.by_id.get_mut(turn_id) else {
            debug!(%turn_id, bytes, "Audio for unknown turn");
            return false;
        };
        tracker.audio_bytes += bytes;
        if !tracker.audio_started {
            tracker.audio_started = true;
            tracker.advance(TurnPhase::AudioStarted);
        }
        true
    }

    /// Marks the turn's audio as fully delivered. Idempotent: only the first
    /// call returns `true`.
    pub fn mark_audio_complete(&self, turn_id: &str) -> bool {
        let turns = self.turns.lock();
        match turns.by_id.get(turn_id) {
            Some(tracker) => tracker.advance(TurnPhase::AudioComplete),
            None => {
                debug!(%turn_id, "Audio completion for unknown turn");
                false
            }
        }
    }

    /// Marks the turn as finished and releases the in-flight latch.
    ///
    /// A finished turn can produce no more audio, so waiters on audio
    /// completion are released too.
    pub fn mark_turn_complete(&self, turn_id: &str) -> bool {
        let advanced = {
            let turns = self.turns.lock();
            turns
                .by_id
                .get(turn_id)
                .is_some_and(|tracker| tracker.advance(TurnPhase::TurnComplete))
        };
        self.release_latch();
        advanced
    }

    /// Subscribes to phase changes of a turn.
    pub fn subscribe(&self, turn_id: &str) -> Option<watch::Receiver<TurnPhase>> {
        self.turns.lock().by_id.get(turn_id).map(|t| t.phase.subscribe())
    }

    /// Waits until the turn reaches at least `target`.
    ///
    /// Returns immediately if it already has. Returns `false` on timeout or if
    /// the turn is unknown or dropped before reaching `target`.
    pub async fn wait_for_phase(&self, turn_id: &str, target: TurnPhase, timeout: Duration) -> bool {
        let Some(mut rx) = self.subscribe(turn_id) else {
            warn!(%turn_id, "Waiting on unknown turn");
            return false;
        };
        match tokio::time::timeout(timeout, rx.wait_for(|phase| *phase >= target)).await {
            Ok(Ok(_)) => true,
            Ok(Err(_)) => {
                warn!(%turn_id, ?target, "Turn released before reaching phase");
                false
            }
            Err(_) => {
                warn!(%turn_id, ?target, ?timeout, "Timed out waiting for turn phase");
                false
            }
        }
    }

    pub async fn wait_for_audio_complete(&self, turn_id: &str, timeout: Duration) -> bool {
        self.wait_for_phase(turn_id, TurnPhase::AudioComplete, timeout)
            .await
    }

    /// Drops a turn's record and returns its final state.
    pub fn release(&self, turn_id: &str) -> Option<TurnSnapshot> {
        let mut turns = self.turns.lock();
        let tracker = turns.by_id.remove(turn_id)?;
        if turns.current.as_deref() == Some(turn_id) {
            turns.current = None;
        }
        Some(tracker.snapshot())
    }

    pub fn len(&self) -> usize {
        self.turns.lock().by_id.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Atomically claims the in-flight latch. Returns `false` if a turn is
    /// already in flight.
    pub fn try_acquire_latch(&self) -> bool {
        self.in_flight.send_if_modified(|busy| {
            if *busy {
                false
            } else {
                *busy = true;
                true
            }
        })
    }

    /// Sets the latch regardless of its current state. Used when the provider
    /// starts a turn nobody asked for.
    pub fn force_latch(&self) {
        self.in_flight.send_replace(true);
    }

    pub fn release_latch(&self) {
        self.in_flight.send_if_modified(|busy| std::mem::replace(busy, false));
    }

    pub fn is_in_flight(&self) -> bool {
        *self.in_flight.borrow()
    }

    /// Waits until no turn is in flight. Returns `false` on timeout.
    pub async fn wait_until_idle(&self, timeout: Duration) -> bool {
        let mut rx = self.in_flight.subscribe();
        tokio::time::timeout(timeout, rx.wait_for(|busy| !*busy))
            .await
            .is_ok_and(|r| r.is_ok())
    }
}
