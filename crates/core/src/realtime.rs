//! Provider-agnostic view of a realtime voice session.
//!
//! Wire adapters translate their provider's events into [`RemoteEvent`] and
//! execute [`RemoteCommand`]s. Everything above the adapter only sees these
//! types.

use bytes::Bytes;

use crate::tracker::TurnId;

/// Events a realtime provider emits back to the bridge.
///
/// Turn ids are optional on every event that follows `TurnCreated`; some
/// providers omit them, and the bridge falls back to the most recently
/// created turn.
#[derive(Debug, Clone, PartialEq)]
pub enum RemoteEvent {
    /// The provider accepted the session configuration.
    SessionReady,
    /// A new assistant turn (response) was created.
    TurnCreated { turn_id: TurnId },
    /// A chunk of synthesized PCM audio.
    AudioChunk {
        turn_id: Option<TurnId>,
        data: Bytes,
    },
    /// The provider has sent every audio byte for the turn.
    AudioContentComplete { turn_id: Option<TurnId> },
    /// Incremental transcript of the assistant's speech.
    TranscriptDelta {
        turn_id: Option<TurnId>,
        delta: String,
    },
    /// Final transcript of the assistant's speech. Also marks the end of audio.
    TranscriptDone {
        turn_id: Option<TurnId>,
        transcript: Option<String>,
    },
    /// The turn finished, successfully or not.
    TurnComplete {
        turn_id: Option<TurnId>,
        status: Option<String>,
    },
    /// Transcription of the user's committed audio.
    UserTranscript { text: String },
    /// The model asked to invoke a tool.
    ToolCall {
        call_id: Option<String>,
        name: String,
        arguments: String,
    },
    /// An error reported by the provider.
    Error {
        message: String,
        code: Option<String>,
    },
    /// The connection was closed.
    Closed,
}

/// Operations the bridge asks a realtime provider to perform.
#[derive(Debug, Clone, PartialEq)]
pub enum RemoteCommand {
    /// Create a new assistant turn. `instructions` overrides the session
    /// prompt for this turn only.
    StartTurn { instructions: Option<String> },
    /// Create a turn that answers in text only, without audio.
    StartTextTurn { instructions: String },
    /// Append microphone audio to the provider's input buffer.
    AppendAudio(Bytes),
    /// Commit the input buffer as a user message.
    CommitAudio,
    /// Discard whatever sits in the input buffer.
    ClearInput,
    /// Cancel the turn that is currently being generated.
    CancelTurn,
    /// Return the result of a tool call.
    ToolOutput { call_id: String, output: String },
}

/// Session parameters shared by every provider.
#[derive(Debug, Clone)]
pub struct SessionSettings {
    pub instructions: String,
    pub voice: String,
    pub transcription_model: String,
    pub temperature: f32,
}

impl Default for SessionSettings {
    fn default() -> Self {
        Self {
            instructions: String::new(),
            voice: "alloy".to_string(),
            transcription_model: "whisper-1".to_string(),
            temperature: 0.8,
        }
    }
}
