//! Defines the WebSocket message protocol between the browser client and the API server.

use parley_core::{delivery::DeliveryNotice, report::AssessmentReport};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Messages sent from the client (browser) to the server.
///
/// Raw PCM16 can also arrive as binary frames; those stream straight into the
/// remote input buffer without committing.
#[derive(Deserialize, Debug, Clone, PartialEq)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ClientMessage {
    /// A complete push-to-talk utterance (base64 PCM16). Appended, committed
    /// and answered.
    Audio { data: String },
    /// Commits whatever was streamed as binary frames and asks for a reply.
    Commit,
    Ping,
    /// The user hung up.
    EndSession,
}

/// Messages sent from the server to the client (browser).
#[derive(Serialize, Debug, Clone, PartialEq)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ServerMessage {
    /// First message on every connection.
    SessionCreated { session_id: Uuid },
    /// The remote voice session is configured and ready.
    SessionStarted { message: String },
    /// The model has loaded its interview protocol.
    SetupComplete { message: String },
    /// A chunk of AI speech (base64 PCM16, 24 kHz mono).
    AiAudio {
        audio: String,
        #[serde(skip_serializing_if = "Option::is_none")]
        response_id: Option<String>,
    },
    AiTranscript { text: String },
    UserTranscript { text: String },
    ResponseComplete,
    AssessmentTriggered { message: String },
    AssessmentProgress { message: String, progress: f32 },
    AssessmentComplete {
        report: AssessmentReport,
        summary: String,
    },
    /// Sent periodically while the report is being generated.
    Keepalive { message: String },
    Pong,
    SessionEnded { reason: String },
    Error { message: String },
}

impl From<DeliveryNotice> for ServerMessage {
    fn from(notice: DeliveryNotice) -> Self {
        match notice {
            DeliveryNotice::Triggered { message } => ServerMessage::AssessmentTriggered { message },
            DeliveryNotice::Progress { message, progress } => {
                ServerMessage::AssessmentProgress { message, progress }
            }
            DeliveryNotice::ReportReady { report, summary } => {
                ServerMessage::AssessmentComplete { report, summary }
            }
            DeliveryNotice::Failed { message } => ServerMessage::Error { message },
        }
    }
}
