//! OpenAI Realtime API wire events.
//!
//! Only the events the bridge uses are modelled. Inbound parsing is lenient:
//! ids the endpoint sometimes omits are optional, and unknown event types
//! deserialize to [`ServerEvent::Other`].

use base64::prelude::*;
use bytes::Bytes;
use parley_core::realtime::{RemoteCommand, RemoteEvent, SessionSettings};
use serde::{Deserialize, Serialize};
use serde_json::json;
use tracing::warn;

/// Name of the tool the model calls when the user's ceiling is reached.
pub const TRIGGER_ASSESSMENT_TOOL: &str = "trigger_assessment";
/// Name of the tool that hands the model its interview protocol.
pub const INTERVIEW_GUIDANCE_TOOL: &str = "interview_guidance";

#[derive(Debug, Clone, Serialize)]
pub struct SessionConfig {
    pub modalities: Vec<String>,
    pub instructions: String,
    pub voice: String,
    pub input_audio_format: String,
    pub output_audio_format: String,
    pub input_audio_transcription: InputAudioTranscription,
    /// `null` disables server-side turn detection; turns are committed manually.
    pub turn_detection: Option<serde_json::Value>,
    pub tools: Vec<ToolDef>,
    pub tool_choice: String,
    pub temperature: f32,
}

impl SessionConfig {
    pub fn from_settings(settings: &SessionSettings) -> Self {
        Self {
            modalities: vec!["text".to_string(), "audio".to_string()],
            instructions: settings.instructions.clone(),
            voice: settings.voice.clone(),
            input_audio_format: "pcm16".to_string(),
            output_audio_format: "pcm16".to_string(),
            input_audio_transcription: InputAudioTranscription {
                model: settings.transcription_model.clone(),
            },
            turn_detection: None,
            tools: vec![ToolDef::interview_guidance(), ToolDef::trigger_assessment()],
            tool_choice: "auto".to_string(),
            temperature: settings.temperature,
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct InputAudioTranscription {
    pub model: String,
}

#[derive(Debug, Clone, Serialize)]
pub struct ToolDef {
    #[serde(rename = "type")]
    pub tool_type: String,
    pub name: String,
    pub description: String,
    pub parameters: serde_json::Value,
}

impl ToolDef {
    fn interview_guidance() -> Self {
        Self {
            tool_type: "function".to_string(),
            name: INTERVIEW_GUIDANCE_TOOL.to_string(),
            description: "CRITICAL: Load the interview guidance protocol. This MUST be called as your very first action before speaking to the user.".to_string(),
            parameters: json!({
                "type": "object",
                "properties": {},
                "required": []
            }),
        }
    }

    fn trigger_assessment() -> Self {
        Self {
            tool_type: "function".to_string(),
            name: TRIGGER_ASSESSMENT_TOOL.to_string(),
            description: "Call this when the user has reached their linguistic ceiling and the interview should end with an assessment.".to_string(),
            parameters: json!({
                "type": "object",
                "properties": {
                    "reason": {
                        "type": "string",
                        "description": "Brief reason why the ceiling was reached"
                    }
                },
                "required": ["reason"]
            }),
        }
    }
}

#[derive(Debug, Clone, Default, Serialize)]
pub struct ResponseConfig {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub modalities: Option<Vec<String>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub instructions: Option<String>,
}

#[derive(Debug, Clone, Serialize)]
pub struct ConversationItem {
    #[serde(rename = "type")]
    pub item_type: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub call_id: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub output: Option<String>,
}

/// Events sent to the Realtime API.
#[derive(Debug, Clone, Serialize)]
#[serde(tag = "type")]
pub enum ClientEvent {
    #[serde(rename = "session.update")]
    SessionUpdate { session: SessionConfig },
    #[serde(rename = "input_audio_buffer.append")]
    InputAudioBufferAppend { audio: String },
    #[serde(rename = "input_audio_buffer.commit")]
    InputAudioBufferCommit,
    #[serde(rename = "input_audio_buffer.clear")]
    InputAudioBufferClear,
    #[serde(rename = "conversation.item.create")]
    ConversationItemCreate { item: ConversationItem },
    #[serde(rename = "response.create")]
    ResponseCreate {
        #[serde(skip_serializing_if = "Option::is_none")]
        response: Option<ResponseConfig>,
    },
    #[serde(rename = "response.cancel")]
    ResponseCancel,
}

impl From<RemoteCommand> for ClientEvent {
    fn from(command: RemoteCommand) -> Self {
        match command {
            RemoteCommand::StartTurn { instructions } => ClientEvent::ResponseCreate {
                response: instructions.map(|instructions| ResponseConfig {
                    modalities: Some(vec!["text".to_string(), "audio".to_string()]),
                    instructions: Some(instructions),
                }),
            },
            RemoteCommand::StartTextTurn { instructions } => ClientEvent::ResponseCreate {
                response: Some(ResponseConfig {
                    modalities: Some(vec!["text".to_string()]),
                    instructions: Some(instructions),
                }),
            },
            RemoteCommand::AppendAudio(data) => ClientEvent::InputAudioBufferAppend {
                audio: BASE64_STANDARD.encode(&data),
            },
            RemoteCommand::CommitAudio => ClientEvent::InputAudioBufferCommit,
            RemoteCommand::ClearInput => ClientEvent::InputAudioBufferClear,
            RemoteCommand::CancelTurn => ClientEvent::ResponseCancel,
            RemoteCommand::ToolOutput { call_id, output } => ClientEvent::ConversationItemCreate {
                item: ConversationItem {
                    item_type: "function_call_output".to_string(),
                    call_id: Some(call_id),
                    output: Some(output),
                },
            },
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct ResponseInfo {
    pub id: Option<String>,
    pub status: Option<String>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct ApiError {
    pub message: String,
    pub code: Option<String>,
}

/// Events received from the Realtime API.
#[derive(Debug, Clone, Deserialize)]
#[serde(tag = "type")]
pub enum ServerEvent {
    #[serde(rename = "error")]
    Error { error: ApiError },
    #[serde(rename = "session.updated")]
    SessionUpdated,
    #[serde(rename = "response.created")]
    ResponseCreated { response: ResponseInfo },
    #[serde(rename = "response.audio.delta")]
    ResponseAudioDelta {
        response_id: Option<String>,
        delta: String,
    },
    #[serde(rename = "response.audio.done")]
    ResponseAudioDone { response_id: Option<String> },
    #[serde(rename = "response.audio_transcript.delta")]
    ResponseAudioTranscriptDelta {
        response_id: Option<String>,
        delta: String,
    },
    #[serde(rename = "response.audio_transcript.done")]
    ResponseAudioTranscriptDone {
        response_id: Option<String>,
        transcript: Option<String>,
    },
    #[serde(rename = "response.done")]
    ResponseDone { response: Option<ResponseInfo> },
    #[serde(rename = "conversation.item.input_audio_transcription.completed")]
    TranscriptionCompleted { transcript: String },
    #[serde(rename = "response.function_call_arguments.done")]
    FunctionCallArgumentsDone {
        call_id: Option<String>,
        name: Option<String>,
        #[serde(default)]
        arguments: String,
    },
    #[serde(other)]
    Other,
}

impl ServerEvent {
    /// Normalises the event, or `None` if the bridge has no use for it.
    pub fn into_remote(self) -> Option<RemoteEvent> {
        match self {
            ServerEvent::Error { error } => Some(RemoteEvent::Error {
                message: error.message,
                code: error.code,
            }),
            ServerEvent::SessionUpdated => Some(RemoteEvent::SessionReady),
            ServerEvent::ResponseCreated { response } => match response.id {
                Some(turn_id) => Some(RemoteEvent::TurnCreated { turn_id }),
                None => {
                    warn!("response.created without an id");
                    None
                }
            },
            ServerEvent::ResponseAudioDelta { response_id, delta } => {
                match BASE64_STANDARD.decode(delta.as_bytes()) {
                    Ok(data) => Some(RemoteEvent::AudioChunk {
                        turn_id: response_id,
                        data: Bytes::from(data),
                    }),
                    Err(e) => {
                        warn!("Dropping undecodable audio delta: {}", e);
                        None
                    }
                }
            }
            ServerEvent::ResponseAudioDone { response_id } => Some(RemoteEvent::AudioContentComplete {
                turn_id: response_id,
            }),
            ServerEvent::ResponseAudioTranscriptDelta { response_id, delta } => {
                Some(RemoteEvent::TranscriptDelta {
                    turn_id: response_id,
                    delta,
                })
            }
            ServerEvent::ResponseAudioTranscriptDone {
                response_id,
                transcript,
            } => Some(RemoteEvent::TranscriptDone {
                turn_id: response_id,
                transcript,
            }),
            ServerEvent::ResponseDone { response } => {
                let (turn_id, status) = response.map_or((None, None), |r| (r.id, r.status));
                Some(RemoteEvent::TurnComplete { turn_id, status })
            }
            ServerEvent::TranscriptionCompleted { transcript } => {
                Some(RemoteEvent::UserTranscript { text: transcript })
            }
            ServerEvent::FunctionCallArgumentsDone {
                call_id,
                name,
                arguments,
            } => Some(RemoteEvent::ToolCall {
                call_id,
                name: name.unwrap_or_default(),
                arguments,
            }),
            ServerEvent::Other => None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn parse(value: serde_json::Value) -> Option<RemoteEvent> {
        serde_json::from_value::<ServerEvent>(value)
            .unwrap()
            .into_remote()
    }

    #[test]
    fn test_audio_delta_with_and_without_response_id() {
        let with_id = parse(json!({
            "type": "response.audio.delta",
            "event_id": "evt_1",
            "response_id": "resp_1",
            "item_id": "item_1",
            "delta": "AAEC"
        }));
        assert_eq!(
            with_id,
            Some(RemoteEvent::AudioChunk {
                turn_id: Some("resp_1".to_string()),
                data: Bytes::from_static(&[0, 1, 2]),
            })
        );

        let without_id = parse(json!({"type": "response.audio.delta", "delta": "AAEC"}));
        assert!(matches!(
            without_id,
            Some(RemoteEvent::AudioChunk { turn_id: None, .. })
        ));
    }

    #[test]
    fn test_bad_base64_is_dropped() {
        assert_eq!(
            parse(json!({"type": "response.audio.delta", "delta": "***"})),
            None
        );
    }

    #[test]
    fn test_turn_lifecycle_events() {
        assert_eq!(
            parse(json!({"type": "response.created", "response": {"id": "resp_9", "status": "in_progress"}})),
            Some(RemoteEvent::TurnCreated {
                turn_id: "resp_9".to_string()
            })
        );
        assert_eq!(
            parse(json!({"type": "response.done", "response": {"id": "resp_9", "status": "cancelled"}})),
            Some(RemoteEvent::TurnComplete {
                turn_id: Some("resp_9".to_string()),
                status: Some("cancelled".to_string())
            })
        );
        assert_eq!(
            parse(json!({"type": "response.audio_transcript.done", "transcript": "hello"})),
            Some(RemoteEvent::TranscriptDone {
                turn_id: None,
                transcript: Some("hello".to_string())
            })
        );
    }

    #[test]
    fn test_tool_call_and_unknown_events() {
        assert_eq!(
            parse(json!({
                "type": "response.function_call_arguments.done",
                "response_id": "resp_1",
                "call_id": "call_1",
                "name": "trigger_assessment",
                "arguments": "{\"reason\":\"ceiling\"}"
            })),
            Some(RemoteEvent::ToolCall {
                call_id: Some("call_1".to_string()),
                name: "trigger_assessment".to_string(),
                arguments: "{\"reason\":\"ceiling\"}".to_string(),
            })
        );
        assert_eq!(parse(json!({"type": "rate_limits.updated", "rate_limits": []})), None);
    }

    #[test]
    fn test_client_events_serialize() {
        let start: ClientEvent = RemoteCommand::StartTurn {
            instructions: Some("Say hi".to_string()),
        }
        .into();
        assert_eq!(
            serde_json::to_value(&start).unwrap(),
            json!({
                "type": "response.create",
                "response": {"modalities": ["text", "audio"], "instructions": "Say hi"}
            })
        );

        let plain: ClientEvent = RemoteCommand::StartTurn { instructions: None }.into();
        assert_eq!(
            serde_json::to_value(&plain).unwrap(),
            json!({"type": "response.create"})
        );

        let setup: ClientEvent = RemoteCommand::StartTextTurn {
            instructions: "Call the tool".to_string(),
        }
        .into();
        assert_eq!(
            serde_json::to_value(&setup).unwrap(),
            json!({
                "type": "response.create",
                "response": {"modalities": ["text"], "instructions": "Call the tool"}
            })
        );

        let clear: ClientEvent = RemoteCommand::ClearInput.into();
        assert_eq!(
            serde_json::to_value(&clear).unwrap(),
            json!({"type": "input_audio_buffer.clear"})
        );

        let output: ClientEvent = RemoteCommand::ToolOutput {
            call_id: "call_1".to_string(),
            output: "ok".to_string(),
        }
        .into();
        assert_eq!(
            serde_json::to_value(&output).unwrap(),
            json!({
                "type": "conversation.item.create",
                "item": {"type": "function_call_output", "call_id": "call_1", "output": "ok"}
            })
        );
    }

    #[test]
    fn test_session_update_disables_turn_detection() {
        let event = ClientEvent::SessionUpdate {
            session: SessionConfig::from_settings(&SessionSettings::default()),
        };
        let value = serde_json::to_value(&event).unwrap();
        assert_eq!(value["type"], "session.update");
        assert!(value["session"]["turn_detection"].is_null());
        assert_eq!(value["session"]["input_audio_format"], "pcm16");
        let tools: Vec<_> = value["session"]["tools"]
            .as_array()
            .unwrap()
            .iter()
            .map(|tool| tool["name"].as_str().unwrap())
            .collect();
        assert_eq!(tools, vec![INTERVIEW_GUIDANCE_TOOL, TRIGGER_ASSESSMENT_TOOL]);
        assert_eq!(value["session"]["tools"][0]["parameters"]["type"], "object");
        assert_eq!(value["session"]["tools"][1]["parameters"]["required"][0], "reason");
    }
}
