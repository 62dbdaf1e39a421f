//! Scoring Service
//!
//! Turns a finished conversation transcript into an [`AssessmentReport`]. The
//! bridge treats scoring as an opaque, possibly slow call: it is always run
//! off the dispatch loop and may be cancelled at any await point.

use async_openai::{
    Client,
    config::OpenAIConfig,
    types::{
        ChatCompletionRequestSystemMessageArgs, ChatCompletionRequestUserMessageArgs,
        CreateChatCompletionRequestArgs, ResponseFormat,
    },
};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::fmt;
use thiserror::Error;

use crate::report::{AssessmentReport, DomainAnalysis};

/// Who said an utterance.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Speaker {
    User,
    Ai,
}

impl fmt::Display for Speaker {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Speaker::User => f.write_str("User"),
            Speaker::Ai => f.write_str("AI"),
        }
    }
}

/// One line of the conversation transcript.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Utterance {
    pub speaker: Speaker,
    pub text: String,
}

impl Utterance {
    pub fn user(text: impl Into<String>) -> Self {
        Self {
            speaker: Speaker::User,
            text: text.into(),
        }
    }

    pub fn ai(text: impl Into<String>) -> Self {
        Self {
            speaker: Speaker::Ai,
            text: text.into(),
        }
    }
}

/// Everything a scorer gets to see.
#[derive(Debug, Clone, Default)]
pub struct ScoringRequest {
    pub transcript: Vec<Utterance>,
    /// Reason the model gave when it signalled the ceiling.
    pub reason: String,
}

impl ScoringRequest {
    /// Renders the transcript as plain text, one `Speaker: text` line each.
    pub fn format_transcript(&self) -> String {
        let mut lines = Vec::with_capacity(self.transcript.len() + 2);
        lines.push("=== INTERVIEW TRANSCRIPT ===".to_string());
        lines.extend(
            self.transcript
                .iter()
                .map(|u| format!("{}: {}", u.speaker, u.text)),
        );
        lines.push("=== END TRANSCRIPT ===".to_string());
        lines.join("\n")
    }
}

#[derive(Debug, Error)]
pub enum ScoringError {
    #[error("scoring request failed: {0}")]
    Request(String),
    #[error("scorer returned no content")]
    EmptyResponse,
    #[error("scorer returned a malformed report: {0}")]
    Malformed(#[from] serde_json::Error),
    #[error("scoring task aborted: {0}")]
    Aborted(String),
}

/// Defines the contract for anything that can score a conversation.
#[async_trait]
pub trait ScoringService: Send + Sync {
    async fn score(&self, request: ScoringRequest) -> Result<AssessmentReport, ScoringError>;
}

const SCORING_SYSTEM_PROMPT: &str = r#"You are a senior oral proficiency examiner.
Locate the point in the transcript where the user stopped being comfortable (the linguistic ceiling) and produce a report.
Every claim must be backed by a direct quote from the user's lines.
Rate each of Fluency, Grammar, Lexical, Phonology and Coherence from 1 to 5.
Respond with a single JSON object with exactly these keys:
proficiency_level (string), ceiling_phase (one of "Warm-up", "Level-up", "Ceiling test"), ceiling_analysis (string),
domain_analyses (array of {domain, rating, observation, evidence}), starting_module (string),
logic_errors_to_debug (array of the top two patterns to fix), optimization_strategy (one concrete exercise)."#;

/// A `ScoringService` backed by an OpenAI-compatible chat completion endpoint.
pub struct OpenAIScoringService {
    client: Client<OpenAIConfig>,
    model: String,
}

impl OpenAIScoringService {
    /// Creates a scorer using `model` (e.g. "gpt-4o-mini").
    pub fn new(config: OpenAIConfig, model: String) -> Self {
        Self {
            client: Client::with_config(config),
            model,
        }
    }
}

#[async_trait]
impl ScoringService for OpenAIScoringService {
    async fn score(&self, request: ScoringRequest) -> Result<AssessmentReport, ScoringError> {
        let prompt = format!(
            "The interviewer stopped because: {}\n\nPlease analyze this interview transcript and provide a comprehensive proficiency assessment:\n\n{}",
            request.reason,
            request.format_transcript()
        );

        let chat_request = CreateChatCompletionRequestArgs::default()
            .model(&self.model)
            .messages(vec![
                ChatCompletionRequestSystemMessageArgs::default()
                    .content(SCORING_SYSTEM_PROMPT)
                    .build()
                    .map_err(|e| ScoringError::Request(e.to_string()))?
                    .into(),
                ChatCompletionRequestUserMessageArgs::default()
                    .content(prompt)
                    .build()
                    .map_err(|e| ScoringError::Request(e.to_string()))?
                    .into(),
            ])
            .response_format(ResponseFormat::JsonObject)
            .temperature(0.3)
            .build()
            .map_err(|e| ScoringError::Request(e.to_string()))?;

        let response = self
            .client
            .chat()
            .create(chat_request)
            .await
            .map_err(|e| ScoringError::Request(e.to_string()))?;

        let content = response
            .choices
            .first()
            .and_then(|choice| choice.message.content.as_deref())
            .ok_or(ScoringError::EmptyResponse)?;

        Ok(serde_json::from_str(content)?)
    }
}

/// A deterministic `ScoringService` for development and tests.
pub struct MockScoringService;

#[async_trait]
impl ScoringService for MockScoringService {
    async fn score(&self, request: ScoringRequest) -> Result<AssessmentReport, ScoringError> {
        let evidence = request
            .transcript
            .iter()
            .rev()
            .find(|u| u.speaker == Speaker::User)
            .map(|u| u.text.clone())
            .unwrap_or_default();

        Ok(AssessmentReport {
            proficiency_level: "B1".to_string(),
            ceiling_phase: "Level-up".to_string(),
            ceiling_analysis: "Answers shortened once questions required narration.".to_string(),
            domain_analyses: vec![
                DomainAnalysis {
                    domain: "Fluency".to_string(),
                    rating: 3,
                    observation: "Steady pace with occasional restarts.".to_string(),
                    evidence: evidence.clone(),
                },
                DomainAnalysis {
                    domain: "Grammar".to_string(),
                    rating: 2,
                    observation: "Tense marking is inconsistent.".to_string(),
                    evidence,
                },
            ],
            starting_module: "Narrating Past Events".to_string(),
            logic_errors_to_debug: vec![
                "Past tense marking".to_string(),
                "Article usage".to_string(),
            ],
            optimization_strategy: "Picture narration".to_string(),
        })
    }
}
