//! Structured assessment report and its spoken rendering.

use serde::{Deserialize, Serialize};

/// Rating of a single linguistic domain.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DomainAnalysis {
    /// Fluency, Grammar, Lexical, Phonology or Coherence.
    pub domain: String,
    /// 1 to 5.
    pub rating: u8,
    pub observation: String,
    /// Direct quote from the user's side of the transcript.
    pub evidence: String,
}

/// Result of scoring a finished conversation.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AssessmentReport {
    pub proficiency_level: String,
    /// Interview phase in which the user's ceiling showed (warm-up, level-up, ceiling test).
    pub ceiling_phase: String,
    pub ceiling_analysis: String,
    #[serde(default)]
    pub domain_analyses: Vec<DomainAnalysis>,
    pub starting_module: String,
    #[serde(default)]
    pub logic_errors_to_debug: Vec<String>,
    pub optimization_strategy: String,
}

impl AssessmentReport {
    /// Highest and lowest rated domains, first one wins on ties.
    pub fn strongest_and_weakest(&self) -> Option<(&DomainAnalysis, &DomainAnalysis)> {
        let mut iter = self.domain_analyses.iter();
        let first = iter.next()?;
        let (strongest, weakest) = iter.fold((first, first), |(best, worst), d| {
            (
                if d.rating > best.rating { d } else { best },
                if d.rating < worst.rating { d } else { worst },
            )
        });
        Some((strongest, weakest))
    }

    /// Renders the report as text meant to be read aloud.
    pub fn verbal_summary(&self) -> String {
        let mut parts = vec![
            format!(
                "Based on our conversation, I've assessed your proficiency at {} level.",
                self.proficiency_level
            ),
            format!(
                "You performed well during the {} phase. {}",
                self.ceiling_phase, self.ceiling_analysis
            ),
        ];

        if let Some((strongest, weakest)) = self.strongest_and_weakest() {
            parts.push("Let me break down the key areas:".to_string());
            parts.push(format!(
                "Your strongest area is {} with a rating of {} out of 5. {}",
                strongest.domain.to_lowercase(),
                strongest.rating,
                strongest.observation
            ));
            if weakest.domain != strongest.domain {
                parts.push(format!(
                    "An area to focus on is {}, rated at {} out of 5. {}",
                    weakest.domain.to_lowercase(),
                    weakest.rating,
                    weakest.observation
                ));
            }
        }

        parts.push(format!(
            "I recommend starting with the {} module.",
            self.starting_module
        ));
        if !self.logic_errors_to_debug.is_empty() {
            parts.push("The top patterns to work on are:".to_string());
            for (i, pattern) in self.logic_errors_to_debug.iter().enumerate() {
                parts.push(format!("{}. {}", i + 1, pattern));
            }
        }
        parts.push(format!(
            "For practice, I suggest this exercise: {}",
            self.optimization_strategy
        ));
        parts.push("You're making good progress! Keep practicing regularly.".to_string());

        parts.join(" ")
    }
}
