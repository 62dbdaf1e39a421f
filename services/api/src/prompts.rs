//! Loads the model's session prompt and interview protocol from the prompts
//! directory, falling back to built-in text for missing files.

use anyhow::{Context, Result};
use std::path::Path;
use tracing::warn;

pub const SYSTEM_PROMPT_FILE: &str = "system_prompt.md";
pub const GUIDANCE_FILE: &str = "interview_guide.txt";

pub const DEFAULT_INSTRUCTIONS: &str = "You are a friendly English conversation partner. \
Before saying anything to the user, call the interview_guidance tool to load the interview \
protocol, then follow it. Keep the conversation going with short, natural replies. When the \
learner's language stops improving and you have heard enough to judge their level, call the \
trigger_assessment tool with a short reason and do not give an assessment yourself.";

pub const DEFAULT_GUIDANCE: &str = "Phase 1, warm-up: ask the user's name, where they are from \
and what they like to do. Phase 2, level check: ask open questions about daily life, past events \
and plans, and match your language to the level you are testing. Phase 3, ceiling test: raise \
the difficulty step by step with opinions, hypotheticals and abstract topics until the user \
struggles consistently. Phase 4, ending: stay positive and call trigger_assessment once the \
ceiling is clear.";

/// Loads the session prompt.
pub fn load_instructions(prompts_path: &Path) -> Result<String> {
    read_or_default(&prompts_path.join(SYSTEM_PROMPT_FILE), DEFAULT_INSTRUCTIONS)
}

/// Loads the interview protocol with its whitespace collapsed to single
/// spaces, the shape the model receives it in as tool output.
pub fn load_guidance(prompts_path: &Path) -> Result<String> {
    let text = read_or_default(&prompts_path.join(GUIDANCE_FILE), DEFAULT_GUIDANCE)?;
    Ok(text.split_whitespace().collect::<Vec<_>>().join(" "))
}

fn read_or_default(path: &Path, default: &str) -> Result<String> {
    if !path.is_file() {
        warn!(path = %path.display(), "Prompt file not found, using the built-in text");
        return Ok(default.to_string());
    }
    std::fs::read_to_string(path).with_context(|| format!("Failed to read {}", path.display()))
}
