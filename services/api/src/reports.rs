//! Saves finished assessment reports as JSON files.

use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use parley_core::report::AssessmentReport;
use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use tracing::info;
use uuid::Uuid;

/// On-disk shape of a saved report.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SavedReport {
    pub session_id: Uuid,
    pub timestamp: DateTime<Utc>,
    pub report: AssessmentReport,
    pub verbal_summary: String,
    /// Number of utterances in the scored transcript.
    pub conversation_length: usize,
}

#[derive(Debug, Clone)]
pub struct ReportStore {
    dir: PathBuf,
}

impl ReportStore {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self { dir: dir.into() }
    }

    /// Writes the report to `assessment_<timestamp>_<short id>.json` and
    /// returns the file's path.
    pub async fn save(
        &self,
        session_id: Uuid,
        report: &AssessmentReport,
        verbal_summary: &str,
        conversation_length: usize,
    ) -> Result<PathBuf> {
        let saved = SavedReport {
            session_id,
            timestamp: Utc::now(),
            report: report.clone(),
            verbal_summary: verbal_summary.to_string(),
            conversation_length,
        };

        tokio::fs::create_dir_all(&self.dir)
            .await
            .with_context(|| format!("Failed to create report directory {}", self.dir.display()))?;

        let short_id: String = session_id.simple().to_string().chars().take(8).collect();
        let filename = format!(
            "assessment_{}_{}.json",
            saved.timestamp.format("%Y%m%d_%H%M%S"),
            short_id
        );
        let path = self.dir.join(filename);

        let json = serde_json::to_string_pretty(&saved).context("Failed to serialize report")?;
        tokio::fs::write(&path, json)
            .await
            .with_context(|| format!("Failed to write report {}", path.display()))?;

        info!(%session_id, path = %path.display(), "Assessment report saved");
        Ok(path)
    }
}
