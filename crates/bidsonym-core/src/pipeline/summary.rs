//! Machine-readable record of one run.

use super::run::{AnalysisLevel, RunConfig};
use super::state::SubjectOutcome;
use crate::config::PathsConfig;
use crate::quarantine::atomic::atomic_write_json;
use crate::quarantine::Quarantine;
use crate::tools::{BrainExtractionMethod, DeidMethod};
use crate::Result;
use chrono::{DateTime, Utc};
use serde::Serialize;
use std::path::PathBuf;
use tracing::info;

/// Summary written to `sourcedata/bidsonym/run_summary.json`.
#[derive(Debug, Clone, Serialize)]
pub struct RunSummary {
    pub bids_dir: PathBuf,
    pub analysis_level: AnalysisLevel,
    pub deid: DeidMethod,
    pub brain_extraction: BrainExtractionMethod,
    pub deface_t2w: bool,
    pub started_at: DateTime<Utc>,
    pub finished_at: Option<DateTime<Utc>>,
    /// Subjects that completed without error.
    pub processed: Vec<String>,
    pub failed: Vec<String>,
    /// Subjects that never started because the run stopped early.
    pub skipped: Vec<String>,
    pub subjects: Vec<SubjectOutcome>,
}

impl RunSummary {
    pub fn new(config: &RunConfig) -> Self {
        Self {
            bids_dir: config.bids_dir.clone(),
            analysis_level: config.analysis_level,
            deid: config.settings.deid,
            brain_extraction: config.settings.brain_extraction,
            deface_t2w: config.settings.deface_t2w,
            started_at: Utc::now(),
            finished_at: None,
            processed: Vec::new(),
            failed: Vec::new(),
            skipped: Vec::new(),
            subjects: Vec::new(),
        }
    }

    pub fn record(&mut self, outcome: SubjectOutcome) {
        if outcome.succeeded() {
            self.processed.push(outcome.subject.clone());
        } else {
            self.failed.push(outcome.subject.clone());
        }
        self.subjects.push(outcome);
    }

    pub fn record_skipped(&mut self, subject: impl Into<String>) {
        self.skipped.push(subject.into());
    }

    /// Stamp the end time and order everything by subject label.
    pub fn finish(&mut self) {
        self.finished_at = Some(Utc::now());
        self.processed.sort();
        self.failed.sort();
        self.skipped.sort();
        self.subjects.sort_by(|a, b| a.subject.cmp(&b.subject));
    }

    pub fn is_success(&self) -> bool {
        self.failed.is_empty() && self.skipped.is_empty()
    }

    pub fn outcome(&self, subject: &str) -> Option<&SubjectOutcome> {
        self.subjects.iter().find(|s| s.subject == subject)
    }

    /// Write the summary into the quarantine, replacing any previous one.
    pub fn write(&self, quarantine: &Quarantine) -> Result<PathBuf> {
        let path = quarantine.root().join(PathsConfig::RUN_SUMMARY_FILENAME);
        atomic_write_json(&path, self)?;
        info!("Run summary written to {}", path.display());
        Ok(path)
    }
}
