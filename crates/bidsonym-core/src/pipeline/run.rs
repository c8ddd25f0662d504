//! Run validation, subject selection and the subject loop.

use super::subject::{PipelineSettings, SubjectPipeline};
use super::summary::RunSummary;
use crate::cancel::CancellationToken;
use crate::config::{ToolConfig, ToolPaths};
use crate::dataset::{normalize_label, BidsLayout, DatasetIndex};
use crate::quarantine::{KeywordMatch, RiskKeywords};
use crate::reports::{NativeReporter, QcReporter};
use crate::tools::{BrainExtractionMethod, DeidMethod, ProcessRunner, ToolAdapter, ToolRunner};
use crate::{BidsonymError, Result};
use futures::StreamExt;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::path::PathBuf;
use std::str::FromStr;
use std::sync::Arc;
use std::time::Duration;
use tracing::{error, info, warn};

/// Which subjects a run covers.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AnalysisLevel {
    /// Explicitly listed participants.
    Participant,
    /// Every subject in the dataset.
    Group,
}

impl AnalysisLevel {
    pub fn as_str(&self) -> &'static str {
        match self {
            AnalysisLevel::Participant => "participant",
            AnalysisLevel::Group => "group",
        }
    }
}

impl fmt::Display for AnalysisLevel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for AnalysisLevel {
    type Err = String;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s {
            "participant" => Ok(AnalysisLevel::Participant),
            "group" => Ok(AnalysisLevel::Group),
            other => Err(format!(
                "unknown analysis level '{other}' (expected participant or group)"
            )),
        }
    }
}

/// What happens to the rest of the run when a subject fails.
///
/// Fatal errors (see [`BidsonymError::is_fatal`]) stop the run under
/// either policy.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FailurePolicy {
    /// Record the failure and continue with the next subject.
    #[default]
    Continue,
    /// Stop at the first failed subject.
    FailFast,
}

/// Run options as given by the user, before validation.
#[derive(Debug, Clone, PartialEq)]
pub struct RunOptions {
    pub bids_dir: PathBuf,
    pub analysis_level: AnalysisLevel,
    pub participant_labels: Vec<String>,
    pub deid: Option<DeidMethod>,
    pub deface_t2w: bool,
    pub del_meta: Vec<String>,
    pub brain_extraction: Option<BrainExtractionMethod>,
    pub bet_frac: Option<f64>,
    pub skip_bids_validation: bool,
    pub failure_policy: FailurePolicy,
    pub jobs: usize,
    pub tool_timeout: Duration,
    pub inspect_metadata: bool,
    /// Replaces the default risk keyword list when non-empty.
    pub risk_keywords: Vec<String>,
    pub keyword_match: KeywordMatch,
}

impl RunOptions {
    pub fn new(bids_dir: impl Into<PathBuf>, analysis_level: AnalysisLevel) -> Self {
        Self {
            bids_dir: bids_dir.into(),
            analysis_level,
            participant_labels: Vec::new(),
            deid: None,
            deface_t2w: false,
            del_meta: Vec::new(),
            brain_extraction: None,
            bet_frac: None,
            skip_bids_validation: false,
            failure_policy: FailurePolicy::default(),
            jobs: 1,
            tool_timeout: ToolConfig::DEFAULT_TIMEOUT,
            inspect_metadata: false,
            risk_keywords: Vec::new(),
            keyword_match: KeywordMatch::default(),
        }
    }

    /// Check option consistency and produce a typed configuration.
    ///
    /// Nothing on disk is touched.
    pub fn validate(self) -> Result<RunConfig> {
        let brain_extraction = self.brain_extraction.ok_or_else(|| {
            BidsonymError::config(
                "For post defacing quality control a brain extraction is required. \
                 Please indicate either bet (--brainextraction bet) or nobrainer \
                 (--brainextraction nobrainer).",
            )
        })?;

        let bet_frac = match (brain_extraction.requires_frac(), self.bet_frac) {
            (true, None) => {
                return Err(BidsonymError::config(
                    "If you want to use BET for pre-defacing brain extraction, please provide \
                     a Frac value. For example: --bet-frac 0.5",
                ))
            }
            (true, Some(f)) if !(f > 0.0 && f <= 1.0) => {
                return Err(BidsonymError::config(format!(
                    "--bet-frac must be in (0, 1], got {f}"
                )))
            }
            (true, frac) => frac,
            (false, Some(_)) => {
                warn!("--bet-frac is ignored with {} brain extraction", brain_extraction);
                None
            }
            (false, None) => None,
        };

        let deid = self.deid.ok_or_else(|| {
            let known: Vec<&str> = DeidMethod::ALL.iter().map(|m| m.as_str()).collect();
            BidsonymError::config(format!(
                "No de-identification method indicated. Please choose one of: {}",
                known.join(", ")
            ))
        })?;

        let mut participants: Vec<String> = Vec::new();
        for label in &self.participant_labels {
            let label = normalize_label(label.trim());
            if label.is_empty() {
                return Err(BidsonymError::config("Participant labels must not be empty."));
            }
            if !participants.iter().any(|p| p == label) {
                participants.push(label.to_string());
            }
        }
        match self.analysis_level {
            AnalysisLevel::Participant if participants.is_empty() => {
                return Err(BidsonymError::config(
                    "No participant label indicated. Please do so.",
                ))
            }
            AnalysisLevel::Group if !participants.is_empty() => {
                return Err(BidsonymError::config(
                    "Cannot set participant_label for group level analysis.",
                ))
            }
            _ => {}
        }

        if self.jobs == 0 {
            return Err(BidsonymError::config("--jobs must be at least 1."));
        }
        if self.tool_timeout.is_zero() {
            return Err(BidsonymError::config("--tool-timeout must be positive."));
        }

        let inspect = self.inspect_metadata.then(|| {
            let mut keywords = RiskKeywords {
                mode: self.keyword_match,
                ..RiskKeywords::default()
            };
            if !self.risk_keywords.is_empty() {
                keywords.keywords = self.risk_keywords.clone();
            }
            keywords
        });

        Ok(RunConfig {
            bids_dir: self.bids_dir,
            analysis_level: self.analysis_level,
            participants,
            validate_dataset: !self.skip_bids_validation,
            failure_policy: self.failure_policy,
            jobs: self.jobs,
            tool_timeout: self.tool_timeout,
            settings: PipelineSettings {
                deid,
                brain_extraction,
                bet_frac,
                deface_t2w: self.deface_t2w,
                del_meta: self.del_meta,
                inspect,
            },
        })
    }
}

/// Validated run configuration.
#[derive(Debug, Clone, PartialEq)]
pub struct RunConfig {
    pub bids_dir: PathBuf,
    pub analysis_level: AnalysisLevel,
    /// Normalized participant labels (participant level only).
    pub participants: Vec<String>,
    pub validate_dataset: bool,
    pub failure_policy: FailurePolicy,
    pub jobs: usize,
    pub tool_timeout: Duration,
    pub settings: PipelineSettings,
}

impl RunConfig {
    /// Subjects to process, in index order.
    ///
    /// Every requested label that the dataset does not contain is reported
    /// in a single `UnknownParticipants` error.
    pub fn resolve_subjects(&self, index: &dyn DatasetIndex) -> Result<Vec<String>> {
        let known = index.list_subjects();
        match self.analysis_level {
            AnalysisLevel::Group => Ok(known),
            AnalysisLevel::Participant => {
                let missing: Vec<String> = self
                    .participants
                    .iter()
                    .filter(|p| !known.contains(p))
                    .cloned()
                    .collect();
                if !missing.is_empty() {
                    return Err(BidsonymError::UnknownParticipants { labels: missing });
                }
                Ok(known
                    .into_iter()
                    .filter(|s| self.participants.contains(s))
                    .collect())
            }
        }
    }
}

/// Drives one run over the selected subjects.
pub struct RunController {
    config: RunConfig,
    runner: Arc<dyn ToolRunner>,
    reporter: Arc<dyn QcReporter>,
    tool_paths: ToolPaths,
}

impl RunController {
    /// Controller using real processes and native QC rendering.
    pub fn new(config: RunConfig) -> Self {
        Self {
            config,
            runner: Arc::new(ProcessRunner),
            reporter: Arc::new(NativeReporter),
            tool_paths: ToolPaths::default(),
        }
    }

    pub fn with_runner(mut self, runner: Arc<dyn ToolRunner>) -> Self {
        self.runner = runner;
        self
    }

    pub fn with_reporter(mut self, reporter: Arc<dyn QcReporter>) -> Self {
        self.reporter = reporter;
        self
    }

    pub fn with_tool_paths(mut self, tool_paths: ToolPaths) -> Self {
        self.tool_paths = tool_paths;
        self
    }

    /// Index the dataset, resolve subjects and process them.
    ///
    /// Returns the summary when the run went through, even if some subjects
    /// failed under [`FailurePolicy::Continue`]. A fatal error, or any
    /// failure under [`FailurePolicy::FailFast`], stops the run: subjects in
    /// flight are cancelled, the summary is still written, and the error is
    /// returned.
    pub async fn run(&self, cancel: &CancellationToken) -> Result<RunSummary> {
        let config = &self.config;
        let layout = BidsLayout::open(&config.bids_dir, config.validate_dataset)?;
        let subjects = config.resolve_subjects(&layout)?;
        if subjects.is_empty() {
            warn!("No subjects found in {}", config.bids_dir.display());
        } else {
            info!("Subjects to process: {}", subjects.join(", "));
        }

        let index: Arc<dyn DatasetIndex> = Arc::new(layout);
        let tools = ToolAdapter::new(self.runner.clone(), self.tool_paths.clone())
            .with_timeout(config.tool_timeout);
        let pipeline = SubjectPipeline::new(index, tools, self.reporter.clone(), config.settings.clone());

        let mut summary = RunSummary::new(config);
        let stop = cancel.child_token();
        let mut abort: Option<BidsonymError> = None;
        {
            let pipeline = &pipeline;
            let stop = &stop;
            let mut results = futures::stream::iter(
                subjects
                    .iter()
                    .map(|subject| async move { pipeline.run(subject, stop).await }),
            )
            .buffer_unordered(config.jobs);

            while let Some((outcome, result)) = results.next().await {
                match result {
                    Ok(()) => summary.record(outcome),
                    Err(BidsonymError::Cancelled) if !outcome.touched_dataset() && stop.is_cancelled() => {
                        summary.record_skipped(outcome.subject);
                        if abort.is_none() {
                            abort = Some(BidsonymError::Cancelled);
                        }
                    }
                    Err(e) => {
                        error!("sub-{} failed: {}", outcome.subject, e);
                        summary.record(outcome);
                        let stops_run =
                            e.is_fatal() || config.failure_policy == FailurePolicy::FailFast;
                        if stops_run && abort.is_none() {
                            warn!("Stopping the run after this failure");
                            stop.cancel();
                            abort = Some(e);
                        }
                    }
                }
            }
        }

        summary.finish();
        if let Err(e) = summary.write(pipeline.quarantine()) {
            error!("Could not write run summary: {}", e);
        }
        info!(
            "Run finished: {} processed, {} failed, {} skipped",
            summary.processed.len(),
            summary.failed.len(),
            summary.skipped.len()
        );

        match abort {
            Some(e) => Err(e),
            None => Ok(summary),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn options(level: AnalysisLevel) -> RunOptions {
        let mut options = RunOptions::new("/data", level);
        options.deid = Some(DeidMethod::Pydeface);
        options.brain_extraction = Some(BrainExtractionMethod::Nobrainer);
        options
    }

    #[test]
    fn test_participant_level_requires_labels() {
        let err = options(AnalysisLevel::Participant).validate().unwrap_err();
        assert!(matches!(err, BidsonymError::Config { .. }));
    }

    #[test]
    fn test_group_level_forbids_labels() {
        let mut opts = options(AnalysisLevel::Group);
        opts.participant_labels = vec!["01".into()];
        assert!(matches!(opts.validate(), Err(BidsonymError::Config { .. })));
    }

    #[test]
    fn test_bet_requires_frac() {
        let mut opts = options(AnalysisLevel::Group);
        opts.brain_extraction = Some(BrainExtractionMethod::Bet);
        assert!(matches!(opts.clone().validate(), Err(BidsonymError::Config { .. })));

        opts.bet_frac = Some(1.2);
        assert!(matches!(opts.clone().validate(), Err(BidsonymError::Config { .. })));

        opts.bet_frac = Some(0.5);
        assert_eq!(opts.validate().unwrap().settings.bet_frac, Some(0.5));
    }

    #[test]
    fn test_brain_extraction_and_deid_are_required() {
        let mut opts = options(AnalysisLevel::Group);
        opts.brain_extraction = None;
        assert!(matches!(opts.validate(), Err(BidsonymError::Config { .. })));

        let mut opts = options(AnalysisLevel::Group);
        opts.deid = None;
        assert!(matches!(opts.validate(), Err(BidsonymError::Config { .. })));
    }

    #[test]
    fn test_labels_are_normalized_and_deduplicated() {
        let mut opts = options(AnalysisLevel::Participant);
        opts.participant_labels = vec!["sub-01".into(), "01".into(), "02".into()];
        assert_eq!(opts.validate().unwrap().participants, vec!["01", "02"]);
    }

    #[test]
    fn test_zero_jobs_rejected() {
        let mut opts = options(AnalysisLevel::Group);
        opts.jobs = 0;
        assert!(matches!(opts.validate(), Err(BidsonymError::Config { .. })));
    }

    #[test]
    fn test_inspection_keywords() {
        let mut opts = options(AnalysisLevel::Group);
        opts.inspect_metadata = true;
        opts.risk_keywords = vec!["Institution".into()];
        opts.keyword_match = KeywordMatch::Substring;
        let inspect = opts.validate().unwrap().settings.inspect.unwrap();
        assert_eq!(inspect.keywords, vec!["Institution"]);
        assert_eq!(inspect.mode, KeywordMatch::Substring);
    }

    #[test]
    fn test_analysis_level_from_str() {
        assert_eq!("group".parse::<AnalysisLevel>(), Ok(AnalysisLevel::Group));
        assert!("session".parse::<AnalysisLevel>().is_err());
    }
}
