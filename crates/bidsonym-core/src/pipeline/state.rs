//! Per-file and per-subject progress records.

use crate::dataset::Modality;
use crate::quarantine::QuarantinedFile;
use serde::Serialize;
use std::path::PathBuf;

/// How far one image got through the pipeline.
///
/// Stages only move forward: `Discovered` → `ExtractedMask` → `Defaced` →
/// `Reported`. `SkippedNoSecondary` is terminal and only reachable from
/// `Discovered` for the secondary modality.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum FileStage {
    Discovered,
    ExtractedMask,
    Defaced,
    Reported,
    SkippedNoSecondary,
}

/// Record of one image's progression.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct FileOutcome {
    /// Canonical path of the image.
    pub path: PathBuf,
    pub modality: Modality,
    pub stage: FileStage,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub mask: Option<PathBuf>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub quarantined: Option<QuarantinedFile>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub defaced: Option<PathBuf>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub overlay: Option<PathBuf>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub preview: Option<PathBuf>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl FileOutcome {
    pub fn discovered(path: PathBuf, modality: Modality) -> Self {
        Self {
            path,
            modality,
            stage: FileStage::Discovered,
            mask: None,
            quarantined: None,
            defaced: None,
            overlay: None,
            preview: None,
            error: None,
        }
    }

    pub fn skipped_no_secondary(path: PathBuf) -> Self {
        Self {
            stage: FileStage::SkippedNoSecondary,
            ..Self::discovered(path, Modality::T2w)
        }
    }

    /// Move to `stage`. Stages never go backwards.
    pub(crate) fn advance(&mut self, stage: FileStage) {
        debug_assert!(stage > self.stage, "{:?} -> {:?}", self.stage, stage);
        self.stage = stage;
    }

    pub fn is_complete(&self) -> bool {
        matches!(self.stage, FileStage::Reported | FileStage::SkippedNoSecondary)
    }
}

/// Aggregated result for one subject.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct SubjectOutcome {
    pub subject: String,
    pub files: Vec<FileOutcome>,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub edited_sidecars: Vec<PathBuf>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub metadata_report: Option<PathBuf>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl SubjectOutcome {
    pub fn new(subject: impl Into<String>) -> Self {
        Self {
            subject: subject.into(),
            files: Vec::new(),
            edited_sidecars: Vec::new(),
            metadata_report: None,
            error: None,
        }
    }

    pub fn succeeded(&self) -> bool {
        self.error.is_none()
    }

    /// Whether any work reached the dataset or the quarantine.
    pub fn touched_dataset(&self) -> bool {
        !self.files.is_empty() || !self.edited_sidecars.is_empty() || self.metadata_report.is_some()
    }

    /// Number of images that were defaced.
    pub fn defaced_count(&self) -> usize {
        self.files.iter().filter(|f| f.defaced.is_some()).count()
    }

    pub fn skipped(&self) -> impl Iterator<Item = &FileOutcome> {
        self.files
            .iter()
            .filter(|f| f.stage == FileStage::SkippedNoSecondary)
    }
}
